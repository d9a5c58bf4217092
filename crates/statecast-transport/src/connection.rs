//! A single WebSocket connection.
//!
//! Each connection runs two pumps against one socket:
//!
//! - the **send pump** drains an unbounded FIFO queue onto the socket;
//! - the **receive pump** reads whole messages and hands them to the
//!   [`ConnectionHandler`] inline.
//!
//! A supervisor task joins both pumps before the socket is released, reports
//! the end of the connection to the handler, and marks it `Closed`.
//!
//! ## Close handshake
//!
//! Both sides end up writing exactly one close frame. The side that
//! initiates keeps reading until the peer's close frame acknowledges it. The
//! side that receives a close frame first answers with its own close frame
//! and does not wait for anything further. A handshake that does not finish
//! within the close timeout is cut short by dropping the socket.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use statecast_protocol::{codec::MAX_MESSAGE_SIZE, Message};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::metrics;
use crate::traits::{ConnectionHandler, ConnectionId, ConnectionState, TransportError};
use crate::wire::{WireFrame, WireMessage};

/// Default time allowed for a close handshake.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request header carrying the caller's identity.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-user-id";

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum size of one message in bytes. Applied to the socket by
    /// the server and the client, which reject anything larger.
    pub max_message_size: usize,
    /// Time allowed for the close handshake before the socket is dropped.
    pub close_timeout: Duration,
    /// Request header read once at connect time as the connection identity.
    pub identity_header: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
        }
    }
}

/// Facts about a connection fixed at connect time.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    /// Caller-supplied identity from the identity header.
    pub identity: Option<String>,
    /// Remote socket address, when known.
    pub remote_addr: Option<SocketAddr>,
}

type PumpResult = Result<(), TransportError>;

struct Shared {
    id: ConnectionId,
    meta: ConnectionMeta,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    initiated_locally: AtomicBool,
}

impl Shared {
    /// Move the state forward. Returns `false` if it was already at or past `next`.
    fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Stop both pumps after a transport failure.
    fn begin_teardown(&self) {
        self.cancel.cancel();
        self.advance(ConnectionState::Closing);
    }
}

/// Handle to a running connection.
///
/// Cloning is cheap; all clones refer to the same socket.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Open a connection over an upgraded socket and start its pumps.
    ///
    /// The handler's `on_attach` runs before either pump starts, so anything
    /// it enqueues is the first thing written to the socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S, M, E>(
        socket: S,
        meta: ConnectionMeta,
        config: &ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Connection
    where
        S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
        M: WireMessage,
        E: fmt::Display + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let connection = Connection {
            shared: Arc::new(Shared {
                id: ConnectionId::next(),
                meta,
                state,
                outbound,
                cancel: CancellationToken::new(),
                initiated_locally: AtomicBool::new(false),
            }),
        };

        connection.shared.advance(ConnectionState::Open);
        metrics::record_connection();
        debug!(
            connection = %connection.id(),
            identity = ?connection.identity(),
            remote = ?connection.remote_addr(),
            "Connection open"
        );

        handler.on_attach(&connection);

        let (sink, stream) = socket.split();
        let mut pumps = JoinSet::new();
        pumps.spawn(send_pump(sink, outbound_rx, connection.clone()));
        pumps.spawn(receive_pump(stream, connection.clone(), Arc::clone(&handler)));

        tokio::spawn(supervise(
            connection.clone(),
            pumps,
            handler,
            config.close_timeout,
        ));

        connection
    }

    /// The connection's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// The identity supplied at connect time, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.shared.meta.identity.as_deref()
    }

    /// The remote address, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.meta.remote_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether messages can still be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() <= ConnectionState::Open
    }

    /// Enqueue a message. Never waits for the socket.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is
    /// closing or closed.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        self.shared
            .outbound
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Begin a locally initiated close. Idempotent.
    ///
    /// Messages still queued are discarded.
    pub fn close(&self) {
        let initiated = self.shared.state.send_if_modified(|state| {
            if *state < ConnectionState::Closing {
                self.shared.initiated_locally.store(true, Ordering::SeqCst);
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });

        if initiated {
            debug!(connection = %self.id(), "Closing connection");
        }
    }

    /// Wait until the connection is `Closed`.
    ///
    /// The handler's `on_close` has run by the time this returns.
    pub async fn wait_closed(&self) {
        let mut state = self.shared.state.subscribe();
        reached(&mut state, ConnectionState::Closed).await;
    }

    /// Close the connection and wait until it is `Closed`.
    pub async fn shutdown(&self) {
        self.close();
        self.wait_closed().await;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("identity", &self.shared.meta.identity)
            .finish()
    }
}

async fn reached(state: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    let _ = state.wait_for(|current| *current >= target).await;
}

async fn send_pump<K, M>(
    mut sink: K,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    connection: Connection,
) -> PumpResult
where
    K: Sink<M> + Unpin + Send,
    K::Error: fmt::Display,
    M: WireMessage,
{
    let shared = &connection.shared;
    let mut state = shared.state.subscribe();

    loop {
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => return Ok(()),

            () = reached(&mut state, ConnectionState::Closing) => {
                // Locally initiated: the receive pump waits for the peer's reply.
                // Peer initiated: this is our reply and nothing more is awaited.
                if let Err(e) = sink.close().await {
                    debug!(connection = %connection.id(), error = %e, "Close frame not sent");
                }
                return Ok(());
            }

            message = outbound.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };

                let len = message.len();
                if let Err(e) = sink.send(M::from_message(message)).await {
                    shared.begin_teardown();
                    return Err(TransportError::SendFailed(e.to_string()));
                }
                metrics::record_message(len, "outbound");
            }
        }
    }
}

async fn receive_pump<R, M, E>(
    mut stream: R,
    connection: Connection,
    handler: Arc<dyn ConnectionHandler>,
) -> PumpResult
where
    R: Stream<Item = Result<M, E>> + Unpin + Send,
    M: WireMessage,
    E: fmt::Display,
{
    let shared = &connection.shared;

    loop {
        let next = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Ok(()),
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(message)) => message.into_frame(),
            Some(Err(e)) => {
                shared.begin_teardown();
                return Err(TransportError::ReceiveFailed(e.to_string()));
            }
            None => {
                debug!(connection = %connection.id(), "Socket stream ended");
                shared.begin_teardown();
                return Ok(());
            }
        };

        let message = match frame {
            WireFrame::Message(message) => message,
            WireFrame::Control => continue,
            WireFrame::Close => {
                if shared.advance(ConnectionState::Closing) {
                    debug!(connection = %connection.id(), "Peer initiated close");
                } else {
                    debug!(connection = %connection.id(), "Peer acknowledged close");
                }
                return Ok(());
            }
        };

        metrics::record_message(message.len(), "inbound");
        trace!(connection = %connection.id(), kind = %message.kind(), len = message.len(), "Message received");

        handler.on_message(&connection, message).await;
    }
}

async fn supervise(
    connection: Connection,
    mut pumps: JoinSet<PumpResult>,
    handler: Arc<dyn ConnectionHandler>,
    close_timeout: Duration,
) {
    let shared = &connection.shared;
    let mut state = shared.state.subscribe();

    tokio::select! {
        biased;

        () = reached(&mut state, ConnectionState::Closing) => {}

        Some(result) = pumps.join_next() => {
            log_pump_exit(&connection, result);
            if connection.state() < ConnectionState::Closing {
                shared.begin_teardown();
            }
        }
    }

    let drained = tokio::time::timeout(close_timeout, async {
        while let Some(result) = pumps.join_next().await {
            log_pump_exit(&connection, result);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            connection = %connection.id(),
            timeout_ms = close_timeout.as_millis() as u64,
            "Close handshake timed out, dropping socket"
        );
        metrics::record_error("close_timeout");
        shared.cancel.cancel();
        pumps.abort_all();
        while pumps.join_next().await.is_some() {}
    }

    shared.cancel.cancel();
    metrics::record_disconnection();

    let initiated_locally = shared.initiated_locally.load(Ordering::SeqCst);
    debug!(connection = %connection.id(), initiated_locally, "Connection closed");

    // Observers of `Closed` see the handler's bookkeeping already done.
    handler.on_close(&connection, initiated_locally);
    shared.advance(ConnectionState::Closed);
}

fn log_pump_exit(connection: &Connection, result: Result<PumpResult, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(connection = %connection.id(), error = %e, "Connection failed");
            metrics::record_error("transport");
        }
        Err(e) if e.is_panic() => {
            error!(connection = %connection.id(), "Connection pump panicked");
            metrics::record_error("panic");
        }
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NoopHandler;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;
    use tokio::sync::Semaphore;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
    use tokio_tungstenite::tungstenite::protocol::frame::Frame;
    use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
    use tokio_tungstenite::tungstenite::Message as Ws;
    use tokio_tungstenite::WebSocketStream;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
        closed: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl ConnectionHandler for Recorder {
        async fn on_message(&self, _connection: &Connection, message: Message) {
            self.messages.lock().push(message);
        }

        fn on_close(&self, _connection: &Connection, initiated_locally: bool) {
            *self.closed.lock() = Some(initiated_locally);
        }
    }

    /// Two connections wired back to back over an in-memory pipe.
    async fn pair(
        config: &ConnectionConfig,
        left: Arc<dyn ConnectionHandler>,
        right: Arc<dyn ConnectionHandler>,
    ) -> (Connection, Connection) {
        let (a, b) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;

        let server = Connection::start(server, ConnectionMeta::default(), config, left);
        let client = Connection::start(client, ConnectionMeta::default(), config, right);
        (server, client)
    }

    /// Handler whose every message blocks until a permit is released.
    struct Stalled {
        entered: AtomicUsize,
        release: Semaphore,
    }

    #[async_trait]
    impl ConnectionHandler for Stalled {
        async fn on_message(&self, _connection: &Connection, _message: Message) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn raw_frame(data: &[u8], opcode: Data, is_final: bool) -> Ws {
        Ws::Frame(Frame::message(data.to_vec(), OpCode::Data(opcode), is_final))
    }

    async fn wait_for_messages(recorder: &Recorder, count: usize) {
        tokio::time::timeout(WAIT, async {
            while recorder.messages.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages did not arrive in time");
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let recorder = Arc::new(Recorder::default());
        let (server, _client) = pair(
            &ConnectionConfig::default(),
            Arc::new(NoopHandler),
            recorder.clone(),
        )
        .await;

        for i in 0..100 {
            server.send(Message::text(format!("m{i}"))).unwrap();
        }

        wait_for_messages(&recorder, 100).await;
        let received: Vec<String> = recorder
            .messages
            .lock()
            .iter()
            .map(|m| m.as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..100).map(|i| format!("m{i}")).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_binary_kind_is_preserved() {
        let recorder = Arc::new(Recorder::default());
        let (_server, client) = pair(
            &ConnectionConfig::default(),
            recorder.clone(),
            Arc::new(NoopHandler),
        )
        .await;

        client.send(Message::binary(vec![1, 2, 3])).unwrap();
        wait_for_messages(&recorder, 1).await;
        assert_eq!(recorder.messages.lock()[0], Message::binary(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_local_close_converges_both_sides() {
        let left = Arc::new(Recorder::default());
        let right = Arc::new(Recorder::default());
        let (server, client) =
            pair(&ConnectionConfig::default(), left.clone(), right.clone()).await;

        server.close();
        assert_eq!(server.state(), ConnectionState::Closing);
        assert!(matches!(
            server.send(Message::text("late")),
            Err(TransportError::ConnectionClosed)
        ));

        tokio::time::timeout(WAIT, async {
            server.wait_closed().await;
            client.wait_closed().await;
        })
        .await
        .expect("close handshake did not converge");

        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(*left.closed.lock(), Some(true));
        assert_eq!(*right.closed.lock(), Some(false));
    }

    #[tokio::test]
    async fn test_simultaneous_close_does_not_deadlock() {
        let (server, client) = pair(
            &ConnectionConfig::default(),
            Arc::new(NoopHandler),
            Arc::new(NoopHandler),
        )
        .await;

        server.close();
        client.close();

        tokio::time::timeout(WAIT, async {
            server.wait_closed().await;
            client.wait_closed().await;
        })
        .await
        .expect("simultaneous close did not converge");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, client) = pair(
            &ConnectionConfig::default(),
            Arc::new(NoopHandler),
            Arc::new(NoopHandler),
        )
        .await;

        server.close();
        server.close();
        tokio::time::timeout(WAIT, server.shutdown())
            .await
            .expect("shutdown did not finish");
        tokio::time::timeout(WAIT, client.wait_closed())
            .await
            .expect("peer did not close");
    }

    #[tokio::test]
    async fn test_unresponsive_peer_is_cut_off_after_timeout() {
        let config = ConnectionConfig {
            close_timeout: Duration::from_millis(100),
            ..Default::default()
        };

        // The peer end is a raw stream that never answers the close frame.
        let (a, _silent_peer) = duplex(64 * 1024);
        let socket = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let connection =
            Connection::start(socket, ConnectionMeta::default(), &config, Arc::new(NoopHandler));

        connection.close();
        tokio::time::timeout(WAIT, connection.wait_closed())
            .await
            .expect("close timeout did not force the connection closed");
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_drop_tears_down_connection() {
        let recorder = Arc::new(Recorder::default());
        let (a, b) = duplex(64 * 1024);
        let socket = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let connection = Connection::start(
            socket,
            ConnectionMeta::default(),
            &ConnectionConfig::default(),
            recorder.clone(),
        );

        drop(b);

        tokio::time::timeout(WAIT, connection.wait_closed())
            .await
            .expect("connection did not notice the dropped peer");
        assert_eq!(*recorder.closed.lock(), Some(false));
    }

    #[tokio::test]
    async fn test_identity_is_exposed() {
        let (a, _b) = duplex(1024);
        let socket = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let meta = ConnectionMeta {
            identity: Some("42".to_string()),
            remote_addr: None,
        };
        let connection = Connection::start(
            socket,
            meta,
            &ConnectionConfig::default(),
            Arc::new(NoopHandler),
        );

        assert_eq!(connection.identity(), Some("42"));
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn test_fragmented_message_arrives_whole() {
        let recorder = Arc::new(Recorder::default());
        let (a, b) = duplex(64 * 1024);
        let socket = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let _connection = Connection::start(
            socket,
            ConnectionMeta::default(),
            &ConnectionConfig::default(),
            recorder.clone(),
        );

        let mut peer = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        peer.send(raw_frame(b"hello ", Data::Text, false)).await.unwrap();
        peer.send(raw_frame(b"world", Data::Continue, true)).await.unwrap();

        wait_for_messages(&recorder, 1).await;
        assert_eq!(*recorder.messages.lock(), vec![Message::text("hello world")]);
    }

    #[tokio::test]
    async fn test_oversized_fragmented_message_closes_connection() {
        let recorder = Arc::new(Recorder::default());
        let (a, b) = duplex(64 * 1024);
        let ws_config = WebSocketConfig {
            max_message_size: Some(8),
            ..Default::default()
        };
        let socket = WebSocketStream::from_raw_socket(a, Role::Server, Some(ws_config)).await;
        let connection = Connection::start(
            socket,
            ConnectionMeta::default(),
            &ConnectionConfig::default(),
            recorder.clone(),
        );

        let mut peer = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        peer.send(raw_frame(b"12345", Data::Binary, false)).await.unwrap();
        peer.send(raw_frame(b"67890", Data::Continue, true)).await.unwrap();

        tokio::time::timeout(WAIT, connection.wait_closed())
            .await
            .expect("oversized message did not close the connection");
        assert!(recorder.messages.lock().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_queued_messages_are_discarded_on_close() {
        let recorder = Arc::new(Recorder::default());
        let (server, client) = pair(
            &ConnectionConfig::default(),
            Arc::new(NoopHandler),
            recorder.clone(),
        )
        .await;

        // The send pump cannot run before `close`, so the whole batch is
        // still queued when the connection starts closing.
        for i in 0..50 {
            server.send(Message::text(format!("m{i}"))).unwrap();
        }
        server.close();

        tokio::time::timeout(WAIT, async {
            server.wait_closed().await;
            client.wait_closed().await;
        })
        .await
        .expect("close handshake did not converge");

        assert!(recorder.messages.lock().is_empty());
        assert_eq!(*recorder.closed.lock(), Some(false));
    }

    #[tokio::test]
    async fn test_slow_handler_stalls_only_its_connection() {
        let config = ConnectionConfig::default();
        let stalled = Arc::new(Stalled {
            entered: AtomicUsize::new(0),
            release: Semaphore::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let (slow, _slow_peer) = pair(&config, Arc::new(NoopHandler), stalled.clone()).await;
        let (fast, _fast_peer) = pair(&config, Arc::new(NoopHandler), recorder.clone()).await;

        slow.send(Message::text("first")).unwrap();
        slow.send(Message::text("second")).unwrap();
        eventually(|| stalled.entered.load(Ordering::SeqCst) == 1).await;

        for i in 0..3 {
            fast.send(Message::text(format!("f{i}"))).unwrap();
        }
        wait_for_messages(&recorder, 3).await;
        assert_eq!(stalled.entered.load(Ordering::SeqCst), 1);

        stalled.release.add_permits(1);
        eventually(|| stalled.entered.load(Ordering::SeqCst) == 2).await;
    }
}
