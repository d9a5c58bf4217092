//! End-to-end transport tests over loopback sockets.

use async_trait::async_trait;
use parking_lot::Mutex;
use statecast_protocol::Message;
use statecast_transport::{
    serve, Connection, ConnectionHandler, ConnectionState, NoopHandler, TransportClient,
    TransportServer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Recorder {
    attached: Mutex<Vec<Option<String>>>,
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl ConnectionHandler for Recorder {
    fn on_attach(&self, connection: &Connection) {
        self.attached
            .lock()
            .push(connection.identity().map(str::to_string));
    }

    async fn on_message(&self, _connection: &Connection, message: Message) {
        if let Some(text) = message.as_str() {
            self.messages.lock().push(text.to_string());
        }
    }
}

async fn start_server(handler: Arc<dyn ConnectionHandler>) -> (TransportServer, String) {
    let server = TransportServer::default();
    let app = server.router("/ws", handler);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, app));
    (server, format!("ws://{addr}/ws"))
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_broadcast_reaches_every_client_in_order() {
    let (server, url) = start_server(Arc::new(NoopHandler)).await;

    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let _c1 = TransportClient::new(&url).connect(first.clone()).await.unwrap();
    let _c2 = TransportClient::new(&url).connect(second.clone()).await.unwrap();
    eventually(|| server.connection_count() == 2).await;

    for i in 0..50 {
        assert_eq!(server.broadcast(Message::text(format!("b{i}"))), 2);
    }

    let expected: Vec<String> = (0..50).map(|i| format!("b{i}")).collect();
    eventually(|| first.messages.lock().len() == 50 && second.messages.lock().len() == 50).await;
    assert_eq!(*first.messages.lock(), expected);
    assert_eq!(*second.messages.lock(), expected);
}

#[tokio::test]
async fn test_identity_header_reaches_server() {
    let recorder = Arc::new(Recorder::default());
    let (server, url) = start_server(recorder.clone()).await;

    let _client = TransportClient::new(&url)
        .identity("1001")
        .connect(Arc::new(NoopHandler))
        .await
        .unwrap();
    eventually(|| server.connection_count() == 1).await;

    assert_eq!(*recorder.attached.lock(), vec![Some("1001".to_string())]);
    let connection = &server.connections()[0];
    assert_eq!(connection.identity(), Some("1001"));
    assert!(connection.remote_addr().is_some());
}

#[tokio::test]
async fn test_client_messages_reach_server_handler() {
    let recorder = Arc::new(Recorder::default());
    let (_server, url) = start_server(recorder.clone()).await;

    let client = TransportClient::new(&url)
        .connect(Arc::new(NoopHandler))
        .await
        .unwrap();
    client.send(Message::text("hello")).unwrap();
    client.send(Message::text("world")).unwrap();

    eventually(|| recorder.messages.lock().len() == 2).await;
    assert_eq!(*recorder.messages.lock(), vec!["hello", "world"]);
}

#[tokio::test]
async fn test_client_close_converges_and_unregisters() {
    let (server, url) = start_server(Arc::new(NoopHandler)).await;

    let client = TransportClient::new(&url)
        .connect(Arc::new(NoopHandler))
        .await
        .unwrap();
    eventually(|| server.connection_count() == 1).await;
    let server_side = server.connections()[0].clone();

    tokio::time::timeout(WAIT, client.shutdown()).await.unwrap();
    tokio::time::timeout(WAIT, server_side.wait_closed())
        .await
        .unwrap();

    assert_eq!(client.state(), ConnectionState::Closed);
    eventually(|| server.connection_count() == 0).await;
}

#[tokio::test]
async fn test_close_all_closes_clients() {
    let (server, url) = start_server(Arc::new(NoopHandler)).await;

    let c1 = TransportClient::new(&url)
        .connect(Arc::new(NoopHandler))
        .await
        .unwrap();
    let c2 = TransportClient::new(&url)
        .connect(Arc::new(NoopHandler))
        .await
        .unwrap();
    eventually(|| server.connection_count() == 2).await;

    tokio::time::timeout(WAIT, server.close_all()).await.unwrap();
    assert_eq!(server.connection_count(), 0);

    tokio::time::timeout(WAIT, async {
        c1.wait_closed().await;
        c2.wait_closed().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_plain_http_request_is_rejected() {
    let (_server, url) = start_server(Arc::new(NoopHandler)).await;
    let addr = url.trim_start_matches("ws://").trim_end_matches("/ws");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 4"), "got: {response}");
}
