//! Named-method RPC hub.
//!
//! A [`Hub`] maps method names to typed async handlers. Incoming messages
//! are decoded into an [`Invocation`] and dispatched by name with their
//! positional arguments decoded into the handler's argument tuple.
//!
//! There is no acknowledgement channel. A message for an unknown method, a
//! malformed envelope, or arguments of the wrong shape are dropped and only
//! logged. A failing or panicking handler affects that one message; the
//! connection keeps running.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use statecast_protocol::{codec, decode_args, Encoding, Invocation, Message, ProtocolError};
use statecast_transport::{metrics, Connection, TransportError};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// A handler is already registered for this method.
    #[error("Handler already registered for method: {0}")]
    DuplicateHandler(String),

    /// Encoding or decoding failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection is unavailable.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Error returned by a method handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler-defined failure.
    #[error("{0}")]
    Failed(String),

    /// A hub call made by the handler failed.
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl HandlerError {
    /// Create a handler failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The connection a call arrived on.
#[derive(Debug, Clone)]
pub struct CallContext {
    connection: Connection,
}

impl CallContext {
    /// Wrap a connection.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// The calling connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Identity supplied by the caller at connect time.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.connection.identity()
    }
}

/// What happened to one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion.
    Handled,
    /// No handler is registered for the method, or the method name is empty.
    UnknownMethod,
    /// The envelope or its arguments could not be decoded.
    Malformed,
    /// The handler returned an error or panicked.
    Failed,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type ErasedHandler =
    Arc<dyn Fn(CallContext, Vec<Value>) -> Result<HandlerFuture, ProtocolError> + Send + Sync>;

/// Method registry and dispatcher.
pub struct Hub {
    handlers: DashMap<String, ErasedHandler>,
    encoding: Encoding,
}

impl Hub {
    /// Create a hub that encodes outgoing calls as JSON.
    #[must_use]
    pub fn new() -> Self {
        Self::with_encoding(Encoding::Json)
    }

    /// Create a hub with an explicit outgoing encoding.
    ///
    /// Incoming messages are decoded by their kind regardless.
    #[must_use]
    pub fn with_encoding(encoding: Encoding) -> Self {
        Self {
            handlers: DashMap::new(),
            encoding,
        }
    }

    /// Outgoing encoding.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Register `handler` for `method`.
    ///
    /// `A` is the positional argument tuple, e.g. `(i32, SpectatorState)`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::DuplicateHandler`] if `method` already has a
    /// handler. The first registration stays active.
    pub fn on<A, F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<(), HubError>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let method = method.into();
        let erased: ErasedHandler = Arc::new(move |ctx, args| {
            let args: A = decode_args(args)?;
            Ok(Box::pin(handler(ctx, args)) as HandlerFuture)
        });

        match self.handlers.entry(method) {
            Entry::Occupied(entry) => {
                warn!(method = %entry.key(), "Handler already registered, keeping the first");
                Err(HubError::DuplicateHandler(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                debug!(method = %entry.key(), "Handler registered");
                entry.insert(erased);
                Ok(())
            }
        }
    }

    /// Whether `method` has a handler.
    #[must_use]
    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Encode a call to `method` with positional `args`.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` is not a sequence or cannot be encoded.
    pub fn encode<A: Serialize>(&self, method: &str, args: A) -> Result<Message, HubError> {
        encode_invocation(method, args, self.encoding)
    }

    /// Decode `message` and run the matching handler.
    pub async fn dispatch(&self, ctx: CallContext, message: &Message) -> DispatchOutcome {
        let connection = ctx.connection().id();

        let invocation: Invocation = match codec::decode(message) {
            Ok(invocation) => invocation,
            Err(e) => {
                debug!(connection = %connection, error = %e, "Dropped malformed message");
                return DispatchOutcome::Malformed;
            }
        };

        if invocation.method.is_empty() {
            debug!(connection = %connection, "Dropped call without a method name");
            return DispatchOutcome::UnknownMethod;
        }

        // Clone the handler out so no map guard is held across the await.
        let handler = match self.handlers.get(&invocation.method) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                debug!(connection = %connection, method = %invocation.method, "Dropped call to unknown method");
                return DispatchOutcome::UnknownMethod;
            }
        };

        let method = invocation.method;
        let args = invocation.args;
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, args))) {
            Ok(Ok(future)) => future,
            Ok(Err(e)) => {
                debug!(connection = %connection, method = %method, error = %e, "Dropped call with mismatched arguments");
                return DispatchOutcome::Malformed;
            }
            Err(_) => {
                error!(connection = %connection, method = %method, "Handler panicked");
                metrics::record_error("handler_panic");
                return DispatchOutcome::Failed;
            }
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => {
                trace!(connection = %connection, method = %method, "Call handled");
                DispatchOutcome::Handled
            }
            Ok(Err(e)) => {
                warn!(connection = %connection, method = %method, error = %e, "Handler failed");
                metrics::record_error("handler");
                DispatchOutcome::Failed
            }
            Err(_) => {
                error!(connection = %connection, method = %method, "Handler panicked");
                metrics::record_error("handler_panic");
                DispatchOutcome::Failed
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn encode_invocation<A: Serialize>(
    method: &str,
    args: A,
    encoding: Encoding,
) -> Result<Message, HubError> {
    let invocation = Invocation::new(method, args)?;
    Ok(codec::encode(&invocation, encoding)?)
}
