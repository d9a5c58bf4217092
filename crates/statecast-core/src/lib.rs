//! # statecast-core
//!
//! State publishing and RPC on top of the statecast transport.
//!
//! - **Bindable** - an observable value owned by the application
//! - **Broadcasters** - publish one stream each, under a stable key
//! - **Multiplexer** - the registry of broadcasters; replays current state
//!   to every newly attached observer
//! - **Hub** - named-method dispatch with typed positional arguments, served
//!   by [`HubServer`] or used through a [`HubClient`]
//!
//! ## Data flow
//!
//! ```text
//! Bindable::set ──▶ BoundBroadcaster ──▶ Multiplexer ──▶ every connection
//!                                             ▲
//!                      new connection ────────┘ (replay current values)
//! ```

pub mod broadcaster;
pub mod endpoint;
pub mod hub;
pub mod keys;
pub mod multiplexer;
pub mod observable;

pub use broadcaster::{
    BoundBroadcaster, Broadcaster, ManualBroadcaster, ThrottledBroadcaster,
    DEFAULT_THROTTLE_INTERVAL,
};
pub use endpoint::{HubClient, HubServer, ServerInvoker};
pub use hub::{CallContext, DispatchOutcome, HandlerError, Hub, HubError};
pub use multiplexer::{Multiplexer, MultiplexerError};
pub use observable::{Bindable, Subscription};
