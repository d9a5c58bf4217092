//! Adapters between WebSocket library message types and statecast messages.
//!
//! The server side runs on axum's WebSocket and the client side on
//! tokio-tungstenite. Both are a `Stream` + `Sink` of their own message
//! type; [`WireMessage`] lets one connection implementation drive either.
//!
//! Both libraries reassemble continuation frames and enforce the message
//! size limit before a message is yielded, so only whole messages arrive
//! here.

use statecast_protocol::Message;

/// What the receive pump sees for one incoming wire message.
#[derive(Debug)]
pub enum WireFrame {
    /// A whole data message.
    Message(Message),
    /// Close control frame.
    Close,
    /// Ping, pong, or a raw frame. Ignored.
    Control,
}

/// A WebSocket library message type.
pub trait WireMessage: Sized + Send + Unpin + 'static {
    /// Classify an incoming message.
    fn into_frame(self) -> WireFrame;

    /// Build an outgoing data message.
    fn from_message(message: Message) -> Self;
}

impl WireMessage for axum::extract::ws::Message {
    fn into_frame(self) -> WireFrame {
        use axum::extract::ws::Message as Ws;

        match self {
            Ws::Text(text) => WireFrame::Message(Message::text(text)),
            Ws::Binary(data) => WireFrame::Message(Message::binary(data)),
            Ws::Close(_) => WireFrame::Close,
            Ws::Ping(_) | Ws::Pong(_) => WireFrame::Control,
        }
    }

    fn from_message(message: Message) -> Self {
        use axum::extract::ws::Message as Ws;

        match message.as_str() {
            Some(text) => Ws::Text(text.to_owned()),
            None => Ws::Binary(message.payload().to_vec()),
        }
    }
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn into_frame(self) -> WireFrame {
        use tokio_tungstenite::tungstenite::Message as Ws;

        match self {
            Ws::Text(text) => WireFrame::Message(Message::text(text)),
            Ws::Binary(data) => WireFrame::Message(Message::binary(data)),
            Ws::Close(_) => WireFrame::Close,
            // Only produced for writing; reads always yield whole messages.
            Ws::Ping(_) | Ws::Pong(_) | Ws::Frame(_) => WireFrame::Control,
        }
    }

    fn from_message(message: Message) -> Self {
        use tokio_tungstenite::tungstenite::Message as Ws;

        match message.as_str() {
            Some(text) => Ws::Text(text.to_owned()),
            None => Ws::Binary(message.payload().to_vec()),
        }
    }
}
