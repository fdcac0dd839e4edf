//! The client connection as seen by a session
//!
//! Sessions work on any `Sink`/`Stream` pair of [`WireMessage`]s; [`split`]
//! adapts an axum WebSocket to that shape.

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt, future};

use crate::error::TransportError;

/// One transport-level message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Self::Text(text),
            Message::Binary(data) => Self::Binary(data),
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
            Message::Close(_) => Self::Close,
        }
    }
}

impl From<WireMessage> for Message {
    fn from(message: WireMessage) -> Self {
        match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(data) => Message::Binary(data),
            WireMessage::Ping(data) => Message::Ping(data),
            WireMessage::Pong(data) => Message::Pong(data),
            WireMessage::Close => Message::Close(None),
        }
    }
}

/// Split an upgraded socket into the write and read halves a session runs on
pub fn split(
    socket: WebSocket,
) -> (
    impl Sink<WireMessage, Error = TransportError> + Send + Unpin + 'static,
    impl Stream<Item = Result<WireMessage, TransportError>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::Socket(e.to_string()))
        .with(|message: WireMessage| future::ready(Ok::<_, TransportError>(Message::from(message))));

    let stream = stream.map(|message| {
        message
            .map(WireMessage::from)
            .map_err(|e| TransportError::Socket(e.to_string()))
    });

    (sink, stream)
}
