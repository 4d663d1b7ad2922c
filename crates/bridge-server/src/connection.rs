//! Duplex connection abstraction.
//!
//! The session only needs three operations from its transport, so the axum
//! WebSocket sits behind [`Connection`] and tests drive sessions over
//! in-memory channels instead.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};

/// One inbound data frame. Control frames never surface here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("connection closed")]
    Closed,
    #[error("connection already closed")]
    AlreadyClosed,
}

#[async_trait]
pub trait Connection: Send {
    /// Next data frame. `None` once the peer has closed.
    async fn recv_frame(&mut self) -> Option<Result<Frame, ConnectionError>>;

    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Close the connection. A second close, or a close after the peer has
    /// already closed, yields [`ConnectionError::AlreadyClosed`].
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// [`Connection`] over an upgraded axum WebSocket.
pub struct WsConnection {
    socket: WebSocket,
    closed: bool,
    peer_closed: bool,
}

impl WsConnection {
    /// Wrap an upgraded axum socket.
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            closed: false,
            peer_closed: false,
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn recv_frame(&mut self) -> Option<Result<Frame, ConnectionError>> {
        if self.closed || self.peer_closed {
            return None;
        }
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(data))) => return Some(Ok(Frame::Binary(data.to_vec()))),
                // Pongs are queued by the socket itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    self.peer_closed = true;
                    return None;
                }
                Some(Err(e)) => return Some(Err(ConnectionError::Transport(e))),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        if self.closed || self.peer_closed {
            return Err(ConnectionError::Closed);
        }
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.closed || self.peer_closed {
            self.closed = true;
            return Err(ConnectionError::AlreadyClosed);
        }
        self.closed = true;
        self.socket.send(Message::Close(None)).await?;
        Ok(())
    }
}
