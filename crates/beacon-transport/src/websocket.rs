//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum [`WebSocket`]. Frames may span several socket
//! messages and one message may carry several frames; the read buffer
//! holds whatever has not been decoded yet.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use beacon_protocol::{Frame, FrameCodec, ProtocolError};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, TransportError};

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
    read_buffer: BytesMut,
    codec: FrameCodec,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            is_open: true,
            read_buffer: BytesMut::with_capacity(4096),
            codec: FrameCodec::with_max_frame_size(max_message_size),
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Append socket data and decode the first complete frame. The codec
    /// limit applies to each frame, so one message may batch several.
    fn buffer(&mut self, data: &[u8]) -> Result<Option<Frame>, TransportError> {
        self.read_buffer.extend_from_slice(data);
        match self.codec.decode_from(&mut self.read_buffer) {
            Err(ProtocolError::FrameTooLarge(size, max)) => {
                warn!(connection = %self.id, size, max, "Frame too large");
                Err(ProtocolError::FrameTooLarge(size, max).into())
            }
            decoded => Ok(decoded?),
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn transport(&self) -> &'static str {
        "websocket"
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        // First, try to decode from the existing buffer
        if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(frame) = self.buffer(text.as_bytes())? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(frame) = self.buffer(&data)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.socket.send(Message::Pong(data)).await {
                        warn!(connection = %self.id, error = %e, "Failed to send pong");
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    debug!(connection = %self.id, error = %e, "WebSocket error");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let data = self.codec.encode(&frame)?;
        self.send_raw(data).await
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        // Text frames for browsers; binary only when a body is not UTF-8.
        let message = match String::from_utf8(data.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {e}")))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
