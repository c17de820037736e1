//! HTTP polling fallback transport.
//!
//! Clients that cannot hold a WebSocket open a polling session, push
//! frames with one request and collect outbound frames with a long poll.
//! A session nobody has polled or pushed to within the idle timeout is
//! treated as a closed transport.

use async_trait::async_trait;
use beacon_protocol::{Frame, FrameCodec};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::traits::{Connection, ConnectionId, TransportError};

/// Polling transport configuration.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// How long a poll waits for outbound frames before returning empty.
    pub poll_timeout: Duration,
    /// Close the session after this long without a push or poll.
    pub idle_timeout: Duration,
    /// Queued chunks per direction.
    pub queue_capacity: usize,
    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(30),
            queue_capacity: 256,
            max_frame_size: 64 * 1024,
        }
    }
}

struct PollingHandle {
    inbound: mpsc::Sender<Bytes>,
    outbound: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    activity: Arc<watch::Sender<Instant>>,
}

/// Open polling sessions, indexed by connection id.
pub struct PollingRegistry {
    sessions: Arc<DashMap<ConnectionId, PollingHandle>>,
    config: PollingConfig,
}

impl PollingRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: PollingConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Registry configuration.
    #[must_use]
    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Open a session. The server drives the returned connection; the
    /// client addresses the session by its id.
    #[must_use]
    pub fn open(&self) -> PollingConnection {
        let capacity = self.config.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (activity_tx, activity_rx) = watch::channel(Instant::now());

        let id = ConnectionId::generate();
        self.sessions.insert(
            id.clone(),
            PollingHandle {
                inbound: inbound_tx,
                outbound: Arc::new(Mutex::new(outbound_rx)),
                activity: Arc::new(activity_tx),
            },
        );
        debug!(connection = %id, "Polling session opened");

        PollingConnection {
            id,
            inbound: inbound_rx,
            outbound: Some(outbound_tx),
            activity: activity_rx,
            sessions: self.sessions.clone(),
            read_buffer: BytesMut::with_capacity(1024),
            codec: FrameCodec::with_max_frame_size(self.config.max_frame_size),
            idle_timeout: self.config.idle_timeout,
        }
    }

    /// Deliver client data to a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or already closed.
    pub async fn push(&self, id: &ConnectionId, data: Bytes) -> Result<(), TransportError> {
        let inbound = {
            let handle = self
                .sessions
                .get(id)
                .ok_or_else(|| TransportError::UnknownConnection(id.to_string()))?;
            handle.activity.send_replace(Instant::now());
            handle.inbound.clone()
        };

        trace!(connection = %id, bytes = data.len(), "Polling push");
        inbound
            .send(data)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait up to the poll timeout for outbound frames and return every
    /// queued chunk. An empty result means the wait timed out.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown, or was closed by the
    /// server and every queued frame has been collected.
    pub async fn poll(&self, id: &ConnectionId) -> Result<Vec<Bytes>, TransportError> {
        let (outbound, activity) = {
            let handle = self
                .sessions
                .get(id)
                .ok_or_else(|| TransportError::UnknownConnection(id.to_string()))?;
            handle.activity.send_replace(Instant::now());
            (handle.outbound.clone(), handle.activity.clone())
        };

        let mut outbound = outbound.lock().await;
        let first = match tokio::time::timeout(self.config.poll_timeout, outbound.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                self.sessions.remove(id);
                return Err(TransportError::ConnectionClosed);
            }
            Err(_) => {
                activity.send_replace(Instant::now());
                return Ok(Vec::new());
            }
        };

        let mut chunks = vec![first];
        while let Ok(chunk) = outbound.try_recv() {
            chunks.push(chunk);
        }
        activity.send_replace(Instant::now());
        Ok(chunks)
    }

    /// Whether a session is open.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for PollingRegistry {
    fn default() -> Self {
        Self::new(PollingConfig::default())
    }
}

/// Server side of a polling session.
pub struct PollingConnection {
    id: ConnectionId,
    inbound: mpsc::Receiver<Bytes>,
    outbound: Option<mpsc::Sender<Bytes>>,
    activity: watch::Receiver<Instant>,
    sessions: Arc<DashMap<ConnectionId, PollingHandle>>,
    read_buffer: BytesMut,
    codec: FrameCodec,
    idle_timeout: Duration,
}

impl PollingConnection {
    fn idle_deadline(&self) -> Instant {
        *self.activity.borrow() + self.idle_timeout
    }
}

#[async_trait]
impl Connection for PollingConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn transport(&self) -> &'static str {
        "polling"
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }
            if self.outbound.is_none() {
                return Ok(None);
            }

            let deadline = self.idle_deadline();
            tokio::select! {
                data = self.inbound.recv() => match data {
                    // The codec bounds each frame, not the whole chunk.
                    Some(data) => self.read_buffer.extend_from_slice(&data),
                    None => return Ok(None),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if self.idle_deadline() <= Instant::now() {
                        debug!(connection = %self.id, "Polling session idle");
                        self.outbound = None;
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let data = self.codec.encode(&frame)?;
        self.send_raw(data).await
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        // A client that stops polling must not stall the server.
        outbound.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::SendFailed("poll queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.outbound.take().is_some() {
            debug!(connection = %self.id, "Polling session closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.outbound.is_some()
    }
}

impl Drop for PollingConnection {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::{codec, Command, ProtocolError};

    fn registry() -> PollingRegistry {
        PollingRegistry::new(PollingConfig {
            poll_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
            ..PollingConfig::default()
        })
    }

    #[tokio::test]
    async fn test_push_and_recv() {
        let registry = registry();
        let mut conn = registry.open();
        assert!(registry.contains(conn.id()));

        let raw = Bytes::from_static(b"CONNECT\naccept-version:1.2\n\n\0SEND\ndestination:/topic/a\n\nhi\0");
        registry.push(conn.id(), raw).await.unwrap();

        let connect = conn.recv().await.unwrap().unwrap();
        assert_eq!(connect.command, Some(Command::Connect));
        let send = conn.recv().await.unwrap().unwrap();
        assert_eq!(send.body_str(), Some("hi"));
    }

    #[tokio::test]
    async fn test_frame_limit_applies_per_frame() {
        let registry = PollingRegistry::new(PollingConfig {
            max_frame_size: 64,
            ..PollingConfig::default()
        });
        let mut conn = registry.open();

        let frame = Frame::send("/topic/a", vec![b'x'; 20]);
        let mut batch = BytesMut::new();
        for _ in 0..3 {
            codec::encode_into(&frame, &mut batch).unwrap();
        }
        assert!(batch.len() > 64);
        registry.push(conn.id(), batch.freeze()).await.unwrap();
        for _ in 0..3 {
            let received = conn.recv().await.unwrap().unwrap();
            assert_eq!(received.body.len(), 20);
        }

        let oversized = codec::encode(&Frame::send("/topic/a", vec![b'x'; 100])).unwrap();
        registry.push(conn.id(), oversized).await.unwrap();
        assert!(matches!(
            conn.recv().await,
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge(_, 64)))
        ));
    }

    #[tokio::test]
    async fn test_send_and_poll() {
        let registry = registry();
        let mut conn = registry.open();

        conn.send(Frame::receipt("r-1")).await.unwrap();
        conn.send(Frame::receipt("r-2")).await.unwrap();

        let chunks = registry.poll(conn.id()).await.unwrap();
        assert_eq!(chunks.len(), 2);
        let frame = codec::decode(&chunks[0]).unwrap();
        assert_eq!(frame.command, Some(Command::Receipt));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_empty() {
        let registry = registry();
        let conn = registry.open();

        let chunks = registry.poll(conn.id()).await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_closes() {
        let registry = registry();
        let mut conn = registry.open();

        assert!(conn.recv().await.unwrap().is_none());
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(Frame::heartbeat()).await,
            Err(TransportError::ConnectionClosed)
        ));

        drop(conn);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_idle_close() {
        let registry = Arc::new(registry());
        let mut conn = registry.open();
        let id = conn.id().clone();

        let pusher = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(8)).await;
                registry.push(&id, Bytes::from_static(b"\n")).await.unwrap();
            })
        };

        let start = Instant::now();
        let frame = conn.recv().await.unwrap().unwrap();
        assert!(frame.is_heartbeat());
        pusher.await.unwrap();

        assert!(conn.recv().await.unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_secs(18));
    }

    #[tokio::test]
    async fn test_closed_session_drains_then_errors() {
        let registry = registry();
        let mut conn = registry.open();
        let id = conn.id().clone();

        conn.send(Frame::error("bye")).await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(registry.poll(&id).await.unwrap().len(), 1);
        assert!(matches!(
            registry.poll(&id).await,
            Err(TransportError::ConnectionClosed)
        ));
        drop(conn);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = registry();
        let id = ConnectionId::new("conn_missing");
        assert!(matches!(
            registry.poll(&id).await,
            Err(TransportError::UnknownConnection(_))
        ));
        assert!(matches!(
            registry.push(&id, Bytes::new()).await,
            Err(TransportError::UnknownConnection(_))
        ));
    }
}
