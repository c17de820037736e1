//! HTTP handlers for the Beacon server.
//!
//! This module owns the shared state, the upgrade endpoints and the
//! background tasks that run next to the connections.

use crate::config::Config;
use crate::connection;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beacon_core::{
    ChannelAuthInterceptor, DeliveryEvent, HandshakeAuthenticator, HandshakeRejected,
    JwtValidator, Message, PresenceTracker, Principal, Router as BeaconRouter, RouterConfig,
    TokenValidator,
};
use beacon_transport::{
    Connection, ConnectionId, PollingConfig, PollingRegistry, TransportError, WebSocketConnection,
};
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// STOMP subprotocols offered during the WebSocket upgrade.
const STOMP_SUBPROTOCOLS: [&str; 3] = ["v12.stomp", "v11.stomp", "v10.stomp"];

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Upgrade authentication.
    pub handshake: HandshakeAuthenticator,
    /// Per-frame authentication and presence signalling.
    pub interceptor: ChannelAuthInterceptor,
    /// Online users and their sessions.
    pub presence: Arc<PresenceTracker>,
    /// The message router.
    pub router: Arc<BeaconRouter>,
    /// Open polling sessions.
    pub polling: PollingRegistry,
    connections: AtomicUsize,
}

impl AppState {
    /// Create app state with the configured JWT secret.
    ///
    /// # Errors
    ///
    /// Returns an error if no secret is configured.
    pub fn new(config: Config) -> Result<Self> {
        let secret = config.auth.resolve_secret().unwrap_or_default();
        let validator = JwtValidator::new(&secret).context(
            "JWT secret is not configured; set auth.jwt_secret or the JWT_SECRET environment variable",
        )?;
        Ok(Self::with_validator(config, Arc::new(validator)))
    }

    /// Create app state around an existing token validator.
    #[must_use]
    pub fn with_validator(config: Config, validator: Arc<dyn TokenValidator>) -> Self {
        let presence = Arc::new(PresenceTracker::new(config.presence.ttl()));

        let router_config = RouterConfig {
            max_channels: config.limits.max_channels,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            channel_capacity: config.limits.channel_capacity,
            session_queue_capacity: config.limits.session_queue_capacity,
            auto_delete_empty_channels: true,
        };

        let polling = PollingRegistry::new(PollingConfig {
            poll_timeout: Duration::from_millis(config.transport.poll_timeout_ms),
            idle_timeout: Duration::from_millis(config.transport.polling_idle_timeout_ms),
            queue_capacity: config.limits.session_queue_capacity,
            max_frame_size: config.limits.max_message_size,
        });

        Self {
            handshake: HandshakeAuthenticator::new(validator.clone()),
            interceptor: ChannelAuthInterceptor::new(validator, presence.clone()),
            router: Arc::new(BeaconRouter::with_config(presence.clone(), router_config)),
            presence,
            polling,
            connections: AtomicUsize::new(0),
            config,
        }
    }

    /// Reserve a connection slot, or `None` at the connection limit.
    pub fn try_acquire_slot(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ConnectionSlot {
                state: self.clone(),
            })
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

/// A reserved connection slot, released on drop.
pub struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;
    let mut app = Router::new()
        .route(&transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler));

    if transport.polling {
        let base = transport.polling_path.trim_end_matches('/');
        app = app
            .route(&format!("{base}/info"), get(polling_info))
            .route(&format!("{base}/open"), post(polling_open))
            .route(&format!("{base}/:id/send"), post(polling_send))
            .route(&format!("{base}/:id/poll"), get(polling_poll));
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Beacon server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );
    if config.transport.polling {
        info!(
            "Polling endpoint: http://{}{}",
            addr, config.transport.polling_path
        );
    }

    serve(listener, state).await
}

/// Serve on an already bound listener, with the presence sweeper and
/// the presence event fan-out running alongside.
///
/// # Errors
///
/// Returns an error if the server stops on an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let sweeper = state
        .presence
        .spawn_sweeper(state.config.presence.sweep_interval());
    let fanout = spawn_event_fanout(&state);

    let result = axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error");

    sweeper.abort();
    fanout.abort();
    result
}

#[derive(Serialize)]
struct PresenceNotice<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
    status: &'static str,
}

/// Watch delivery events: keep presence metrics current and publish
/// each ONLINE/OFFLINE transition to the presence topic.
fn spawn_event_fanout(state: &Arc<AppState>) -> JoinHandle<()> {
    let mut events = state.router.events().subscribe();
    let router = state.router.clone();
    let topic = state.config.presence.broadcast_topic().map(str::to_string);

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Presence fan-out lagged behind");
                    metrics::record_error("event_lag");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let user_id = match &event {
                DeliveryEvent::Online { user_id } => {
                    metrics::record_online();
                    user_id
                }
                DeliveryEvent::Offline { user_id } => {
                    metrics::record_offline();
                    user_id
                }
                DeliveryEvent::Broadcast { recipients, .. } => {
                    metrics::record_deliveries("broadcast", *recipients);
                    continue;
                }
                DeliveryEvent::Directed { recipients, .. } => {
                    metrics::record_deliveries("directed", *recipients);
                    continue;
                }
            };

            let Some(topic) = &topic else {
                continue;
            };
            let notice = PresenceNotice {
                user_id,
                status: event.kind(),
            };
            match Message::json(topic.as_str(), &notice) {
                Ok(message) => {
                    router.publish(message);
                }
                Err(e) => warn!(user = %user_id, error = %e, "Failed to encode presence notice"),
            }
        }
        debug!("Presence fan-out stopped");
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connection_count(),
        "online_users": state.presence.online_user_count(),
        "online_sessions": state.presence.online_session_count(),
        "channels": stats.channel_count,
        "polling_sessions": state.polling.len(),
    }))
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

fn rejection_reason(rejection: &HandshakeRejected) -> &'static str {
    match rejection {
        HandshakeRejected::MissingToken => "missing_token",
        HandshakeRejected::InvalidToken(_) => "invalid_token",
        HandshakeRejected::Expired => "expired",
    }
}

/// Run the handshake for an upgrade request.
fn admit(
    state: &Arc<AppState>,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Result<(Principal, ConnectionSlot), Response> {
    let principal = state
        .handshake
        .authenticate(query, authorization(headers))
        .map_err(|rejection| {
            metrics::record_handshake_rejection(rejection_reason(&rejection));
            (StatusCode::UNAUTHORIZED, rejection.to_string()).into_response()
        })?;

    let slot = state.try_acquire_slot().ok_or_else(|| {
        warn!(user = %principal, "Connection limit reached");
        metrics::record_connection_rejected();
        (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response()
    })?;

    Ok((principal, slot))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let (principal, slot) = match admit(&state, query.as_deref(), &headers) {
        Ok(admitted) => admitted,
        Err(response) => return response,
    };

    // One socket message may batch several frames; the connection checks
    // `max_message_size` per frame.
    let max_frame_size = state.config.limits.max_message_size;
    ws.protocols(STOMP_SUBPROTOCOLS)
        .max_message_size(beacon_protocol::codec::MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            let conn = WebSocketConnection::new(socket, max_frame_size)
                .with_remote_addr(remote_addr);
            connection::run(conn, Some(principal), state).await;
            drop(slot);
        })
}

/// Describe the polling endpoint to clients choosing a transport.
async fn polling_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "websocket": true,
        "polling": true,
        "poll_timeout_ms": state.config.transport.poll_timeout_ms,
        "heartbeat_ms": state.config.heartbeat.interval_ms,
    }))
}

/// Open a polling session and start serving it.
async fn polling_open(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let (principal, slot) = match admit(&state, query.as_deref(), &headers) {
        Ok(admitted) => admitted,
        Err(response) => return response,
    };

    let conn = state.polling.open();
    let id = conn.id().to_string();
    let task_state = state.clone();
    tokio::spawn(async move {
        connection::run(conn, Some(principal), task_state).await;
        drop(slot);
    });

    (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response()
}

fn polling_error(id: &ConnectionId, error: &TransportError) -> StatusCode {
    match error {
        TransportError::UnknownConnection(_) => StatusCode::NOT_FOUND,
        TransportError::ConnectionClosed => StatusCode::GONE,
        _ => {
            warn!(connection = %id, error = %error, "Polling request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Push client frames into a polling session.
async fn polling_send(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> StatusCode {
    let id = ConnectionId::from(id);
    match state.polling.push(&id, body).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => polling_error(&id, &e),
    }
}

/// Long-poll for outbound frames.
async fn polling_poll(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = ConnectionId::from(id);
    match state.polling.poll(&id).await {
        Ok(chunks) if chunks.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(chunks) => {
            let body: Vec<u8> = chunks.concat();
            (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                body,
            )
                .into_response()
        }
        Err(e) => polling_error(&id, &e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use beacon_protocol::{codec, Command, Frame};

    const SECRET: &str = "handlers-test-secret";

    fn state() -> (Arc<AppState>, JwtValidator) {
        let jwt = JwtValidator::new(SECRET).unwrap();
        let mut config = Config::default();
        config.transport.poll_timeout_ms = 2_000;
        (
            Arc::new(AppState::with_validator(config, Arc::new(jwt.clone()))),
            jwt,
        )
    }

    async fn open(state: &Arc<AppState>, query: Option<String>) -> Response {
        polling_open(State(state.clone()), RawQuery(query), HeaderMap::new()).await
    }

    async fn poll_frames(state: &Arc<AppState>, id: &str) -> Vec<Frame> {
        let response = polling_poll(State(state.clone()), Path(id.to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut buf = bytes::BytesMut::from(&body[..]);
        let mut frames = Vec::new();
        while let Some(frame) = codec::decode_from(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let mut config = Config::default();
        config.auth.jwt_secret = Some("  ".to_string());
        if std::env::var(crate::config::JWT_SECRET_ENV).is_err() {
            assert!(AppState::new(config).is_err());
        }
    }

    #[test]
    fn test_connection_limit() {
        let (state, _) = state();
        let mut config = state.config.clone();
        config.limits.max_connections = 1;
        let state = Arc::new(AppState::with_validator(
            config,
            Arc::new(JwtValidator::new(SECRET).unwrap()),
        ));

        let slot = state.try_acquire_slot().unwrap();
        assert!(state.try_acquire_slot().is_none());
        assert_eq!(state.connection_count(), 1);
        drop(slot);
        assert!(state.try_acquire_slot().is_some());
    }

    #[tokio::test]
    async fn test_polling_open_requires_token() {
        let (state, _) = state();
        let response = open(&state, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = open(&state, Some("token=forged".to_string())).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.polling.is_empty());
    }

    #[tokio::test]
    async fn test_polling_session_round_trip() {
        let (state, jwt) = state();
        let token = jwt.issue("erin").unwrap();

        let response = open(&state, Some(format!("token={token}"))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let opened: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = opened["id"].as_str().unwrap().to_string();

        let connect = codec::encode(&Frame::connect("1.2")).unwrap();
        let status = polling_send(State(state.clone()), Path(id.clone()), connect).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let frames = poll_frames(&state, &id).await;
        assert_eq!(frames[0].command, Some(Command::Connected));
        assert_eq!(frames[0].header("user-name"), Some("erin"));
        assert!(state.presence.is_online("erin"));

        let disconnect = codec::encode(&Frame::disconnect().with_header("receipt", "bye")).unwrap();
        polling_send(State(state.clone()), Path(id.clone()), disconnect).await;
        let frames = poll_frames(&state, &id).await;
        assert_eq!(frames[0].command, Some(Command::Receipt));

        // The session is gone once the server side has shut down.
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.presence.is_online("erin") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_polling_unknown_session() {
        let (state, _) = state();
        let status = polling_send(
            State(state.clone()),
            Path("conn_missing".to_string()),
            Bytes::new(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let response = polling_poll(State(state), Path("conn_missing".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_presence_fanout_publishes_transitions() {
        let (state, _) = state();
        let fanout = spawn_event_fanout(&state);
        tokio::task::yield_now().await;

        let observer = beacon_core::SessionId::new("observer");
        let (tx, _rx) = state.router.session_queue();
        state.router.register_session(&observer, tx).unwrap();
        let beacon_core::Subscription::Topic(mut notices) = state
            .router
            .subscribe(
                &observer,
                &beacon_protocol::Destination::parse("/topic/presence").unwrap(),
            )
            .unwrap()
        else {
            unreachable!()
        };

        let session = beacon_core::SessionId::new("s1");
        state.presence.mark_online("frank", &session);
        state.presence.mark_offline_if_no_sessions("frank", &session);

        let online = notices.recv().await.unwrap();
        let online: serde_json::Value = serde_json::from_slice(&online.payload).unwrap();
        assert_eq!(online, serde_json::json!({"userId": "frank", "status": "ONLINE"}));

        let offline = notices.recv().await.unwrap();
        let offline: serde_json::Value = serde_json::from_slice(&offline.payload).unwrap();
        assert_eq!(offline["status"], "OFFLINE");

        fanout.abort();
    }
}
