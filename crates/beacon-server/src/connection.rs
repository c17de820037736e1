//! Per-connection frame loop.
//!
//! One task drives each connection, whatever its transport. Inbound
//! frames pass through the channel auth interceptor before they are
//! dispatched; deliveries from the router and from topic forwarders
//! share one bounded queue per session.

use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};
use beacon_core::{Delivery, Message, Principal, Session, SessionId, Subscription};
use beacon_protocol::version::{self, SUPPORTED_VERSIONS};
use beacon_protocol::{headers, Command, Destination, Frame};
use beacon_transport::{Connection, TransportError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Application destination answered with a presence acknowledgement.
const PRESENCE_HEARTBEAT: &str = "/presence/heartbeat";

/// Per-user destination the acknowledgement is delivered to.
const PRESENCE_HEARTBEAT_REPLY: &str = "/queue/presence/heartbeat";

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct ActiveSubscription {
    destination: Destination,
    forwarder: Option<JoinHandle<()>>,
}

#[derive(Serialize)]
struct HeartbeatAck<'a> {
    status: &'static str,
    #[serde(rename = "userId")]
    user_id: &'a str,
}

/// Serve one connection until either side closes it.
pub async fn run<C: Connection>(mut conn: C, principal: Option<Principal>, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new(conn.transport());

    let session_id = SessionId::new(conn.id().as_str());
    let session = match principal {
        Some(principal) => Session::with_principal(session_id, principal),
        None => Session::new(session_id),
    };

    let (sink, mut deliveries) = state.router.session_queue();
    if let Err(e) = state.router.register_session(session.id(), sink.clone()) {
        warn!(session = %session.id(), error = %e, "Failed to register session");
        let _ = conn.close().await;
        return;
    }
    debug!(
        session = %session.id(),
        transport = conn.transport(),
        remote = conn.remote_addr().as_deref().unwrap_or("-"),
        "Connection opened"
    );

    let tick = Duration::from_millis(state.config.heartbeat.interval_ms.max(100));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ctx = ConnectionContext::new(state, session, sink);

    loop {
        tokio::select! {
            biased;

            Some(delivery) = deliveries.recv() => {
                if let Err(e) = ctx.deliver(&mut conn, delivery).await {
                    debug!(session = %ctx.session.id(), error = %e, "Delivery failed");
                    break;
                }
            }

            inbound = conn.recv() => {
                let frame = match inbound {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        debug!(session = %ctx.session.id(), "Connection closed by peer");
                        break;
                    }
                    Err(TransportError::Protocol(e)) => {
                        warn!(session = %ctx.session.id(), error = %e, "Malformed frame");
                        ctx.fail(&mut conn, &e.to_string()).await;
                        break;
                    }
                    Err(e) => {
                        debug!(session = %ctx.session.id(), error = %e, "Receive failed");
                        metrics::record_error("receive");
                        break;
                    }
                };

                let start = Instant::now();
                let flow = ctx.handle_frame(&mut conn, frame).await;
                metrics::record_latency(start.elapsed().as_secs_f64());
                match flow {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break,
                    Err(e) => {
                        debug!(session = %ctx.session.id(), error = %e, "Send failed");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                match ctx.on_tick(&mut conn).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break,
                    Err(e) => {
                        debug!(session = %ctx.session.id(), error = %e, "Heartbeat failed");
                        break;
                    }
                }
            }
        }
    }

    ctx.shutdown(&mut conn).await;
}

struct ConnectionContext {
    state: Arc<AppState>,
    session: Session,
    sink: mpsc::Sender<Delivery>,
    /// Subscriptions by client-chosen id.
    subscriptions: HashMap<String, ActiveSubscription>,
    /// Subscription id by wire destination.
    routes: HashMap<String, String>,
    connected: bool,
    outgoing_heartbeat: Option<Duration>,
    idle_limit: Duration,
    last_inbound: Instant,
    last_outbound: Instant,
}

impl ConnectionContext {
    fn new(state: Arc<AppState>, session: Session, sink: mpsc::Sender<Delivery>) -> Self {
        let idle_limit = Duration::from_millis(state.config.heartbeat.timeout_ms);
        let now = Instant::now();
        Self {
            state,
            session,
            sink,
            subscriptions: HashMap::new(),
            routes: HashMap::new(),
            connected: false,
            outgoing_heartbeat: None,
            idle_limit,
            last_inbound: now,
            last_outbound: now,
        }
    }

    async fn handle_frame<C: Connection>(
        &mut self,
        conn: &mut C,
        frame: Frame,
    ) -> Result<Flow, TransportError> {
        self.last_inbound = Instant::now();
        metrics::record_frame(frame.body.len(), "inbound");

        // Nothing reaches presence before the CONNECT exchange.
        if !self.connected {
            match frame.command {
                None => return Ok(Flow::Continue),
                Some(command) if !command.is_connect() => {
                    self.fail(conn, &format!("Expected CONNECT, got {}", command.as_str()))
                        .await;
                    return Ok(Flow::Close);
                }
                Some(_) => {}
            }
        }

        let interception = self.state.interceptor.pre_send(&frame, &mut self.session);
        trace!(session = %self.session.id(), ?interception, "Frame intercepted");

        let Some(command) = frame.command else {
            return Ok(Flow::Continue);
        };

        match command {
            Command::Connect | Command::Stomp => self.on_connect(conn, &frame).await,
            Command::Subscribe => self.on_subscribe(conn, &frame).await,
            Command::Unsubscribe => self.on_unsubscribe(conn, &frame).await,
            Command::Send => self.on_send(conn, &frame).await,
            Command::Disconnect => {
                self.receipt(conn, &frame).await?;
                Ok(Flow::Close)
            }
            Command::Ack | Command::Nack | Command::Begin | Command::Commit | Command::Abort => {
                trace!(session = %self.session.id(), command = command.as_str(), "Frame ignored");
                self.receipt(conn, &frame).await?;
                Ok(Flow::Continue)
            }
            Command::Connected | Command::Message | Command::Receipt | Command::Error => {
                self.fail(conn, &format!("Unexpected {} frame", command.as_str()))
                    .await;
                Ok(Flow::Close)
            }
        }
    }

    async fn on_connect<C: Connection>(
        &mut self,
        conn: &mut C,
        frame: &Frame,
    ) -> Result<Flow, TransportError> {
        if self.connected {
            debug!(session = %self.session.id(), "Duplicate CONNECT ignored");
            return Ok(Flow::Continue);
        }

        let Some(version) = version::negotiate(frame.header(headers::ACCEPT_VERSION)) else {
            let supported = SUPPORTED_VERSIONS
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            self.fail(conn, &format!("Supported protocol versions are {supported}"))
                .await;
            return Ok(Flow::Close);
        };

        let interval = self.state.config.heartbeat.interval_ms;
        let offered = (interval, interval);
        let (outgoing, incoming) = negotiate_heart_beat(frame.header(headers::HEART_BEAT), offered);
        self.outgoing_heartbeat = outgoing;
        if let Some(incoming) = incoming {
            self.idle_limit = self.idle_limit.max(incoming * 2);
        }

        let mut reply = Frame::connected(&version.to_string(), self.session.id().as_str(), offered);
        if let Some(principal) = self.session.principal() {
            reply = reply.with_header(headers::USER_NAME, principal.name());
        }
        self.connected = true;

        info!(
            session = %self.session.id(),
            user = self.session.principal().map(Principal::name).unwrap_or("-"),
            version = %version,
            "Session connected"
        );
        self.send(conn, reply).await?;
        Ok(Flow::Continue)
    }

    async fn on_subscribe<C: Connection>(
        &mut self,
        conn: &mut C,
        frame: &Frame,
    ) -> Result<Flow, TransportError> {
        let (Some(id), Some(raw)) = (frame.header(headers::ID), frame.header(headers::DESTINATION))
        else {
            self.fail(conn, "SUBSCRIBE requires id and destination").await;
            return Ok(Flow::Close);
        };
        if self.subscriptions.contains_key(id) {
            self.fail(conn, &format!("Duplicate subscription id: {id}")).await;
            return Ok(Flow::Close);
        }
        let destination = match Destination::parse(raw) {
            Ok(destination) => destination,
            Err(e) => {
                self.fail(conn, &e.to_string()).await;
                return Ok(Flow::Close);
            }
        };

        let wire = destination.to_wire();
        let forwarder = match self.state.router.subscribe(self.session.id(), &destination) {
            Ok(Subscription::Topic(receiver)) => Some(spawn_forwarder(
                receiver,
                wire.clone(),
                self.sink.clone(),
                self.session.id().clone(),
            )),
            Ok(Subscription::User) => None,
            Err(e) => {
                warn!(session = %self.session.id(), destination = %wire, error = %e, "Subscribe failed");
                self.fail(conn, &e.to_string()).await;
                return Ok(Flow::Close);
            }
        };

        metrics::record_subscription();
        metrics::set_active_channels(self.state.router.stats().channel_count);
        self.routes.insert(wire, id.to_string());
        self.subscriptions.insert(
            id.to_string(),
            ActiveSubscription {
                destination,
                forwarder,
            },
        );

        self.receipt(conn, frame).await?;
        Ok(Flow::Continue)
    }

    async fn on_unsubscribe<C: Connection>(
        &mut self,
        conn: &mut C,
        frame: &Frame,
    ) -> Result<Flow, TransportError> {
        let Some(id) = frame.header(headers::ID) else {
            self.fail(conn, "UNSUBSCRIBE requires id").await;
            return Ok(Flow::Close);
        };

        match self.subscriptions.remove(id) {
            Some(subscription) => {
                if let Some(forwarder) = subscription.forwarder {
                    forwarder.abort();
                }
                self.routes.remove(&subscription.destination.to_wire());
                if let Err(e) = self
                    .state
                    .router
                    .unsubscribe(self.session.id(), &subscription.destination)
                {
                    debug!(session = %self.session.id(), error = %e, "Unsubscribe failed");
                }
                metrics::set_active_channels(self.state.router.stats().channel_count);
            }
            None => debug!(session = %self.session.id(), id, "Unknown subscription id"),
        }

        self.receipt(conn, frame).await?;
        Ok(Flow::Continue)
    }

    async fn on_send<C: Connection>(
        &mut self,
        conn: &mut C,
        frame: &Frame,
    ) -> Result<Flow, TransportError> {
        let Some(raw) = frame.header(headers::DESTINATION) else {
            self.fail(conn, "SEND requires destination").await;
            return Ok(Flow::Close);
        };

        match Destination::parse(raw) {
            Ok(Destination::Broker(topic)) => {
                let mut message = Message::new(topic, frame.body.clone());
                if let Some(content_type) = frame.header(headers::CONTENT_TYPE) {
                    message = message.with_content_type(content_type);
                }
                let recipients = self.state.router.publish(message);
                trace!(session = %self.session.id(), destination = raw, recipients, "Published");
            }
            Ok(Destination::Application(path)) => self.on_application(&path),
            Ok(Destination::User(_)) => {
                debug!(session = %self.session.id(), destination = raw, "SEND to a user destination dropped");
            }
            Err(e) => {
                self.fail(conn, &e.to_string()).await;
                return Ok(Flow::Close);
            }
        }

        self.receipt(conn, frame).await?;
        Ok(Flow::Continue)
    }

    fn on_application(&self, path: &str) {
        if path != PRESENCE_HEARTBEAT {
            debug!(session = %self.session.id(), destination = path, "No handler for application destination");
            return;
        }

        let Some(principal) = self.session.principal() else {
            return;
        };
        let ack = HeartbeatAck {
            status: "ok",
            user_id: principal.name(),
        };
        match Message::json(PRESENCE_HEARTBEAT_REPLY, &ack) {
            Ok(message) => {
                self.state.router.send_to_user(principal.name(), message);
            }
            Err(e) => warn!(user = %principal, error = %e, "Failed to encode heartbeat reply"),
        }
    }

    async fn deliver<C: Connection>(
        &mut self,
        conn: &mut C,
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        let Some(subscription) = self.routes.get(&delivery.destination) else {
            trace!(session = %self.session.id(), destination = %delivery.destination, "No subscription for delivery");
            return Ok(());
        };

        let message = &delivery.message;
        let mut frame = Frame::message(
            delivery.destination.as_str(),
            subscription.as_str(),
            message.id.to_string(),
            message.payload.clone(),
        );
        if let Some(content_type) = &message.content_type {
            frame = frame.with_header(headers::CONTENT_TYPE, content_type.as_str());
        }
        self.send(conn, frame).await
    }

    async fn on_tick<C: Connection>(&mut self, conn: &mut C) -> Result<Flow, TransportError> {
        if self.last_inbound.elapsed() >= self.idle_limit {
            info!(session = %self.session.id(), "Connection idle, closing");
            return Ok(Flow::Close);
        }

        if let Some(every) = self.outgoing_heartbeat {
            if self.last_outbound.elapsed() >= every {
                conn.send(Frame::heartbeat()).await?;
                self.last_outbound = Instant::now();
            }
        }
        Ok(Flow::Continue)
    }

    async fn send<C: Connection>(&mut self, conn: &mut C, frame: Frame) -> Result<(), TransportError> {
        let size = frame.body.len();
        conn.send(frame).await?;
        self.last_outbound = Instant::now();
        metrics::record_frame(size, "outbound");
        Ok(())
    }

    async fn receipt<C: Connection>(&mut self, conn: &mut C, frame: &Frame) -> Result<(), TransportError> {
        match frame.header(headers::RECEIPT) {
            Some(receipt) => self.send(conn, Frame::receipt(receipt)).await,
            None => Ok(()),
        }
    }

    /// Send an ERROR frame. The caller closes the connection afterwards.
    async fn fail<C: Connection>(&mut self, conn: &mut C, message: &str) {
        metrics::record_error("protocol");
        debug!(session = %self.session.id(), error = message, "Sending ERROR");
        if let Err(e) = self.send(conn, Frame::error(message)).await {
            debug!(session = %self.session.id(), error = %e, "Failed to send ERROR");
        }
    }

    async fn shutdown<C: Connection>(mut self, conn: &mut C) {
        for (_, subscription) in self.subscriptions.drain() {
            if let Some(forwarder) = subscription.forwarder {
                forwarder.abort();
            }
        }
        self.state.router.remove_session(self.session.id());
        self.session.close(&self.state.presence);
        metrics::set_active_channels(self.state.router.stats().channel_count);

        if conn.is_open() {
            if let Err(e) = conn.close().await {
                debug!(session = %self.session.id(), error = %e, "Close failed");
            }
        }
        debug!(session = %self.session.id(), "Connection finished");
    }
}

/// Forward a topic subscription into the session's delivery queue.
fn spawn_forwarder(
    mut receiver: broadcast::Receiver<Arc<Message>>,
    destination: String,
    sink: mpsc::Sender<Delivery>,
    session: SessionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    if sink
                        .send(Delivery::new(destination.clone(), message))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %session, destination = %destination, skipped, "Subscriber lagged");
                    metrics::record_lagged(skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Settle heart-beating from the client's `heart-beat: cx,cy` header and
/// the server's offer `(sx, sy)`.
///
/// Returns how often the server sends and how often it expects to hear
/// from the client. Zero on either side disables that direction.
fn negotiate_heart_beat(
    client: Option<&str>,
    server: (u64, u64),
) -> (Option<Duration>, Option<Duration>) {
    let (cx, cy) = client
        .and_then(|value| value.split_once(','))
        .and_then(|(cx, cy)| Some((cx.trim().parse::<u64>().ok()?, cy.trim().parse::<u64>().ok()?)))
        .unwrap_or((0, 0));

    let settle = |ours: u64, theirs: u64| {
        (ours > 0 && theirs > 0).then(|| Duration::from_millis(ours.max(theirs)))
    };
    (settle(server.0, cy), settle(server.1, cx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use beacon_core::JwtValidator;
    use beacon_protocol::codec;
    use beacon_transport::ConnectionId;
    use bytes::Bytes;

    struct MockConnection {
        id: ConnectionId,
        inbound: mpsc::UnboundedReceiver<Frame>,
        outbound: mpsc::UnboundedSender<Frame>,
        open: bool,
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn id(&self) -> &ConnectionId {
            &self.id
        }

        fn transport(&self) -> &'static str {
            "mock"
        }

        async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
            if !self.open {
                return Ok(None);
            }
            Ok(self.inbound.recv().await)
        }

        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            self.outbound
                .send(frame)
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
            let frame = codec::decode(&data)?;
            self.send(frame).await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    struct Client {
        tx: mpsc::UnboundedSender<Frame>,
        rx: mpsc::UnboundedReceiver<Frame>,
        task: JoinHandle<()>,
    }

    impl Client {
        fn send(&self, frame: Frame) {
            self.tx.send(frame).unwrap();
        }

        async fn next(&mut self) -> Frame {
            self.rx.recv().await.expect("connection closed")
        }

        async fn next_non_heartbeat(&mut self) -> Frame {
            loop {
                let frame = self.next().await;
                if !frame.is_heartbeat() {
                    return frame;
                }
            }
        }
    }

    fn state() -> (Arc<AppState>, JwtValidator) {
        let jwt = JwtValidator::new("connection-test-secret").unwrap();
        let state = AppState::with_validator(Config::default(), Arc::new(jwt.clone()));
        (Arc::new(state), jwt)
    }

    fn spawn_client(state: &Arc<AppState>, jwt: &JwtValidator, user: &str, id: &str) -> Client {
        let token = jwt.issue(user).unwrap();
        let principal = state
            .handshake
            .authenticate(Some(&format!("token={token}")), None)
            .unwrap();

        let (client_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, client_rx) = mpsc::unbounded_channel();
        let conn = MockConnection {
            id: ConnectionId::new(id),
            inbound,
            outbound,
            open: true,
        };
        let task = tokio::spawn(run(conn, Some(principal), state.clone()));
        Client {
            tx: client_tx,
            rx: client_rx,
            task,
        }
    }

    #[test]
    fn test_negotiate_heart_beat() {
        let ms = Duration::from_millis;
        assert_eq!(
            negotiate_heart_beat(Some("10000,10000"), (10_000, 10_000)),
            (Some(ms(10_000)), Some(ms(10_000)))
        );
        assert_eq!(
            negotiate_heart_beat(Some("5000,20000"), (10_000, 10_000)),
            (Some(ms(20_000)), Some(ms(10_000)))
        );
        assert_eq!(negotiate_heart_beat(Some("0,0"), (10_000, 10_000)), (None, None));
        assert_eq!(negotiate_heart_beat(None, (10_000, 10_000)), (None, None));
        assert_eq!(negotiate_heart_beat(Some("garbage"), (10_000, 10_000)), (None, None));
        assert_eq!(negotiate_heart_beat(Some("1000,1000"), (0, 5_000)), (None, Some(ms(5_000))));
    }

    #[tokio::test]
    async fn test_connect_replies_connected() {
        let (state, jwt) = state();
        let mut client = spawn_client(&state, &jwt, "alice", "c1");

        client.send(Frame::connect("1.1,1.2").with_header(headers::HEART_BEAT, "0,0"));
        let connected = client.next().await;
        assert_eq!(connected.command, Some(Command::Connected));
        assert_eq!(connected.header(headers::VERSION), Some("1.2"));
        assert_eq!(connected.header(headers::USER_NAME), Some("alice"));
        assert_eq!(connected.header(headers::SESSION), Some("c1"));
        assert!(state.presence.is_online("alice"));

        client.send(Frame::disconnect().with_header(headers::RECEIPT, "r-1"));
        let receipt = client.next().await;
        assert_eq!(receipt.header(headers::RECEIPT_ID), Some("r-1"));
        client.task.await.unwrap();
        assert!(!state.presence.is_online("alice"));
        assert_eq!(state.router.stats().session_count, 0);
    }

    #[tokio::test]
    async fn test_frames_before_connect_are_refused() {
        let (state, jwt) = state();
        let mut client = spawn_client(&state, &jwt, "bob", "c1");

        client.send(Frame::subscribe("sub-0", "/topic/a"));
        let error = client.next().await;
        assert_eq!(error.command, Some(Command::Error));
        client.task.await.unwrap();
        assert!(!state.router.channel_exists("/topic/a"));
    }

    #[tokio::test]
    async fn test_refused_session_never_goes_online() {
        let (state, jwt) = state();
        let mut events = state.presence.events().subscribe();
        let mut client = spawn_client(&state, &jwt, "bob", "c1");

        client.send(Frame::heartbeat());
        client.send(Frame::send("/topic/a", "early"));
        let error = client.next().await;
        assert_eq!(error.command, Some(Command::Error));
        client.task.await.unwrap();

        assert!(!state.presence.is_online("bob"));
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_version_is_refused() {
        let (state, jwt) = state();
        let mut client = spawn_client(&state, &jwt, "bob", "c1");

        client.send(Frame::connect("2.0"));
        let error = client.next().await;
        assert_eq!(error.command, Some(Command::Error));
        assert!(error.header(headers::MESSAGE).unwrap().contains("1.2"));
        client.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_presence_heartbeat_reply() {
        let (state, jwt) = state();
        let mut client = spawn_client(&state, &jwt, "carol", "c1");

        client.send(Frame::connect("1.2"));
        client.next().await;
        client.send(
            Frame::subscribe("sub-0", "/user/queue/presence/heartbeat")
                .with_header(headers::RECEIPT, "subscribed"),
        );
        assert_eq!(client.next().await.command, Some(Command::Receipt));

        client.send(Frame::send("/app/presence/heartbeat", ""));
        let reply = client.next_non_heartbeat().await;
        assert_eq!(reply.command, Some(Command::Message));
        assert_eq!(reply.header(headers::SUBSCRIPTION), Some("sub-0"));
        assert_eq!(
            reply.header(headers::DESTINATION),
            Some("/user/queue/presence/heartbeat")
        );
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body, serde_json::json!({"status": "ok", "userId": "carol"}));
    }

    #[tokio::test]
    async fn test_topic_broadcast_and_unsubscribe() {
        let (state, jwt) = state();
        let mut a = spawn_client(&state, &jwt, "dave", "c1");
        let mut b = spawn_client(&state, &jwt, "erin", "c2");

        for client in [&mut a, &mut b] {
            client.send(Frame::connect("1.2"));
            client.next().await;
            client.send(
                Frame::subscribe("t", "/topic/tickets").with_header(headers::RECEIPT, "ok"),
            );
            client.next().await;
        }

        a.send(Frame::send("/topic/tickets", "opened").with_header(headers::CONTENT_TYPE, "text/plain"));
        for client in [&mut a, &mut b] {
            let message = client.next_non_heartbeat().await;
            assert_eq!(message.body_str(), Some("opened"));
            assert_eq!(message.header(headers::SUBSCRIPTION), Some("t"));
            assert_eq!(message.header(headers::CONTENT_TYPE), Some("text/plain"));
        }

        b.send(Frame::unsubscribe("t").with_header(headers::RECEIPT, "gone"));
        assert_eq!(b.next().await.command, Some(Command::Receipt));
        assert_eq!(state.router.subscriber_count("/topic/tickets"), 1);
    }

    #[tokio::test]
    async fn test_router_errors_close_the_connection() {
        let (state, jwt) = state();
        let mut client = spawn_client(&state, &jwt, "frank", "c1");

        client.send(Frame::connect("1.2"));
        client.next().await;
        client.send(Frame::subscribe("s", "/app/presence/heartbeat"));
        assert_eq!(client.next().await.command, Some(Command::Error));
        client.task.await.unwrap();
        assert!(!state.presence.is_online("frank"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_closed() {
        let (state, jwt) = state();
        let mut client = spawn_client(&state, &jwt, "grace", "c1");

        client.send(Frame::connect("1.2").with_header(headers::HEART_BEAT, "0,0"));
        client.next().await;
        assert!(state.presence.is_online("grace"));

        // No inbound traffic for the heartbeat timeout.
        client.task.await.unwrap();
        assert!(!state.presence.is_online("grace"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_sends_heartbeats() {
        let (state, jwt) = state();
        let mut client = spawn_client(&state, &jwt, "heidi", "c1");

        client.send(Frame::connect("1.2").with_header(headers::HEART_BEAT, "10000,10000"));
        client.next().await;

        let beat = client.next().await;
        assert!(beat.is_heartbeat());
    }
}
