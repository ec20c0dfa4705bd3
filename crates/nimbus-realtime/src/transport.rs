//! WebSocket transport lifecycle.
//!
//! `connect()` resolves the notification endpoint (via the drive's
//! subscription API), dials the websocket, and returns only after the
//! Engine.IO handshake has been read and dispatched — the caller's
//! first observable event is `Connected`. A background task then runs
//! the read loop and the heartbeat loop, and reconnects with jittered
//! exponential backoff when the connection drops.
//!
//! Health tracking: pings go out every `ping_interval`; a pong
//! overdue past `ping_timeout` counts as a miss, and two consecutive
//! misses mark the link `Degraded`. Exhausting the reconnect budget
//! marks it `Failed` (reconnects keep trying at the backoff cap; a
//! later success returns the link to `Healthy`).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use nimbus_core::backoff::Backoff;
use nimbus_core::config::RealtimeConfig;
use nimbus_core::ports::realtime_link::{LinkHealth, RealtimeLink, TransportEvent};
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_core::NimbusError;

use crate::packet::{normalize_endpoint, EnginePacket, Handshake, SocketMessage};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The Socket.IO event name that signals drive changes.
const NOTIFICATION_EVENT: &str = "notification";

// ============================================================================
// Configuration
// ============================================================================

/// How the realtime surface operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeMode {
    /// Connect the transport; polling is only a fallback.
    Realtime,
    /// Never connect; the delta loop polls on its interval.
    PollingOnly,
    /// No realtime and no shortened polling.
    Disabled,
}

impl RealtimeMode {
    /// Derive the mode from configuration flags.
    #[must_use]
    pub fn from_config(config: &RealtimeConfig) -> Self {
        if !config.enabled {
            RealtimeMode::Disabled
        } else if config.polling_only {
            RealtimeMode::PollingOnly
        } else {
            RealtimeMode::Realtime
        }
    }
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Consecutive missed pongs before the link is `Degraded`.
    pub ping_miss_threshold: u32,
    /// Reconnect backoff floor.
    pub reconnect_initial: Duration,
    /// Reconnect backoff cap.
    pub reconnect_max: Duration,
    /// Consecutive reconnect failures before the link is `Failed`.
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_miss_threshold: 2,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            max_reconnect_attempts: 10,
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

enum EndpointSource {
    /// Resolve through the drive's subscription API (renewed on every
    /// reconnect, since subscriptions expire).
    Subscription(Arc<dyn RemoteDrive>),
    /// Fixed URL (tests).
    Fixed(String),
}

/// The Engine.IO websocket transport.
pub struct RealtimeTransport {
    endpoint: EndpointSource,
    config: TransportConfig,
    events_tx: broadcast::Sender<TransportEvent>,
    health: RwLock<LinkHealth>,
    cancel: CancellationToken,
    /// Back-reference for spawning the background loop from `&self`.
    self_ref: RwLock<std::sync::Weak<RealtimeTransport>>,
}

struct Session {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    handshake: Handshake,
}

/// Why a session ended.
enum SessionEnd {
    Shutdown,
    Lost(String),
}

impl RealtimeTransport {
    /// Transport resolving its endpoint through `drive`.
    pub fn new(drive: Arc<dyn RemoteDrive>, config: TransportConfig) -> Arc<Self> {
        Self::build(EndpointSource::Subscription(drive), config)
    }

    /// Transport with a fixed endpoint (tests).
    pub fn with_fixed_endpoint(url: impl Into<String>, config: TransportConfig) -> Arc<Self> {
        Self::build(EndpointSource::Fixed(url.into()), config)
    }

    fn build(endpoint: EndpointSource, config: TransportConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(Self {
            endpoint,
            config,
            events_tx,
            health: RwLock::new(LinkHealth::Unknown),
            cancel: CancellationToken::new(),
            self_ref: RwLock::new(std::sync::Weak::new()),
        });
        *transport.self_ref.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::downgrade(&transport);
        transport
    }

    fn emit(&self, event: TransportEvent) {
        // Send fails only when nobody listens, which is fine.
        let _ = self.events_tx.send(event);
    }

    fn set_health(&self, health: LinkHealth) {
        let changed = {
            let mut current = self.health.write().unwrap_or_else(|e| e.into_inner());
            if *current == health {
                false
            } else {
                tracing::info!(from = current.name(), to = health.name(), "Realtime health changed");
                *current = health;
                true
            }
        };
        if changed {
            self.emit(TransportEvent::HealthChanged { health });
        }
    }

    async fn resolve_endpoint(&self) -> Result<String, NimbusError> {
        let raw = match &self.endpoint {
            EndpointSource::Subscription(drive) => drive.subscribe().await?.url,
            EndpointSource::Fixed(url) => url.clone(),
        };
        normalize_endpoint(&raw)
            .map_err(|e| NimbusError::Transient(format!("endpoint normalize: {e}")))
    }

    /// Dial and complete the Engine.IO handshake.
    async fn connect_once(&self) -> Result<Session, NimbusError> {
        let url = self.resolve_endpoint().await?;
        tracing::debug!(%url, "Dialing realtime endpoint");

        let (mut ws, _) = connect_async(&url)
            .await
            .map_err(|e| NimbusError::Transient(format!("websocket connect: {e}")))?;

        // The server speaks first: read until the OPEN packet arrives.
        let handshake = loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| {
                    NimbusError::Transient("connection closed before handshake".to_string())
                })?
                .map_err(|e| NimbusError::Transient(format!("handshake read: {e}")))?;

            match frame {
                Message::Text(text) => match EnginePacket::decode(&text) {
                    Ok(EnginePacket::Open(handshake)) => break handshake,
                    Ok(other) => {
                        tracing::trace!(?other, "Pre-handshake packet ignored");
                    }
                    Err(e) => {
                        return Err(NimbusError::Transient(format!("handshake decode: {e}")))
                    }
                },
                Message::Close(_) => {
                    return Err(NimbusError::Transient(
                        "server closed during handshake".to_string(),
                    ))
                }
                _ => {}
            }
        };

        // Join the default Socket.IO namespace.
        ws.send(Message::Text(SocketMessage::connect_frame()))
            .await
            .map_err(|e| NimbusError::Transient(format!("namespace join: {e}")))?;

        tracing::info!(
            sid = %handshake.sid,
            ping_interval_ms = handshake.ping_interval,
            ping_timeout_ms = handshake.ping_timeout,
            "Realtime transport connected"
        );
        Ok(Session { ws, handshake })
    }

    /// Run one connected session: read loop plus heartbeat, until the
    /// connection drops or shutdown is requested.
    async fn drive_session(&self, session: Session) -> SessionEnd {
        let Session { ws, handshake } = session;
        let (mut sink, mut stream) = ws.split();

        let ping_interval = Duration::from_millis(handshake.ping_interval.max(1));
        let ping_timeout = Duration::from_millis(handshake.ping_timeout.max(1));
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first ping
        // waits a full interval after the handshake.
        ticker.tick().await;

        let mut awaiting_pong: Option<Instant> = None;
        let mut missed_pongs: u32 = 0;

        loop {
            let pong_deadline = awaiting_pong
                .map(|sent| sent + ping_timeout)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }

                _ = ticker.tick() => {
                    if sink
                        .send(Message::Text(EnginePacket::Ping.encode()))
                        .await
                        .is_err()
                    {
                        return SessionEnd::Lost("ping send failed".to_string());
                    }
                    if awaiting_pong.is_none() {
                        awaiting_pong = Some(Instant::now());
                    }
                }

                _ = tokio::time::sleep_until(pong_deadline), if awaiting_pong.is_some() => {
                    awaiting_pong = None;
                    missed_pongs += 1;
                    tracing::warn!(missed_pongs, "Heartbeat pong overdue");
                    if missed_pongs >= self.config.ping_miss_threshold {
                        self.set_health(LinkHealth::Degraded);
                    }
                }

                frame = stream.next() => {
                    let frame = match frame {
                        None => return SessionEnd::Lost("stream ended".to_string()),
                        Some(Err(e)) => return SessionEnd::Lost(format!("read error: {e}")),
                        Some(Ok(frame)) => frame,
                    };

                    match frame {
                        Message::Text(text) => match EnginePacket::decode(&text) {
                            Ok(EnginePacket::Pong) => {
                                awaiting_pong = None;
                                if missed_pongs > 0 {
                                    missed_pongs = 0;
                                    self.set_health(LinkHealth::Healthy);
                                }
                            }
                            Ok(EnginePacket::Ping) => {
                                // Be liberal: some peers heartbeat from
                                // their side too.
                                let _ = sink.send(Message::Text(EnginePacket::Pong.encode())).await;
                            }
                            Ok(EnginePacket::Message(payload)) => {
                                self.handle_socket_message(&payload);
                            }
                            Ok(EnginePacket::Close) => {
                                return SessionEnd::Lost("engine close".to_string());
                            }
                            Ok(EnginePacket::Open(_)) => {}
                            Err(e) => {
                                tracing::debug!(error = %e, "Undecodable frame ignored");
                            }
                        },
                        Message::Ping(payload) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Message::Close(_) => {
                            return SessionEnd::Lost("close frame".to_string());
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_socket_message(&self, payload: &str) {
        match SocketMessage::parse(payload) {
            Ok(SocketMessage::Event { name, payload }) if name == NOTIFICATION_EVENT => {
                tracing::debug!("Change notification received");
                self.emit(TransportEvent::Notification { payload });
            }
            Ok(SocketMessage::Event { name, .. }) => {
                tracing::trace!(event = %name, "Ignoring unrelated event");
            }
            Ok(SocketMessage::ConnectError(detail)) => {
                self.emit(TransportEvent::Error {
                    message: format!("namespace refused: {detail}"),
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Undecodable socket message ignored");
            }
        }
    }

    /// Reconnect loop, running after the initial session is handed
    /// over by `connect()`.
    async fn run(self: Arc<Self>, initial: Session) {
        let mut backoff = Backoff::new(self.config.reconnect_initial, self.config.reconnect_max)
            .with_jitter(0.1)
            .with_max_exponent(10);
        let mut session = Some(initial);

        loop {
            if let Some(active) = session.take() {
                match self.drive_session(active).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost(reason) => {
                        tracing::warn!(%reason, "Realtime connection lost");
                        self.emit(TransportEvent::Disconnected { reason });
                        self.set_health(LinkHealth::Degraded);
                    }
                }
            }

            if self.cancel.is_cancelled() {
                return;
            }

            match self.connect_once().await {
                Ok(fresh) => {
                    backoff.reset();
                    self.set_health(LinkHealth::Healthy);
                    self.emit(TransportEvent::Reconnected);
                    session = Some(fresh);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.failures() >= self.config.max_reconnect_attempts {
                        self.set_health(LinkHealth::Failed);
                    }
                    self.emit(TransportEvent::Error {
                        message: e.to_string(),
                    });
                    tracing::warn!(
                        error = %e,
                        failures = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Reconnect failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RealtimeLink for RealtimeTransport {
    async fn connect(&self) -> Result<(), NimbusError> {
        let this = self
            .self_ref
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
            .ok_or_else(|| NimbusError::Transient("transport already dropped".to_string()))?;

        let session = self.connect_once().await?;
        self.set_health(LinkHealth::Healthy);
        self.emit(TransportEvent::Connected);
        tokio::spawn(this.run(session));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    fn health(&self) -> LinkHealth {
        *self.health.read().unwrap_or_else(|e| e.into_inner())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_mode_from_config() {
        let mut config = RealtimeConfig::default();
        assert_eq!(RealtimeMode::from_config(&config), RealtimeMode::Realtime);

        config.polling_only = true;
        assert_eq!(RealtimeMode::from_config(&config), RealtimeMode::PollingOnly);

        config.enabled = false;
        assert_eq!(RealtimeMode::from_config(&config), RealtimeMode::Disabled);
    }

    /// A minimal Engine.IO server: handshake, namespace ack, then the
    /// provided script.
    async fn spawn_server(
        ping_interval_ms: u64,
        ping_timeout_ms: u64,
        answer_pings: bool,
        notify: bool,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            ws.send(Message::Text(format!(
                "0{{\"sid\":\"s1\",\"pingInterval\":{ping_interval_ms},\"pingTimeout\":{ping_timeout_ms},\"upgrades\":[]}}"
            )))
            .await
            .unwrap();

            // Expect the namespace join.
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) if text == "40" => break,
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            }

            if notify {
                ws.send(Message::Text(
                    "42[\"notification\",{\"receivedAt\":1}]".to_string(),
                ))
                .await
                .unwrap();
            }

            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    if text == "2" && answer_pings {
                        let _ = ws.send(Message::Text("3".to_string())).await;
                    }
                }
            }
        });

        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_connect_completes_after_handshake_and_notifies() {
        let endpoint = spawn_server(5000, 4000, true, true).await;
        let transport =
            RealtimeTransport::with_fixed_endpoint(endpoint, TransportConfig::default());
        let mut events = transport.events();

        transport.connect().await.unwrap();
        assert_eq!(transport.health(), LinkHealth::Healthy);

        // Connected was emitted before connect() returned; the
        // notification follows from the read loop.
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Notification { payload } => {
                    assert!(payload.contains("receivedAt"));
                    break;
                }
                TransportEvent::Connected | TransportEvent::HealthChanged { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_missed_pongs_degrade_health() {
        // Tight heartbeat, server never answers pings.
        let endpoint = spawn_server(30, 20, false, false).await;
        let transport =
            RealtimeTransport::with_fixed_endpoint(endpoint, TransportConfig::default());
        let mut events = transport.events();

        transport.connect().await.unwrap();

        let degraded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let TransportEvent::HealthChanged {
                    health: LinkHealth::Degraded,
                } = events.recv().await.unwrap()
                {
                    return;
                }
            }
        })
        .await;
        assert!(degraded.is_ok(), "link never degraded");
        assert_eq!(transport.health(), LinkHealth::Degraded);

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_fails_when_nobody_listens() {
        let transport = RealtimeTransport::with_fixed_endpoint(
            "http://127.0.0.1:1/".to_string(),
            TransportConfig::default(),
        );
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, NimbusError::Transient(_)));
        assert_eq!(transport.health(), LinkHealth::Unknown);
    }
}
