// =============================================================================
// ws_client.rs — THE EVENT STREAM CONNECTION
// =============================================================================
//
// One WebSocket to the backend. On open we announce ourselves with a
// handshake frame; every text frame after that is parsed into a typed
// ServerMessage and pushed onto the EventBus. Frames with a `type` we don't
// recognise are counted and dropped.
//
// Reconnects use exponential backoff, min(base * 2^attempt, max), and stop
// for good after `max_attempts`. A close with code 1000 is the server saying
// goodbye on purpose: no reconnect. Anything else (a reset, a failed
// connect, a stream that just ends) is treated as abnormal.
//
// Messages sent while we are disconnected are gone. There is no replay.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::event_bus::EventBus;
use crate::models::{ClientHandshake, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// RFC 6455 "normal closure".
pub const NORMAL_CLOSURE: u16 = 1000;

/// Only a normal closure keeps us from reconnecting. `None` means the
/// connection died without a close frame at all.
pub fn should_reconnect(close_code: Option<u16>) -> bool {
    close_code != Some(NORMAL_CLOSURE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before reconnect number `attempt + 1`, or `None` once
    /// `attempt` reaches the cap.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(30_000), 5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up after exhausting the reconnect budget.
    Failed,
}

#[derive(Debug, Default)]
pub struct WsStats {
    pub connections: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnect_attempts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsSnapshot {
    pub state: ConnectionState,
    pub connections: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub parse_errors: u64,
    pub reconnect_attempts: u64,
}

enum SessionEnd {
    Shutdown,
    Closed(Option<u16>),
}

pub struct WsClient {
    url: String,
    client_name: String,
    policy: ReconnectPolicy,
    bus: Arc<EventBus>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<WsStats>,
}

impl WsClient {
    pub fn new(
        url: impl Into<String>,
        client_name: impl Into<String>,
        policy: ReconnectPolicy,
        bus: Arc<EventBus>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            client_name: client_name.into(),
            policy,
            bus,
            state,
            stats: Arc::new(WsStats::default()),
        }
    }

    /// Connect, pump messages, reconnect on abnormal drops. Returns when
    /// shutdown is signalled, the server closes normally, or the reconnect
    /// budget is spent.
    pub async fn run(&self, shutdown: &mut watch::Receiver<bool>) {
        info!(
            url = %self.url,
            max_attempts = self.policy.max_attempts,
            "Event stream client starting"
        );

        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                res = self.connect() => Some(res),
                _ = shutdown.changed() => None,
            };

            let end = match connected {
                None => SessionEnd::Shutdown,
                Some(Ok(stream)) => {
                    attempt = 0;
                    self.session(stream, shutdown).await
                }
                Some(Err(e)) => {
                    warn!(error = %e, url = %self.url, "Event stream connect failed");
                    SessionEnd::Closed(None)
                }
            };

            match end {
                SessionEnd::Shutdown => {
                    info!("Event stream client shutting down");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                SessionEnd::Closed(code) if !should_reconnect(code) => {
                    info!("Event stream closed normally by server — not reconnecting");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                SessionEnd::Closed(code) => {
                    debug!(close_code = ?code, "Event stream closed abnormally");
                }
            }

            let Some(delay) = self.policy.delay_for(attempt) else {
                error!(
                    attempts = attempt,
                    "Event stream reconnect budget exhausted — giving up"
                );
                self.set_state(ConnectionState::Failed);
                return;
            };

            attempt += 1;
            self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnectionState::Reconnecting { attempt });
            warn!(
                attempt = attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Event stream reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("Shutdown during reconnect backoff — timer cancelled");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    async fn connect(&self) -> Result<WsStream> {
        let (stream, _response) = connect_async(self.url.as_str()).await?;
        Ok(stream)
    }

    async fn send_handshake(&self, stream: &mut WsStream) -> Result<()> {
        let json = serde_json::to_string(&ClientHandshake::new(self.client_name.clone()))?;
        stream.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn session(&self, mut stream: WsStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
        info!(url = %self.url, "Event stream connected");

        if let Err(e) = self.send_handshake(&mut stream).await {
            warn!(error = %e, "Failed to send handshake");
            return SessionEnd::Closed(None);
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_text(text),
                        Err(_) => {
                            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                            debug!(len = bytes.len(), "Dropping non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        return SessionEnd::Closed(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Event stream read error");
                        return SessionEnd::Closed(None);
                    }
                    None => return SessionEnd::Closed(None),
                },
                _ = shutdown.changed() => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client shutdown".into(),
                    };
                    if let Err(e) = stream.send(Message::Close(Some(close))).await {
                        debug!(error = %e, "Close frame not delivered");
                    }
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        match ServerMessage::parse(text) {
            Ok(Some(message)) => {
                debug!(kind = %message.kind(), "Event received");
                self.bus.publish(message);
            }
            Ok(None) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(raw = text, "Unknown event type — dropped");
            }
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Malformed event frame — dropped");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn snapshot(&self) -> WsSnapshot {
        let stats = &self.stats;
        WsSnapshot {
            state: *self.state.borrow(),
            connections: stats.connections.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            messages_dropped: stats.messages_dropped.load(Ordering::Relaxed),
            parse_errors: stats.parse_errors.load(Ordering::Relaxed),
            reconnect_attempts: stats.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;
    use tokio::net::TcpListener;

    #[test]
    fn test_backoff_doubles_then_stops_at_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (0..6).map(|a| policy.delay_for(a)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(16)),
                None,
            ]
        );
    }

    #[test]
    fn test_backoff_is_clamped_to_max_delay() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 100);
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for(64), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_only_normal_closure_suppresses_reconnect() {
        assert!(!should_reconnect(Some(1000)));
        assert!(should_reconnect(Some(1006)));
        assert!(should_reconnect(Some(1011)));
        assert!(should_reconnect(None));
    }

    async fn dead_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_gives_up_after_five_reconnects() {
        let bus = Arc::new(EventBus::new(8));
        let policy = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 5);
        let client = WsClient::new(dead_endpoint().await, "test", policy, bus);
        let (_tx, mut rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(10), client.run(&mut rx))
            .await
            .expect("client should give up on its own");

        let snap = client.snapshot();
        assert_eq!(snap.state, ConnectionState::Failed);
        assert_eq!(snap.reconnect_attempts, 5);
        assert_eq!(snap.connections, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_reconnect() {
        let bus = Arc::new(EventBus::new(8));
        let policy = ReconnectPolicy::new(Duration::from_secs(60), Duration::from_secs(60), 5);
        let client = Arc::new(WsClient::new(dead_endpoint().await, "test", policy, bus));
        let (tx, mut rx) = watch::channel(false);

        let runner = Arc::clone(&client);
        let handle = tokio::spawn(async move { runner.run(&mut rx).await });

        for _ in 0..200 {
            if matches!(client.snapshot().state, ConnectionState::Reconnecting { .. }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(client.snapshot().state, ConnectionState::Reconnecting { .. }));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("shutdown should cancel the backoff timer")
            .unwrap();
        assert_eq!(client.snapshot().state, ConnectionState::Disconnected);
        assert_eq!(client.snapshot().reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn test_handshake_dispatch_and_normal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let handshake = match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => t,
                other => panic!("expected handshake text, got {:?}", other),
            };

            ws.send(Message::Text(
                r#"{"type":"metrics_update","data":{"active_proxies":3}}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(r#"{"type":"mystery","x":1}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            })))
            .await
            .unwrap();
            // Let the client's close reply arrive before the socket drops
            let _ = ws.next().await;
            handshake
        });

        let bus = Arc::new(EventBus::new(8));
        let mut metrics_rx = bus.subscribe(MessageKind::MetricsUpdate);
        let client = WsClient::new(url, "archive-test", ReconnectPolicy::default(), Arc::clone(&bus));
        let (_tx, mut rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(5), client.run(&mut rx))
            .await
            .expect("normal close should end the client");

        let handshake: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(handshake["type"], "handshake");
        assert_eq!(handshake["client"], "archive-test");

        match metrics_rx.recv().await.unwrap() {
            ServerMessage::MetricsUpdate { data } => assert_eq!(data.active_proxies, Some(3)),
            other => panic!("unexpected {:?}", other),
        }

        let snap = client.snapshot();
        assert_eq!(snap.state, ConnectionState::Disconnected);
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.messages_dropped, 1);
        assert_eq!(snap.reconnect_attempts, 0);
    }
}
