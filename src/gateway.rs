//! Gateway (WebSocket) transport for the Discord API.
//!
//! This module owns the WebSocket connection lifecycle:
//!   - connect → receive HELLO → send IDENTIFY (or RESUME)
//!   - background heartbeat task
//!   - sequence number + session_id tracking
//!   - automatic reconnect + RESUME on disconnect
//!   - gateway send rate limiting (120 events / 60s)
//!
//! The rest of the crate only sees the [`Transport`] trait and a stream of
//! [`GatewayEvent`] values.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bitflags::bitflags;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::events::GatewayEvent;
use crate::types::GatewayPayload;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Discord allows at most 120 gateway sends per 60 seconds.
const SEND_BUDGET_MAX: u32 = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Maximum number of consecutive reconnect attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 8;

const EVENT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Stream of events from a connected transport. Ends when the transport
/// stops for good.
pub type EventStream = async_channel::Receiver<GatewayEvent>;

/// The gateway collaborator: something that can connect, deliver events,
/// and disconnect.
#[async_trait]
pub trait Transport: Send {
    /// Start the connection. The returned stream yields
    /// [`GatewayEvent::SocketOpened`] before any dispatch of a connection.
    async fn connect(&mut self) -> Result<EventStream, TransportError>;

    /// Close the connection and stop background work.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

bitflags! {
    /// Gateway intents bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intents: u32 {
        const GUILDS = 1 << 0;
        const GUILD_MESSAGES = 1 << 9;
        const DIRECT_MESSAGES = 1 << 12;
        const MESSAGE_CONTENT = 1 << 15;
    }
}

impl Intents {
    /// What a prefix-command bot needs: guild messages with their content.
    pub fn prefix_commands(direct_messages: bool) -> Self {
        let mut intents = Intents::GUILDS | Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT;
        if direct_messages {
            intents |= Intents::DIRECT_MESSAGES;
        }
        intents
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for connecting to the Discord gateway.
#[derive(Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: Intents,
    /// Optional shard info: `[shard_id, num_shards]`.
    pub shard: Option<[u32; 2]>,
    /// Resume / re-identify after a dropped connection.
    pub auto_reconnect: bool,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("shard", &self.shard)
            .field("auto_reconnect", &self.auto_reconnect)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Gateway send rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window rate limiter for outbound gateway messages.
struct SendRateLimiter {
    timestamps: Vec<Instant>,
    budget: u32,
    window: Duration,
}

impl SendRateLimiter {
    fn new(budget: u32, window: Duration) -> Self {
        Self {
            timestamps: Vec::with_capacity(budget as usize),
            budget,
            window,
        }
    }

    /// How long to wait before the next send, if at all. Does not record.
    fn delay(&self) -> Option<Duration> {
        let now = Instant::now();
        let in_window: Vec<Instant> = self
            .timestamps
            .iter()
            .copied()
            .filter(|&t| now.duration_since(t) < self.window)
            .collect();

        if (in_window.len() as u32) < self.budget {
            return None;
        }

        let oldest = in_window.into_iter().min()?;
        let expires_at = oldest + self.window;
        (expires_at > now).then(|| expires_at - now)
    }

    /// Record a send now and prune old entries.
    fn record(&mut self) {
        let now = Instant::now();
        self.timestamps
            .retain(|&t| now.duration_since(t) < self.window);
        self.timestamps.push(now);
    }
}

// ---------------------------------------------------------------------------
// Internal session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SessionState {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
}

type WsConnection =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsConnection, WsMessage>;
type WsStream = futures_util::stream::SplitStream<WsConnection>;

// ---------------------------------------------------------------------------
// DiscordGateway
// ---------------------------------------------------------------------------

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// [`Transport`] over the Discord WebSocket gateway.
pub struct DiscordGateway {
    config: GatewayConfig,
    driver: Option<Driver>,
}

impl DiscordGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            driver: None,
        }
    }
}

#[async_trait]
impl Transport for DiscordGateway {
    async fn connect(&mut self) -> Result<EventStream, TransportError> {
        if self.driver.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let (event_tx, event_rx) = async_channel::bounded(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(gateway_driver(
            self.config.clone(),
            event_tx,
            cancel.clone(),
        ));

        self.driver = Some(Driver { cancel, handle });
        Ok(event_rx)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let driver = self.driver.take().ok_or(TransportError::NotConnected)?;
        driver.cancel.cancel();

        match tokio::time::timeout(Duration::from_secs(5), driver.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Driver(e.to_string())),
            Err(_) => Err(TransportError::Driver(
                "driver did not stop within 5s".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// The main driver loop (runs in a spawned task)
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DisconnectReason {
    ShouldResume,
    ShouldReidentify,
    Fatal,
    EventChannelClosed,
    Shutdown,
}

async fn gateway_driver(
    config: GatewayConfig,
    event_tx: async_channel::Sender<GatewayEvent>,
    cancel: CancellationToken,
) {
    let session = Arc::new(Mutex::new(SessionState::default()));
    let mut reconnect_attempts: u32 = 0;

    loop {
        let url = {
            let s = session.lock().await;
            gateway_url(s.resume_gateway_url.as_deref())
        };

        info!(url = %url, "connecting to Discord gateway");

        let ws_result = tokio::select! {
            _ = cancel.cancelled() => return,
            res = tokio_tungstenite::connect_async(&url) => res,
        };

        let ws_stream = match ws_result {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect to gateway");
                reconnect_attempts += 1;
                if !wait_before_reconnect(&config, reconnect_attempts, &cancel).await {
                    return;
                }
                continue;
            }
        };

        info!("WebSocket connected");
        if event_tx.send(GatewayEvent::SocketOpened).await.is_err() {
            return;
        }

        let (ws_write, mut ws_read) = ws_stream.split();
        let ws_write = Arc::new(Mutex::new(ws_write));
        let rate_limiter = Arc::new(Mutex::new(SendRateLimiter::new(
            SEND_BUDGET_MAX,
            SEND_BUDGET_WINDOW,
        )));

        // 1. HELLO
        let heartbeat_interval = match read_hello_from_stream(&mut ws_read).await {
            Ok(interval) => interval,
            Err(e) => {
                error!(error = %e, "failed to read HELLO from gateway");
                reconnect_attempts += 1;
                if !wait_before_reconnect(&config, reconnect_attempts, &cancel).await {
                    return;
                }
                continue;
            }
        };
        info!(interval_ms = heartbeat_interval, "received HELLO");

        // 2. IDENTIFY or RESUME
        let handshake = {
            let s = session.lock().await;
            match (&s.session_id, s.sequence) {
                (Some(session_id), Some(seq)) => {
                    json!({
                        "op": 6,
                        "d": { "token": config.token, "session_id": session_id, "seq": seq }
                    })
                }
                _ => identify_payload(&config),
            }
        };
        let op = handshake["op"].as_u64().unwrap_or_default();
        if let Err(e) = rate_limited_send(&ws_write, &rate_limiter, &handshake).await {
            error!(error = %e, op, "failed to send handshake");
            reconnect_attempts += 1;
            if !wait_before_reconnect(&config, reconnect_attempts, &cancel).await {
                return;
            }
            continue;
        }
        info!(op, "sent handshake");
        reconnect_attempts = 0;

        // 3. Heartbeat
        let hb_cancel = cancel.child_token();
        let heartbeat_handle = tokio::spawn(heartbeat_task(
            heartbeat_interval,
            Arc::clone(&ws_write),
            Arc::clone(&session),
            Arc::clone(&rate_limiter),
            hb_cancel.clone(),
        ));

        // 4. Read loop
        let disconnect_reason = read_loop(
            &mut ws_read,
            &ws_write,
            &rate_limiter,
            &event_tx,
            &session,
            &cancel,
        )
        .await;

        // 5. Cleanup
        hb_cancel.cancel();
        heartbeat_handle.abort();
        {
            let mut w = ws_write.lock().await;
            let _ = w.send(WsMessage::Close(None)).await;
        }

        match disconnect_reason {
            DisconnectReason::Shutdown => {
                info!("gateway driver stopped");
                return;
            }
            DisconnectReason::Fatal => {
                error!("fatal gateway error, shutting down");
                return;
            }
            DisconnectReason::EventChannelClosed => {
                info!("event channel closed, shutting down gateway driver");
                return;
            }
            DisconnectReason::ShouldResume => {
                info!("will attempt RESUME");
            }
            DisconnectReason::ShouldReidentify => {
                info!("session invalidated, will re-IDENTIFY");
                let mut s = session.lock().await;
                s.session_id = None;
                s.sequence = None;
            }
        }

        reconnect_attempts += 1;
        if !wait_before_reconnect(&config, reconnect_attempts, &cancel).await {
            return;
        }
    }
}

/// Back off before the next attempt. `false` means stop the driver.
async fn wait_before_reconnect(
    config: &GatewayConfig,
    attempt: u32,
    cancel: &CancellationToken,
) -> bool {
    if !config.auto_reconnect {
        warn!("auto-reconnect disabled, gateway driver stopping");
        return false;
    }
    if attempt > MAX_RECONNECT_ATTEMPTS {
        error!("exceeded max reconnect attempts, giving up");
        return false;
    }
    let backoff = backoff_delay(attempt);
    warn!(
        delay_ms = backoff.as_millis() as u64,
        attempt, "reconnecting after backoff"
    );
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(backoff) => true,
    }
}

fn gateway_url(resume_url: Option<&str>) -> String {
    let url = resume_url.unwrap_or(DEFAULT_GATEWAY_URL);
    if url.contains("v=10") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&v=10&encoding=json", url)
    } else {
        format!("{}/?v=10&encoding=json", url.trim_end_matches('/'))
    }
}

fn identify_payload(config: &GatewayConfig) -> serde_json::Value {
    let mut identify = json!({
        "op": 2,
        "d": {
            "token": config.token,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "guild-bot",
                "device": "guild-bot"
            },
            "intents": config.intents.bits(),
        }
    });
    if let Some([id, count]) = config.shard {
        identify["d"]["shard"] = json!([id, count]);
    }
    identify
}

async fn heartbeat_task(
    interval_ms: u64,
    ws_write: Arc<Mutex<WsSink>>,
    session: Arc<Mutex<SessionState>>,
    rate_limiter: Arc<Mutex<SendRateLimiter>>,
    cancel: CancellationToken,
) {
    // First beat after `interval * jitter`, jitter ∈ [0, 1).
    let jitter = rand::random::<f64>();
    let first_delay = Duration::from_millis((interval_ms as f64 * jitter) as u64);
    tokio::select! {
        _ = tokio::time::sleep(first_delay) => {}
        _ = cancel.cancelled() => return,
    }

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let seq = session.lock().await.sequence;
                let heartbeat = json!({"op": 1, "d": seq});
                if let Err(e) = rate_limited_send(&ws_write, &rate_limiter, &heartbeat).await {
                    warn!(error = %e, "heartbeat send failed, stopping heartbeat task");
                    return;
                }
                debug!(seq = ?seq, "sent heartbeat");
            }
            _ = cancel.cancelled() => {
                debug!("heartbeat task cancelled");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    ws_read: &mut WsStream,
    ws_write: &Arc<Mutex<WsSink>>,
    rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    event_tx: &async_channel::Sender<GatewayEvent>,
    session: &Arc<Mutex<SessionState>>,
    cancel: &CancellationToken,
) -> DisconnectReason {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DisconnectReason::Shutdown,
            msg = ws_read.next() => msg,
        };

        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read error");
                return DisconnectReason::ShouldResume;
            }
            None => {
                info!("WebSocket stream ended");
                return DisconnectReason::ShouldResume;
            }
        };

        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(frame) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                warn!(close_code = ?code, "WebSocket closed by server");
                return code.map(close_code_reason).unwrap_or(DisconnectReason::ShouldResume);
            }
            // Ping/Pong/Binary: ignore.
            _ => continue,
        };

        let payload: GatewayPayload = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to parse gateway payload");
                continue;
            }
        };

        if let Some(s) = payload.s {
            session.lock().await.sequence = Some(s);
        }

        let event = GatewayEvent::from_payload(payload);

        match &event {
            GatewayEvent::Ready(ready) => {
                let mut sess = session.lock().await;
                sess.session_id = Some(ready.session_id.clone());
                sess.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                info!(
                    session_id = %ready.session_id,
                    user = %ready.user.tag(),
                    "gateway READY"
                );
            }
            GatewayEvent::HeartbeatRequest => {
                let seq = session.lock().await.sequence;
                let heartbeat = json!({"op": 1, "d": seq});
                if let Err(e) = rate_limited_send(ws_write, rate_limiter, &heartbeat).await {
                    warn!(error = %e, "failed to send requested heartbeat");
                }
                // Internal plumbing, not forwarded.
                continue;
            }
            GatewayEvent::HeartbeatAck => {
                debug!("heartbeat acknowledged");
            }
            GatewayEvent::Reconnect => {
                info!("gateway requested reconnect (op 7)");
                return DisconnectReason::ShouldResume;
            }
            GatewayEvent::InvalidSession(resumable) => {
                warn!(resumable, "session invalidated (op 9)");
                return if *resumable {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    DisconnectReason::ShouldResume
                } else {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    DisconnectReason::ShouldReidentify
                };
            }
            _ => {}
        }

        if event_tx.send(event).await.is_err() {
            info!("event channel closed by consumer");
            return DisconnectReason::EventChannelClosed;
        }
    }
}

/// Map a server close code to what the driver should do next.
fn close_code_reason(code: u16) -> DisconnectReason {
    match code {
        4004 => {
            error!("authentication failed (close 4004)");
            DisconnectReason::Fatal
        }
        4010 | 4011 | 4012 | 4013 | 4014 => {
            error!(code, "unrecoverable gateway close");
            DisconnectReason::Fatal
        }
        // Invalid seq or session timed out.
        4007 | 4009 => DisconnectReason::ShouldReidentify,
        _ => DisconnectReason::ShouldResume,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read the HELLO payload and return the heartbeat interval in ms.
async fn read_hello_from_stream(stream: &mut WsStream) -> Result<u64, String> {
    let msg = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .map_err(|_| "timed out waiting for HELLO".to_string())?
        .ok_or_else(|| "stream ended before HELLO".to_string())?
        .map_err(|e| format!("WS error reading HELLO: {}", e))?;

    let text = match msg {
        WsMessage::Text(t) => t,
        other => return Err(format!("expected text message for HELLO, got {:?}", other)),
    };

    let payload: GatewayPayload =
        serde_json::from_str(&text).map_err(|e| format!("failed to parse HELLO: {}", e))?;
    hello_interval(&payload)
}

fn hello_interval(payload: &GatewayPayload) -> Result<u64, String> {
    if payload.op != 10 {
        return Err(format!("expected op 10 (HELLO), got op {}", payload.op));
    }
    payload
        .d
        .as_ref()
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| "HELLO missing heartbeat_interval".to_string())
}

/// Send a JSON payload on the WebSocket, respecting the send rate limiter.
async fn rate_limited_send(
    ws_write: &Arc<Mutex<WsSink>>,
    rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    payload: &serde_json::Value,
) -> Result<(), String> {
    loop {
        let delay = rate_limiter.lock().await.delay();
        match delay {
            Some(d) => {
                debug!(
                    delay_ms = d.as_millis() as u64,
                    "gateway send rate-limited, waiting"
                );
                tokio::time::sleep(d).await;
            }
            None => break,
        }
    }
    rate_limiter.lock().await.record();

    let text = serde_json::to_string(payload).map_err(|e| e.to_string())?;
    let mut w = ws_write.lock().await;
    w.send(WsMessage::Text(text))
        .await
        .map_err(|e| format!("WS send error: {}", e))
}

/// Exponential backoff with jitter, capped at 60 s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64 * 2u64.saturating_pow(attempt.min(6));
    let jitter = (rand::random::<f64>() * 0.5 + 0.75) * base_ms as f64;
    Duration::from_millis(jitter.min(60_000.0) as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            token: "tok".into(),
            intents: Intents::prefix_commands(false),
            shard: None,
            auto_reconnect: true,
        }
    }

    // -- Intents -----------------------------------------------------------

    #[test]
    fn prefix_command_intents() {
        let intents = Intents::prefix_commands(false);
        assert!(intents.contains(Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT));
        assert!(!intents.contains(Intents::DIRECT_MESSAGES));
        assert!(Intents::prefix_commands(true).contains(Intents::DIRECT_MESSAGES));
        assert_eq!(intents.bits(), 1 | 512 | 32768);
    }

    // -- payloads ----------------------------------------------------------

    #[test]
    fn identify_carries_token_and_intents() {
        let identify = identify_payload(&config());
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "tok");
        assert_eq!(identify["d"]["intents"], 1 | 512 | 32768);
        assert!(identify["d"].get("shard").is_none());
    }

    #[test]
    fn identify_includes_shard() {
        let mut cfg = config();
        cfg.shard = Some([1, 4]);
        assert_eq!(identify_payload(&cfg)["d"]["shard"], json!([1, 4]));
    }

    #[test]
    fn hello_interval_extraction() {
        let hello = GatewayPayload {
            op: 10,
            d: Some(json!({ "heartbeat_interval": 41250 })),
            s: None,
            t: None,
        };
        assert_eq!(hello_interval(&hello), Ok(41250));

        let wrong = GatewayPayload { op: 0, ..hello };
        assert!(hello_interval(&wrong).is_err());
    }

    #[test]
    fn gateway_url_appends_version() {
        assert_eq!(gateway_url(None), DEFAULT_GATEWAY_URL);
        assert_eq!(
            gateway_url(Some("wss://resume.discord.gg")),
            "wss://resume.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_url(Some("wss://resume.discord.gg/?compress=x")),
            "wss://resume.discord.gg/?compress=x&v=10&encoding=json"
        );
    }

    #[test]
    fn close_codes() {
        assert!(matches!(close_code_reason(4004), DisconnectReason::Fatal));
        assert!(matches!(close_code_reason(4014), DisconnectReason::Fatal));
        assert!(matches!(
            close_code_reason(4009),
            DisconnectReason::ShouldReidentify
        ));
        assert!(matches!(close_code_reason(1001), DisconnectReason::ShouldResume));
    }

    #[test]
    fn debug_redacts_token() {
        assert!(!format!("{:?}", config()).contains("tok\""));
    }

    // -- SendRateLimiter ---------------------------------------------------

    #[test]
    fn rate_limiter_allows_until_budget() {
        let mut rl = SendRateLimiter::new(2, Duration::from_secs(60));
        assert!(rl.delay().is_none());
        rl.record();
        assert!(rl.delay().is_none());
        rl.record();
        let delay = rl.delay().expect("budget exhausted");
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_capped() {
        for attempt in 0..20 {
            assert!(backoff_delay(attempt) <= Duration::from_secs(60));
        }
        assert!(backoff_delay(1) >= Duration::from_millis(1500));
    }

    // -- DiscordGateway ----------------------------------------------------

    #[tokio::test]
    async fn disconnect_before_connect_is_an_error() {
        let mut gw = DiscordGateway::new(config());
        assert!(matches!(
            gw.disconnect().await,
            Err(TransportError::NotConnected)
        ));
    }
}
