//! Typed gateway events.
//!
//! The gateway deserialises dispatch payloads into [`GatewayEvent`] so the
//! rest of the bot pattern-matches on typed data instead of raw JSON.

use tracing::warn;

use crate::types::*;

// ---------------------------------------------------------------------------
// The top-level event enum
// ---------------------------------------------------------------------------

/// An event coming off the gateway transport.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// The WebSocket handshake completed. Fires on every (re)connect, before
    /// any dispatch from that connection.
    SocketOpened,

    /// We've successfully identified, bot is ready.
    Ready(ReadyEvent),

    /// A previous session was resumed after a reconnect.
    Resumed,

    /// A message was created in a channel we can see.
    MessageCreate(Message),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9). `true` when resumable.
    InvalidSession(bool),

    /// Anything we don't have a typed variant for.
    Unknown {
        event_name: Option<String>,
        op: u8,
        data: Option<serde_json::Value>,
    },
}

// ---------------------------------------------------------------------------
// Parsing from a raw GatewayPayload
// ---------------------------------------------------------------------------

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// Never fails; unrecognised or malformed events become
    /// [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t.as_deref(), payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            11 => GatewayEvent::HeartbeatAck,
            _ => GatewayEvent::Unknown {
                event_name: payload.t,
                op: payload.op,
                data: payload.d,
            },
        }
    }

    /// Parse an op-0 DISPATCH event by its `t` name.
    fn parse_dispatch(event_name: Option<&str>, data: Option<serde_json::Value>) -> Self {
        let (Some(name), Some(d)) = (event_name, data.clone()) else {
            return GatewayEvent::Unknown {
                event_name: event_name.map(str::to_string),
                op: 0,
                data,
            };
        };

        let parsed = match name {
            "READY" => serde_json::from_value::<ReadyEvent>(d.clone()).map(GatewayEvent::Ready),
            "RESUMED" => Ok(GatewayEvent::Resumed),
            "MESSAGE_CREATE" => {
                serde_json::from_value::<Message>(d.clone()).map(GatewayEvent::MessageCreate)
            }
            _ => {
                return GatewayEvent::Unknown {
                    event_name: Some(name.to_string()),
                    op: 0,
                    data: Some(d),
                }
            }
        };

        parsed.unwrap_or_else(|e| {
            warn!(event = name, error = %e, "failed to parse dispatch payload");
            GatewayEvent::Unknown {
                event_name: Some(name.to_string()),
                op: 0,
                data: Some(d),
            }
        })
    }

    /// Short name for logging.
    pub fn name(&self) -> &str {
        match self {
            GatewayEvent::SocketOpened => "SOCKET_OPENED",
            GatewayEvent::Ready(_) => "READY",
            GatewayEvent::Resumed => "RESUMED",
            GatewayEvent::MessageCreate(_) => "MESSAGE_CREATE",
            GatewayEvent::HeartbeatAck => "HEARTBEAT_ACK",
            GatewayEvent::HeartbeatRequest => "HEARTBEAT",
            GatewayEvent::Reconnect => "RECONNECT",
            GatewayEvent::InvalidSession(_) => "INVALID_SESSION",
            GatewayEvent::Unknown {
                event_name: Some(name),
                ..
            } => name.as_str(),
            GatewayEvent::Unknown { .. } => "UNKNOWN",
        }
    }
}
