//! In-process fakes for the transport and messenger seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{HttpError, TransportError};
use crate::events::GatewayEvent;
use crate::gateway::{EventStream, Transport};
use crate::http::Messenger;
use crate::types::*;

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProbeInner {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    sender: Mutex<Option<async_channel::Sender<GatewayEvent>>>,
}

/// Observes and drives a [`FakeTransport`] from the test body.
#[derive(Clone, Default)]
pub struct TransportProbe {
    inner: Arc<ProbeInner>,
}

impl TransportProbe {
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// Push an event into the live connection. `false` when not connected.
    pub async fn push(&self, event: GatewayEvent) -> bool {
        let sender = self.inner.sender.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Drop the sending side, as a transport that gave up would.
    pub fn hang_up(&self) {
        self.inner.sender.lock().unwrap().take();
    }
}

/// Transport that replays scripted events and stays open until
/// disconnected.
pub struct FakeTransport {
    script: Vec<GatewayEvent>,
    fail_connect: bool,
    fail_disconnect: bool,
    probe: TransportProbe,
}

impl FakeTransport {
    pub fn new(script: Vec<GatewayEvent>) -> Self {
        Self {
            script,
            fail_connect: false,
            fail_disconnect: false,
            probe: TransportProbe::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::new(vec![])
        }
    }

    pub fn with_disconnect_error(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    pub fn probe(&self) -> TransportProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&mut self) -> Result<EventStream, TransportError> {
        if self.fail_connect {
            return Err(TransportError::Driver("connection refused".into()));
        }
        self.probe.inner.connects.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = async_channel::unbounded();
        for event in self.script.drain(..) {
            let _ = tx.send(event).await;
        }
        *self.probe.inner.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.probe.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.probe.hang_up();
        if self.fail_disconnect {
            return Err(TransportError::Driver("socket already closed".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingMessenger
// ---------------------------------------------------------------------------

/// Messenger that records every message instead of sending it.
#[derive(Clone, Default)]
pub struct RecordingMessenger {
    sent: Arc<Mutex<Vec<(String, CreateMessage)>>>,
}

impl RecordingMessenger {
    pub fn sent(&self) -> Vec<(String, CreateMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn contents(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|(_, body)| body.content)
            .collect()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn create_message(
        &self,
        channel_id: &str,
        body: &CreateMessage,
    ) -> Result<Message, HttpError> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), body.clone()));
        Ok(message_in(None, channel_id, body.content.as_deref().unwrap_or("")))
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn user(id: &str, bot: bool) -> User {
    User {
        id: id.to_string(),
        username: format!("user{}", id),
        discriminator: None,
        bot,
        global_name: None,
    }
}

pub fn message_in(guild_id: Option<&str>, channel_id: &str, content: &str) -> Message {
    Message {
        id: "175928847299117063".to_string(),
        channel_id: channel_id.to_string(),
        guild_id: guild_id.map(str::to_string),
        author: user("100", false),
        content: content.to_string(),
        timestamp: String::new(),
    }
}

pub fn ready_as(bot_id: &str) -> GatewayEvent {
    GatewayEvent::Ready(ReadyEvent {
        v: 10,
        user: user(bot_id, true),
        session_id: "session".to_string(),
        resume_gateway_url: "wss://resume.example".to_string(),
        guilds: Vec::new(),
    })
}
