//! Gateway session: the transport plus the lifecycle facts the rest of the
//! bot reads (start times, connection state, bot identity).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::commands::CommandFailure;
use crate::error::TransportError;
use crate::gateway::{EventStream, Transport};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Connection lifecycle. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Constructed = 0,
    Connecting = 1,
    Running = 2,
    Disconnecting = 3,
    Terminated = 4,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Constructed,
            1 => SessionState::Connecting,
            2 => SessionState::Running,
            3 => SessionState::Disconnecting,
            _ => SessionState::Terminated,
        }
    }

    /// Whether `self → next` is a legal step.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Constructed, Connecting)
                | (Constructed, Terminated)
                | (Connecting, Running)
                | (Connecting, Disconnecting)
                | (Connecting, Terminated)
                | (Running, Disconnecting)
                | (Disconnecting, Terminated)
        )
    }
}

// ---------------------------------------------------------------------------
// Shared session facts
// ---------------------------------------------------------------------------

/// Read-mostly facts about the session, shared with event handlers and
/// commands.
#[derive(Debug)]
pub struct SessionInfo {
    process_start: DateTime<Utc>,
    socket_start: OnceLock<DateTime<Utc>>,
    bot_user_id: OnceLock<String>,
    state: AtomicU8,
}

impl SessionInfo {
    fn new() -> Self {
        Self {
            process_start: Utc::now(),
            socket_start: OnceLock::new(),
            bot_user_id: OnceLock::new(),
            state: AtomicU8::new(SessionState::Constructed as u8),
        }
    }

    pub fn process_start(&self) -> DateTime<Utc> {
        self.process_start
    }

    /// When the transport first opened. `None` until then; never changes
    /// afterwards, reconnects included.
    pub fn socket_start(&self) -> Option<DateTime<Utc>> {
        self.socket_start.get().copied()
    }

    pub fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.get().map(String::as_str)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transport-open hook. Records the first open and moves a connecting
    /// session to running. Returns `true` for the first open only.
    pub fn mark_socket_opened(&self) -> bool {
        let now = Utc::now();
        let first = self.socket_start.set(now).is_ok();
        if first {
            info!(socket_start = %now, "transport opened");
        } else {
            info!("transport reopened");
        }
        self.transition(SessionState::Connecting, SessionState::Running);
        first
    }

    /// Remember the bot's own user id (from READY). Later calls are ignored.
    pub fn set_bot_user_id(&self, id: &str) {
        let _ = self.bot_user_id.set(id.to_string());
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        debug_assert!(from.can_transition(to));
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn force(&self, to: SessionState) {
        self.state.store(to as u8, Ordering::Release);
    }
}

/// Command-error hook: log and carry on.
pub fn report_command_error(failure: &CommandFailure) {
    error!(
        command = %failure.command,
        guild_id = failure.guild_id.as_deref().unwrap_or("-"),
        channel_id = %failure.channel_id,
        error = %failure.error,
        "command failed"
    );
}

// ---------------------------------------------------------------------------
// GatewaySession
// ---------------------------------------------------------------------------

/// Owns the transport and drives the session state machine.
pub struct GatewaySession<T: Transport> {
    transport: T,
    info: Arc<SessionInfo>,
}

impl<T: Transport> GatewaySession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            info: Arc::new(SessionInfo::new()),
        }
    }

    pub fn info(&self) -> Arc<SessionInfo> {
        Arc::clone(&self.info)
    }

    pub fn state(&self) -> SessionState {
        self.info.state()
    }

    /// Open the transport. Only valid from `Constructed`.
    pub async fn connect(&mut self) -> Result<EventStream, TransportError> {
        if !self
            .info
            .transition(SessionState::Constructed, SessionState::Connecting)
        {
            return Err(TransportError::AlreadyConnected);
        }

        match self.transport.connect().await {
            Ok(events) => Ok(events),
            Err(e) => {
                error!(error = %e, "transport failed to connect");
                self.info.force(SessionState::Terminated);
                Err(e)
            }
        }
    }

    /// Close the transport. Best-effort and idempotent: errors are logged and
    /// the session always ends `Terminated`.
    pub async fn disconnect(&mut self) {
        match self.info.state() {
            SessionState::Terminated | SessionState::Disconnecting => return,
            SessionState::Constructed => {
                self.info.force(SessionState::Terminated);
                return;
            }
            SessionState::Connecting | SessionState::Running => {}
        }

        self.info.force(SessionState::Disconnecting);
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "error while closing transport, ignoring");
        }
        self.info.force(SessionState::Terminated);
        info!("session terminated");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GatewayEvent;
    use crate::testing::FakeTransport;

    static_assertions::assert_impl_all!(SessionInfo: Send, Sync);

    // -- SessionState ------------------------------------------------------

    #[test]
    fn terminated_is_absorbing() {
        use SessionState::*;
        for next in [Constructed, Connecting, Running, Disconnecting, Terminated] {
            assert!(!Terminated.can_transition(next));
        }
    }

    #[test]
    fn happy_path_transitions() {
        use SessionState::*;
        assert!(Constructed.can_transition(Connecting));
        assert!(Connecting.can_transition(Running));
        assert!(Running.can_transition(Disconnecting));
        assert!(Disconnecting.can_transition(Terminated));
        assert!(!Running.can_transition(Connecting));
    }

    // -- SessionInfo -------------------------------------------------------

    #[test]
    fn socket_start_is_set_once() {
        let info = SessionInfo::new();
        assert!(info.socket_start().is_none());
        assert!(info.mark_socket_opened());
        let first = info.socket_start().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!info.mark_socket_opened());
        assert!(!info.mark_socket_opened());
        assert_eq!(info.socket_start(), Some(first));
        assert!(first >= info.process_start());
    }

    #[test]
    fn bot_user_id_is_set_once() {
        let info = SessionInfo::new();
        assert_eq!(info.bot_user_id(), None);
        info.set_bot_user_id("42");
        info.set_bot_user_id("43");
        assert_eq!(info.bot_user_id(), Some("42"));
    }

    // -- GatewaySession ----------------------------------------------------

    #[tokio::test]
    async fn connect_open_disconnect() {
        let transport = FakeTransport::new(vec![GatewayEvent::SocketOpened]);
        let probe = transport.probe();
        let mut session = GatewaySession::new(transport);
        let info = session.info();
        assert_eq!(session.state(), SessionState::Constructed);

        let events = session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        assert!(matches!(events.recv().await, Ok(GatewayEvent::SocketOpened)));
        info.mark_socket_opened();
        assert_eq!(session.state(), SessionState::Running);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(probe.disconnects(), 1);

        session.disconnect().await;
        assert_eq!(probe.disconnects(), 1);
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let mut session = GatewaySession::new(FakeTransport::new(vec![]));
        session.connect().await.unwrap();
        assert!(matches!(
            session.connect().await,
            Err(TransportError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn failed_connect_terminates() {
        let mut session = GatewaySession::new(FakeTransport::failing());
        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), SessionState::Terminated);
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn disconnect_errors_are_swallowed() {
        let transport = FakeTransport::new(vec![]).with_disconnect_error();
        let mut session = GatewaySession::new(transport);
        session.connect().await.unwrap();
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn disconnect_without_connect_terminates() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let mut session = GatewaySession::new(FakeTransport::new(vec![]));
        rt.block_on(session.disconnect());
        assert_eq!(session.state(), SessionState::Terminated);
    }
}
