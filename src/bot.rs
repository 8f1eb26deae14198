//! Process orchestration: wiring, the blocking run loop, and ordered
//! shutdown.
//!
//! Startup is synchronous and all-or-nothing. Nothing touches the network
//! until [`Bot::run`], which connects, waits for the shutdown signal, and
//! tears everything down in reverse order.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::commands::{Command, CommandFramework, FrameworkBuilder, FrameworkOptions};
use crate::config::Settings;
use crate::error::StartupError;
use crate::events::GatewayEvent;
use crate::gateway::{DiscordGateway, EventStream, GatewayConfig, Intents, Transport};
use crate::http::{DiscordHttpClient, Messenger};
use crate::listeners::{ConnectionLogger, EventHub, Listener, Subscription};
use crate::prefix::PrefixResolver;
use crate::registry::{Capability, Registry};
use crate::session::{report_command_error, GatewaySession, SessionInfo};
use crate::shutdown::{ShutdownController, ShutdownSignal};
use crate::store::SettingsStore;

/// How long in-flight commands get to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Bot`]. Collaborators not supplied explicitly are built from
/// the settings.
pub struct BotBuilder<T: Transport> {
    settings: Settings,
    transport: T,
    messenger: Option<Arc<dyn Messenger>>,
    store: Option<SettingsStore>,
    commands: Vec<Arc<dyn Command>>,
    listeners: Vec<Arc<dyn Listener>>,
}

impl BotBuilder<DiscordGateway> {
    /// Builder using the Discord gateway transport.
    pub fn discord(settings: Settings) -> Self {
        let transport = DiscordGateway::new(GatewayConfig {
            token: settings.credential().to_string(),
            intents: Intents::prefix_commands(settings.direct_message_commands_enabled()),
            shard: None,
            auto_reconnect: settings.auto_reconnect(),
        });
        BotBuilder::with_transport(settings, transport)
    }
}

impl<T: Transport + 'static> BotBuilder<T> {
    pub fn with_transport(settings: Settings, transport: T) -> Self {
        Self {
            settings,
            transport,
            messenger: None,
            store: None,
            commands: Vec::new(),
            listeners: vec![Arc::new(ConnectionLogger)],
        }
    }

    pub fn messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    /// Use `store` instead of the one named by the settings' storage locator.
    pub fn store(mut self, store: SettingsStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn command(mut self, command: Arc<dyn Command>) -> Self {
        self.commands.push(command);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build every component and install listeners. Nothing is connected;
    /// on error everything built so far is dropped.
    pub fn build(self) -> Result<Bot<T>, StartupError> {
        let settings = self.settings;

        let shutdown = ShutdownController::new();
        let store = self
            .store
            .unwrap_or_else(|| SettingsStore::from_locator(settings.storage()));
        info!(store = %store.describe(), "settings store ready");

        let registry = Registry::build([
            Capability::Shutdown(shutdown.observer()),
            Capability::Store(store.clone()),
        ])?;

        let resolver = PrefixResolver::new(store, settings.default_prefix());
        let session = GatewaySession::new(self.transport);
        let info = session.info();
        let hub = EventHub::new();

        let messenger = self
            .messenger
            .unwrap_or_else(|| Arc::new(DiscordHttpClient::new(settings.credential())) as Arc<dyn Messenger>);

        let mut builder = FrameworkBuilder::new(FrameworkOptions {
            case_sensitive: settings.case_sensitive_commands(),
            mention_prefix: settings.mention_prefix_enabled(),
            direct_messages: settings.direct_message_commands_enabled(),
            default_help: settings.default_help_enabled(),
        })
        .register_defaults()?;
        for command in self.commands {
            builder = builder.register(command)?;
        }
        let framework = Arc::new(builder.build(
            Arc::new(resolver),
            registry.clone(),
            messenger,
            Arc::clone(&info),
            hub.clone(),
        ));

        let tracker = TaskTracker::new();
        let subscriptions =
            install_listeners(&hub, &info, &framework, &tracker, self.listeners);
        info!(
            listeners = subscriptions.len(),
            commands = framework.catalog().len(),
            "bot assembled"
        );

        Ok(Bot {
            settings,
            shutdown,
            registry,
            session,
            hub,
            tracker,
            subscriptions,
        })
    }
}

/// Install the core hooks, then the additional listener sets. The
/// socket-open hook goes first so it sees the first open.
fn install_listeners(
    hub: &EventHub,
    info: &Arc<SessionInfo>,
    framework: &Arc<CommandFramework>,
    tracker: &TaskTracker,
    listeners: Vec<Arc<dyn Listener>>,
) -> Vec<Subscription> {
    let mut subs = Vec::new();

    let open_info = Arc::clone(info);
    subs.push(hub.subscribe_socket_opened("socket-start", move |_| {
        open_info.mark_socket_opened();
        async {}
    }));

    subs.push(hub.subscribe_command_error("command-error", |failure| async move {
        report_command_error(&failure);
    }));

    let ready_info = Arc::clone(info);
    subs.push(hub.subscribe_gateway("bot-identity", move |event| {
        if let GatewayEvent::Ready(ready) = event.as_ref() {
            ready_info.set_bot_user_id(&ready.user.id);
        }
        async {}
    }));

    let framework = Arc::clone(framework);
    let tracker = tracker.clone();
    subs.push(hub.subscribe_message("commands", move |message| {
        let framework = Arc::clone(&framework);
        let task = tracker.track_future(async move {
            framework.handle_message(message).await;
        });
        async move {
            tokio::spawn(task);
        }
    }));

    for listener in listeners {
        let name = listener.name();
        let installed = listener.install(hub);
        debug!(listener = name, subscriptions = installed.len(), "listener set installed");
        subs.extend(installed);
    }

    subs
}

// ---------------------------------------------------------------------------
// Bot
// ---------------------------------------------------------------------------

/// The assembled process. Call [`Bot::run`] to connect and serve.
pub struct Bot<T: Transport> {
    settings: Settings,
    shutdown: ShutdownController,
    registry: Registry,
    session: GatewaySession<T>,
    hub: EventHub,
    tracker: TaskTracker,
    subscriptions: Vec<Subscription>,
}

impl Bot<DiscordGateway> {
    /// Assemble a bot on the Discord gateway from `settings`.
    pub fn new(settings: Settings) -> Result<Self, StartupError> {
        BotBuilder::discord(settings).build()
    }

    /// Load settings from the settings file and environment, then assemble.
    pub fn from_env() -> Result<Self, StartupError> {
        let settings = Settings::load()?;
        info!(?settings, "configuration loaded");
        Self::new(settings)
    }
}

impl<T: Transport + 'static> Bot<T> {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle for requesting shutdown from outside (signal handlers, tests).
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.observer()
    }

    pub fn session_info(&self) -> Arc<SessionInfo> {
        self.session.info()
    }

    /// Connect, serve until shutdown is signaled, then tear down.
    ///
    /// Returns an error only when the transport could not be opened; in that
    /// case everything is already released.
    pub async fn run(mut self) -> Result<(), StartupError> {
        let events = match self.session.connect().await {
            Ok(events) => events,
            Err(e) => {
                self.shutdown.signal("transport failed to open");
                self.teardown(None).await;
                return Err(e.into());
            }
        };

        info!("bot running");
        let pump = tokio::spawn(pump_events(
            events,
            self.hub.clone(),
            self.shutdown.observer(),
        ));

        self.shutdown.signaled().await;
        self.teardown(Some(pump)).await;
        Ok(())
    }

    /// Close the transport, stop event delivery, let in-flight commands
    /// drain, release listeners, then the controller.
    async fn teardown(mut self, pump: Option<JoinHandle<()>>) {
        info!("shutting down");
        self.session.disconnect().await;

        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        self.tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.tracker.len(),
                "in-flight commands did not finish before shutdown"
            );
        }

        for sub in self.subscriptions.drain(..) {
            sub.cancel();
        }
        drop(self.shutdown);
        info!("shutdown complete");
    }
}

/// Forward transport events to the hub until the stream ends.
///
/// The open event and gateway events are delivered in order; message
/// handling runs on its own tasks. A stream that ends without a shutdown
/// request means the transport gave up, which is fatal.
async fn pump_events(events: EventStream, hub: EventHub, shutdown: ShutdownSignal) {
    while let Ok(event) = events.recv().await {
        trace!(event = event.name(), "gateway event");
        let event = Arc::new(event);
        hub.emit_gateway(Arc::clone(&event)).await;

        match event.as_ref() {
            GatewayEvent::SocketOpened => hub.emit_socket_opened().await,
            GatewayEvent::MessageCreate(message) => hub.emit_message(message.clone()).await,
            _ => {}
        }
    }

    if !shutdown.is_signaled() {
        warn!("transport event stream ended");
        shutdown.request("transport stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use crate::session::SessionState;
    use crate::store::{GuildSettings, MemoryStore};
    use crate::testing::{message_in, ready_as, FakeTransport, RecordingMessenger, TransportProbe};
    use async_trait::async_trait;

    fn settings() -> Settings {
        Settings::new("token", Some("?".into()), "memory:").unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    struct Started {
        probe: TransportProbe,
        messenger: RecordingMessenger,
        info: Arc<SessionInfo>,
        shutdown: ShutdownSignal,
        handle: JoinHandle<Result<(), StartupError>>,
    }

    async fn start(script: Vec<GatewayEvent>, store: SettingsStore) -> Started {
        let transport = FakeTransport::new(script);
        let probe = transport.probe();
        let messenger = RecordingMessenger::default();
        let bot = BotBuilder::with_transport(settings(), transport)
            .messenger(Arc::new(messenger.clone()))
            .store(store)
            .build()
            .unwrap();
        let info = bot.session_info();
        let shutdown = bot.shutdown_signal();
        let handle = tokio::spawn(bot.run());
        Started {
            probe,
            messenger,
            info,
            shutdown,
            handle,
        }
    }

    /// Always fails.
    struct Broken;

    #[async_trait]
    impl Command for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn summary(&self) -> &'static str {
            "Fails"
        }

        async fn execute(&self, _ctx: &crate::commands::CommandContext) -> Result<(), CommandError> {
            Err(CommandError::Execution {
                name: "broken".into(),
                reason: "always".into(),
            })
        }
    }

    /// Asks for shutdown, as an owner-only command would.
    struct Stop;

    #[async_trait]
    impl Command for Stop {
        fn name(&self) -> &'static str {
            "stop"
        }

        fn summary(&self) -> &'static str {
            "Stop the bot"
        }

        async fn execute(&self, ctx: &crate::commands::CommandContext) -> Result<(), CommandError> {
            ctx.registry.shutdown().request("stop command");
            Ok(())
        }
    }

    // -- build -------------------------------------------------------------

    #[test]
    fn build_does_not_connect() {
        let transport = FakeTransport::new(vec![]);
        let probe = transport.probe();
        let bot = BotBuilder::with_transport(settings(), transport)
            .messenger(Arc::new(RecordingMessenger::default()))
            .build()
            .unwrap();
        assert_eq!(probe.connects(), 0);
        assert_eq!(bot.session_info().state(), SessionState::Constructed);
        assert!(bot.session_info().socket_start().is_none());
        assert_eq!(bot.registry().store().describe(), "memory:");
    }

    #[test]
    fn unreadable_settings_abort_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        std::env::set_var("BOT_SETTINGS_FILE", &path);

        let result = Bot::from_env();
        std::env::remove_var("BOT_SETTINGS_FILE");
        assert!(matches!(
            result.err(),
            Some(StartupError::Config(crate::error::ConfigError::Parse { .. }))
        ));
    }

    #[test]
    fn duplicate_command_aborts_startup() {
        let result = BotBuilder::with_transport(settings(), FakeTransport::new(vec![]))
            .messenger(Arc::new(RecordingMessenger::default()))
            .command(Arc::new(Broken))
            .command(Arc::new(Broken))
            .build();
        assert!(matches!(
            result.err(),
            Some(StartupError::Commands(CommandError::DuplicateName(_)))
        ));
    }

    #[test]
    fn builtin_name_clash_aborts_startup() {
        let result = BotBuilder::with_transport(settings(), FakeTransport::new(vec![]))
            .messenger(Arc::new(RecordingMessenger::default()))
            .command(Arc::new(crate::commands::Ping))
            .build();
        assert!(result.is_err());
    }

    // -- run ---------------------------------------------------------------

    #[tokio::test]
    async fn signal_drives_running_to_terminated() {
        let started = start(vec![GatewayEvent::SocketOpened], SettingsStore::new(MemoryStore::default())).await;
        let info = Arc::clone(&started.info);
        wait_for(|| info.state() == SessionState::Running).await;

        assert!(started.shutdown.request("test"));
        started.handle.await.unwrap().unwrap();

        assert_eq!(started.info.state(), SessionState::Terminated);
        assert_eq!(started.probe.connects(), 1);
        assert_eq!(started.probe.disconnects(), 1);

        // Second signal: no error, no second teardown.
        assert!(!started.shutdown.request("again"));
        assert_eq!(started.probe.disconnects(), 1);
    }

    #[tokio::test]
    async fn teardown_releases_the_command_stack() {
        let messenger = Arc::new(RecordingMessenger::default());
        let shared: Arc<dyn Messenger> = messenger.clone();
        let bot = BotBuilder::with_transport(settings(), FakeTransport::new(vec![GatewayEvent::SocketOpened]))
            .messenger(shared)
            .build()
            .unwrap();
        assert!(Arc::strong_count(&messenger) > 1);

        let shutdown = bot.shutdown_signal();
        let info = bot.session_info();
        let handle = tokio::spawn(bot.run());
        wait_for(|| info.state() == SessionState::Running).await;
        shutdown.request("test");
        handle.await.unwrap().unwrap();

        assert_eq!(Arc::strong_count(&messenger), 1);
    }

    #[tokio::test]
    async fn socket_start_survives_reconnects() {
        let started = start(vec![GatewayEvent::SocketOpened], SettingsStore::new(MemoryStore::default())).await;
        let info = Arc::clone(&started.info);
        wait_for(|| info.socket_start().is_some()).await;
        let first = started.info.socket_start();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(started.probe.push(GatewayEvent::SocketOpened).await);
        assert!(started.probe.push(GatewayEvent::SocketOpened).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.info.socket_start(), first);

        started.shutdown.request("test");
        started.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn routes_messages_through_guild_prefixes() {
        let mem = MemoryStore::default();
        mem.insert(
            "G",
            GuildSettings {
                prefix: Some("!".into()),
            },
        )
        .await;
        let started = start(
            vec![
                GatewayEvent::SocketOpened,
                GatewayEvent::MessageCreate(message_in(Some("G"), "c1", "!prefix")),
                GatewayEvent::MessageCreate(message_in(Some("H"), "c2", "?prefix")),
                GatewayEvent::MessageCreate(message_in(Some("G"), "c3", "hello")),
            ],
            SettingsStore::new(mem),
        )
        .await;

        let messenger = started.messenger.clone();
        wait_for(|| messenger.sent().len() == 2).await;
        let mut sent: Vec<(String, String)> = started
            .messenger
            .sent()
            .into_iter()
            .map(|(ch, body)| (ch, body.content.unwrap_or_default()))
            .collect();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                ("c1".to_string(), "The prefix here is `!`".to_string()),
                ("c2".to_string(), "The prefix here is `?`".to_string()),
            ]
        );

        started.shutdown.request("test");
        started.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mention_prefix_after_ready() {
        let started = start(
            vec![
                GatewayEvent::SocketOpened,
                ready_as("555"),
                GatewayEvent::MessageCreate(message_in(Some("G"), "c1", "<@555> prefix")),
            ],
            SettingsStore::new(MemoryStore::default()),
        )
        .await;

        let messenger = started.messenger.clone();
        wait_for(|| messenger.sent().len() == 1).await;
        assert_eq!(started.info.bot_user_id(), Some("555"));

        started.shutdown.request("test");
        started.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn command_failure_does_not_stop_the_bot() {
        let transport = FakeTransport::new(vec![
            GatewayEvent::SocketOpened,
            GatewayEvent::MessageCreate(message_in(Some("G"), "c1", "?broken")),
            GatewayEvent::MessageCreate(message_in(Some("G"), "c1", "?prefix")),
        ]);
        let messenger = RecordingMessenger::default();
        let bot = BotBuilder::with_transport(settings(), transport)
            .messenger(Arc::new(messenger.clone()))
            .command(Arc::new(Broken))
            .build()
            .unwrap();
        let info = bot.session_info();
        let shutdown = bot.shutdown_signal();
        let handle = tokio::spawn(bot.run());

        let m = messenger.clone();
        wait_for(|| m.sent().len() == 1).await;
        assert_eq!(info.state(), SessionState::Running);
        assert!(!shutdown.is_signaled());

        shutdown.request("test");
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn command_can_request_shutdown() {
        let transport = FakeTransport::new(vec![
            GatewayEvent::SocketOpened,
            GatewayEvent::MessageCreate(message_in(Some("G"), "c1", "?stop")),
        ]);
        let probe = transport.probe();
        let bot = BotBuilder::with_transport(settings(), transport)
            .messenger(Arc::new(RecordingMessenger::default()))
            .command(Arc::new(Stop))
            .build()
            .unwrap();
        let info = bot.session_info();

        tokio::time::timeout(Duration::from_secs(2), bot.run())
            .await
            .expect("bot did not stop")
            .unwrap();
        assert_eq!(info.state(), SessionState::Terminated);
        assert_eq!(probe.disconnects(), 1);
    }

    #[tokio::test]
    async fn transport_hang_up_shuts_down() {
        let started = start(vec![GatewayEvent::SocketOpened], SettingsStore::new(MemoryStore::default())).await;
        let info = Arc::clone(&started.info);
        wait_for(|| info.state() == SessionState::Running).await;

        started.probe.hang_up();
        tokio::time::timeout(Duration::from_secs(2), started.handle)
            .await
            .expect("bot did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(started.info.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn failed_connect_reports_startup_error() {
        let bot = BotBuilder::with_transport(settings(), FakeTransport::failing())
            .messenger(Arc::new(RecordingMessenger::default()))
            .build()
            .unwrap();
        let info = bot.session_info();
        let err = bot.run().await.unwrap_err();
        assert!(matches!(err, StartupError::Transport(_)));
        assert_eq!(info.state(), SessionState::Terminated);
    }
}
