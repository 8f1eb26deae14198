//! Prefix-command engine.
//!
//! Turns a received [`Message`] into a command invocation: finds where the
//! command starts (guild prefix, default prefix, or a mention of the bot),
//! looks the command up by name, and runs it. Failures go to the
//! command-error subscribers on the [`EventHub`]; they never escape.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::CommandError;
use crate::http::Messenger;
use crate::listeners::EventHub;
use crate::prefix::PrefixSource;
use crate::registry::Registry;
use crate::session::SessionInfo;
use crate::types::*;

// ---------------------------------------------------------------------------
// Command trait
// ---------------------------------------------------------------------------

/// A locally-defined command handler.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// One line for the help listing.
    fn summary(&self) -> &'static str;

    async fn execute(&self, ctx: &CommandContext) -> Result<(), CommandError>;
}

/// Name and summary of a registered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub summary: &'static str,
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Everything a command can see while it runs.
pub struct CommandContext {
    pub message: Message,
    /// The command name as typed.
    pub invoked_as: String,
    /// Text after the command name, trimmed.
    pub args: String,
    /// Shared collaborators (shutdown signal, settings store).
    pub registry: Registry,
    pub session: Arc<SessionInfo>,
    pub prefixes: Arc<dyn PrefixSource>,
    pub catalog: Arc<[CommandInfo]>,
    messenger: Arc<dyn Messenger>,
}

impl CommandContext {
    /// Reply to the invoking message.
    pub async fn reply(&self, text: impl Into<String>) -> Result<(), CommandError> {
        let body = CreateMessage::new()
            .content(text)
            .reply_to(self.message.id.clone());
        self.messenger
            .create_message(&self.message.channel_id, &body)
            .await
            .map(|_| ())
            .map_err(|source| CommandError::Reply {
                name: self.invoked_as.clone(),
                source,
            })
    }
}

/// A failed invocation, as delivered to command-error subscribers.
#[derive(Debug)]
pub struct CommandFailure {
    pub command: String,
    pub guild_id: Option<Snowflake>,
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    pub error: CommandError,
}

/// What happened to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Not a command: no prefix, bot author, DM, or unknown name.
    Ignored,
    Executed(&'static str),
    Failed(&'static str),
}

// ---------------------------------------------------------------------------
// Framework
// ---------------------------------------------------------------------------

/// Engine options, taken from the settings snapshot.
#[derive(Debug, Clone, Copy)]
pub struct FrameworkOptions {
    pub case_sensitive: bool,
    pub mention_prefix: bool,
    pub direct_messages: bool,
    pub default_help: bool,
}

/// Collects command registrations before the engine is frozen.
pub struct FrameworkBuilder {
    options: FrameworkOptions,
    commands: Vec<Arc<dyn Command>>,
    lookup: HashMap<String, usize>,
}

impl FrameworkBuilder {
    pub fn new(options: FrameworkOptions) -> Self {
        Self {
            options,
            commands: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.options.case_sensitive {
            name.to_string()
        } else {
            name.to_lowercase()
        }
    }

    /// Register a command under its name and aliases.
    pub fn register(mut self, command: Arc<dyn Command>) -> Result<Self, CommandError> {
        let index = self.commands.len();
        let names: Vec<&str> = std::iter::once(command.name())
            .chain(command.aliases().iter().copied())
            .collect();

        for name in &names {
            if self.lookup.contains_key(&self.key(name)) {
                return Err(CommandError::DuplicateName(name.to_string()));
            }
        }
        for name in names {
            let key = self.key(name);
            self.lookup.insert(key, index);
        }

        debug!(command = command.name(), "command registered");
        self.commands.push(command);
        Ok(self)
    }

    /// Register the built-in commands.
    pub fn register_defaults(self) -> Result<Self, CommandError> {
        let help = self.options.default_help;
        let builder = self
            .register(Arc::new(Ping))?
            .register(Arc::new(Uptime))?
            .register(Arc::new(ShowPrefix))?;
        if help {
            builder.register(Arc::new(Help))
        } else {
            Ok(builder)
        }
    }

    pub fn build(
        self,
        prefixes: Arc<dyn PrefixSource>,
        registry: Registry,
        messenger: Arc<dyn Messenger>,
        session: Arc<SessionInfo>,
        hub: EventHub,
    ) -> CommandFramework {
        let mut catalog: Vec<CommandInfo> = self
            .commands
            .iter()
            .map(|c| CommandInfo {
                name: c.name(),
                aliases: c.aliases(),
                summary: c.summary(),
            })
            .collect();
        catalog.sort_by_key(|c| c.name);

        CommandFramework {
            options: self.options,
            commands: self.commands,
            lookup: self.lookup,
            catalog: catalog.into(),
            prefixes,
            registry,
            messenger,
            session,
            hub,
        }
    }
}

/// Frozen command engine.
pub struct CommandFramework {
    options: FrameworkOptions,
    commands: Vec<Arc<dyn Command>>,
    lookup: HashMap<String, usize>,
    catalog: Arc<[CommandInfo]>,
    prefixes: Arc<dyn PrefixSource>,
    registry: Registry,
    messenger: Arc<dyn Messenger>,
    session: Arc<SessionInfo>,
    hub: EventHub,
}

impl CommandFramework {
    pub fn catalog(&self) -> &[CommandInfo] {
        &self.catalog
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn Command>> {
        let key = if self.options.case_sensitive {
            name.to_string()
        } else {
            name.to_lowercase()
        };
        self.lookup.get(&key).map(|&i| &self.commands[i])
    }

    /// Offset just past a leading `<@id>` / `<@!id>` mention of the bot.
    fn mention_offset(&self, content: &str) -> Option<usize> {
        if !self.options.mention_prefix {
            return None;
        }
        let id = self.session.bot_user_id()?;
        [format!("<@{}>", id), format!("<@!{}>", id)]
            .iter()
            .find(|tag| content.starts_with(tag.as_str()))
            .map(|tag| tag.len())
    }

    /// Handle one received message. Never fails: command errors are routed
    /// to the command-error subscribers.
    pub async fn handle_message(&self, message: Message) -> Dispatch {
        if message.author.bot {
            return Dispatch::Ignored;
        }
        if !message.in_guild() && !self.options.direct_messages {
            return Dispatch::Ignored;
        }

        let offset = match self.mention_offset(&message.content) {
            Some(offset) => offset,
            None => match self.prefixes.prefix_offset(&message).await {
                Some(offset) => offset,
                None => return Dispatch::Ignored,
            },
        };

        let Some(rest) = message.content.get(offset..) else {
            return Dispatch::Ignored;
        };
        let (name, args) = split_invocation(rest);
        if name.is_empty() {
            return Dispatch::Ignored;
        }
        let Some(command) = self.find(name).cloned() else {
            debug!(command = name, "unknown command, ignoring");
            return Dispatch::Ignored;
        };

        let ctx = CommandContext {
            invoked_as: name.to_string(),
            args: args.to_string(),
            message,
            registry: self.registry.clone(),
            session: Arc::clone(&self.session),
            prefixes: Arc::clone(&self.prefixes),
            catalog: Arc::clone(&self.catalog),
            messenger: Arc::clone(&self.messenger),
        };

        info!(
            command = command.name(),
            guild_id = ctx.message.guild_id.as_deref().unwrap_or("-"),
            author = %ctx.message.author.tag(),
            "executing command"
        );

        match command.execute(&ctx).await {
            Ok(()) => Dispatch::Executed(command.name()),
            Err(error) => {
                self.hub
                    .emit_command_error(CommandFailure {
                        command: command.name().to_string(),
                        guild_id: ctx.message.guild_id.clone(),
                        channel_id: ctx.message.channel_id.clone(),
                        message_id: ctx.message.id.clone(),
                        error,
                    })
                    .await;
                Dispatch::Failed(command.name())
            }
        }
    }
}

/// Split `"  name  some args "` into `("name", "some args")`.
fn split_invocation(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (text.trim_end(), ""),
    }
}

// ---------------------------------------------------------------------------
// Built-in commands
// ---------------------------------------------------------------------------

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
    } else {
        format!("{}h {}m {}s", hours, minutes, seconds)
    }
}

/// Replies with the gateway round trip as seen from the message snowflake.
pub struct Ping;

#[async_trait]
impl Command for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn summary(&self) -> &'static str {
        "Check bot latency"
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<(), CommandError> {
        let latency = ctx
            .message
            .snowflake_timestamp_ms()
            .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
            .map(|sent_at| {
                let diff = Utc::now().signed_duration_since(sent_at);
                format!("{}ms", diff.num_milliseconds())
            })
            .unwrap_or_else(|| "unknown".to_string());
        ctx.reply(format!("Pong! Latency: {}", latency)).await
    }
}

/// Process and socket uptime.
pub struct Uptime;

#[async_trait]
impl Command for Uptime {
    fn name(&self) -> &'static str {
        "uptime"
    }

    fn summary(&self) -> &'static str {
        "See how long the bot has been running"
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<(), CommandError> {
        let now = Utc::now();
        let process = now
            .signed_duration_since(ctx.session.process_start())
            .num_seconds();
        let mut text = format!("Program uptime: {}", format_duration(process));
        if let Some(socket_start) = ctx.session.socket_start() {
            let socket = now.signed_duration_since(socket_start).num_seconds();
            text.push_str(&format!("\nSocket uptime: {}", format_duration(socket)));
        }
        ctx.reply(text).await
    }
}

/// Shows the prefix in effect for the current guild.
pub struct ShowPrefix;

#[async_trait]
impl Command for ShowPrefix {
    fn name(&self) -> &'static str {
        "prefix"
    }

    fn summary(&self) -> &'static str {
        "Show the command prefix for this server"
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<(), CommandError> {
        let prefix = ctx
            .prefixes
            .effective_prefix(ctx.message.guild_id.as_deref())
            .await;
        ctx.reply(format!("The prefix here is `{}`", prefix)).await
    }
}

/// Lists registered commands, or describes one.
pub struct Help;

#[async_trait]
impl Command for Help {
    fn name(&self) -> &'static str {
        "help"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["commands"]
    }

    fn summary(&self) -> &'static str {
        "Show available commands"
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<(), CommandError> {
        let wanted = ctx.args.split_whitespace().next();
        let text = match wanted {
            Some(name) => {
                let name = name.to_lowercase();
                let info = ctx
                    .catalog
                    .iter()
                    .find(|c| c.name == name || c.aliases.contains(&name.as_str()))
                    .ok_or_else(|| CommandError::Execution {
                        name: "help".to_string(),
                        reason: format!("no command named `{}`", name),
                    })?;
                let mut text = format!("**{}** — {}", info.name, info.summary);
                if !info.aliases.is_empty() {
                    text.push_str(&format!("\nAliases: {}", info.aliases.join(", ")));
                }
                text
            }
            None => help_text(&ctx.catalog),
        };
        ctx.reply(text).await
    }
}

fn help_text(catalog: &[CommandInfo]) -> String {
    let mut text = String::from("**Commands**\n");
    for info in catalog {
        text.push_str(&format!("`{}` — {}\n", info.name, info.summary));
    }
    text
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
