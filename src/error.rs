//! Error types for every layer of the bot.
//!
//! Startup errors ([`ConfigError`], [`RegistryError`], [`StartupError`]) are
//! fatal and stop the process before any connection is opened. Everything
//! else is recoverable and stays local to the event that triggered it.

use thiserror::Error;

/// The settings snapshot could not be built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no bot token configured (set DISCORD_TOKEN or `token` in the settings file)")]
    MissingCredential,

    #[error("no storage locator configured (set BOT_DATABASE or `database` in the settings file)")]
    MissingStorageLocator,

    #[error("the default command prefix must not be empty")]
    EmptyPrefix,

    #[error("unsupported storage locator `{0}` (expected `memory:`, `json:<path>` or a .json path)")]
    UnsupportedStorage(String),

    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The per-guild settings store could not serve a request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings store unavailable: {0}")]
    Unavailable(String),

    #[error("settings store at {path} is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("settings lookup timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Capability wiring failed while building the dependency registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("capability `{0}` registered twice")]
    DuplicateCapability(&'static str),

    #[error("capability `{0}` was never registered")]
    MissingCapability(&'static str),
}

/// A command handler failed while executing.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command `{name}` failed: {reason}")]
    Execution { name: String, reason: String },

    #[error("command `{name}` could not reply: {source}")]
    Reply {
        name: String,
        #[source]
        source: HttpError,
    },

    #[error("a command named `{0}` is already registered")]
    DuplicateName(String),
}

/// Errors surfaced by the gateway transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is already connected")]
    AlreadyConnected,

    #[error("transport is not connected")]
    NotConnected,

    #[error("gateway driver failed: {0}")]
    Driver(String),
}

/// Errors from the REST client.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Non-success status from Discord.
    #[error("Discord API error {status} on {route}: {body}")]
    Api {
        status: u16,
        body: String,
        route: String,
    },

    /// Transport / network error.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serde(String),
}

/// Startup failed; nothing was left open.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Commands(#[from] CommandError),

    #[error("failed to open the gateway transport: {0}")]
    Transport(#[from] TransportError),
}
