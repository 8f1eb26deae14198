//! Startup settings.
//!
//! [`Settings`] is built once in `main` and never mutated afterwards. Values
//! come from an optional JSON settings file, then environment variables
//! (a `.env` file is honoured through `dotenv`).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Used when neither the settings file nor the environment names a prefix.
pub const DEFAULT_PREFIX: &str = "+";

const DEFAULT_SETTINGS_FILE: &str = "settings.json";

const ENV_SETTINGS_FILE: &str = "BOT_SETTINGS_FILE";
const ENV_TOKEN: &str = "DISCORD_TOKEN";
const ENV_PREFIX: &str = "BOT_PREFIX";
const ENV_DATABASE: &str = "BOT_DATABASE";

// ---------------------------------------------------------------------------
// Storage locator
// ---------------------------------------------------------------------------

/// Where per-guild settings live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocator {
    /// Process-local store, starts empty.
    Memory,
    /// A JSON document on disk.
    JsonFile(PathBuf),
}

impl StorageLocator {
    /// Parse `memory:`, `json:<path>` or a bare `*.json` path.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::MissingStorageLocator);
        }
        if raw == "memory:" || raw == "memory" {
            return Ok(StorageLocator::Memory);
        }
        if let Some(path) = raw.strip_prefix("json:") {
            if path.is_empty() {
                return Err(ConfigError::UnsupportedStorage(raw.to_string()));
            }
            return Ok(StorageLocator::JsonFile(PathBuf::from(path)));
        }
        if raw.ends_with(".json") {
            return Ok(StorageLocator::JsonFile(PathBuf::from(raw)));
        }
        Err(ConfigError::UnsupportedStorage(raw.to_string()))
    }
}

impl std::fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLocator::Memory => write!(f, "memory:"),
            StorageLocator::JsonFile(path) => write!(f, "json:{}", path.display()),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings file
// ---------------------------------------------------------------------------

/// On-disk shape of the settings file. Every key is optional so the
/// environment can fill the gaps.
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    token: Option<String>,
    prefix: Option<String>,
    database: Option<String>,
}

impl SettingsFile {
    fn read(path: &Path) -> Result<Option<Self>, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Immutable snapshot of everything the bot needs to start.
#[derive(Clone)]
pub struct Settings {
    credential: String,
    default_prefix: String,
    storage: StorageLocator,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("credential", &"<redacted>")
            .field("default_prefix", &self.default_prefix)
            .field("storage", &self.storage)
            .finish()
    }
}

impl Settings {
    /// Build a snapshot from explicit values.
    ///
    /// `default_prefix` falls back to [`DEFAULT_PREFIX`] when `None`.
    pub fn new(
        credential: impl Into<String>,
        default_prefix: Option<String>,
        storage_locator: &str,
    ) -> Result<Self, ConfigError> {
        let credential = credential.into();
        if credential.trim().is_empty() {
            return Err(ConfigError::MissingCredential);
        }

        let storage = StorageLocator::parse(storage_locator)?;

        let default_prefix = default_prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        if default_prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }

        Ok(Self {
            credential,
            default_prefix,
            storage,
        })
    }

    /// Load from the settings file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let path = std::env::var(ENV_SETTINGS_FILE)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_FILE));

        let file = SettingsFile::read(&path)?;
        match &file {
            Some(_) => info!(path = %path.display(), "loaded settings file"),
            None => debug!(path = %path.display(), "no settings file, using environment only"),
        }

        Self::merge(file.unwrap_or_default(), |key| std::env::var(key).ok())
    }

    /// Environment values win over file values.
    fn merge(
        file: SettingsFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let credential = env(ENV_TOKEN)
            .or(file.token)
            .ok_or(ConfigError::MissingCredential)?;
        let prefix = env(ENV_PREFIX).or(file.prefix);
        let database = env(ENV_DATABASE)
            .or(file.database)
            .ok_or(ConfigError::MissingStorageLocator)?;

        Self::new(credential, prefix, &database)
    }

    /// Bot token for the gateway and REST API.
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Prefix used when a guild has none of its own.
    pub fn default_prefix(&self) -> &str {
        &self.default_prefix
    }

    pub fn storage(&self) -> &StorageLocator {
        &self.storage
    }

    /// Commands are only accepted inside guilds.
    pub fn direct_message_commands_enabled(&self) -> bool {
        false
    }

    /// Command names match regardless of case. The prefix literal itself is
    /// always matched exactly.
    pub fn case_sensitive_commands(&self) -> bool {
        false
    }

    /// `<@bot>` at the start of a message counts as a prefix.
    pub fn mention_prefix_enabled(&self) -> bool {
        true
    }

    /// Register the built-in `help` command.
    pub fn default_help_enabled(&self) -> bool {
        true
    }

    /// Let the gateway resume or re-identify after a dropped socket.
    pub fn auto_reconnect(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
