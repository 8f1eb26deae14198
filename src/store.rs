//! Read access to persisted per-guild settings.
//!
//! The bot never caches guild settings and never writes them: every lookup
//! opens a fresh [`StoreHandle`] through [`SettingsStore::open_context`],
//! reads once, and drops the handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_lock::RwLock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StorageLocator;
use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-guild configuration as persisted by the settings backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuildSettings {
    #[serde(default)]
    pub prefix: Option<String>,
}

impl GuildSettings {
    /// The guild's own prefix, if it has a usable one.
    pub fn custom_prefix(&self) -> Option<&str> {
        self.prefix.as_deref().filter(|p| !p.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Backend traits
// ---------------------------------------------------------------------------

/// A short-lived read handle. Used by a single request, then dropped.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    async fn guild_settings(&self, guild_id: &str) -> Result<Option<GuildSettings>, StoreError>;
}

/// A persistence backend for guild settings.
#[async_trait]
pub trait GuildSettingsBackend: Send + Sync {
    /// Open a new, independent handle.
    async fn open_context(&self) -> Result<Box<dyn StoreHandle>, StoreError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Accessor
// ---------------------------------------------------------------------------

/// Cheap-to-clone accessor shared by the prefix resolver and commands.
#[derive(Clone)]
pub struct SettingsStore {
    backend: Arc<dyn GuildSettingsBackend>,
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("backend", &self.backend.describe())
            .finish()
    }
}

impl SettingsStore {
    pub fn new(backend: impl GuildSettingsBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Build the backend named by `locator`. Nothing is opened yet.
    pub fn from_locator(locator: &StorageLocator) -> Self {
        match locator {
            StorageLocator::Memory => Self::new(MemoryStore::default()),
            StorageLocator::JsonFile(path) => Self::new(JsonStore::new(path.clone())),
        }
    }

    /// Open a fresh handle. Two calls never share a handle.
    pub async fn open_context(&self) -> Result<Box<dyn StoreHandle>, StoreError> {
        self.backend.open_context().await
    }

    /// Open a handle and read one guild's settings with it.
    pub async fn lookup_guild_settings(
        &self,
        guild_id: &str,
    ) -> Result<Option<GuildSettings>, StoreError> {
        let handle = self.open_context().await?;
        handle.guild_settings(guild_id).await
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

type GuildMap = HashMap<String, GuildSettings>;

/// Process-local backend. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    guilds: Arc<RwLock<GuildMap>>,
}

impl MemoryStore {
    /// Seed or replace a guild's record.
    pub async fn insert(&self, guild_id: impl Into<String>, settings: GuildSettings) {
        self.guilds.write().await.insert(guild_id.into(), settings);
    }
}

struct MemoryHandle {
    guilds: Arc<RwLock<GuildMap>>,
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    async fn guild_settings(&self, guild_id: &str) -> Result<Option<GuildSettings>, StoreError> {
        Ok(self.guilds.read().await.get(guild_id).cloned())
    }
}

#[async_trait]
impl GuildSettingsBackend for MemoryStore {
    async fn open_context(&self) -> Result<Box<dyn StoreHandle>, StoreError> {
        Ok(Box::new(MemoryHandle {
            guilds: Arc::clone(&self.guilds),
        }))
    }

    fn describe(&self) -> String {
        "memory:".to_string()
    }
}

// ---------------------------------------------------------------------------
// JSON document backend
// ---------------------------------------------------------------------------

/// On-disk document: `{ "guilds": { "<guild id>": { "prefix": "!" } } }`.
#[derive(Debug, Default, Deserialize, Serialize)]
struct GuildDocument {
    #[serde(default)]
    guilds: GuildMap,
}

/// Backend reading a JSON document. Each handle is a snapshot of the file as
/// it was when the handle was opened; a missing file reads as "no guilds".
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

struct SnapshotHandle {
    guilds: GuildMap,
}

#[async_trait]
impl StoreHandle for SnapshotHandle {
    async fn guild_settings(&self, guild_id: &str) -> Result<Option<GuildSettings>, StoreError> {
        Ok(self.guilds.get(guild_id).cloned())
    }
}

#[async_trait]
impl GuildSettingsBackend for JsonStore {
    async fn open_context(&self) -> Result<Box<dyn StoreHandle>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "guild settings file absent");
                return Ok(Box::new(SnapshotHandle {
                    guilds: GuildMap::new(),
                }));
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let doc: GuildDocument =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
                path: self.path.display().to_string(),
                source,
            })?;

        Ok(Box::new(SnapshotHandle { guilds: doc.guilds }))
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
