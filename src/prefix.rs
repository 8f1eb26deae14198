//! Per-guild command prefix resolution.
//!
//! Runs on every inbound message, so a lookup is a single read through a
//! fresh store handle, bounded by a timeout. Any store failure falls back to
//! the default prefix.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::SettingsStore;
use crate::types::Message;

/// Upper bound on a single guild settings lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Byte length of `prefix` when `content` starts with it, exactly.
pub fn prefix_length(content: &str, prefix: &str) -> Option<usize> {
    if prefix.is_empty() {
        return None;
    }
    content.starts_with(prefix).then_some(prefix.len())
}

/// The command-prefix callback slot of the command engine.
///
/// `None` means "not a command", which callers treat as a silent no-op.
#[async_trait]
pub trait PrefixSource: Send + Sync {
    async fn prefix_offset(&self, message: &Message) -> Option<usize>;

    /// The prefix users should type in `guild_id`.
    async fn effective_prefix(&self, guild_id: Option<&str>) -> String;
}

/// Decides where a command starts in a message.
#[derive(Clone, Debug)]
pub struct PrefixResolver {
    store: SettingsStore,
    default_prefix: Arc<str>,
    lookup_timeout: Duration,
}

impl PrefixResolver {
    pub fn new(store: SettingsStore, default_prefix: &str) -> Self {
        Self {
            store,
            default_prefix: Arc::from(default_prefix),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn default_prefix(&self) -> &str {
        &self.default_prefix
    }

    /// Offset of the first byte after the prefix, or `None` when the message
    /// isn't a command invocation.
    ///
    /// A guild's own prefix is tried first; the default prefix is tried when
    /// the guild has none, the store fails, or the guild prefix doesn't match.
    pub async fn resolve_prefix_offset(&self, message: &Message) -> Option<usize> {
        if let Some(guild_id) = message.guild_id.as_deref() {
            if let Some(prefix) = self.guild_prefix(guild_id).await {
                if let Some(offset) = prefix_length(&message.content, &prefix) {
                    return Some(offset);
                }
            }
        }

        prefix_length(&message.content, &self.default_prefix)
    }

    /// The prefix that applies in `guild_id`: its own, or the default.
    pub async fn effective_prefix(&self, guild_id: Option<&str>) -> String {
        match guild_id {
            Some(id) => match self.guild_prefix(id).await {
                Some(prefix) => prefix,
                None => self.default_prefix.to_string(),
            },
            None => self.default_prefix.to_string(),
        }
    }

    /// The guild's configured, non-empty prefix. Failures are logged and read
    /// as "no prefix".
    async fn guild_prefix(&self, guild_id: &str) -> Option<String> {
        let lookup = self.store.lookup_guild_settings(guild_id);
        let result = match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.lookup_timeout)),
        };

        match result {
            Ok(Some(settings)) => settings.custom_prefix().map(str::to_string),
            Ok(None) => {
                debug!(guild_id, "no settings record, using default prefix");
                None
            }
            Err(e) => {
                warn!(guild_id, error = %e, "guild settings lookup failed, using default prefix");
                None
            }
        }
    }
}

#[async_trait]
impl PrefixSource for PrefixResolver {
    async fn prefix_offset(&self, message: &Message) -> Option<usize> {
        self.resolve_prefix_offset(message).await
    }

    async fn effective_prefix(&self, guild_id: Option<&str>) -> String {
        PrefixResolver::effective_prefix(self, guild_id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
