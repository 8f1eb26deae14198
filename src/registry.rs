//! Shared collaborators handed to command handlers.
//!
//! The registry is built once at startup from a fixed set of capabilities
//! and is read-only afterwards. Lookups are plain typed accessors.

use crate::error::RegistryError;
use crate::shutdown::ShutdownSignal;
use crate::store::SettingsStore;

/// One named singleton offered to commands.
#[derive(Debug, Clone)]
pub enum Capability {
    Shutdown(ShutdownSignal),
    Store(SettingsStore),
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Shutdown(_) => "shutdown",
            Capability::Store(_) => "store",
        }
    }
}

/// Frozen set of shared collaborators. Clones share the same instances.
#[derive(Debug, Clone)]
pub struct Registry {
    shutdown: ShutdownSignal,
    store: SettingsStore,
}

impl Registry {
    /// Freeze `instances` into a registry. Every capability must appear
    /// exactly once.
    pub fn build(instances: impl IntoIterator<Item = Capability>) -> Result<Self, RegistryError> {
        let mut shutdown = None;
        let mut store = None;

        for capability in instances {
            let name = capability.name();
            let duplicate = match capability {
                Capability::Shutdown(s) => shutdown.replace(s).is_some(),
                Capability::Store(s) => store.replace(s).is_some(),
            };
            if duplicate {
                return Err(RegistryError::DuplicateCapability(name));
            }
        }

        Ok(Self {
            shutdown: shutdown.ok_or(RegistryError::MissingCapability("shutdown"))?,
            store: store.ok_or(RegistryError::MissingCapability("store"))?,
        })
    }

    /// Non-owning view of the process shutdown signal.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Guild settings accessor.
    pub fn store(&self) -> &SettingsStore {
        &self.store
    }
}
