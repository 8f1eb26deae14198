//! A prefix-command Discord bot host.
//!
//! [`Settings`] are loaded once, [`Bot`] wires the settings store, per-guild
//! prefix resolution, the command engine and the gateway session together,
//! and [`Bot::run`] serves until shutdown is signaled.

pub mod bot;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod listeners;
pub mod prefix;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use bot::{Bot, BotBuilder};
pub use config::{Settings, StorageLocator};
pub use error::StartupError;
pub use prefix::PrefixResolver;
pub use registry::Registry;
pub use session::{GatewaySession, SessionState};
pub use shutdown::{ShutdownController, ShutdownSignal};
pub use store::SettingsStore;
