//! Bot process entry point.
//!
//! Loads settings, assembles the bot, and serves until Ctrl-C or a fatal
//! transport failure.

use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use guild_bot::Bot;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bot = match Bot::from_env() {
        Ok(bot) => bot,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let signal = bot.shutdown_signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received");
                signal.request("ctrl-c");
            }
            Err(e) => warn!(error = %e, "could not listen for ctrl-c"),
        }
    });

    match bot.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bot stopped with an error");
            ExitCode::FAILURE
        }
    }
}

