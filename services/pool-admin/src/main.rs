//! Identity pool administration
//!
//! Inspects and maintains the identity store shared by dispatch clients:
//! imports credentials, prints pool state, clears locks and removes dead
//! identities. Every command prints one JSON document on stdout.

mod command;

use anyhow::{Context, Result};
use common::TokioClock;
use dispatch_client::Settings;
use tracing::info;

use crate::command::Command;

#[tokio::main]
async fn main() -> Result<()> {
    common::telemetry::init("warn")?;

    // CLI: --config <path> anywhere, the rest is the command
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let cli_config_path = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = args.remove(i + 1);
            args.remove(i);
            Some(path)
        }
        Some(_) => anyhow::bail!("--config needs a path"),
        None => None,
    };

    let command = Command::parse(&args).map_err(|e| anyhow::anyhow!("{e}\n\n{}", command::USAGE))?;

    let config_path = Settings::resolve_path(cli_config_path.as_deref());
    let settings = if config_path.exists() {
        Settings::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults");
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        settings.validate()?;
        settings
    };
    info!(store = %settings.store.path.display(), command = command.name(), "opening pool");

    let pool = settings
        .open_pool(TokioClock::shared())
        .with_context(|| format!("failed to open store {}", settings.store.path.display()))?;

    let output = command.run(&pool).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
