//! WeCom Relay - Main entry point.

use anyhow::{Context, Result};
use relay_common::config::Config;
use relay_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.log_level, &config.log_format);

    tracing::info!("WeCom Relay v{}", env!("CARGO_PKG_VERSION"));

    // Run both servers until shutdown
    wecom_relay::run(config).await?;
    Ok(())
}
