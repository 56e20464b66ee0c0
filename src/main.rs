use anyhow::Context;
use safelimit::{config::EngineConfig, init_server, observability::init_tracing};
use std::env;
use std::process;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/safelimit.yaml".to_string());

    let config = match EngineConfig::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            eprintln!("Usage: safelimit [config_file]");
            process::exit(1);
        }
    };

    init_tracing(config.logging.json).context("failed to initialize tracing")?;

    init_server(config).await.context("safelimit server error")?;

    Ok(())
}
