//! Entry point for the cpulink relay. Loads config, parses args and runs until Ctrl-C.

use std::env;

use anyhow::Context;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

use cpulink::config::{config_path, load_config, parse_args};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let parsed = match parse_args(env::args()) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            return Ok(());
        }
    };
    let path = parsed.config.clone().unwrap_or_else(config_path);
    let mut config = load_config(&path).context("loading relay config")?;
    parsed.apply(&mut config);

    let relay = cpulink::start(&config).await?;
    tokio::signal::ctrl_c().await?;
    relay.shutdown(SHUTDOWN_GRACE).await
}
