//! Entry point for the cpulink agent. Parses args, samples load and serves readers.

use std::env;

use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

use cpulink_agent::config::{parse_args, AgentConfig};
use cpulink_agent::source::SysinfoSource;

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
    let mut config = AgentConfig::from_env();
    parsed.apply(&mut config);

    let agent = cpulink_agent::start(&config, SysinfoSource::new()).await?;
    tokio::signal::ctrl_c().await?;
    agent.shutdown(SHUTDOWN_GRACE).await
}
