//! cpulink_agent: samples processor load and publishes it to TCP readers.

pub mod config;
pub mod sampler;
pub mod server;
pub mod shutdown;
pub mod source;
pub mod state;

use std::net::SocketAddr;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::info;

use crate::config::AgentConfig;
use crate::source::LoadSource;
use crate::state::AppState;

/// A running agent: sampler loop plus publish server.
pub struct AgentHandle {
    local_addr: SocketAddr,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Binds the publish port and spawns the sampler and accept loops.
/// A bind failure is fatal for the agent and nothing is spawned.
pub async fn start<S: LoadSource>(config: &AgentConfig, source: S) -> anyhow::Result<AgentHandle> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind publish port {}", config.listen))?;
    let local_addr = listener.local_addr()?;

    let state = AppState::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler = sampler::spawn_sampler(
        state.clone(),
        source,
        config.interval,
        shutdown_rx.clone(),
    );
    let server = tokio::spawn(server::serve(
        listener,
        state.clone(),
        config.interval,
        shutdown_rx,
    ));
    info!(%local_addr, "agent publishing load");

    Ok(AgentHandle {
        local_addr,
        state,
        shutdown_tx,
        tasks: vec![sampler, server],
    })
}

impl AgentHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Broadcasts cancellation and waits up to `grace` for every loop to exit.
    pub async fn shutdown(self, grace: Duration) -> anyhow::Result<()> {
        self.shutdown_tx.send_replace(true);
        let tasks = self.tasks;
        let joined = time::timeout(grace, async move {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if joined.is_err() {
            bail!("agent did not stop within {grace:?}");
        }
        info!("agent stopped");
        Ok(())
    }
}
