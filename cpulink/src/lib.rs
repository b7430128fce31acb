//! cpulink: relays agent load samples to viewers and launches a program when
//! the rolling average crosses a configured trigger.

pub mod average;
pub mod config;
pub mod ingest;
pub mod launcher;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod status;

use std::net::SocketAddr;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::info;

use crate::average::SharedAverage;
use crate::config::RelayConfig;
use crate::launcher::Launcher;
use crate::status::{ProcessStatusSource, StatusChange, StatusMonitor};

/// A running relay: agent link, viewer server, launcher and optional status monitor.
pub struct RelayHandle {
    local_addr: SocketAddr,
    average: SharedAverage,
    launcher: Launcher,
    status: Option<StatusMonitor>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Binds the viewer port and spawns every relay loop. A bind failure is fatal
/// for the relay and nothing is spawned.
pub async fn start(config: &RelayConfig) -> anyhow::Result<RelayHandle> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind viewer port {}", config.listen))?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let average = SharedAverage::new(config.window);
    let launcher = Launcher::new(average.clone(), config.launcher_timing(), shutdown_rx.clone());

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(ingest::run_ingest(
        config.sampler.clone(),
        average.clone(),
        config.reconnect_backoff(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(server::serve(
        listener,
        average.clone(),
        launcher.clone(),
        shutdown_rx,
    )));

    let status = config.watch.as_ref().map(|name| {
        let (tx, rx) = mpsc::channel(16);
        tasks.push(tokio::spawn(log_status_changes(rx)));
        StatusMonitor::spawn(name.clone(), ProcessStatusSource::new(), config.status_poll(), tx)
    });

    info!(%local_addr, sampler = %config.sampler, window = config.window, "relay serving viewers");
    Ok(RelayHandle {
        local_addr,
        average,
        launcher,
        status,
        shutdown_tx,
        tasks,
    })
}

// Ends once the monitor drops its sender.
async fn log_status_changes(mut rx: mpsc::Receiver<StatusChange>) {
    while let Some(change) = rx.recv().await {
        info!(
            name = %change.name,
            old = %change.old,
            new = %change.new,
            class = ?change.new.class(),
            "watched service status"
        );
    }
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn average(&self) -> &SharedAverage {
        &self.average
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    /// Broadcasts cancellation and waits up to `grace` for every loop, the
    /// launcher and any watched program to finish.
    pub async fn shutdown(self, grace: Duration) -> anyhow::Result<()> {
        self.shutdown_tx.send_replace(true);
        let Self {
            launcher,
            status,
            tasks,
            ..
        } = self;
        let joined = time::timeout(grace, async move {
            if let Some(status) = status {
                status.join().await;
            }
            launcher.shutdown().await;
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if joined.is_err() {
            bail!("relay did not stop within {grace:?}");
        }
        info!("relay stopped");
        Ok(())
    }
}
