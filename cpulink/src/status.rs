//! Edge-triggered status monitor for a named service or process.

use std::ffi::OsStr;
use std::fmt;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::shutdown::cancelled;

pub const DEFAULT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    StopPending,
    Running,
    StartPending,
    Unknown,
}

/// The coarse signal the relay acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    StoppedLike,
    RunningLike,
    Unknown,
}

impl ServiceStatus {
    pub fn class(self) -> StatusClass {
        match self {
            ServiceStatus::Stopped | ServiceStatus::StopPending => StatusClass::StoppedLike,
            ServiceStatus::Running | ServiceStatus::StartPending => StatusClass::RunningLike,
            ServiceStatus::Unknown => StatusClass::Unknown,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::StopPending => "stop-pending",
            ServiceStatus::Running => "running",
            ServiceStatus::StartPending => "start-pending",
            ServiceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Something that can report the status of a named service. `None` means the
/// status could not be determined right now.
pub trait StatusSource: Send + 'static {
    fn current_status(&mut self, name: &str) -> Option<ServiceStatus>;
}

/// Treats the service as running while a process with exactly that name exists.
pub struct ProcessStatusSource {
    sys: System,
}

impl ProcessStatusSource {
    pub fn new() -> Self {
        Self {
            sys: System::new_with_specifics(
                RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()),
            ),
        }
    }
}

impl Default for ProcessStatusSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSource for ProcessStatusSource {
    fn current_status(&mut self, name: &str) -> Option<ServiceStatus> {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        if self.sys.processes().is_empty() {
            return None;
        }
        let running = self
            .sys
            .processes()
            .values()
            .any(|p| p.name() == OsStr::new(name));
        Some(if running {
            ServiceStatus::Running
        } else {
            ServiceStatus::Stopped
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub name: String,
    pub old: ServiceStatus,
    pub new: ServiceStatus,
}

pub struct StatusMonitor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatusMonitor {
    /// Polls `source` every `poll` and sends a [`StatusChange`] only when the
    /// observed status differs from the previous observation. The first poll
    /// sets the baseline.
    pub fn spawn<S: StatusSource>(
        name: String,
        mut source: S,
        poll: Duration,
        changes: mpsc::Sender<StatusChange>,
    ) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = time::interval(poll);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut previous: Option<ServiceStatus> = None;
            loop {
                tokio::select! {
                    _ = cancelled(&mut stop_rx) => break,
                    _ = interval.tick() => {}
                }
                // Process table scans block, so they run off the async workers.
                let poll_name = name.clone();
                let polled = task::spawn_blocking(move || {
                    let status = source.current_status(&poll_name);
                    (source, status)
                })
                .await;
                let current = match polled {
                    Ok((returned, status)) => {
                        source = returned;
                        status.unwrap_or(ServiceStatus::Unknown)
                    }
                    Err(err) => {
                        warn!(%name, ?err, "status poll failed; monitor exiting");
                        break;
                    }
                };
                match previous {
                    None => debug!(%name, status = %current, "status baseline"),
                    Some(old) if old != current => {
                        info!(%name, %old, new = %current, "status changed");
                        let change = StatusChange {
                            name: name.clone(),
                            old,
                            new: current,
                        };
                        if changes.send(change).await.is_err() {
                            debug!(%name, "status listener gone");
                        }
                    }
                    Some(_) => {}
                }
                previous = Some(current);
            }
            debug!(%name, "status monitor stopped");
        });
        Self { stop, task }
    }

    /// Requests the loop to stop. Safe to call any number of times.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn join(self) {
        self.stop();
        let _ = self.task.await;
    }
}
