//! Threshold-triggered program launcher.
//!
//! A [`Launcher`] owns at most one monitoring loop. Every `check_interval` the
//! loop reads the rolling average; once it reaches the configured trigger and no
//! program is running, the program is started under a watchdog that kills it
//! after the configured run time. Installing a new request stops the previous
//! loop first; a program that is already running stays under its own watchdog.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::average::SharedAverage;
use crate::shutdown::cancelled;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("path must not be empty")]
    EmptyPath,
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("file is not executable: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("trigger must be between 0 and 100, got {0}")]
    TriggerOutOfRange(u32),
}

/// A validated launch configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    program: PathBuf,
    duration: Duration,
    trigger_percent: u8,
}

impl LaunchRequest {
    pub fn new(program: &str, duration_secs: u64, trigger_percent: u32) -> Result<Self, LaunchError> {
        if program.trim().is_empty() {
            return Err(LaunchError::EmptyPath);
        }
        let trigger = u8::try_from(trigger_percent)
            .ok()
            .filter(|t| *t <= 100)
            .ok_or(LaunchError::TriggerOutOfRange(trigger_percent))?;

        let program = PathBuf::from(program);
        match std::fs::metadata(&program) {
            Ok(meta) if meta.is_file() => {
                if !is_executable(&meta) {
                    return Err(LaunchError::NotExecutable(program));
                }
            }
            _ => return Err(LaunchError::NotFound(program)),
        }

        Ok(Self {
            program,
            duration: Duration::from_secs(duration_secs),
            trigger_percent: trigger,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn trigger_percent(&self) -> u8 {
        self.trigger_percent
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LauncherTiming {
    /// How often the monitoring loop compares the average to the trigger.
    pub check_interval: Duration,
    /// How often the watchdog checks whether the program has exited.
    pub poll_interval: Duration,
}

impl Default for LauncherTiming {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherPhase {
    Idle,
    Monitoring,
    ProgramRunning,
}

#[derive(Debug, Clone)]
pub struct LauncherSnapshot {
    pub phase: LauncherPhase,
    pub request: Option<LaunchRequest>,
    pub started_at: Option<DateTime<Local>>,
    pub launches: u64,
}

struct ActiveMonitor {
    request: LaunchRequest,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

// State the monitoring loop and the watchdog share with the command side.
struct Shared {
    average: SharedAverage,
    timing: LauncherTiming,
    // One program per launcher, across configurations.
    running: AtomicBool,
    started_at: StdMutex<Option<DateTime<Local>>>,
    watchdog: StdMutex<Option<JoinHandle<()>>>,
    launches: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl Shared {
    /// Sets the running flag before any launch work starts; `false` if a program
    /// is already running.
    fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_started(&self, at: Option<DateTime<Local>>) {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

// Clears the running flag however the watchdog ends.
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.set_started(None);
        self.0.running.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct Launcher {
    shared: Arc<Shared>,
    active: Arc<Mutex<Option<ActiveMonitor>>>,
}

impl Launcher {
    /// `shutdown` is the relay-wide signal; on it, a watched program is killed.
    pub fn new(average: SharedAverage, timing: LauncherTiming, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                average,
                timing,
                running: AtomicBool::new(false),
                started_at: StdMutex::new(None),
                watchdog: StdMutex::new(None),
                launches: AtomicU64::new(0),
                shutdown,
            }),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Validates and installs a request from raw protocol fields. An invalid
    /// request is rejected before anything is touched, so the previous
    /// configuration and its loop keep running.
    pub async fn set_program(
        &self,
        path: &str,
        duration_secs: u64,
        trigger_percent: u32,
    ) -> Result<(), LaunchError> {
        let request = LaunchRequest::new(path, duration_secs, trigger_percent)?;
        self.configure(request).await;
        Ok(())
    }

    /// Stops the current monitoring loop, waits for it to exit, then starts a
    /// fresh one for `request`.
    pub async fn configure(&self, request: LaunchRequest) {
        let mut active = self.active.lock().await;
        if let Some(old) = active.take() {
            stop_monitor(old).await;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(monitor_loop(self.shared.clone(), request.clone(), stop_rx));
        *active = Some(ActiveMonitor {
            request,
            stop: stop_tx,
            task,
        });
    }

    /// Stops the monitoring loop, if any. A running program is left to its watchdog.
    pub async fn stop(&self) {
        if let Some(old) = self.active.lock().await.take() {
            stop_monitor(old).await;
        }
    }

    /// Stops monitoring and waits for the watchdog, which kills its program once
    /// the relay-wide shutdown signal is raised.
    pub async fn shutdown(&self) {
        self.stop().await;
        let watchdog = self
            .shared
            .watchdog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = watchdog {
            let _ = task.await;
        }
    }

    pub fn is_program_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn launches(&self) -> u64 {
        self.shared.launches.load(Ordering::Relaxed)
    }

    pub async fn phase(&self) -> LauncherPhase {
        let monitoring = self.active.lock().await.is_some();
        if self.is_program_running() {
            LauncherPhase::ProgramRunning
        } else if monitoring {
            LauncherPhase::Monitoring
        } else {
            LauncherPhase::Idle
        }
    }

    pub async fn snapshot(&self) -> LauncherSnapshot {
        let request = self.active.lock().await.as_ref().map(|a| a.request.clone());
        let phase = if self.is_program_running() {
            LauncherPhase::ProgramRunning
        } else if request.is_some() {
            LauncherPhase::Monitoring
        } else {
            LauncherPhase::Idle
        };
        LauncherSnapshot {
            phase,
            request,
            started_at: *self
                .shared
                .started_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            launches: self.launches(),
        }
    }
}

async fn stop_monitor(monitor: ActiveMonitor) {
    info!(program = %monitor.request.program().display(), "stopping monitor");
    monitor.stop.send_replace(true);
    let _ = monitor.task.await;
}

async fn monitor_loop(shared: Arc<Shared>, request: LaunchRequest, mut stop: watch::Receiver<bool>) {
    let mut shutdown = shared.shutdown.clone();
    let mut interval = time::interval(shared.timing.check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        program = %request.program().display(),
        trigger = request.trigger_percent(),
        duration_secs = request.duration().as_secs(),
        "monitoring started"
    );

    loop {
        tokio::select! {
            _ = cancelled(&mut stop) => break,
            _ = cancelled(&mut shutdown) => break,
            _ = interval.tick() => {}
        }
        // An empty window has no average and never triggers.
        let Some(avg) = shared.average.average() else {
            continue;
        };
        debug!(average = avg, "launcher check");
        if avg >= f32::from(request.trigger_percent()) && shared.try_claim() {
            info!(average = avg, trigger = request.trigger_percent(), "trigger reached");
            let task = tokio::spawn(run_program(shared.clone(), request.clone()));
            *shared.watchdog.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        }
    }
    info!(program = %request.program().display(), "monitoring stopped");
}

// Watchdog: the caller has already claimed the running flag.
async fn run_program(shared: Arc<Shared>, request: LaunchRequest) {
    let _running = RunningGuard(shared.clone());
    let program = request.program().display().to_string();

    let mut child = match Command::new(request.program())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(%program, ?err, "could not start program");
            return;
        }
    };
    shared.launches.fetch_add(1, Ordering::Relaxed);
    shared.set_started(Some(Local::now()));
    info!(%program, pid = child.id(), "program started");

    // A run time past the clock's range never elapses.
    let deadline = Instant::now().checked_add(request.duration());
    let mut shutdown = shared.shutdown.clone();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(%program, %status, "program exited before its run time");
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%program, ?err, "could not poll program");
                break;
            }
        }
        let mut nap = shared.timing.poll_interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                info!(%program, "run time elapsed; killing program");
                break;
            }
            nap = nap.min(deadline - now);
        }
        tokio::select! {
            _ = time::sleep(nap) => {}
            _ = cancelled(&mut shutdown) => {
                info!(%program, "relay shutting down; killing program");
                break;
            }
        }
    }

    // kill() also waits for the process to exit.
    if let Err(err) = child.kill().await {
        warn!(%program, ?err, "could not kill program");
    }
    info!(%program, "program completed");
}
