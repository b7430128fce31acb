//! Relay configuration: JSON file under the XDG config dir, overridden by CLI flags.
//! Stored at $XDG_CONFIG_HOME/cpulink/relay.json (fallback ~/.config/cpulink/relay.json).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::average::DEFAULT_WINDOW;
use crate::launcher::LauncherTiming;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Viewer listen address.
    pub listen: SocketAddr,
    /// Agent address, `host:port`.
    pub sampler: String,
    /// Number of samples in the rolling average.
    pub window: usize,
    pub reconnect_backoff_ms: u64,
    pub launcher_check_ms: u64,
    pub watchdog_poll_ms: u64,
    pub status_poll_ms: u64,
    /// Process name to watch for status changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8005)),
            sampler: "127.0.0.1:8004".into(),
            window: DEFAULT_WINDOW,
            reconnect_backoff_ms: 5_000,
            launcher_check_ms: 1_000,
            watchdog_poll_ms: 100,
            status_poll_ms: 1_000,
            watch: None,
        }
    }
}

impl RelayConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms.max(1))
    }

    pub fn launcher_timing(&self) -> LauncherTiming {
        LauncherTiming {
            check_interval: Duration::from_millis(self.launcher_check_ms.max(1)),
            poll_interval: Duration::from_millis(self.watchdog_poll_ms.max(1)),
        }
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("cpulink")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cpulink")
    }
}

pub fn config_path() -> PathBuf {
    config_dir().join("relay.json")
}

/// Loads `path`; a missing file means defaults.
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RelayConfig::default()),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedArgs {
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
    pub sampler: Option<String>,
    pub window: Option<usize>,
    pub watch: Option<String>,
}

impl ParsedArgs {
    pub fn apply(self, cfg: &mut RelayConfig) {
        if let Some(port) = self.port {
            cfg.listen.set_port(port);
        }
        if let Some(sampler) = self.sampler {
            cfg.sampler = sampler;
        }
        if let Some(window) = self.window {
            cfg.window = window;
        }
        if self.watch.is_some() {
            cfg.watch = self.watch;
        }
    }
}

fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} [--port PORT|-p PORT] [--sampler HOST:PORT|-s HOST:PORT] [--window N] [--watch NAME] [--config PATH]"
    )
}

/// Parses CLI flags. `Err` carries the text to print (help or a bad value).
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "cpulink".into());
    let mut parsed = ParsedArgs::default();

    while let Some(arg) = it.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = || {
            inline
                .clone()
                .or_else(|| it.next())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("missing value for {flag}\n{}", usage(&prog)))
        };
        match flag.as_str() {
            "-h" | "--help" => return Err(usage(&prog)),
            "--port" | "-p" => {
                let v = value()?;
                parsed.port = Some(
                    v.parse()
                        .map_err(|_| format!("invalid port {v:?}\n{}", usage(&prog)))?,
                );
            }
            "--sampler" | "-s" => parsed.sampler = Some(value()?),
            "--window" => {
                let v = value()?;
                match v.parse::<usize>() {
                    Ok(n) if n > 0 => parsed.window = Some(n),
                    _ => return Err(format!("invalid window {v:?}\n{}", usage(&prog))),
                }
            }
            "--watch" => parsed.watch = Some(value()?),
            "--config" => parsed.config = Some(PathBuf::from(value()?)),
            _ => return Err(format!("Unexpected argument {arg:?}. {}", usage(&prog))),
        }
    }
    Ok(parsed)
}
