//! Load counters feeding the sampler tick loop.

use std::collections::VecDeque;

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("load counter unavailable: {0}")]
    Unavailable(String),
}

/// A periodic source of processor load in percent (0..=100).
pub trait LoadSource: Send + 'static {
    fn next_value(&mut self) -> Result<f32, SourceError>;
}

/// Global CPU usage as reported by sysinfo.
pub struct SysinfoSource {
    sys: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let refresh_kind =
            RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage());
        Self {
            sys: System::new_with_specifics(refresh_kind),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSource for SysinfoSource {
    fn next_value(&mut self) -> Result<f32, SourceError> {
        self.sys.refresh_cpu_usage();
        if self.sys.cpus().is_empty() {
            return Err(SourceError::Unavailable("no cpus reported".into()));
        }
        let v = self.sys.global_cpu_usage();
        if !v.is_finite() {
            return Err(SourceError::Unavailable(format!("non-finite reading {v}")));
        }
        Ok(v.clamp(0.0, 100.0))
    }
}

/// Replays a fixed script of readings, then repeats `fallback` forever.
/// `None` entries in the script simulate a transient counter failure.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: VecDeque<Option<f32>>,
    fallback: f32,
}

impl ScriptedSource {
    pub fn new<I: IntoIterator<Item = Option<f32>>>(script: I, fallback: f32) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
        }
    }

    pub fn constant(value: f32) -> Self {
        Self::new([], value)
    }
}

impl LoadSource for ScriptedSource {
    fn next_value(&mut self) -> Result<f32, SourceError> {
        match self.script.pop_front() {
            Some(Some(v)) => Ok(v),
            Some(None) => Err(SourceError::Unavailable("scripted failure".into())),
            None => Ok(self.fallback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_source_replays_then_falls_back() {
        let mut src = ScriptedSource::new([Some(1.5), None, Some(3.0)], 7.0);
        assert_eq!(src.next_value().unwrap(), 1.5);
        assert!(src.next_value().is_err());
        assert_eq!(src.next_value().unwrap(), 3.0);
        assert_eq!(src.next_value().unwrap(), 7.0);
        assert_eq!(src.next_value().unwrap(), 7.0);
    }

    #[test]
    fn sysinfo_reading_is_a_percentage() {
        let mut src = SysinfoSource::new();
        if let Ok(v) = src.next_value() {
            assert!((0.0..=100.0).contains(&v), "out of range: {v}");
        }
    }
}
