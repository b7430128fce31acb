//! Bounded rolling average of the samples received from the agent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_WINDOW: usize = 10;

pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    if dq.len() == cap {
        dq.pop_front();
    }
    dq.push_back(v);
}

/// The last `cap` accepted samples, oldest first.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: VecDeque<f32>,
    cap: usize,
}

impl RollingAverage {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Accepts strictly positive samples; zero, negatives and NaN are counter
    /// warm-up noise and leave the buffer untouched.
    pub fn add(&mut self, sample: f32) -> bool {
        if !(sample > 0.0) || !sample.is_finite() {
            return false;
        }
        push_capped(&mut self.samples, sample, self.cap);
        true
    }

    /// Arithmetic mean, or `None` while nothing has been accepted.
    pub fn average(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f32 = self.samples.iter().sum();
        Some(sum / self.samples.len() as f32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn samples(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }
}

/// Wire format for the average; an empty window reports `0.00`.
pub fn format_average(avg: Option<f32>) -> String {
    format!("{:.2}", avg.unwrap_or(0.0))
}

/// The relay's single rolling window, written by ingest and read by viewers.
#[derive(Debug, Clone)]
pub struct SharedAverage {
    inner: Arc<Mutex<RollingAverage>>,
}

impl SharedAverage {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RollingAverage::new(cap))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RollingAverage> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, sample: f32) -> bool {
        self.lock().add(sample)
    }

    /// Parses one protocol line; unparsable lines are dropped.
    pub fn add_line(&self, line: &str) -> bool {
        match line.trim().parse::<f32>() {
            Ok(v) => self.add(v),
            Err(_) => false,
        }
    }

    pub fn average(&self) -> Option<f32> {
        self.lock().average()
    }

    pub fn snapshot(&self) -> RollingAverage {
        self.lock().clone()
    }
}

impl Default for SharedAverage {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_most_recent_accepted_samples() {
        let mut avg = RollingAverage::new(3);
        for v in [1.0, 2.0, 0.0, 3.0, -4.0, 5.0, 6.0] {
            avg.add(v);
            assert!(avg.len() <= 3);
        }
        assert_eq!(avg.samples(), vec![3.0, 5.0, 6.0]);
    }

    #[test]
    fn non_positive_samples_never_change_the_buffer() {
        let mut avg = RollingAverage::new(4);
        avg.add(10.0);
        avg.add(20.0);
        let before = avg.samples();
        assert!(!avg.add(0.0));
        assert!(!avg.add(-0.5));
        assert!(!avg.add(f32::NAN));
        assert_eq!(avg.samples(), before);
    }

    #[test]
    fn average_is_the_mean_and_reads_are_idempotent() {
        let mut avg = RollingAverage::new(10);
        assert_eq!(avg.average(), None);
        for v in [10.0, 20.0, 30.0, 40.0] {
            avg.add(v);
        }
        assert_eq!(avg.average(), Some(25.0));
        assert_eq!(avg.average(), avg.average());
    }

    #[test]
    fn eviction_is_fifo_at_default_window() {
        let mut avg = RollingAverage::new(DEFAULT_WINDOW);
        for i in 1..=15 {
            avg.add(i as f32);
        }
        assert_eq!(avg.len(), DEFAULT_WINDOW);
        assert_eq!(avg.samples().first(), Some(&6.0));
        assert_eq!(avg.samples().last(), Some(&15.0));
        assert_eq!(avg.average(), Some(10.5));
    }

    #[test]
    fn empty_window_formats_as_zero() {
        assert_eq!(format_average(None), "0.00");
        assert_eq!(format_average(Some(12.345)), "12.35");
    }

    #[test]
    fn shared_average_parses_lines() {
        let shared = SharedAverage::new(5);
        assert!(shared.add_line("12.50\n"));
        assert!(shared.add_line(" 7.5 "));
        assert!(!shared.add_line("garbage"));
        assert!(!shared.add_line("0.00"));
        assert!(!shared.add_line(""));
        assert_eq!(shared.snapshot().samples(), vec![12.5, 7.5]);
        assert_eq!(shared.average(), Some(10.0));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut avg = RollingAverage::new(0);
        avg.add(1.0);
        avg.add(2.0);
        assert_eq!(avg.capacity(), 1);
        assert_eq!(avg.samples(), vec![2.0]);
    }
}
