//! Shared agent state: the most recent load sample and connected reader count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct AppState {
    current: Arc<RwLock<f32>>,
    pub client_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> f32 {
        *self.current.read().await
    }

    pub async fn set_current(&self, value: f32) {
        *self.current.write().await = value;
    }

    pub fn clients(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }
}

/// Wire format for a single sample: fixed two decimals.
pub fn format_sample(value: f32) -> String {
    format!("{value:.2}")
}
