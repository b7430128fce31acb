//! Cooperative cancellation for the sampler, accept and reader loops.

use tokio::sync::watch;

/// Resolves once shutdown has been requested or the sender is gone.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
