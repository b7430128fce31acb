//! Background sampler: reads the load counter on a fixed period and stores the
//! latest value so reader connections just format and send it.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::source::LoadSource;
use crate::shutdown::cancelled;
use crate::state::AppState;

// 100ms by default; a failed read publishes 0 and the loop keeps going.
pub fn spawn_sampler<S: LoadSource>(
    state: AppState,
    mut source: S,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // The first reading after the counter is created is not meaningful.
        if let Err(err) = source.next_value() {
            debug!(%err, "warm-up read failed");
        }

        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "sampler started");
        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                _ = interval.tick() => {}
            }
            let value = match source.next_value() {
                Ok(v) => v,
                Err(err) => {
                    warn!(%err, "load read failed; publishing 0");
                    0.0
                }
            };
            state.set_current(value).await;
        }
        info!("sampler stopped");
    })
}
