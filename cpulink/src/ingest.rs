//! Agent link: keeps one connection to the agent and folds its samples into the
//! rolling average. Reconnects forever with a fixed backoff.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::average::SharedAverage;
use crate::shutdown::cancelled;

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum LinkEnd {
    Cancelled,
    Eof,
    Failed(std::io::Error),
}

/// Runs until shutdown. Refused connects, resets and clean EOF all lead to the
/// same backoff-and-retry path.
pub async fn run_ingest(
    sampler: String,
    average: SharedAverage,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let connected = tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            res = TcpStream::connect(sampler.as_str()) => res,
        };
        match connected {
            Ok(stream) => {
                info!(%sampler, "connected to agent");
                match read_samples(stream, &average, &mut shutdown).await {
                    LinkEnd::Cancelled => break,
                    LinkEnd::Eof => info!(%sampler, "agent closed the connection"),
                    LinkEnd::Failed(err) => warn!(%sampler, ?err, "agent link failed"),
                }
            }
            Err(err) => warn!(%sampler, ?err, "connect to agent failed"),
        }

        info!(backoff_ms = backoff.as_millis() as u64, "reconnecting to agent");
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = time::sleep(backoff) => {}
        }
    }
    info!("agent link stopped");
}

async fn read_samples(
    stream: TcpStream,
    average: &SharedAverage,
    shutdown: &mut watch::Receiver<bool>,
) -> LinkEnd {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let next = tokio::select! {
            _ = cancelled(shutdown) => return LinkEnd::Cancelled,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                if !average.add_line(&line) {
                    debug!(%line, "dropped sample");
                }
            }
            Ok(None) => return LinkEnd::Eof,
            Err(err) => return LinkEnd::Failed(err),
        }
    }
}
