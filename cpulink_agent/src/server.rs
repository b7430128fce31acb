//! TCP publish server and per-reader push loop. Serves the cached sample quickly.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::shutdown::cancelled;
use crate::state::{format_sample, AppState};

/// Reader input is consumed in chunks of at most this many bytes.
const MAX_LINE: usize = 1024;

/// Accepts readers until shutdown, then waits for every reader loop to finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    push_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    readers.spawn(handle_reader(
                        stream,
                        peer,
                        state.clone(),
                        push_period,
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!(?err, "accept failed");
                    time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
    drop(listener);
    debug!(remaining = readers.len(), "listener closed; draining readers");
    while readers.join_next().await.is_some() {}
}

async fn handle_reader(
    stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
    push_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // Bump client count on connect, decrement on drop.
    state.client_count.fetch_add(1, Ordering::Relaxed);
    struct ClientGuard(AppState);
    impl Drop for ClientGuard {
        fn drop(&mut self) {
            self.0.client_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
    let _guard = ClientGuard(state.clone());
    info!(%peer, "reader connected");

    let (read_half, mut write_half) = stream.into_split();
    let mut requests = pin!(drain_requests(read_half, peer));
    let mut reads_done = false;
    let mut interval = time::interval(push_period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // A half-closed read side keeps receiving samples; only a failed write or
    // shutdown ends the loop.
    loop {
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = &mut requests, if !reads_done => reads_done = true,
            _ = interval.tick() => {
                let line = format!("{}\n", format_sample(state.current().await));
                if let Err(err) = write_half.write_all(line.as_bytes()).await {
                    debug!(%peer, ?err, "reader write failed");
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
    info!(%peer, "reader disconnected");
}

// Readers may send request lines; none are defined, so they are read and dropped.
// Resolves when the reader closes its side or the socket fails.
async fn drain_requests(read_half: OwnedReadHalf, peer: SocketAddr) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader).take(MAX_LINE as u64).read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) if buf.last() != Some(&b'\n') && buf.len() == MAX_LINE => {
                debug!(%peer, bytes = buf.len(), "discarding oversized reader input");
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                debug!(%peer, request = %text.trim_end(), "ignoring reader input");
            }
            Err(err) => {
                debug!(%peer, ?err, "reader read failed");
                return;
            }
        }
    }
}
