//! Viewer listener and per-connection command loop.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::average::{format_average, SharedAverage};
use crate::launcher::Launcher;
use crate::protocol::{parse_command, Command, LINE_TOO_LONG, MAX_LINE, OK, UNKNOWN_COMMAND};
use crate::shutdown::cancelled;

/// Produces the single-line reply for one request line.
pub async fn respond(line: &str, average: &SharedAverage, launcher: &Launcher) -> String {
    match parse_command(line) {
        Ok(Command::GetCpu) => format_average(average.average()),
        Ok(Command::App(args)) => {
            match launcher
                .set_program(&args.path, args.duration_secs, args.trigger_percent)
                .await
            {
                Ok(()) => OK.to_string(),
                Err(err) => {
                    info!(path = %args.path, %err, "launch request rejected");
                    err.to_string()
                }
            }
        }
        Ok(Command::Unknown(_)) => UNKNOWN_COMMAND.to_string(),
        Err(err) => err.to_string(),
    }
}

/// Accepts viewers until shutdown, then waits for every connection to close.
pub async fn serve(
    listener: TcpListener,
    average: SharedAverage,
    launcher: Launcher,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut viewers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    viewers.spawn(handle_viewer(
                        stream,
                        peer,
                        average.clone(),
                        launcher.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!(?err, "accept failed");
                    time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = viewers.join_next(), if !viewers.is_empty() => {}
        }
    }
    drop(listener);
    debug!(remaining = viewers.len(), "listener closed; draining viewers");
    while viewers.join_next().await.is_some() {}
}

async fn handle_viewer(
    stream: TcpStream,
    peer: SocketAddr,
    average: SharedAverage,
    launcher: Launcher,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(%peer, "viewer connected");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    // Set while the rest of an over-long line is being skipped.
    let mut overlong = false;

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE as u64 + 1);
        let read = tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            read = limited.read_until(b'\n', &mut buf) => read,
        };
        let reply = match read {
            Ok(0) => break,
            Ok(_) if overlong || buf.len() > MAX_LINE => {
                if buf.last() != Some(&b'\n') {
                    if !overlong {
                        warn!(%peer, limit = MAX_LINE, "viewer line too long; skipping it");
                    }
                    overlong = true;
                    continue;
                }
                overlong = false;
                LINE_TOO_LONG.to_string()
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                debug!(%peer, request = %line.trim_end(), "viewer command");
                respond(&line, &average, &launcher).await
            }
            Err(err) => {
                debug!(%peer, ?err, "viewer read failed");
                break;
            }
        };
        let reply = format!("{reply}\n");
        if let Err(err) = write_half.write_all(reply.as_bytes()).await {
            debug!(%peer, ?err, "viewer write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
    info!(%peer, "viewer disconnected");
}
