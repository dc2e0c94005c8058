//! Accept loop and byte splicing for one forward.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{STOP_DRAIN_TIMEOUT, TunnelRuntime, TunnelState};
use crate::connect::{KEEPALIVE_INTERVAL, SshSession};

/// One grace window between `degraded` and `failed`.
const DEGRADED_GRACE: Duration = KEEPALIVE_INTERVAL;

enum Exit {
    Cancelled,
    ConnectionDead,
}

pub(super) async fn run_tunnel(
    runtime: Arc<TunnelRuntime>,
    session: SshSession,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();
    let mut dead_rx = session.subscribe_liveness();

    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Exit::Cancelled,
            changed = dead_rx.changed() => {
                if changed.is_err() || *dead_rx.borrow() {
                    break Exit::ConnectionDead;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        // The channel open happens inline so inbound accept
                        // order is preserved into the SSH channel opens.
                        match session
                            .open_direct_tcpip(
                                &runtime.remote_host,
                                runtime.remote_port,
                                &peer.ip().to_string(),
                                peer.port(),
                            )
                            .await
                        {
                            Ok(channel) => {
                                let conn_cancel = cancel.child_token();
                                let conn_runtime = runtime.clone();
                                tracker.spawn(async move {
                                    splice(stream, channel, conn_runtime, conn_cancel).await;
                                });
                            }
                            Err(err) => {
                                warn!(
                                    "tunnel {}: channel open to {}:{} failed: {err}",
                                    runtime.runtime_id, runtime.remote_host, runtime.remote_port
                                );
                                runtime.record_error(err.to_ui_string());
                            }
                        }
                    }
                    Err(err) => {
                        warn!("tunnel {}: accept failed: {err}", runtime.runtime_id);
                        runtime.record_error(err.to_string());
                    }
                }
            }
        }
    };

    match exit {
        Exit::Cancelled => {
            runtime.set_state(TunnelState::Stopping);
        }
        Exit::ConnectionDead => {
            runtime.record_error("ssh keep-alive reported the connection dead");
            runtime.set_state(TunnelState::Degraded);
            // One grace window before declaring the tunnel failed; an
            // explicit stop during the window wins.
            tokio::select! {
                _ = cancel.cancelled() => runtime.set_state(TunnelState::Stopping),
                _ = tokio::time::sleep(DEGRADED_GRACE) => runtime.set_state(TunnelState::Failed),
            }
        }
    }

    drop(listener);
    tracker.close();
    if tokio::time::timeout(STOP_DRAIN_TIMEOUT, tracker.wait())
        .await
        .is_err()
    {
        debug!(
            "tunnel {}: in-flight connections did not drain within {:?}",
            runtime.runtime_id, STOP_DRAIN_TIMEOUT
        );
    }
    session.close().await;
    debug!("tunnel {} loop ended", runtime.runtime_id);
}

async fn splice(
    local: TcpStream,
    channel: russh::Channel<russh::client::Msg>,
    runtime: Arc<TunnelRuntime>,
    cancel: CancellationToken,
) {
    let stream = channel.into_stream();
    let (mut remote_read, mut remote_write) = tokio::io::split(stream);
    let (mut local_read, mut local_write) = local.into_split();

    let outbound = copy_counted(&mut local_read, &mut remote_write, &runtime.bytes_out);
    let inbound = copy_counted(&mut remote_read, &mut local_write, &runtime.bytes_in);

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = async { tokio::join!(outbound, inbound) } => {}
    }
}

/// Pumps bytes one way, bumping the shared counter per chunk so snapshots
/// see live totals. Shuts the write half down on EOF.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return;
            }
            Ok(read) => read,
            Err(_) => return,
        };
        if writer.write_all(&buf[..read]).await.is_err() {
            return;
        }
        counter.fetch_add(read as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_counted_tracks_bytes() {
        let counter = AtomicU64::new(0);
        let mut input: &[u8] = b"0123456789";
        let mut output = Vec::new();
        copy_counted(&mut input, &mut output, &counter).await;
        assert_eq!(output, b"0123456789");
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }
}
