//! Bidirectional-watch sync engine: local trees mirrored to remote hosts
//! over SFTP.
//!
//! One [`WatchBinding`] task per sync pair owns a filesystem watcher, an
//! SFTP client and a bounded action queue. `add_watch` runs the initial
//! reconcile before streaming begins; a dropped SSH connection rebuilds
//! the client and re-reconciles automatically.
//!
//! # Main Components
//!
//! - [`SyncService`] - add/remove watches, shutdown
//! - [`watcher::Debouncer`] - per-path coalescing with sequence stamps
//! - [`reconcile`] - one-shot tree reconciliation and file operations

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use russh_sftp::client::SftpSession;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::appconfig::{SshProfile, SyncPair};
use crate::connect::{ConnectionFactory, SshSession};
use crate::error::{Error, Result};
use crate::events::EventBus;

pub mod reconcile;
pub mod watcher;

use watcher::{ActionKind, ActionQueue, Debouncer, SyncAction};

/// Bound on waiting for a binding's current upload to drain at stop.
pub const WATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct WatchBinding {
    pair: SyncPair,
    cancel: CancellationToken,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_reconcile_at: Arc<Mutex<Option<chrono::DateTime<chrono::Local>>>>,
}

/// Introspection snapshot of one binding.
#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchStatus {
    pub pair_id: String,
    pub config_id: String,
    pub local_path: String,
    pub remote_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile_at: Option<String>,
}

/// Owner of all watch bindings.
pub struct SyncService {
    factory: Arc<ConnectionFactory>,
    events: EventBus,
    cancel: CancellationToken,
    bindings: Mutex<HashMap<String, Arc<WatchBinding>>>,
}

impl SyncService {
    pub fn new(
        factory: Arc<ConnectionFactory>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            factory,
            events,
            cancel,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_watching(&self, pair_id: &str) -> bool {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(pair_id)
    }

    /// Starts watching one pair. A pair that is already watched is left
    /// alone and the call succeeds.
    pub async fn add_watch(&self, profile: &SshProfile, pair: &SyncPair) -> Result<()> {
        if self.is_watching(&pair.id) {
            debug!("pair {} already watched", pair.id);
            return Ok(());
        }
        let local_root = Path::new(&pair.local_path);
        if !local_root.is_dir() {
            return Err(Error::Validation(format!(
                "local path {} is not a directory",
                pair.local_path
            )));
        }

        // Connect up front so credential and host-key errors surface to the
        // caller instead of dying inside the task.
        let session = self.factory.connect_profile(profile, None).await?;
        let sftp = match session.open_sftp().await {
            Ok(sftp) => sftp,
            Err(err) => {
                session.close().await;
                return Err(err);
            }
        };

        let cancel = self.cancel.child_token();
        let last_reconcile_at = Arc::new(Mutex::new(None));
        let join = tokio::spawn(run_binding(
            self.factory.clone(),
            self.events.clone(),
            profile.clone(),
            pair.clone(),
            session,
            sftp,
            cancel.clone(),
            last_reconcile_at.clone(),
        ));
        let binding = Arc::new(WatchBinding {
            pair: pair.clone(),
            cancel,
            join: Mutex::new(Some(join)),
            last_reconcile_at,
        });
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pair.id.clone(), binding);
        self.events
            .info(format!("watching {} -> {}", pair.local_path, pair.remote_path));
        Ok(())
    }

    /// Stops watching one pair; unknown ids succeed.
    pub async fn remove_watch(&self, pair_id: &str) -> Result<()> {
        let binding = self
            .bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pair_id);
        let Some(binding) = binding else {
            return Ok(());
        };
        binding.cancel.cancel();
        let join = binding.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            if tokio::time::timeout(WATCH_DRAIN_TIMEOUT, join).await.is_err() {
                warn!("watch binding {pair_id} did not drain in time");
            }
        }
        self.events
            .info(format!("stopped watching {}", binding.pair.local_path));
        Ok(())
    }

    /// Stops every binding belonging to one profile.
    pub async fn stop_watching_config(&self, config_id: &str) -> Result<()> {
        let ids: Vec<String> = self
            .bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|b| b.pair.config_id == config_id)
            .map(|b| b.pair.id.clone())
            .collect();
        for id in ids {
            self.remove_watch(&id).await?;
        }
        Ok(())
    }

    /// Snapshot of every binding for the UI.
    pub fn watch_statuses(&self) -> Vec<WatchStatus> {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|binding| WatchStatus {
                pair_id: binding.pair.id.clone(),
                config_id: binding.pair.config_id.clone(),
                local_path: binding.pair.local_path.clone(),
                remote_path: binding.pair.remote_path.clone(),
                last_reconcile_at: binding
                    .last_reconcile_at
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .map(|t| t.to_rfc3339()),
            })
            .collect()
    }

    /// Stops everything; used during shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for id in ids {
            let _ = self.remove_watch(&id).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_binding(
    factory: Arc<ConnectionFactory>,
    events: EventBus,
    profile: SshProfile,
    pair: SyncPair,
    mut session: SshSession,
    mut sftp: SftpSession,
    cancel: CancellationToken,
    last_reconcile_at: Arc<Mutex<Option<chrono::DateTime<chrono::Local>>>>,
) {
    match reconcile::reconcile_directory(&sftp, &pair, &events).await {
        Ok(_) => {
            *last_reconcile_at.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(chrono::Local::now());
        }
        Err(err) => {
            events.error(format!(
                "initial sync of {} failed: {}",
                pair.local_path,
                err.to_ui_string()
            ));
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = match watcher::spawn_watcher(Path::new(&pair.local_path), tx) {
        Ok(watcher) => watcher,
        Err(err) => {
            events.error(format!(
                "could not watch {}: {}",
                pair.local_path,
                err.to_ui_string()
            ));
            session.close().await;
            return;
        }
    };

    let mut debouncer = Debouncer::default();
    let mut queue = ActionQueue::default();
    let mut dead_rx = session.subscribe_liveness();

    loop {
        let wake = debouncer.next_due();
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = dead_rx.changed() => {
                if changed.is_err() || *dead_rx.borrow() {
                    events.warn(format!(
                        "connection to {} lost, rebuilding sync session",
                        profile.name
                    ));
                    match rebuild(&factory, &events, &profile, &pair, &cancel).await {
                        Some((new_session, new_sftp)) => {
                            session = new_session;
                            sftp = new_sftp;
                            dead_rx = session.subscribe_liveness();
                            *last_reconcile_at.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some(chrono::Local::now());
                        }
                        None => break,
                    }
                }
            }
            received = rx.recv() => {
                match received {
                    Some(Ok(event)) => debouncer.observe(&event, pair.sync_deletes),
                    Some(Err(err)) => warn!("watcher error on {}: {err}", pair.local_path),
                    None => break,
                }
            }
            _ = async { tokio::time::sleep_until(wake.unwrap()).await }, if wake.is_some() => {
                for action in debouncer.take_due(tokio::time::Instant::now()) {
                    queue.push(action, &events);
                }
                while let Some(action) = queue.pop() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    // A later event on the same path invalidates this one;
                    // its own action is either queued or pending.
                    if action.seq < debouncer.latest_seq(&action.path) {
                        continue;
                    }
                    apply_action(&sftp, &pair, &action, &events).await;
                }
            }
        }
    }

    let _ = sftp.close().await;
    session.close().await;
    debug!("watch binding for {} ended", pair.local_path);
}

async fn apply_action(sftp: &SftpSession, pair: &SyncPair, action: &SyncAction, events: &EventBus) {
    let remote = match reconcile::remote_path_for(pair, &action.path) {
        Ok(remote) => remote,
        Err(err) => {
            warn!("unmappable path {}: {err}", action.path.display());
            return;
        }
    };
    match action.kind {
        ActionKind::Upload => {
            let outcome = if action.path.is_dir() {
                reconcile::with_retry(&remote, || reconcile::ensure_remote_dir(sftp, &remote)).await
            } else if action.path.is_file() {
                reconcile::with_retry(&remote, || {
                    reconcile::upload_file(sftp, &action.path, &remote)
                })
                .await
            } else {
                // Vanished between the event and now; its remove event is
                // already behind us in the stream.
                return;
            };
            match outcome {
                Ok(()) => events.success(format!("synced {remote}")),
                Err(err) => events.error(format!("upload {remote}: {}", err.to_ui_string())),
            }
        }
        ActionKind::Delete => {
            match reconcile::with_retry(&remote, || reconcile::delete_remote(sftp, &remote)).await {
                Ok(()) => events.success(format!("removed {remote}")),
                Err(err) => events.error(format!("delete {remote}: {}", err.to_ui_string())),
            }
        }
    }
}

/// Reconnects with exponential backoff, re-running the reconcile before
/// streaming resumes. Returns `None` only when cancelled.
async fn rebuild(
    factory: &ConnectionFactory,
    events: &EventBus,
    profile: &SshProfile,
    pair: &SyncPair,
    cancel: &CancellationToken,
) -> Option<(SshSession, SftpSession)> {
    let mut delay = Duration::from_secs(1);
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match factory.connect_profile(profile, None).await {
            Ok(session) => match session.open_sftp().await {
                Ok(sftp) => {
                    events.info(format!("reconnected to {}", profile.name));
                    let _ = reconcile::reconcile_directory(&sftp, pair, events).await;
                    return Some((session, sftp));
                }
                Err(err) => {
                    warn!("sftp reopen failed for {}: {err}", profile.name);
                    session.close().await;
                }
            },
            Err(err) => warn!("reconnect to {} failed: {err}", profile.name),
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(Duration::from_secs(30));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_timeout_matches_shutdown_budget() {
        assert!(WATCH_DRAIN_TIMEOUT <= Duration::from_secs(5));
    }
}
