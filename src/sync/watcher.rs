//! Filesystem watching, per-path debouncing and the bounded action queue.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::events::EventBus;

/// Trailing debounce window per path.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Capacity of the per-binding work queue.
pub const QUEUE_CAPACITY: usize = 64;

/// What the remote side must do for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Upload,
    Delete,
}

/// A coalesced, sequence-stamped action ready for the uploader.
#[derive(Debug, Clone)]
pub struct SyncAction {
    pub path: PathBuf,
    pub kind: ActionKind,
    pub seq: u64,
}

/// Starts a recursive watcher rooted at `root`, bridging events into a
/// tokio channel. The returned watcher must be kept alive for as long as
/// events are wanted; recursive mode picks up directories created later.
pub fn spawn_watcher(
    root: &Path,
    tx: mpsc::UnboundedSender<notify::Result<notify::Event>>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |event| {
            let _ = tx.send(event);
        },
        notify::Config::default(),
    )
    .map_err(|err| Error::Validation(format!("could not create watcher: {err}")))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|err| Error::Validation(format!("could not watch {}: {err}", root.display())))?;
    Ok(watcher)
}

#[derive(Debug)]
struct Pending {
    kind: ActionKind,
    seq: u64,
    due: Instant,
}

/// Coalesces raw watcher events into at most one pending action per path.
///
/// Every observation bumps the path's monotonic sequence number and pushes
/// the due time out, so bursts collapse into a single action carrying the
/// newest sequence.
#[derive(Debug, Default)]
pub struct Debouncer {
    pending: HashMap<PathBuf, Pending>,
    sequences: HashMap<PathBuf, u64>,
}

impl Debouncer {
    /// Feeds one watcher event. `sync_deletes` gates delete actions.
    pub fn observe(&mut self, event: &notify::Event, sync_deletes: bool) {
        use notify::EventKind;
        use notify::event::ModifyKind;

        let relevant = matches!(
            event.kind,
            EventKind::Create(_)
                | EventKind::Modify(ModifyKind::Data(_))
                | EventKind::Modify(ModifyKind::Name(_))
                | EventKind::Modify(ModifyKind::Any)
                | EventKind::Remove(_)
        );
        if !relevant {
            return;
        }

        for path in &event.paths {
            // Renames arrive as paired events; deciding by current
            // existence makes the old name a delete and the new name an
            // upload without tracking rename cookies.
            let kind = if path.exists() {
                ActionKind::Upload
            } else {
                if !sync_deletes {
                    self.sequences
                        .entry(path.clone())
                        .and_modify(|s| *s += 1)
                        .or_insert(1);
                    self.pending.remove(path);
                    continue;
                }
                ActionKind::Delete
            };
            let seq = self
                .sequences
                .entry(path.clone())
                .and_modify(|s| *s += 1)
                .or_insert(1);
            self.pending.insert(
                path.clone(),
                Pending {
                    kind,
                    seq: *seq,
                    due: Instant::now() + DEBOUNCE_WINDOW,
                },
            );
        }
    }

    /// Next instant at which [`Debouncer::take_due`] will have work.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Pops every action whose window has elapsed, oldest window first.
    pub fn take_due(&mut self, now: Instant) -> Vec<SyncAction> {
        let mut due: Vec<(PathBuf, Pending)> = Vec::new();
        let paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in paths {
            if let Some(pending) = self.pending.remove(&path) {
                due.push((path, pending));
            }
        }
        due.sort_by_key(|(_, p)| p.due);
        due.into_iter()
            .map(|(path, p)| SyncAction {
                path,
                kind: p.kind,
                seq: p.seq,
            })
            .collect()
    }

    /// Latest sequence observed for a path; an executor must skip actions
    /// stamped lower than this.
    pub fn latest_seq(&self, path: &Path) -> u64 {
        self.sequences.get(path).copied().unwrap_or(0)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Bounded FIFO of actions awaiting execution.
///
/// When full, the oldest queued action for the same path is replaced;
/// failing that, the oldest action overall is dropped with a WARN. Newer
/// data always wins.
#[derive(Debug, Default)]
pub struct ActionQueue {
    queue: VecDeque<SyncAction>,
}

impl ActionQueue {
    pub fn push(&mut self, action: SyncAction, events: &EventBus) {
        if let Some(slot) = self
            .queue
            .iter_mut()
            .find(|queued| queued.path == action.path)
        {
            *slot = action;
            return;
        }
        if self.queue.len() >= QUEUE_CAPACITY {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(
                    "sync queue full, dropping stale action for {}",
                    dropped.path.display()
                );
                events.warn(format!(
                    "sync backlog full, skipped older change to {}",
                    dropped.path.display()
                ));
            }
        }
        self.queue.push_back(action);
    }

    pub fn pop(&mut self) -> Option<SyncAction> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
