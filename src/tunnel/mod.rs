//! Local→remote TCP forwarding over owned SSH sessions.
//!
//! Each started forward owns one listener, one SSH session and an accept
//! loop; the manager keys them by runtime id and publishes every state
//! transition as a `tunnel:status` event.
//!
//! # Main Components
//!
//! - [`TunnelManager`] - start/observe/stop forwards
//! - [`ActiveTunnel`] - point-in-time snapshot handed to the UI
//! - [`TunnelState`] - lifecycle states

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::connect::ConnectionFactory;
use crate::error::{Error, Result};
use crate::events::EventBus;

mod forward;

/// Lifecycle of one forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Starting,
    Connected,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl TunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Starting => "starting",
            TunnelState::Connected => "connected",
            TunnelState::Degraded => "degraded",
            TunnelState::Stopping => "stopping",
            TunnelState::Stopped => "stopped",
            TunnelState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Stopped | TunnelState::Failed)
    }
}

/// Snapshot of one running forward.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTunnel {
    pub runtime_id: String,
    pub alias: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub state: TunnelState,
    pub uptime_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared bookkeeping for one forward. State changes funnel through
/// [`TunnelRuntime::set_state`], the single serialization point that keeps
/// snapshots self-consistent with the emitted events.
pub(crate) struct TunnelRuntime {
    pub runtime_id: String,
    pub alias: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    started_at: Instant,
    state: Mutex<TunnelState>,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    last_error: Mutex<Option<String>>,
    events: EventBus,
}

impl TunnelRuntime {
    pub fn set_state(&self, next: TunnelState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == next || state.is_terminal() {
            return;
        }
        *state = next;
        let message = self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.events
            .tunnel_status(&self.runtime_id, next.as_str(), message);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    fn snapshot(&self) -> ActiveTunnel {
        ActiveTunnel {
            runtime_id: self.runtime_id.clone(),
            alias: self.alias.clone(),
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            state: *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            uptime_secs: self.started_at.elapsed().as_secs(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

struct TunnelHandle {
    runtime: Arc<TunnelRuntime>,
    cancel: CancellationToken,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Grace period allowed for in-flight connections to drain on stop.
pub const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Starts, supervises and stops local TCP forwards.
pub struct TunnelManager {
    factory: Arc<ConnectionFactory>,
    events: EventBus,
    cancel: CancellationToken,
    table: Mutex<HashMap<String, Arc<TunnelHandle>>>,
}

impl TunnelManager {
    pub fn new(
        factory: Arc<ConnectionFactory>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            factory,
            events,
            cancel,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Binds `127.0.0.1:port`, mapping an occupied port to
    /// [`Error::PortInUse`] without retrying.
    pub(crate) async fn bind_local(port: u16) -> Result<TcpListener> {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => Ok(listener),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => Err(Error::PortInUse(port)),
            Err(err) => Err(err.into()),
        }
    }

    /// Starts a forward and returns its runtime id.
    ///
    /// Host-key and password errors from the connection factory surface
    /// unchanged; a bind conflict fails with `PortInUse` and leaves no
    /// table entry behind.
    pub async fn start_local_forward(
        &self,
        alias: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        password: Option<&str>,
        secret_ref: Option<&str>,
    ) -> Result<String> {
        let scope_keys: Vec<&str> = secret_ref.into_iter().collect();
        let session = self
            .factory
            .connect_host(alias, password, &scope_keys)
            .await?;

        let listener = match Self::bind_local(local_port).await {
            Ok(listener) => listener,
            Err(err) => {
                session.close().await;
                return Err(err);
            }
        };

        let runtime_id = format!("tun-{}", uuid::Uuid::new_v4());
        let runtime = Arc::new(TunnelRuntime {
            runtime_id: runtime_id.clone(),
            alias: alias.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            started_at: Instant::now(),
            state: Mutex::new(TunnelState::Starting),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_error: Mutex::new(None),
            events: self.events.clone(),
        });

        let cancel = self.cancel.child_token();
        let join = tokio::spawn(forward::run_tunnel(
            runtime.clone(),
            session,
            listener,
            cancel.clone(),
        ));

        let handle = Arc::new(TunnelHandle {
            runtime: runtime.clone(),
            cancel,
            join: Mutex::new(Some(join)),
        });
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(runtime_id.clone(), handle);

        runtime.set_state(TunnelState::Connected);
        self.events.success(format!(
            "tunnel started: 127.0.0.1:{local_port} -> {remote_host}:{remote_port} via {alias}"
        ));
        Ok(runtime_id)
    }

    /// Stops a forward and waits (bounded) for its accept loop and
    /// in-flight connections to drain. Unknown ids succeed, which makes a
    /// double stop a no-op.
    pub async fn stop_forward(&self, runtime_id: &str) -> Result<()> {
        let handle = self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(runtime_id);
        let Some(handle) = handle else {
            debug!("stop_forward: {runtime_id} not running");
            return Ok(());
        };

        handle.runtime.set_state(TunnelState::Stopping);
        handle.cancel.cancel();
        let join = handle.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            if tokio::time::timeout(STOP_DRAIN_TIMEOUT + Duration::from_millis(500), join)
                .await
                .is_err()
            {
                warn!("tunnel {runtime_id} did not drain in time");
            }
        }
        handle.runtime.set_state(TunnelState::Stopped);
        Ok(())
    }

    /// Snapshot of all non-terminal tunnels.
    pub fn active_tunnels(&self) -> Vec<ActiveTunnel> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|handle| handle.runtime.snapshot())
            .filter(|snapshot| !snapshot.state.is_terminal())
            .collect()
    }

    /// Stops every forward; used during shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for id in ids {
            let _ = self.stop_forward(&id).await;
        }
    }

    /// Removes terminal entries the UI no longer needs.
    pub fn reap_terminal(&self) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, handle| !handle.runtime.snapshot().state.is_terminal());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn occupied_port_maps_to_port_in_use() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let err = TunnelManager::bind_local(port).await.unwrap_err();
        match err {
            Error::PortInUse(reported) => assert_eq!(reported, port),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn free_port_binds() {
        let listener = TunnelManager::bind_local(0).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(TunnelState::Stopped.is_terminal());
        assert!(TunnelState::Failed.is_terminal());
        assert!(!TunnelState::Degraded.is_terminal());
        assert!(!TunnelState::Connected.is_terminal());
    }

    #[test]
    fn state_transitions_emit_status_events() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let runtime = TunnelRuntime {
            runtime_id: "tun-x".into(),
            alias: "web".into(),
            local_port: 8080,
            remote_host: "127.0.0.1".into(),
            remote_port: 80,
            started_at: Instant::now(),
            state: Mutex::new(TunnelState::Starting),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_error: Mutex::new(None),
            events,
        };

        runtime.set_state(TunnelState::Connected);
        // Same-state transitions are swallowed.
        runtime.set_state(TunnelState::Connected);
        runtime.set_state(TunnelState::Failed);
        // Terminal states are sticky.
        runtime.set_state(TunnelState::Connected);
        assert_eq!(runtime.snapshot().state, TunnelState::Failed);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::events::AppEvent::TunnelStatus(status) = event {
                seen.push(status.state);
            }
        }
        assert_eq!(seen, vec!["connected", "failed"]);
    }
}
