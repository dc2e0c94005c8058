//! Ordered event stream shared by every long-lived component.
//!
//! Components publish [`AppEvent`]s through a single [`EventBus`]; the UI
//! subscribes and receives events in the order they were produced per
//! component. Log events are additionally mirrored to a plain-text append
//! log under the app config directory.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity of a UI-facing log event.
///
/// `Success` is not a diagnostic level; it marks user-visible completion of
/// an operation (a synced file, an established tunnel) and renders
/// differently in the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        }
    }
}

/// A log line as shown in the UI activity feed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogEvent {
    /// Wall-clock `HH:MM:SS` at emission time.
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

/// Status report for one running tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatusEvent {
    pub runtime_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Connection lifecycle report for one SSH host alias.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SshStatusEvent {
    pub alias: String,
    pub status: String,
    pub message: String,
}

/// Everything the core can push to the UI, tagged the way the bridge
/// serializes it on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", content = "payload")]
pub enum AppEvent {
    #[serde(rename = "log_event")]
    Log(LogEvent),
    #[serde(rename = "tunnel:status")]
    TunnelStatus(TunnelStatusEvent),
    #[serde(rename = "ssh:status")]
    SshStatus(SshStatusEvent),
    #[serde(rename = "app:request-quit")]
    RequestQuit,
}

struct FileAppender {
    file: Mutex<std::fs::File>,
}

impl FileAppender {
    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = {
            let mut options = OpenOptions::new();
            options.create(true).append(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o660);
            }
            options
        };
        let file = options.open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn append(&self, source: &str, event: &LogEvent) {
        let now = Local::now().format("%Y/%m/%d %H:%M:%S");
        let line = format!(
            "{now} [{source}] [{ts}] [{level}] {msg}\n",
            ts = event.timestamp,
            level = event.level.as_str(),
            msg = event.message
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

/// Fan-out point for [`AppEvent`]s.
///
/// Cloning is cheap; all clones feed the same subscribers. A bus with no
/// subscribers silently drops events, which keeps headless use (tests, CLI
/// tools) free of ceremony.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
    appender: Option<Arc<FileAppender>>,
    source: &'static str,
}

impl EventBus {
    /// Creates a bus without a backing log file.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            appender: None,
            source: "devgate",
        }
    }

    /// Creates a bus that mirrors log events to `log_path`.
    pub fn with_log_file(log_path: PathBuf) -> Self {
        let appender = match FileAppender::open(&log_path) {
            Ok(appender) => Some(Arc::new(appender)),
            Err(err) => {
                log::warn!("could not open app log {}: {err}", log_path.display());
                None
            }
        };
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            appender,
            source: "devgate",
        }
    }

    /// Subscribes to the ordered event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event to all subscribers.
    pub fn emit(&self, event: AppEvent) {
        if let AppEvent::Log(log_event) = &event {
            if let Some(appender) = &self.appender {
                appender.append(self.source, log_event);
            }
        }
        // A send error just means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    /// Emits a `log_event` stamped with the current wall-clock time.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let event = LogEvent {
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            level,
            message: message.into(),
        };
        self.emit(AppEvent::Log(event));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(LogLevel::Success, message);
    }

    /// Emits a `tunnel:status` event.
    pub fn tunnel_status(&self, runtime_id: &str, state: &str, message: Option<String>) {
        self.emit(AppEvent::TunnelStatus(TunnelStatusEvent {
            runtime_id: runtime_id.to_string(),
            state: state.to_string(),
            message,
        }));
    }

    /// Emits an `ssh:status` event.
    pub fn ssh_status(&self, alias: &str, status: &str, message: impl Into<String>) {
        self.emit(AppEvent::SshStatus(SshStatusEvent {
            alias: alias.to_string(),
            status: status.to_string(),
            message: message.into(),
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
