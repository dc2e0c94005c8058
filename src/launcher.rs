//! Opening an external terminal window is the one thing the core cannot do
//! portably; it is isolated behind this capability boundary so nothing
//! else in the crate ever spawns a process.

use anyhow::Context;
use log::debug;

/// Capability for opening a terminal window running `ssh <alias>`.
pub trait TerminalLauncher: Send + Sync {
    fn open_ssh_terminal(&self, alias: &str) -> anyhow::Result<()>;
}

/// Platform-default launcher: `Terminal.app` via AppleScript on macOS,
/// `cmd /c start` on Windows, `gnome-terminal` elsewhere.
pub struct SystemTerminalLauncher;

impl TerminalLauncher for SystemTerminalLauncher {
    fn open_ssh_terminal(&self, alias: &str) -> anyhow::Result<()> {
        debug!("opening system terminal for ssh {alias}");
        launch(alias).with_context(|| format!("could not open a terminal for '{alias}'"))
    }
}

#[cfg(target_os = "macos")]
fn launch(alias: &str) -> std::io::Result<()> {
    let script = format!("tell application \"Terminal\" to do script \"ssh {alias}\"");
    std::process::Command::new("osascript")
        .arg("-e")
        .arg(script)
        .spawn()
        .map(|_| ())
}

#[cfg(target_os = "windows")]
fn launch(alias: &str) -> std::io::Result<()> {
    std::process::Command::new("cmd")
        .args(["/c", "start", "ssh", alias])
        .spawn()
        .map(|_| ())
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn launch(alias: &str) -> std::io::Result<()> {
    std::process::Command::new("gnome-terminal")
        .arg("--")
        .arg("ssh")
        .arg(alias)
        .spawn()
        .map(|_| ())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records launch requests instead of spawning anything.
    #[derive(Default)]
    pub struct RecordingLauncher {
        pub launched: Mutex<Vec<String>>,
    }

    impl TerminalLauncher for RecordingLauncher {
        fn open_ssh_terminal(&self, alias: &str) -> anyhow::Result<()> {
            self.launched.lock().unwrap().push(alias.to_string());
            Ok(())
        }
    }
}
