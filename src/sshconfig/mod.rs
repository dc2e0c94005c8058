//! Persistent, formatting-preserving model of the user's `~/.ssh/config`.
//!
//! The document is held as an ordered sequence of raw lines with a parsed
//! overlay computed on demand. Edits touch only the lines they must touch;
//! everything else round-trips bit-for-bit, including comments, blank lines
//! and indentation.
//!
//! # Main Components
//!
//! - [`SshConfigDoc`] - raw lines plus block overlay, all edit primitives
//! - [`SshConfigStore`] - lock-guarded owner of the document and its file
//! - [`HostEntry`] - parsed view of one host block
//! - [`validator::validate`] - syntax/field validation with `line N:` errors

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod parser;
mod store;
pub mod validator;

pub use parser::SshConfigDoc;
pub use store::SshConfigStore;
pub(crate) use store::write_atomic_0600;

/// Default SSH port applied when a host block carries no `Port` directive.
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Parsed view of one `Host` block.
///
/// `alias` is the name the entry was looked up or listed under; `aliases`
/// holds every pattern declared on the `Host` line in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostEntry {
    pub alias: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    /// Remaining directives in file order. Multi-valued keys such as
    /// `LocalForward` appear once per line.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    /// Comment lines owned by the block, `#` markers stripped.
    #[serde(default)]
    pub description: Vec<String>,
}

impl HostEntry {
    /// Creates an entry with just an alias; everything else at defaults.
    pub fn named(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            aliases: vec![alias.clone()],
            alias,
            port: DEFAULT_SSH_PORT,
            ..Default::default()
        }
    }

    /// Address the entry dials, falling back to the alias when no
    /// `HostName` is set (mirrors OpenSSH behavior).
    pub fn dial_host(&self) -> &str {
        self.host_name.as_deref().unwrap_or(&self.alias)
    }

    /// First value of a directive, looked up case-insensitively.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}
