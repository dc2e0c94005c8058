//! Error types for the SSH config store, connection handling, tunnels and sync.
//!
//! Everything that crosses the command surface is converted to a plain
//! string with [`Error::to_ui_string`]; structured variants exist so the
//! core can branch on failure kinds before that conversion happens.

use thiserror::Error;

/// Errors produced by the devgate core.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH config syntax or field validation failed. No state was changed.
    #[error("invalid SSH config: {0}")]
    Validation(String),

    /// The referenced app-level connection profile does not exist.
    #[error("config '{0}' not found")]
    ConfigNotFound(String),

    /// The alias does not resolve to any host block in the SSH config file.
    #[error("host '{0}' not found in SSH config")]
    HostNotFound(String),

    /// No viable credential was found, or authentication failed in a way
    /// that should make the UI prompt for a password.
    #[error("password required for '{alias}': {msg}")]
    PasswordRequired { alias: String, msg: String },

    /// First-seen or changed host key; the UI must ask before trusting.
    #[error(
        "host key verification required for '{alias}': {fingerprint} offered by {host_address}"
    )]
    HostKeyVerificationRequired {
        alias: String,
        fingerprint: String,
        host_address: String,
    },

    /// At least one authentication method was tried and rejected.
    #[error("authentication failed for '{0}'")]
    AuthenticationFailed(String),

    /// Any other dial or transport failure.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The local listener could not bind because the port is taken.
    #[error("local port {0} is already in use")]
    PortInUse(u16),

    /// A per-operation SFTP failure. Retried by the sync engine.
    #[error("sftp operation failed: {0}")]
    Sftp(String),

    /// The caller or a shutdown cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// OS keychain access failed.
    #[error("keychain error: {0}")]
    Keychain(String),

    /// An error occurred in the russh library.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// Filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Flattens the error into the plain string the UI bridge expects.
    ///
    /// Always uses the value-formatting verb; wrapped I/O errors must never
    /// reach the transport marshaller as structured values.
    pub fn to_ui_string(&self) -> String {
        format!("{self}")
    }

    /// True for SFTP failures the sync engine is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Sftp(_))
    }
}

impl From<russh_sftp::client::error::Error> for Error {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        Error::Sftp(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn ui_string_uses_display_not_debug() {
        let err = Error::PortInUse(2222);
        assert_eq!(err.to_ui_string(), "local port 2222 is already in use");
    }

    #[test]
    fn host_key_error_carries_all_fields() {
        let err = Error::HostKeyVerificationRequired {
            alias: "web".into(),
            fingerprint: "SHA256:abc".into(),
            host_address: "[1.2.3.4]:22".into(),
        };
        let msg = err.to_ui_string();
        assert!(msg.contains("web"));
        assert!(msg.contains("SHA256:abc"));
        assert!(msg.contains("[1.2.3.4]:22"));
    }

    #[test]
    fn only_sftp_errors_are_transient() {
        assert!(Error::Sftp("boom".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::PortInUse(1).is_transient());
    }
}
