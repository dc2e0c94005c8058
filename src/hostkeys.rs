//! Host-key verification against a known-hosts file, with explicit
//! trust-on-first-use capture.
//!
//! Records are append-only. Addresses are always written in the
//! `[host]:port` form; existing bare-host records for port 22 are still
//! honored on lookup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use russh::client;
use russh::keys::{HashAlg, PublicKey};

use crate::error::{Error, Result};

/// Outcome of checking one offered key against the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// A record for this address matches the offered key.
    Known,
    /// No record exists for this address (first contact).
    Unknown,
    /// A record exists for this address but the key differs.
    Changed,
}

/// SHA-256 fingerprint in the `SHA256:…` presentation OpenSSH uses.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Canonical `[host]:port` address form used in records and error values.
pub fn format_address(host: &str, port: u16) -> String {
    format!("[{host}]:{port}")
}

/// The known-hosts file co-located with the SSH config.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checks an offered key. Hashed records written by other tools are
    /// treated as non-matching.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<VerifyOutcome> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(VerifyOutcome::Unknown);
            }
            Err(err) => return Err(err.into()),
        };

        let (offered_type, offered_data) = openssh_tokens(key)?;
        let bracketed = format_address(host, port);

        let mut address_seen = false;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let (Some(addresses), Some(key_type), Some(key_data)) =
                (tokens.next(), tokens.next(), tokens.next())
            else {
                continue;
            };
            let matches_address = addresses.split(',').any(|a| {
                a == bracketed || (port == 22 && a == host)
            });
            if !matches_address {
                continue;
            }
            address_seen = true;
            if key_type == offered_type {
                return if key_data == offered_data {
                    Ok(VerifyOutcome::Known)
                } else {
                    Ok(VerifyOutcome::Changed)
                };
            }
        }

        // Another key type on file for this address still means the offered
        // key itself has never been trusted.
        let _ = address_seen;
        Ok(VerifyOutcome::Unknown)
    }

    /// Appends exactly one record for the key. Creates the file 0600 when
    /// missing; prepends a newline when appending to non-empty content
    /// that does not already end with one.
    pub fn trust_and_append(&self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        let (key_type, key_data) = openssh_tokens(key)?;
        let record = format!("{} {key_type} {key_data}", format_address(host, port));

        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.write_all(record.as_bytes())?;
        file.write_all(b"\n")?;
        debug!("trusted host key for {}", format_address(host, port));
        Ok(())
    }
}

fn openssh_tokens(key: &PublicKey) -> Result<(String, String)> {
    let encoded = key
        .to_openssh()
        .map_err(|err| Error::ConnectionFailed(format!("could not encode host key: {err}")))?;
    let mut tokens = encoded.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(key_type), Some(key_data)) => Ok((key_type.to_string(), key_data.to_string())),
        _ => Err(Error::ConnectionFailed(
            "malformed host key encoding".to_string(),
        )),
    }
}

/// Shared slot the connect handlers use to report the key a server offered.
pub type CapturedKey = Arc<Mutex<Option<PublicKey>>>;

/// Handler that verifies the offered key against the known-hosts file.
///
/// On `Unknown`/`Changed` the key is recorded in the shared slot and the
/// handshake is rejected; the factory turns that into
/// `HostKeyVerificationRequired`.
pub struct VerifyingHandler {
    known_hosts: KnownHosts,
    host: String,
    port: u16,
    captured: CapturedKey,
}

impl VerifyingHandler {
    pub fn new(known_hosts: KnownHosts, host: String, port: u16, captured: CapturedKey) -> Self {
        Self {
            known_hosts,
            host,
            port,
            captured,
        }
    }
}

impl client::Handler for VerifyingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            Ok(VerifyOutcome::Known) => Ok(true),
            Ok(outcome) => {
                debug!(
                    "host key for {} is {:?}, rejecting handshake",
                    format_address(&self.host, self.port),
                    outcome
                );
                *self.captured.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(server_public_key.clone());
                Ok(false)
            }
            Err(err) => {
                warn!(
                    "known-hosts check failed for {}: {err}",
                    format_address(&self.host, self.port)
                );
                Ok(false)
            }
        }
    }
}

/// Handler for the throwaway capture dial: records whatever key the server
/// offers and always rejects, so the handshake never completes and no
/// authentication is attempted.
struct CaptureHandler {
    captured: CapturedKey,
}

impl client::Handler for CaptureHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        *self.captured.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(server_public_key.clone());
        Ok(false)
    }
}

/// Dials the server just far enough to learn its host key.
pub async fn capture_host_key(host: &str, port: u16) -> Result<PublicKey> {
    let captured: CapturedKey = Arc::new(Mutex::new(None));
    let handler = CaptureHandler {
        captured: captured.clone(),
    };
    let config = Arc::new(client::Config {
        inactivity_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    });

    let dial = tokio::time::timeout(
        Duration::from_secs(10),
        client::connect(config, (host.to_string(), port), handler),
    )
    .await;

    // The dial is expected to fail (the handler rejects every key); it is
    // only a vehicle for the capture.
    match dial {
        Ok(Ok(handle)) => drop(handle),
        Ok(Err(_)) | Err(_) => {}
    }

    let key = captured.lock().unwrap_or_else(|e| e.into_inner()).take();
    key.ok_or_else(|| {
        Error::ConnectionFailed(format!(
            "could not obtain host key from {}",
            format_address(host, port)
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgIC";

    fn test_key() -> PublicKey {
        PublicKey::from_openssh(KEY_A).unwrap()
    }

    fn other_key() -> PublicKey {
        PublicKey::from_openssh(KEY_B).unwrap()
    }

    fn known_hosts_in(dir: &tempfile::TempDir) -> KnownHosts {
        KnownHosts::new(dir.path().join("known_hosts"))
    }

    #[test]
    fn first_contact_is_unknown_then_known_after_trust() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = known_hosts_in(&dir);
        let key = test_key();

        assert_eq!(
            known_hosts.verify("example.com", 22, &key).unwrap(),
            VerifyOutcome::Unknown
        );
        known_hosts.trust_and_append("example.com", 22, &key).unwrap();
        assert_eq!(
            known_hosts.verify("example.com", 22, &key).unwrap(),
            VerifyOutcome::Known
        );
    }

    #[test]
    fn record_uses_bracketed_address_form() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = known_hosts_in(&dir);
        known_hosts.trust_and_append("example.com", 2222, &test_key()).unwrap();

        let text = std::fs::read_to_string(known_hosts.path()).unwrap();
        assert!(text.starts_with("[example.com]:2222 "));
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn changed_key_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = known_hosts_in(&dir);
        known_hosts.trust_and_append("example.com", 22, &test_key()).unwrap();

        let other = other_key();
        assert_eq!(
            known_hosts.verify("example.com", 22, &other).unwrap(),
            VerifyOutcome::Changed
        );
    }

    #[test]
    fn bare_host_record_matches_default_port() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = known_hosts_in(&dir);
        let key = test_key();
        let (key_type, key_data) = super::openssh_tokens(&key).unwrap();
        std::fs::write(
            known_hosts.path(),
            format!("example.com {key_type} {key_data}\n"),
        )
        .unwrap();

        assert_eq!(
            known_hosts.verify("example.com", 22, &key).unwrap(),
            VerifyOutcome::Known
        );
        assert_eq!(
            known_hosts.verify("example.com", 2222, &key).unwrap(),
            VerifyOutcome::Unknown
        );
    }

    #[test]
    fn append_adds_separator_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = known_hosts_in(&dir);
        std::fs::write(known_hosts.path(), "# preamble without newline").unwrap();
        known_hosts.trust_and_append("h", 22, &test_key()).unwrap();

        let text = std::fs::read_to_string(known_hosts.path()).unwrap();
        assert!(text.starts_with("# preamble without newline\n[h]:22 "));
    }

    #[test]
    fn file_created_0600() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = known_hosts_in(&dir);
        known_hosts.trust_and_append("h", 22, &test_key()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(known_hosts.path())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
