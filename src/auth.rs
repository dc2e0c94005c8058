//! Credential resolution for SSH authentication.
//!
//! Given a host entry (or app profile) and an optional caller-supplied
//! password, the broker produces the ordered list of methods the connection
//! factory offers to the handshake. The broker only ever reads the
//! keychain; persisting a password is a surface-level decision made after a
//! successful connect.

use std::path::PathBuf;
use std::sync::Arc;

use log::warn;
use russh::keys::{PrivateKey, load_secret_key};

use crate::appconfig::{AuthMethodKind, SshProfile};
use crate::error::{Error, Result};
use crate::paths::expand_tilde;
use crate::secrets::SecretStore;
use crate::sshconfig::HostEntry;

/// One authentication method, in the order it will be offered.
#[derive(Clone)]
pub enum AuthCredential {
    Password(String),
    PrivateKey {
        key: Arc<PrivateKey>,
        source: PathBuf,
    },
}

impl std::fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        match self {
            AuthCredential::Password(_) => f.write_str("Password(…)"),
            AuthCredential::PrivateKey { source, .. } => {
                write!(f, "PrivateKey({})", source.display())
            }
        }
    }
}

/// Resolves credentials across caller input, the OS keychain and identity
/// files.
pub struct CredentialBroker {
    secrets: Arc<SecretStore>,
}

impl CredentialBroker {
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        Self { secrets }
    }

    /// Ordered methods for an SSH config host.
    ///
    /// Priority: caller password, keychain secret for the alias (then for
    /// each extra scope key, e.g. a tunnel id), identity file. Key parse
    /// failures are logged and skipped. An empty result fails with
    /// [`Error::PasswordRequired`].
    pub fn methods_for_host(
        &self,
        entry: &HostEntry,
        caller_password: Option<&str>,
        scope_keys: &[&str],
    ) -> Result<Vec<AuthCredential>> {
        let mut methods = Vec::new();

        if let Some(password) = caller_password {
            if !password.is_empty() {
                methods.push(AuthCredential::Password(password.to_string()));
            }
        }

        for key in std::iter::once(entry.alias.as_str()).chain(scope_keys.iter().copied()) {
            if let Some(saved) = self.secrets.password_for(key)? {
                methods.push(AuthCredential::Password(saved));
                break;
            }
        }

        if let Some(identity) = &entry.identity_file {
            if let Some(credential) = load_identity(identity) {
                methods.push(credential);
            }
        }

        if methods.is_empty() {
            return Err(Error::PasswordRequired {
                alias: entry.alias.clone(),
                msg: "no saved password or usable identity file".to_string(),
            });
        }
        Ok(methods)
    }

    /// Ordered methods for an app-level profile.
    pub fn methods_for_profile(
        &self,
        profile: &SshProfile,
        caller_password: Option<&str>,
    ) -> Result<Vec<AuthCredential>> {
        let mut methods = Vec::new();

        if let Some(password) = caller_password {
            if !password.is_empty() {
                methods.push(AuthCredential::Password(password.to_string()));
            }
        }

        match profile.auth_method {
            AuthMethodKind::Password => {
                if let Some(password) = profile.password.as_deref().filter(|p| !p.is_empty()) {
                    methods.push(AuthCredential::Password(password.to_string()));
                } else if let Some(saved) = self.secrets.password_for(&profile.id)? {
                    methods.push(AuthCredential::Password(saved));
                }
            }
            AuthMethodKind::Key => {
                if let Some(key_path) = profile.key_path.as_deref().filter(|p| !p.is_empty()) {
                    if let Some(credential) = load_identity(key_path) {
                        methods.push(credential);
                    }
                }
            }
        }

        if methods.is_empty() {
            return Err(Error::PasswordRequired {
                alias: profile.name.clone(),
                msg: "no credential configured for this profile".to_string(),
            });
        }
        Ok(methods)
    }
}

fn load_identity(raw_path: &str) -> Option<AuthCredential> {
    let path = expand_tilde(raw_path);
    match load_secret_key(&path, None) {
        Ok(key) => Some(AuthCredential::PrivateKey {
            key: Arc::new(key),
            source: path,
        }),
        Err(err) => {
            warn!("skipping identity file {}: {err}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::testing::MemoryBackend;

    fn broker_with(entries: &[(&str, &str)]) -> CredentialBroker {
        let backend = MemoryBackend::default();
        let store = SecretStore::with_backend(Box::new(backend));
        for (key, value) in entries {
            store.save_password(key, value).unwrap();
        }
        CredentialBroker::new(Arc::new(store))
    }

    fn entry(alias: &str) -> HostEntry {
        HostEntry::named(alias)
    }

    #[test]
    fn caller_password_comes_first() {
        let broker = broker_with(&[("web", "saved")]);
        let methods = broker
            .methods_for_host(&entry("web"), Some("typed"), &[])
            .unwrap();
        assert!(matches!(&methods[0], AuthCredential::Password(p) if p == "typed"));
        assert!(matches!(&methods[1], AuthCredential::Password(p) if p == "saved"));
    }

    #[test]
    fn tunnel_scope_key_is_consulted_after_alias() {
        let broker = broker_with(&[("tunnel-1", "scoped")]);
        let methods = broker
            .methods_for_host(&entry("web"), None, &["tunnel-1"])
            .unwrap();
        assert_eq!(methods.len(), 1);
        assert!(matches!(&methods[0], AuthCredential::Password(p) if p == "scoped"));
    }

    #[test]
    fn unreadable_identity_file_is_skipped_not_fatal() {
        let broker = broker_with(&[("web", "saved")]);
        let mut host = entry("web");
        host.identity_file = Some("/nonexistent/id_rsa".to_string());
        let methods = broker.methods_for_host(&host, None, &[]).unwrap();
        assert_eq!(methods.len(), 1);
    }

    #[test]
    fn no_credentials_fails_password_required() {
        let broker = broker_with(&[]);
        let err = broker.methods_for_host(&entry("web"), None, &[]).unwrap_err();
        match err {
            Error::PasswordRequired { alias, .. } => assert_eq!(alias, "web"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_caller_password_does_not_count() {
        let broker = broker_with(&[]);
        assert!(broker.methods_for_host(&entry("web"), Some(""), &[]).is_err());
    }

    #[test]
    fn profile_key_auth_requires_readable_key() {
        let broker = broker_with(&[]);
        let profile = SshProfile {
            id: "c1".into(),
            name: "prod".into(),
            host: "example.com".into(),
            port: 22,
            user: "root".into(),
            auth_method: AuthMethodKind::Key,
            password: None,
            key_path: Some("/nonexistent/key".into()),
            clipboard_file_path: None,
            extra: Default::default(),
        };
        assert!(matches!(
            broker.methods_for_profile(&profile, None),
            Err(Error::PasswordRequired { .. })
        ));
    }
}
