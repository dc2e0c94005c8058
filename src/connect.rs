//! Building and dialing authenticated SSH sessions.
//!
//! The factory resolves a host entry or app profile to a dial target, asks
//! the credential broker for an ordered method list, performs the handshake
//! with host-key verification wired in, and attaches the keep-alive
//! supervisor to every long-lived session. A small moka-backed pool reuses
//! sessions for one-shot surface operations (terminal attach, clipboard
//! upload) keyed by `user@host:port` with password-hash parameter matching.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use moka::future::Cache;
use russh::client;
use russh::keys::PrivateKeyWithHashAlg;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthCredential, CredentialBroker};
use crate::appconfig::SshProfile;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::hostkeys::{self, CapturedKey, KnownHosts, VerifyingHandler};
use crate::sshconfig::{DEFAULT_SSH_PORT, HostEntry, SshConfigStore};

/// Hard deadline for the TCP+SSH handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence of the keep-alive supervisor.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Bound on a single keep-alive probe so a half-open TCP connection cannot
/// wedge the supervisor.
pub const KEEPALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a session is headed, independent of how it was looked up.
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl DialTarget {
    pub fn from_entry(entry: &HostEntry) -> Self {
        Self {
            alias: entry.alias.clone(),
            host: entry.dial_host().to_string(),
            port: entry.port,
            user: entry
                .user
                .clone()
                .unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "root".to_string())),
        }
    }

    pub fn from_profile(profile: &SshProfile) -> Self {
        Self {
            alias: profile.name.clone(),
            host: profile.host.clone(),
            port: if profile.port == 0 {
                DEFAULT_SSH_PORT
            } else {
                profile.port
            },
            user: profile.user.clone(),
        }
    }

    fn pool_key(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// An authenticated SSH client plus its keep-alive supervisor.
pub struct SshSession {
    target: DialTarget,
    handle: client::Handle<VerifyingHandler>,
    dead_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl SshSession {
    pub fn target(&self) -> &DialTarget {
        &self.target
    }

    pub fn handle(&self) -> &client::Handle<VerifyingHandler> {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Receiver that flips to `true` once the keep-alive supervisor
    /// declares the peer dead.
    pub fn subscribe_liveness(&self) -> watch::Receiver<bool> {
        self.dead_rx.clone()
    }

    /// Opens a `direct-tcpip` channel to the remote endpoint.
    pub async fn open_direct_tcpip(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: &str,
        originator_port: u16,
    ) -> Result<russh::Channel<client::Msg>> {
        self.handle
            .channel_open_direct_tcpip(
                remote_host,
                u32::from(remote_port),
                originator,
                u32::from(originator_port),
            )
            .await
            .map_err(Error::from)
    }

    /// Opens an SFTP subsystem channel and hands back a ready client.
    pub async fn open_sftp(&self) -> Result<russh_sftp::client::SftpSession> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(Error::from)
    }

    /// Opens an interactive shell with a PTY of the given size.
    pub async fn open_shell(
        &self,
        cols: u32,
        rows: u32,
    ) -> Result<russh::Channel<client::Msg>> {
        let mut channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;
        Ok(channel)
    }

    /// Stops the supervisor and disconnects. Safe to call more than once.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

struct PooledSession {
    session: Arc<SshSession>,
    password_hash: [u8; 32],
}

/// Builds and dials SSH sessions.
pub struct ConnectionFactory {
    store: Arc<SshConfigStore>,
    broker: Arc<CredentialBroker>,
    known_hosts: KnownHosts,
    events: EventBus,
    cancel: CancellationToken,
    pool: Cache<String, Arc<PooledSession>>,
}

impl ConnectionFactory {
    pub fn new(
        store: Arc<SshConfigStore>,
        broker: Arc<CredentialBroker>,
        known_hosts: KnownHosts,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        // Reused one-shot sessions are evicted after five idle minutes.
        let pool = Cache::builder()
            .max_capacity(64)
            .time_to_idle(Duration::from_secs(5 * 60))
            .build();
        Self {
            store,
            broker,
            known_hosts,
            events,
            cancel,
            pool,
        }
    }

    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }

    /// Resolves an alias through the SSH config store and connects.
    /// `scope_keys` name additional keychain entries (e.g. a tunnel id)
    /// consulted after the alias itself.
    pub async fn connect_host(
        &self,
        alias: &str,
        password: Option<&str>,
        scope_keys: &[&str],
    ) -> Result<SshSession> {
        let entry = self.store.get_host(alias).await?;
        let methods = self.broker.methods_for_host(&entry, password, scope_keys)?;
        self.dial(DialTarget::from_entry(&entry), methods).await
    }

    /// Handshake-and-close check for an alias.
    pub async fn dry_run_host(&self, alias: &str, password: Option<&str>) -> Result<()> {
        let session = self.connect_host(alias, password, &[]).await?;
        session.close().await;
        Ok(())
    }

    /// Connects using an app-level profile.
    pub async fn connect_profile(
        &self,
        profile: &SshProfile,
        password: Option<&str>,
    ) -> Result<SshSession> {
        let methods = self.broker.methods_for_profile(profile, password)?;
        self.dial(DialTarget::from_profile(profile), methods).await
    }

    /// Handshake-and-close check for a profile.
    pub async fn dry_run_profile(&self, profile: &SshProfile, password: Option<&str>) -> Result<()> {
        let session = self.connect_profile(profile, password).await?;
        session.close().await;
        Ok(())
    }

    /// Pooled session for one-shot operations against a profile. The cached
    /// session is reused only while it is alive and the effective password
    /// still hashes to the same value.
    pub async fn pooled_profile_session(
        &self,
        profile: &SshProfile,
        password: Option<&str>,
    ) -> Result<Arc<SshSession>> {
        let target = DialTarget::from_profile(profile);
        let key = target.pool_key();
        let password_hash = hash_password(password.or(profile.password.as_deref()));

        if let Some(pooled) = self.pool.get(&key).await {
            if !pooled.session.is_closed() && pooled.password_hash == password_hash {
                debug!("session pool hit: {key}");
                return Ok(pooled.session.clone());
            }
            debug!("session pool entry stale, reconnecting: {key}");
            pooled.session.close().await;
            self.pool.invalidate(&key).await;
        }

        let session = Arc::new(self.connect_profile(profile, password).await?);
        self.pool
            .insert(
                key,
                Arc::new(PooledSession {
                    session: session.clone(),
                    password_hash,
                }),
            )
            .await;
        Ok(session)
    }

    async fn dial(
        &self,
        target: DialTarget,
        methods: Vec<AuthCredential>,
    ) -> Result<SshSession> {
        let captured: CapturedKey = Default::default();
        let handler = VerifyingHandler::new(
            self.known_hosts.clone(),
            target.host.clone(),
            target.port,
            captured.clone(),
        );
        // keepalive_interval makes russh emit keepalive@openssh.com on the
        // wire; the supervisor below is what enforces our own deadline.
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            inactivity_timeout: None,
            ..Default::default()
        });

        let dialed = tokio::time::timeout(
            DIAL_TIMEOUT,
            client::connect(config, (target.host.clone(), target.port), handler),
        )
        .await;

        let mut handle = match dialed {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                if let Some(key) = captured.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    return Err(Error::HostKeyVerificationRequired {
                        alias: target.alias.clone(),
                        fingerprint: hostkeys::fingerprint(&key),
                        host_address: hostkeys::format_address(&target.host, target.port),
                    });
                }
                return Err(translate_handshake_error(&target.alias, &err.to_string()));
            }
            Err(_) => {
                return Err(Error::ConnectionFailed(format!(
                    "dial {}:{} timed out after {}s",
                    target.host,
                    target.port,
                    DIAL_TIMEOUT.as_secs()
                )));
            }
        };

        let mut authenticated = false;
        let mut last_failure: Option<String> = None;
        for method in methods {
            let outcome = match method {
                AuthCredential::Password(password) => {
                    handle
                        .authenticate_password(target.user.as_str(), password.as_str())
                        .await
                }
                AuthCredential::PrivateKey { key, source } => {
                    let hash_alg = if key.algorithm().is_rsa() {
                        handle
                            .best_supported_rsa_hash()
                            .await
                            .unwrap_or(None)
                            .flatten()
                    } else {
                        None
                    };
                    debug!("offering identity file {}", source.display());
                    handle
                        .authenticate_publickey(
                            target.user.as_str(),
                            PrivateKeyWithHashAlg::new(key, hash_alg),
                        )
                        .await
                }
            };
            match outcome {
                Ok(result) if result.success() => {
                    authenticated = true;
                    break;
                }
                Ok(_) => {
                    last_failure = Some("authentication failed".to_string());
                }
                Err(err) => {
                    warn!("auth method error for {}: {err}", target.alias);
                    last_failure = Some(err.to_string());
                }
            }
        }

        if !authenticated {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            let text = last_failure.unwrap_or_else(|| "authentication failed".to_string());
            return Err(match translate_handshake_error(&target.alias, &text) {
                Error::ConnectionFailed(_) => Error::AuthenticationFailed(target.alias.clone()),
                translated => translated,
            });
        }

        debug!("ssh session established: {}", target.pool_key());
        self.events
            .ssh_status(&target.alias, "connected", target.pool_key());

        let cancel = self.cancel.child_token();
        let (dead_tx, dead_rx) = watch::channel(false);
        spawn_keepalive(handle.clone(), target.clone(), dead_tx, cancel.clone());

        Ok(SshSession {
            target,
            handle,
            dead_rx,
            cancel,
        })
    }
}

fn spawn_keepalive(
    handle: client::Handle<VerifyingHandler>,
    target: DialTarget,
    dead_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if handle.is_closed() {
                        let _ = dead_tx.send(true);
                        break;
                    }
                    let probe = tokio::time::timeout(
                        KEEPALIVE_PROBE_TIMEOUT,
                        handle.channel_open_session(),
                    )
                    .await;
                    match probe {
                        Ok(Ok(channel)) => {
                            let _ = channel.close().await;
                        }
                        Ok(Err(err)) => {
                            warn!("keep-alive failed for {}: {err}", target.alias);
                            let _ = dead_tx.send(true);
                            let _ = handle
                                .disconnect(russh::Disconnect::ByApplication, "", "")
                                .await;
                            break;
                        }
                        Err(_) => {
                            warn!(
                                "keep-alive probe for {} exceeded {}s",
                                target.alias,
                                KEEPALIVE_PROBE_TIMEOUT.as_secs()
                            );
                            let _ = dead_tx.send(true);
                            let _ = handle
                                .disconnect(russh::Disconnect::ByApplication, "", "")
                                .await;
                            break;
                        }
                    }
                }
            }
        }
        debug!("keep-alive task ended for {}", target.alias);
    });
}

fn hash_password(password: Option<&str>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.unwrap_or_default().as_bytes());
    hasher.finalize().into()
}

/// Maps a raw handshake failure onto the structured taxonomy by substring,
/// the only portable signal the underlying library exposes.
pub(crate) fn translate_handshake_error(alias: &str, text: &str) -> Error {
    const AUTH_MARKERS: [&str; 5] = [
        "unable to authenticate",
        "permission denied",
        "invalid password",
        "publickey denied",
        "authentication failed",
    ];
    let lower = text.to_ascii_lowercase();
    if AUTH_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Error::AuthenticationFailed(alias.to_string());
    }
    if lower.contains("no supported methods remain") {
        return Error::PasswordRequired {
            alias: alias.to_string(),
            msg: text.to_string(),
        };
    }
    Error::ConnectionFailed(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_substrings_map_to_authentication_failed() {
        for text in [
            "server said: Unable to authenticate",
            "Permission denied (publickey)",
            "invalid password supplied",
            "publickey denied by server",
            "Authentication failed.",
        ] {
            assert!(matches!(
                translate_handshake_error("web", text),
                Error::AuthenticationFailed(alias) if alias == "web"
            ));
        }
    }

    #[test]
    fn exhausted_methods_map_to_password_required() {
        assert!(matches!(
            translate_handshake_error("web", "No supported methods remain"),
            Error::PasswordRequired { .. }
        ));
    }

    #[test]
    fn anything_else_is_a_plain_connection_failure() {
        let err = translate_handshake_error("web", "connection reset by peer");
        match err {
            Error::ConnectionFailed(msg) => assert_eq!(msg, "connection reset by peer"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dial_target_applies_default_port_and_alias_fallback() {
        let entry = HostEntry::named("web");
        let target = DialTarget::from_entry(&entry);
        assert_eq!(target.host, "web");
        assert_eq!(target.port, DEFAULT_SSH_PORT);
    }

    #[test]
    fn password_hashes_differ() {
        assert_ne!(hash_password(Some("a")), hash_password(Some("b")));
        assert_eq!(hash_password(None), hash_password(Some("")));
    }
}
