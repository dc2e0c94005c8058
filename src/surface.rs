//! The flat command surface consumed by the UI.
//!
//! [`App`] owns every long-lived component and exposes one async method per
//! command. The typed methods return [`crate::error::Error`]; the
//! [`App::dispatch`] mapping converts inputs from JSON and errors to plain
//! strings, so a function-call bridge, HTTP/JSON or stdio transport are all
//! mechanical to bolt on.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::appconfig::{AppConfigStore, SshProfile, SyncPair};
use crate::auth::CredentialBroker;
use crate::bridge::{TerminalBridge, TerminalSessionInfo, valid_session_id};
use crate::connect::ConnectionFactory;
use crate::error::{Error, Result};
use crate::events::{AppEvent, EventBus};
use crate::hostkeys::{self, KnownHosts};
use crate::launcher::{SystemTerminalLauncher, TerminalLauncher};
use crate::paths;
use crate::secrets::SecretStore;
use crate::sshconfig::{HostEntry, SshConfigStore};
use crate::sync::SyncService;
use crate::tunnel::{ActiveTunnel, TunnelManager};

/// File locations, overridable for tests and portable installs.
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub ssh_config_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    pub app_config_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
}

/// Root of the core: every command the UI can invoke lives here.
pub struct App {
    store: Arc<SshConfigStore>,
    appcfg: Arc<AppConfigStore>,
    secrets: Arc<SecretStore>,
    factory: Arc<ConnectionFactory>,
    tunnels: Arc<TunnelManager>,
    sync: Arc<SyncService>,
    bridge: Arc<TerminalBridge>,
    launcher: Arc<dyn TerminalLauncher>,
    events: EventBus,
    cancel: CancellationToken,
}

impl App {
    /// Starts the core with platform defaults.
    pub async fn start(options: AppOptions) -> Result<Arc<Self>> {
        Self::start_with(
            options,
            SecretStore::new(),
            Arc::new(SystemTerminalLauncher),
        )
        .await
    }

    /// Starts the core with explicit secret and launcher implementations.
    pub async fn start_with(
        options: AppOptions,
        secrets: SecretStore,
        launcher: Arc<dyn TerminalLauncher>,
    ) -> Result<Arc<Self>> {
        let ssh_config_path = match options.ssh_config_path {
            Some(path) => path,
            None => paths::ssh_config_path()?,
        };
        let known_hosts_path = match options.known_hosts_path {
            Some(path) => path,
            None => paths::known_hosts_path()?,
        };
        let app_config_path = match options.app_config_path {
            Some(path) => path,
            None => paths::app_config_path()?,
        };
        let log_path = match options.log_path {
            Some(path) => path,
            None => paths::app_log_path()?,
        };

        let events = EventBus::with_log_file(log_path);
        let cancel = CancellationToken::new();

        let store = Arc::new(SshConfigStore::open(ssh_config_path)?);
        let appcfg = Arc::new(AppConfigStore::open(app_config_path)?);
        let secrets = Arc::new(secrets);
        let broker = Arc::new(CredentialBroker::new(secrets.clone()));
        let known_hosts = KnownHosts::new(known_hosts_path);
        let factory = Arc::new(ConnectionFactory::new(
            store.clone(),
            broker,
            known_hosts,
            events.clone(),
            cancel.child_token(),
        ));
        let tunnels = Arc::new(TunnelManager::new(
            factory.clone(),
            events.clone(),
            cancel.child_token(),
        ));
        let sync = Arc::new(SyncService::new(
            factory.clone(),
            events.clone(),
            cancel.child_token(),
        ));
        let bridge = TerminalBridge::start(events.clone(), cancel.child_token()).await?;

        info!("devgate core started");
        Ok(Arc::new(Self {
            store,
            appcfg,
            secrets,
            factory,
            tunnels,
            sync,
            bridge,
            launcher,
            events,
            cancel,
        }))
    }

    /// Ordered stream of everything the core reports.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    // --- Config CRUD -----------------------------------------------------

    pub async fn get_configs(&self) -> Vec<SshProfile> {
        self.appcfg.configs().await
    }

    pub async fn save_config(&self, profile: SshProfile) -> Result<SshProfile> {
        let saved = self.appcfg.save_config(profile).await?;
        self.events.info(format!("saved config '{}'", saved.name));
        Ok(saved)
    }

    pub async fn delete_config(&self, id: &str) -> Result<()> {
        self.sync.stop_watching_config(id).await?;
        self.appcfg.delete_config(id).await
    }

    pub async fn get_sync_pairs(&self, config_id: &str) -> Result<Vec<SyncPair>> {
        self.appcfg.sync_pairs(config_id).await
    }

    pub async fn save_sync_pair(&self, pair: SyncPair) -> Result<SyncPair> {
        self.appcfg.save_sync_pair(pair).await
    }

    pub async fn delete_sync_pair(&self, pair_id: &str) -> Result<()> {
        self.sync.remove_watch(pair_id).await?;
        self.appcfg.delete_sync_pair(pair_id).await
    }

    // --- SSH config file -------------------------------------------------

    pub async fn get_ssh_hosts(&self) -> Vec<HostEntry> {
        self.store.hosts().await
    }

    pub async fn save_ssh_host(&self, host: HostEntry) -> Result<()> {
        if host.alias.trim().is_empty() {
            return Err(Error::Validation("host alias must not be empty".into()));
        }
        self.store.upsert_host(&host).await?;
        self.events.info(format!("saved SSH host '{}'", host.alias));
        Ok(())
    }

    pub async fn delete_ssh_host(&self, alias: &str) -> Result<()> {
        self.store.remove_host(alias).await?;
        self.events.info(format!("removed SSH host '{alias}'"));
        Ok(())
    }

    pub async fn rename_ssh_host(&self, old: &str, new: &str) -> Result<()> {
        self.store.rename_host(old, new).await
    }

    pub async fn reorder_ssh_hosts(&self, order: Vec<String>) -> Result<()> {
        self.store.reorder_hosts(&order).await
    }

    pub async fn reload_ssh_hosts(&self) -> Result<Vec<HostEntry>> {
        self.store.reload().await?;
        Ok(self.store.hosts().await)
    }

    pub async fn get_ssh_config_file_content(&self) -> String {
        self.store.raw_content().await
    }

    pub async fn save_ssh_config_file_content(&self, text: &str) -> Result<()> {
        self.store.save_raw_content(text).await
    }

    pub async fn backup_ssh_config(&self) -> Result<PathBuf> {
        self.store.backup().await
    }

    // --- Connect ---------------------------------------------------------

    /// Handshake-and-close using the profile's own credentials.
    pub async fn test_connection(&self, profile: SshProfile) -> Result<()> {
        self.factory.dry_run_profile(&profile, None).await?;
        self.events
            .success(format!("connection to '{}' works", profile.name));
        Ok(())
    }

    /// Validates credentials and host key, then opens the system terminal.
    pub async fn connect_in_terminal(&self, alias: &str) -> Result<()> {
        self.connect_in_terminal_inner(alias, None, false).await
    }

    /// Same as [`App::connect_in_terminal`] but with a one-shot password;
    /// `save` persists it to the keychain after a successful connect.
    pub async fn connect_in_terminal_with_password(
        &self,
        alias: &str,
        password: &str,
        save: bool,
    ) -> Result<()> {
        self.connect_in_terminal_inner(alias, Some(password), save)
            .await
    }

    /// Trusts the host key currently offered by the server, then connects.
    pub async fn connect_in_terminal_and_trust_host(
        &self,
        alias: &str,
        password: &str,
        save: bool,
    ) -> Result<()> {
        let entry = self.store.get_host(alias).await?;
        let key = hostkeys::capture_host_key(entry.dial_host(), entry.port).await?;
        self.factory
            .known_hosts()
            .trust_and_append(entry.dial_host(), entry.port, &key)?;
        self.events.info(format!(
            "trusted host key {} for '{alias}'",
            hostkeys::fingerprint(&key)
        ));
        self.connect_in_terminal_inner(
            alias,
            if password.is_empty() {
                None
            } else {
                Some(password)
            },
            save,
        )
        .await
    }

    async fn connect_in_terminal_inner(
        &self,
        alias: &str,
        password: Option<&str>,
        save: bool,
    ) -> Result<()> {
        self.factory.dry_run_host(alias, password).await?;
        if save {
            if let Some(password) = password {
                self.secrets.save_password(alias, password)?;
            }
        }
        self.launcher
            .open_ssh_terminal(alias)
            .map_err(|err| Error::ConnectionFailed(format!("{err}")))?;
        self.events.ssh_status(alias, "connected", "terminal opened");
        Ok(())
    }

    /// Opens a remote shell and returns the WebSocket endpoint for it.
    pub async fn start_remote_session(
        &self,
        alias: &str,
        session_id: &str,
        password: &str,
    ) -> Result<TerminalSessionInfo> {
        valid_session_id(session_id)?;
        let password = if password.is_empty() {
            None
        } else {
            Some(password)
        };
        let session = Arc::new(self.factory.connect_host(alias, password, &[]).await?);
        let channel = session.open_shell(80, 24).await?;
        Ok(self.bridge.register(session_id, alias, channel, session))
    }

    // --- Secrets ---------------------------------------------------------

    pub fn save_password_for_alias(&self, alias: &str, password: &str) -> Result<()> {
        self.secrets.save_password(alias, password)
    }

    pub fn delete_password_for_alias(&self, alias: &str) -> Result<()> {
        self.secrets.delete_password(alias)
    }

    // --- Tunnels ---------------------------------------------------------

    pub async fn start_local_forward(
        &self,
        alias: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        password: &str,
    ) -> Result<String> {
        let password = if password.is_empty() {
            None
        } else {
            Some(password)
        };
        self.tunnels
            .start_local_forward(alias, local_port, remote_host, remote_port, password, None)
            .await
    }

    /// Starts a forward from a saved tunnel definition; its
    /// `saved_password_ref` names the keychain entry to consult.
    pub async fn start_saved_tunnel(&self, tunnel_id: &str) -> Result<String> {
        let tunnel = self
            .appcfg
            .tunnels()
            .await
            .into_iter()
            .find(|t| t.id == tunnel_id)
            .ok_or_else(|| Error::ConfigNotFound(tunnel_id.to_string()))?;
        self.tunnels
            .start_local_forward(
                &tunnel.alias,
                tunnel.local_port,
                &tunnel.remote_host,
                tunnel.remote_port,
                None,
                tunnel.saved_password_ref.as_deref(),
            )
            .await
    }

    pub async fn get_tunnel_configs(&self) -> Vec<crate::appconfig::TunnelConfig> {
        self.appcfg.tunnels().await
    }

    pub async fn save_tunnel_config(
        &self,
        tunnel: crate::appconfig::TunnelConfig,
    ) -> Result<crate::appconfig::TunnelConfig> {
        self.appcfg.save_tunnel(tunnel).await
    }

    pub async fn delete_tunnel_config(&self, id: &str) -> Result<()> {
        self.appcfg.delete_tunnel(id).await
    }

    pub async fn stop_forward(&self, runtime_id: &str) -> Result<()> {
        self.tunnels.stop_forward(runtime_id).await
    }

    pub fn get_active_tunnels(&self) -> Vec<ActiveTunnel> {
        self.tunnels.active_tunnels()
    }

    // --- Watching --------------------------------------------------------

    /// Runs the initial reconcile and starts watching every pair of the
    /// profile. Already-watched pairs are untouched, making a repeat call
    /// a successful no-op.
    pub async fn start_watching(&self, config_id: &str) -> Result<()> {
        let profile = self.appcfg.config(config_id).await?;
        let pairs = self.appcfg.sync_pairs(config_id).await?;
        for pair in &pairs {
            self.sync.add_watch(&profile, pair).await?;
        }
        Ok(())
    }

    pub async fn stop_watching(&self, config_id: &str) -> Result<()> {
        self.sync.stop_watching_config(config_id).await
    }

    pub fn get_watch_statuses(&self) -> Vec<crate::sync::WatchStatus> {
        self.sync.watch_statuses()
    }

    // --- Clipboard -------------------------------------------------------

    /// Writes clipboard content to a remote file over SFTP, optionally
    /// wrapped into a minimal HTML document.
    pub async fn update_remote_file_from_clipboard(
        &self,
        config_id: &str,
        remote_path: &str,
        content: &str,
        as_html: bool,
    ) -> Result<()> {
        let profile = self.appcfg.config(config_id).await?;
        let target = if remote_path.is_empty() {
            profile
                .clipboard_file_path
                .clone()
                .ok_or_else(|| Error::Validation("no clipboard file path configured".into()))?
        } else {
            remote_path.to_string()
        };

        let body = if as_html {
            wrap_html(content)
        } else {
            content.to_string()
        };

        let session = self.factory.pooled_profile_session(&profile, None).await?;
        let sftp = session.open_sftp().await?;
        let result = crate::sync::reconcile::with_retry(&target, || {
            let body = body.clone();
            let sftp = &sftp;
            let target = target.clone();
            async move {
                use tokio::io::AsyncWriteExt;
                let mut file = sftp
                    .create(&target)
                    .await
                    .map_err(|err| Error::Sftp(err.to_string()))?;
                file.write_all(body.as_bytes())
                    .await
                    .map_err(|err| Error::Sftp(err.to_string()))?;
                file.shutdown()
                    .await
                    .map_err(|err| Error::Sftp(err.to_string()))?;
                Ok(())
            }
        })
        .await;
        let _ = sftp.close().await;
        result?;
        self.events
            .success(format!("clipboard pushed to {target}"));
        Ok(())
    }

    // --- Lifecycle -------------------------------------------------------

    /// Orderly teardown: watchers first, then tunnels. The stores persist
    /// on every mutation, so there is nothing left to flush here.
    pub async fn shutdown(&self) {
        debug!("shutting down devgate core");
        self.sync.stop_all().await;
        self.tunnels.stop_all().await;
        self.events.emit(AppEvent::RequestQuit);
        self.cancel.cancel();
    }

    // --- Transport mapping ----------------------------------------------

    /// Generic JSON dispatch: command name plus a JSON object of camelCase
    /// arguments. Every error crosses this boundary as a plain string.
    pub async fn dispatch(&self, command: &str, payload: Value) -> std::result::Result<Value, String> {
        fn arg<T: DeserializeOwned>(payload: &Value, key: &str) -> std::result::Result<T, String> {
            let value = payload.get(key).cloned().unwrap_or(Value::Null);
            serde_json::from_value(value).map_err(|err| format!("invalid argument '{key}': {err}"))
        }
        fn ok<T: serde::Serialize>(value: T) -> std::result::Result<Value, String> {
            serde_json::to_value(value).map_err(|err| format!("{err}"))
        }
        let ui = |err: Error| err.to_ui_string();

        match command {
            "GetConfigs" => ok(self.get_configs().await),
            "SaveConfig" => {
                let profile: SshProfile = arg(&payload, "config")?;
                ok(self.save_config(profile).await.map_err(ui)?)
            }
            "DeleteConfig" => {
                let id: String = arg(&payload, "id")?;
                self.delete_config(&id).await.map_err(ui)?;
                ok(())
            }
            "GetSyncPairs" => {
                let config_id: String = arg(&payload, "configId")?;
                ok(self.get_sync_pairs(&config_id).await.map_err(ui)?)
            }
            "SaveSyncPair" => {
                let pair: SyncPair = arg(&payload, "pair")?;
                ok(self.save_sync_pair(pair).await.map_err(ui)?)
            }
            "DeleteSyncPair" => {
                let pair_id: String = arg(&payload, "pairId")?;
                self.delete_sync_pair(&pair_id).await.map_err(ui)?;
                ok(())
            }
            "GetSSHHosts" => ok(self.get_ssh_hosts().await),
            "SaveSSHHost" => {
                let host: HostEntry = arg(&payload, "host")?;
                self.save_ssh_host(host).await.map_err(ui)?;
                ok(())
            }
            "DeleteSSHHost" => {
                let alias: String = arg(&payload, "alias")?;
                self.delete_ssh_host(&alias).await.map_err(ui)?;
                ok(())
            }
            "ReloadSSHHosts" => ok(self.reload_ssh_hosts().await.map_err(ui)?),
            "GetSSHConfigFileContent" => ok(self.get_ssh_config_file_content().await),
            "SaveSSHConfigFileContent" => {
                let text: String = arg(&payload, "content")?;
                self.save_ssh_config_file_content(&text).await.map_err(ui)?;
                ok(())
            }
            "TestConnection" => {
                let profile: SshProfile = arg(&payload, "config")?;
                self.test_connection(profile).await.map_err(ui)?;
                ok(())
            }
            "ConnectInTerminal" => {
                let alias: String = arg(&payload, "alias")?;
                self.connect_in_terminal(&alias).await.map_err(ui)?;
                ok(())
            }
            "ConnectInTerminalWithPassword" => {
                let alias: String = arg(&payload, "alias")?;
                let password: String = arg(&payload, "password")?;
                let save: bool = arg(&payload, "save")?;
                self.connect_in_terminal_with_password(&alias, &password, save)
                    .await
                    .map_err(ui)?;
                ok(())
            }
            "ConnectInTerminalAndTrustHost" => {
                let alias: String = arg(&payload, "alias")?;
                let password: String = arg(&payload, "password")?;
                let save: bool = arg(&payload, "save")?;
                self.connect_in_terminal_and_trust_host(&alias, &password, save)
                    .await
                    .map_err(ui)?;
                ok(())
            }
            "StartRemoteSession" => {
                let alias: String = arg(&payload, "alias")?;
                let session_id: String = arg(&payload, "sessionId")?;
                let password: String = arg(&payload, "password")?;
                ok(self
                    .start_remote_session(&alias, &session_id, &password)
                    .await
                    .map_err(ui)?)
            }
            "SavePasswordForAlias" => {
                let alias: String = arg(&payload, "alias")?;
                let password: String = arg(&payload, "password")?;
                self.save_password_for_alias(&alias, &password).map_err(ui)?;
                ok(())
            }
            "DeletePasswordForAlias" => {
                let alias: String = arg(&payload, "alias")?;
                self.delete_password_for_alias(&alias).map_err(ui)?;
                ok(())
            }
            "StartLocalForward" => {
                let alias: String = arg(&payload, "alias")?;
                let local_port: u16 = arg(&payload, "localPort")?;
                let remote_host: String = arg(&payload, "remoteHost")?;
                let remote_port: u16 = arg(&payload, "remotePort")?;
                let password: String = arg(&payload, "password")?;
                ok(self
                    .start_local_forward(&alias, local_port, &remote_host, remote_port, &password)
                    .await
                    .map_err(ui)?)
            }
            "StopForward" => {
                let runtime_id: String = arg(&payload, "runtimeId")?;
                self.stop_forward(&runtime_id).await.map_err(ui)?;
                ok(())
            }
            "GetActiveTunnels" => ok(self.get_active_tunnels()),
            "GetTunnelConfigs" => ok(self.get_tunnel_configs().await),
            "SaveTunnelConfig" => {
                let tunnel: crate::appconfig::TunnelConfig = arg(&payload, "tunnel")?;
                ok(self.save_tunnel_config(tunnel).await.map_err(ui)?)
            }
            "DeleteTunnelConfig" => {
                let id: String = arg(&payload, "id")?;
                self.delete_tunnel_config(&id).await.map_err(ui)?;
                ok(())
            }
            "StartSavedTunnel" => {
                let tunnel_id: String = arg(&payload, "tunnelId")?;
                ok(self.start_saved_tunnel(&tunnel_id).await.map_err(ui)?)
            }
            "RenameSSHHost" => {
                let old: String = arg(&payload, "oldAlias")?;
                let new: String = arg(&payload, "newAlias")?;
                self.rename_ssh_host(&old, &new).await.map_err(ui)?;
                ok(())
            }
            "ReorderSSHHosts" => {
                let order: Vec<String> = arg(&payload, "order")?;
                self.reorder_ssh_hosts(order).await.map_err(ui)?;
                ok(())
            }
            "BackupSSHConfig" => {
                let path = self.backup_ssh_config().await.map_err(ui)?;
                ok(path.display().to_string())
            }
            "StartWatching" => {
                let config_id: String = arg(&payload, "configId")?;
                self.start_watching(&config_id).await.map_err(ui)?;
                ok(())
            }
            "StopWatching" => {
                let config_id: String = arg(&payload, "configId")?;
                self.stop_watching(&config_id).await.map_err(ui)?;
                ok(())
            }
            "UpdateRemoteFileFromClipboard" => {
                let config_id: String = arg(&payload, "configId")?;
                let remote_path: String = arg(&payload, "remotePath")?;
                let content: String = arg(&payload, "content")?;
                let as_html: bool = arg(&payload, "asHtml")?;
                self.update_remote_file_from_clipboard(&config_id, &remote_path, &content, as_html)
                    .await
                    .map_err(ui)?;
                ok(())
            }
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

fn wrap_html(content: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"></head>\n<body>\n{content}\n</body>\n</html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::testing::RecordingLauncher;
    use crate::secrets::testing::MemoryBackend;

    async fn test_app() -> (tempfile::TempDir, Arc<App>) {
        let dir = tempfile::tempdir().unwrap();
        let options = AppOptions {
            ssh_config_path: Some(dir.path().join("config")),
            known_hosts_path: Some(dir.path().join("known_hosts")),
            app_config_path: Some(dir.path().join("config.json")),
            log_path: Some(dir.path().join("app.log")),
        };
        let app = App::start_with(
            options,
            SecretStore::with_backend(Box::new(MemoryBackend::default())),
            Arc::new(RecordingLauncher::default()),
        )
        .await
        .unwrap();
        (dir, app)
    }

    #[tokio::test]
    async fn ssh_host_crud_through_dispatch() {
        let (_dir, app) = test_app().await;

        let save = app
            .dispatch(
                "SaveSSHHost",
                serde_json::json!({
                    "host": {
                        "alias": "web",
                        "aliases": ["web"],
                        "hostName": "1.2.3.4",
                        "user": "deploy",
                        "port": 2222
                    }
                }),
            )
            .await;
        assert!(save.is_ok(), "{save:?}");

        let hosts = app.dispatch("GetSSHHosts", Value::Null).await.unwrap();
        assert_eq!(hosts[0]["alias"], "web");
        assert_eq!(hosts[0]["port"], 2222);

        app.dispatch("DeleteSSHHost", serde_json::json!({"alias": "web"}))
            .await
            .unwrap();
        let hosts = app.dispatch("GetSSHHosts", Value::Null).await.unwrap();
        assert_eq!(hosts.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn dispatch_errors_are_plain_strings() {
        let (_dir, app) = test_app().await;
        let err = app
            .dispatch("DeleteConfig", serde_json::json!({"id": "ghost"}))
            .await
            .unwrap_err();
        assert_eq!(err, "config 'ghost' not found");

        let err = app.dispatch("Nope", Value::Null).await.unwrap_err();
        assert!(err.contains("unknown command"));
    }

    #[tokio::test]
    async fn watching_unknown_config_reports_config_not_found() {
        let (_dir, app) = test_app().await;
        let err = app.start_watching("missing").await.unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn secrets_round_trip_via_surface() {
        let (_dir, app) = test_app().await;
        app.save_password_for_alias("web", "pw").unwrap();
        app.delete_password_for_alias("web").unwrap();
        // Deleting again stays idempotent.
        app.delete_password_for_alias("web").unwrap();
    }

    #[tokio::test]
    async fn shutdown_emits_request_quit() {
        let (_dir, app) = test_app().await;
        let mut rx = app.subscribe_events();
        app.shutdown().await;
        loop {
            match rx.recv().await {
                Ok(AppEvent::RequestQuit) => break,
                Ok(_) => continue,
                Err(err) => panic!("stream ended early: {err}"),
            }
        }
    }

    #[test]
    fn html_wrapper_contains_body() {
        let html = wrap_html("<b>hi</b>");
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<b>hi</b>"));
        assert!(html.ends_with("</html>\n"));
    }

    #[tokio::test]
    async fn stop_forward_on_unknown_id_is_ok() {
        let (_dir, app) = test_app().await;
        app.stop_forward("tun-missing").await.unwrap();
        app.stop_forward("tun-missing").await.unwrap();
        assert!(app.get_active_tunnels().is_empty());
    }
}
