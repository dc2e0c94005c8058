//! App-level configuration: connection profiles, sync pairs and tunnels.
//!
//! Persisted as one JSON document at `DevTools/config.json` (0600),
//! rewritten atomically. Unknown fields are captured and written back so
//! newer app versions can round-trip through older cores.

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::sshconfig::DEFAULT_SSH_PORT;

/// How a profile authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethodKind {
    Password,
    Key,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// App-level connection profile, distinct from an SSH config file entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshProfile {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub auth_method: AuthMethodKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipboard_file_path: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One watched local→remote directory mapping.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncPair {
    #[serde(default)]
    pub id: String,
    pub config_id: String,
    pub local_path: String,
    pub remote_path: String,
    #[serde(default)]
    pub sync_deletes: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Saved tunnel definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    #[serde(default)]
    pub id: String,
    pub alias: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_password_ref: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Root of `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub ssh_configs: Vec<SshProfile>,
    #[serde(default)]
    pub sync_pairs: Vec<SyncPair>,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Single-writer store for the app configuration file.
pub struct AppConfigStore {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl AppConfigStore {
    /// Opens the store; a missing file yields an empty configuration.
    pub fn open(path: PathBuf) -> Result<Self> {
        let config = Self::read(&path)?;
        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    fn read(path: &Path) -> Result<AppConfig> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|err| Error::Validation(format!("config.json is not valid: {err}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&self, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)
            .map_err(|err| Error::Validation(format!("could not serialize config: {err}")))?;
        crate::sshconfig::write_atomic_0600(&self.path, &json)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All connection profiles.
    pub async fn configs(&self) -> Vec<SshProfile> {
        self.config.read().await.ssh_configs.clone()
    }

    /// One profile by id.
    pub async fn config(&self, id: &str) -> Result<SshProfile> {
        self.config
            .read()
            .await
            .ssh_configs
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::ConfigNotFound(id.to_string()))
    }

    /// Edits a clone of the configuration and commits it to memory only
    /// after the file write succeeded, so a failed save changes nothing.
    async fn mutate<T>(
        &self,
        edit: impl FnOnce(&mut AppConfig) -> Result<T>,
    ) -> Result<T> {
        let mut config = self.config.write().await;
        let mut edited = config.clone();
        let out = edit(&mut edited)?;
        self.persist(&edited)?;
        *config = edited;
        Ok(out)
    }

    /// Inserts or replaces a profile by id, assigning an id when absent.
    /// Returns the stored profile.
    pub async fn save_config(&self, mut profile: SshProfile) -> Result<SshProfile> {
        if profile.id.is_empty() {
            profile.id = uuid::Uuid::new_v4().to_string();
        }
        self.mutate(move |config| {
            match config.ssh_configs.iter_mut().find(|c| c.id == profile.id) {
                Some(slot) => *slot = profile.clone(),
                None => config.ssh_configs.push(profile.clone()),
            }
            Ok(profile)
        })
        .await
    }

    /// Deletes a profile and every sync pair referencing it.
    pub async fn delete_config(&self, id: &str) -> Result<()> {
        self.mutate(|config| {
            let before = config.ssh_configs.len();
            config.ssh_configs.retain(|c| c.id != id);
            if config.ssh_configs.len() == before {
                return Err(Error::ConfigNotFound(id.to_string()));
            }
            config.sync_pairs.retain(|p| p.config_id != id);
            Ok(())
        })
        .await
    }

    /// Sync pairs belonging to one profile.
    pub async fn sync_pairs(&self, config_id: &str) -> Result<Vec<SyncPair>> {
        let config = self.config.read().await;
        if !config.ssh_configs.iter().any(|c| c.id == config_id) {
            return Err(Error::ConfigNotFound(config_id.to_string()));
        }
        Ok(config
            .sync_pairs
            .iter()
            .filter(|p| p.config_id == config_id)
            .cloned()
            .collect())
    }

    /// Inserts or replaces a sync pair; the referenced profile must exist.
    pub async fn save_sync_pair(&self, mut pair: SyncPair) -> Result<SyncPair> {
        if pair.id.is_empty() {
            pair.id = uuid::Uuid::new_v4().to_string();
        }
        self.mutate(move |config| {
            if !config.ssh_configs.iter().any(|c| c.id == pair.config_id) {
                return Err(Error::ConfigNotFound(pair.config_id.clone()));
            }
            match config.sync_pairs.iter_mut().find(|p| p.id == pair.id) {
                Some(slot) => *slot = pair.clone(),
                None => config.sync_pairs.push(pair.clone()),
            }
            Ok(pair)
        })
        .await
    }

    /// Deletes a sync pair; unknown ids succeed (delete is idempotent).
    pub async fn delete_sync_pair(&self, pair_id: &str) -> Result<()> {
        self.mutate(|config| {
            config.sync_pairs.retain(|p| p.id != pair_id);
            Ok(())
        })
        .await
    }

    /// All saved tunnel definitions.
    pub async fn tunnels(&self) -> Vec<TunnelConfig> {
        self.config.read().await.tunnels.clone()
    }

    /// Inserts or replaces a tunnel definition.
    pub async fn save_tunnel(&self, mut tunnel: TunnelConfig) -> Result<TunnelConfig> {
        if tunnel.id.is_empty() {
            tunnel.id = uuid::Uuid::new_v4().to_string();
        }
        self.mutate(move |config| {
            match config.tunnels.iter_mut().find(|t| t.id == tunnel.id) {
                Some(slot) => *slot = tunnel.clone(),
                None => config.tunnels.push(tunnel.clone()),
            }
            Ok(tunnel)
        })
        .await
    }

    /// Deletes a tunnel definition; unknown ids succeed.
    pub async fn delete_tunnel(&self, id: &str) -> Result<()> {
        self.mutate(|config| {
            config.tunnels.retain(|t| t.id != id);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> SshProfile {
        SshProfile {
            id: String::new(),
            name: name.to_string(),
            host: "example.com".to_string(),
            port: 22,
            user: "deploy".to_string(),
            auth_method: AuthMethodKind::Password,
            password: Some("pw".to_string()),
            key_path: None,
            clipboard_file_path: None,
            extra: Default::default(),
        }
    }

    fn open_store() -> (tempfile::TempDir, AppConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AppConfigStore::open(dir.path().join("config.json")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_assigns_id_and_persists() {
        let (_dir, store) = open_store();
        let saved = store.save_config(profile("one")).await.unwrap();
        assert!(!saved.id.is_empty());

        let reopened = AppConfigStore::open(store.path().to_path_buf()).unwrap();
        let configs = reopened.configs().await;
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "one");
    }

    #[tokio::test]
    async fn delete_config_cascades_to_pairs() {
        let (_dir, store) = open_store();
        let saved = store.save_config(profile("one")).await.unwrap();
        store
            .save_sync_pair(SyncPair {
                id: String::new(),
                config_id: saved.id.clone(),
                local_path: "/tmp/src".into(),
                remote_path: "/srv/dst".into(),
                sync_deletes: true,
                extra: Default::default(),
            })
            .await
            .unwrap();

        store.delete_config(&saved.id).await.unwrap();
        assert!(matches!(
            store.sync_pairs(&saved.id).await,
            Err(Error::ConfigNotFound(_))
        ));
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("/srv/dst"));
    }

    #[tokio::test]
    async fn pair_for_unknown_config_is_rejected() {
        let (_dir, store) = open_store();
        let err = store
            .save_sync_pair(SyncPair {
                id: String::new(),
                config_id: "ghost".into(),
                local_path: "/a".into(),
                remote_path: "/b".into(),
                sync_deletes: false,
                extra: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_fields_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "sshConfigs": [{
                    "id": "c1", "name": "n", "host": "h", "user": "u",
                    "authMethod": "password", "futureField": {"nested": true}
                }],
                "syncPairs": [],
                "tunnels": [],
                "uiTheme": "dark"
            }"#,
        )
        .unwrap();

        let store = AppConfigStore::open(path.clone()).unwrap();
        // Touch the file through a save to force a rewrite.
        store.save_config(profile("two")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("futureField"));
        assert!(raw.contains("uiTheme"));
    }

    #[tokio::test]
    async fn config_file_is_written_0600() {
        let (_dir, store) = open_store();
        store.save_config(profile("one")).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
