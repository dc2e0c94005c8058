//! Lock-guarded owner of the SSH config document and its backing file.

use std::path::{Path, PathBuf};

use log::debug;
use tokio::sync::RwLock;

use super::parser::SshConfigDoc;
use super::{HostEntry, validator};
use crate::error::{Error, Result};

/// Writes `content` to `path` atomically (temp file + rename) with 0600
/// permissions, the only mode acceptable for SSH material.
pub(crate) fn write_atomic_0600(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    {
        use std::io::Write;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

/// Owner of `~/.ssh/config`.
///
/// Mutations serialize on the write half of one lock; reads snapshot under
/// the read half and hand out deep copies. External edits to the file are
/// only picked up by an explicit [`SshConfigStore::reload`].
pub struct SshConfigStore {
    path: PathBuf,
    doc: RwLock<SshConfigDoc>,
}

impl SshConfigStore {
    /// Opens the store. A missing file yields an empty document; it will be
    /// created on the first save.
    pub fn open(path: PathBuf) -> Result<Self> {
        let doc = Self::read_doc(&path)?;
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    fn read_doc(path: &Path) -> Result<SshConfigDoc> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(SshConfigDoc::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(SshConfigDoc::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file, discarding in-memory edits.
    pub async fn reload(&self) -> Result<()> {
        let fresh = Self::read_doc(&self.path)?;
        *self.doc.write().await = fresh;
        debug!("ssh config reloaded from {}", self.path.display());
        Ok(())
    }

    /// Snapshot of all user-managed host entries.
    pub async fn hosts(&self) -> Vec<HostEntry> {
        self.doc.read().await.hosts()
    }

    /// Resolves one alias; exact match first, declared wildcard patterns
    /// second, never `Host *`.
    pub async fn get_host(&self, name: &str) -> Result<HostEntry> {
        self.doc.read().await.get_host(name)
    }

    /// Sets or removes one parameter, creating the host block if needed,
    /// then persists.
    pub async fn set_param(&self, host: &str, key: &str, value: &str) -> Result<()> {
        let mut doc = self.doc.write().await;
        let mut edited = doc.clone();
        edited.set_param(host, key, value);
        self.commit(&mut doc, edited)
    }

    /// Appends a new host block and persists.
    pub async fn add_host(&self, entry: &HostEntry) -> Result<()> {
        let mut doc = self.doc.write().await;
        let mut edited = doc.clone();
        edited.add_host(entry)?;
        self.commit(&mut doc, edited)
    }

    /// Creates the block when the alias is new, otherwise rewrites the
    /// block's standard fields in place.
    pub async fn upsert_host(&self, entry: &HostEntry) -> Result<()> {
        let mut doc = self.doc.write().await;
        let mut edited = doc.clone();
        if edited.get_host(&entry.alias).is_err() {
            edited.add_host(entry)?;
        } else {
            edited.set_param(
                &entry.alias,
                "HostName",
                entry.host_name.as_deref().unwrap_or(""),
            );
            edited.set_param(&entry.alias, "User", entry.user.as_deref().unwrap_or(""));
            let port = if entry.port == super::DEFAULT_SSH_PORT {
                String::new()
            } else {
                entry.port.to_string()
            };
            edited.set_param(&entry.alias, "Port", &port);
            edited.set_param(
                &entry.alias,
                "IdentityFile",
                entry.identity_file.as_deref().unwrap_or(""),
            );
        }
        self.commit(&mut doc, edited)
    }

    /// Deletes a host block (with its owned comments) and persists.
    pub async fn remove_host(&self, alias: &str) -> Result<()> {
        let mut doc = self.doc.write().await;
        let mut edited = doc.clone();
        edited.remove_host(alias)?;
        self.commit(&mut doc, edited)
    }

    /// Renames one alias token and persists.
    pub async fn rename_host(&self, old: &str, new: &str) -> Result<()> {
        let mut doc = self.doc.write().await;
        let mut edited = doc.clone();
        edited.rename_host(old, new)?;
        self.commit(&mut doc, edited)
    }

    /// Physically reorders host blocks and persists.
    pub async fn reorder_hosts(&self, order: &[String]) -> Result<()> {
        let mut doc = self.doc.write().await;
        let mut edited = doc.clone();
        edited.reorder_hosts(order)?;
        self.commit(&mut doc, edited)
    }

    fn commit(
        &self,
        doc: &mut tokio::sync::RwLockWriteGuard<'_, SshConfigDoc>,
        edited: SshConfigDoc,
    ) -> Result<()> {
        let content = edited.serialize();
        validator::validate(&content)?;
        write_atomic_0600(&self.path, &content)?;
        **doc = edited;
        Ok(())
    }

    /// Validates and atomically rewrites the file from the in-memory doc.
    pub async fn save(&self) -> Result<()> {
        let doc = self.doc.write().await;
        let content = doc.serialize();
        validator::validate(&content)?;
        write_atomic_0600(&self.path, &content)
    }

    /// Writes a sibling `.bak` with the current content.
    pub async fn backup(&self) -> Result<PathBuf> {
        let doc = self.doc.read().await;
        let backup_path = self.path.with_extension("bak");
        write_atomic_0600(&backup_path, &doc.serialize())?;
        Ok(backup_path)
    }

    /// Current raw text, byte-identical to what would be saved.
    pub async fn raw_content(&self) -> String {
        self.doc.read().await.serialize()
    }

    /// Validates `text`, persists it and reloads the overlay from it.
    /// Invalid text leaves both file and memory untouched.
    pub async fn save_raw_content(&self, text: &str) -> Result<()> {
        validator::validate(text)?;
        let mut doc = self.doc.write().await;
        write_atomic_0600(&self.path, text)?;
        *doc = SshConfigDoc::parse(text);
        Ok(())
    }
}

impl std::fmt::Debug for SshConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfigStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(content: &str) -> (tempfile::TempDir, SshConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, content).unwrap();
        let store = SshConfigStore::open(path).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SshConfigStore::open(dir.path().join("config")).unwrap();
        assert!(store.hosts().await.is_empty());
    }

    #[tokio::test]
    async fn raw_content_round_trips() {
        let text = "# note\nHost a\n  HostName x\n";
        let (_dir, store) = store_with(text);
        assert_eq!(store.raw_content().await, text);
    }

    #[tokio::test]
    async fn invalid_raw_content_changes_nothing() {
        let text = "Host a\n  HostName x\n";
        let (_dir, store) = store_with(text);
        let err = store
            .save_raw_content("Host a\nHostName not-indented\n")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.raw_content().await, text);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), text);
    }

    #[tokio::test]
    async fn mutations_persist_atomically() {
        let (_dir, store) = store_with("Host a\n  HostName x\n");
        store.set_param("a", "User", "alice").await.unwrap();
        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert!(on_disk.contains("  User alice"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn failed_mutation_rolls_back_memory() {
        let (_dir, store) = store_with("Host a\n  HostName x\n");
        // Removing an unknown host must not disturb the document.
        assert!(store.remove_host("ghost").await.is_err());
        assert_eq!(store.raw_content().await, "Host a\n  HostName x\n");
    }

    #[tokio::test]
    async fn save_validates_before_writing() {
        // A file that was invalid on disk loads fine but must be refused
        // at save time.
        let (_dir, store) = store_with("Host a\nHostName not-indented\n");
        let err = store.save().await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "Host a\nHostName not-indented\n"
        );

        let (_dir, store) = store_with("Host a\n  HostName a.com\n");
        store.save().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "Host a\n  HostName a.com\n"
        );
    }

    #[tokio::test]
    async fn backup_writes_sibling_bak() {
        let (_dir, store) = store_with("Host a\n  HostName x\n");
        let backup = store.backup().await.unwrap();
        assert_eq!(backup.extension().unwrap(), "bak");
        assert_eq!(
            std::fs::read_to_string(backup).unwrap(),
            "Host a\n  HostName x\n"
        );
    }

    #[tokio::test]
    async fn reload_picks_up_external_edits() {
        let (_dir, store) = store_with("Host a\n  HostName x\n");
        std::fs::write(store.path(), "Host b\n  HostName y\n").unwrap();
        assert!(store.get_host("b").await.is_err());
        store.reload().await.unwrap();
        assert!(store.get_host("b").await.is_ok());
        assert!(store.get_host("a").await.is_err());
    }
}
