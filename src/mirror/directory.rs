use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

use super::{sort_newest_first, MirrorClient, RemoteSnapshot};
use crate::errors::{RemoteFailure, VaultError, VaultResult};
use crate::secure_file_ops::{copy_dir_files, sync_dir, validate_name};

/// Mirror rooted at a local or mounted directory.
///
/// Layout matches the git mirror: `<root>/<remote_dir>/<snapshot id>/`.
#[derive(Debug, Clone)]
pub struct DirectoryMirror {
    root: PathBuf,
    remote_dir: String,
    max_snapshots: usize,
}

impl DirectoryMirror {
    pub fn new(root: PathBuf, remote_dir: &str, max_snapshots: usize) -> Self {
        Self {
            root,
            remote_dir: remote_dir.to_string(),
            max_snapshots,
        }
    }

    fn namespace(&self) -> PathBuf {
        self.root.join(&self.remote_dir)
    }

    fn unreachable(&self, detail: impl std::fmt::Display) -> VaultError {
        VaultError::remote(RemoteFailure::Unreachable(format!(
            "{}: {detail}",
            self.root.display()
        )))
    }
}

fn list_dirs(namespace: &Path) -> std::io::Result<Vec<RemoteSnapshot>> {
    let entries = match fs::read_dir(namespace) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut snapshots: Vec<RemoteSnapshot> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.'))
        .map(RemoteSnapshot::new)
        .collect();
    sort_newest_first(&mut snapshots);
    Ok(snapshots)
}

fn replace_snapshot(namespace: &Path, id: &str, source: &Path, keep: usize) -> VaultResult<()> {
    let staging = namespace.join(format!(".{id}.staging"));
    let target = namespace.join(id);
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| VaultError::io("clearing mirror staging", e))?;
    }
    copy_dir_files(source, &staging)?;
    if target.exists() {
        fs::remove_dir_all(&target).map_err(|e| VaultError::io("replacing mirror snapshot", e))?;
    }
    fs::rename(&staging, &target).map_err(|e| VaultError::io("committing mirror snapshot", e))?;
    sync_dir(namespace);

    for stale in list_dirs(namespace)?.into_iter().skip(keep) {
        fs::remove_dir_all(namespace.join(&stale.id))
            .map_err(|e| VaultError::io("pruning mirror snapshot", e))?;
    }
    Ok(())
}

#[async_trait]
impl MirrorClient for DirectoryMirror {
    fn name(&self) -> &str {
        "directory"
    }

    async fn check_access(&self) -> VaultResult<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(self.unreachable("not a directory")),
            Err(e) => Err(self.unreachable(e)),
        }
    }

    async fn push(&self, snapshot_id: &str, snapshot_dir: &Path) -> VaultResult<()> {
        validate_name("snapshot_id", snapshot_id)?;
        let namespace = self.namespace();
        let id = snapshot_id.to_string();
        let source = snapshot_dir.to_path_buf();
        let keep = self.max_snapshots;

        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&namespace).map_err(|e| VaultError::io("creating mirror namespace", e))?;
            replace_snapshot(&namespace, &id, &source, keep)
        })
        .await?
    }

    async fn list_snapshots(&self) -> VaultResult<Vec<RemoteSnapshot>> {
        let namespace = self.namespace();
        let listed = tokio::task::spawn_blocking(move || list_dirs(&namespace)).await?;
        listed.map_err(|e| self.unreachable(e))
    }

    async fn fetch_file(&self, snapshot_id: &str, file: &str) -> VaultResult<Option<Vec<u8>>> {
        validate_name("snapshot_id", snapshot_id)?;
        validate_name("file", file)?;
        match tokio::fs::read(self.namespace().join(snapshot_id).join(file)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.unreachable(e)),
        }
    }
}
