// vaultkeeper configuration types
// Every path, interval, retention cap and timeout is externally configurable;
// defaults match the chat bot's historical layout (./data, ./manual_backups).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::document::{default_documents, DocumentSpec};
use crate::errors::{VaultError, VaultResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub auto_snapshot_dir: PathBuf,
    pub manual_snapshot_dir: PathBuf,
    pub history_dir: PathBuf,
    /// Safety copies taken before each restore; never a restore tier
    pub pre_restore_dir: PathBuf,
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    pub documents: Vec<DocumentSpec>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            auto_snapshot_dir: PathBuf::from("./data/backups"),
            manual_snapshot_dir: PathBuf::from("./manual_backups"),
            history_dir: PathBuf::from("./data/history"),
            pre_restore_dir: PathBuf::from("./data/pre-restore"),
            journal_path: Some(PathBuf::from("./logs/operations.jsonl")),
            documents: default_documents(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub auto_interval_secs: u64,
    pub max_auto: usize,
    pub max_manual: usize,
    pub max_pre_restore: usize,
    /// Minimum gap between per-document history copies taken by `save`
    pub history_interval_secs: u64,
    pub max_history_per_document: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            auto_interval_secs: 5 * 60,
            max_auto: 20,
            max_manual: 50,
            max_pre_restore: 10,
            history_interval_secs: 5 * 60,
            max_history_per_document: 10,
        }
    }
}

impl SnapshotConfig {
    pub fn auto_interval(&self) -> Duration {
        Duration::from_secs(self.auto_interval_secs)
    }

    pub fn history_interval(&self) -> Duration {
        Duration::from_secs(self.history_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub enabled: bool,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Mirror into a local or mounted directory instead of a git remote
    #[serde(default)]
    pub directory: Option<PathBuf>,
    pub branch: String,
    pub remote_dir: String,
    pub api_base: String,
    pub git_host: String,
    pub max_remote_snapshots: usize,
    pub author_name: String,
    pub author_email: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repo: None,
            token: None,
            directory: None,
            branch: "data-backup".to_string(),
            remote_dir: "data-backup".to_string(),
            api_base: "https://api.github.com".to_string(),
            git_host: "github.com".to_string(),
            max_remote_snapshots: 20,
            author_name: "vaultkeeper".to_string(),
            author_email: "vaultkeeper@localhost".to_string(),
        }
    }
}

impl MirrorConfig {
    /// Mirror is usable only when enabled with a directory, or with both
    /// repository and token
    pub fn is_configured(&self) -> bool {
        self.enabled && (self.directory.is_some() || self.has_github_credentials())
    }

    pub fn has_github_credentials(&self) -> bool {
        self.repo.as_deref().map(|r| !r.trim().is_empty()).unwrap_or(false)
            && self.token.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub mirror_secs: u64,
    pub local_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            mirror_secs: 30,
            local_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn mirror(&self) -> Duration {
        Duration::from_secs(self.mirror_secs)
    }

    pub fn local(&self) -> Duration {
        Duration::from_secs(self.local_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub max_depth: usize,
    pub max_files: usize,
    pub skip_dirs: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_files: 5000,
            skip_dirs: vec![
                "node_modules".to_string(),
                ".git".to_string(),
                "target".to_string(),
            ],
        }
    }
}

impl VaultConfig {
    /// Configuration rooted at a single directory; used by tests and the
    /// `--root` CLI flag.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        VaultConfig::default().with_root(root)
    }

    /// Relocate every storage path under `root`, keeping other settings
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.storage.data_dir = root.join("data");
        self.storage.auto_snapshot_dir = root.join("data").join("backups");
        self.storage.manual_snapshot_dir = root.join("manual_backups");
        self.storage.history_dir = root.join("data").join("history");
        self.storage.pre_restore_dir = root.join("data").join("pre-restore");
        self.storage.journal_path = Some(root.join("logs").join("operations.jsonl"));
        self
    }

    pub fn document(&self, name: &str) -> Option<&DocumentSpec> {
        self.storage.documents.iter().find(|d| d.name == name)
    }

    /// Structural checks applied after every load
    pub fn validate(&self) -> VaultResult<()> {
        if self.storage.documents.is_empty() {
            return Err(VaultError::config("at least one managed document is required"));
        }

        let mut names = std::collections::HashSet::new();
        let mut files = std::collections::HashSet::new();
        for doc in &self.storage.documents {
            if doc.name.trim().is_empty() {
                return Err(VaultError::config("document name cannot be empty"));
            }
            if doc.file.contains('/') || doc.file.contains('\\') || doc.file == "metadata.json" {
                return Err(VaultError::config(format!(
                    "document file '{}' must be a plain file name other than metadata.json",
                    doc.file
                )));
            }
            if !names.insert(doc.name.as_str()) {
                return Err(VaultError::config(format!("duplicate document name '{}'", doc.name)));
            }
            if !files.insert(doc.file.as_str()) {
                return Err(VaultError::config(format!("duplicate document file '{}'", doc.file)));
            }
        }

        if self.snapshots.max_auto == 0
            || self.snapshots.max_manual == 0
            || self.snapshots.max_pre_restore == 0
        {
            return Err(VaultError::config("retention caps must be at least 1"));
        }
        if self.snapshots.max_history_per_document == 0 {
            return Err(VaultError::config("max_history_per_document must be at least 1"));
        }
        if self.timeouts.mirror_secs == 0 || self.timeouts.local_secs == 0 {
            return Err(VaultError::config("timeouts must be greater than zero"));
        }
        if self.mirror.enabled && !self.mirror.is_configured() {
            return Err(VaultError::config("mirror.enabled requires mirror.directory, or mirror.repo and mirror.token"));
        }
        if self.mirror.max_remote_snapshots == 0 {
            return Err(VaultError::config("mirror.max_remote_snapshots must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = VaultConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.documents.len(), 3);
        assert_eq!(config.snapshots.max_auto, 20);
        assert_eq!(config.snapshots.max_manual, 50);
        assert_eq!(config.snapshots.max_pre_restore, 10);
    }

    #[test]
    fn rejects_duplicate_files() {
        let mut config = VaultConfig::default();
        config.storage.documents.push(DocumentSpec::object("extra", "shop.json"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_mirror_needs_credentials() {
        let mut config = VaultConfig::default();
        config.mirror.enabled = true;
        config.mirror.repo = Some("owner/data".into());
        assert!(config.validate().is_err());

        config.mirror.token = Some("ghp_test".into());
        assert!(config.validate().is_ok());
        assert!(config.mirror.is_configured());
    }

    #[test]
    fn directory_mirror_needs_no_credentials() {
        let mut config = VaultConfig::default();
        config.mirror.enabled = true;
        config.mirror.directory = Some(PathBuf::from("/mnt/backup"));
        assert!(config.validate().is_ok());
        assert!(!config.mirror.has_github_credentials());
    }

    #[test]
    fn rooted_config_keeps_everything_under_root() {
        let config = VaultConfig::rooted_at("/tmp/vk");
        assert!(config.storage.auto_snapshot_dir.starts_with("/tmp/vk"));
        assert!(config.storage.manual_snapshot_dir.starts_with("/tmp/vk"));
        assert!(config.storage.pre_restore_dir.starts_with("/tmp/vk"));
        assert!(config.storage.journal_path.unwrap().starts_with("/tmp/vk"));
    }
}
