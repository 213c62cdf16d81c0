//! Snapshot Manager
//!
//! A snapshot is a directory holding a copy of every managed document plus
//! `metadata.json`. Three pools share the same mechanics: `auto` (scheduled,
//! rate-limited), `manual` (operator-named, never rate-limited) and
//! `pre-restore` (the state a restore replaced). Each pool has its own
//! retention cap and its own in-progress guard. Pre-restore copies never
//! feed the auto rotation: they are not restore candidates for "latest" and
//! do not count toward the auto cap or the auto rate limit.
//!
//! Creation stages into `.<id>.staging` and renames into place as the final
//! step, so a crash or timeout never leaves a half-written snapshot under a
//! real id.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audit::{AuditEvent, Journal};
use crate::config::VaultConfig;
use crate::document::{plausible_shape, DocumentSpec};
use crate::errors::{SafeLock, VaultError, VaultResult};
use crate::guard::{run_blocking, BusyGuard, Cancellation};
use crate::secure_file_ops::{sha256_hex, sweep_transient, sync_dir, validate_name};

pub const METADATA_FILE: &str = "metadata.json";
pub const SCHEMA_VERSION: u32 = 1;
const ID_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotKind {
    Auto,
    Manual,
    PreRestore,
}

impl SnapshotKind {
    pub const ALL: [SnapshotKind; 3] = [SnapshotKind::Auto, SnapshotKind::Manual, SnapshotKind::PreRestore];
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotKind::Auto => write!(f, "auto"),
            SnapshotKind::Manual => write!(f, "manual"),
            SnapshotKind::PreRestore => write!(f, "pre-restore"),
        }
    }
}

impl FromStr for SnapshotKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(SnapshotKind::Auto),
            "manual" => Ok(SnapshotKind::Manual),
            "pre-restore" => Ok(SnapshotKind::PreRestore),
            other => Err(VaultError::validation(
                "kind",
                format!("unknown snapshot kind '{other}' (expected auto, manual or pre-restore)"),
            )),
        }
    }
}

/// What caused a snapshot to be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Scheduled,
    Operator,
    PreRestore,
    Recovery,
    Shutdown,
    MirrorSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Ok,
    Failed,
    Missing,
}

impl DocumentStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            DocumentStatus::Ok => "✅",
            DocumentStatus::Failed | DocumentStatus::Missing => "❌",
        }
    }
}

/// Per-document outcome recorded in snapshot metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub name: String,
    pub file: String,
    pub status: DocumentStatus,
    pub entity_count: usize,
    pub sha256: Option<String>,
    pub bytes: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: String,
    pub kind: SnapshotKind,
    pub trigger: SnapshotTrigger,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub documents: Vec<DocumentRecord>,
    pub success_count: usize,
    pub total_documents: usize,
    pub schema_version: u32,
}

impl SnapshotMetadata {
    pub fn document(&self, name: &str) -> Option<&DocumentRecord> {
        self.documents.iter().find(|d| d.name == name)
    }
}

/// Outcome of a snapshot creation
#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub metadata: SnapshotMetadata,
    pub path: PathBuf,
    /// Ids removed by retention pruning right after creation
    pub pruned: Vec<String>,
}

impl SnapshotResult {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn success_count(&self) -> usize {
        self.metadata.success_count
    }

    pub fn total_documents(&self) -> usize {
        self.metadata.total_documents
    }
}

/// A snapshot found in a pool directory
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub id: String,
    pub kind: SnapshotKind,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// `None` when metadata.json is missing or unreadable
    pub metadata: Option<SnapshotMetadata>,
}

/// Generate `<kind>-<YYYYMMDDTHHMMSSmmmZ>-<8 hex>`
pub fn generate_id(kind: SnapshotKind, at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", kind, at.format(ID_TIME_FORMAT), &suffix[..8])
}

/// Timestamp embedded in a generated id; operator names yield `None`
pub fn id_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let rest = SnapshotKind::ALL
        .iter()
        .find_map(|kind| id.strip_prefix(kind.to_string().as_str())?.strip_prefix('-'))?;
    let (stamp, _) = rest.split_once('-')?;
    NaiveDateTime::parse_from_str(stamp, ID_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

struct Pool {
    dir: PathBuf,
    cap: usize,
    busy: Arc<AtomicBool>,
}

pub struct SnapshotManager {
    data_dir: PathBuf,
    specs: Vec<DocumentSpec>,
    auto: Pool,
    manual: Pool,
    pre_restore: Pool,
    auto_interval: Duration,
    local_timeout: Duration,
    last_auto: Mutex<Option<DateTime<Utc>>>,
    journal: Arc<Journal>,
}

impl SnapshotManager {
    pub fn open(config: &VaultConfig, journal: Arc<Journal>) -> VaultResult<Self> {
        let storage = &config.storage;
        for dir in [
            &storage.auto_snapshot_dir,
            &storage.manual_snapshot_dir,
            &storage.pre_restore_dir,
        ] {
            fs::create_dir_all(dir).map_err(|e| VaultError::io("creating snapshot directory", e))?;
            let swept = sweep_transient(dir);
            if swept > 0 {
                tracing::warn!(count = swept, dir = %dir.display(), "removed staging leftovers");
            }
        }

        let manager = Self {
            data_dir: storage.data_dir.clone(),
            specs: storage.documents.clone(),
            auto: Pool {
                dir: storage.auto_snapshot_dir.clone(),
                cap: config.snapshots.max_auto,
                busy: Arc::new(AtomicBool::new(false)),
            },
            manual: Pool {
                dir: storage.manual_snapshot_dir.clone(),
                cap: config.snapshots.max_manual,
                busy: Arc::new(AtomicBool::new(false)),
            },
            pre_restore: Pool {
                dir: storage.pre_restore_dir.clone(),
                cap: config.snapshots.max_pre_restore,
                busy: Arc::new(AtomicBool::new(false)),
            },
            auto_interval: config.snapshots.auto_interval(),
            local_timeout: config.timeouts.local(),
            last_auto: Mutex::new(None),
            journal,
        };

        let newest = manager.latest(SnapshotKind::Auto)?.map(|s| s.created_at);
        *manager.last_auto.safe_lock()? = newest;
        Ok(manager)
    }

    fn pool(&self, kind: SnapshotKind) -> &Pool {
        match kind {
            SnapshotKind::Auto => &self.auto,
            SnapshotKind::Manual => &self.manual,
            SnapshotKind::PreRestore => &self.pre_restore,
        }
    }

    pub fn pool_dir(&self, kind: SnapshotKind) -> &Path {
        &self.pool(kind).dir
    }

    pub fn retention_cap(&self, kind: SnapshotKind) -> usize {
        self.pool(kind).cap
    }

    pub fn specs(&self) -> &[DocumentSpec] {
        &self.specs
    }

    /// Claim the pool's in-progress flag
    pub fn try_acquire(&self, kind: SnapshotKind) -> VaultResult<BusyGuard> {
        BusyGuard::acquire(&self.pool(kind).busy, &format!("{kind} snapshot"))
    }

    pub fn last_snapshot_time(&self) -> Option<DateTime<Utc>> {
        self.last_auto.lock().ok().and_then(|t| *t)
    }

    /// How long until the next automatic snapshot is due
    pub fn auto_due_in(&self) -> Duration {
        let Some(last) = self.last_snapshot_time() else {
            return Duration::ZERO;
        };
        let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
        self.auto_interval.saturating_sub(elapsed)
    }

    /// Create a snapshot on request.
    ///
    /// Automatic snapshots are refused with `Throttled` until the interval has
    /// elapsed; manual snapshots may carry an operator name.
    pub async fn create_snapshot(
        &self,
        kind: SnapshotKind,
        name: Option<&str>,
        created_by: Option<&str>,
    ) -> VaultResult<SnapshotResult> {
        let guard = self.try_acquire(kind)?;

        let (id, trigger) = match kind {
            SnapshotKind::Auto => {
                if name.is_some() {
                    return Err(VaultError::validation("name", "only manual snapshots can be named"));
                }
                let remaining = self.auto_due_in();
                if !remaining.is_zero() {
                    return Err(VaultError::Throttled { remaining });
                }
                (generate_id(kind, Utc::now()), SnapshotTrigger::Scheduled)
            }
            SnapshotKind::Manual => {
                let id = match name {
                    Some(name) => {
                        validate_name("name", name)?;
                        if self.manual.dir.join(name).exists() {
                            return Err(VaultError::validation(
                                "name",
                                format!("manual snapshot '{name}' already exists"),
                            ));
                        }
                        name.to_string()
                    }
                    None => generate_id(kind, Utc::now()),
                };
                (id, SnapshotTrigger::Operator)
            }
            SnapshotKind::PreRestore => {
                return Err(VaultError::validation(
                    "kind",
                    "pre-restore snapshots are only taken by restore",
                ))
            }
        };

        self.run(guard, kind, id, trigger, created_by).await
    }

    /// Snapshot taken by the system itself; bypasses the rate limit but not
    /// the busy guard. `PreRestore` goes to its own pool, everything else to
    /// the auto pool.
    pub async fn create_internal(&self, trigger: SnapshotTrigger) -> VaultResult<SnapshotResult> {
        let kind = match trigger {
            SnapshotTrigger::PreRestore => SnapshotKind::PreRestore,
            _ => SnapshotKind::Auto,
        };
        let guard = self.try_acquire(kind)?;
        let id = generate_id(kind, Utc::now());
        self.run(guard, kind, id, trigger, None).await
    }

    async fn run(
        &self,
        guard: BusyGuard,
        kind: SnapshotKind,
        id: String,
        trigger: SnapshotTrigger,
        created_by: Option<&str>,
    ) -> VaultResult<SnapshotResult> {
        let pool = self.pool(kind);
        let cancel = Cancellation::default();
        let job = SnapshotJob {
            data_dir: self.data_dir.clone(),
            pool_dir: pool.dir.clone(),
            cap: pool.cap,
            specs: self.specs.clone(),
            kind,
            trigger,
            id: id.clone(),
            created_by: created_by.map(str::to_string),
            cancel: cancel.clone(),
        };

        let outcome = run_blocking("snapshot", self.local_timeout, cancel, move || {
            let _guard = guard;
            job.execute()
        })
        .await;

        match &outcome {
            Ok(result) => {
                if kind == SnapshotKind::Auto {
                    *self.last_auto.safe_lock()? = Some(result.metadata.created_at);
                }
                self.journal.record(
                    AuditEvent::succeeded("snapshot_create", &id).with_detail(format!(
                        "{kind} {trigger:?}: {}/{} documents, pruned {}",
                        result.metadata.success_count,
                        result.metadata.total_documents,
                        result.pruned.len()
                    )),
                );
            }
            Err(e) => self.journal.record(AuditEvent::failed("snapshot_create", &id, e)),
        }
        outcome
    }

    /// Delete snapshots beyond the pool's cap, oldest first.
    /// Returns the ids removed.
    pub fn prune_retention(&self, kind: SnapshotKind) -> VaultResult<Vec<String>> {
        let pool = self.pool(kind);
        let pruned = prune_pool(&pool.dir, kind, pool.cap)?;
        for id in &pruned {
            self.journal.record(AuditEvent::succeeded("snapshot_prune", id));
        }
        Ok(pruned)
    }

    /// Snapshots of one kind, newest first
    pub fn list_snapshots(&self, kind: SnapshotKind) -> VaultResult<Vec<SnapshotInfo>> {
        list_pool(&self.pool(kind).dir, kind)
    }

    pub fn latest(&self, kind: SnapshotKind) -> VaultResult<Option<SnapshotInfo>> {
        Ok(self.list_snapshots(kind)?.into_iter().next())
    }

    pub fn locate(&self, kind: SnapshotKind, id: &str) -> VaultResult<SnapshotInfo> {
        validate_name("snapshot_id", id)?;
        let path = self.pool(kind).dir.join(id);
        if !path.is_dir() {
            return Err(VaultError::not_found(format!("{kind} snapshot"), id));
        }
        Ok(describe(kind, path))
    }

    pub fn delete_snapshot(&self, kind: SnapshotKind, id: &str) -> VaultResult<()> {
        let info = self.locate(kind, id)?;
        let _guard = self.try_acquire(kind)?;
        fs::remove_dir_all(&info.path).map_err(|e| VaultError::io("deleting snapshot", e))?;
        self.journal.record(AuditEvent::succeeded("snapshot_delete", id));
        Ok(())
    }

    /// Read one document out of a snapshot, checking the recorded digest
    pub fn read_document(&self, kind: SnapshotKind, id: &str, name: &str) -> VaultResult<Value> {
        let info = self.locate(kind, id)?;
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| VaultError::not_found("document", name))?;
        read_snapshot_document(&info, spec)
    }
}

/// Read and verify one document file from a located snapshot
pub fn read_snapshot_document(info: &SnapshotInfo, spec: &DocumentSpec) -> VaultResult<Value> {
    let record = info.metadata.as_ref().and_then(|m| m.document(&spec.name));
    if let Some(record) = record {
        if record.status != DocumentStatus::Ok {
            return Err(VaultError::not_found(
                format!("document in snapshot {}", info.id),
                spec.name.as_str(),
            ));
        }
    }

    let path = info.path.join(&spec.file);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VaultError::not_found(
                format!("document in snapshot {}", info.id),
                spec.name.as_str(),
            ))
        }
        Err(e) => return Err(VaultError::io("reading snapshot document", e)),
    };

    if let Some(expected) = record.and_then(|r| r.sha256.as_deref()) {
        let actual = sha256_hex(&raw);
        if actual != expected {
            return Err(VaultError::validation(
                spec.name.as_str(),
                format!("digest mismatch in snapshot {}", info.id),
            ));
        }
    }

    let value: Value = serde_json::from_slice(&raw)
        .map_err(|e| VaultError::serialization(format!("parsing {} from {}", spec.file, info.id), e))?;
    if !plausible_shape(spec, &value, false) {
        return Err(VaultError::validation(spec.name.as_str(), "snapshot copy is not a JSON object"));
    }
    Ok(value)
}

fn describe(kind: SnapshotKind, path: PathBuf) -> SnapshotInfo {
    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let metadata = fs::read(path.join(METADATA_FILE))
        .ok()
        .and_then(|raw| serde_json::from_slice::<SnapshotMetadata>(&raw).ok());
    let created_at = metadata
        .as_ref()
        .map(|m| m.created_at)
        .or_else(|| {
            fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        })
        .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));

    SnapshotInfo {
        id,
        kind,
        path,
        created_at,
        metadata,
    }
}

fn list_pool(dir: &Path, kind: SnapshotKind) -> VaultResult<Vec<SnapshotInfo>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VaultError::io("listing snapshots", e)),
    };

    let mut snapshots: Vec<SnapshotInfo> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| describe(kind, e.path()))
        .collect();

    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    Ok(snapshots)
}

fn prune_pool(dir: &Path, kind: SnapshotKind, cap: usize) -> VaultResult<Vec<String>> {
    let mut pruned = Vec::new();
    for stale in list_pool(dir, kind)?.into_iter().skip(cap) {
        fs::remove_dir_all(&stale.path).map_err(|e| VaultError::io("pruning snapshot", e))?;
        pruned.push(stale.id);
    }
    Ok(pruned)
}

/// Owned inputs for one snapshot run on the blocking pool
struct SnapshotJob {
    data_dir: PathBuf,
    pool_dir: PathBuf,
    cap: usize,
    specs: Vec<DocumentSpec>,
    kind: SnapshotKind,
    trigger: SnapshotTrigger,
    id: String,
    created_by: Option<String>,
    cancel: Cancellation,
}

impl SnapshotJob {
    fn execute(self) -> VaultResult<SnapshotResult> {
        fs::create_dir_all(&self.pool_dir).map_err(|e| VaultError::io("creating snapshot pool", e))?;
        let final_dir = self.pool_dir.join(&self.id);
        if final_dir.exists() {
            return Err(VaultError::validation("snapshot_id", format!("{} already exists", self.id)));
        }

        let staging = self.pool_dir.join(format!(".{}.staging", self.id));
        fs::create_dir_all(&staging).map_err(|e| VaultError::io("creating staging directory", e))?;

        match self.fill(&staging) {
            Ok(metadata) if !self.cancel.is_cancelled() => {
                fs::rename(&staging, &final_dir).map_err(|e| {
                    let _ = fs::remove_dir_all(&staging);
                    VaultError::io("committing snapshot", e)
                })?;
                sync_dir(&self.pool_dir);

                let pruned = self.prune_after_commit();
                Ok(SnapshotResult {
                    metadata,
                    path: final_dir,
                    pruned,
                })
            }
            Ok(_) => {
                let _ = fs::remove_dir_all(&staging);
                Err(VaultError::internal(format!("snapshot {} cancelled before commit", self.id)))
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    /// Retention runs after the commit, so a pruning error must not turn a
    /// committed snapshot into a reported failure.
    fn prune_after_commit(&self) -> Vec<String> {
        match prune_pool(&self.pool_dir, self.kind, self.cap) {
            Ok(pruned) => pruned,
            Err(e) => {
                tracing::warn!(snapshot = %self.id, kind = %self.kind, error = %e, "retention pruning failed after commit");
                Vec::new()
            }
        }
    }

    fn fill(&self, staging: &Path) -> VaultResult<SnapshotMetadata> {
        let created_at = Utc::now();
        let mut documents = Vec::with_capacity(self.specs.len());

        for spec in &self.specs {
            if self.cancel.is_cancelled() {
                break;
            }
            documents.push(self.copy_document(spec, staging)?);
        }

        let success_count = documents
            .iter()
            .filter(|d| d.status == DocumentStatus::Ok)
            .count();
        let metadata = SnapshotMetadata {
            id: self.id.clone(),
            kind: self.kind,
            trigger: self.trigger,
            created_at,
            created_by: self.created_by.clone(),
            documents,
            success_count,
            total_documents: self.specs.len(),
            schema_version: SCHEMA_VERSION,
        };

        let bytes = serde_json::to_vec_pretty(&metadata)?;
        write_synced(&staging.join(METADATA_FILE), &bytes)?;
        Ok(metadata)
    }

    /// Copy one live document; unreadable or malformed content is recorded,
    /// not fatal. Only staging write errors abort the snapshot.
    fn copy_document(&self, spec: &DocumentSpec, staging: &Path) -> VaultResult<DocumentRecord> {
        let mut record = DocumentRecord {
            name: spec.name.clone(),
            file: spec.file.clone(),
            status: DocumentStatus::Missing,
            entity_count: 0,
            sha256: None,
            bytes: 0,
            error: None,
        };

        let raw = match fs::read(self.data_dir.join(&spec.file)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(record),
            Err(e) => {
                record.status = DocumentStatus::Failed;
                record.error = Some(e.to_string());
                return Ok(record);
            }
        };

        let value = match serde_json::from_slice::<Value>(&raw) {
            Ok(value) if plausible_shape(spec, &value, false) => value,
            Ok(_) => {
                record.status = DocumentStatus::Failed;
                record.error = Some("document root is not a JSON object".to_string());
                return Ok(record);
            }
            Err(e) => {
                record.status = DocumentStatus::Failed;
                record.error = Some(format!("invalid JSON: {e}"));
                return Ok(record);
            }
        };

        write_synced(&staging.join(&spec.file), &raw)?;
        record.status = DocumentStatus::Ok;
        record.entity_count = value.as_object().map(|m| m.len()).unwrap_or(0);
        record.sha256 = Some(sha256_hex(&raw));
        record.bytes = raw.len() as u64;
        Ok(record)
    }
}

fn write_synced(path: &Path, data: &[u8]) -> VaultResult<()> {
    use std::io::Write;
    let mut file = fs::File::create(path).map_err(|e| VaultError::io("creating snapshot file", e))?;
    file.write_all(data).map_err(|e| VaultError::io("writing snapshot file", e))?;
    file.sync_all().map_err(|e| VaultError::io("syncing snapshot file", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn setup(root: &Path, max_auto: usize, interval_secs: u64) -> SnapshotManager {
        let mut config = VaultConfig::rooted_at(root);
        config.storage.documents = vec![
            DocumentSpec::entities("accounts", "users.json", &["counter"], &[]),
            DocumentSpec::object("catalog", "shop.json"),
        ];
        config.snapshots.max_auto = max_auto;
        config.snapshots.auto_interval_secs = interval_secs;
        fs::create_dir_all(&config.storage.data_dir).unwrap();
        fs::write(
            config.storage.data_dir.join("users.json"),
            serde_json::to_vec(&json!({"u1": {"counter": 5}})).unwrap(),
        )
        .unwrap();
        SnapshotManager::open(&config, Arc::new(Journal::disabled())).unwrap()
    }

    #[tokio::test]
    async fn snapshot_records_per_document_status() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 5, 0);

        let result = manager.create_snapshot(SnapshotKind::Auto, None, None).await.unwrap();
        assert_eq!(result.total_documents(), 2);
        assert_eq!(result.success_count(), 1);
        let accounts = result.metadata.document("accounts").unwrap();
        assert_eq!(accounts.status, DocumentStatus::Ok);
        assert_eq!(accounts.entity_count, 1);
        assert_eq!(result.metadata.document("catalog").unwrap().status, DocumentStatus::Missing);
        assert!(result.path.join(METADATA_FILE).exists());
        assert!(id_timestamp(result.id()).is_some());
    }

    #[tokio::test]
    async fn malformed_document_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 5, 0);
        fs::write(dir.path().join("data").join("shop.json"), b"[1,2]").unwrap();

        let result = manager.create_snapshot(SnapshotKind::Auto, None, None).await.unwrap();
        let catalog = result.metadata.document("catalog").unwrap();
        assert_eq!(catalog.status, DocumentStatus::Failed);
        assert!(!result.path.join("shop.json").exists());
    }

    #[tokio::test]
    async fn retention_keeps_most_recent_and_prune_is_idempotent() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 3, 0);

        let mut created = Vec::new();
        for _ in 0..5 {
            let result = manager.create_internal(SnapshotTrigger::Scheduled).await.unwrap();
            created.push(result.id().to_string());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let kept: Vec<String> = manager
            .list_snapshots(SnapshotKind::Auto)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        let expected: Vec<String> = created.iter().rev().take(3).cloned().collect();
        assert_eq!(kept, expected);

        assert!(manager.prune_retention(SnapshotKind::Auto).unwrap().is_empty());
        assert!(manager.prune_retention(SnapshotKind::Auto).unwrap().is_empty());
        assert_eq!(manager.list_snapshots(SnapshotKind::Auto).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn overlapping_creation_is_rejected_as_busy() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 5, 0);

        let (first, second) = tokio::join!(
            manager.create_snapshot(SnapshotKind::Auto, None, None),
            manager.create_snapshot(SnapshotKind::Auto, None, None),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(VaultError::Busy { .. })));
        assert_eq!(manager.list_snapshots(SnapshotKind::Auto).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn held_guard_blocks_only_its_own_pool() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 5, 0);

        let _held = manager.try_acquire(SnapshotKind::Auto).unwrap();
        assert!(matches!(
            manager.create_internal(SnapshotTrigger::Shutdown).await,
            Err(VaultError::Busy { .. })
        ));
        assert!(manager.create_snapshot(SnapshotKind::Manual, Some("m1"), None).await.is_ok());
        assert!(manager.create_internal(SnapshotTrigger::PreRestore).await.is_ok());
    }

    #[tokio::test]
    async fn pre_restore_copies_stay_out_of_the_auto_rotation() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 1, 3600);

        let auto = manager.create_snapshot(SnapshotKind::Auto, None, None).await.unwrap();
        let stamp = manager.last_snapshot_time();
        let pre = manager.create_internal(SnapshotTrigger::PreRestore).await.unwrap();

        assert_eq!(pre.metadata.kind, SnapshotKind::PreRestore);
        assert!(pre.path.starts_with(dir.path().join("data").join("pre-restore")));
        assert!(pre.pruned.is_empty());
        assert_eq!(manager.latest(SnapshotKind::Auto).unwrap().unwrap().id, auto.id());
        assert_eq!(manager.last_snapshot_time(), stamp);
        assert_eq!(manager.list_snapshots(SnapshotKind::PreRestore).unwrap().len(), 1);
        assert!(matches!(
            manager.create_snapshot(SnapshotKind::PreRestore, None, None).await,
            Err(VaultError::Validation { .. })
        ));
    }

    #[test]
    fn pruning_failure_after_commit_is_not_fatal() {
        let dir = tempdir().unwrap();
        let not_a_dir = dir.path().join("pool");
        fs::write(&not_a_dir, b"occupied").unwrap();
        let job = SnapshotJob {
            data_dir: dir.path().to_path_buf(),
            pool_dir: not_a_dir,
            cap: 1,
            specs: Vec::new(),
            kind: SnapshotKind::Auto,
            trigger: SnapshotTrigger::Scheduled,
            id: "auto-x".to_string(),
            created_by: None,
            cancel: Cancellation::default(),
        };
        assert!(prune_pool(&job.pool_dir, job.kind, job.cap).is_err());
        assert!(job.prune_after_commit().is_empty());
    }

    #[tokio::test]
    async fn automatic_snapshots_are_rate_limited() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 5, 3600);

        manager.create_snapshot(SnapshotKind::Auto, None, None).await.unwrap();
        assert!(matches!(
            manager.create_snapshot(SnapshotKind::Auto, None, None).await,
            Err(VaultError::Throttled { .. })
        ));
        // Internal triggers and manual snapshots are not throttled
        manager.create_internal(SnapshotTrigger::Shutdown).await.unwrap();
        manager.create_snapshot(SnapshotKind::Manual, None, None).await.unwrap();

        // The rate limit survives a restart
        let reopened = setup(dir.path(), 5, 3600);
        assert!(!reopened.auto_due_in().is_zero());
    }

    #[tokio::test]
    async fn manual_names_are_validated_and_unique() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 5, 0);

        manager
            .create_snapshot(SnapshotKind::Manual, Some("before-upgrade"), Some("operator#1"))
            .await
            .unwrap();
        assert!(manager
            .create_snapshot(SnapshotKind::Manual, Some("before-upgrade"), None)
            .await
            .is_err());
        assert!(manager
            .create_snapshot(SnapshotKind::Manual, Some("../escape"), None)
            .await
            .is_err());
        assert!(manager
            .create_snapshot(SnapshotKind::Auto, Some("named"), None)
            .await
            .is_err());

        let info = manager.locate(SnapshotKind::Manual, "before-upgrade").unwrap();
        assert_eq!(info.metadata.unwrap().created_by.as_deref(), Some("operator#1"));
    }

    #[tokio::test]
    async fn read_document_verifies_digest() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 5, 0);
        let result = manager.create_snapshot(SnapshotKind::Manual, Some("m1"), None).await.unwrap();

        let value = manager.read_document(SnapshotKind::Manual, "m1", "accounts").unwrap();
        assert_eq!(value, json!({"u1": {"counter": 5}}));

        fs::write(result.path.join("users.json"), br#"{"u1": {"counter": 9}}"#).unwrap();
        assert!(matches!(
            manager.read_document(SnapshotKind::Manual, "m1", "accounts"),
            Err(VaultError::Validation { .. })
        ));
        assert!(matches!(
            manager.read_document(SnapshotKind::Manual, "m1", "catalog"),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_and_staging_sweep() {
        let dir = tempdir().unwrap();
        let manager = setup(dir.path(), 5, 0);
        manager.create_snapshot(SnapshotKind::Manual, Some("m1"), None).await.unwrap();
        manager.delete_snapshot(SnapshotKind::Manual, "m1").unwrap();
        assert!(matches!(
            manager.delete_snapshot(SnapshotKind::Manual, "m1"),
            Err(VaultError::NotFound { .. })
        ));

        let leftover = dir.path().join("manual_backups").join(".m2.staging");
        fs::create_dir_all(&leftover).unwrap();
        let reopened = setup(dir.path(), 5, 0);
        assert!(!leftover.exists());
        assert!(reopened.list_snapshots(SnapshotKind::Manual).unwrap().is_empty());
    }

    #[test]
    fn kind_parses_and_ids_carry_time() {
        assert_eq!("Manual".parse::<SnapshotKind>().unwrap(), SnapshotKind::Manual);
        assert!("weekly".parse::<SnapshotKind>().is_err());

        let at = Utc::now();
        let id = generate_id(SnapshotKind::Auto, at);
        let parsed = id_timestamp(&id).unwrap();
        assert_eq!(parsed.timestamp_millis(), at.timestamp_millis());
        assert!(id_timestamp("before-upgrade").is_none());

        let pre = generate_id(SnapshotKind::PreRestore, at);
        assert!(pre.starts_with("pre-restore-"));
        assert_eq!(id_timestamp(&pre).unwrap().timestamp_millis(), at.timestamp_millis());
        assert_eq!("pre-restore".parse::<SnapshotKind>().unwrap(), SnapshotKind::PreRestore);
    }
}
