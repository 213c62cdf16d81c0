//! The vault facade
//!
//! [`Vault`] is the narrow interface application code uses: document
//! load/save, snapshots, restore, mirror sync, status and the recovery
//! scanner. It owns one instance of each component, so two vaults opened on
//! different roots share nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::audit::{AuditEvent, Journal};
use crate::config::VaultConfig;
use crate::document::Document;
use crate::errors::{RemoteFailure, VaultError, VaultResult};
use crate::mirror::{client_from_config, MirrorClient, MirrorStatus, MirrorSync, PushResult};
use crate::recovery::{RecoveryOutcome, RecoveryPlan, RecoveryScanner, RecoverySelection};
use crate::restore::{RestoreOrchestrator, RestoreReport, RestoreRequest};
use crate::snapshot::{SnapshotInfo, SnapshotKind, SnapshotManager, SnapshotResult, SnapshotTrigger};
use crate::store::RecordStore;

/// Result of `sync_to_mirror`
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub method: String,
    pub snapshot_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetentionCaps {
    pub auto: usize,
    pub manual: usize,
    pub pre_restore: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub name: String,
    pub file: String,
    pub entity_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub mirror_connected: bool,
    pub mirror: MirrorStatus,
    pub last_snapshot_time: Option<DateTime<Utc>>,
    pub auto_count: usize,
    pub manual_count: usize,
    pub pre_restore_count: usize,
    pub retention_caps: RetentionCaps,
    pub documents: Vec<DocumentSummary>,
}

/// One scheduler tick that produced a snapshot
#[derive(Debug, Clone)]
pub struct ScheduledBackup {
    pub snapshot: SnapshotResult,
    pub push: Option<PushResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub flushed: usize,
    pub snapshot_id: Option<String>,
    pub push: Option<PushResult>,
}

/// How the data directory was brought up at startup
#[derive(Debug, Clone)]
pub enum StartupState {
    /// Live documents were already present
    Existing,
    Restored(RestoreReport),
    /// Nothing to restore from; empty documents were written
    Seeded(Vec<String>),
}

pub struct Vault {
    config: VaultConfig,
    journal: Arc<Journal>,
    store: Arc<RecordStore>,
    snapshots: Arc<SnapshotManager>,
    mirror: Arc<MirrorSync>,
    restorer: RestoreOrchestrator,
    recovery: RecoveryScanner,
}

impl Vault {
    /// Open with the mirror client described by the configuration
    pub fn open(config: VaultConfig) -> VaultResult<Self> {
        let client = client_from_config(&config.mirror)?;
        Self::open_with_mirror(config, client)
    }

    /// Open with an explicit mirror client (or none)
    pub fn open_with_mirror(config: VaultConfig, client: Option<Arc<dyn MirrorClient>>) -> VaultResult<Self> {
        config.validate()?;

        let journal = Arc::new(Journal::open(config.storage.journal_path.clone()));
        let store = Arc::new(RecordStore::open(&config, Arc::clone(&journal))?);
        let snapshots = Arc::new(SnapshotManager::open(&config, Arc::clone(&journal))?);
        let mirror = Arc::new(MirrorSync::new(
            client,
            config.timeouts.mirror(),
            config.storage.documents.clone(),
            Arc::clone(&journal),
        ));
        let restorer = RestoreOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&snapshots),
            Arc::clone(&mirror),
            Arc::clone(&journal),
            config.timeouts.local(),
        );
        let recovery = RecoveryScanner::new(
            Arc::clone(&store),
            Arc::clone(&snapshots),
            Arc::clone(&mirror),
            Arc::clone(&journal),
            config.recovery.clone(),
            config.timeouts.local(),
        );

        tracing::info!(
            data_dir = %config.storage.data_dir.display(),
            documents = config.storage.documents.len(),
            mirror = mirror.method().unwrap_or("none"),
            "vault opened"
        );

        Ok(Self {
            config,
            journal,
            store,
            snapshots,
            mirror,
            restorer,
            recovery,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn mirror(&self) -> &MirrorSync {
        &self.mirror
    }

    pub fn load(&self, name: &str) -> VaultResult<Document> {
        self.store.load(name)
    }

    pub fn save(&self, name: &str, body: Value) -> VaultResult<Document> {
        self.store.save(name, body)
    }

    pub async fn create_snapshot(
        &self,
        kind: SnapshotKind,
        name: Option<&str>,
        created_by: Option<&str>,
    ) -> VaultResult<SnapshotResult> {
        self.snapshots.create_snapshot(kind, name, created_by).await
    }

    pub fn list_snapshots(&self, kind: SnapshotKind) -> VaultResult<Vec<SnapshotInfo>> {
        self.snapshots.list_snapshots(kind)
    }

    pub fn delete_snapshot(&self, kind: SnapshotKind, id: &str) -> VaultResult<()> {
        self.snapshots.delete_snapshot(kind, id)
    }

    pub async fn restore(&self, request: RestoreRequest) -> VaultResult<RestoreReport> {
        self.restorer.restore(request).await
    }

    /// Take a fresh snapshot and push it to the mirror
    pub async fn sync_to_mirror(&self) -> SyncResult {
        let method = self.mirror.method().unwrap_or("none").to_string();
        if !self.mirror.is_configured() {
            return SyncResult {
                success: false,
                method,
                snapshot_id: None,
                error: Some(RemoteFailure::NotConfigured.to_string()),
            };
        }

        let snapshot = match self.snapshots.create_internal(SnapshotTrigger::MirrorSync).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return SyncResult {
                    success: false,
                    method,
                    snapshot_id: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let pushed = self.mirror.push(snapshot.id(), &snapshot.path).await;
        SyncResult {
            success: pushed.success,
            method: pushed.method,
            snapshot_id: Some(pushed.snapshot_id),
            error: pushed.error,
        }
    }

    /// Scheduler entry point: an automatic snapshot when one is due, pushed
    /// to the mirror when configured. `Ok(None)` when not yet due.
    pub async fn scheduled_backup(&self) -> VaultResult<Option<ScheduledBackup>> {
        let snapshot = match self.snapshots.create_snapshot(SnapshotKind::Auto, None, None).await {
            Ok(snapshot) => snapshot,
            Err(VaultError::Throttled { remaining }) => {
                tracing::debug!(?remaining, "automatic snapshot not due yet");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let push = if self.mirror.is_configured() {
            Some(self.mirror.push(snapshot.id(), &snapshot.path).await)
        } else {
            None
        };
        Ok(Some(ScheduledBackup { snapshot, push }))
    }

    pub async fn status(&self) -> VaultResult<VaultStatus> {
        let mirror = self.mirror.status().await;
        let documents = self
            .store
            .specs()
            .iter()
            .map(|spec| {
                self.store.load(&spec.name).map(|doc| DocumentSummary {
                    name: spec.name.clone(),
                    file: spec.file.clone(),
                    entity_count: doc.entity_count(),
                })
            })
            .collect::<VaultResult<Vec<_>>>()?;

        Ok(VaultStatus {
            mirror_connected: mirror.connected,
            mirror,
            last_snapshot_time: self.snapshots.last_snapshot_time(),
            auto_count: self.snapshots.list_snapshots(SnapshotKind::Auto)?.len(),
            manual_count: self.snapshots.list_snapshots(SnapshotKind::Manual)?.len(),
            pre_restore_count: self.snapshots.list_snapshots(SnapshotKind::PreRestore)?.len(),
            retention_caps: RetentionCaps {
                auto: self.snapshots.retention_cap(SnapshotKind::Auto),
                manual: self.snapshots.retention_cap(SnapshotKind::Manual),
                pre_restore: self.snapshots.retention_cap(SnapshotKind::PreRestore),
            },
            documents,
        })
    }

    pub async fn scan_recovery(&self, root: &Path) -> VaultResult<RecoveryPlan> {
        self.recovery.scan(root).await
    }

    pub async fn apply_recovery(
        &self,
        plan: &RecoveryPlan,
        selection: RecoverySelection,
    ) -> VaultResult<RecoveryOutcome> {
        self.recovery.apply(plan, selection).await
    }

    pub fn seed_empty(&self) -> VaultResult<Vec<String>> {
        self.recovery.seed_empty()
    }

    /// Startup path: when every live document is empty, restore the newest
    /// state from any tier, falling back to empty documents.
    pub async fn ensure_data(&self) -> VaultResult<StartupState> {
        let mut any_data = false;
        for spec in self.store.specs() {
            if !self.store.load(&spec.name)?.is_empty() {
                any_data = true;
                break;
            }
        }
        if any_data {
            return Ok(StartupState::Existing);
        }

        tracing::warn!("no live data found, attempting restore");
        match self.restore(RestoreRequest::latest()).await {
            Ok(report) => Ok(StartupState::Restored(report)),
            Err(VaultError::RestoreExhausted { attempts }) => {
                tracing::error!(?attempts, "nothing to restore from, starting with empty documents");
                Ok(StartupState::Seeded(self.seed_empty()?))
            }
            Err(e) => Err(e),
        }
    }

    /// Flush every cached document, then take and mirror a final snapshot.
    pub async fn shutdown(&self) -> VaultResult<ShutdownReport> {
        let flushed = self.store.flush_all()?;
        let (snapshot_id, push) = match self.snapshots.create_internal(SnapshotTrigger::Shutdown).await {
            Ok(snapshot) => {
                let push = if self.mirror.is_configured() {
                    Some(self.mirror.push(snapshot.id(), &snapshot.path).await)
                } else {
                    None
                };
                (Some(snapshot.id().to_string()), push)
            }
            Err(e) => {
                self.journal.record(AuditEvent::failed("shutdown_snapshot", "auto", &e));
                (None, None)
            }
        };

        self.journal.record(
            AuditEvent::succeeded("shutdown", "vault")
                .with_detail(format!("flushed {flushed}, snapshot {}", snapshot_id.as_deref().unwrap_or("none"))),
        );
        Ok(ShutdownReport {
            flushed,
            snapshot_id,
            push,
        })
    }
}
