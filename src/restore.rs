// Restore orchestrator: restore.rs
// Walks the restore tiers in priority order (mirror, local auto pool, local
// manual pool). A tier's data is fully loaded before anything is written;
// then a pre-restore snapshot is taken and each document is saved through
// the record store. A failed save rolls the already written documents back
// to the pre-restore copy.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditEvent, Journal, LogLevel};
use crate::document::DocumentSpec;
use crate::errors::{RemoteFailure, VaultError, VaultResult};
use crate::guard::{run_blocking, BusyGuard, Cancellation};
use crate::mirror::{MirrorSync, PullSelector};
use crate::snapshot::{
    read_snapshot_document, DocumentStatus, SnapshotInfo, SnapshotKind, SnapshotManager, SnapshotResult,
    SnapshotTrigger,
};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestoreTier {
    #[serde(rename = "external")]
    External,
    #[serde(rename = "local-auto")]
    LocalAuto,
    #[serde(rename = "local-manual")]
    LocalManual,
    #[serde(rename = "local-pre-restore")]
    LocalPreRestore,
}

impl RestoreTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreTier::External => "external",
            RestoreTier::LocalAuto => "local-auto",
            RestoreTier::LocalManual => "local-manual",
            RestoreTier::LocalPreRestore => "local-pre-restore",
        }
    }
}

impl fmt::Display for RestoreTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which snapshot to restore, and from which pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreRequest {
    pub snapshot_id: Option<String>,
    pub kind: Option<SnapshotKind>,
}

impl RestoreRequest {
    /// Newest available state from any tier
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn snapshot(id: impl Into<String>, kind: Option<SnapshotKind>) -> Self {
        Self {
            snapshot_id: Some(id.into()),
            kind,
        }
    }

    /// Tiers to try, in order.
    ///
    /// Manual snapshots are operator-curated, so the manual tier is only
    /// consulted for an explicit name. Pre-restore copies are only used when
    /// asked for by kind and id, to undo a restore.
    pub fn tiers(&self) -> VaultResult<Vec<RestoreTier>> {
        match (self.kind, self.snapshot_id.is_some()) {
            (Some(SnapshotKind::PreRestore), false) => Err(VaultError::validation(
                "snapshot_id",
                "pre-restore restores require an explicit snapshot id",
            )),
            (Some(SnapshotKind::PreRestore), true) => Ok(vec![RestoreTier::LocalPreRestore]),
            (Some(SnapshotKind::Manual), false) => Err(VaultError::validation(
                "snapshot_id",
                "manual restores require an explicit snapshot name",
            )),
            (Some(SnapshotKind::Manual), true) => Ok(vec![RestoreTier::LocalManual]),
            (Some(SnapshotKind::Auto), _) => Ok(vec![RestoreTier::External, RestoreTier::LocalAuto]),
            (None, false) => Ok(vec![RestoreTier::External, RestoreTier::LocalAuto]),
            (None, true) => Ok(vec![
                RestoreTier::External,
                RestoreTier::LocalAuto,
                RestoreTier::LocalManual,
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierAttempt {
    pub tier: RestoreTier,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub success: bool,
    pub method: RestoreTier,
    pub restored_count: usize,
    pub expected_count: usize,
    pub source_id: String,
    pub pre_restore_snapshot: Option<String>,
    /// Tiers that were tried and failed before `method` succeeded
    pub attempts: Vec<TierAttempt>,
}

/// Documents gathered from one tier, not yet applied
struct RestoreSource {
    tier: RestoreTier,
    source_id: String,
    documents: Vec<(String, Value)>,
}

pub struct RestoreOrchestrator {
    store: Arc<RecordStore>,
    snapshots: Arc<SnapshotManager>,
    mirror: Arc<MirrorSync>,
    journal: Arc<Journal>,
    local_timeout: Duration,
    busy: Arc<AtomicBool>,
}

impl RestoreOrchestrator {
    pub fn new(
        store: Arc<RecordStore>,
        snapshots: Arc<SnapshotManager>,
        mirror: Arc<MirrorSync>,
        journal: Arc<Journal>,
        local_timeout: Duration,
    ) -> Self {
        Self {
            store,
            snapshots,
            mirror,
            journal,
            local_timeout,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restore from the first tier that yields data.
    ///
    /// Per-tier failures become attempts and the next tier is tried; only
    /// exhaustion of every tier is returned as `RestoreExhausted`. A failed
    /// write of the chosen tier's data rolls back and returns `RestoreAborted`.
    pub async fn restore(&self, request: RestoreRequest) -> VaultResult<RestoreReport> {
        let _guard = BusyGuard::acquire(&self.busy, "restore")?;
        let target = request.snapshot_id.clone().unwrap_or_else(|| "latest".to_string());

        let mut attempts = Vec::new();
        for tier in request.tiers()? {
            match self.gather(tier, &request).await {
                Ok(source) => {
                    let report = self.apply(source, attempts).await;
                    match &report {
                        Ok(r) => self.journal.record(
                            AuditEvent::succeeded("restore", &r.source_id).with_detail(format!(
                                "{}: {}/{} documents, pre-restore {}",
                                r.method,
                                r.restored_count,
                                r.expected_count,
                                r.pre_restore_snapshot.as_deref().unwrap_or("none")
                            )),
                        ),
                        Err(e) => self.journal.record(
                            AuditEvent::failed("restore", &target, e).with_severity(LogLevel::Error),
                        ),
                    }
                    return report;
                }
                Err(e) => {
                    self.journal.record(AuditEvent::failed(
                        &format!("restore_tier_{}", tier.as_str().replace('-', "_")),
                        &target,
                        &e,
                    ));
                    attempts.push(TierAttempt {
                        tier,
                        error: e.to_string(),
                    });
                }
            }
        }

        let err = VaultError::RestoreExhausted {
            attempts: attempts
                .iter()
                .map(|a| format!("{}: {}", a.tier, a.error))
                .collect(),
        };
        self.journal
            .record(AuditEvent::failed("restore", &target, &err).with_severity(LogLevel::Error));
        Err(err)
    }

    async fn gather(&self, tier: RestoreTier, request: &RestoreRequest) -> VaultResult<RestoreSource> {
        match tier {
            RestoreTier::External => {
                if !self.mirror.is_configured() {
                    return Err(VaultError::remote(RemoteFailure::NotConfigured));
                }
                let pulled = self
                    .mirror
                    .pull(PullSelector::from(request.snapshot_id.clone()))
                    .await?;
                Ok(RestoreSource {
                    tier,
                    source_id: pulled.snapshot_id,
                    documents: pulled.documents.into_iter().map(|d| (d.name, d.body)).collect(),
                })
            }
            RestoreTier::LocalAuto => self.gather_local(tier, SnapshotKind::Auto, request).await,
            RestoreTier::LocalManual => self.gather_local(tier, SnapshotKind::Manual, request).await,
            RestoreTier::LocalPreRestore => self.gather_local(tier, SnapshotKind::PreRestore, request).await,
        }
    }

    async fn gather_local(
        &self,
        tier: RestoreTier,
        kind: SnapshotKind,
        request: &RestoreRequest,
    ) -> VaultResult<RestoreSource> {
        let info = match &request.snapshot_id {
            Some(id) => self.snapshots.locate(kind, id)?,
            None => self
                .snapshots
                .latest(kind)?
                .ok_or_else(|| VaultError::not_found(format!("{kind} snapshot"), "latest"))?,
        };

        let specs = self.store.specs().to_vec();
        let source_id = info.id.clone();
        let documents = run_blocking(
            "restore read",
            self.local_timeout,
            Cancellation::default(),
            move || read_all(&info, &specs),
        )
        .await?;

        Ok(RestoreSource {
            tier,
            source_id,
            documents,
        })
    }

    async fn apply(&self, source: RestoreSource, attempts: Vec<TierAttempt>) -> VaultResult<RestoreReport> {
        let pre = self.snapshots.create_internal(SnapshotTrigger::PreRestore).await?;
        tracing::info!(snapshot = %pre.id(), tier = %source.tier, source = %source.source_id, "pre-restore snapshot taken");

        let expected_count = self.store.specs().len();
        let mut applied: Vec<String> = Vec::new();
        for (name, body) in source.documents {
            if let Err(e) = self.store.save(&name, body) {
                let (rolled_back, left_applied) = self.roll_back(&pre, &applied);
                tracing::error!(
                    document = %name,
                    source = %source.source_id,
                    ?rolled_back,
                    ?left_applied,
                    error = %e,
                    "restore write failed, rolled back to pre-restore copy"
                );
                return Err(VaultError::RestoreAborted {
                    source_id: source.source_id,
                    document: name,
                    message: e.to_string(),
                    rolled_back,
                    left_applied,
                });
            }
            applied.push(name);
        }

        Ok(RestoreReport {
            success: true,
            method: source.tier,
            restored_count: applied.len(),
            expected_count,
            source_id: source.source_id,
            pre_restore_snapshot: Some(pre.id().to_string()),
            attempts,
        })
    }

    /// Put documents written by an aborted restore back to their pre-restore
    /// state. Returns (rolled back, still holding restored data).
    fn roll_back(&self, pre: &SnapshotResult, applied: &[String]) -> (Vec<String>, Vec<String>) {
        let info = SnapshotInfo {
            id: pre.id().to_string(),
            kind: pre.metadata.kind,
            path: pre.path.clone(),
            created_at: pre.metadata.created_at,
            metadata: Some(pre.metadata.clone()),
        };

        let mut rolled_back = Vec::new();
        let mut left_applied = Vec::new();
        for name in applied {
            match self.revert_document(&info, name) {
                Ok(()) => rolled_back.push(name.clone()),
                Err(e) => {
                    self.journal.record(AuditEvent::failed("restore_rollback", name, &e));
                    left_applied.push(name.clone());
                }
            }
        }
        (rolled_back, left_applied)
    }

    fn revert_document(&self, pre: &SnapshotInfo, name: &str) -> VaultResult<()> {
        let spec = self.store.spec(name)?;
        let status = pre
            .metadata
            .as_ref()
            .and_then(|m| m.document(name))
            .map(|d| d.status);
        match status {
            // No live file existed before the restore
            Some(DocumentStatus::Missing) => self.store.discard(name),
            _ => {
                let value = read_snapshot_document(pre, spec)?;
                self.store.save(name, value).map(|_| ())
            }
        }
    }
}

/// Every readable document of a snapshot; fails when none are usable
fn read_all(info: &SnapshotInfo, specs: &[DocumentSpec]) -> VaultResult<Vec<(String, Value)>> {
    let mut documents = Vec::new();
    for spec in specs {
        match read_snapshot_document(info, spec) {
            Ok(value) => documents.push((spec.name.clone(), value)),
            Err(e) => {
                tracing::warn!(snapshot = %info.id, document = %spec.name, error = %e, "snapshot document unusable")
            }
        }
    }
    if documents.is_empty() {
        return Err(VaultError::not_found(
            format!("documents in snapshot {}", info.id),
            "any",
        ));
    }
    Ok(documents)
}
