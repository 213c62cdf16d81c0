//! External Mirror Sync
//!
//! Snapshots are pushed to a remote target behind the [`MirrorClient`] trait
//! and pulled back document by document. Every remote call runs under the
//! configured mirror timeout, and push/pull share one in-progress guard.
//! Failures are reported as structured values so the restore orchestrator
//! can fall through to the next tier.

mod directory;
mod github;

pub use directory::DirectoryMirror;
pub use github::GitHubMirror;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditEvent, Journal};
use crate::config::MirrorConfig;
use crate::document::{plausible_shape, DocumentSpec};
use crate::errors::{RemoteFailure, VaultError, VaultResult};
use crate::guard::{with_timeout, BusyGuard};
use crate::snapshot::id_timestamp;

/// A snapshot directory held by the mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteSnapshot {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl RemoteSnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let created_at = id_timestamp(&id);
        Self { id, created_at }
    }
}

/// Order remote snapshots newest first: by the timestamp embedded in the id,
/// then by name for ids without one.
pub fn sort_newest_first(snapshots: &mut [RemoteSnapshot]) {
    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}

#[async_trait]
pub trait MirrorClient: Send + Sync {
    /// Short label reported as the sync method
    fn name(&self) -> &str;

    /// Pre-flight: reachability and credentials
    async fn check_access(&self) -> VaultResult<()>;

    /// Upload the snapshot directory under its id, replacing remote state
    async fn push(&self, snapshot_id: &str, snapshot_dir: &Path) -> VaultResult<()>;

    /// Remote snapshots, newest first
    async fn list_snapshots(&self) -> VaultResult<Vec<RemoteSnapshot>>;

    /// One file of a remote snapshot; `None` when the file is absent
    async fn fetch_file(&self, snapshot_id: &str, file: &str) -> VaultResult<Option<Vec<u8>>>;
}

/// Build the configured client, if any
pub fn client_from_config(config: &MirrorConfig) -> VaultResult<Option<Arc<dyn MirrorClient>>> {
    if !config.enabled {
        return Ok(None);
    }
    if let Some(dir) = &config.directory {
        let client = DirectoryMirror::new(dir.clone(), &config.remote_dir, config.max_remote_snapshots);
        return Ok(Some(Arc::new(client)));
    }
    Ok(Some(Arc::new(GitHubMirror::from_config(config)?)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullSelector {
    Latest,
    Id(String),
}

impl From<Option<String>> for PullSelector {
    fn from(id: Option<String>) -> Self {
        id.map(PullSelector::Id).unwrap_or(PullSelector::Latest)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PushResult {
    pub success: bool,
    pub method: String,
    pub snapshot_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PulledDocument {
    pub name: String,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct PullResult {
    pub snapshot_id: String,
    pub documents: Vec<PulledDocument>,
    pub expected_count: usize,
    /// Per-document problems that did not abort the pull
    pub failures: Vec<String>,
}

impl PullResult {
    pub fn restored_count(&self) -> usize {
        self.documents.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    pub configured: bool,
    pub connected: bool,
    pub method: Option<String>,
    pub error: Option<String>,
}

pub struct MirrorSync {
    client: Option<Arc<dyn MirrorClient>>,
    timeout: Duration,
    specs: Vec<DocumentSpec>,
    busy: Arc<AtomicBool>,
    journal: Arc<Journal>,
}

impl MirrorSync {
    pub fn new(
        client: Option<Arc<dyn MirrorClient>>,
        timeout: Duration,
        specs: Vec<DocumentSpec>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            client,
            timeout,
            specs,
            busy: Arc::new(AtomicBool::new(false)),
            journal,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub fn method(&self) -> Option<&str> {
        self.client.as_deref().map(|c| c.name())
    }

    fn client(&self) -> VaultResult<&Arc<dyn MirrorClient>> {
        self.client
            .as_ref()
            .ok_or(VaultError::RemoteUnavailable(RemoteFailure::NotConfigured))
    }

    pub async fn check_access(&self) -> VaultResult<()> {
        let client = self.client()?;
        with_timeout("mirror check_access", self.timeout, client.check_access()).await
    }

    /// Push a local snapshot directory; failures come back in the result
    pub async fn push(&self, snapshot_id: &str, snapshot_dir: &Path) -> PushResult {
        let method = self.method().unwrap_or("none").to_string();
        let outcome = self.try_push(snapshot_id, snapshot_dir).await;

        match &outcome {
            Ok(()) => self
                .journal
                .record(AuditEvent::succeeded("mirror_push", snapshot_id).with_detail(method.clone())),
            Err(e) => self.journal.record(AuditEvent::failed("mirror_push", snapshot_id, e)),
        }

        PushResult {
            success: outcome.is_ok(),
            method,
            snapshot_id: snapshot_id.to_string(),
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    async fn try_push(&self, snapshot_id: &str, snapshot_dir: &Path) -> VaultResult<()> {
        let client = self.client()?;
        let _guard = BusyGuard::acquire(&self.busy, "mirror sync")?;
        if !snapshot_dir.is_dir() {
            return Err(VaultError::not_found("snapshot", snapshot_id));
        }
        self.check_access().await?;
        with_timeout("mirror push", self.timeout, client.push(snapshot_id, snapshot_dir)).await
    }

    /// Download the selected remote snapshot's documents.
    ///
    /// Missing or invalid single files are recorded in `failures`; the pull
    /// fails only when no document at all could be recovered.
    pub async fn pull(&self, selector: PullSelector) -> VaultResult<PullResult> {
        let target = match &selector {
            PullSelector::Latest => "latest".to_string(),
            PullSelector::Id(id) => id.clone(),
        };
        let outcome = self.try_pull(selector).await;
        match &outcome {
            Ok(pulled) => self.journal.record(
                AuditEvent::succeeded("mirror_pull", &pulled.snapshot_id).with_detail(format!(
                    "{}/{} documents",
                    pulled.restored_count(),
                    pulled.expected_count
                )),
            ),
            Err(e) => self.journal.record(AuditEvent::failed("mirror_pull", &target, e)),
        }
        outcome
    }

    async fn try_pull(&self, selector: PullSelector) -> VaultResult<PullResult> {
        let client = self.client()?;
        let _guard = BusyGuard::acquire(&self.busy, "mirror sync")?;
        self.check_access().await?;

        let mut remote = with_timeout("mirror list", self.timeout, client.list_snapshots()).await?;
        sort_newest_first(&mut remote);
        let snapshot_id = match selector {
            PullSelector::Latest => remote
                .first()
                .map(|s| s.id.clone())
                .ok_or_else(|| VaultError::not_found("mirror snapshot", "latest"))?,
            PullSelector::Id(id) => {
                if !remote.iter().any(|s| s.id == id) {
                    return Err(VaultError::not_found("mirror snapshot", id));
                }
                id
            }
        };

        let mut documents = Vec::new();
        let mut failures = Vec::new();
        for spec in &self.specs {
            let fetched = with_timeout(
                "mirror fetch",
                self.timeout,
                client.fetch_file(&snapshot_id, &spec.file),
            )
            .await;

            match fetched.and_then(|raw| parse_pulled(spec, raw)) {
                Ok(body) => documents.push(PulledDocument {
                    name: spec.name.clone(),
                    body,
                }),
                Err(e) => {
                    tracing::warn!(document = %spec.name, snapshot = %snapshot_id, error = %e, "mirror document skipped");
                    failures.push(format!("{}: {}", spec.name, e));
                }
            }
        }

        if documents.is_empty() {
            return Err(VaultError::not_found("documents on mirror snapshot", snapshot_id));
        }

        Ok(PullResult {
            snapshot_id,
            documents,
            expected_count: self.specs.len(),
            failures,
        })
    }

    pub async fn status(&self) -> MirrorStatus {
        let Some(method) = self.method().map(str::to_string) else {
            return MirrorStatus {
                configured: false,
                connected: false,
                method: None,
                error: None,
            };
        };
        let check = self.check_access().await;
        MirrorStatus {
            configured: true,
            connected: check.is_ok(),
            method: Some(method),
            error: check.err().map(|e| e.to_string()),
        }
    }
}

fn parse_pulled(spec: &DocumentSpec, raw: Option<Vec<u8>>) -> VaultResult<Value> {
    let raw = raw.ok_or_else(|| VaultError::not_found("mirror file", spec.file.as_str()))?;
    let value: Value = serde_json::from_slice(&raw)
        .map_err(|e| VaultError::serialization(format!("parsing mirrored {}", spec.file), e))?;
    if !plausible_shape(spec, &value, false) {
        return Err(VaultError::validation(spec.name.as_str(), "mirrored copy is not a JSON object"));
    }
    Ok(value)
}
