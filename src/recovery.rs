//! Ad-hoc Recovery Scanner
//!
//! Last-resort reconstruction when neither the mirror nor any snapshot pool
//! has data: walk a bounded directory tree for files that look like managed
//! documents, classify each one, and propose the first valid candidate per
//! document. Nothing is written until the operator accepts a selection.
//!
//! Walk order is file-name order within each directory. No other ranking is
//! applied; every candidate is listed so the operator can choose.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

use crate::audit::{AuditEvent, Journal};
use crate::config::RecoveryConfig;
use crate::document::{plausible_shape, DocumentSpec};
use crate::errors::{VaultError, VaultResult};
use crate::guard::{run_blocking, Cancellation};
use crate::mirror::{MirrorSync, PushResult};
use crate::secure_file_ops::is_transient_name;
use crate::snapshot::{SnapshotManager, SnapshotTrigger, METADATA_FILE};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateVerdict {
    Valid,
    Empty,
    Malformed,
    NotAnObject,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryCandidate {
    pub document: String,
    pub path: PathBuf,
    pub verdict: CandidateVerdict,
    pub entity_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPlan {
    pub root: PathBuf,
    /// Every candidate considered, in walk order
    pub candidates: Vec<RecoveryCandidate>,
    /// First valid candidate per document
    pub proposed: BTreeMap<String, PathBuf>,
    pub files_scanned: usize,
    /// The file budget ran out before the walk finished
    pub truncated: bool,
}

impl RecoveryPlan {
    pub fn candidates_for<'a>(&'a self, document: &'a str) -> impl Iterator<Item = &'a RecoveryCandidate> + 'a {
        self.candidates.iter().filter(move |c| c.document == document)
    }

    pub fn has_proposal(&self) -> bool {
        !self.proposed.is_empty()
    }
}

/// Which candidates to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySelection {
    AcceptProposed,
    /// Explicit path per document; each must be a candidate of the plan
    Paths(BTreeMap<String, PathBuf>),
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub restored: Vec<String>,
    pub snapshot_id: Option<String>,
    pub snapshot_error: Option<String>,
    pub push: Option<PushResult>,
}

/// Document a file name belongs to, if any
pub fn match_document<'a>(specs: &'a [DocumentSpec], file_name: &str) -> Option<&'a DocumentSpec> {
    let lower = file_name.to_lowercase();
    if !lower.ends_with(".json") || lower == METADATA_FILE || is_transient_name(file_name) {
        return None;
    }
    specs
        .iter()
        .find(|spec| spec.match_stems().iter().any(|stem| lower.contains(stem.as_str())))
}

fn classify(spec: &DocumentSpec, path: &Path) -> RecoveryCandidate {
    let mut candidate = RecoveryCandidate {
        document: spec.name.clone(),
        path: path.to_path_buf(),
        verdict: CandidateVerdict::Malformed,
        entity_count: 0,
        error: None,
    };

    let value = match fs::read(path).map_err(|e| e.to_string()).and_then(|raw| {
        serde_json::from_slice::<Value>(&raw).map_err(|e| e.to_string())
    }) {
        Ok(value) => value,
        Err(e) => {
            candidate.error = Some(e);
            return candidate;
        }
    };

    candidate.verdict = match &value {
        Value::Object(map) => {
            candidate.entity_count = map.len();
            if map.is_empty() || !plausible_shape(spec, &value, true) {
                CandidateVerdict::Empty
            } else {
                CandidateVerdict::Valid
            }
        }
        _ => CandidateVerdict::NotAnObject,
    };
    candidate
}

struct ScanJob {
    root: PathBuf,
    specs: Vec<DocumentSpec>,
    limits: RecoveryConfig,
    cancel: Cancellation,
}

impl ScanJob {
    fn run(self) -> VaultResult<RecoveryPlan> {
        if !self.root.is_dir() {
            return Err(VaultError::not_found("recovery root", self.root.display().to_string()));
        }

        let skip = &self.limits.skip_dirs;
        let walker = WalkDir::new(&self.root)
            .max_depth(self.limits.max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !skip.iter().any(|s| entry.file_name().to_string_lossy() == s.as_str())
            });

        let mut plan = RecoveryPlan {
            root: self.root.clone(),
            candidates: Vec::new(),
            proposed: BTreeMap::new(),
            files_scanned: 0,
            truncated: false,
        };

        for entry in walker {
            if self.cancel.is_cancelled() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable path during recovery scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if plan.files_scanned >= self.limits.max_files {
                plan.truncated = true;
                break;
            }
            plan.files_scanned += 1;

            let name = entry.file_name().to_string_lossy();
            let Some(spec) = match_document(&self.specs, &name) else {
                continue;
            };

            let candidate = classify(spec, entry.path());
            tracing::info!(
                document = %candidate.document,
                path = %candidate.path.display(),
                verdict = ?candidate.verdict,
                entities = candidate.entity_count,
                "recovery candidate"
            );
            if candidate.verdict == CandidateVerdict::Valid && !plan.proposed.contains_key(&spec.name) {
                plan.proposed.insert(spec.name.clone(), candidate.path.clone());
            }
            plan.candidates.push(candidate);
        }

        Ok(plan)
    }
}

pub struct RecoveryScanner {
    store: Arc<RecordStore>,
    snapshots: Arc<SnapshotManager>,
    mirror: Arc<MirrorSync>,
    journal: Arc<Journal>,
    limits: RecoveryConfig,
    local_timeout: Duration,
}

impl RecoveryScanner {
    pub fn new(
        store: Arc<RecordStore>,
        snapshots: Arc<SnapshotManager>,
        mirror: Arc<MirrorSync>,
        journal: Arc<Journal>,
        limits: RecoveryConfig,
        local_timeout: Duration,
    ) -> Self {
        Self {
            store,
            snapshots,
            mirror,
            journal,
            limits,
            local_timeout,
        }
    }

    /// Walk `root` and classify every file that looks like a managed document
    pub async fn scan(&self, root: &Path) -> VaultResult<RecoveryPlan> {
        let cancel = Cancellation::default();
        let job = ScanJob {
            root: root.to_path_buf(),
            specs: self.store.specs().to_vec(),
            limits: self.limits.clone(),
            cancel: cancel.clone(),
        };

        let plan = run_blocking("recovery scan", self.local_timeout, cancel, move || job.run()).await;
        match &plan {
            Ok(plan) => self.journal.record(
                AuditEvent::succeeded("recovery_scan", &root.display().to_string()).with_detail(format!(
                    "{} files, {} candidates, {} proposed{}",
                    plan.files_scanned,
                    plan.candidates.len(),
                    plan.proposed.len(),
                    if plan.truncated { ", truncated" } else { "" }
                )),
            ),
            Err(e) => self
                .journal
                .record(AuditEvent::failed("recovery_scan", &root.display().to_string(), e)),
        }
        plan
    }

    /// Save the selected candidates, then snapshot and mirror the result.
    ///
    /// Every selected file is re-read and checked before the first save, so a
    /// bad selection writes nothing.
    pub async fn apply(&self, plan: &RecoveryPlan, selection: RecoverySelection) -> VaultResult<RecoveryOutcome> {
        let chosen = match selection {
            RecoverySelection::AcceptProposed => plan.proposed.clone(),
            RecoverySelection::Paths(paths) => {
                for (document, path) in &paths {
                    if !plan.candidates_for(document).any(|c| &c.path == path) {
                        return Err(VaultError::validation(
                            "selection",
                            format!("{} is not a candidate for {document}", path.display()),
                        ));
                    }
                }
                paths
            }
        };
        if chosen.is_empty() {
            return Err(VaultError::not_found(
                "recovery candidates",
                plan.root.display().to_string(),
            ));
        }

        let mut bodies = Vec::with_capacity(chosen.len());
        for (document, path) in &chosen {
            let spec = self.store.spec(document)?;
            let candidate = classify(spec, path);
            if candidate.verdict != CandidateVerdict::Valid {
                return Err(VaultError::validation(
                    document.as_str(),
                    format!("{} is no longer a valid source ({:?})", path.display(), candidate.verdict),
                ));
            }
            let raw = fs::read(path).map_err(|e| VaultError::io("reading recovery source", e))?;
            bodies.push((document.clone(), serde_json::from_slice::<Value>(&raw)?));
        }

        let mut restored = Vec::new();
        for (document, body) in bodies {
            self.store.save(&document, body)?;
            self.journal.record(
                AuditEvent::succeeded("recovery_apply", &document)
                    .with_detail(chosen[&document].display().to_string()),
            );
            restored.push(document);
        }

        let (snapshot_id, snapshot_error, push) =
            match self.snapshots.create_internal(SnapshotTrigger::Recovery).await {
                Ok(snapshot) => {
                    let push = if self.mirror.is_configured() {
                        Some(self.mirror.push(snapshot.id(), &snapshot.path).await)
                    } else {
                        None
                    };
                    (Some(snapshot.id().to_string()), None, push)
                }
                Err(e) => {
                    tracing::error!(error = %e, "recovered data could not be snapshotted");
                    (None, Some(e.to_string()), None)
                }
            };

        Ok(RecoveryOutcome {
            restored,
            snapshot_id,
            snapshot_error,
            push,
        })
    }

    /// Write empty documents for every managed document that has no file,
    /// so the application can start from a clean slate.
    pub fn seed_empty(&self) -> VaultResult<Vec<String>> {
        let mut seeded = Vec::new();
        for spec in self.store.specs() {
            if self.store.document_path(spec).exists() {
                continue;
            }
            self.store.save(&spec.name, Value::Object(Map::new()))?;
            seeded.push(spec.name.clone());
        }
        if !seeded.is_empty() {
            self.journal
                .record(AuditEvent::succeeded("seed_empty", &seeded.join(",")));
        }
        Ok(seeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::default_documents;
    use tempfile::tempdir;

    fn job(root: &Path, max_files: usize) -> ScanJob {
        ScanJob {
            root: root.to_path_buf(),
            specs: default_documents(),
            limits: RecoveryConfig {
                max_depth: 4,
                max_files,
                skip_dirs: vec!["node_modules".into()],
            },
            cancel: Cancellation::default(),
        }
    }

    #[test]
    fn file_names_map_to_documents() {
        let specs = default_documents();
        assert_eq!(match_document(&specs, "users_backup_2025.json").unwrap().name, "accounts");
        assert_eq!(match_document(&specs, "SHOP.json").unwrap().name, "catalog");
        assert_eq!(match_document(&specs, "emojis.json").unwrap().name, "symbol-table");
        assert!(match_document(&specs, "metadata.json").is_none());
        assert!(match_document(&specs, "users.txt").is_none());
        assert!(match_document(&specs, ".users.json.abc.tmp").is_none());
    }

    #[test]
    fn scan_classifies_and_proposes_first_valid() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a_old")).unwrap();
        fs::create_dir_all(root.join("b_manual")).unwrap();
        fs::create_dir_all(root.join("node_modules")).unwrap();
        fs::write(root.join("a_old").join("users.json"), b"{}").unwrap();
        fs::write(root.join("a_old").join("shop.json"), b"{broken").unwrap();
        fs::write(root.join("b_manual").join("users.json"), br#"{"u1": {"cartridge": 4}}"#).unwrap();
        fs::write(root.join("b_manual").join("emojis.json"), b"[1]").unwrap();
        fs::write(root.join("node_modules").join("users.json"), br#"{"x": {}}"#).unwrap();
        fs::write(root.join("users_backup.json"), br#"{"u9": {}}"#).unwrap();

        let plan = job(root, 100).run().unwrap();
        let verdicts: Vec<(String, CandidateVerdict)> = plan
            .candidates
            .iter()
            .map(|c| (c.document.clone(), c.verdict))
            .collect();
        assert_eq!(
            verdicts,
            vec![
                ("catalog".to_string(), CandidateVerdict::Malformed),
                ("accounts".to_string(), CandidateVerdict::Empty),
                ("symbol-table".to_string(), CandidateVerdict::NotAnObject),
                ("accounts".to_string(), CandidateVerdict::Valid),
                ("accounts".to_string(), CandidateVerdict::Valid),
            ]
        );
        assert_eq!(plan.proposed["accounts"], root.join("b_manual").join("users.json"));
        assert!(!plan.proposed.contains_key("catalog"));
        assert!(!plan.truncated);
    }

    #[test]
    fn file_budget_truncates_walk() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("users_{i}.json")), br#"{"u": {}}"#).unwrap();
        }
        let plan = job(dir.path(), 2).run().unwrap();
        assert!(plan.truncated);
        assert_eq!(plan.files_scanned, 2);
    }

    #[test]
    fn missing_root_is_not_found() {
        assert!(matches!(
            job(Path::new("/nonexistent/vaultkeeper-scan"), 10).run(),
            Err(VaultError::NotFound { .. })
        ));
    }
}
