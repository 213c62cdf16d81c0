//! Atomic Record Store
//!
//! Durable document storage with crash-safe writes and an in-process read
//! cache. The cache belongs to the store instance, so independent stores
//! (one per test, one per data directory) never share state.
//!
//! Concurrency: `save` calls for the same document are serialized by a
//! per-document mutex. Two callers that each load, modify and save the same
//! document still race at the application level, and the last writer wins.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::audit::{AuditEvent, Journal, LogLevel};
use crate::config::VaultConfig;
use crate::document::{repair, Document, DocumentSpec};
use crate::errors::{SafeLock, SafeReadLock, SafeWriteLock, VaultError, VaultResult};
use crate::secure_file_ops::{atomic_write, sweep_transient};

/// Read cache keyed by document name
#[derive(Debug, Default)]
pub struct DocumentCache {
    entries: RwLock<HashMap<String, Map<String, Value>>>,
}

impl DocumentCache {
    pub fn get(&self, name: &str) -> VaultResult<Option<Map<String, Value>>> {
        Ok(self.entries.safe_read()?.get(name).cloned())
    }

    pub fn insert(&self, name: &str, body: Map<String, Value>) -> VaultResult<()> {
        self.entries.safe_write()?.insert(name.to_string(), body);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> VaultResult<()> {
        self.entries.safe_write()?.remove(name);
        Ok(())
    }

    pub fn names(&self) -> VaultResult<Vec<String>> {
        let mut names: Vec<String> = self.entries.safe_read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn len(&self) -> VaultResult<usize> {
        Ok(self.entries.safe_read()?.len())
    }

    pub fn is_empty(&self) -> VaultResult<bool> {
        Ok(self.len()? == 0)
    }
}

pub struct RecordStore {
    data_dir: PathBuf,
    history_dir: PathBuf,
    specs: Vec<DocumentSpec>,
    cache: DocumentCache,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    history_interval: Duration,
    max_history: usize,
    last_history: Mutex<HashMap<String, Instant>>,
    journal: Arc<Journal>,
}

impl RecordStore {
    /// Open the store, creating its directories and sweeping temp files an
    /// interrupted save may have left behind.
    pub fn open(config: &VaultConfig, journal: Arc<Journal>) -> VaultResult<Self> {
        let storage = &config.storage;
        for dir in [&storage.data_dir, &storage.history_dir] {
            fs::create_dir_all(dir).map_err(|e| VaultError::io("creating store directory", e))?;
        }

        let swept = sweep_transient(&storage.data_dir);
        if swept > 0 {
            tracing::warn!(count = swept, dir = %storage.data_dir.display(), "removed temp files from an interrupted save");
        }

        Ok(Self {
            data_dir: storage.data_dir.clone(),
            history_dir: storage.history_dir.clone(),
            specs: storage.documents.clone(),
            cache: DocumentCache::default(),
            write_locks: Mutex::new(HashMap::new()),
            history_interval: config.snapshots.history_interval(),
            max_history: config.snapshots.max_history_per_document,
            last_history: Mutex::new(HashMap::new()),
            journal,
        })
    }

    pub fn specs(&self) -> &[DocumentSpec] {
        &self.specs
    }

    pub fn spec(&self, name: &str) -> VaultResult<&DocumentSpec> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| VaultError::not_found("document", name))
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn document_path(&self, spec: &DocumentSpec) -> PathBuf {
        self.data_dir.join(&spec.file)
    }

    /// Load a document, serving the cache when possible.
    ///
    /// An absent or unparsable file yields an empty document: callers treat
    /// empty state as "no data yet".
    pub fn load(&self, name: &str) -> VaultResult<Document> {
        let spec = self.spec(name)?;
        let path = self.document_path(spec);

        if let Some(body) = self.cache.get(name)? {
            return Ok(Document {
                name: name.to_string(),
                body,
                path,
            });
        }

        let Some(body) = self.read_from_disk(spec, &path) else {
            return Ok(Document::empty(name, path));
        };

        self.cache.insert(name, body.clone())?;
        Ok(Document {
            name: name.to_string(),
            body,
            path,
        })
    }

    fn read_from_disk(&self, spec: &DocumentSpec, path: &Path) -> Option<Map<String, Value>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                self.journal.record(AuditEvent::failed(
                    "load",
                    &spec.name,
                    &VaultError::io("reading document", e),
                ));
                return None;
            }
        };

        let parsed = serde_json::from_slice::<Value>(&raw)
            .map_err(|e| VaultError::serialization(format!("parsing {}", path.display()), e))
            .and_then(|value| repair(spec, value));

        match parsed {
            Ok(repaired) => {
                if repaired.repairs > 0 {
                    tracing::warn!(document = %spec.name, repairs = repaired.repairs, "repaired document shape on load");
                }
                Some(repaired.body)
            }
            Err(e) => {
                self.journal.record(AuditEvent::failed("load", &spec.name, &e));
                None
            }
        }
    }

    /// Drop the cached copy and read the document from disk again
    pub fn reload(&self, name: &str) -> VaultResult<Document> {
        self.spec(name)?;
        self.cache.remove(name)?;
        self.load(name)
    }

    /// Validate, repair and atomically persist a document body.
    ///
    /// On failure the previous on-disk and cached values stay untouched. If
    /// the live file turns out to be damaged, the newest history copy is
    /// re-applied before the error is returned.
    pub fn save(&self, name: &str, body: Value) -> VaultResult<Document> {
        let spec = self.spec(name)?.clone();
        let path = self.document_path(&spec);

        let lock = self.write_lock(name)?;
        let _guard = lock.safe_lock()?;

        let repaired = repair(&spec, body).inspect_err(|e| {
            self.journal.record(AuditEvent::failed("save", name, e));
        })?;
        if repaired.repairs > 0 {
            tracing::warn!(document = %name, repairs = repaired.repairs, "repaired document shape before save");
        }

        self.maybe_record_history(&spec, &path);

        let bytes = serde_json::to_vec_pretty(&repaired.body)
            .map_err(|e| VaultError::serialization(format!("serializing {name}"), e))?;

        match atomic_write(&path, &bytes) {
            Ok(()) => {
                self.cache.insert(name, repaired.body.clone())?;
                self.journal.record(AuditEvent::new("save", name).with_severity(LogLevel::Debug));
                Ok(Document {
                    name: name.to_string(),
                    body: repaired.body,
                    path,
                })
            }
            Err(e) => {
                self.journal.record(AuditEvent::failed("save", name, &e).with_severity(LogLevel::Error));
                let recovered = self.heal_after_failed_write(&spec, &path);
                Err(VaultError::write_failure(name, e.to_string(), recovered))
            }
        }
    }

    /// Remove a document's live file and cached copy
    pub fn discard(&self, name: &str) -> VaultResult<()> {
        let spec = self.spec(name)?.clone();
        let path = self.document_path(&spec);

        let lock = self.write_lock(name)?;
        let _guard = lock.safe_lock()?;

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VaultError::io("removing document", e)),
        }
        self.cache.remove(name)?;
        self.journal.record(AuditEvent::succeeded("discard", name));
        Ok(())
    }

    fn write_lock(&self, name: &str) -> VaultResult<Arc<Mutex<()>>> {
        let mut locks = self.write_locks.safe_lock()?;
        Ok(Arc::clone(locks.entry(name.to_string()).or_default()))
    }

    /// Re-apply the newest history copy when the live file is damaged
    fn heal_after_failed_write(&self, spec: &DocumentSpec, path: &Path) -> bool {
        let intact = fs::read(path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok())
            .map(|v| v.is_object())
            .unwrap_or(false);
        if intact {
            return false;
        }

        match self.recover_document(&spec.name) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                self.journal.record(AuditEvent::failed("history_recover", &spec.name, &e));
                false
            }
        }
    }

    /// Re-apply the newest parseable history copy of a document.
    pub fn recover_document(&self, name: &str) -> VaultResult<Option<Document>> {
        let spec = self.spec(name)?.clone();
        let path = self.document_path(&spec);

        for candidate in self.history_files(&spec)? {
            let parsed = fs::read(&candidate)
                .map_err(|e| VaultError::io("reading history copy", e))
                .and_then(|raw| serde_json::from_slice::<Value>(&raw).map_err(VaultError::from))
                .and_then(|value| repair(&spec, value));

            let repaired = match parsed {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(document = %name, candidate = %candidate.display(), error = %e, "skipping unusable history copy");
                    continue;
                }
            };

            let bytes = serde_json::to_vec_pretty(&repaired.body)?;
            atomic_write(&path, &bytes)?;
            self.cache.insert(name, repaired.body.clone())?;
            self.journal.record(
                AuditEvent::succeeded("history_recover", name)
                    .with_detail(candidate.display().to_string()),
            );
            return Ok(Some(Document {
                name: name.to_string(),
                body: repaired.body,
                path,
            }));
        }

        Ok(None)
    }

    /// Copy the previous on-disk file into history when the interval elapsed
    fn maybe_record_history(&self, spec: &DocumentSpec, path: &Path) {
        if !path.exists() {
            return;
        }

        let due = match self.last_history.lock() {
            Ok(mut last) => {
                let now = Instant::now();
                let due = last
                    .get(&spec.name)
                    .map(|t| now.duration_since(*t) >= self.history_interval)
                    .unwrap_or(true);
                if due {
                    last.insert(spec.name.clone(), now);
                }
                due
            }
            Err(_) => false,
        };
        if !due {
            return;
        }

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let target = self
            .history_dir
            .join(format!("{}_backup_{}_{}.json", spec.name, stamp, &suffix[..4]));

        match fs::copy(path, &target) {
            Ok(_) => {
                self.journal.record(
                    AuditEvent::new("history_copy", &spec.name)
                        .with_severity(LogLevel::Debug)
                        .with_detail(target.display().to_string()),
                );
                self.prune_history(spec);
            }
            Err(e) => self.journal.record(AuditEvent::failed(
                "history_copy",
                &spec.name,
                &VaultError::io("copying previous document", e),
            )),
        }
    }

    /// History copies for a document, newest first
    pub fn history_files(&self, spec: &DocumentSpec) -> VaultResult<Vec<PathBuf>> {
        let prefix = format!("{}_backup_", spec.name);
        let entries = match fs::read_dir(&self.history_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::io("listing history", e)),
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                        .unwrap_or(false)
            })
            .collect();
        // Timestamped names sort chronologically
        files.sort();
        files.reverse();
        Ok(files)
    }

    fn prune_history(&self, spec: &DocumentSpec) {
        let files = match self.history_files(spec) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(document = %spec.name, error = %e, "failed to list history for pruning");
                return;
            }
        };
        for stale in files.iter().skip(self.max_history) {
            if let Err(e) = fs::remove_file(stale) {
                tracing::warn!(path = %stale.display(), error = %e, "failed to prune history copy");
            }
        }
    }

    /// Re-save every cached document; used on shutdown
    pub fn flush_all(&self) -> VaultResult<usize> {
        let mut flushed = 0;
        for name in self.cache.names()? {
            if let Some(body) = self.cache.get(&name)? {
                self.save(&name, Value::Object(body))?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentSpec;
    use serde_json::json;
    use tempfile::tempdir;

    fn store_in(root: &Path, history_interval_secs: u64) -> RecordStore {
        let mut config = VaultConfig::rooted_at(root);
        config.storage.documents = vec![
            DocumentSpec::entities("accounts", "users.json", &["counter"], &[]),
            DocumentSpec::object("catalog", "shop.json"),
        ];
        config.snapshots.history_interval_secs = history_interval_secs;
        config.snapshots.max_history_per_document = 3;
        RecordStore::open(&config, Arc::new(Journal::disabled())).unwrap()
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        let doc = store.load("accounts").unwrap();
        assert!(doc.is_empty());
        assert!(store.cache().is_empty().unwrap());
    }

    #[test]
    fn unknown_document_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        assert!(matches!(store.load("ghost"), Err(VaultError::NotFound { .. })));
    }

    #[test]
    fn unparsable_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        fs::write(dir.path().join("data").join("users.json"), b"{ not json").unwrap();
        assert!(store.load("accounts").unwrap().is_empty());
    }

    #[test]
    fn save_repairs_and_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);

        store.save("accounts", json!({"u1": {"counter": -3}, "u2": {}})).unwrap();
        let fresh = store_in(dir.path(), 300);
        let doc = fresh.load("accounts").unwrap();
        assert_eq!(Value::Object(doc.body), json!({"u1": {"counter": 0}, "u2": {"counter": 0}}));
    }

    #[test]
    fn on_disk_bytes_match_saved_content() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        let doc = store.save("catalog", json!({"Nitro Basic": 3300})).unwrap();

        let on_disk = fs::read(&doc.path).unwrap();
        assert_eq!(on_disk, serde_json::to_vec_pretty(&doc.body).unwrap());
    }

    #[test]
    fn invalid_body_leaves_previous_value() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        store.save("catalog", json!({"a": 1})).unwrap();

        let err = store.save("catalog", json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, VaultError::Validation { .. }));
        assert_eq!(store.load("catalog").unwrap().body["a"], 1);
        assert_eq!(store.reload("catalog").unwrap().body["a"], 1);
    }

    #[test]
    fn history_copies_are_rate_limited_and_pruned() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 0);
        let spec = store.spec("catalog").unwrap().clone();

        for i in 0..6 {
            store.save("catalog", json!({"v": i})).unwrap();
        }
        // First save had nothing on disk to copy; cap is 3
        assert_eq!(store.history_files(&spec).unwrap().len(), 3);

        let throttled = tempdir().unwrap();
        let store = store_in(throttled.path(), 3600);
        for i in 0..4 {
            store.save("catalog", json!({"v": i})).unwrap();
        }
        assert_eq!(store.history_files(&spec).unwrap().len(), 1);
    }

    #[test]
    fn recover_document_reapplies_newest_history() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 0);
        store.save("catalog", json!({"v": 1})).unwrap();
        store.save("catalog", json!({"v": 2})).unwrap();

        // Corrupt the live file behind the store's back
        fs::write(dir.path().join("data").join("shop.json"), b"garbage").unwrap();
        store.cache().remove("catalog").unwrap();

        let recovered = store.recover_document("catalog").unwrap().expect("history exists");
        assert_eq!(recovered.body["v"], 1);
        assert_eq!(store.reload("catalog").unwrap().body["v"], 1);
    }

    #[test]
    fn failed_write_keeps_cached_value() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        store.save("catalog", json!({"v": 1})).unwrap();

        // A directory squatting on the live path makes the rename fail
        let live = dir.path().join("data").join("shop.json");
        fs::remove_file(&live).unwrap();
        fs::create_dir(&live).unwrap();

        let err = store.save("catalog", json!({"v": 2})).unwrap_err();
        assert!(matches!(err, VaultError::WriteFailure { recovered: false, .. }));
        assert_eq!(store.cache().get("catalog").unwrap().unwrap()["v"], 1);
        assert_eq!(store.load("catalog").unwrap().body["v"], 1);
        assert!(live.is_dir());
    }

    #[test]
    fn failed_write_heals_corrupt_live_file_from_history() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 0);
        let spec = store.spec("catalog").unwrap().clone();
        store.save("catalog", json!({"v": 1})).unwrap();
        store.save("catalog", json!({"v": 2})).unwrap();

        let live = store.document_path(&spec);
        fs::write(&live, b"{ torn").unwrap();
        assert!(store.heal_after_failed_write(&spec, &live));
        let healed: Value = serde_json::from_slice(&fs::read(&live).unwrap()).unwrap();
        assert_eq!(healed["v"], 1);

        // An intact live file is left alone
        assert!(!store.heal_after_failed_write(&spec, &live));
    }

    #[test]
    fn discard_removes_file_and_cache_entry() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        let doc = store.save("catalog", json!({"v": 1})).unwrap();

        store.discard("catalog").unwrap();
        assert!(!doc.path.exists());
        assert!(store.cache().get("catalog").unwrap().is_none());
        assert!(store.load("catalog").unwrap().is_empty());
        // Discarding an absent document is a no-op
        store.discard("catalog").unwrap();
    }

    #[test]
    fn stray_temp_file_is_ignored_and_swept() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        store.save("catalog", json!({"v": "before"})).unwrap();

        // Simulates a crash between writing the temp file and the rename
        let stray = dir.path().join("data").join(".shop.json.deadbeef.tmp");
        fs::write(&stray, br#"{"v": "after"}"#).unwrap();

        let reopened = store_in(dir.path(), 300);
        assert_eq!(reopened.load("catalog").unwrap().body["v"], "before");
        assert!(!stray.exists());
    }

    #[test]
    fn flush_all_resaves_cached_documents() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 300);
        store.save("accounts", json!({"u1": {"counter": 2}})).unwrap();
        store.save("catalog", json!({})).unwrap();
        assert_eq!(store.flush_all().unwrap(), 2);
    }
}
