// Operations journal: audit.rs
// Every backup/recovery outcome becomes an AuditEvent. Events go to tracing
// and, when a journal path is configured, to a hash-linked JSONL file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::errors::{SafeLock, VaultError, VaultResult};

/// Severity levels for structured log classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One backup/recovery outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub target: String,
    pub success: bool,
    pub detail: Option<String>,
    pub severity: LogLevel,
}

impl AuditEvent {
    pub fn new(operation: &str, target: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            target: target.to_string(),
            success: true,
            detail: None,
            severity: LogLevel::Info,
        }
    }

    pub fn succeeded(operation: &str, target: &str) -> Self {
        Self::new(operation, target)
    }

    /// Failed outcome; severity defaults to `Warn`
    pub fn failed(operation: &str, target: &str, error: &VaultError) -> Self {
        Self::new(operation, target)
            .with_success(false)
            .with_severity(LogLevel::Warn)
            .with_detail(format!("{}: {}", error.kind(), error))
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Sets log severity
    pub fn with_severity(mut self, level: LogLevel) -> Self {
        self.severity = level;
        self
    }

    /// Adds optional detail string
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn trace(&self) {
        let detail = self.detail.as_deref().unwrap_or("");
        match self.severity {
            LogLevel::Debug => tracing::debug!(operation = %self.operation, target = %self.target, success = self.success, detail, "vault operation"),
            LogLevel::Info => tracing::info!(operation = %self.operation, target = %self.target, success = self.success, detail, "vault operation"),
            LogLevel::Warn => tracing::warn!(operation = %self.operation, target = %self.target, success = self.success, detail, "vault operation"),
            LogLevel::Error => tracing::error!(operation = %self.operation, target = %self.target, success = self.success, detail, "vault operation"),
        }
    }
}

/// A structured, hash-linked line of the operations journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalLine {
    event: AuditEvent,
    hash: String,
    prev_hash: Option<String>,
}

fn chain_hash(prev_hash: Option<&str>, payload: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Sink for audit events
///
/// Journal write failures are logged and swallowed; recording an outcome
/// must never turn it into a different outcome.
#[derive(Debug)]
pub struct Journal {
    path: Option<PathBuf>,
    last_hash: Mutex<Option<String>>,
}

impl Journal {
    /// Journal that only emits tracing events
    pub fn disabled() -> Self {
        Self {
            path: None,
            last_hash: Mutex::new(None),
        }
    }

    pub fn open(path: Option<PathBuf>) -> Self {
        let last_hash = path.as_deref().and_then(read_last_hash);
        Self {
            path,
            last_hash: Mutex::new(last_hash),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, event: AuditEvent) {
        event.trace();

        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = self.append(path, event) {
            tracing::error!(error = %e, journal = %path.display(), "journal write failed");
        }
    }

    fn append(&self, path: &Path, event: AuditEvent) -> VaultResult<()> {
        let mut last = self.last_hash.safe_lock()?;
        let payload = serde_json::to_string(&event)?;
        let hash = chain_hash(last.as_deref(), &payload);

        let line = JournalLine {
            event,
            hash: hash.clone(),
            prev_hash: last.clone(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VaultError::io("creating journal directory", e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| VaultError::io("opening journal", e))?;
        writeln!(file, "{}", serde_json::to_string(&line)?)
            .map_err(|e| VaultError::io("appending journal", e))?;

        *last = Some(hash);
        Ok(())
    }
}

/// Retrieve the last hash from the journal for chaining purposes.
fn read_last_hash(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let reader = BufReader::new(file);
    let last_line = reader.lines().map_while(Result::ok).filter(|l| !l.trim().is_empty()).last()?;
    serde_json::from_str::<JournalLine>(&last_line).ok().map(|l| l.hash)
}

/// Result of walking the journal's hash chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalVerification {
    pub entries: usize,
    /// 1-based line number of the first broken link
    pub first_broken_line: Option<usize>,
}

impl JournalVerification {
    pub fn is_intact(&self) -> bool {
        self.first_broken_line.is_none()
    }
}

pub fn verify_journal(path: &Path) -> VaultResult<JournalVerification> {
    let file = File::open(path).map_err(|e| VaultError::io("opening journal", e))?;
    let reader = BufReader::new(file);

    let mut prev: Option<String> = None;
    let mut entries = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| VaultError::io("reading journal", e))?;
        if line.trim().is_empty() {
            continue;
        }
        entries += 1;

        let broken = match serde_json::from_str::<JournalLine>(&line) {
            Ok(parsed) => {
                let payload = serde_json::to_string(&parsed.event)?;
                let expected = chain_hash(prev.as_deref(), &payload);
                let ok = parsed.prev_hash == prev && parsed.hash == expected;
                prev = Some(parsed.hash);
                !ok
            }
            Err(_) => true,
        };
        if broken {
            return Ok(JournalVerification {
                entries,
                first_broken_line: Some(index + 1),
            });
        }
    }

    Ok(JournalVerification {
        entries,
        first_broken_line: None,
    })
}
