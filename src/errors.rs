//! Error handling for the vaultkeeper persistence engine
//!
//! One error enum covers every failure the store, snapshot manager, mirror
//! sync, restore orchestrator and recovery scanner can report. Remote
//! failures carry a [`RemoteFailure`] kind so the restore orchestrator can
//! turn them into "try the next tier" signals.

use std::time::Duration;
use thiserror::Error;

/// Why the external mirror could not be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailure {
    NotConfigured,
    AuthFailed,
    RemoteNotFound,
    RateLimited,
    Unreachable(String),
    Command(String),
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteFailure::NotConfigured => write!(f, "mirror not configured"),
            RemoteFailure::AuthFailed => write!(f, "mirror authentication failed"),
            RemoteFailure::RemoteNotFound => write!(f, "mirror repository not found or access denied"),
            RemoteFailure::RateLimited => write!(f, "mirror API rate limit exceeded"),
            RemoteFailure::Unreachable(detail) => write!(f, "mirror unreachable: {detail}"),
            RemoteFailure::Command(detail) => write!(f, "mirror command failed: {detail}"),
        }
    }
}

/// Main error type for vaultkeeper
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Write failed for {document}: {message} (recovered from history: {recovered})")]
    WriteFailure {
        document: String,
        message: String,
        recovered: bool,
    },

    #[error("Resource not found: {resource} - {id}")]
    NotFound { resource: String, id: String },

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(RemoteFailure),

    #[error("Operation timed out: {operation} after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Operation already in progress: {operation}")]
    Busy { operation: String },

    #[error("Automatic snapshot not due for another {remaining:?}")]
    Throttled { remaining: Duration },

    #[error("All restore tiers failed: {}", attempts.join("; "))]
    RestoreExhausted { attempts: Vec<String> },

    #[error(
        "Restore from {source_id} stopped at {document}: {message} (rolled back: [{}], still holding restored data: [{}])",
        rolled_back.join(", "),
        left_applied.join(", ")
    )]
    RestoreAborted {
        source_id: String,
        document: String,
        message: String,
        rolled_back: Vec<String>,
        left_applied: Vec<String>,
    },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Result with VaultError
pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a write failure
    pub fn write_failure(
        document: impl Into<String>,
        message: impl Into<String>,
        recovered: bool,
    ) -> Self {
        Self::WriteFailure {
            document: document.into(),
            message: message.into(),
            recovered,
        }
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn remote(failure: RemoteFailure) -> Self {
        Self::RemoteUnavailable(failure)
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn busy(operation: impl Into<String>) -> Self {
        Self::Busy {
            operation: operation.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Local filesystem failures are structural and must not be retried
    pub fn is_structural(&self) -> bool {
        matches!(self, VaultError::Io { .. } | VaultError::MutexPoisoned { .. })
    }

    /// Short machine-friendly label used in journal entries
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::Config { .. } => "config",
            VaultError::Validation { .. } => "validation",
            VaultError::WriteFailure { .. } => "write_failure",
            VaultError::NotFound { .. } => "not_found",
            VaultError::RemoteUnavailable(_) => "remote_unavailable",
            VaultError::Timeout { .. } => "timeout",
            VaultError::Busy { .. } => "busy",
            VaultError::Throttled { .. } => "throttled",
            VaultError::RestoreExhausted { .. } => "restore_exhausted",
            VaultError::RestoreAborted { .. } => "restore_aborted",
            VaultError::Io { .. } => "io",
            VaultError::Serialization { .. } => "serialization",
            VaultError::MutexPoisoned { .. } => "mutex_poisoned",
            VaultError::Internal { .. } => "internal",
        }
    }
}

/// Helper trait for safe mutex operations
///
/// Lock poisoning becomes a `VaultError` instead of a panic.
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> VaultResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> VaultResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| VaultError::MutexPoisoned {
            resource: "generic_mutex".to_string(),
        })
    }
}

/// Helper trait for safe RwLock read operations
pub trait SafeReadLock<T: ?Sized> {
    fn safe_read(&self) -> VaultResult<std::sync::RwLockReadGuard<'_, T>>;
}

impl<T: ?Sized> SafeReadLock<T> for std::sync::RwLock<T> {
    fn safe_read(&self) -> VaultResult<std::sync::RwLockReadGuard<'_, T>> {
        self.read().map_err(|_| VaultError::MutexPoisoned {
            resource: "rwlock_read".to_string(),
        })
    }
}

/// Helper trait for safe RwLock write operations
pub trait SafeWriteLock<T: ?Sized> {
    fn safe_write(&self) -> VaultResult<std::sync::RwLockWriteGuard<'_, T>>;
}

impl<T: ?Sized> SafeWriteLock<T> for std::sync::RwLock<T> {
    fn safe_write(&self) -> VaultResult<std::sync::RwLockWriteGuard<'_, T>> {
        self.write().map_err(|_| VaultError::MutexPoisoned {
            resource: "rwlock_write".to_string(),
        })
    }
}

/// Convert from serde_json errors
impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::serialization("json_operation", err)
    }
}

/// Convert from std::io errors
impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::io("io_operation", err)
    }
}

impl From<figment::Error> for VaultError {
    fn from(err: figment::Error) -> Self {
        VaultError::config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        VaultError::internal(format!("background task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let config_err = VaultError::config("Missing data directory");
        assert!(config_err.to_string().contains("Configuration error"));

        let remote = VaultError::remote(RemoteFailure::RateLimited);
        assert!(remote.to_string().contains("rate limit"));
        assert_eq!(remote.kind(), "remote_unavailable");
    }

    #[test]
    fn test_error_chaining() {
        use std::error::Error;

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let vault_err = VaultError::io("writing snapshot", io_err);

        assert!(vault_err.source().is_some());
        assert!(vault_err.is_structural());
        assert!(vault_err.to_string().contains("I/O operation failed"));
    }

    #[test]
    fn test_exhausted_lists_every_tier() {
        let err = VaultError::RestoreExhausted {
            attempts: vec!["external: mirror not configured".into(), "local-auto: none".into()],
        };
        let text = err.to_string();
        assert!(text.contains("external"));
        assert!(text.contains("local-auto"));
    }

    #[test]
    fn test_poisoned_mutex_maps_to_error() {
        use std::sync::{Arc, Mutex};

        let shared = Arc::new(Mutex::new(0));
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(matches!(
            shared.safe_lock(),
            Err(VaultError::MutexPoisoned { .. })
        ));
    }
}
