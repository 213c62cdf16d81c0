//! Library root for the `vaultkeeper` crate
//! Crash-safe document storage with snapshots, mirroring and tiered restore

// Core error handling
pub mod errors;

// Configuration & CLI
pub mod cli;
pub mod config;
pub mod config_loader;

// Documents & atomic storage
pub mod document;
pub mod secure_file_ops;
pub mod store;

// Audit journal
pub mod audit;

// Backup & recovery
pub mod guard;
pub mod mirror;
pub mod recovery;
pub mod restore;
pub mod scheduler;
pub mod snapshot;

// Facade
pub mod vault;

pub use errors::{RemoteFailure, VaultError, VaultResult};
pub use config::VaultConfig;
pub use document::{Document, DocumentSchema, DocumentSpec};
pub use mirror::{DirectoryMirror, GitHubMirror, MirrorClient, RemoteSnapshot};
pub use recovery::{RecoveryPlan, RecoverySelection};
pub use restore::{RestoreReport, RestoreRequest, RestoreTier};
pub use snapshot::{SnapshotKind, SnapshotTrigger};
pub use vault::Vault;
