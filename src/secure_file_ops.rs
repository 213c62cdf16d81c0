//! File operations with integrity verification
//!
//! Atomic replace-by-rename, name validation for operator-supplied
//! identifiers, SHA-256 digests for snapshot metadata, and sweeping of
//! temp/staging leftovers from interrupted runs.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::{VaultError, VaultResult};

const TEMP_SUFFIX: &str = ".tmp";

/// Write `data` to `path` so readers only ever see the old or the new file.
///
/// The bytes go to a temp file beside the target (same filesystem), are
/// fsynced, read back and compared, and only then renamed over the target.
/// The temp file is removed on every failure path.
pub fn atomic_write(path: &Path, data: &[u8]) -> VaultResult<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent).map_err(|e| VaultError::io("creating directory", e))?;

    let temp_path = temp_path_for(path)?;
    let result = write_verified(&temp_path, data).and_then(|_| {
        fs::rename(&temp_path, path).map_err(|e| VaultError::io("renaming temp file into place", e))
    });

    match result {
        Ok(()) => {
            sync_dir(parent);
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

fn write_verified(temp_path: &Path, data: &[u8]) -> VaultResult<()> {
    let mut file = File::create(temp_path).map_err(|e| VaultError::io("creating temp file", e))?;
    file.write_all(data).map_err(|e| VaultError::io("writing temp file", e))?;
    file.sync_all().map_err(|e| VaultError::io("syncing temp file", e))?;
    drop(file);

    let written = fs::read(temp_path).map_err(|e| VaultError::io("reading back temp file", e))?;
    if written != data {
        return Err(VaultError::write_failure(
            temp_path.display().to_string(),
            format!(
                "integrity check failed: read back {} bytes, expected {}",
                written.len(),
                data.len()
            ),
            false,
        ));
    }
    Ok(())
}

fn parent_dir(path: &Path) -> VaultResult<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| VaultError::validation("path", format!("{} has no parent directory", path.display())))
}

fn temp_path_for(path: &Path) -> VaultResult<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| VaultError::validation("path", format!("invalid file path: {}", path.display())))?;
    Ok(path.with_file_name(format!(
        ".{}.{}{}",
        file_name,
        Uuid::new_v4().simple(),
        TEMP_SUFFIX
    )))
}

/// Best-effort directory fsync so the rename itself is durable
pub fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Whether a directory entry name is a temp or staging leftover
pub fn is_transient_name(name: &str) -> bool {
    name.starts_with('.') && (name.ends_with(TEMP_SUFFIX) || name.ends_with(".staging"))
}

/// Remove temp files and staging directories left by an interrupted run.
/// Returns how many entries were removed.
pub fn sweep_transient(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_transient_name(&name) {
            continue;
        }
        let path = entry.path();
        let outcome = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match outcome {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to sweep leftover"),
        }
    }
    removed
}

/// Validate an operator-supplied identifier used as a directory name
pub fn validate_name(field: &str, name: &str) -> VaultResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(VaultError::validation(field, "must be 1 to 64 characters"));
    }
    if name.starts_with('.') || name.contains("..") {
        return Err(VaultError::validation(field, "path traversal attempt detected"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(VaultError::validation(
            field,
            "only ASCII letters, digits, '-', '_' and '.' are allowed",
        ));
    }
    Ok(())
}

/// SHA-256 of a byte slice, lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Calculate SHA-256 hash of a file
pub fn file_sha256(path: &Path) -> VaultResult<String> {
    let data = fs::read(path).map_err(|e| VaultError::io("reading file for hash", e))?;
    Ok(sha256_hex(&data))
}

/// Copy every regular file of `src` into `dst` (non-recursive)
pub fn copy_dir_files(src: &Path, dst: &Path) -> VaultResult<usize> {
    fs::create_dir_all(dst).map_err(|e| VaultError::io("creating directory", e))?;
    let mut copied = 0;
    for entry in fs::read_dir(src).map_err(|e| VaultError::io("reading directory", e))? {
        let entry = entry.map_err(|e| VaultError::io("reading directory entry", e))?;
        let path = entry.path();
        if path.is_file() {
            fs::copy(&path, dst.join(entry.file_name())).map_err(|e| VaultError::io("copying file", e))?;
            copied += 1;
        }
    }
    Ok(copied)
}
