//! GitHub-backed mirror
//!
//! Pushes go through the `git` binary (shallow clone of the backup branch,
//! copy, commit, force-push). Listing and downloads use the REST contents
//! API so a pull never needs a working copy.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tokio::process::Command;

use super::{sort_newest_first, MirrorClient, RemoteSnapshot};
use crate::config::MirrorConfig;
use crate::errors::{RemoteFailure, VaultError, VaultResult};
use crate::secure_file_ops::{copy_dir_files, validate_name};

const REDACTED: &str = "***";

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct FilePayload {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
    #[serde(default)]
    download_url: Option<String>,
}

pub struct GitHubMirror {
    http: reqwest::Client,
    repo: String,
    token: String,
    branch: String,
    remote_dir: String,
    api_base: String,
    git_host: String,
    max_remote_snapshots: usize,
    author_name: String,
    author_email: String,
}

impl GitHubMirror {
    pub fn from_config(config: &MirrorConfig) -> VaultResult<Self> {
        let (Some(repo), Some(token)) = (config.repo.as_deref(), config.token.as_deref()) else {
            return Err(VaultError::remote(RemoteFailure::NotConfigured));
        };
        if repo.trim().is_empty() || token.trim().is_empty() {
            return Err(VaultError::remote(RemoteFailure::NotConfigured));
        }
        if repo.split('/').count() != 2 {
            return Err(VaultError::config(format!("mirror.repo '{repo}' must be owner/name")));
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| VaultError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            repo: repo.trim().to_string(),
            token: token.trim().to_string(),
            branch: config.branch.clone(),
            remote_dir: config.remote_dir.trim_matches('/').to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            git_host: config.git_host.clone(),
            max_remote_snapshots: config.max_remote_snapshots,
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        })
    }

    /// Strip the token from text that may end up in logs or errors
    fn redact(&self, text: &str) -> String {
        redact_token(text, &self.token)
    }

    fn api_url(&self, path: &str) -> String {
        if path.is_empty() {
            format!("{}/repos/{}", self.api_base, self.repo)
        } else {
            format!("{}/repos/{}/{}", self.api_base, self.repo, path)
        }
    }

    fn remote_url(&self) -> String {
        format!("https://x-access-token:{}@{}/{}.git", self.token, self.git_host, self.repo)
    }

    async fn get(&self, url: &str) -> VaultResult<reqwest::Response> {
        self.http
            .get(url)
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, "vaultkeeper")
            .send()
            .await
            .map_err(|e| VaultError::remote(RemoteFailure::Unreachable(self.redact(&e.to_string()))))
    }

    /// GET that treats 404 as `None` and other failures as remote errors
    async fn get_optional(&self, url: &str) -> VaultResult<Option<reqwest::Response>> {
        let response = self.get(url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if let Some(failure) = classify_status(response.status(), response.headers()) {
            return Err(VaultError::remote(failure));
        }
        Ok(Some(response))
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> VaultResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VaultError::remote(RemoteFailure::Command(format!("git unavailable: {e}"))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VaultError::remote(RemoteFailure::Command(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                self.redact(stderr.trim())
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Working copy of the backup branch, or a fresh repository when the
    /// branch does not exist on the remote yet
    async fn prepare_worktree(&self, parent: &Path) -> VaultResult<std::path::PathBuf> {
        let url = self.remote_url();
        let heads = self.git(parent, &["ls-remote", "--heads", &url, &self.branch]).await?;
        let worktree = parent.join("mirror");

        if heads.trim().is_empty() {
            tracing::info!(branch = %self.branch, "backup branch missing on remote, creating it");
            fs::create_dir_all(&worktree).map_err(|e| VaultError::io("creating mirror worktree", e))?;
            self.git(&worktree, &["init", "--quiet"]).await?;
            self.git(&worktree, &["remote", "add", "origin", &url]).await?;
        } else {
            let target = worktree.to_string_lossy().to_string();
            self.git(
                parent,
                &["clone", "--quiet", "--depth", "1", "--branch", &self.branch, &url, &target],
            )
            .await?;
        }
        Ok(worktree)
    }
}

pub(crate) fn redact_token(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }
    text.replace(token, REDACTED)
}

/// Map a GitHub API status to a remote failure kind; `None` for success
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<RemoteFailure> {
    if status.is_success() {
        return None;
    }
    let rate_exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);

    Some(match status {
        StatusCode::UNAUTHORIZED => RemoteFailure::AuthFailed,
        StatusCode::TOO_MANY_REQUESTS => RemoteFailure::RateLimited,
        StatusCode::FORBIDDEN if rate_exhausted => RemoteFailure::RateLimited,
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => RemoteFailure::RemoteNotFound,
        other => RemoteFailure::Unreachable(format!("HTTP {other}")),
    })
}

/// Decode a contents-API base64 payload (GitHub wraps it at 60 columns)
pub(crate) fn decode_content(content: &str) -> VaultResult<Vec<u8>> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| VaultError::remote(RemoteFailure::Unreachable(format!("invalid base64 payload: {e}"))))
}

fn prune_remote_dirs(namespace: &Path, keep: usize) -> VaultResult<usize> {
    let mut snapshots: Vec<RemoteSnapshot> = match fs::read_dir(namespace) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| RemoteSnapshot::new(e.file_name().to_string_lossy().to_string()))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(VaultError::io("listing mirror worktree", e)),
    };
    sort_newest_first(&mut snapshots);

    let mut removed = 0;
    for stale in snapshots.iter().skip(keep) {
        fs::remove_dir_all(namespace.join(&stale.id))
            .map_err(|e| VaultError::io("pruning mirror worktree", e))?;
        removed += 1;
    }
    Ok(removed)
}

#[async_trait]
impl MirrorClient for GitHubMirror {
    fn name(&self) -> &str {
        "github"
    }

    async fn check_access(&self) -> VaultResult<()> {
        let response = self.get(&self.api_url("")).await?;
        match classify_status(response.status(), response.headers()) {
            None => Ok(()),
            Some(failure) => Err(VaultError::remote(failure)),
        }
    }

    async fn push(&self, snapshot_id: &str, snapshot_dir: &Path) -> VaultResult<()> {
        validate_name("snapshot_id", snapshot_id)?;
        let scratch = tempfile::tempdir().map_err(|e| VaultError::io("creating mirror scratch dir", e))?;
        let worktree = self.prepare_worktree(scratch.path()).await?;

        let namespace = worktree.join(&self.remote_dir);
        let target = namespace.join(snapshot_id);
        if target.exists() {
            fs::remove_dir_all(&target).map_err(|e| VaultError::io("replacing mirrored snapshot", e))?;
        }
        copy_dir_files(snapshot_dir, &target)?;
        let pruned = prune_remote_dirs(&namespace, self.max_remote_snapshots)?;

        self.git(&worktree, &["add", "--all", "--", &self.remote_dir]).await?;
        let status = self.git(&worktree, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            tracing::info!(snapshot = %snapshot_id, "mirror already up to date");
            return Ok(());
        }

        let message = format!("Backup: {} - {}", snapshot_id, Utc::now().to_rfc3339());
        let name_cfg = format!("user.name={}", self.author_name);
        let email_cfg = format!("user.email={}", self.author_email);
        self.git(
            &worktree,
            &["-c", &name_cfg, "-c", &email_cfg, "commit", "--quiet", "-m", &message],
        )
        .await?;

        let refspec = format!("HEAD:{}", self.branch);
        self.git(&worktree, &["push", "--force", "--quiet", "origin", &refspec]).await?;
        tracing::info!(snapshot = %snapshot_id, branch = %self.branch, pruned, "snapshot pushed to mirror");
        Ok(())
    }

    async fn list_snapshots(&self) -> VaultResult<Vec<RemoteSnapshot>> {
        let url = self.api_url(&format!("contents/{}?ref={}", self.remote_dir, self.branch));
        let Some(response) = self.get_optional(&url).await? else {
            return Ok(Vec::new());
        };
        let entries: Vec<ContentEntry> = response.json().await.map_err(|e| {
            VaultError::remote(RemoteFailure::Unreachable(format!("unexpected listing: {e}")))
        })?;

        let mut snapshots: Vec<RemoteSnapshot> = entries
            .into_iter()
            .filter(|e| e.kind == "dir")
            .map(|e| RemoteSnapshot::new(e.name))
            .collect();
        sort_newest_first(&mut snapshots);
        Ok(snapshots)
    }

    async fn fetch_file(&self, snapshot_id: &str, file: &str) -> VaultResult<Option<Vec<u8>>> {
        validate_name("snapshot_id", snapshot_id)?;
        validate_name("file", file)?;
        let url = self.api_url(&format!(
            "contents/{}/{}/{}?ref={}",
            self.remote_dir, snapshot_id, file, self.branch
        ));
        let Some(response) = self.get_optional(&url).await? else {
            return Ok(None);
        };
        let payload: FilePayload = response.json().await.map_err(|e| {
            VaultError::remote(RemoteFailure::Unreachable(format!("unexpected file payload: {e}")))
        })?;

        if payload.encoding == "base64" && !payload.content.is_empty() {
            return decode_content(&payload.content).map(Some);
        }

        // Files over the contents API size limit come back without inline content
        let Some(download) = payload.download_url else {
            return Ok(None);
        };
        let Some(raw) = self.get_optional(&download).await? else {
            return Ok(None);
        };
        let bytes = raw
            .bytes()
            .await
            .map_err(|e| VaultError::remote(RemoteFailure::Unreachable(self.redact(&e.to_string()))))?;
        Ok(Some(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn configured() -> MirrorConfig {
        MirrorConfig {
            enabled: true,
            repo: Some("owner/bot-data".into()),
            token: Some("ghp_secret123".into()),
            ..MirrorConfig::default()
        }
    }

    #[test]
    fn status_classification() {
        let empty = HeaderMap::new();
        assert_eq!(classify_status(StatusCode::OK, &empty), None);
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, &empty),
            Some(RemoteFailure::AuthFailed)
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, &empty),
            Some(RemoteFailure::RemoteNotFound)
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &empty),
            Some(RemoteFailure::RateLimited)
        );

        let mut limited = HeaderMap::new();
        limited.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &limited),
            Some(RemoteFailure::RateLimited)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &empty),
            Some(RemoteFailure::RemoteNotFound)
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &empty),
            Some(RemoteFailure::Unreachable(_))
        ));
    }

    #[test]
    fn token_never_leaks_into_messages() {
        let mirror = GitHubMirror::from_config(&configured()).unwrap();
        let leaked = format!("fatal: unable to access '{}'", mirror.remote_url());
        let cleaned = mirror.redact(&leaked);
        assert!(!cleaned.contains("ghp_secret123"));
        assert!(cleaned.contains(REDACTED));
    }

    #[test]
    fn wrapped_base64_payload_decodes() {
        let payload = "eyJ1MSI6\neyJjb3VudGVyIjo1fX0=\n";
        assert_eq!(decode_content(payload).unwrap(), br#"{"u1":{"counter":5}}"#);
    }

    #[test]
    fn missing_credentials_are_not_configured() {
        let mut config = configured();
        config.token = None;
        assert!(matches!(
            GitHubMirror::from_config(&config),
            Err(VaultError::RemoteUnavailable(RemoteFailure::NotConfigured))
        ));

        let mut config = configured();
        config.repo = Some("no-slash".into());
        assert!(matches!(GitHubMirror::from_config(&config), Err(VaultError::Config { .. })));
    }

    #[test]
    fn urls_follow_repo_layout() {
        let mirror = GitHubMirror::from_config(&configured()).unwrap();
        assert_eq!(mirror.api_url(""), "https://api.github.com/repos/owner/bot-data");
        assert_eq!(
            mirror.api_url("contents/data-backup?ref=data-backup"),
            "https://api.github.com/repos/owner/bot-data/contents/data-backup?ref=data-backup"
        );
    }

    #[test]
    fn worktree_pruning_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for id in [
            "auto-20260101T000000000Z-00000001",
            "auto-20260102T000000000Z-00000002",
            "auto-20260103T000000000Z-00000003",
        ] {
            fs::create_dir_all(dir.path().join(id)).unwrap();
        }
        assert_eq!(prune_remote_dirs(dir.path(), 2).unwrap(), 1);
        assert!(!dir.path().join("auto-20260101T000000000Z-00000001").exists());
    }
}
