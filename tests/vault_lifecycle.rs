//! End-to-end behaviour of the vault facade: startup, recovery, status and shutdown

use serde_json::json;
use std::fs;
use tempfile::TempDir;
use vaultkeeper::audit::verify_journal;
use vaultkeeper::recovery::RecoverySelection;
use vaultkeeper::vault::StartupState;
use vaultkeeper::{SnapshotKind, Vault, VaultConfig, VaultError};

fn open(tmp: &TempDir) -> Vault {
    let mut config = VaultConfig::rooted_at(tmp.path());
    config.snapshots.auto_interval_secs = 0;
    Vault::open_with_mirror(config, None).expect("open vault")
}

#[tokio::test]
async fn empty_start_without_sources_seeds_documents() {
    let tmp = TempDir::new().expect("tmp dir");
    let vault = open(&tmp);

    let state = vault.ensure_data().await.expect("ensure data");
    let StartupState::Seeded(names) = state else {
        panic!("expected seeded start, got {state:?}");
    };
    assert_eq!(names, vec!["accounts", "catalog", "symbol-table"]);
    assert!(tmp.path().join("data").join("users.json").exists());

    // A second seed finds every file present
    assert!(vault.seed_empty().expect("seed again").is_empty());
}

#[tokio::test]
async fn empty_start_restores_latest_auto_snapshot() {
    let tmp = TempDir::new().expect("tmp dir");
    {
        let vault = open(&tmp);
        vault
            .save("catalog", json!({"Nitro Basic": 3300}))
            .expect("save catalog");
        vault
            .create_snapshot(SnapshotKind::Auto, None, None)
            .await
            .expect("auto snapshot");
    }
    fs::remove_file(tmp.path().join("data").join("shop.json")).expect("lose live file");

    let vault = open(&tmp);
    let state = vault.ensure_data().await.expect("ensure data");
    assert!(matches!(state, StartupState::Restored(_)), "{state:?}");
    assert_eq!(vault.load("catalog").expect("load").body["Nitro Basic"], 3300);
}

#[tokio::test]
async fn existing_data_is_left_alone() {
    let tmp = TempDir::new().expect("tmp dir");
    let vault = open(&tmp);
    vault.save("catalog", json!({"Gift": 10})).expect("save");

    assert!(matches!(
        vault.ensure_data().await.expect("ensure data"),
        StartupState::Existing
    ));
    assert!(vault.list_snapshots(SnapshotKind::Auto).expect("list").is_empty());
}

#[tokio::test]
async fn status_reports_counts_and_documents() {
    let tmp = TempDir::new().expect("tmp dir");
    let vault = open(&tmp);
    vault
        .save("accounts", json!({"u1": {"cartridge": 4}, "u2": {"cartridge": 1}}))
        .expect("save");
    vault
        .create_snapshot(SnapshotKind::Auto, None, None)
        .await
        .expect("auto");
    vault
        .create_snapshot(SnapshotKind::Manual, Some("before-event"), Some("ops"))
        .await
        .expect("manual");

    let status = vault.status().await.expect("status");
    assert!(!status.mirror_connected);
    assert!(!status.mirror.configured);
    assert_eq!(status.auto_count, 1);
    assert_eq!(status.manual_count, 1);
    assert_eq!(status.pre_restore_count, 0);
    assert_eq!(status.retention_caps.pre_restore, 10);
    assert_eq!(status.retention_caps.auto, 20);
    assert_eq!(status.retention_caps.manual, 50);
    assert!(status.last_snapshot_time.is_some());

    let accounts = status
        .documents
        .iter()
        .find(|d| d.name == "accounts")
        .expect("accounts summary");
    assert_eq!(accounts.entity_count, 2);
    assert_eq!(accounts.file, "users.json");
}

#[tokio::test]
async fn manual_snapshots_can_be_deleted_by_name() {
    let tmp = TempDir::new().expect("tmp dir");
    let vault = open(&tmp);
    vault.save("catalog", json!({"Gift": 10})).expect("save");
    vault
        .create_snapshot(SnapshotKind::Manual, Some("keep-me"), None)
        .await
        .expect("manual");

    let listed = vault.list_snapshots(SnapshotKind::Manual).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "keep-me");
    let metadata = listed[0].metadata.as_ref().expect("metadata");
    assert_eq!(metadata.success_count, 1);
    assert_eq!(metadata.total_documents, 3);

    vault
        .delete_snapshot(SnapshotKind::Manual, "keep-me")
        .expect("delete");
    assert!(vault.list_snapshots(SnapshotKind::Manual).expect("list").is_empty());
    assert!(matches!(
        vault.delete_snapshot(SnapshotKind::Manual, "keep-me"),
        Err(VaultError::NotFound { .. })
    ));
}

#[tokio::test]
async fn recovery_scan_and_apply_snapshots_the_result() {
    let tmp = TempDir::new().expect("tmp dir");
    let scan = TempDir::new().expect("scan dir");
    fs::create_dir_all(scan.path().join("old-host")).expect("mkdir");
    fs::write(
        scan.path().join("old-host").join("users.json"),
        br#"{"u1": {"cartridge": 12, "voiceTime": 30}}"#,
    )
    .expect("write users");
    fs::write(scan.path().join("old-host").join("shop.json"), b"not json").expect("write shop");

    let vault = open(&tmp);
    let plan = vault.scan_recovery(scan.path()).await.expect("scan");
    assert_eq!(plan.candidates.len(), 2);
    assert_eq!(plan.proposed.len(), 1);
    assert!(plan.proposed.contains_key("accounts"));

    let outcome = vault
        .apply_recovery(&plan, RecoverySelection::AcceptProposed)
        .await
        .expect("apply");
    assert_eq!(outcome.restored, vec!["accounts"]);
    assert!(outcome.push.is_none());
    let snapshot_id = outcome.snapshot_id.expect("recovery snapshot");

    assert_eq!(vault.load("accounts").expect("load").body["u1"]["cartridge"], 12);
    let copy = vault
        .snapshots()
        .read_document(SnapshotKind::Auto, &snapshot_id, "accounts")
        .expect("snapshot copy");
    assert_eq!(copy["u1"]["cartridge"], 12);
}

#[tokio::test]
async fn recovery_rejects_paths_outside_the_plan() {
    let tmp = TempDir::new().expect("tmp dir");
    let scan = TempDir::new().expect("scan dir");
    fs::write(scan.path().join("shop.json"), br#"{"Gift": 10}"#).expect("write shop");
    let stray = tmp.path().join("elsewhere.json");
    fs::write(&stray, br#"{"Gift": 99}"#).expect("write stray");

    let vault = open(&tmp);
    let plan = vault.scan_recovery(scan.path()).await.expect("scan");

    let selection = RecoverySelection::Paths([("catalog".to_string(), stray)].into_iter().collect());
    let err = vault
        .apply_recovery(&plan, selection)
        .await
        .expect_err("stray path");
    assert!(matches!(err, VaultError::Validation { .. }));
    assert!(vault.load("catalog").expect("load").is_empty());
}

#[tokio::test]
async fn shutdown_flushes_and_takes_final_snapshot() {
    let tmp = TempDir::new().expect("tmp dir");
    let vault = open(&tmp);
    vault.save("catalog", json!({"Gift": 10})).expect("save");
    vault.save("symbol-table", json!({"coin": "<:coin:1>"})).expect("save");

    let report = vault.shutdown().await.expect("shutdown");
    assert_eq!(report.flushed, 2);
    assert!(report.push.is_none());
    let id = report.snapshot_id.expect("final snapshot");
    assert_eq!(vault.snapshots().latest(SnapshotKind::Auto).expect("latest").expect("some").id, id);
}

#[tokio::test]
async fn journal_chain_stays_intact_across_operations() {
    let tmp = TempDir::new().expect("tmp dir");
    let vault = open(&tmp);
    vault.save("catalog", json!({"Gift": 10})).expect("save");
    vault
        .create_snapshot(SnapshotKind::Manual, Some("m1"), None)
        .await
        .expect("manual");
    let _ = vault.sync_to_mirror().await;
    vault.shutdown().await.expect("shutdown");

    let path = vault.journal().path().expect("journal enabled").to_path_buf();
    let verification = verify_journal(&path).expect("verify");
    assert!(verification.is_intact());
    assert!(verification.entries >= 3);
}
