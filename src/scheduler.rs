//! Background backup loop
//!
//! One tokio task ticks at a fixed period; each tick creates an automatic
//! snapshot when due and pushes it to the mirror. Tick failures are logged
//! and the loop keeps running until it is stopped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::vault::Vault;

pub struct BackupScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl BackupScheduler {
    /// Spawn the loop on the current runtime. The first tick fires
    /// immediately; the vault's rate limit decides whether it snapshots.
    pub fn start(vault: Arc<Vault>, period: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut completed = 0u64;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match vault.scheduled_backup().await {
                            Ok(Some(run)) => {
                                completed += 1;
                                let pushed = run.push.as_ref().map(|p| p.success);
                                tracing::info!(snapshot = %run.snapshot.id(), ?pushed, "scheduled backup complete");
                            }
                            Ok(None) => {}
                            Err(e) => tracing::error!(error = %e, "scheduled backup failed"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!(completed, "backup scheduler stopped");
            completed
        });

        Self { shutdown, handle }
    }

    /// Stop the loop and wait for an in-flight tick to finish.
    /// Returns how many snapshots the loop created.
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.handle.await {
            Ok(completed) => completed,
            Err(e) => {
                tracing::error!(error = %e, "backup scheduler task failed");
                0
            }
        }
    }
}
