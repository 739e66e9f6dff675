//! Scheduled housekeeping: the nightly memory cycle (L1 retention, L3
//! preference dataset for the external fine-tuner), corpus intake from
//! the watched directory, and the vision idle unload.

use std::sync::Arc;
use std::time::Duration;

use crate::core_state::CoreState;
use crate::memory;
use crate::pipeline::rag::quarantine;

const TICK: Duration = Duration::from_secs(300);

/// Spawn the background maintenance loop. One shared tick keeps the
/// scheduling trivial; each job decides internally whether it has work.
pub fn spawn(core: Arc<CoreState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK);
        interval.tick().await; // consume the immediate tick
        loop {
            interval.tick().await;
            run_once(&core).await;
        }
    })
}

/// One maintenance pass. Failures are logged, never fatal.
pub async fn run_once(core: &Arc<CoreState>) {
    core.orchestrator.unload_idle_vision().await;

    match core.db.open() {
        Ok(conn) => {
            match memory::prune_l1(&conn, core.config.l1_retention_days) {
                Ok(0) => {}
                Ok(n) => tracing::info!(pruned = n, "L1 episodes past retention removed"),
                Err(e) => tracing::warn!(error = %e, "L1 prune failed"),
            }

            match memory::export_preference_dataset(&conn) {
                Ok(jsonl) if !jsonl.is_empty() => {
                    let dir = core.config.data_dir.join("preference");
                    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
                    let path = dir.join(format!("pairs_{stamp}.jsonl"));
                    if let Err(e) = std::fs::create_dir_all(&dir)
                        .and_then(|_| std::fs::write(&path, jsonl))
                    {
                        tracing::warn!(error = %e, "Preference dataset write failed");
                    } else {
                        tracing::info!(path = %path.display(), "Preference dataset exported");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Preference export failed"),
            }
        }
        Err(e) => tracing::warn!(error = %e, "Maintenance could not open database"),
    }

    match quarantine::intake_watched_dir(
        &core.law_index,
        &core.config.watched_dir(),
        &core.config.quarantine_dir(),
        "watcher",
    )
    .await
    {
        Ok(ids) if !ids.is_empty() => {
            tracing::info!(chunks = ids.len(), "Corpus drops quarantined");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Watched-directory intake failed"),
    }
}
