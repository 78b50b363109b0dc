//! Long-running daemon loop.
//!
//! Arms timers for stored schedules, then keeps the registry in step with the catalog
//! file and sweeps finished optimization sessions until told to shut down.

use super::scheduler::Scheduler;
use crate::config::EngineConfig;
use crate::optimizer::OptimizationEngine;
use crate::storage::{JsonStore, Storage};
use anyhow::Result;
use std::future::Future;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Re-read the catalog and bring the timer registry in line with it.
async fn refresh(store: &JsonStore, scheduler: &Scheduler) -> Result<()> {
    store.reload().await?;
    let schedules = store.list_schedules(false).await?;
    let report = scheduler.sync(&schedules);
    if !report.added.is_empty() || !report.removed.is_empty() {
        info!(
            added = ?report.added,
            removed = ?report.removed,
            "schedules changed on disk"
        );
    }
    Ok(())
}

/// Run until `shutdown` resolves. Timers are cancelled on exit; runs already in
/// flight are not awaited.
pub async fn run_daemon(
    store: &JsonStore,
    scheduler: &Scheduler,
    optimizer: &OptimizationEngine,
    cfg: &EngineConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let schedules = store.list_schedules(true).await?;
    scheduler.reconcile(&schedules);
    if let Err(e) = optimizer.sweep().await {
        warn!(error = %e, "initial session sweep failed");
    }

    let start = Instant::now();
    let mut refresh_tick = interval_at(start + cfg.refresh_interval, cfg.refresh_interval);
    refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep_tick = interval_at(start + cfg.sweep_interval, cfg.sweep_interval);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(shutdown);
    info!(schedules = ?scheduler.scheduled_ids(), "daemon running");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = refresh_tick.tick() => {
                if let Err(e) = refresh(store, scheduler).await {
                    warn!(error = %format!("{e:#}"), "schedule refresh failed");
                }
            }
            _ = sweep_tick.tick() => {
                match optimizer.sweep().await {
                    Ok(n) => debug!(removed = n, "session sweep"),
                    Err(e) => warn!(error = %e, "session sweep failed"),
                }
            }
        }
    }

    scheduler.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{system, ScriptedLlm};
    use crate::engine::RunExecutor;
    use crate::notify::LogNotifier;
    use crate::orchestrator::job::ScheduleRunner;
    use crate::orchestrator::post_process::tests::schedule;
    use crate::session_store::MemorySessionStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn daemon_fires_schedules_and_picks_up_new_ones() {
        let dir = std::env::temp_dir().join(format!("prompt-regress-daemon-{}", crate::model::new_id()));
        let store = Arc::new(JsonStore::open(&dir).unwrap());
        store.save_prompt_system(&system("{q}")).await.unwrap();
        store.save_schedule(&schedule(0.2, false)).await.unwrap();

        let llm = Arc::new(ScriptedLlm::new());
        let executor = RunExecutor::new(llm.clone());
        let runner = Arc::new(ScheduleRunner::new(
            store.clone(),
            executor.clone(),
            Arc::new(LogNotifier),
        ));
        let scheduler = Scheduler::new(runner);
        let optimizer = OptimizationEngine::new(
            store.clone(),
            Arc::new(MemorySessionStore::new()),
            executor,
            EngineConfig::default(),
        );
        let cfg = EngineConfig {
            refresh_interval: Duration::from_secs(30),
            ..EngineConfig::default()
        };

        // a second process adds a schedule while the daemon runs
        let writer = JsonStore::open(&dir).unwrap();
        let mut late = schedule(0.2, false);
        late.id = "sched-2".into();
        let added = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            writer.save_schedule(&late).await.unwrap();
        };

        let shutdown = async {
            added.await;
            tokio::time::sleep(Duration::from_secs(3650)).await;
        };
        run_daemon(&store, &scheduler, &optimizer, &cfg, shutdown)
            .await
            .unwrap();

        assert_eq!(scheduler.len(), 0);
        let runs = store.runs_since("ps-1", time::OffsetDateTime::UNIX_EPOCH).await.unwrap();
        assert!(runs.iter().any(|r| r.schedule_id.as_deref() == Some("sched-1")));
        assert!(runs.iter().any(|r| r.schedule_id.as_deref() == Some("sched-2")));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
