//! Body of a scheduled fire: load, run, compare, persist.

use super::post_process::{self, Alert};
use super::scheduler::ScheduledJob;
use crate::engine::RunExecutor;
use crate::model::{RunMode, RunRecord};
use crate::notify::Notifier;
use crate::storage::Storage;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// Summary of one completed scheduled run.
#[derive(Debug, Clone)]
pub struct ScheduledRunReport {
    pub run_id: String,
    pub avg_score: f64,
    pub total_samples: usize,
    pub alerts: Vec<Alert>,
}

pub struct ScheduleRunner {
    storage: Arc<dyn Storage>,
    executor: RunExecutor,
    notifier: Arc<dyn Notifier>,
}

impl ScheduleRunner {
    pub fn new(
        storage: Arc<dyn Storage>,
        executor: RunExecutor,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            storage,
            executor,
            notifier,
        }
    }

    /// Execute one scheduled run. `Ok(None)` when the schedule is gone, inactive,
    /// or its prompt system no longer exists.
    pub async fn run_once(&self, schedule_id: &str) -> Result<Option<ScheduledRunReport>> {
        let Some(schedule) = self.storage.get_schedule(schedule_id).await? else {
            debug!(schedule_id, "schedule no longer exists");
            return Ok(None);
        };
        if !schedule.active {
            debug!(schedule_id, "schedule inactive");
            return Ok(None);
        }
        let Some(system) = self
            .storage
            .get_prompt_system(&schedule.prompt_system_id)
            .await?
        else {
            warn!(
                schedule_id,
                prompt_system_id = %schedule.prompt_system_id,
                "prompt system missing for schedule"
            );
            return Ok(None);
        };

        let outcome = self
            .executor
            .execute(
                &system,
                &schedule.regression_set,
                schedule.evaluation_method,
                RunMode::Scheduled,
            )
            .await?;
        let run = RunRecord::new(&system.id, Some(schedule_id), outcome);

        let previous = self
            .storage
            .latest_run_for_schedule(schedule_id, Some(&run.id))
            .await?;
        let alerts = post_process::process_scheduled_outcome(
            &schedule,
            &run,
            previous.as_ref(),
            self.notifier.as_ref(),
        )
        .await;

        self.storage.save_run(&run).await?;

        // Re-read: the schedule may have been edited while the batch ran.
        if let Some(mut fresh) = self.storage.get_schedule(schedule_id).await? {
            let now = OffsetDateTime::now_utc();
            fresh.last_run_at = Some(now);
            fresh.next_run_at = Some(now + fresh.interval);
            self.storage.save_schedule(&fresh).await?;
        }

        Ok(Some(ScheduledRunReport {
            run_id: run.id,
            avg_score: run.outcome.avg_score,
            total_samples: run.outcome.total_samples,
            alerts,
        }))
    }
}

#[async_trait]
impl ScheduledJob for ScheduleRunner {
    async fn fire(&self, schedule_id: &str) {
        match self.run_once(schedule_id).await {
            Ok(Some(report)) => info!(
                schedule_id,
                run_id = %report.run_id,
                avg_score = report.avg_score,
                samples = report.total_samples,
                alerts = report.alerts.len(),
                "scheduled test completed"
            ),
            Ok(None) => {}
            Err(e) => error!(schedule_id, error = %format!("{e:#}"), "scheduled test failed"),
        }
    }
}
