//! Post-run processing for scheduled runs.
//!
//! Compares a fresh outcome with the schedule's previous run and raises score-drop
//! and failure alerts. Detection always happens and is logged; delivery only when the
//! schedule has notifications enabled and at least one recipient.

use crate::model::{RunRecord, ScheduleDescriptor};
use crate::notify::{FailureAlert, Notifier, ScoreDropAlert};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    ScoreDrop(ScoreDropAlert),
    Failure(FailureAlert),
}

/// Work out which alerts a run deserves. Both kinds may fire for the same run.
pub fn detect_alerts(
    schedule: &ScheduleDescriptor,
    run: &RunRecord,
    previous: Option<&RunRecord>,
) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let outcome = &run.outcome;

    if let Some(prev) = previous {
        let drop = prev.outcome.avg_score - outcome.avg_score;
        if outcome.total_samples > 0 && drop > schedule.alert_threshold {
            alerts.push(Alert::ScoreDrop(ScoreDropAlert {
                recipients: schedule.recipients.clone(),
                schedule_name: schedule.name.clone(),
                run_id: run.id.clone(),
                current_score: outcome.avg_score,
                previous_score: prev.outcome.avg_score,
                total_samples: schedule.regression_set.len(),
            }));
        }
    }

    if let Some(message) = outcome.failure_message() {
        alerts.push(Alert::Failure(FailureAlert {
            recipients: schedule.recipients.clone(),
            schedule_name: schedule.name.clone(),
            run_id: run.id.clone(),
            error_message: message,
            total_samples: schedule.regression_set.len(),
        }));
    }

    alerts
}

/// Detect alerts for `run` and hand them to the notifier when delivery is enabled.
pub(crate) async fn process_scheduled_outcome(
    schedule: &ScheduleDescriptor,
    run: &RunRecord,
    previous: Option<&RunRecord>,
    notifier: &dyn Notifier,
) -> Vec<Alert> {
    let alerts = detect_alerts(schedule, run, previous);
    let deliver = schedule.notifications_enabled && !schedule.recipients.is_empty();

    for alert in &alerts {
        match alert {
            Alert::ScoreDrop(a) => {
                warn!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    previous = a.previous_score,
                    current = a.current_score,
                    threshold = schedule.alert_threshold,
                    deliver,
                    "score drop detected"
                );
                if deliver {
                    notifier.notify_score_drop(a.clone()).await;
                }
            }
            Alert::Failure(a) => {
                warn!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    error = %a.error_message,
                    deliver,
                    "scheduled run had failures"
                );
                if deliver {
                    notifier.notify_failure(a.clone()).await;
                }
            }
        }
    }

    if alerts.is_empty() {
        info!(
            schedule_id = %schedule.id,
            run_id = %run.id,
            avg_score = run.outcome.avg_score,
            "scheduled run completed, no alerts"
        );
    }
    alerts
}
