//! Alert delivery. Best-effort: implementations log their own failures and never
//! report back to the scheduled job.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreDropAlert {
    pub recipients: Vec<String>,
    pub schedule_name: String,
    pub run_id: String,
    pub current_score: f64,
    pub previous_score: f64,
    pub total_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAlert {
    pub recipients: Vec<String>,
    pub schedule_name: String,
    pub run_id: String,
    pub error_message: String,
    pub total_samples: usize,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_score_drop(&self, alert: ScoreDropAlert);
    async fn notify_failure(&self, alert: FailureAlert);
}

/// Writes alerts to the log instead of sending mail.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_score_drop(&self, alert: ScoreDropAlert) {
        warn!(
            schedule = %alert.schedule_name,
            run_id = %alert.run_id,
            current = alert.current_score,
            previous = alert.previous_score,
            samples = alert.total_samples,
            recipients = %alert.recipients.join(", "),
            "score drop alert"
        );
    }

    async fn notify_failure(&self, alert: FailureAlert) {
        warn!(
            schedule = %alert.schedule_name,
            run_id = %alert.run_id,
            samples = alert.total_samples,
            recipients = %alert.recipients.join(", "),
            error = %alert.error_message,
            "scheduled test failure alert"
        );
    }
}
