//! Text summary builders for CLI output.
//!
//! Each builder computes what it needs and returns pre-formatted lines for text mode.

use crate::comparison::{ComparisonStatus, ModelComparison};
use crate::metrics;
use crate::model::{HistoryPoint, RunRecord};
use crate::optimizer::session::{OptimizationSession, SessionSummary};
use time::format_description::well_known::Rfc3339;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn timestamp(t: time::OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| "-".into())
}

/// Summarise a stored run: score distribution, worst samples, skipped samples.
pub(crate) fn build_run_summary(run: &RunRecord, worst: usize) -> TextSummary {
    let outcome = &run.outcome;
    let mut lines = vec![format!(
        "Run {} ({}): {} evaluated, {} skipped",
        run.id,
        timestamp(run.created_at),
        outcome.total_samples,
        outcome.failure_count
    )];

    let scores: Vec<f64> = outcome.results.iter().map(|r| r.score).collect();
    match metrics::compute_metrics(&scores) {
        Some((mean, median, p25, p75)) => lines.push(format!(
            "Score: avg {mean:.3} med {median:.3} p25 {p25:.3} p75 {p75:.3}"
        )),
        None => lines.push("Score: no samples evaluated".into()),
    }

    let mut ranked: Vec<_> = outcome.results.iter().filter(|r| r.score < 1.0).collect();
    ranked.sort_by(|a, b| a.score.total_cmp(&b.score));
    for r in ranked.into_iter().take(worst) {
        lines.push(format!(
            "  #{} score {:.3}: expected {:?}, got {:?}",
            r.sample_index, r.score, r.expected_output, r.predicted_output
        ));
    }

    if outcome.failure_occurred() {
        for f in &outcome.failures {
            lines.push(format!("  skipped: {}", f.message));
        }
    }
    TextSummary { lines }
}

pub(crate) fn build_history_summary(points: &[HistoryPoint]) -> TextSummary {
    if points.is_empty() {
        return TextSummary {
            lines: vec!["No runs in range".into()],
        };
    }
    let mut lines: Vec<String> = points
        .iter()
        .map(|p| {
            format!(
                "{}  {:.3}  n={:<4} {}",
                timestamp(p.created_at),
                p.avg_score,
                p.total_samples,
                if p.is_scheduled { "scheduled" } else { "manual" }
            )
        })
        .collect();
    let scores: Vec<f64> = points.iter().map(|p| p.avg_score).collect();
    if let Some((mean, median, p25, p75)) = metrics::compute_metrics(&scores) {
        lines.push(format!(
            "Across {} runs: avg {mean:.3} med {median:.3} p25 {p25:.3} p75 {p75:.3}",
            points.len()
        ));
    }
    TextSummary { lines }
}

pub(crate) fn build_session_summary(session: &OptimizationSession) -> TextSummary {
    let mut lines = vec![
        format!(
            "Session {} [{}] iteration {}/{}",
            session.id, session.status, session.current_iteration, session.config.max_iterations
        ),
        format!(
            "Score: baseline {:.3} best {:.3} ({:+.3})",
            session.baseline_score,
            session.best_score,
            session.best_score - session.baseline_score
        ),
        format!(
            "Cost: {:.2} of {:.2}",
            session.total_cost, session.config.cost_budget
        ),
    ];
    if let Some(reason) = session.stop_reason {
        lines.push(format!("Stopped: {reason:?}"));
    }
    if let Some(err) = &session.error {
        lines.push(format!("Error: {err}"));
    }
    for r in &session.results {
        let note = r.error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default();
        lines.push(format!(
            "  {:>3}: {:.3} {:+.3}{note}",
            r.iteration, r.score, r.improvement
        ));
    }
    lines.push(format!("Best prompt: {}", session.best_prompt));
    TextSummary { lines }
}

pub(crate) fn build_session_list(sessions: &[SessionSummary]) -> TextSummary {
    if sessions.is_empty() {
        return TextSummary {
            lines: vec!["No optimization sessions".into()],
        };
    }
    let lines = sessions
        .iter()
        .map(|s| {
            format!(
                "{}  {:<9} {:<12} iter {:>3}  best {:.3}  cost {:.2}  started {}",
                s.id,
                s.status.to_string(),
                s.prompt_system_id,
                s.current_iteration,
                s.best_score,
                s.total_cost,
                timestamp(s.start_time)
            )
        })
        .collect();
    TextSummary { lines }
}

pub(crate) fn build_comparison_summary(results: &[ModelComparison]) -> TextSummary {
    let lines = results
        .iter()
        .map(|c| match c.status {
            ComparisonStatus::Completed => format!(
                "{:<24} {:<7} avg {:.3} n={}",
                c.model, c.provider, c.avg_score, c.total_samples
            ),
            ComparisonStatus::Failed => format!(
                "{:<24} {:<7} failed: {}",
                c.model,
                c.provider,
                c.error.as_deref().unwrap_or("unknown error")
            ),
        })
        .collect();
    TextSummary { lines }
}
