use crate::model::EvaluationMethod;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    BudgetExhausted,
    Cancelled,
    NoRuns,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationConfig {
    pub max_iterations: u32,
    pub cost_budget: f64,
    #[serde(default)]
    pub evaluation_method: EvaluationMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub prompt: String,
    pub score: f64,
    /// Candidate score minus the best score before this iteration.
    pub improvement: f64,
    /// Cumulative cost after this iteration.
    pub cost: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSession {
    pub id: String,
    pub prompt_system_id: String,
    pub config: OptimizationConfig,
    pub status: SessionStatus,
    pub current_iteration: u32,
    pub total_cost: f64,
    pub baseline_score: f64,
    pub best_score: f64,
    pub best_prompt: String,
    pub results: Vec<IterationResult>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub error: Option<String>,
}

impl OptimizationSession {
    pub fn new(
        id: String,
        prompt_system_id: String,
        config: OptimizationConfig,
        baseline_score: f64,
        template: String,
    ) -> Self {
        Self {
            id,
            prompt_system_id,
            config,
            status: SessionStatus::Running,
            current_iteration: 0,
            total_cost: 0.0,
            baseline_score,
            best_score: baseline_score,
            best_prompt: template,
            results: Vec::new(),
            start_time: OffsetDateTime::now_utc(),
            stop_reason: None,
            error: None,
        }
    }

    /// Record one iteration, charging `cost` and promoting the candidate if it beats
    /// the best score so far.
    pub fn record(
        &mut self,
        iteration: u32,
        prompt: String,
        score: f64,
        error: Option<String>,
        cost: f64,
    ) -> &IterationResult {
        let improvement = score - self.best_score;
        self.total_cost += cost;
        if score > self.best_score {
            self.best_score = score;
            self.best_prompt = prompt.clone();
        }
        self.results.push(IterationResult {
            iteration,
            prompt,
            score,
            improvement,
            cost: self.total_cost,
            error,
        });
        &self.results[self.results.len() - 1]
    }

    pub fn budget_exhausted(&self) -> bool {
        self.total_cost >= self.config.cost_budget
    }

    /// Move out of `Running`. Returns false, changing nothing, if already terminal.
    pub fn finish(&mut self, status: SessionStatus, reason: Option<StopReason>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.stop_reason = reason;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let moved = self.finish(SessionStatus::Failed, None);
        if moved {
            self.error = Some(error.into());
        }
        moved
    }

    /// Adopt a terminal status written by someone else.
    pub(crate) fn adopt_terminal(&mut self, stored: &OptimizationSession) {
        if !self.status.is_terminal() && stored.status.is_terminal() {
            self.status = stored.status;
            self.stop_reason = stored.stop_reason;
            self.error = stored.error.clone();
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            prompt_system_id: self.prompt_system_id.clone(),
            current_iteration: self.current_iteration,
            total_cost: self.total_cost,
            best_score: self.best_score,
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub prompt_system_id: String,
    pub current_iteration: u32,
    pub total_cost: f64,
    pub best_score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> OptimizationSession {
        OptimizationSession::new(
            "s".into(),
            "ps".into(),
            OptimizationConfig {
                max_iterations: 5,
                cost_budget: 1.0,
                evaluation_method: EvaluationMethod::Fuzzy,
            },
            0.5,
            "base".into(),
        )
    }

    #[test]
    fn best_score_never_decreases() {
        let mut s = session();
        for (i, score) in [0.4, 0.7, 0.6, 0.9, 0.1].into_iter().enumerate() {
            s.record(i as u32 + 1, format!("p{i}"), score, None, 0.01);
        }
        let improvements: Vec<f64> = s.results.iter().map(|r| r.improvement).collect();
        assert!((improvements[0] + 0.1).abs() < 1e-12);
        assert!((improvements[2] + 0.1).abs() < 1e-12);
        assert_eq!(s.best_score, 0.9);
        assert_eq!(s.best_prompt, "p3");
        assert!((s.total_cost - 0.05).abs() < 1e-12);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut s = session();
        assert!(s.finish(SessionStatus::Stopped, Some(StopReason::Cancelled)));
        assert!(!s.finish(SessionStatus::Completed, Some(StopReason::MaxIterations)));
        assert!(!s.fail("boom"));
        assert_eq!(s.status, SessionStatus::Stopped);
        assert!(s.error.is_none());
        assert!(!session().finish(SessionStatus::Running, None));
    }
}
