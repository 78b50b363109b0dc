//! Iterative prompt optimization.
//!
//! A session repeatedly asks a model to rewrite the best prompt so far, scores the
//! candidate on a slice of the latest run's samples and keeps it if it wins. Session
//! state lives in the [`SessionStore`]; every read goes back to the store, which is
//! how `stop` reaches a loop running in another task.

pub mod prompt;
pub mod session;

use crate::config::EngineConfig;
use crate::engine::llm::GenerationRequest;
use crate::engine::RunExecutor;
use crate::error::{Error, Result};
use crate::model::{new_id, RunMode, Sample};
use crate::session_store::SessionStore;
use crate::storage::Storage;
use anyhow::Context;
use session::{OptimizationConfig, OptimizationSession, SessionStatus, SessionSummary, StopReason};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

const SESSION_PREFIX: &str = "optimization_session:";

fn session_key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

pub struct OptimizationEngine {
    storage: Arc<dyn Storage>,
    sessions: Arc<dyn SessionStore>,
    executor: RunExecutor,
    cfg: EngineConfig,
}

impl OptimizationEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        sessions: Arc<dyn SessionStore>,
        executor: RunExecutor,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            storage,
            sessions,
            executor,
            cfg,
        }
    }

    /// Create and persist a running session without starting the loop.
    pub async fn begin(
        &self,
        prompt_system_id: &str,
        config: OptimizationConfig,
    ) -> Result<OptimizationSession> {
        if config.max_iterations == 0 {
            return Err(Error::InvalidConfig("max_iterations must be > 0".into()));
        }
        if config.cost_budget <= 0.0 {
            return Err(Error::InvalidConfig("cost_budget must be > 0".into()));
        }
        let system = self
            .storage
            .get_prompt_system(prompt_system_id)
            .await?
            .ok_or_else(|| Error::not_found("prompt system", prompt_system_id))?;
        let baseline = self
            .storage
            .latest_run_for_prompt_system(prompt_system_id)
            .await?
            .ok_or_else(|| Error::NoBaseline(prompt_system_id.to_string()))?;

        let session = OptimizationSession::new(
            new_id(),
            system.id.clone(),
            config,
            baseline.outcome.avg_score,
            system.template.clone(),
        );
        self.save(&session).await?;
        info!(
            session_id = %session.id,
            prompt_system_id,
            baseline = session.baseline_score,
            "optimization session started"
        );
        Ok(session)
    }

    /// Begin a session and drive it on a detached task. Returns the session id.
    pub async fn start(
        self: &Arc<Self>,
        prompt_system_id: &str,
        config: OptimizationConfig,
    ) -> Result<String> {
        let session = self.begin(prompt_system_id, config).await?;
        let engine = Arc::clone(self);
        let id = session.id.clone();
        tokio::spawn(async move { engine.run(&id).await });
        Ok(session.id)
    }

    /// Drive a session to a terminal state. Bookkeeping errors mark it failed.
    pub async fn run(&self, id: &str) {
        if let Err(e) = self.drive(id).await {
            error!(session_id = id, error = %e, "optimization session failed");
            match self.load(id).await {
                Ok(Some(mut session)) => {
                    if session.fail(e.to_string()) {
                        if let Err(e) = self.save(&session).await {
                            error!(session_id = id, error = %e, "could not persist failure");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => error!(session_id = id, error = %e, "could not load failed session"),
            }
        }
    }

    async fn drive(&self, id: &str) -> Result<()> {
        let mut session = self.require(id).await?;
        let system = self
            .storage
            .get_prompt_system(&session.prompt_system_id)
            .await?
            .ok_or_else(|| Error::not_found("prompt system", session.prompt_system_id.clone()))?;
        let max_iterations = session.config.max_iterations;
        let method = session.config.evaluation_method;

        for iteration in 1..=max_iterations {
            // Cancellation point: the store is authoritative.
            session = self.require(id).await?;
            if session.status != SessionStatus::Running {
                debug!(session_id = id, status = %session.status, "loop observed terminal status");
                return Ok(());
            }
            session.current_iteration = iteration;
            self.persist(&mut session).await?;

            let Some(latest) = self
                .storage
                .latest_run_for_prompt_system(&session.prompt_system_id)
                .await?
            else {
                session.finish(SessionStatus::Completed, Some(StopReason::NoRuns));
                return self.persist(&mut session).await;
            };
            let samples: Vec<Sample> = latest
                .outcome
                .regression_set()
                .into_iter()
                .take(self.cfg.eval_sample_limit)
                .collect();

            let request = prompt::improvement_request(
                &session.best_prompt,
                &latest.outcome.results,
                self.cfg.failure_threshold,
                self.cfg.failure_example_limit,
            );
            let (candidate, score, iteration_error) = match self.rewrite(&request).await {
                Ok(candidate) => {
                    let trial = system.with_template(candidate.as_str());
                    match self
                        .executor
                        .execute(&trial, &samples, method, RunMode::Interactive)
                        .await
                    {
                        Ok(outcome) => (candidate, outcome.avg_score, None),
                        Err(e) => (
                            candidate,
                            0.0,
                            Some(format!("candidate evaluation failed: {e}")),
                        ),
                    }
                }
                Err(message) => (String::new(), 0.0, Some(message)),
            };

            let result = session.record(
                iteration,
                candidate,
                score,
                iteration_error,
                self.cfg.cost_per_iteration,
            );
            info!(
                session_id = id,
                iteration,
                score = result.score,
                improvement = result.improvement,
                cost = result.cost,
                error = result.error.as_deref().unwrap_or(""),
                "optimization iteration finished"
            );
            self.persist(&mut session).await?;
            if session.status != SessionStatus::Running {
                return Ok(());
            }

            if session.budget_exhausted() {
                session.finish(SessionStatus::Completed, Some(StopReason::BudgetExhausted));
                return self.persist(&mut session).await;
            }

            if iteration < max_iterations {
                tokio::time::sleep(self.cfg.iteration_delay).await;
            }
        }

        session.finish(SessionStatus::Completed, Some(StopReason::MaxIterations));
        self.persist(&mut session).await
    }

    /// Ask the rewrite model for a candidate. Failures come back as a message.
    async fn rewrite(&self, request: &str) -> std::result::Result<String, String> {
        let text = prompt::rewrite_prompt(request);
        let rw = &self.cfg.rewrite;
        let req = GenerationRequest {
            prompt: &text,
            provider: &rw.provider,
            model: &rw.model,
            temperature: rw.temperature,
            max_tokens: rw.max_tokens,
            top_p: rw.top_p,
            top_k: None,
        };
        match self.executor.llm().generate(&req).await {
            Ok(candidate) if !candidate.trim().is_empty() => Ok(candidate.trim().to_string()),
            Ok(_) => Err("failed to generate improved prompt: empty response".into()),
            Err(e) => {
                warn!(error = %e, "rewrite request failed");
                Err(format!("failed to generate improved prompt: {e}"))
            }
        }
    }

    pub async fn status(&self, id: &str) -> Result<OptimizationSession> {
        self.require(id).await
    }

    /// Request cancellation. The loop notices before its next iteration.
    pub async fn stop(&self, id: &str) -> Result<SessionStatus> {
        let mut session = self.require(id).await?;
        if session.finish(SessionStatus::Stopped, Some(StopReason::Cancelled)) {
            self.save(&session).await?;
            info!(session_id = id, "optimization session stopped");
        }
        Ok(session.status)
    }

    /// Stop every running session; returns how many were stopped.
    pub async fn stop_all(&self) -> Result<usize> {
        let mut stopped = 0;
        for summary in self.list().await? {
            if summary.status == SessionStatus::Running
                && self.stop(&summary.id).await? == SessionStatus::Stopped
            {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.sessions.delete(&session_key(id)).await? {
            Ok(())
        } else {
            Err(Error::not_found("optimization session", id))
        }
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut out = Vec::new();
        for key in self.sessions.list_keys(SESSION_PREFIX).await? {
            let id = key.trim_start_matches(SESSION_PREFIX);
            if let Some(session) = self.load(id).await? {
                out.push(session.summary());
            }
        }
        Ok(out)
    }

    /// Delete terminal sessions that started more than one TTL ago.
    pub async fn sweep(&self) -> Result<usize> {
        let cutoff = OffsetDateTime::now_utc() - self.cfg.session_ttl;
        let mut removed = 0;
        for summary in self.list().await? {
            if summary.status.is_terminal() && summary.start_time < cutoff {
                self.sessions.delete(&session_key(&summary.id)).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up old optimization sessions");
        }
        Ok(removed)
    }

    async fn load(&self, id: &str) -> Result<Option<OptimizationSession>> {
        let Some(raw) = self.sessions.get(&session_key(id)).await? else {
            return Ok(None);
        };
        let session = serde_json::from_str(&raw)
            .with_context(|| format!("decode optimization session {id}"))?;
        Ok(Some(session))
    }

    async fn require(&self, id: &str) -> Result<OptimizationSession> {
        self.load(id)
            .await?
            .ok_or_else(|| Error::not_found("optimization session", id))
    }

    async fn save(&self, session: &OptimizationSession) -> Result<()> {
        let raw = serde_json::to_string(session).context("encode optimization session")?;
        self.sessions
            .set(&session_key(&session.id), raw, self.cfg.session_ttl)
            .await?;
        Ok(())
    }

    /// Write the loop's copy without undoing an out-of-band terminal transition.
    async fn persist(&self, session: &mut OptimizationSession) -> Result<()> {
        let stored = self.require(&session.id).await?;
        session.adopt_terminal(&stored);
        self.save(session).await
    }
}
