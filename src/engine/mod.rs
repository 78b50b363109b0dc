pub mod evaluator;
pub mod llm;
pub mod template;

use crate::error::{Error, Result};
use crate::model::{
    EvaluationMethod, FailureKind, PromptSystem, RunEvent, RunMode, RunOutcome, RunRecord,
    Sample, SampleFailure, SampleResult,
};
use crate::storage::Storage;
use llm::{GenerationRequest, LlmClient};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Drives a regression set through the model and the evaluator.
#[derive(Clone)]
pub struct RunExecutor {
    llm: Arc<dyn LlmClient>,
    event_tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl RunExecutor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            event_tx: None,
        }
    }

    /// Emit progress events on `tx` for every sample.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    fn emit(&self, ev: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// Run every sample in order.
    ///
    /// In `Interactive` mode the first failure aborts the batch and nothing is
    /// returned but the error. In `Scheduled` mode failing samples are recorded on
    /// the outcome and skipped, so this never returns `Err`.
    pub async fn execute(
        &self,
        system: &PromptSystem,
        samples: &[Sample],
        method: EvaluationMethod,
        mode: RunMode,
    ) -> Result<RunOutcome> {
        let mut results = Vec::with_capacity(samples.len());
        let mut failures = Vec::new();

        for (index, sample) in samples.iter().enumerate() {
            match self.run_sample(system, sample, index, method).await {
                Ok(result) => {
                    self.emit(RunEvent::SampleScored {
                        index,
                        score: result.score,
                    });
                    results.push(result);
                }
                Err(e) if mode == RunMode::Interactive => return Err(e),
                Err(e) => {
                    let failure = to_failure(index, &e);
                    warn!(
                        prompt_system = %system.id,
                        sample = index,
                        error = %failure.message,
                        "skipping sample"
                    );
                    self.emit(RunEvent::SampleSkipped {
                        index,
                        reason: failure.message.clone(),
                    });
                    failures.push(failure);
                }
            }
        }

        let outcome = RunOutcome::new(results, failures);
        debug!(
            prompt_system = %system.id,
            avg_score = outcome.avg_score,
            evaluated = outcome.total_samples,
            failures = outcome.failure_count,
            "batch finished"
        );
        Ok(outcome)
    }

    /// Interactive run followed by a save. A failed batch stores nothing.
    pub async fn run_and_store(
        &self,
        storage: &dyn Storage,
        system: &PromptSystem,
        samples: &[Sample],
        method: EvaluationMethod,
    ) -> Result<RunRecord> {
        let outcome = self
            .execute(system, samples, method, RunMode::Interactive)
            .await?;
        let run = RunRecord::new(&system.id, None, outcome);
        storage.save_run(&run).await?;
        Ok(run)
    }

    async fn run_sample(
        &self,
        system: &PromptSystem,
        sample: &Sample,
        index: usize,
        method: EvaluationMethod,
    ) -> Result<SampleResult> {
        let prompt = template::interpolate(&system.template, &sample.variables, index)?;
        self.emit(RunEvent::SampleStarted { index });
        let predicted = self
            .llm
            .generate(&GenerationRequest::for_system(system, &prompt))
            .await
            .map_err(|source| Error::Upstream {
                sample_index: index,
                source,
            })?;
        let score = evaluator::score(&predicted, &sample.expected_output, method);
        Ok(SampleResult {
            sample_index: index,
            variables: sample.variables.clone(),
            expected_output: sample.expected_output.clone(),
            predicted_output: predicted,
            score,
            evaluation_method: method,
        })
    }
}

fn to_failure(index: usize, e: &Error) -> SampleFailure {
    match e {
        Error::MissingVariable { name, .. } => SampleFailure {
            sample_index: index,
            kind: FailureKind::MissingVariable,
            message: format!("Missing variable `{name}` in sample {index}"),
        },
        Error::Upstream { source, .. } => SampleFailure {
            sample_index: index,
            kind: FailureKind::Upstream(source.kind),
            message: format!("LLM call failed for sample {index}: {source}"),
        },
        other => SampleFailure {
            sample_index: index,
            kind: FailureKind::Upstream(llm::LlmErrorKind::Other),
            message: format!("Sample {index} failed: {other}"),
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted model backend shared by tests across the crate.

    use super::llm::{GenerationRequest, LlmClient, LlmError, LlmErrorKind};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Echoes the prompt back unless a failure is scripted for it. Calls made with
    /// `rewrite_model` pop the next scripted rewrite instead.
    #[derive(Default)]
    pub struct ScriptedLlm {
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
        pub failures: Mutex<HashMap<String, LlmErrorKind>>,
        pub rewrites: Mutex<Vec<Result<String, LlmErrorKind>>>,
        pub rewrite_model: String,
    }

    impl ScriptedLlm {
        pub fn new() -> Self {
            Self {
                rewrite_model: "rewriter".into(),
                ..Default::default()
            }
        }

        pub fn fail_on(self, prompt: &str, kind: LlmErrorKind) -> Self {
            self.failures
                .lock()
                .unwrap()
                .insert(prompt.to_string(), kind);
            self
        }

        pub fn with_rewrites(self, rewrites: Vec<Result<&str, LlmErrorKind>>) -> Self {
            *self.rewrites.lock().unwrap() = rewrites
                .into_iter()
                .rev()
                .map(|r| r.map(str::to_string))
                .collect();
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, req: &GenerationRequest<'_>) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if req.model == self.rewrite_model {
                return match self.rewrites.lock().unwrap().pop() {
                    Some(Ok(text)) => Ok(text),
                    Some(Err(kind)) => Err(LlmError::new(kind, "scripted rewrite failure")),
                    None => Ok(String::new()),
                };
            }
            self.prompts.lock().unwrap().push(req.prompt.to_string());
            if let Some(kind) = self.failures.lock().unwrap().get(req.prompt) {
                return Err(LlmError::new(*kind, "scripted failure"));
            }
            Ok(req.prompt.to_string())
        }
    }

    pub fn system(template: &str) -> crate::model::PromptSystem {
        crate::model::PromptSystem {
            id: "ps-1".into(),
            name: "capitals".into(),
            template: template.into(),
            variables: vec!["q".into()],
            provider: "openai".into(),
            model: "echo".into(),
            temperature: 0.0,
            max_tokens: 32,
            top_p: 1.0,
            top_k: None,
            created_at: time::OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::llm::LlmErrorKind;
    use super::testing::{system, ScriptedLlm};
    use super::*;

    fn samples() -> Vec<Sample> {
        vec![
            Sample::new([("q", "paris")], "paris"),
            Sample::new([("q", "rome")], "rome"),
            Sample::new([("q", "oslo")], "berlin"),
        ]
    }

    #[tokio::test]
    async fn interactive_average_is_mean_of_scores() {
        let llm = Arc::new(ScriptedLlm::new());
        let exec = RunExecutor::new(llm.clone());
        let out = exec
            .execute(&system("{q}"), &samples(), EvaluationMethod::Exact, RunMode::Interactive)
            .await
            .unwrap();
        assert_eq!(out.total_samples, 3);
        assert_eq!(out.failure_count, 0);
        let scores: Vec<f64> = out.results.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![1.0, 1.0, 0.0]);
        assert!((out.avg_score - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_set_scores_zero() {
        let exec = RunExecutor::new(Arc::new(ScriptedLlm::new()));
        let out = exec
            .execute(&system("{q}"), &[], EvaluationMethod::Fuzzy, RunMode::Interactive)
            .await
            .unwrap();
        assert_eq!(out.avg_score, 0.0);
        assert_eq!(out.total_samples, 0);
    }

    #[tokio::test]
    async fn interactive_missing_variable_aborts_before_model_call() {
        let llm = Arc::new(ScriptedLlm::new());
        let exec = RunExecutor::new(llm.clone());
        let mut set = samples();
        set[1] = Sample::new([("city", "rome")], "rome");
        let err = exec
            .execute(&system("{q}"), &set, EvaluationMethod::Exact, RunMode::Interactive)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MissingVariable { ref name, sample_index: 1 } if name == "q"
        ));
        assert_eq!(err.status_code(), 400);
        // only sample 0 reached the model
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn interactive_upstream_error_keeps_classification() {
        let llm = Arc::new(ScriptedLlm::new().fail_on("rome", LlmErrorKind::Quota));
        let exec = RunExecutor::new(llm.clone());
        let err = exec
            .execute(&system("{q}"), &samples(), EvaluationMethod::Exact, RunMode::Interactive)
            .await
            .unwrap_err();
        assert_eq!(err.upstream_kind(), Some(LlmErrorKind::Quota));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn scheduled_run_skips_failed_sample_and_reports_it() {
        let llm = Arc::new(ScriptedLlm::new().fail_on("oslo", LlmErrorKind::Auth));
        let exec = RunExecutor::new(llm);
        let out = exec
            .execute(&system("{q}"), &samples(), EvaluationMethod::Exact, RunMode::Scheduled)
            .await
            .unwrap();
        assert_eq!(out.total_samples, 2);
        assert_eq!(out.avg_score, 1.0);
        assert!(out.failure_occurred());
        assert_eq!(out.failures[0].kind, FailureKind::Upstream(LlmErrorKind::Auth));
        let msg = out.failure_message().unwrap();
        assert!(msg.contains("sample 2"), "{msg}");
        assert!(msg.contains("auth"), "{msg}");
    }

    #[tokio::test]
    async fn scheduled_run_skips_missing_variables() {
        let exec = RunExecutor::new(Arc::new(ScriptedLlm::new()));
        let set = vec![
            Sample::new([("other", "x")], "x"),
            Sample::new([("q", "rome")], "rome"),
        ];
        let out = exec
            .execute(&system("{q}"), &set, EvaluationMethod::Exact, RunMode::Scheduled)
            .await
            .unwrap();
        assert_eq!(out.total_samples, 1);
        assert_eq!(out.results[0].sample_index, 1);
        assert_eq!(out.failures[0].kind, FailureKind::MissingVariable);
    }

    #[tokio::test]
    async fn failed_interactive_run_is_not_stored() {
        let store = crate::storage::JsonStore::in_memory();
        let sys = system("{q}");

        let exec = RunExecutor::new(Arc::new(ScriptedLlm::new()));
        let mut set = samples();
        set[2] = Sample::new([("city", "oslo")], "oslo");
        let err = exec
            .run_and_store(&store, &sys, &set, EvaluationMethod::Exact)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingVariable { sample_index: 2, .. }));

        let exec = RunExecutor::new(Arc::new(
            ScriptedLlm::new().fail_on("rome", LlmErrorKind::Transport),
        ));
        let err = exec
            .run_and_store(&store, &sys, &samples(), EvaluationMethod::Exact)
            .await
            .unwrap_err();
        assert_eq!(err.upstream_kind(), Some(LlmErrorKind::Transport));

        assert!(store.latest_run_for_prompt_system("ps-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn successful_interactive_run_is_stored() {
        let store = crate::storage::JsonStore::in_memory();
        let exec = RunExecutor::new(Arc::new(ScriptedLlm::new()));
        let run = exec
            .run_and_store(&store, &system("{q}"), &samples(), EvaluationMethod::Exact)
            .await
            .unwrap();
        assert_eq!(run.schedule_id, None);
        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome.total_samples, 3);
    }

    #[tokio::test]
    async fn emits_progress_events_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exec = RunExecutor::new(Arc::new(ScriptedLlm::new())).with_events(tx);
        exec.execute(&system("{q}"), &samples()[..2], EvaluationMethod::Exact, RunMode::Scheduled)
            .await
            .unwrap();
        drop(exec);
        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev.to_message());
        }
        assert_eq!(
            seen,
            vec![
                "Sample 0: calling model",
                "Sample 0: score 1.000",
                "Sample 1: calling model",
                "Sample 1: score 1.000",
            ]
        );
    }
}
