//! Run one regression set against several models side by side.

use crate::engine::RunExecutor;
use crate::model::{EvaluationMethod, PromptSystem, RunMode, Sample};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelComparison {
    pub model: String,
    pub provider: String,
    pub status: ComparisonStatus,
    pub avg_score: f64,
    pub total_samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `gpt-*` models go to OpenAI, everything else to Ollama.
pub fn provider_for_model(model: &str) -> &'static str {
    if model.starts_with("gpt-") {
        "openai"
    } else {
        "ollama"
    }
}

/// Evaluate `base` once per model, concurrently. A failing model is reported with
/// a zero score and does not affect the others. Output order follows `models`.
pub async fn compare_models(
    executor: &RunExecutor,
    base: &PromptSystem,
    models: &[String],
    samples: &[Sample],
    method: EvaluationMethod,
) -> Vec<ModelComparison> {
    let runs = models.iter().map(|model| async move {
        let provider = provider_for_model(model);
        let system = PromptSystem {
            model: model.clone(),
            provider: provider.to_string(),
            ..base.clone()
        };
        match executor
            .execute(&system, samples, method, RunMode::Interactive)
            .await
        {
            Ok(outcome) => ModelComparison {
                model: model.clone(),
                provider: provider.to_string(),
                status: ComparisonStatus::Completed,
                avg_score: outcome.avg_score,
                total_samples: outcome.total_samples,
                error: None,
            },
            Err(e) => {
                warn!(model = %model, error = %e, "model comparison run failed");
                ModelComparison {
                    model: model.clone(),
                    provider: provider.to_string(),
                    status: ComparisonStatus::Failed,
                    avg_score: 0.0,
                    total_samples: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    });
    futures::future::join_all(runs).await
}
