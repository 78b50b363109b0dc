use crate::error::Error;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Model settings used to ask for prompt rewrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4".into(),
            temperature: 0.7,
            max_tokens: 500,
            top_p: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Expiry applied to every optimization session write.
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Pause between optimization iterations.
    #[serde(with = "humantime_serde")]
    pub iteration_delay: Duration,
    /// How often the daemon re-reads schedules from storage.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub cost_per_iteration: f64,
    /// Samples scoring below this count as failures when building rewrite requests.
    pub failure_threshold: f64,
    pub eval_sample_limit: usize,
    pub failure_example_limit: usize,
    pub rewrite: RewriteConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            iteration_delay: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            cost_per_iteration: 0.01,
            failure_threshold: 0.8,
            eval_sample_limit: 10,
            failure_example_limit: 5,
            rewrite: RewriteConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let check = |ok: bool, msg: &str| {
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidConfig(msg.to_string()))
            }
        };
        check(!self.session_ttl.is_zero(), "session_ttl must be > 0")?;
        check(!self.sweep_interval.is_zero(), "sweep_interval must be > 0")?;
        check(!self.refresh_interval.is_zero(), "refresh_interval must be > 0")?;
        check(
            self.cost_per_iteration > 0.0,
            "cost_per_iteration must be > 0",
        )?;
        check(
            (0.0..=1.0).contains(&self.failure_threshold),
            "failure_threshold must be within [0, 1]",
        )?;
        check(self.eval_sample_limit > 0, "eval_sample_limit must be > 0")?;
        check(!self.rewrite.model.trim().is_empty(), "rewrite.model must be set")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"iteration_delay": "500ms", "rewrite": {"model": "gpt-4o"}}"#)
                .unwrap();
        assert_eq!(cfg.iteration_delay, Duration::from_millis(500));
        assert_eq!(cfg.session_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.rewrite.model, "gpt-4o");
        assert_eq!(cfg.rewrite.max_tokens, 500);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let cfg = EngineConfig {
            failure_threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }
}
