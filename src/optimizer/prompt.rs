//! Builds the request sent to the rewriting model.

use crate::engine::template::render_value;
use crate::model::SampleResult;

pub const SYSTEM_MESSAGE: &str =
    "You are an expert prompt engineer. Provide clear, specific, and effective prompt improvements.";

fn format_inputs(r: &SampleResult) -> String {
    let pairs: Vec<String> = r
        .variables
        .iter()
        .map(|(k, v)| format!("{k}={}", render_value(v)))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

/// Ask for a rewrite of `prompt`.
///
/// When some results scored below `failure_threshold`, up to `max_examples` of them
/// are quoted and the rewrite is asked to fix them. Otherwise the request is a pure
/// clarity pass.
pub fn improvement_request(
    prompt: &str,
    results: &[SampleResult],
    failure_threshold: f64,
    max_examples: usize,
) -> String {
    let failures: Vec<&SampleResult> = results
        .iter()
        .filter(|r| r.score < failure_threshold)
        .take(max_examples)
        .collect();

    if failures.is_empty() {
        return format!(
            "The following prompt is working well, but we want to make it even better.\n\
             Suggest a slightly improved version that is clearer, more specific, or more effective.\n\n\
             Original prompt: {prompt}\n\n\
             Keep the same structure and the same {{variable}} placeholders. \
             Return only the improved prompt, nothing else."
        );
    }

    let examples: Vec<String> = failures
        .iter()
        .map(|r| {
            format!(
                "Input: {}, Expected: {}, Got: {}, Score: {:.2}",
                format_inputs(r),
                r.expected_output,
                r.predicted_output,
                r.score
            )
        })
        .collect();

    format!(
        "The following prompt needs improvement. Here are examples where it failed:\n\n\
         Original prompt: {prompt}\n\n\
         Failed examples:\n{}\n\n\
         Provide an improved version of the prompt that addresses these failure patterns. It should:\n\
         1. Be more specific about the expected output\n\
         2. Handle edge cases better\n\
         3. Be clearer and unambiguous\n\
         4. Keep the same basic structure and {{variable}} placeholders\n\n\
         Return only the improved prompt, nothing else. Do not prefix it with a label.",
        examples.join("\n")
    )
}

/// Full text sent to the rewriting model.
pub fn rewrite_prompt(request: &str) -> String {
    format!("{SYSTEM_MESSAGE}\n\n{request}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EvaluationMethod;

    fn result(i: usize, score: f64) -> SampleResult {
        SampleResult {
            sample_index: i,
            variables: [("q".to_string(), serde_json::json!(format!("input-{i}")))]
                .into_iter()
                .collect(),
            expected_output: format!("want-{i}"),
            predicted_output: format!("got-{i}"),
            score,
            evaluation_method: EvaluationMethod::Fuzzy,
        }
    }

    #[test]
    fn all_passing_asks_for_polish() {
        let req = improvement_request("Say {q}", &[result(0, 0.9), result(1, 0.8)], 0.8, 5);
        assert!(req.contains("working well"));
        assert!(req.contains("Original prompt: Say {q}"));
        assert!(!req.contains("Failed examples"));
    }

    #[test]
    fn failures_are_quoted_up_to_limit() {
        let results: Vec<SampleResult> = (0..8).map(|i| result(i, 0.1)).collect();
        let req = improvement_request("Say {q}", &results, 0.8, 5);
        assert!(req.contains("Failed examples"));
        assert!(req.contains("Input: {q=input-0}, Expected: want-0, Got: got-0, Score: 0.10"));
        assert!(req.contains("input-4"));
        assert!(!req.contains("input-5"));
    }
}
