//! Opaque judge consulted when `end_criteria_config.criteria` is set: given
//! the criteria text and the latest Agent response, decides whether the
//! task is done. Behind a trait so tests can inject fakes.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::agent_driver::{self, RunRequest};

#[async_trait]
pub trait CriteriaChecker: Send + Sync {
    async fn check(
        &self,
        criteria: &str,
        task_description: &str,
        latest_response: &str,
    ) -> (bool, String);
}

/// Any error here is treated by the core as `(false, error text)` — the
/// iteration continues rather than stalling on a judge failure.
pub struct AgentCriteriaChecker {
    pub agent_bin: String,
}

impl AgentCriteriaChecker {
    pub fn new(agent_bin: impl Into<String>) -> Self {
        Self { agent_bin: agent_bin.into() }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionJudgment {
    #[serde(default)]
    is_complete: bool,
    #[serde(default = "default_reasoning")]
    reasoning: String,
    #[serde(default)]
    confidence: f64,
}

fn default_reasoning() -> String {
    "unknown".to_string()
}

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap()
});
static RAW_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").unwrap());

fn extract_json(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON.captures(text) {
        return caps.get(1).map(|m| m.as_str());
    }
    RAW_JSON.find(text).map(|m| m.as_str())
}

#[async_trait]
impl CriteriaChecker for AgentCriteriaChecker {
    async fn check(
        &self,
        criteria: &str,
        task_description: &str,
        latest_response: &str,
    ) -> (bool, String) {
        let prompt = format!(
            "Based on the conversation so far, determine whether the task below has met its \
             ending criteria.\n\nTask Description:\n{task_description}\n\n\
             Ending Criteria (Success Condition):\n{criteria}\n\n\
             Latest Response from the Agent:\n{latest_response}\n\n\
             Respond in JSON format:\n\
             {{\"is_complete\": true|false, \"reasoning\": \"brief explanation\", \"confidence\": 0.0-1.0}}\n\n\
             Be strict — only mark as complete if the criteria is clearly and fully met."
        );

        let cwd = std::env::temp_dir();
        let outcome = agent_driver::run(
            RunRequest {
                agent_bin: &self.agent_bin,
                message: &prompt,
                cwd: &cwd,
                session_id: None,
                images: &[],
                mcp_servers: None,
            },
            |_event| {},
            |_pid| {},
        )
        .await;

        let text = match outcome {
            Ok(o) => o.text,
            Err(e) => return (false, format!("criteria checker error: {e}")),
        };

        let Some(json) = extract_json(&text) else {
            return (false, "could not parse completion check".to_string());
        };

        match serde_json::from_str::<CompletionJudgment>(json) {
            Ok(j) if j.is_complete && j.confidence > 0.7 => (true, j.reasoning),
            Ok(j) => (false, j.reasoning),
            Err(e) => (false, format!("malformed completion JSON: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json_block() {
        let text = "Here you go:\n```json\n{\"is_complete\": true, \"reasoning\": \"done\", \"confidence\": 0.9}\n```";
        let json = extract_json(text).unwrap();
        let parsed: CompletionJudgment = serde_json::from_str(json).unwrap();
        assert!(parsed.is_complete);
        assert!(parsed.confidence > 0.8);
    }

    #[test]
    fn extracts_raw_json_without_fences() {
        let text = "result: {\"is_complete\": false, \"reasoning\": \"missing tests\", \"confidence\": 0.3}";
        let json = extract_json(text).unwrap();
        let parsed: CompletionJudgment = serde_json::from_str(json).unwrap();
        assert!(!parsed.is_complete);
    }

    #[test]
    fn no_json_returns_none() {
        assert!(extract_json("just prose, no structure here").is_none());
    }

    struct FakeChecker(bool);

    #[async_trait]
    impl CriteriaChecker for FakeChecker {
        async fn check(&self, _c: &str, _d: &str, _r: &str) -> (bool, String) {
            (self.0, "fake".to_string())
        }
    }

    #[tokio::test]
    async fn fake_checker_is_injectable() {
        let checker = FakeChecker(true);
        let (done, _) = checker.check("x", "y", "z").await;
        assert!(done);
    }
}
