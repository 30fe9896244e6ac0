//! Cortex's LLM oracle: a schema-validated, retry/fallback reasoning call.
//!
//! The engine treats the LLM as an opaque JSON-returning oracle; this
//! module owns only the boundary — building a compact prompt from
//! `CortexInput`, invoking the provider, and returning its raw response
//! text. Schema enforcement, parsing into [`RawCortexOutput`], and
//! retry/fallback all live in [`crate::cortex`].

use async_trait::async_trait;
use schemars::schema_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AtlasError, Result};
use crate::state::{Action, Captcha};

/// The bounded, derived context Cortex reasons over each hop.
#[derive(Debug, Clone, Serialize)]
pub struct CortexInput {
    /// Last 5-8 observations, most recent last.
    pub recent_observations: Vec<Value>,
    /// Requests remaining against `MAX_REQ_PER_RUN`.
    pub remaining_budget: u32,
    /// Hops remaining against `MAX_HOPS`.
    pub remaining_hops: u32,
    /// Every path touched at least once.
    pub visited_paths: Vec<String>,
    /// Up to 15 top-scored unexplored candidates.
    pub top_candidates: Vec<Value>,
    /// Current findings snapshot: `{type, path, owasp}` entries.
    pub findings_snapshot: Vec<Value>,
    /// Cookie names currently held, per [`crate::http::HttpClient::session_state`].
    pub session_state: Vec<String>,
    /// Last 5 dispatch errors.
    pub recent_errors: Vec<Value>,
    /// Last 5 decisions.
    pub recent_decisions: Vec<Value>,
    /// Top 10 paths by hit count.
    pub path_stats_summary: Vec<Value>,
    /// The most recently fetched captcha, if any.
    pub captcha: Option<Captcha>,
}

/// The raw, not-yet-normalized shape returned by the oracle, pre-validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCortexOutput {
    /// `"probe" | "report" | "continue"`.
    pub decision: String,
    /// Required when `decision == "probe"`.
    #[serde(default)]
    pub next_actions: Vec<Action>,
    /// A legacy single-tool field some providers still emit.
    pub next_tool: Option<Action>,
    pub thought: String,
    pub hypothesis: String,
    pub owasp_category: OwaspCategory,
    pub confidence_0_1: f64,
    pub observation_ref: Option<String>,
}

/// `owasp_category` may arrive as a bare string or an array; the first
/// element of an array wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OwaspCategory {
    /// A single category label.
    Single(String),
    /// An array of labels; only the first is kept.
    Multiple(Vec<String>),
}

impl OwaspCategory {
    /// Collapse to a single label.
    #[must_use]
    pub fn into_first(self) -> String {
        match self {
            Self::Single(s) => s,
            Self::Multiple(mut v) => {
                if v.is_empty() {
                    String::new()
                } else {
                    v.remove(0)
                }
            }
        }
    }
}

/// An abstract reasoning provider. The engine only ever holds an
/// `Arc<dyn CortexOracle>`, so tests can substitute a scripted double.
#[async_trait]
pub trait CortexOracle: Send + Sync {
    /// Invoke the model with `input` and return its raw, unparsed response
    /// text. Parsing and schema validation happen one layer up in
    /// [`crate::cortex`] so retries can reuse the same oracle call.
    async fn complete(&self, input: &CortexInput) -> Result<String>;

    /// The model identifier to record in `llmMeta`, if known.
    fn model_id(&self) -> Option<&str> {
        None
    }
}

const SYSTEM_PROMPT: &str = "You are Cortex, the reasoning node of a bounded web reconnaissance \
agent. You select observational actions only; never synthesize exploit payloads or attempt \
authenticated brute force. Every claim must cite an observation_ref drawn from the provided \
context, or null if none applies. Respond with a single JSON object matching the documented \
schema and nothing else.";

/// Render the system prompt with the JSON Schema of one staged [`Action`]
/// appended, so the model sees the exact contract `next_actions` entries
/// must satisfy.
fn system_prompt_with_schema() -> String {
    let schema = serde_json::to_string(&schema_for!(Action)).unwrap_or_default();
    format!("{SYSTEM_PROMPT}\n\nEach entry of next_actions must validate against this JSON Schema:\n{schema}")
}

/// An OpenAI Chat Completions-compatible oracle.
#[derive(Debug, Clone)]
pub struct OpenAiOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiOracle {
    /// Build an oracle targeting `base_url` (OpenAI's API by default) with
    /// the given credential and model.
    #[must_use]
    pub fn new(api_key: String, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_owned(),
            api_key,
            model: model.into(),
        }
    }

    fn build_request_body(&self, input: &CortexInput) -> Value {
        serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system_prompt_with_schema() },
                { "role": "user", "content": serde_json::to_string(input).unwrap_or_default() },
            ],
        })
    }
}

#[async_trait]
impl CortexOracle for OpenAiOracle {
    async fn complete(&self, input: &CortexInput) -> Result<String> {
        let body = self.build_request_body(input);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AtlasError::LlmProvider {
                message: format!("provider returned {status}: {text}"),
            });
        }

        let json: Value = response.json().await?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AtlasError::LlmProvider {
                message: "response had no message content".into(),
            })?;
        Ok(content.to_owned())
    }

    fn model_id(&self) -> Option<&str> {
        Some(&self.model)
    }
}

/// The oracle used when no LLM credential is configured. Its `model_id` is
/// always `None`, which [`crate::cortex`] treats as a signal to terminate
/// the run after one hop without issuing a call.
#[derive(Debug, Clone, Default)]
pub struct StubOracle;

#[async_trait]
impl CortexOracle for StubOracle {
    async fn complete(&self, _input: &CortexInput) -> Result<String> {
        Err(AtlasError::LlmProvider {
            message: "StubOracle has no backing provider; it must never be called directly"
                .into(),
        })
    }
}

/// Strip a leading/trailing Markdown code fence from `raw`, if present.
#[must_use]
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let after_open = after_open
        .strip_prefix("json")
        .unwrap_or(after_open)
        .trim_start_matches('\n');
    after_open.strip_suffix("```").unwrap_or(after_open).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_removes_json_fence() {
        let raw = "```json\n{\"decision\":\"report\"}\n```";
        assert_eq!(strip_code_fence(raw), "{\"decision\":\"report\"}");
    }

    #[test]
    fn strip_code_fence_is_noop_on_bare_json() {
        let raw = "{\"decision\":\"report\"}";
        assert_eq!(strip_code_fence(raw), raw);
    }

    #[test]
    fn system_prompt_embeds_action_schema() {
        let prompt = system_prompt_with_schema();
        assert!(prompt.contains("next_actions"));
        assert!(prompt.contains("\"tool\""));
    }

    #[test]
    fn owasp_category_collapses_array_to_first() {
        let multi = OwaspCategory::Multiple(vec!["A05:2021".into(), "A01:2021".into()]);
        assert_eq!(multi.into_first(), "A05:2021");
    }
}
