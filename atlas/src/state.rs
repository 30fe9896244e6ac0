//! The shared run state and its constituent record types.
//!
//! `RunState` is single-writer: the engine driver in [`crate::engine`] is
//! the only thing that mutates it, and only between the concurrent I/O of
//! a single [`crate::probe`] batch. Everything here derives `Serialize` so
//! the trace writer in [`crate::trace`] can emit it directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single immutable record of one HTTP exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// Opaque id of the form `tool-<epoch>-<rand>`.
    pub id: String,
    /// Tool that produced this observation.
    pub tool: String,
    /// Human-readable label (defaults to the tool name).
    pub label: String,
    /// Full URL requested.
    pub url: String,
    /// HTTP method used.
    pub method: String,
    /// HTTP status code returned.
    pub status: u16,
    /// Response headers, lower-cased keys.
    pub headers: HashMap<String, String>,
    /// Response body, truncated to `BODY_SNIPPET_BYTES`.
    pub body_snippet: String,
    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Server-side timestamp of when the observation was recorded.
    pub timestamp: DateTime<Utc>,
    /// Optional free-form annotation (e.g. "header audit", "malformed json").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One unit of Cortex's stated reasoning for a hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningEntry {
    /// Free-form thought text.
    pub thought: String,
    /// The hypothesis being tested.
    pub hypothesis: String,
    /// OWASP 2021 Top-10 category label.
    pub owasp_category: String,
    /// Confidence in `[0, 1]`.
    pub confidence_0_1: f64,
    /// Id of the observation this reasoning cites, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_ref: Option<String>,
    /// Server-side timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Metadata about one Cortex call, recorded once per hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEntry {
    /// Number of parse/validation attempts made (1 means first try succeeded).
    pub attempts: u32,
    /// Whether the deterministic fallback was used.
    pub used_fallback: bool,
    /// Model identifier used, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Error message recorded on fallback, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The normalized decision for this hop.
    pub decision: Decision,
    /// Server-side timestamp.
    pub timestamp: DateTime<Utc>,
}

/// The terminal/continue decision Cortex (or its fallback) produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Continue probing.
    Probe,
    /// Stop and hand off to the findings extractor / reporter.
    Report,
}

/// Arguments accompanying an [`Action`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ActionArgs {
    /// The LLM-suggested path; the Path Frontier resolves the effective one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Optional human-readable label for the resulting observation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Optional JSON body for `http_post`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Optional control body for `measure_timing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<Value>,
    /// Optional test body for `measure_timing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<Value>,
}

/// A single batched action selected by Cortex (or the diversity override).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Action {
    /// Tool to dispatch; must be in [`crate::config::ALLOWED_TOOLS`].
    pub tool: String,
    /// Arguments for the tool.
    #[serde(default)]
    pub args: ActionArgs,
    /// Cortex's stated rationale for choosing this action.
    #[serde(default)]
    pub rationale: String,
}

/// Severity of a derived [`Finding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
}

/// A deterministically-derived, deduplicated security signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Coarse finding type (mirrors the subtype today; kept distinct for
    /// forward-compatibility with grouped finding types).
    #[serde(rename = "type")]
    pub finding_type: String,
    /// Fine-grained subtype, e.g. `stack_trace`.
    pub subtype: String,
    /// Severity tier.
    pub severity: Severity,
    /// Path the finding pertains to.
    pub path: String,
    /// Short evidence string.
    pub evidence: String,
    /// OWASP 2021 Top-10 category label.
    pub owasp: String,
    /// Id of the observation that triggered this finding.
    pub observation_id: String,
}

/// Last tool/path dispatched, used for anti-repeat selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastAction {
    /// Tool name.
    pub tool: String,
    /// Effective path.
    pub path: String,
}

/// Per-path bookkeeping updated after every dispatch against that path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathStat {
    /// Most recent HTTP status observed at this path.
    pub last_status: Option<u16>,
    /// Most recent tool dispatched against this path.
    pub last_tool: String,
    /// Id of the most recent observation recorded for this path.
    pub last_observation_id: String,
    /// Total dispatch count against this path.
    pub hits: u32,
    /// Timestamp of the most recent dispatch.
    pub last_at: DateTime<Utc>,
}

/// A recorded dispatch failure (transport or budget).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    /// Tool that failed.
    pub tool: String,
    /// Effective path, if one was resolved.
    pub path: Option<String>,
    /// Error message.
    pub message: String,
    /// Timestamp of the failure.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate request/error counters for the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Total HTTP requests issued so far.
    pub requests: u32,
    /// Per-tool request counts.
    pub per_tool: HashMap<String, u32>,
    /// Recorded dispatch errors.
    pub errors: Vec<ErrorEntry>,
}

/// Aggregate batch counters, separate from per-tool `Metrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    /// Number of batches dispatched.
    pub total_batches: u32,
    /// Total actions across all batches.
    pub total_actions: u32,
}

/// A CAPTCHA fetched via `captcha_fetch`, auto-injected into later POSTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Captcha {
    /// Server-assigned captcha id.
    pub captcha_id: String,
    /// The captcha challenge text/image reference.
    pub captcha: String,
    /// The (observational) answer, if the target leaked one.
    pub answer: Option<String>,
    /// When this captcha was fetched.
    pub fetched_at: DateTime<Utc>,
}

/// The reason a run terminated; set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `hops >= MAX_HOPS`.
    MaxHops,
    /// `metrics.requests >= MAX_REQ_PER_RUN`.
    BudgetExhausted,
    /// `consecutiveSkips >= 3`.
    NoValidPaths,
    /// Cortex (or its fallback) returned `report`.
    DecisionReport,
}

/// The single shared, single-writer state of one ATLAS run.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Opaque timestamp-derived run identifier.
    pub run_id: String,
    /// Append-only observation log.
    pub observations: Vec<Observation>,
    /// Append-only reasoning log.
    pub reasoning_log: Vec<ReasoningEntry>,
    /// Append-only decision log, one entry per Cortex call.
    pub decisions: Vec<DecisionEntry>,
    /// Paths touched at least once, insertion order preserved.
    pub visited_paths: Vec<String>,
    /// Per-path hit counts, monotonic for the run.
    pub path_hits: HashMap<String, u32>,
    /// Per-path last-seen bookkeeping.
    pub path_stats: HashMap<String, PathStat>,
    /// Discovered-but-unexplored paths (the frontier).
    pub candidates: Vec<String>,
    /// Aggregate request/error counters.
    pub metrics: Metrics,
    /// Per-tool usage counts, independent of `metrics.per_tool`; feeds
    /// diversity enforcement.
    pub tool_usage: HashMap<String, u32>,
    /// Completed hop count.
    pub hops: u32,
    /// Hops in which no action succeeded.
    pub skipped_hops: u32,
    /// Consecutive hops with zero successes.
    pub consecutive_skips: u32,
    /// Aggregate batch counters.
    pub batch_stats: BatchStats,
    /// Current terminal flag.
    pub decision: Decision,
    /// Set exactly once on termination.
    pub stop_reason: Option<StopReason>,
    /// Most recently fetched CAPTCHA, if any.
    pub captcha: Option<Captcha>,
    /// Last dispatched tool/path, for anti-repeat selection.
    pub last_action: Option<LastAction>,
    /// Batch staged by the most recent Cortex call.
    pub next_actions: Vec<Action>,
}

impl RunState {
    /// Construct a fresh `RunState` for a new run.
    #[must_use]
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            observations: Vec::new(),
            reasoning_log: Vec::new(),
            decisions: Vec::new(),
            visited_paths: Vec::new(),
            path_hits: HashMap::new(),
            path_stats: HashMap::new(),
            candidates: Vec::new(),
            metrics: Metrics::default(),
            tool_usage: HashMap::new(),
            hops: 0,
            skipped_hops: 0,
            consecutive_skips: 0,
            batch_stats: BatchStats::default(),
            decision: Decision::Probe,
            stop_reason: None,
            captcha: None,
            last_action: None,
            next_actions: Vec::new(),
        }
    }

    /// Generate a fresh observation id of the form `tool-<epoch_ms>-<rand>`.
    #[must_use]
    pub fn new_observation_id(tool: &str, now: DateTime<Utc>) -> String {
        format!(
            "{tool}-{}-{:06x}",
            now.timestamp_millis(),
            fastrand::u32(..0x0100_0000)
        )
    }

    /// Whether `path` has remaining hit budget under `max_hits_per_path`.
    #[must_use]
    pub fn hits_remaining(&self, path: &str, max_hits_per_path: u32) -> bool {
        self.path_hits.get(path).copied().unwrap_or(0) < max_hits_per_path
    }
}

/// Generate the run id used for the trace filename: an opaque,
/// timestamp-derived identifier.
#[must_use]
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    format!("{}-{:04x}", now.timestamp_millis(), fastrand::u16(..))
}
