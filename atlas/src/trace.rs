//! The trace artifact: the complete record of one run, written as pretty
//! JSON to `traces/trace-<runId>.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};
use crate::findings::{owasp_summary, Finding, OwaspCount};
use crate::state::{
    BatchStats, DecisionEntry, Metrics, Observation, ReasoningEntry, RunState, StopReason,
};

/// Aggregate counts surfaced at the top of the trace for quick review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    /// Total findings after deduplication.
    pub findings_count: usize,
    /// OWASP histogram, sorted by descending count.
    pub owasp_categories: Vec<OwaspCount>,
    /// Per-tool usage, mirrors `RunState::tool_usage`.
    pub tool_usage: std::collections::HashMap<String, u32>,
    /// Batch counters.
    pub batch_stats: BatchStats,
    /// Hops in which no action succeeded.
    pub skipped_hops: u32,
}

/// The request budget summary in the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBudget {
    /// Requests issued.
    pub used: u32,
    /// Configured budget.
    pub max: u32,
}

/// The graph nodes a completed run always visits, in order.
#[must_use]
pub fn nodes_visited() -> Vec<&'static str> {
    vec!["probe", "cortex", "report"]
}

/// The complete artifact for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceReport {
    /// Opaque run identifier, also used in the output filename.
    #[serde(rename = "run_id")]
    pub run_id: String,
    /// The allowlisted target origin.
    pub target: String,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Aggregate summary counters.
    pub summary: TraceSummary,
    /// Deduplicated, OWASP-tagged findings.
    pub findings: Vec<Finding>,
    /// The full observation log.
    pub observations: Vec<Observation>,
    /// The full reasoning log.
    pub reasoning_log: Vec<ReasoningEntry>,
    /// Aggregate request/error counters.
    pub metrics: Metrics,
    /// Metadata about the final Cortex call.
    pub llm_meta: Option<DecisionEntry>,
    /// Per-hop decision log.
    pub decisions: Vec<DecisionEntry>,
    /// Completed hop count.
    pub hops: u32,
    /// Why the run terminated.
    pub stop_reason: StopReason,
    /// Every path touched at least once, in visitation order.
    pub visited_paths: Vec<String>,
    /// Request budget usage.
    pub request_budget: RequestBudget,
    /// The fixed node sequence every completed run visits.
    pub nodes_visited: Vec<&'static str>,
}

impl TraceReport {
    /// Assemble the final report from the terminal `state`. Panics never;
    /// a run without a `stop_reason` is a logic error in the caller
    /// (`engine::run_once` always sets one before calling this).
    #[must_use]
    pub fn build(
        state: &RunState,
        target: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        max_requests: u32,
        stop_reason: StopReason,
    ) -> Self {
        let findings = crate::findings::extract(&state.observations);
        let summary = TraceSummary {
            findings_count: findings.len(),
            owasp_categories: owasp_summary(&findings),
            tool_usage: state.tool_usage.clone(),
            batch_stats: state.batch_stats.clone(),
            skipped_hops: state.skipped_hops,
        };

        Self {
            run_id: state.run_id.clone(),
            target: target.to_owned(),
            started_at,
            finished_at,
            summary,
            findings,
            observations: state.observations.clone(),
            reasoning_log: state.reasoning_log.clone(),
            metrics: state.metrics.clone(),
            llm_meta: state.decisions.last().cloned(),
            decisions: state.decisions.clone(),
            hops: state.hops,
            stop_reason,
            visited_paths: state.visited_paths.clone(),
            request_budget: RequestBudget {
                used: state.metrics.requests,
                max: max_requests,
            },
            nodes_visited: nodes_visited(),
        }
    }
}

/// Write `report` as UTF-8 pretty JSON to `<traces_dir>/trace-<runId>.json`,
/// creating the directory if needed.
pub fn write_trace(report: &TraceReport, traces_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(traces_dir)
        .map_err(|e| AtlasError::Reporter(format!("creating traces directory: {e}")))?;

    let path = traces_dir.join(format!("trace-{}.json", report.run_id));
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| AtlasError::Reporter(format!("serializing trace: {e}")))?;
    std::fs::write(&path, json).map_err(|e| AtlasError::Reporter(format!("writing trace: {e}")))?;

    Ok(path)
}
