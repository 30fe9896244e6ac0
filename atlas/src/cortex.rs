//! The reasoning node: builds Cortex's bounded input context, invokes the
//! oracle, validates/normalizes its output, and retries on malformed
//! responses before falling back deterministically.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::config::AtlasConfig;
use crate::findings::Finding;
use crate::http::HttpClient;
use crate::llm::{strip_code_fence, CortexInput, CortexOracle, RawCortexOutput};
use crate::state::{Action, Decision, DecisionEntry, ReasoningEntry, RunState};

const MAX_RECENT_OBSERVATIONS: usize = 8;
const MAX_TOP_CANDIDATES: usize = 15;
const MAX_RECENT_ERRORS: usize = 5;
const MAX_RECENT_DECISIONS: usize = 5;
const MAX_PATH_STATS_SUMMARY: usize = 10;
const MAX_RETRY_ATTEMPTS: u32 = 2;

/// The owasp category used when Cortex exhausts its retries.
const FALLBACK_OWASP: &str = "A05:2021-Security Misconfiguration";
const FALLBACK_CONFIDENCE: f64 = 0.2;

/// Build the compact input context Cortex reasons over for this hop.
#[must_use]
pub fn build_context(
    state: &RunState,
    config: &AtlasConfig,
    http: &HttpClient,
    findings: &[Finding],
) -> CortexInput {
    let recent_observations = state
        .observations
        .iter()
        .rev()
        .take(MAX_RECENT_OBSERVATIONS)
        .rev()
        .map(|o| {
            json!({
                "id": o.id, "tool": o.tool, "url": o.url, "status": o.status,
                "note": o.note,
            })
        })
        .collect();

    let mut scored: Vec<_> = state
        .candidates
        .iter()
        .map(|p| {
            let scored = crate::frontier::score_path(Some(p), state, config.max_hits_per_path);
            (scored.score, p.clone())
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    let top_candidates = scored
        .into_iter()
        .take(MAX_TOP_CANDIDATES)
        .map(|(score, path)| json!({ "path": path, "score": score }))
        .collect();

    let findings_snapshot = findings
        .iter()
        .map(|f| json!({ "type": f.finding_type, "path": f.path, "owasp": f.owasp }))
        .collect();

    let recent_errors = state
        .metrics
        .errors
        .iter()
        .rev()
        .take(MAX_RECENT_ERRORS)
        .rev()
        .map(|e| json!({ "tool": e.tool, "path": e.path, "message": e.message }))
        .collect();

    let recent_decisions = state
        .decisions
        .iter()
        .rev()
        .take(MAX_RECENT_DECISIONS)
        .rev()
        .map(|d| json!({ "decision": d.decision, "used_fallback": d.used_fallback }))
        .collect();

    let mut stats: Vec<_> = state.path_stats.iter().collect();
    stats.sort_by(|a, b| b.1.hits.cmp(&a.1.hits));
    let path_stats_summary = stats
        .into_iter()
        .take(MAX_PATH_STATS_SUMMARY)
        .map(|(path, stat)| {
            json!({ "path": path, "hits": stat.hits, "last_status": stat.last_status })
        })
        .collect();

    CortexInput {
        recent_observations,
        remaining_budget: config.max_req_per_run.saturating_sub(state.metrics.requests),
        remaining_hops: config.max_hops.saturating_sub(state.hops),
        visited_paths: state.visited_paths.clone(),
        top_candidates,
        findings_snapshot,
        session_state: http.session_state(),
        recent_errors,
        recent_decisions,
        path_stats_summary,
        captcha: state.captcha.clone(),
    }
}

/// Parse and schema-validate one oracle response. Rejects any shape that
/// does not carry a recognized `decision` and, for `probe`, at least a
/// resolvable action batch.
fn validate(raw: &str) -> crate::error::Result<RawCortexOutput> {
    let cleaned = strip_code_fence(raw);
    let parsed: RawCortexOutput = serde_json::from_str(cleaned)?;

    if !matches!(parsed.decision.as_str(), "probe" | "report" | "continue") {
        return Err(crate::error::AtlasError::SchemaValidation {
            message: format!("unrecognized decision: {}", parsed.decision),
        });
    }
    if !(0.0..=1.0).contains(&parsed.confidence_0_1) {
        return Err(crate::error::AtlasError::SchemaValidation {
            message: "confidence_0_1 out of [0, 1]".into(),
        });
    }
    Ok(parsed)
}

/// Call `oracle` with `input`, retrying up to [`MAX_RETRY_ATTEMPTS`] times
/// on parse/validation failure, then run the hop's full protocol: persist
/// a [`ReasoningEntry`] and [`DecisionEntry`], and stage `next_actions`.
pub async fn run(
    state: &mut RunState,
    oracle: &Arc<dyn CortexOracle>,
    findings: &[Finding],
    config: &AtlasConfig,
    http: &HttpClient,
) -> crate::error::Result<()> {
    let now = Utc::now();

    // No credential configured: terminate deterministically after one hop.
    if oracle.model_id().is_none() {
        state.decision = Decision::Report;
        state.next_actions.clear();
        state.reasoning_log.push(ReasoningEntry {
            thought: "no LLM credential configured; terminating after initial probe".into(),
            hypothesis: "unable to reason without a configured model".into(),
            owasp_category: FALLBACK_OWASP.into(),
            confidence_0_1: FALLBACK_CONFIDENCE,
            observation_ref: None,
            timestamp: now,
        });
        state.decisions.push(DecisionEntry {
            attempts: 0,
            used_fallback: true,
            model: None,
            error: None,
            decision: Decision::Report,
            timestamp: now,
        });
        return Ok(());
    }

    let input = build_context(state, config, http, findings);

    let mut attempts = 0u32;
    let mut last_error: Option<String> = None;
    let mut parsed: Option<RawCortexOutput> = None;

    while attempts < MAX_RETRY_ATTEMPTS {
        attempts += 1;
        match oracle.complete(&input).await {
            Ok(raw) => match validate(&raw) {
                Ok(output) => {
                    parsed = Some(output);
                    break;
                }
                Err(e) => last_error = Some(e.to_string()),
            },
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    let Some(output) = parsed else {
        state.decision = Decision::Report;
        state.next_actions.clear();
        state.reasoning_log.push(ReasoningEntry {
            thought: "reasoning call did not yield a valid response within the retry budget"
                .into(),
            hypothesis: "treating the run as exhausted".into(),
            owasp_category: FALLBACK_OWASP.into(),
            confidence_0_1: FALLBACK_CONFIDENCE,
            observation_ref: None,
            timestamp: now,
        });
        state.decisions.push(DecisionEntry {
            attempts,
            used_fallback: true,
            model: oracle.model_id().map(str::to_owned),
            error: last_error,
            decision: Decision::Report,
            timestamp: now,
        });
        return Ok(());
    };

    let decision = if output.decision == "report" {
        Decision::Report
    } else {
        Decision::Probe
    };

    let mut next_actions: Vec<Action> = output.next_actions;
    if next_actions.is_empty() {
        if let Some(legacy) = output.next_tool {
            next_actions.push(legacy);
        }
    }

    state.decision = decision;
    state.next_actions = if decision == Decision::Probe {
        next_actions
    } else {
        Vec::new()
    };
    state.reasoning_log.push(ReasoningEntry {
        thought: output.thought,
        hypothesis: output.hypothesis,
        owasp_category: output.owasp_category.into_first(),
        confidence_0_1: output.confidence_0_1,
        observation_ref: output.observation_ref,
        timestamp: now,
    });
    state.decisions.push(DecisionEntry {
        attempts,
        used_fallback: false,
        model: oracle.model_id().map(str::to_owned),
        error: None,
        decision,
        timestamp: now,
    });

    Ok(())
}
