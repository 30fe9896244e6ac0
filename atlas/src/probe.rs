//! The Probe executor: turns a staged batch of actions into HTTP calls,
//! recording observations, metrics, path bookkeeping, and newly
//! discovered candidates.
//!
//! Path selection and budget reservation happen in a synchronous
//! pre-pass (the single-writer section); the actual HTTP calls for the
//! batch are then dispatched concurrently; a final sequential post-pass
//! applies their results back onto [`RunState`]. This keeps `RunState`
//! single-writer outside the concurrent I/O window without wrapping it
//! in a mutex.

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::AtlasConfig;
use crate::error::{AtlasError, Result};
use crate::frontier::{self, discover_candidates};
use crate::http::{HttpClient, HttpOutcome};
use crate::state::{Action, Captcha, ErrorEntry, Observation, PathStat, RunState};

const MALFORMED_JSON_BODY: &str = "{ bad: }";
const DEFAULT_CAPTCHA_PATH: &str = "/rest/captcha";

/// A single reserved HTTP request awaiting concurrent dispatch.
enum PlannedRequest {
    Get,
    PostJson(Value),
    PostRaw { body: String, content_type: String },
}

/// One action that survived path selection and budget reservation.
struct PlannedAction {
    tool: String,
    label: String,
    path: String,
    /// One request normally; two for `measure_timing` (control, test).
    requests: Vec<PlannedRequest>,
}

/// Outcome of a single action after its request(s) completed.
enum DispatchResult {
    Success {
        plan: PlannedAction,
        responses: Vec<HttpOutcome>,
    },
    Failure {
        tool: String,
        path: Option<String>,
        message: String,
    },
}

/// Dispatch the batch staged in `state.next_actions`. Mutates `state`
/// per the batch-level contract: increments `hops` and `batch_stats`
/// unconditionally, resets `consecutive_skips` on any success, otherwise
/// increments `skipped_hops` and `consecutive_skips`.
pub async fn dispatch_batch(
    state: &mut RunState,
    config: &AtlasConfig,
    http: &HttpClient,
) -> Result<()> {
    let actions = std::mem::take(&mut state.next_actions);
    let batch_len = actions.len();

    let span = info_span!("probe_batch", hop = state.hops, actions = batch_len);
    async {
        let mut planned = Vec::new();
        let mut pre_failures = Vec::new();

        // Pre-pass: path selection + budget reservation, single-writer.
        for action in actions {
            match plan_action(state, config, &action) {
                Ok(Some(plan)) => planned.push(plan),
                Ok(None) => {
                    debug!(tool = %action.tool, "skipped: no eligible path");
                }
                Err(e) => {
                    state.metrics.errors.push(ErrorEntry {
                        tool: action.tool.clone(),
                        path: action.args.path.clone(),
                        message: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    pre_failures.push(action.tool.clone());
                }
            }
        }

        // Concurrent dispatch of every planned action's request(s).
        let results = join_all(planned.into_iter().map(|plan| dispatch_one(http, plan))).await;

        // Post-pass: sequential application back onto RunState.
        let mut successes = 0usize;
        let mut failures = pre_failures.len();

        for result in results {
            match result {
                DispatchResult::Success { plan, responses } => {
                    apply_success(state, plan, responses, http.target());
                    successes += 1;
                }
                DispatchResult::Failure { tool, path, message } => {
                    warn!(%tool, ?path, %message, "dispatch failed");
                    state.metrics.errors.push(ErrorEntry {
                        tool,
                        path,
                        message,
                        timestamp: Utc::now(),
                    });
                    failures += 1;
                }
            }
        }

        if successes > 0 {
            state.consecutive_skips = 0;
        } else {
            state.skipped_hops += 1;
            state.consecutive_skips += 1;
        }
        state.hops += 1;
        state.batch_stats.total_batches += 1;
        state.batch_stats.total_actions += batch_len as u32;

        debug!(successes, failures, "batch complete");
        Ok(())
    }
    .instrument(span)
    .await
}

/// Request-count this tool consumes against the run budget.
fn request_cost(tool: &str) -> u32 {
    if tool == "measure_timing" {
        2
    } else {
        1
    }
}

/// Resolve the effective path and reserve budget/hit-count for one action.
/// Returns `Ok(None)` for a clean skip (no eligible path); `Err` for an
/// unknown tool or exhausted budget, which the caller records as an error.
fn plan_action(
    state: &mut RunState,
    config: &AtlasConfig,
    action: &Action,
) -> Result<Option<PlannedAction>> {
    if !config_contains_tool(&action.tool) {
        return Err(AtlasError::UnknownTool(action.tool.clone()));
    }

    let desired = if action.tool == "captcha_fetch" {
        Some(
            action
                .args
                .path
                .clone()
                .unwrap_or_else(|| DEFAULT_CAPTCHA_PATH.to_owned()),
        )
    } else {
        action.args.path.clone()
    };

    let Some(path) = frontier::choose_path(
        state,
        &action.tool,
        desired.as_deref(),
        config.max_hits_per_path,
    ) else {
        return Ok(None);
    };

    let cost = request_cost(&action.tool);
    if state.metrics.requests >= config.max_req_per_run {
        return Err(AtlasError::BudgetExceeded {
            used: state.metrics.requests,
            max: config.max_req_per_run,
        });
    }

    let requests = build_requests(state, &action.tool, action, &path)?;

    // Pre-issue bookkeeping.
    if !state.visited_paths.iter().any(|p| p == &path) {
        state.visited_paths.push(path.clone());
    }
    *state.path_hits.entry(path.clone()).or_insert(0) += 1;
    state.metrics.requests += cost;
    *state.metrics.per_tool.entry(action.tool.clone()).or_insert(0) += cost;
    *state.tool_usage.entry(action.tool.clone()).or_insert(0) += 1;

    Ok(Some(PlannedAction {
        tool: action.tool.clone(),
        label: action.args.label.clone().unwrap_or_else(|| action.tool.clone()),
        path,
        requests,
    }))
}

fn config_contains_tool(tool: &str) -> bool {
    crate::config::ALLOWED_TOOLS.contains(&tool)
}

fn build_requests(
    state: &RunState,
    tool: &str,
    action: &Action,
    path: &str,
) -> Result<Vec<PlannedRequest>> {
    match tool {
        "http_get" | "inspect_headers" => Ok(vec![PlannedRequest::Get]),
        "http_post" => {
            let mut body = action.args.body.clone().unwrap_or_else(|| json!({}));
            if path.contains("Feedbacks") {
                if let Some(captcha) = &state.captcha {
                    if let Value::Object(map) = &mut body {
                        map.insert("captchaId".into(), json!(captcha.captcha_id));
                        map.insert("captcha".into(), json!(captcha.captcha));
                    }
                }
            }
            Ok(vec![PlannedRequest::PostJson(body)])
        }
        "provoke_error" => Ok(vec![PlannedRequest::PostRaw {
            body: MALFORMED_JSON_BODY.to_owned(),
            content_type: "application/json".to_owned(),
        }]),
        "measure_timing" => {
            let control = action.args.control.clone().unwrap_or_else(|| json!({}));
            let test = action.args.test.clone().unwrap_or_else(|| json!({}));
            Ok(vec![
                PlannedRequest::PostJson(control),
                PlannedRequest::PostJson(test),
            ])
        }
        "captcha_fetch" => Ok(vec![PlannedRequest::Get]),
        other => Err(AtlasError::UnknownTool(other.to_owned())),
    }
}

async fn dispatch_one(http: &HttpClient, plan: PlannedAction) -> DispatchResult {
    let mut responses = Vec::with_capacity(plan.requests.len());
    for request in &plan.requests {
        let outcome = match request {
            PlannedRequest::Get => http.get(&plan.path, &[]).await,
            PlannedRequest::PostJson(body) => http.post_json(&plan.path, body).await,
            PlannedRequest::PostRaw { body, content_type } => {
                http.post_raw(&plan.path, body.clone(), content_type).await
            }
        };
        match outcome {
            Ok(outcome) => responses.push(outcome),
            Err(e) => {
                return DispatchResult::Failure {
                    tool: plan.tool,
                    path: Some(plan.path),
                    message: e.to_string(),
                }
            }
        }
    }
    DispatchResult::Success { plan, responses }
}

fn apply_success(
    state: &mut RunState,
    plan: PlannedAction,
    responses: Vec<HttpOutcome>,
    target_origin: &url::Url,
) {
    let now = Utc::now();
    let note = note_for(&plan.tool, &responses);
    let primary = responses.last().expect("at least one response per plan");

    let observation_id = RunState::new_observation_id(&plan.tool, now);
    let observation = Observation {
        id: observation_id.clone(),
        tool: plan.tool.clone(),
        label: plan.label.clone(),
        url: primary.url.clone(),
        method: primary.method.clone(),
        status: primary.status,
        headers: primary.headers.clone(),
        body_snippet: primary.body_snippet.clone(),
        latency_ms: primary.latency_ms,
        timestamp: now,
        note,
    };

    state.path_stats.insert(
        plan.path.clone(),
        PathStat {
            last_status: Some(primary.status),
            last_tool: plan.tool.clone(),
            last_observation_id: observation_id,
            hits: state.path_hits.get(&plan.path).copied().unwrap_or(0),
            last_at: now,
        },
    );

    if plan.tool == "http_get" {
        if let Ok(response_url) = url::Url::parse(&primary.url) {
            let discovered = discover_candidates(
                &primary.body_snippet,
                &response_url,
                target_origin,
                &state.candidates,
                &state.visited_paths,
            );
            state.candidates.extend(discovered);
        }
    }

    if plan.tool == "captcha_fetch" {
        if let Some(captcha) = parse_captcha(&primary.body_snippet) {
            state.captcha = Some(Captcha {
                fetched_at: now,
                ..captcha
            });
        }
    }

    state.observations.push(observation);
    state.last_action = Some(crate::state::LastAction {
        tool: plan.tool,
        path: plan.path,
    });
}

fn note_for(tool: &str, responses: &[HttpOutcome]) -> Option<String> {
    match tool {
        "inspect_headers" => Some("header audit".to_owned()),
        "provoke_error" => Some("malformed json".to_owned()),
        "measure_timing" => {
            let control_ms = responses.first().map(|r| r.latency_ms).unwrap_or(0);
            let test_ms = responses.get(1).map(|r| r.latency_ms).unwrap_or(0);
            let delta = test_ms as i64 - control_ms as i64;
            Some(format!(
                "control={control_ms}ms test={test_ms}ms delta={delta}ms"
            ))
        }
        _ => None,
    }
}

#[derive(serde::Deserialize)]
struct CaptchaIdBody {
    #[serde(rename = "captchaId")]
    captcha_id: Option<String>,
    id: Option<String>,
    captcha: Option<String>,
    answer: Option<String>,
}

fn parse_captcha(body: &str) -> Option<Captcha> {
    let parsed: CaptchaIdBody = serde_json::from_str(body).ok()?;
    let captcha_id = parsed.captcha_id.or(parsed.id)?;
    let captcha = parsed.captcha?;
    Some(Captcha {
        captcha_id,
        captcha,
        answer: parsed.answer,
        fetched_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ActionArgs, RunState};
    use std::time::Duration;
    use url::Url;

    fn config() -> AtlasConfig {
        AtlasConfig {
            target_url: Url::parse("http://target:3000").unwrap(),
            openai_api_key: None,
            max_req_per_run: 80,
            max_hops: 40,
            req_timeout_ms: 5000,
            max_hits_per_path: 2,
            body_snippet_bytes: 2000,
            wait_for_target_ms: 0,
            wait_for_target_interval_ms: 1000,
        }
    }

    #[test]
    fn request_cost_counts_measure_timing_as_two() {
        assert_eq!(request_cost("measure_timing"), 2);
        assert_eq!(request_cost("http_get"), 1);
    }

    #[test]
    fn plan_action_rejects_unknown_tool() {
        let mut state = RunState::new("r".into());
        let config = config();
        let action = Action {
            tool: "nuke".into(),
            args: ActionArgs::default(),
            rationale: String::new(),
        };
        let err = plan_action(&mut state, &config, &action).unwrap_err();
        assert!(matches!(err, AtlasError::UnknownTool(_)));
    }

    #[test]
    fn plan_action_reserves_budget_and_hits() {
        let mut state = RunState::new("r".into());
        let config = config();
        let action = Action {
            tool: "http_get".into(),
            args: ActionArgs {
                path: Some("/api/x".into()),
                ..Default::default()
            },
            rationale: String::new(),
        };
        let plan = plan_action(&mut state, &config, &action).unwrap().unwrap();
        assert_eq!(plan.path, "/api/x");
        assert_eq!(state.metrics.requests, 1);
        assert_eq!(state.path_hits.get("/api/x"), Some(&1));
    }

    #[test]
    fn plan_action_fails_fast_on_exhausted_budget() {
        let mut state = RunState::new("r".into());
        let mut config = config();
        config.max_req_per_run = 0;
        let action = Action {
            tool: "http_get".into(),
            args: ActionArgs {
                path: Some("/api/x".into()),
                ..Default::default()
            },
            rationale: String::new(),
        };
        let err = plan_action(&mut state, &config, &action).unwrap_err();
        assert!(matches!(err, AtlasError::BudgetExceeded { .. }));
    }

    #[test]
    fn parse_captcha_reads_alias_id_field() {
        let body = r#"{"id":"c1","captcha":"2+2","answer":"4"}"#;
        let c = parse_captcha(body).unwrap();
        assert_eq!(c.captcha_id, "c1");
        assert_eq!(c.answer.as_deref(), Some("4"));
    }

    #[test]
    fn parse_captcha_reads_documented_captcha_id_field() {
        let body = r#"{"captchaId":"c2","captcha":"3+3","answer":"6"}"#;
        let c = parse_captcha(body).unwrap();
        assert_eq!(c.captcha_id, "c2");
        assert_eq!(c.answer.as_deref(), Some("6"));
    }

    #[test]
    fn measure_timing_note_reports_delta() {
        let responses = vec![
            HttpOutcome {
                url: "http://t/x".into(),
                method: "POST".into(),
                status: 200,
                headers: Default::default(),
                body_snippet: String::new(),
                latency_ms: 10,
            },
            HttpOutcome {
                url: "http://t/x".into(),
                method: "POST".into(),
                status: 200,
                headers: Default::default(),
                body_snippet: String::new(),
                latency_ms: 40,
            },
        ];
        let note = note_for("measure_timing", &responses).unwrap();
        assert!(note.contains("delta=30ms"));
    }

    #[tokio::test]
    async fn dispatch_batch_increments_hops_on_empty_batch() {
        let mut state = RunState::new("r".into());
        let config = config();
        let http = HttpClient::new(config.target_url.clone(), Duration::from_millis(500), 2000);
        dispatch_batch(&mut state, &config, &http).await.unwrap();
        assert_eq!(state.hops, 1);
        assert_eq!(state.consecutive_skips, 1);
    }
}
