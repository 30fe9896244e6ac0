//! The graph driver: wires Probe, Cortex, and Router into the cyclic hop
//! loop and produces the final [`TraceReport`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};

use crate::config::AtlasConfig;
use crate::error::Result;
use crate::frontier::diversity_override;
use crate::http::HttpClient;
use crate::llm::CortexOracle;
use crate::state::{generate_run_id, Action, ActionArgs, RunState};
use crate::trace::TraceReport;
use crate::{cortex, findings, probe, router};

/// Run one complete ATLAS reconnaissance session against `config.target_url`
/// using `oracle` as Cortex's reasoning provider. Always returns a
/// [`TraceReport`]; the only way this returns `Err` is a fatal Reporter
/// I/O failure, per the documented error taxonomy.
pub async fn run_once(config: &AtlasConfig, oracle: Arc<dyn CortexOracle>) -> Result<TraceReport> {
    let started_at = Utc::now();
    let run_id = generate_run_id(started_at);
    let mut state = RunState::new(run_id.clone());

    let http = HttpClient::new(
        config.target_url.clone(),
        std::time::Duration::from_millis(config.req_timeout_ms),
        config.body_snippet_bytes,
    );

    // Seed the frontier with the target root so the very first hop has
    // something to probe.
    state.candidates.push("/".to_owned());

    info!(run_id = %run_id, target = %config.target_url, "starting run");

    let stop_reason = loop {
        let hop_span = info_span!("hop", hop = state.hops);
        async {
            stage_actions(&mut state);
            probe::dispatch_batch(&mut state, config, &http).await?;

            let current_findings = findings::extract(&state.observations);
            cortex::run(&mut state, &oracle, &current_findings, config, &http).await?;

            Ok::<(), crate::error::AtlasError>(())
        }
        .instrument(hop_span)
        .await?;

        match router::route(&state, config) {
            router::Route::Probe => continue,
            router::Route::Report(reason) => break reason,
        }
    };
    state.stop_reason = Some(stop_reason);

    let finished_at = Utc::now();
    info!(run_id = %run_id, ?stop_reason, hops = state.hops, "run complete");

    Ok(TraceReport::build(
        &state,
        config.target_url.as_str(),
        started_at,
        finished_at,
        config.max_req_per_run,
        stop_reason,
    ))
}

/// Stage `state.next_actions` for this hop, applying diversity enforcement
/// on top of whatever Cortex (or the initial seed) already staged.
fn stage_actions(state: &mut RunState) {
    if let Some((tool, path)) = diversity_override(
        state,
        crate::config::DIVERSITY_INTERVAL,
        &crate::config::REQUIRED_DIVERSITY_TOOLS,
    ) {
        warn!(%tool, %path, "diversity enforcement overriding tool choice");
        state.next_actions = vec![Action {
            tool,
            args: ActionArgs {
                path: Some(path),
                ..Default::default()
            },
            rationale: "diversity enforcement".into(),
        }];
        return;
    }

    if state.next_actions.is_empty() && state.hops == 0 {
        state.next_actions = vec![Action {
            tool: "http_get".into(),
            args: ActionArgs {
                path: Some("/".to_owned()),
                ..Default::default()
            },
            rationale: "initial fingerprint".into(),
        }];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubOracle;
    use httpmock::prelude::*;
    use url::Url;

    fn config(target: &str) -> AtlasConfig {
        AtlasConfig {
            target_url: Url::parse(target).unwrap(),
            openai_api_key: None,
            max_req_per_run: 10,
            max_hops: 5,
            req_timeout_ms: 2000,
            max_hits_per_path: 2,
            body_snippet_bytes: 2000,
            wait_for_target_ms: 0,
            wait_for_target_interval_ms: 1000,
        }
    }

    #[tokio::test]
    async fn no_credential_run_terminates_after_one_hop() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(200).body("");
        });

        let cfg = config(&server.base_url());
        let report = run_once(&cfg, Arc::new(StubOracle)).await.unwrap();

        assert_eq!(report.hops, 1);
        assert_eq!(
            report.stop_reason,
            crate::state::StopReason::DecisionReport
        );
        assert_eq!(report.nodes_visited, vec!["probe", "cortex", "report"]);
    }
}
