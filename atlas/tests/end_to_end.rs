//! End-to-end scenarios against a mocked target and a scripted oracle.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use atlas::llm::{CortexInput, CortexOracle};
use atlas::state::StopReason;
use atlas::{run_once, AtlasConfig};
use httpmock::prelude::*;
use serde_json::json;
use url::Url;

fn config(target: &str) -> AtlasConfig {
    AtlasConfig {
        target_url: Url::parse(target).unwrap(),
        openai_api_key: Some("test-key".into()),
        max_req_per_run: 80,
        max_hops: 40,
        req_timeout_ms: 2000,
        max_hits_per_path: 2,
        body_snippet_bytes: 2000,
        wait_for_target_ms: 0,
        wait_for_target_interval_ms: 1000,
    }
}

/// An oracle that plays back a fixed script of responses, one per call,
/// repeating the final entry once exhausted.
struct ScriptedOracle {
    script: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    fn new(script: Vec<String>) -> Self {
        Self {
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl CortexOracle for ScriptedOracle {
    async fn complete(&self, _input: &CortexInput) -> atlas::Result<String> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            Ok(script.remove(0))
        } else {
            Ok(script[0].clone())
        }
    }

    fn model_id(&self) -> Option<&str> {
        Some("scripted")
    }
}

fn probe_then_report(tool: &str, path: &str) -> Vec<String> {
    vec![
        json!({
            "decision": "probe",
            "next_actions": [{ "tool": tool, "args": { "path": path }, "rationale": "scan" }],
            "thought": "probing", "hypothesis": "checking surface",
            "owasp_category": "A05:2021-Security Misconfiguration",
            "confidence_0_1": 0.5, "observation_ref": null,
        })
        .to_string(),
        json!({
            "decision": "report",
            "next_actions": [],
            "thought": "done", "hypothesis": "sufficient evidence gathered",
            "owasp_category": "A05:2021-Security Misconfiguration",
            "confidence_0_1": 0.6, "observation_ref": null,
        })
        .to_string(),
    ]
}

#[tokio::test]
async fn missing_security_headers_are_found() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).body("");
    });

    let cfg = config(&server.base_url());
    let oracle = Arc::new(ScriptedOracle::new(probe_then_report("inspect_headers", "/")));
    let report = run_once(&cfg, oracle).await.unwrap();

    assert!(report.findings.iter().any(|f| f.subtype == "missing_hsts"));
    assert!(report.findings.iter().any(|f| f.subtype == "missing_csp"));
    assert_eq!(report.summary.tool_usage.get("inspect_headers"), Some(&1));
}

#[tokio::test]
async fn stack_trace_on_server_error_is_found() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/x");
        then.status(500)
            .header("content-type", "application/json")
            .body(r#"{"error":{"stack":"Error: boom at handler"}}"#);
    });

    let cfg = config(&server.base_url());
    let oracle = Arc::new(ScriptedOracle::new(probe_then_report("provoke_error", "/api/x")));
    let report = run_once(&cfg, oracle).await.unwrap();

    let finding = report
        .findings
        .iter()
        .find(|f| f.subtype == "stack_trace")
        .expect("expected a stack_trace finding");
    assert_eq!(finding.path, "/api/x");
    assert_eq!(finding.owasp, "A05:2021-Security Misconfiguration");
}

#[tokio::test]
async fn cors_wildcard_deduped_across_two_paths() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/a");
        then.status(200)
            .header("access-control-allow-origin", "*")
            .body("");
    });
    server.mock(|when, then| {
        when.method(GET).path("/b");
        then.status(200)
            .header("access-control-allow-origin", "*")
            .body("");
    });

    let cfg = config(&server.base_url());
    let script = vec![
        json!({
            "decision": "probe",
            "next_actions": [{ "tool": "http_get", "args": { "path": "/a" }, "rationale": "scan" }],
            "thought": "t", "hypothesis": "h",
            "owasp_category": "A05:2021-Security Misconfiguration",
            "confidence_0_1": 0.5, "observation_ref": null,
        })
        .to_string(),
        json!({
            "decision": "probe",
            "next_actions": [{ "tool": "http_get", "args": { "path": "/b" }, "rationale": "scan" }],
            "thought": "t", "hypothesis": "h",
            "owasp_category": "A05:2021-Security Misconfiguration",
            "confidence_0_1": 0.5, "observation_ref": null,
        })
        .to_string(),
        json!({
            "decision": "report",
            "next_actions": [],
            "thought": "t", "hypothesis": "h",
            "owasp_category": "A05:2021-Security Misconfiguration",
            "confidence_0_1": 0.5, "observation_ref": null,
        })
        .to_string(),
    ];
    let oracle = Arc::new(ScriptedOracle::new(script));
    let report = run_once(&cfg, oracle).await.unwrap();

    assert_eq!(
        report
            .findings
            .iter()
            .filter(|f| f.subtype == "cors_wildcard")
            .count(),
        1
    );
}

#[tokio::test]
async fn budget_exhaustion_stops_the_run() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET);
        then.status(200).body("");
    });

    let mut cfg = config(&server.base_url());
    cfg.max_req_per_run = 3;

    // A script that always asks for another GET, against distinct paths so
    // each hop consumes a fresh request.
    let always_probe = (0..10)
        .map(|i| {
            json!({
                "decision": "probe",
                "next_actions": [{ "tool": "http_get", "args": { "path": format!("/p{i}") }, "rationale": "scan" }],
                "thought": "t", "hypothesis": "h",
                "owasp_category": "A05:2021-Security Misconfiguration",
                "confidence_0_1": 0.5, "observation_ref": null,
            })
            .to_string()
        })
        .collect();
    let oracle = Arc::new(ScriptedOracle::new(always_probe));
    let report = run_once(&cfg, oracle).await.unwrap();

    assert_eq!(report.stop_reason, StopReason::BudgetExhausted);
    assert!(report.metrics.requests <= 3 + 5 - 1);
}

#[tokio::test]
async fn diversity_enforcement_forces_header_and_error_tools() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET);
        then.status(200).body("<a href=\"/x\">x</a>");
    });
    server.mock(|when, then| {
        when.method(POST);
        then.status(400).body("");
    });

    let mut cfg = config(&server.base_url());
    cfg.max_hops = 8;

    // The oracle only ever asks for http_get; diversity enforcement must
    // override by hop 5 and 6 with inspect_headers/provoke_error.
    let always_http_get: Vec<String> = (0..20)
        .map(|_| {
            json!({
                "decision": "probe",
                "next_actions": [{ "tool": "http_get", "args": { "path": "/" }, "rationale": "scan" }],
                "thought": "t", "hypothesis": "h",
                "owasp_category": "A05:2021-Security Misconfiguration",
                "confidence_0_1": 0.5, "observation_ref": null,
            })
            .to_string()
        })
        .collect();
    let oracle = Arc::new(ScriptedOracle::new(always_http_get));
    let report = run_once(&cfg, oracle).await.unwrap();

    assert!(report.summary.tool_usage.get("inspect_headers").copied().unwrap_or(0) >= 1);
    assert!(report.summary.tool_usage.get("provoke_error").copied().unwrap_or(0) >= 1);
}

#[tokio::test]
async fn invalid_json_retries_then_falls_back_with_trace() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).body("");
    });

    let cfg = config(&server.base_url());
    let oracle = Arc::new(ScriptedOracle::new(vec![
        "not json at all".to_owned(),
        "{ still not valid".to_owned(),
    ]));
    let report = run_once(&cfg, oracle).await.unwrap();

    assert_eq!(report.stop_reason, StopReason::DecisionReport);
    assert!(report.llm_meta.as_ref().unwrap().used_fallback);
    assert_eq!(report.nodes_visited, vec!["probe", "cortex", "report"]);
}
