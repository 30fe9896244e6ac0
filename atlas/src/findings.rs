//! Deterministic derivation of deduplicated, OWASP-tagged findings from
//! accumulated observations. A pure function of the observation log: run
//! it twice against the same input and get the same output.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::state::{Observation, Severity};

/// Re-exported so callers can refer to `findings::Finding` without also
/// importing [`crate::state`].
pub use crate::state::Finding;

#[derive(Debug, Deserialize)]
struct StackField {
    stack: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<StackField>,
}

fn body_has_stack_field(body: &str) -> bool {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if parsed.error.and_then(|e| e.stack).is_some() {
            return true;
        }
    }
    body.contains("\"stack\"")
}

fn extract_one(observation: &Observation, seen: &HashSet<String>) -> Vec<Finding> {
    let mut found = Vec::new();

    if observation.status >= 500 && body_has_stack_field(&observation.body_snippet) {
        let key = format!("stack_trace:{}", path_of(&observation.url));
        if !seen.contains(&key) {
            found.push(Finding {
                finding_type: "stack_trace".into(),
                subtype: "stack_trace".into(),
                severity: Severity::Medium,
                path: path_of(&observation.url),
                evidence: "response included a stack trace on a server error".into(),
                owasp: "A05:2021-Security Misconfiguration".into(),
                observation_id: observation.id.clone(),
            });
        }
    }

    if observation
        .headers
        .get("access-control-allow-origin")
        .is_some_and(|v| v == "*")
    {
        let key = "cors_wildcard".to_owned();
        if !seen.contains(&key) {
            found.push(Finding {
                finding_type: "cors_wildcard".into(),
                subtype: "cors_wildcard".into(),
                severity: Severity::Low,
                path: path_of(&observation.url),
                evidence: "Access-Control-Allow-Origin: *".into(),
                owasp: "A05:2021-Security Misconfiguration".into(),
                observation_id: observation.id.clone(),
            });
        }
    }

    if !observation.headers.contains_key("strict-transport-security") {
        let key = "missing_hsts".to_owned();
        if !seen.contains(&key) {
            found.push(Finding {
                finding_type: "missing_hsts".into(),
                subtype: "missing_hsts".into(),
                severity: Severity::Low,
                path: path_of(&observation.url),
                evidence: "no Strict-Transport-Security header".into(),
                owasp: "A05:2021-Security Misconfiguration".into(),
                observation_id: observation.id.clone(),
            });
        }
    }

    if !observation.headers.contains_key("content-security-policy") {
        let key = "missing_csp".to_owned();
        if !seen.contains(&key) {
            found.push(Finding {
                finding_type: "missing_csp".into(),
                subtype: "missing_csp".into(),
                severity: Severity::Low,
                path: path_of(&observation.url),
                evidence: "no Content-Security-Policy header".into(),
                owasp: "A05:2021-Security Misconfiguration".into(),
                observation_id: observation.id.clone(),
            });
        }
    }

    if observation.status == 401 && observation.body_snippet.contains("UnauthorizedError") {
        let key = format!("auth_disclosure:{}", path_of(&observation.url));
        if !seen.contains(&key) {
            found.push(Finding {
                finding_type: "auth_error_details".into(),
                subtype: "auth_error_details".into(),
                severity: Severity::Low,
                path: path_of(&observation.url),
                evidence: "401 response exposed UnauthorizedError detail".into(),
                owasp: "A01:2021-Broken Access Control".into(),
                observation_id: observation.id.clone(),
            });
        }
    }

    if observation.headers.contains_key("server") || observation.headers.contains_key("x-powered-by") {
        let key = "server_disclosure".to_owned();
        if !seen.contains(&key) {
            let banner = observation
                .headers
                .get("server")
                .or_else(|| observation.headers.get("x-powered-by"))
                .cloned()
                .unwrap_or_default();
            found.push(Finding {
                finding_type: "server_banner".into(),
                subtype: "server_banner".into(),
                severity: Severity::Info,
                path: path_of(&observation.url),
                evidence: banner,
                owasp: "A05:2021-Security Misconfiguration".into(),
                observation_id: observation.id.clone(),
            });
        }
    }

    found
}

/// Dedup key for a [`Finding`], mirroring the keys used during extraction.
fn dedup_key(finding: &Finding) -> String {
    match finding.subtype.as_str() {
        "stack_trace" => format!("stack_trace:{}", finding.path),
        "auth_error_details" => format!("auth_disclosure:{}", finding.path),
        other => other.to_owned(),
    }
}

fn path_of(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_owned())
        .unwrap_or_else(|_| url.to_owned())
}

/// Derive deduplicated findings from the full observation log, in
/// first-seen order. Calling this twice on the same observations yields
/// equal results.
#[must_use]
pub fn extract(observations: &[Observation]) -> Vec<Finding> {
    if observations.is_empty() {
        return Vec::new();
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut findings = Vec::new();

    for observation in observations {
        for finding in extract_one(observation, &seen) {
            seen.insert(dedup_key(&finding));
            findings.push(finding);
        }
    }

    findings
}

/// An `{category, count}` entry for the trace summary's OWASP histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwaspCount {
    /// The OWASP 2021 Top-10 category label.
    pub category: String,
    /// Number of findings tagged with this category.
    pub count: usize,
}

/// Summarize `findings` into an OWASP histogram sorted by descending count.
#[must_use]
pub fn owasp_summary(findings: &[Finding]) -> Vec<OwaspCount> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for finding in findings {
        if let Some(entry) = counts.iter_mut().find(|(cat, _)| *cat == finding.owasp) {
            entry.1 += 1;
        } else {
            counts.push((finding.owasp.clone(), 1));
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .map(|(category, count)| OwaspCount { category, count })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn observation(url: &str, status: u16, headers: &[(&str, &str)], body: &str) -> Observation {
        Observation {
            id: format!("http_get-{url}"),
            tool: "http_get".into(),
            label: "http_get".into(),
            url: url.into(),
            method: "GET".into(),
            status,
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<HashMap<_, _>>(),
            body_snippet: body.into(),
            latency_ms: 5,
            timestamp: chrono::Utc::now(),
            note: None,
        }
    }

    #[test]
    fn missing_headers_emitted_once_per_observation_set() {
        let observations = vec![observation("http://t/", 200, &[], "")];
        let findings = extract(&observations);
        assert!(findings.iter().any(|f| f.subtype == "missing_hsts"));
        assert!(findings.iter().any(|f| f.subtype == "missing_csp"));
    }

    #[test]
    fn stack_trace_detected_from_error_stack_field() {
        let observations = vec![observation(
            "http://t/api/x",
            500,
            &[],
            r#"{"error":{"stack":"Error: boom"}}"#,
        )];
        let findings = extract(&observations);
        let f = findings.iter().find(|f| f.subtype == "stack_trace").unwrap();
        assert_eq!(f.path, "/api/x");
        assert_eq!(f.severity, Severity::Medium);
        assert_eq!(f.owasp, "A05:2021-Security Misconfiguration");
    }

    #[test]
    fn cors_wildcard_deduped_across_paths() {
        let observations = vec![
            observation("http://t/a", 200, &[("access-control-allow-origin", "*")], ""),
            observation("http://t/b", 200, &[("access-control-allow-origin", "*")], ""),
        ];
        let findings = extract(&observations);
        assert_eq!(
            findings.iter().filter(|f| f.subtype == "cors_wildcard").count(),
            1
        );
    }

    #[test]
    fn extraction_is_idempotent() {
        let observations = vec![observation("http://t/", 200, &[], "")];
        let a = extract(&observations);
        let b = extract(&observations);
        assert_eq!(a.len(), b.len());
        assert_eq!(
            a.iter().map(|f| f.subtype.clone()).collect::<Vec<_>>(),
            b.iter().map(|f| f.subtype.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn server_banner_prefers_server_header() {
        let observations = vec![observation(
            "http://t/",
            200,
            &[("server", "nginx"), ("x-powered-by", "Express")],
            "",
        )];
        let findings = extract(&observations);
        let f = findings.iter().find(|f| f.subtype == "server_banner").unwrap();
        assert_eq!(f.evidence, "nginx");
    }

    #[test]
    fn owasp_summary_sorts_by_descending_count() {
        let findings = vec![
            Finding {
                finding_type: "a".into(),
                subtype: "a".into(),
                severity: Severity::Info,
                path: "/".into(),
                evidence: String::new(),
                owasp: "A05:2021-Security Misconfiguration".into(),
                observation_id: "1".into(),
            },
            Finding {
                finding_type: "b".into(),
                subtype: "b".into(),
                severity: Severity::Info,
                path: "/".into(),
                evidence: String::new(),
                owasp: "A01:2021-Broken Access Control".into(),
                observation_id: "2".into(),
            },
            Finding {
                finding_type: "c".into(),
                subtype: "c".into(),
                severity: Severity::Info,
                path: "/".into(),
                evidence: String::new(),
                owasp: "A05:2021-Security Misconfiguration".into(),
                observation_id: "3".into(),
            },
        ];
        let summary = owasp_summary(&findings);
        assert_eq!(summary[0].category, "A05:2021-Security Misconfiguration");
        assert_eq!(summary[0].count, 2);
    }
}
