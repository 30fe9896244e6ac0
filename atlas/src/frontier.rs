//! The Path Frontier: classification, candidate discovery, scoring, and
//! selection.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use url::Url;

use crate::state::RunState;

static API_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/(api|rest|v\d+|graphql)").expect("valid regex"));

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:href|action|src)\s*=\s*["']([^"'#][^"']*)["']"#).expect("valid regex")
});
static HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#/[\w/-]*").expect("valid regex"));
static JS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/[\w/-]+").expect("valid regex"));
static FRAMEWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:routerLink|ng-href|:href|to)\s*=\s*["']([^"'#][^"']*)["']"#)
        .expect("valid regex")
});
static FETCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:fetch|axios\.\w+|\$\.\w+)\s*\(\s*["']([^"']+)["']"#)
        .expect("valid regex")
});
static ROUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:GET|POST|PUT|DELETE|PATCH)\s+(/\S*)").expect("valid regex"));
static ROUTE_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]+\}").expect("valid regex"));

const STATIC_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".ico", ".png", ".jpg", ".jpeg", ".svg", ".gif", ".webp", ".woff", ".woff2",
    ".ttf", ".map", ".eot",
];

const AUTH_KEYWORDS: &[&str] = &[
    "login", "auth", "admin", "signin", "account", "user", "profile", "register", "password",
    "token", "session",
];

const SENSITIVE_KEYWORDS: &[&str] = &[
    "swagger", "openapi", "config", "debug", "backup", "ftp", ".git", ".env", "docs",
];

/// Strip a query string from `path`, if present.
fn strip_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

/// `isStatic`: ends with a known static asset extension (query stripped).
#[must_use]
pub fn is_static(path: &str) -> bool {
    let p = strip_query(path).to_ascii_lowercase();
    STATIC_EXTENSIONS.iter().any(|ext| p.ends_with(ext))
}

/// `isApi`: matches `^/(api|rest|v\d+|graphql)`.
#[must_use]
pub fn is_api(path: &str) -> bool {
    let p = strip_query(path).to_ascii_lowercase();
    API_RE.is_match(&p)
}

/// `isAuth`: contains any of the auth-related keywords.
#[must_use]
pub fn is_auth(path: &str) -> bool {
    let p = strip_query(path).to_ascii_lowercase();
    AUTH_KEYWORDS.iter().any(|kw| p.contains(kw))
}

/// `isSensitive`: contains any of the sensitive-surface keywords.
#[must_use]
pub fn is_sensitive(path: &str) -> bool {
    let p = strip_query(path).to_ascii_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|kw| p.contains(kw))
}

/// `isApiOrAuth`: union of api/auth/sensitive.
#[must_use]
pub fn is_api_or_auth(path: &str) -> bool {
    is_api(path) || is_auth(path) || is_sensitive(path)
}

fn is_repeated_static(path: &str, state: &RunState) -> bool {
    is_static(path) && state.visited_paths.iter().any(|p| p == path)
}

/// Result of scoring a candidate path against the current run state.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPath {
    /// The scored path, or `None` if no path could be resolved.
    pub path: Option<String>,
    /// The computed priority score.
    pub score: i32,
    /// Hits recorded against this path so far.
    pub hits: u32,
    /// Most recent status observed at this path.
    pub last_status: Option<u16>,
    /// Most recent tool dispatched against this path.
    pub last_tool: Option<String>,
}

/// `scorePath(path, state)` — a pure function of `(path, state)`.
#[must_use]
pub fn score_path(path: Option<&str>, state: &RunState, max_hits_per_path: u32) -> ScoredPath {
    let Some(path) = path else {
        return ScoredPath {
            path: None,
            score: -10,
            hits: 0,
            last_status: None,
            last_tool: None,
        };
    };

    let hits = state.path_hits.get(path).copied().unwrap_or(0);
    let stat = state.path_stats.get(path);
    let last_status = stat.and_then(|s| s.last_status);
    let last_tool = stat.map(|s| s.last_tool.clone());

    let mut score: i32 = 0;
    if !state.visited_paths.iter().any(|p| p == path) {
        score += 2;
    }
    if hits >= max_hits_per_path {
        score -= 3;
    } else {
        score -= hits as i32;
    }
    if is_static(path) {
        score -= 2;
    }
    if is_api(path) {
        score += 3;
    }
    if is_auth(path) {
        score += 3;
    }
    if is_sensitive(path) {
        score += 2;
    }
    if let Some(status) = last_status {
        if status >= 500 {
            score += 2;
        } else if status >= 400 {
            score += 1;
        }
    }

    ScoredPath {
        path: Some(path.to_owned()),
        score,
        hits,
        last_status,
        last_tool,
    }
}

/// `choosePath(state, tool, desired)`. Consumes a candidate from
/// `state.candidates` when one is selected via rules 2/3.
pub fn choose_path(
    state: &mut RunState,
    tool: &str,
    desired: Option<&str>,
    max_hits_per_path: u32,
) -> Option<String> {
    // Rule 1: an explicit, non-repeated desired path with hit budget left,
    // not identical to the last dispatch of the same tool.
    if let Some(desired) = desired {
        let same_as_last = state
            .last_action
            .as_ref()
            .is_some_and(|la| la.tool == tool && la.path == desired);
        let has_budget = state.hits_remaining(desired, max_hits_per_path);
        let repeated_static = is_repeated_static(desired, state);
        if !same_as_last && has_budget && !repeated_static {
            return Some(desired.to_owned());
        }
    }

    // Rule 2: first candidate that is api/auth/sensitive, unvisited, under
    // the hit cap, and not a repeatedly-seen static.
    if let Some(idx) = state.candidates.iter().position(|c| {
        is_api_or_auth(c)
            && !state.visited_paths.iter().any(|p| p == c)
            && state.hits_remaining(c, max_hits_per_path)
            && !is_repeated_static(c, state)
    }) {
        return Some(state.candidates.remove(idx));
    }

    // Rule 3: any eligible candidate, FIFO.
    if let Some(idx) = state.candidates.iter().position(|c| {
        state.hits_remaining(c, max_hits_per_path) && !is_repeated_static(c, state)
    }) {
        return Some(state.candidates.remove(idx));
    }

    // Rule 4: no eligible path.
    None
}

/// Diversity enforcement: once `hops >= DIVERSITY_INTERVAL`,
/// force an under-covered diversity tool. Returns the tool name to force,
/// if any, paired with the forced path (always `/`).
#[must_use]
pub fn diversity_override(
    state: &RunState,
    diversity_interval: u32,
    required_tools: &[&str],
) -> Option<(String, String)> {
    if state.hops < diversity_interval {
        return None;
    }

    // Any required tool with zero usage is forced immediately.
    if let Some(unused) = required_tools
        .iter()
        .find(|t| state.tool_usage.get(**t).copied().unwrap_or(0) == 0)
    {
        return Some(((*unused).to_owned(), "/".to_owned()));
    }

    // At each multiple of the interval, force the least-used diversity tool
    // if it's behind the expected coverage ratio.
    if state.hops % diversity_interval == 0 {
        let expected = state.hops / diversity_interval;
        if let Some((name, count)) = required_tools
            .iter()
            .map(|t| (*t, state.tool_usage.get(*t).copied().unwrap_or(0)))
            .min_by_key(|(_, count)| *count)
        {
            if count < expected {
                return Some((name.to_owned(), "/".to_owned()));
            }
        }
    }

    None
}

/// Candidate discovery from an `http_get` response body.
///
/// Every match is resolved against `response_url`, deduplicated against
/// both `existing_candidates` and `visited`, and dropped if it resolves
/// outside `target_origin` or is classified as static.
#[must_use]
pub fn discover_candidates(
    body: &str,
    response_url: &Url,
    target_origin: &Url,
    existing_candidates: &[String],
    visited: &[String],
) -> Vec<String> {
    let mut seen: HashSet<String> = existing_candidates.iter().cloned().collect();
    seen.extend(visited.iter().cloned());
    let mut discovered = Vec::new();

    for raw in raw_candidate_strings(body) {
        if let Some(resolved) = resolve_candidate(&raw, response_url, target_origin) {
            if !seen.contains(&resolved) && !is_static(&resolved) {
                seen.insert(resolved.clone());
                discovered.push(resolved);
            }
        }
    }

    discovered
}

/// Run every extraction pattern over `body` and return the raw matched
/// strings, unresolved.
fn raw_candidate_strings(body: &str) -> Vec<String> {
    let mut out = Vec::new();

    out.extend(ATTR_RE.captures_iter(body).map(|c| c[1].to_owned()));

    out.extend(HASH_RE.find_iter(body).map(|m| {
        let s = m.as_str();
        if let Some(stripped) = s.strip_prefix('#') {
            format!("/{stripped}")
        } else {
            s.to_owned()
        }
    }));

    out.extend(
        JS_PATH_RE
            .find_iter(body)
            .map(|m| m.as_str().to_owned())
            .filter(|p| !is_static(p)),
    );

    out.extend(FRAMEWORK_RE.captures_iter(body).map(|c| c[1].to_owned()));

    out.extend(FETCH_RE.captures_iter(body).map(|c| c[1].to_owned()));

    out.extend(
        ROUTE_RE
            .captures_iter(body)
            .map(|c| ROUTE_PARAM_RE.replace_all(&c[1], "1").into_owned()),
    );

    out
}

/// Resolve a single raw candidate string, applying origin and query rules.
fn resolve_candidate(raw: &str, response_url: &Url, target_origin: &Url) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // Hash routes pass through unchanged.
    if raw.starts_with("/#/") {
        return Some(raw.to_owned());
    }

    // Absolute paths strip any query string.
    if raw.starts_with('/') {
        return Some(strip_query(raw).to_owned());
    }

    // Otherwise, parse relative to the response URL and keep only matching
    // origins. An unparseable URL is dropped silently, not an error.
    let resolved = response_url.join(raw).ok()?;
    if resolved.origin() != target_origin.origin() {
        return None;
    }
    Some(strip_query(resolved.path()).to_owned())
}
