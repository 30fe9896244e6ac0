//! Environment-driven configuration.
//!
//! ATLAS has no config-file layer: every knob is an environment variable
//! with a documented default. `AtlasConfig::from_env` is the sole
//! constructor a deployment uses; tests construct values directly.

use url::Url;

use crate::error::{AtlasError, Result};

/// The five-action limit on a single Cortex-issued batch.
pub const MAX_ACTIONS_PER_DECISION: usize = 5;
/// Hop interval at which diversity enforcement starts evaluating coverage.
pub const DIVERSITY_INTERVAL: u32 = 5;
/// Tool names diversity enforcement guarantees at least one use of.
pub const REQUIRED_DIVERSITY_TOOLS: [&str; 2] = ["inspect_headers", "provoke_error"];
/// The tool allowlist; no other tool name is ever dispatched.
pub const ALLOWED_TOOLS: [&str; 6] = [
    "http_get",
    "http_post",
    "inspect_headers",
    "provoke_error",
    "measure_timing",
    "captcha_fetch",
];

/// Runtime configuration for a single ATLAS run, loaded from environment
/// variables.
#[derive(Debug, Clone)]
pub struct AtlasConfig {
    /// Allowlisted target origin; every request must resolve within it.
    pub target_url: Url,
    /// If `None`, Cortex uses its deterministic stub and terminates after one hop.
    pub openai_api_key: Option<String>,
    /// HTTP request budget for the whole run.
    pub max_req_per_run: u32,
    /// Reasoning-loop cap.
    pub max_hops: u32,
    /// Per-request timeout in milliseconds.
    pub req_timeout_ms: u64,
    /// Per-path request cap.
    pub max_hits_per_path: u32,
    /// Response body truncation length, in bytes.
    pub body_snippet_bytes: usize,
    /// Readiness-wait window in milliseconds (0 disables waiting).
    pub wait_for_target_ms: u64,
    /// Readiness poll interval in milliseconds.
    pub wait_for_target_interval_ms: u64,
}

impl AtlasConfig {
    /// Load configuration from environment variables, applying documented
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let target_raw =
            std::env::var("TARGET_URL").unwrap_or_else(|_| "http://target:3000".to_owned());
        let target_url = Url::parse(&target_raw)
            .map_err(|e| AtlasError::Configuration(format!("invalid TARGET_URL: {e}")))?;

        Ok(Self {
            target_url,
            openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
            max_req_per_run: env_u32("MAX_REQ_PER_RUN", 80),
            max_hops: env_u32("MAX_HOPS", 40),
            req_timeout_ms: env_u64("REQ_TIMEOUT_MS", 5000),
            max_hits_per_path: env_u32("MAX_HITS_PER_PATH", 2),
            body_snippet_bytes: env_u32("BODY_SNIPPET_BYTES", 2000) as usize,
            wait_for_target_ms: env_u64("WAIT_FOR_TARGET_MS", 0),
            wait_for_target_interval_ms: env_u64("WAIT_FOR_TARGET_INTERVAL_MS", 1000),
        })
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        // SAFETY-equivalent: tests run single-threaded per-module via serial
        // env manipulation is avoided by not touching process env here.
        let cfg = AtlasConfig {
            target_url: Url::parse("http://target:3000").unwrap(),
            openai_api_key: None,
            max_req_per_run: 80,
            max_hops: 40,
            req_timeout_ms: 5000,
            max_hits_per_path: 2,
            body_snippet_bytes: 2000,
            wait_for_target_ms: 0,
            wait_for_target_interval_ms: 1000,
        };
        assert_eq!(cfg.max_req_per_run, 80);
        assert_eq!(cfg.max_hops, 40);
    }

    #[test]
    fn allowed_tools_matches_dispatch_table() {
        assert_eq!(ALLOWED_TOOLS.len(), 6);
        assert!(ALLOWED_TOOLS.contains(&"measure_timing"));
    }
}
