//! Cookie-jar-backed HTTP client scoped to a single allowlisted origin.
//!
//! A thin extension layer over `reqwest::Client`, wrapping `reqwest` rather
//! than hand-rolling a transport. The cookie jar is process-wide for the
//! run and shared across every concurrent request in a batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use reqwest::cookie::CookieStore;
use serde_json::Value;
use url::Url;

use crate::error::{AtlasError, Result};

/// The outcome of one completed HTTP exchange (1xx-5xx are all "success"
/// at this layer — only transport failures are errors).
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    /// Final URL requested.
    pub url: String,
    /// HTTP method used.
    pub method: String,
    /// Status code returned.
    pub status: u16,
    /// Response headers, keys lower-cased.
    pub headers: HashMap<String, String>,
    /// Body truncated to the configured snippet length.
    pub body_snippet: String,
    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
}

/// Cookie-jar-backed HTTP client scoped to a single allowlisted origin.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    jar: Arc<reqwest::cookie::Jar>,
    target: Url,
    body_snippet_bytes: usize,
}

impl HttpClient {
    /// Build a client targeting `target`, with the given per-request
    /// timeout and body-snippet truncation length.
    #[must_use]
    pub fn new(target: Url, timeout: Duration, body_snippet_bytes: usize) -> Self {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is static and always valid");

        Self {
            client,
            jar,
            target,
            body_snippet_bytes,
        }
    }

    /// The allowlisted origin this client is scoped to.
    #[must_use]
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Resolve `path` against the target origin. Returns an error if `path`
    /// is absolute and resolves outside the allowlisted origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        let url = self
            .target
            .join(path)
            .map_err(|e| AtlasError::Transport {
                tool: "resolve".into(),
                path: path.into(),
                message: e.to_string(),
            })?;

        if url.origin() != self.target.origin() {
            return Err(AtlasError::Transport {
                tool: "resolve".into(),
                path: path.into(),
                message: "resolved outside allowlisted origin".into(),
            });
        }
        Ok(url)
    }

    /// Issue a GET request, with optional extra headers.
    pub async fn get(
        &self,
        path: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<HttpOutcome> {
        let url = self.resolve(path)?;
        let mut req = self.client.get(url.clone());
        for (k, v) in extra_headers {
            req = req.header(*k, *v);
        }
        self.execute(req, "GET", &url).await
    }

    /// Issue a POST with a JSON-encoded body.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<HttpOutcome> {
        let url = self.resolve(path)?;
        let req = self.client.post(url.clone()).json(body);
        self.execute(req, "POST", &url).await
    }

    /// Issue a POST with a literal raw body string and explicit
    /// content-type — used by `provoke_error`, which must transmit
    /// malformed JSON without it ever being parsed on our side.
    pub async fn post_raw(
        &self,
        path: &str,
        raw_body: String,
        content_type: &str,
    ) -> Result<HttpOutcome> {
        let url = self.resolve(path)?;
        let req = self
            .client
            .post(url.clone())
            .header("content-type", content_type)
            .body(raw_body);
        self.execute(req, "POST", &url).await
    }

    async fn execute(
        &self,
        req: reqwest::RequestBuilder,
        method: &str,
        url: &Url,
    ) -> Result<HttpOutcome> {
        let started = std::time::Instant::now();
        let response = req.send().await.map_err(|e| AtlasError::Transport {
            tool: "http".into(),
            path: url.path().to_owned(),
            message: e.to_string(),
        })?;
        let status = response.status().as_u16();

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    v.to_str().unwrap_or_default().to_owned(),
                )
            })
            .collect();

        let body = response.text().await.unwrap_or_default();
        let body_snippet = truncate_utf8(&body, self.body_snippet_bytes);
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(HttpOutcome {
            url: url.to_string(),
            method: method.to_owned(),
            status,
            headers,
            body_snippet,
            latency_ms,
        })
    }

    /// A pure view over the cookie jar: names matching
    /// `/token|session|auth|jwt|sid|id/i`, capped at 10.
    #[must_use]
    pub fn session_state(&self) -> Vec<String> {
        static PATTERN: &str = r"(?i)token|session|auth|jwt|sid|id";
        let re = Regex::new(PATTERN).expect("static pattern is valid");

        let Some(header) = self.jar.cookies(&self.target) else {
            return Vec::new();
        };
        let header_str = header.to_str().unwrap_or_default();

        header_str
            .split(';')
            .filter_map(|pair| pair.split('=').next())
            .map(str::trim)
            .filter(|name| !name.is_empty() && re.is_match(name))
            .map(str::to_owned)
            .take(10)
            .collect()
    }
}

/// Truncate `body` to at most `max_bytes`, falling back to the nearest
/// preceding UTF-8 character boundary rather than splitting one.
fn truncate_utf8(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpClient {
        HttpClient::new(
            Url::parse("http://target:3000").unwrap(),
            Duration::from_millis(500),
            2000,
        )
    }

    #[test]
    fn resolve_stays_within_origin() {
        let c = client();
        let resolved = c.resolve("/api/users").unwrap();
        assert_eq!(resolved.as_str(), "http://target:3000/api/users");
    }

    #[test]
    fn resolve_rejects_cross_origin_absolute_url() {
        let c = client();
        let err = c.resolve("http://evil.example/x").unwrap_err();
        assert!(matches!(err, AtlasError::Transport { .. }));
    }

    #[test]
    fn session_state_empty_with_no_cookies() {
        let c = client();
        assert!(c.session_state().is_empty());
    }

    #[test]
    fn truncate_utf8_respects_multi_byte_boundary() {
        let body = "a€€€"; // 'a' (1 byte) + three 3-byte euro signs
        let snippet = truncate_utf8(body, 4);
        assert_eq!(snippet, "a€");
        assert!(snippet.len() <= 4);
    }

    #[test]
    fn truncate_utf8_keeps_short_body_intact() {
        assert_eq!(truncate_utf8("hi", 2000), "hi");
    }
}
