//! Replay executor
//!
//! Rebuilds a stored request and sends it through the local proxy so the
//! replayed exchange is intercepted, captured, and attributed like live
//! traffic. The proxy is used as an HTTP proxy with the project CA as
//! the TLS trust anchor.

use crate::error::{ProcsiError, Result};
use crate::proxy::codec::{self, HEADER_REPLAY_TOKEN};
use crate::repo::{CapturedRequest, ReplayInitiator};
use crate::replay::tracker::{ReplayOrigin, ReplayTracker};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Replay timeout clamp, milliseconds.
const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Per-replay adjustments.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplayOverrides {
    /// Headers set (or replaced) on the rebuilt request.
    pub set_headers: Option<HashMap<String, String>>,
    /// Header names removed after `set_headers` is applied.
    pub remove_headers: Option<Vec<String>>,
    /// Clamped into `[1000, 120000]`; defaults to 10000.
    pub timeout_ms: Option<u64>,
}

/// Outcome of a successful replay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub status: u16,
}

/// Sends rebuilt requests through the local proxy.
pub struct ReplayExecutor {
    tracker: Arc<ReplayTracker>,
    proxy_port: u16,
    ca_cert_pem: String,
}

impl ReplayExecutor {
    pub fn new(tracker: Arc<ReplayTracker>, proxy_port: u16, ca_cert_pem: String) -> Self {
        Self {
            tracker,
            proxy_port,
            ca_cert_pem,
        }
    }

    /// Replay a stored request. Returns the response status on success;
    /// timeouts and transport failures surface as typed errors.
    pub async fn replay(
        &self,
        original: &CapturedRequest,
        initiator: ReplayInitiator,
        overrides: &ReplayOverrides,
    ) -> Result<ReplayResult> {
        let method = original.method.to_uppercase();
        let body = if method_can_carry_body(&method) {
            original.request_body.clone()
        } else {
            None
        };

        let headers = self.rebuild_headers(original, initiator, overrides)?;
        let timeout_ms = overrides
            .timeout_ms
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);

        let client = self.build_client(Duration::from_millis(timeout_ms))?;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| ProcsiError::Validation(format!("Invalid method: {e}")))?;
        let mut request = client.request(method, &original.url);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                anyhow::Error::from(ProcsiError::ReplayTimeout { timeout_ms })
            } else {
                anyhow::Error::from(ProcsiError::ReplayTransport(error.to_string()))
            }
        })?;
        let status = response.status().as_u16();

        // Drain fully so the proxy's exchange lifecycle completes.
        response.bytes().await.map_err(|error| {
            if error.is_timeout() {
                anyhow::Error::from(ProcsiError::ReplayTimeout { timeout_ms })
            } else {
                anyhow::Error::from(ProcsiError::ReplayTransport(error.to_string()))
            }
        })?;

        Ok(ReplayResult { status })
    }

    fn rebuild_headers(
        &self,
        original: &CapturedRequest,
        initiator: ReplayInitiator,
        overrides: &ReplayOverrides,
    ) -> Result<HashMap<String, String>> {
        let mut headers: HashMap<String, String> = original
            .request_headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();

        if let Some(set) = &overrides.set_headers {
            for (name, value) in set {
                headers.insert(name.to_lowercase(), value.clone());
            }
        }
        if let Some(remove) = &overrides.remove_headers {
            for name in remove {
                headers.remove(&name.to_lowercase());
            }
        }

        codec::strip_proxy_headers(&mut headers);
        // The transport computes the length of the rebuilt body.
        headers.remove("content-length");
        headers.remove("host");

        let token = self.tracker.register(ReplayOrigin {
            original_request_id: original.id.clone(),
            initiator,
        });
        headers.insert(HEADER_REPLAY_TOKEN.to_string(), token);
        Ok(headers)
    }

    fn build_client(&self, timeout: Duration) -> Result<reqwest::Client> {
        let proxy_url = format!("http://127.0.0.1:{}", self.proxy_port);
        let ca = reqwest::Certificate::from_pem(self.ca_cert_pem.as_bytes())
            .map_err(|e| ProcsiError::Ca(format!("Invalid CA certificate: {e}")))?;
        let client = reqwest::Client::builder()
            .proxy(
                reqwest::Proxy::all(&proxy_url)
                    .map_err(|e| ProcsiError::ReplayTransport(e.to_string()))?,
            )
            .add_root_certificate(ca)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| ProcsiError::ReplayTransport(e.to_string()))?;
        Ok(client)
    }
}

fn method_can_carry_body(method: &str) -> bool {
    !matches!(method, "GET" | "HEAD")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored_request() -> CapturedRequest {
        CapturedRequest {
            id: "orig".into(),
            session_id: "daemon".into(),
            timestamp: 0,
            duration_ms: None,
            method: "get".into(),
            url: "https://api.test/v1".into(),
            host: "api.test".into(),
            path: "/v1".into(),
            request_headers: HashMap::from([
                ("Accept".to_string(), "*/*".to_string()),
                ("content-length".to_string(), "5".to_string()),
                ("connection".to_string(), "keep-alive".to_string()),
                ("procsi-session-id".to_string(), "stale".to_string()),
            ]),
            request_body: Some(b"hello".to_vec()),
            request_body_truncated: false,
            request_content_type: None,
            response_status: Some(200),
            response_headers: Some(HashMap::new()),
            response_body: None,
            response_body_truncated: Some(false),
            response_content_type: None,
            label: None,
            source: None,
            intercepted_by: None,
            interception_type: None,
            replayed_from_id: None,
            replay_initiator: None,
            saved: false,
        }
    }

    fn executor() -> (ReplayExecutor, Arc<ReplayTracker>) {
        let tracker = Arc::new(ReplayTracker::new());
        let executor = ReplayExecutor::new(tracker.clone(), 0, String::new());
        (executor, tracker)
    }

    #[test]
    fn test_rebuild_headers_strips_and_injects_token() {
        let (executor, tracker) = executor();
        let headers = executor
            .rebuild_headers(
                &stored_request(),
                ReplayInitiator::Mcp,
                &ReplayOverrides {
                    set_headers: Some(HashMap::from([(
                        "X-Extra".to_string(),
                        "1".to_string(),
                    )])),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(headers.get("accept").map(String::as_str), Some("*/*"));
        assert_eq!(headers.get("x-extra").map(String::as_str), Some("1"));
        assert!(!headers.contains_key("content-length"));
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("procsi-session-id"));

        let token = headers.get(HEADER_REPLAY_TOKEN).unwrap();
        let origin = tracker.consume(token).unwrap();
        assert_eq!(origin.original_request_id, "orig");
        assert!(matches!(origin.initiator, ReplayInitiator::Mcp));
    }

    #[test]
    fn test_remove_headers_applied_after_set() {
        let (executor, _) = executor();
        let headers = executor
            .rebuild_headers(
                &stored_request(),
                ReplayInitiator::Tui,
                &ReplayOverrides {
                    set_headers: Some(HashMap::from([(
                        "x-doomed".to_string(),
                        "v".to_string(),
                    )])),
                    remove_headers: Some(vec!["X-Doomed".to_string(), "accept".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!headers.contains_key("x-doomed"));
        assert!(!headers.contains_key("accept"));
    }

    #[test]
    fn test_timeout_clamp() {
        for (requested, expected) in [
            (None, DEFAULT_TIMEOUT_MS),
            (Some(1), MIN_TIMEOUT_MS),
            (Some(500_000), MAX_TIMEOUT_MS),
            (Some(5_000), 5_000),
        ] {
            let clamped = requested
                .unwrap_or(DEFAULT_TIMEOUT_MS)
                .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
            assert_eq!(clamped, expected);
        }
    }

    #[test]
    fn test_get_drops_body() {
        assert!(!method_can_carry_body("GET"));
        assert!(!method_can_carry_body("HEAD"));
        assert!(method_can_carry_body("POST"));
        assert!(method_can_carry_body("DELETE"));
    }
}
