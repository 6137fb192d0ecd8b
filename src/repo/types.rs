//! Repository data types
//!
//! Row types for the `sessions` and `requests` tables, the write-side
//! partials, and the content-type classification predicates used at save
//! time. Wire forms are camelCase; body bytes cross the control-plane
//! wire base64-encoded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A logical producer of requests: the daemon itself, a spawned command,
/// or a user registration. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub pid: u32,
    /// Milliseconds since epoch.
    pub started_at: i64,
    /// 128-bit random hex authenticating trusted runtime headers. Only
    /// returned from registration; listings blank it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_token: Option<String>,
}

/// Source attribution returned by a successful session-token check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A session as reported by `listSessions`: token blanked, request count
/// attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(flatten)]
    pub session: Session,
    pub request_count: u64,
}

/// How an interceptor affected an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptionType {
    Modified,
    Mocked,
}

impl InterceptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            InterceptionType::Modified => "modified",
            InterceptionType::Mocked => "mocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "modified" => Some(InterceptionType::Modified),
            "mocked" => Some(InterceptionType::Mocked),
            _ => None,
        }
    }
}

/// Who asked for a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayInitiator {
    Tui,
    Mcp,
}

impl ReplayInitiator {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplayInitiator::Tui => "tui",
            ReplayInitiator::Mcp => "mcp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tui" => Some(ReplayInitiator::Tui),
            "mcp" => Some(ReplayInitiator::Mcp),
            _ => None,
        }
    }
}

/// A fully materialized captured exchange.
///
/// Response fields are all absent until the response phase completes;
/// they are set exactly once per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub id: String,
    pub session_id: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    /// Lowercased header names.
    pub request_headers: HashMap<String, String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "optional_base64",
        default
    )]
    pub request_body: Option<Vec<u8>>,
    pub request_body_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "optional_base64",
        default
    )]
    pub response_body: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercepted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interception_type: Option<InterceptionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed_from_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_initiator: Option<ReplayInitiator>,
    pub saved: bool,
}

/// A captured exchange with bodies stripped, sizes in their place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub id: String,
    pub session_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_content_type: Option<String>,
    pub request_body_size: u64,
    pub request_body_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_content_type: Option<String>,
    pub response_body_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercepted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interception_type: Option<InterceptionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed_from_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_initiator: Option<ReplayInitiator>,
    pub saved: bool,
}

/// Request-phase partial for [`save_request`](crate::repo::RequestRepository::save_request).
#[derive(Debug, Clone, Default)]
pub struct NewRequest {
    /// Caller-assigned UUID; the proxy mints it before interception so the
    /// runner and repository agree on the key.
    pub id: String,
    pub session_id: String,
    pub timestamp: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<Vec<u8>>,
    pub request_body_truncated: bool,
    pub request_content_type: Option<String>,
    pub label: Option<String>,
    pub source: Option<String>,
}

/// Response-phase update.
#[derive(Debug, Clone, Default)]
pub struct ResponseUpdate {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub duration_ms: i64,
    pub response_body_truncated: bool,
    pub content_type: Option<String>,
}

/// One row of a JSON-path query: summary fields plus the extracted value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonQueryRow {
    #[serde(flatten)]
    pub summary: RequestSummary,
    pub extracted_value: serde_json::Value,
}

/// Normalize a Content-Type header value: strip parameters, trim,
/// lowercase. `"Application/JSON; charset=utf-8"` becomes
/// `"application/json"`.
pub fn normalize_content_type(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_lowercase()
}

/// Whether a normalized content type carries searchable text.
pub fn is_text_content_type(normalized: &str) -> bool {
    if normalized.starts_with("text/") {
        return true;
    }
    if is_json_content_type(normalized) {
        return true;
    }
    matches!(
        normalized,
        "application/xml"
            | "application/xhtml+xml"
            | "application/javascript"
            | "application/ecmascript"
            | "application/x-www-form-urlencoded"
            | "application/graphql"
    ) || normalized.ends_with("+xml")
}

/// Whether a normalized content type is JSON.
pub fn is_json_content_type(normalized: &str) -> bool {
    normalized == "application/json" || normalized.ends_with("+json")
}

/// Classification columns for a body: `(is_text, is_json)`, `None` when
/// the content type is unknown.
pub fn classify_content_type(content_type: Option<&str>) -> (Option<bool>, Option<bool>) {
    match content_type {
        None => (None, None),
        Some(ct) => {
            let normalized = normalize_content_type(ct);
            if normalized.is_empty() {
                (None, None)
            } else {
                (
                    Some(is_text_content_type(&normalized)),
                    Some(is_json_content_type(&normalized)),
                )
            }
        }
    }
}

/// Serde helper: `Option<Vec<u8>>` as an optional base64 string.
mod optional_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
