//! Header and body plumbing for the proxy
//!
//! Lowercased header maps, hop-by-hop and internal header stripping,
//! transparent content-encoding decoding, and storage truncation. The
//! decode step is lossy-free: when a body cannot be decoded it is kept
//! verbatim and the `content-encoding` header stays in place.

use flate2::read::{GzDecoder, ZlibDecoder};
use hyper::header::HeaderMap;
use std::collections::HashMap;
use std::io::Read;

/// Trusted runtime header: session id.
pub const HEADER_SESSION_ID: &str = "procsi-session-id";
/// Trusted runtime header: session token.
pub const HEADER_SESSION_TOKEN: &str = "procsi-session-token";
/// Trusted runtime header: source label override.
pub const HEADER_RUNTIME_SOURCE: &str = "procsi-runtime-source";
/// Trusted runtime header: replay token.
pub const HEADER_REPLAY_TOKEN: &str = "procsi-replay-token";

/// Headers the proxy consumes and never forwards upstream.
pub const INTERNAL_HEADERS: [&str; 4] = [
    HEADER_SESSION_ID,
    HEADER_SESSION_TOKEN,
    HEADER_RUNTIME_SOURCE,
    HEADER_REPLAY_TOKEN,
];

/// Connection-scoped headers that must not cross the proxy.
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Collect a hyper header map into lowercased name/value pairs.
/// Non-UTF-8 values are dropped; repeated names keep the last value.
pub fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

/// Whether a header is internal to procsi.
pub fn is_internal_header(name: &str) -> bool {
    INTERNAL_HEADERS.contains(&name)
}

/// Whether a header is hop-by-hop.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Remove internal and hop-by-hop headers in place.
pub fn strip_proxy_headers(headers: &mut HashMap<String, String>) {
    headers.retain(|name, _| !is_internal_header(name) && !is_hop_by_hop_header(name));
}

/// Transparently decode a body according to its `content-encoding`.
///
/// Returns the (possibly decoded) bytes and whether decoding happened.
/// The caller strips the `content-encoding` header from the stored
/// record if and only if the flag is set.
pub fn decode_body(encoding: Option<&str>, body: &[u8]) -> (Vec<u8>, bool) {
    let Some(encoding) = encoding else {
        return (body.to_vec(), false);
    };
    match encoding.trim().to_lowercase().as_str() {
        "gzip" | "x-gzip" => {
            let mut decoded = Vec::new();
            match GzDecoder::new(body).read_to_end(&mut decoded) {
                Ok(_) => (decoded, true),
                Err(error) => {
                    tracing::debug!(%error, "gzip decode failed, storing raw body");
                    (body.to_vec(), false)
                }
            }
        }
        "deflate" => {
            let mut decoded = Vec::new();
            match ZlibDecoder::new(body).read_to_end(&mut decoded) {
                Ok(_) => (decoded, true),
                Err(error) => {
                    tracing::debug!(%error, "deflate decode failed, storing raw body");
                    (body.to_vec(), false)
                }
            }
        }
        "identity" | "" => (body.to_vec(), false),
        other => {
            tracing::debug!(encoding = other, "Unsupported content-encoding, storing raw body");
            (body.to_vec(), false)
        }
    }
}

/// Cap a body for storage. The truncation flag is authoritative for
/// "is this body complete".
pub fn truncate_for_storage(body: &[u8], max_body_size: usize) -> (Vec<u8>, bool) {
    if body.len() > max_body_size {
        (body[..max_body_size].to_vec(), true)
    } else {
        (body.to_vec(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_gzip_round_trip() {
        let plaintext = br#"{"input_tokens":42}"#;
        let compressed = gzip(plaintext);
        let (decoded, was_decoded) = decode_body(Some("gzip"), &compressed);
        assert!(was_decoded);
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn test_unknown_encoding_kept_verbatim() {
        let body = b"\x01\x02\x03";
        let (out, was_decoded) = decode_body(Some("br"), body);
        assert!(!was_decoded);
        assert_eq!(out, body);
    }

    #[test]
    fn test_corrupt_gzip_kept_verbatim() {
        let body = b"definitely not gzip";
        let (out, was_decoded) = decode_body(Some("gzip"), body);
        assert!(!was_decoded);
        assert_eq!(out, body);
    }

    #[test]
    fn test_no_encoding_is_passthrough() {
        let (out, was_decoded) = decode_body(None, b"plain");
        assert!(!was_decoded);
        assert_eq!(out, b"plain");
    }

    #[test]
    fn test_strip_proxy_headers() {
        let mut headers = HashMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("procsi-session-id".to_string(), "s1".to_string()),
            ("procsi-replay-token".to_string(), "t1".to_string()),
            ("connection".to_string(), "keep-alive".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
        ]);
        strip_proxy_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_truncation_flag_is_authoritative() {
        let body = vec![b'x'; 100];
        let (stored, truncated) = truncate_for_storage(&body, 64);
        assert!(truncated);
        assert_eq!(stored.len(), 64);

        let (stored, truncated) = truncate_for_storage(&body, 100);
        assert!(!truncated);
        assert_eq!(stored.len(), 100);
    }
}
