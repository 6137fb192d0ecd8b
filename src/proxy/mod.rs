//! Proxy engine
//!
//! Terminates HTTP and HTTPS, runs the interceptor protocol, forwards
//! upstream, and persists both phases of every exchange. Plain HTTP
//! arrives as absolute-form proxy requests; HTTPS arrives as CONNECT
//! tunnels that are hijacked and terminated with CA-minted certificates,
//! then served as ordinary HTTP/1.1.
//!
//! Per exchange: resolve the session from trusted headers, consume any
//! replay token, strip internal and hop-by-hop headers, run the request
//! phase, short-circuit on a mock, otherwise forward upstream, decode
//! content encodings before persistence, run the response phase, and
//! reply with the override when one exists.

pub mod codec;
pub mod tls;

use crate::ca::CaStore;
use crate::error::{ProcsiError, Result};
use crate::interceptors::runner::{Interception, InterceptorRunner, RequestPhase};
use crate::interceptors::{InterceptorLoader, RequestSnapshot, UpstreamResponse};
use crate::repo::{types, NewRequest, RequestRepository, ResponseUpdate};
use crate::replay::ReplayTracker;
use bytes::Bytes;
use chrono::Utc;
use codec::{
    HEADER_REPLAY_TOKEN, HEADER_RUNTIME_SOURCE, HEADER_SESSION_ID, HEADER_SESSION_TOKEN,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Session every unattributed request lands in.
pub const DAEMON_SESSION: &str = "daemon";

/// The proxy engine. Shared behind an `Arc`; one instance per daemon.
pub struct ProxyEngine {
    repo: Arc<RequestRepository>,
    runner: Arc<InterceptorRunner>,
    loader: Arc<InterceptorLoader>,
    replays: Arc<ReplayTracker>,
    tls: tls::TlsMitm,
    upstream: reqwest::Client,
    max_body_size: usize,
    shutdown: CancellationToken,
}

impl ProxyEngine {
    pub fn new(
        repo: Arc<RequestRepository>,
        runner: Arc<InterceptorRunner>,
        loader: Arc<InterceptorLoader>,
        replays: Arc<ReplayTracker>,
        ca: Arc<CaStore>,
        max_body_size: usize,
    ) -> Result<Self> {
        let upstream = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .no_proxy()
            .build()
            .map_err(|e| ProcsiError::Proxy(format!("Failed to build upstream client: {e}")))?;

        Ok(Self {
            repo,
            runner,
            loader,
            replays,
            tls: tls::TlsMitm::new(ca),
            upstream,
            max_body_size,
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the proxy listener, preferring `preferred_port` when it is
    /// nonzero and available, falling back to an OS-assigned port.
    pub async fn bind(preferred_port: u16) -> Result<(TcpListener, u16)> {
        if preferred_port != 0 {
            match TcpListener::bind(("127.0.0.1", preferred_port)).await {
                Ok(listener) => return Ok((listener, preferred_port)),
                Err(error) => {
                    tracing::debug!(port = preferred_port, %error, "Preferred port unavailable");
                }
            }
        }
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ProcsiError::Daemon(format!("Failed to bind proxy port: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| ProcsiError::Daemon(format!("Failed to read bound address: {e}")))?
            .port();
        Ok((listener, port))
    }

    /// Run the accept loop until [`ProxyEngine::shutdown`] is called.
    pub fn spawn(self: Arc<Self>, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = self.shutdown.cancelled() => break,
                };
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        tracing::warn!(%error, "Proxy accept failed");
                        continue;
                    }
                };
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.serve_plain(stream, remote_addr).await;
                });
            }
            tracing::debug!("Proxy accept loop stopped");
        })
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn serve_plain(self: Arc<Self>, stream: tokio::net::TcpStream, remote_addr: SocketAddr) {
        let io = TokioIo::new(stream);
        let engine = self.clone();
        let service = service_fn(move |req| {
            let engine = engine.clone();
            async move { engine.route(req).await }
        });

        if let Err(error) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!(remote = %remote_addr, %error, "Proxy connection error");
        }
    }

    async fn route(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req));
        }

        if req.uri().scheme().is_some() {
            let url = match Url::parse(&req.uri().to_string()) {
                Ok(url) => url,
                Err(_) => return Ok(plain_response(StatusCode::BAD_REQUEST, "invalid proxy URL")),
            };
            return Ok(self.handle_exchange(req, url).await);
        }

        Ok(plain_response(
            StatusCode::BAD_REQUEST,
            "expected an absolute-form proxy request or CONNECT",
        ))
    }

    /// Hijack a CONNECT tunnel, terminate TLS with a minted leaf, and
    /// serve the decrypted stream as HTTP/1.1.
    fn handle_connect(self: Arc<Self>, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(authority) = req.uri().authority().cloned() else {
            return plain_response(StatusCode::BAD_REQUEST, "CONNECT without authority");
        };
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(443);

        let engine = self.clone();
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    tracing::debug!(%error, "CONNECT upgrade failed");
                    return;
                }
            };
            let acceptor = match engine.tls.acceptor_for(&host) {
                Ok(acceptor) => acceptor,
                Err(error) => {
                    tracing::warn!(%host, %error, "Failed to mint TLS config");
                    return;
                }
            };
            let tls_stream = match acceptor.accept(TokioIo::new(upgraded)).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::debug!(%host, %error, "TLS handshake failed");
                    return;
                }
            };

            let engine_for_conn = engine.clone();
            let host_for_service = host.clone();
            let service = service_fn(move |inner: Request<Incoming>| {
                let engine = engine_for_conn.clone();
                let host = host_for_service.clone();
                async move {
                    let path = inner
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_else(|| "/".to_string());
                    let raw = if port == 443 {
                        format!("https://{host}{path}")
                    } else {
                        format!("https://{host}:{port}{path}")
                    };
                    let response = match Url::parse(&raw) {
                        Ok(url) => engine.handle_exchange(inner, url).await,
                        Err(_) => plain_response(StatusCode::BAD_REQUEST, "invalid tunneled URL"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(error) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                tracing::debug!(%host, %error, "Tunneled connection error");
            }
        });

        Response::new(Full::new(Bytes::new()))
    }

    async fn handle_exchange(
        self: &Arc<Self>,
        req: Request<Incoming>,
        url: Url,
    ) -> Response<Full<Bytes>> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut guard = CleanupGuard {
            runner: self.runner.clone(),
            request_id: request_id.clone(),
            armed: true,
        };
        match self.process_exchange(req, url, &request_id).await {
            Ok(response) => {
                guard.armed = false;
                response
            }
            // The guard stays armed: its drop unwinds any pending
            // interception for this exchange.
            Err(error) => {
                tracing::warn!(%request_id, %error, "Exchange failed");
                plain_response(StatusCode::BAD_GATEWAY, &format!("upstream error: {error}"))
            }
        }
    }

    async fn process_exchange(
        self: &Arc<Self>,
        req: Request<Incoming>,
        url: Url,
        request_id: &str,
    ) -> Result<Response<Full<Bytes>>> {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let raw_headers = codec::headers_to_map(&parts.headers);
        let method = parts.method.as_str().to_uppercase();

        // Session attribution from trusted headers; everything else is
        // the daemon's own session.
        let mut session_id = DAEMON_SESSION.to_string();
        let mut source: Option<String> = None;
        if let (Some(sid), Some(token)) = (
            raw_headers.get(HEADER_SESSION_ID),
            raw_headers.get(HEADER_SESSION_TOKEN),
        ) {
            if let Some(auth) = self.repo.get_session_auth(sid, token)? {
                session_id = sid.clone();
                source = raw_headers
                    .get(HEADER_RUNTIME_SOURCE)
                    .cloned()
                    .or(auth.source);
            }
        }

        let replay = raw_headers
            .get(HEADER_REPLAY_TOKEN)
            .and_then(|token| self.replays.consume(token));

        let mut clean_headers = raw_headers;
        codec::strip_proxy_headers(&mut clean_headers);

        let raw_body = body
            .collect()
            .await
            .map_err(|e| ProcsiError::Proxy(format!("Failed to read request body: {e}")))?
            .to_bytes();

        let (decoded_request, request_decoded) = codec::decode_body(
            clean_headers.get("content-encoding").map(String::as_str),
            &raw_body,
        );
        let mut stored_request_headers = clean_headers.clone();
        if request_decoded {
            stored_request_headers.remove("content-encoding");
        }
        let request_content_type = clean_headers
            .get("content-type")
            .map(|ct| types::normalize_content_type(ct))
            .filter(|ct| !ct.is_empty());

        let (stored_request_body, request_truncated) =
            codec::truncate_for_storage(&decoded_request, self.max_body_size);

        let host = url.host_str().unwrap_or_default().to_string();
        let path = url.path().to_string();
        let timestamp = Utc::now().timestamp_millis();

        self.repo.save_request(&NewRequest {
            id: request_id.to_string(),
            session_id: session_id.clone(),
            timestamp,
            method: method.clone(),
            url: url.to_string(),
            host: host.clone(),
            path: path.clone(),
            request_headers: stored_request_headers,
            request_body: (!stored_request_body.is_empty()).then_some(stored_request_body),
            request_body_truncated: request_truncated,
            request_content_type: request_content_type.clone(),
            label: None,
            source,
        })?;

        if let Some(replay) = &replay {
            self.repo.update_request_replay(
                request_id,
                &replay.original_request_id,
                replay.initiator,
            )?;
        }

        let snapshot = RequestSnapshot {
            id: request_id.to_string(),
            session_id,
            method: method.clone(),
            url: url.to_string(),
            host,
            path,
            headers: clean_headers.clone(),
            body: (!decoded_request.is_empty()).then(|| decoded_request.to_vec()),
            content_type: request_content_type,
            timestamp,
        };

        let interceptors = self.loader.snapshot();
        let phase = self.runner.handle_request(&interceptors, snapshot).await;

        if let RequestPhase::Mock {
            response,
            interception,
        } = phase
        {
            let headers = response.headers.unwrap_or_default();
            let body = response.body.unwrap_or_default();
            self.persist_response(
                request_id,
                response.status,
                &headers,
                &body,
                start.elapsed(),
                Some(&interception),
            )?;
            return Ok(build_client_response(response.status, &headers, body));
        }

        // Forward upstream with the original (undecoded) body.
        let upstream_response = self
            .forward_upstream(&parts.method, &url, &clean_headers, raw_body)
            .await?;

        let outcome = self
            .runner
            .handle_response(request_id, upstream_response.clone())
            .await;

        let (status, headers, body) = match outcome.override_response {
            Some(override_response) => (
                override_response.status,
                override_response
                    .headers
                    .unwrap_or_else(|| upstream_response.headers.clone()),
                override_response.body.unwrap_or(upstream_response.body),
            ),
            None => (
                upstream_response.status,
                upstream_response.headers,
                upstream_response.body,
            ),
        };

        self.persist_response(
            request_id,
            status,
            &headers,
            &body,
            start.elapsed(),
            outcome.interception.as_ref(),
        )?;

        Ok(build_client_response(status, &headers, body))
    }

    async fn forward_upstream(
        &self,
        method: &Method,
        url: &Url,
        headers: &HashMap<String, String>,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| ProcsiError::Proxy(format!("Invalid method: {e}")))?;

        let mut request = self.upstream.request(method, url.as_str());
        for (name, value) in headers {
            // The client computes framing and addressing headers itself.
            if name == "content-length" || name == "host" {
                continue;
            }
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProcsiError::Upstream(e.to_string()))?;
        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_lowercase(), value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ProcsiError::Upstream(e.to_string()))?;

        // Decode once at receipt; downstream of here the exchange is
        // identity-encoded.
        let (decoded, was_decoded) =
            codec::decode_body(headers.get("content-encoding").map(String::as_str), &body);
        if was_decoded {
            headers.remove("content-encoding");
        }
        headers.remove("content-length");

        Ok(UpstreamResponse {
            status,
            headers,
            body: decoded,
        })
    }

    fn persist_response(
        &self,
        request_id: &str,
        status: u16,
        headers: &HashMap<String, String>,
        body: &[u8],
        elapsed: Duration,
        interception: Option<&Interception>,
    ) -> Result<()> {
        let content_type = headers
            .get("content-type")
            .map(|ct| types::normalize_content_type(ct))
            .filter(|ct| !ct.is_empty());
        let (stored_body, truncated) = codec::truncate_for_storage(body, self.max_body_size);

        self.repo.update_request_response(
            request_id,
            &ResponseUpdate {
                status,
                headers: headers.clone(),
                body: (!stored_body.is_empty()).then_some(stored_body),
                duration_ms: elapsed.as_millis() as i64,
                response_body_truncated: truncated,
                content_type,
            },
        )?;

        if let Some(interception) = interception {
            self.repo
                .update_request_interception(request_id, &interception.name, interception.kind)?;
        }
        Ok(())
    }
}

/// Unwinds the interceptor runner when an exchange dies early (client
/// abort, upstream failure, task drop).
struct CleanupGuard {
    runner: Arc<InterceptorRunner>,
    request_id: String,
    armed: bool,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.runner.cleanup(&self.request_id);
        }
    }
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn build_client_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: Vec<u8>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in headers {
        if codec::is_hop_by_hop_header(name) || name == "content-length" {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_response_carries_message() {
        let response = plain_response(StatusCode::BAD_GATEWAY, "upstream error: refused");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_build_client_response_filters_headers() {
        let headers = HashMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
            ("content-length".to_string(), "999".to_string()),
        ]);
        let response = build_client_response(200, &headers, b"{}".to_vec());
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-type").is_some());
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("content-length").is_none());
    }

    #[test]
    fn test_invalid_status_degrades_to_500() {
        let response = build_client_response(99, &HashMap::new(), Vec::new());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
