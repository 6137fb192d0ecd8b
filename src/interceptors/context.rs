//! Script-facing handler context
//!
//! Each handler invocation receives a single `ctx` value exposing:
//!
//! - `ctx.request`: a copied snapshot of the intercepted request
//! - `ctx.log(msg)`: records a `user_log` event
//! - `ctx.procsi`: a read-only client over a strict subset of the
//!   repository's queries
//! - `ctx.forward()`: parks the handler until the proxy delivers the
//!   upstream response, then returns it; the result is memoized so every
//!   later call returns the same value
//!
//! All data crossing into script space is copied; nothing a script
//! mutates can reach the proxy except through its return value.

use crate::events::{EventLog, EventType, RequestRef};
use crate::interceptors::{RequestSnapshot, UpstreamResponse};
use crate::repo::{BodySearch, JsonBodyQuery, ListQuery, RequestRepository};
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Rendezvous between a parked `forward()` and the proxy's response
/// phase. Owned by the runner's pending entry; the sender half lives on
/// the runner side.
pub struct ForwardHandle {
    state: Mutex<ForwardState>,
    /// Set on the first `forward()` call; the runner uses it to classify
    /// mock vs modify outcomes.
    called: AtomicBool,
    /// Set when the response phase (or cleanup) completed; later
    /// `forward()` calls fail with `forward_after_complete`.
    completed: AtomicBool,
}

enum ForwardState {
    Armed {
        /// Fired once to tell the runner the handler wants the upstream.
        signal: Option<oneshot::Sender<()>>,
        /// Delivery channel for the upstream response. A dropped sender
        /// means the pending entry was cleaned up.
        delivery: Option<oneshot::Receiver<UpstreamResponse>>,
    },
    /// Memoized outcome: the upstream response, or `None` for an abort.
    Memo(Option<UpstreamResponse>),
}

impl ForwardHandle {
    pub fn new(
        signal: oneshot::Sender<()>,
        delivery: oneshot::Receiver<UpstreamResponse>,
    ) -> Self {
        Self {
            state: Mutex::new(ForwardState::Armed {
                signal: Some(signal),
                delivery: Some(delivery),
            }),
            called: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    /// Whether the handler called `forward()` at least once.
    pub fn was_called(&self) -> bool {
        self.called.load(Ordering::Acquire)
    }

    /// Mark the exchange finished; later `forward()` calls error out.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// The memoized outcome, if `forward()` already resolved once.
    fn memoized(&self) -> Option<Option<UpstreamResponse>> {
        match &*self.state.lock() {
            ForwardState::Memo(memo) => Some(memo.clone()),
            ForwardState::Armed { .. } => None,
        }
    }

    /// Block until the upstream response arrives. Runs on a script
    /// thread, never on the async runtime.
    fn wait(&self) -> Option<UpstreamResponse> {
        let delivery = {
            let mut state = self.state.lock();
            match &mut *state {
                ForwardState::Memo(memo) => return memo.clone(),
                ForwardState::Armed { signal, delivery } => {
                    if let Some(signal) = signal.take() {
                        let _ = signal.send(());
                    }
                    delivery.take()
                }
            }
        };

        let outcome = match delivery {
            Some(rx) => rx.blocking_recv().ok(),
            // A second racing call; the memo path above handles the
            // single-threaded script, so this is cleanup fallout.
            None => None,
        };

        *self.state.lock() = ForwardState::Memo(outcome.clone());
        outcome
    }
}

/// Read-only repository client exposed to scripts as `ctx.procsi`.
#[derive(Clone)]
pub struct ProcsiClient {
    repo: Arc<RequestRepository>,
}

impl ProcsiClient {
    pub fn new(repo: Arc<RequestRepository>) -> Self {
        Self { repo }
    }

    fn count(&mut self, query: Map) -> Result<i64, Box<EvalAltResult>> {
        let query: ListQuery = parse_query(query)?;
        self.repo
            .count_requests(&query)
            .map(|n| n as i64)
            .map_err(script_error)
    }

    fn list(&mut self, query: Map) -> Result<Dynamic, Box<EvalAltResult>> {
        let query: ListQuery = parse_query(query)?;
        let summaries = self.repo.list_requests_summary(&query).map_err(script_error)?;
        to_script_value(&summaries)
    }

    fn get(&mut self, id: ImmutableString) -> Result<Dynamic, Box<EvalAltResult>> {
        match self.repo.get_request(&id).map_err(script_error)? {
            Some(request) => to_script_value(&request),
            None => Ok(Dynamic::UNIT),
        }
    }

    fn search(&mut self, query: Map) -> Result<Dynamic, Box<EvalAltResult>> {
        let query: BodySearch = parse_query(query)?;
        let hits = self.repo.search_bodies(&query).map_err(script_error)?;
        to_script_value(&hits)
    }

    fn query_json(&mut self, query: Map) -> Result<Dynamic, Box<EvalAltResult>> {
        let query: JsonBodyQuery = parse_query(query)?;
        let rows = self.repo.query_json_bodies(&query).map_err(script_error)?;
        to_script_value(&rows)
    }
}

/// The `ctx` value handed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    request: Arc<RequestSnapshot>,
    forward: Arc<ForwardHandle>,
    procsi: ProcsiClient,
    events: Arc<EventLog>,
    interceptor: String,
    request_ref: RequestRef,
}

impl HandlerContext {
    pub fn new(
        request: Arc<RequestSnapshot>,
        forward: Arc<ForwardHandle>,
        procsi: ProcsiClient,
        events: Arc<EventLog>,
        interceptor: String,
    ) -> Self {
        let request_ref = RequestRef {
            id: request.id.clone(),
            url: request.url.clone(),
            method: request.method.clone(),
        };
        Self {
            request,
            forward,
            procsi,
            events,
            interceptor,
            request_ref,
        }
    }

    fn request_map(&mut self) -> Map {
        snapshot_to_map(&self.request)
    }

    fn procsi_client(&mut self) -> ProcsiClient {
        self.procsi.clone()
    }

    fn log(&mut self, message: Dynamic) {
        let message = if message.is_string() {
            message.into_immutable_string().map(|s| s.to_string()).unwrap_or_default()
        } else {
            message.to_string()
        };
        self.events.append(
            EventType::UserLog,
            self.interceptor.clone(),
            message,
            Some(&self.request_ref),
            None,
        );
    }

    fn forward(&mut self) -> Result<Map, Box<EvalAltResult>> {
        // A memoized value survives completion: repeated calls within
        // one invocation keep returning the same result.
        if let Some(memo) = self.forward.memoized() {
            return match memo {
                Some(upstream) => Ok(upstream_to_map(&upstream)),
                None => Err("forward() aborted".into()),
            };
        }

        if self.forward.completed.load(Ordering::Acquire) {
            self.events.append(
                EventType::ForwardAfterComplete,
                self.interceptor.clone(),
                "forward() called after the response phase completed",
                Some(&self.request_ref),
                None,
            );
            return Err("forward() called after the response phase completed".into());
        }

        self.forward.called.store(true, Ordering::Release);
        match self.forward.wait() {
            Some(upstream) => Ok(upstream_to_map(&upstream)),
            None => Err("forward() aborted".into()),
        }
    }
}

/// Register the handler-context API on a script engine.
pub fn register_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<HandlerContext>("HandlerContext")
        .register_get("request", HandlerContext::request_map)
        .register_get("procsi", HandlerContext::procsi_client)
        .register_fn("log", HandlerContext::log)
        .register_fn("forward", HandlerContext::forward);

    engine
        .register_type_with_name::<ProcsiClient>("ProcsiClient")
        .register_fn("count_requests", ProcsiClient::count)
        .register_fn("count_requests", |client: &mut ProcsiClient| {
            client.count(Map::new())
        })
        .register_fn("list_requests", ProcsiClient::list)
        .register_fn("list_requests", |client: &mut ProcsiClient| {
            client.list(Map::new())
        })
        .register_fn("get_request", ProcsiClient::get)
        .register_fn("search_bodies", ProcsiClient::search)
        .register_fn("query_json_bodies", ProcsiClient::query_json);
}

/// Build the request snapshot map handed to `matches` and `ctx.request`.
pub fn snapshot_to_map(snapshot: &RequestSnapshot) -> Map {
    let mut map = Map::new();
    map.insert("id".into(), snapshot.id.clone().into());
    map.insert("sessionId".into(), snapshot.session_id.clone().into());
    map.insert("method".into(), snapshot.method.clone().into());
    map.insert("url".into(), snapshot.url.clone().into());
    map.insert("host".into(), snapshot.host.clone().into());
    map.insert("path".into(), snapshot.path.clone().into());
    map.insert("headers".into(), headers_to_map(&snapshot.headers).into());
    map.insert("timestamp".into(), snapshot.timestamp.into());
    map.insert(
        "contentType".into(),
        match &snapshot.content_type {
            Some(ct) => ct.clone().into(),
            None => Dynamic::UNIT,
        },
    );
    map.insert(
        "body".into(),
        match &snapshot.body {
            Some(body) => Dynamic::from_blob(body.clone()),
            None => Dynamic::UNIT,
        },
    );
    map.insert(
        "bodyText".into(),
        match snapshot.body.as_deref().map(String::from_utf8_lossy) {
            Some(text) => Dynamic::from(text.into_owned()),
            None => Dynamic::UNIT,
        },
    );
    map
}

/// Build the upstream-response map returned from `forward()`.
pub fn upstream_to_map(upstream: &UpstreamResponse) -> Map {
    let mut map = Map::new();
    map.insert("status".into(), (upstream.status as i64).into());
    map.insert("headers".into(), headers_to_map(&upstream.headers).into());
    map.insert("body".into(), Dynamic::from_blob(upstream.body.clone()));
    map.insert(
        "bodyText".into(),
        Dynamic::from(String::from_utf8_lossy(&upstream.body).into_owned()),
    );
    map
}

fn headers_to_map(headers: &HashMap<String, String>) -> Map {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().into(), v.clone().into()))
        .collect()
}

fn parse_query<T: serde::de::DeserializeOwned>(map: Map) -> Result<T, Box<EvalAltResult>> {
    rhai::serde::from_dynamic(&Dynamic::from_map(map))
}

fn to_script_value<T: serde::Serialize>(value: &T) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

fn script_error(err: anyhow::Error) -> Box<EvalAltResult> {
    err.to_string().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_map_has_expected_keys() {
        let snapshot = RequestSnapshot {
            id: "r1".into(),
            session_id: "daemon".into(),
            method: "GET".into(),
            url: "https://api.test/api/test".into(),
            host: "api.test".into(),
            path: "/api/test".into(),
            headers: HashMap::from([("accept".into(), "*/*".into())]),
            body: Some(b"hello".to_vec()),
            content_type: Some("text/plain".into()),
            timestamp: 123,
        };
        let map = snapshot_to_map(&snapshot);
        assert_eq!(map.get("path").unwrap().clone().into_string().unwrap(), "/api/test");
        assert_eq!(
            map.get("bodyText").unwrap().clone().into_string().unwrap(),
            "hello"
        );
        let headers = map.get("headers").unwrap().clone().cast::<Map>();
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_forward_handle_memoizes_abort() {
        let (signal_tx, _signal_rx) = oneshot::channel();
        let (delivery_tx, delivery_rx) = oneshot::channel();
        let handle = ForwardHandle::new(signal_tx, delivery_rx);

        drop(delivery_tx);
        assert!(handle.wait().is_none());
        assert!(handle.wait().is_none());
    }

    #[test]
    fn test_forward_handle_delivers_and_memoizes() {
        let (signal_tx, mut signal_rx) = oneshot::channel();
        let (delivery_tx, delivery_rx) = oneshot::channel();
        let handle = ForwardHandle::new(signal_tx, delivery_rx);

        delivery_tx
            .send(UpstreamResponse {
                status: 204,
                ..Default::default()
            })
            .unwrap();

        let first = handle.wait().unwrap();
        assert_eq!(first.status, 204);
        assert!(signal_rx.try_recv().is_ok());

        let second = handle.wait().unwrap();
        assert_eq!(second.status, 204);
    }
}
