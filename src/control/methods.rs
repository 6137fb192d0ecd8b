//! Control-plane method dispatch
//!
//! The closed method set of the RPC surface. Every handler validates its
//! parameters structurally through serde; a shape mismatch surfaces as a
//! `-32000` error to the caller. `getRequest` returns an explicit JSON
//! `null` for an absent row; the bookmark operations return whether a
//! row was affected.

use crate::error::{ProcsiError, Result};
use crate::events::{EventLog, EventQuery};
use crate::interceptors::InterceptorLoader;
use crate::replay::{ReplayExecutor, ReplayOverrides};
use crate::repo::{BodySearch, JsonBodyQuery, ListQuery, ReplayInitiator, RequestRepository};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared handles the control server dispatches against.
pub struct ControlState {
    pub repo: Arc<RequestRepository>,
    pub events: Arc<EventLog>,
    pub loader: Arc<InterceptorLoader>,
    pub replay: Arc<ReplayExecutor>,
    pub proxy_port: u16,
    pub started_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterSessionParams {
    label: Option<String>,
    pid: u32,
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsParams {
    #[serde(default)]
    after_seq: u64,
    #[serde(flatten)]
    query: EventQuery,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayParams {
    id: String,
    #[serde(default = "default_initiator")]
    initiator: ReplayInitiator,
    #[serde(default)]
    overrides: ReplayOverrides,
}

fn default_initiator() -> ReplayInitiator {
    ReplayInitiator::Tui
}

/// Route one RPC call. Unknown methods yield the sentinel error the
/// framing layer maps to `-32601`.
pub async fn dispatch(
    state: &Arc<ControlState>,
    method: &str,
    params: Option<Value>,
) -> Result<Value> {
    match method {
        "ping" => Ok(json!("pong")),
        "status" => status(state),
        "registerSession" => {
            let p: RegisterSessionParams = parse_params(params)?;
            let session =
                state
                    .repo
                    .register_session(p.label.as_deref(), p.pid, p.source.as_deref())?;
            to_value(&session)
        }
        "listSessions" => to_value(&state.repo.list_sessions()?),
        "listRequests" => {
            let query: ListQuery = parse_params(params)?;
            to_value(&state.repo.list_requests(&query)?)
        }
        "listRequestsSummary" => {
            let query: ListQuery = parse_params(params)?;
            to_value(&state.repo.list_requests_summary(&query)?)
        }
        "getRequest" => {
            let p: IdParams = parse_params(params)?;
            match state.repo.get_request(&p.id)? {
                Some(request) => to_value(&request),
                None => Ok(Value::Null),
            }
        }
        "countRequests" => {
            let query: ListQuery = parse_params(params)?;
            Ok(json!(state.repo.count_requests(&query)?))
        }
        "searchBodies" => {
            let search: BodySearch = parse_params(params)?;
            to_value(&state.repo.search_bodies(&search)?)
        }
        "queryJsonBodies" => {
            let query: JsonBodyQuery = parse_params(params)?;
            to_value(&state.repo.query_json_bodies(&query)?)
        }
        "clearRequests" => {
            let deleted = state.repo.clear_requests()?;
            Ok(json!({ "deleted": deleted }))
        }
        "saveRequest" => {
            let p: IdParams = parse_params(params)?;
            Ok(json!(state.repo.bookmark_request(&p.id)?))
        }
        "unsaveRequest" => {
            let p: IdParams = parse_params(params)?;
            Ok(json!(state.repo.unbookmark_request(&p.id)?))
        }
        "listInterceptors" => to_value(&state.loader.infos()),
        "reloadInterceptors" => {
            let count = state.loader.reload()?;
            Ok(json!({ "count": count }))
        }
        "getInterceptorEvents" => {
            let p: EventsParams = parse_params(params)?;
            let events = state.events.since(p.after_seq, &p.query);
            Ok(json!({
                "events": events,
                "counts": state.events.counts(),
            }))
        }
        "clearInterceptorEvents" => {
            state.events.clear();
            Ok(Value::Null)
        }
        "replayRequest" => {
            let p: ReplayParams = parse_params(params)?;
            let original = state
                .repo
                .get_request(&p.id)?
                .ok_or_else(|| ProcsiError::NotFound(format!("request {}", p.id)))?;
            let result = state
                .replay
                .replay(&original, p.initiator, &p.overrides)
                .await?;
            to_value(&result)
        }
        _ => Err(ProcsiError::Control("method not found".to_string()).into()),
    }
}

fn status(state: &Arc<ControlState>) -> Result<Value> {
    Ok(json!({
        "pid": std::process::id(),
        "proxyPort": state.proxy_port,
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at,
        "events": state.events.counts(),
    }))
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let value = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(value)
        .map_err(|e| ProcsiError::Validation(format!("invalid params: {e}")).into())
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ProcsiError::Serialization(e).into())
}
