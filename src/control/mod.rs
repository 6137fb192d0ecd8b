//! Control server
//!
//! Newline-delimited JSON-RPC over a filesystem socket with 0600
//! permissions. One request per line in (`{id, method, params?}`), one
//! response per line out (`{id, result}` or `{id, error}`). The server
//! is purely request-response; consumers poll `getInterceptorEvents`
//! and `listRequestsSummary` to follow new activity.
//!
//! A connection that sends a frame longer than [`MAX_BUFFER_SIZE`] is
//! dropped.

pub mod methods;

pub use methods::ControlState;

use crate::error::{ProcsiError, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Per-connection frame cap.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: Value,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: String) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

/// The control-plane RPC server.
pub struct ControlServer {
    state: Arc<ControlState>,
    socket_path: PathBuf,
    shutdown: CancellationToken,
}

impl ControlServer {
    pub fn new(state: Arc<ControlState>, socket_path: PathBuf) -> Self {
        Self {
            state,
            socket_path,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the socket (replacing any stale file), restrict it to the
    /// owner, and start serving.
    pub fn spawn(&self) -> Result<tokio::task::JoinHandle<()>> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove stale {}", self.socket_path.display()))?;
        }
        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!("Failed to bind control socket {}", self.socket_path.display())
        })?;
        restrict_permissions(&self.socket_path)?;
        tracing::info!(socket = %self.socket_path.display(), "Control server listening");

        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        Ok(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown.cancelled() => break,
                };
                match accepted {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(error) = serve_connection(stream, state, shutdown).await {
                                tracing::debug!(%error, "Control connection closed with error");
                            }
                        });
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Control accept failed");
                    }
                }
            }
            tracing::debug!("Control accept loop stopped");
        }))
    }

    /// Stop accepting connections and unlink the socket.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// One-shot RPC call against a running daemon's control socket.
pub async fn call(socket_path: &Path, method: &str, params: Option<Value>) -> Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut frame = serde_json::to_vec(&serde_json::json!({
        "id": 1,
        "method": method,
        "params": params,
    }))?;
    frame.push(b'\n');
    write_half.write_all(&frame).await?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response: Value = serde_json::from_str(&line)
        .map_err(|e| ProcsiError::Control(format!("malformed response: {e}")))?;

    if let Some(error) = response.get("error") {
        return Err(ProcsiError::Control(format!(
            "{} (code {})",
            error["message"].as_str().unwrap_or("unknown error"),
            error["code"]
        ))
        .into());
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

async fn serve_connection(
    stream: UnixStream,
    state: Arc<ControlState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line: Vec<u8> = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = read_frame(&mut reader, &mut line) => read?,
            _ = shutdown.cancelled() => break,
        };
        match read {
            FrameRead::Eof => break,
            FrameRead::Overflow => {
                tracing::warn!("Control connection exceeded frame cap, dropping");
                break;
            }
            FrameRead::Frame => {}
        }

        let response = handle_frame(&state, &line).await;
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
    Ok(())
}

enum FrameRead {
    Frame,
    Eof,
    Overflow,
}

async fn read_frame(
    reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<FrameRead> {
    let mut limited = reader.take(MAX_BUFFER_SIZE as u64 + 1);
    let n = limited
        .read_until(b'\n', line)
        .await
        .map_err(ProcsiError::Io)?;
    if n == 0 {
        return Ok(FrameRead::Eof);
    }
    if line.len() > MAX_BUFFER_SIZE {
        return Ok(FrameRead::Overflow);
    }
    if line.last() != Some(&b'\n') {
        // EOF in the middle of a frame.
        return Ok(FrameRead::Eof);
    }
    Ok(FrameRead::Frame)
}

async fn handle_frame(state: &Arc<ControlState>, raw: &[u8]) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_slice(raw) {
        Ok(request) => request,
        Err(error) => {
            return RpcResponse::err(
                Value::String("unknown".to_string()),
                PARSE_ERROR,
                format!("parse error: {error}"),
            );
        }
    };

    let id = request.id.clone();
    match methods::dispatch(state, &request.method, request.params).await {
        Ok(result) => RpcResponse::ok(id, result),
        Err(error) => {
            let (code, message) = classify_error(&error);
            RpcResponse::err(id, code, message)
        }
    }
}

fn classify_error(error: &anyhow::Error) -> (i64, String) {
    if let Some(procsi) = error.downcast_ref::<ProcsiError>() {
        if matches!(procsi, ProcsiError::Control(message) if message == "method not found") {
            return (METHOD_NOT_FOUND, "method not found".to_string());
        }
    }
    (SERVER_ERROR, error.to_string())
}
