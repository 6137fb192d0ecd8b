//! Interceptor runtime
//!
//! User-supplied Rhai scripts that observe, mock, or rewrite exchanges as
//! they traverse the proxy. The [`loader`] compiles and hot-reloads
//! scripts from the project's `interceptors/` directory, the [`runner`]
//! drives the two-phase request/response protocol, and [`script`] /
//! [`context`] hold the compilation and script-facing API layers.
//!
//! A script defines a `handler` function and may define a `matches`
//! function and export a `name` constant:
//!
//! ```rhai
//! export const name = "mock-test";
//!
//! fn matches(request) {
//!     request.path == "/api/test"
//! }
//!
//! fn handler(ctx) {
//!     #{ status: 200, body: `{"mocked":true}` }
//! }
//! ```
//!
//! A single file may instead export an ordered list:
//!
//! ```rhai
//! export const interceptors = [
//!     #{ name: "a", matches: |r| r.path == "/a", handler: |ctx| () },
//! ];
//! ```

pub mod context;
pub mod loader;
pub mod runner;
pub mod script;

pub use loader::{InterceptorInfo, InterceptorLoader};
pub use runner::{Interception, InterceptorRunner, RequestPhase, ResponsePhase};
pub use script::{Interceptor, ScriptHost, ScriptResponse};

use std::collections::HashMap;

/// Snapshot of the intercepted request handed to `matches` and to the
/// handler context. Bodies are copied; mutations inside a script never
/// reach the proxy.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    pub id: String,
    pub session_id: String,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    /// Lowercased names.
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub timestamp: i64,
}

/// The upstream response delivered into a parked `forward()`.
#[derive(Debug, Clone, Default)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Lowercased names.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}
