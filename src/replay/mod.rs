//! Replay subsystem
//!
//! Replays rebuild a stored request and push it back through the local
//! proxy so the new exchange is captured like any other. The [`tracker`]
//! carries attribution (which stored request, which initiator) across the
//! proxy boundary via a single-use token; the [`executor`] does the
//! header surgery and the actual HTTP call.

pub mod executor;
pub mod tracker;

pub use executor::{ReplayExecutor, ReplayOverrides, ReplayResult};
pub use tracker::{ReplayOrigin, ReplayTracker};
