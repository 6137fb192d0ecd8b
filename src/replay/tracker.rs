//! Replay token tracker
//!
//! A short-TTL in-process map from a random token to the replay's origin
//! (original request id + initiator). The executor registers a token and
//! injects it as a trusted header; the proxy consumes it exactly once
//! when the replayed request traverses the pipeline. Missing or expired
//! tokens make the request an ordinary capture.

use crate::repo::ReplayInitiator;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Token lifetime.
const TTL: Duration = Duration::from_secs(60);
/// Cap on outstanding tokens.
const MAX_ENTRIES: usize = 1000;
/// Background sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Where a replayed request came from.
#[derive(Debug, Clone)]
pub struct ReplayOrigin {
    pub original_request_id: String,
    pub initiator: ReplayInitiator,
}

struct Entry {
    origin: ReplayOrigin,
    expires_at: Instant,
}

/// Single-use token map with TTL and bounded size.
pub struct ReplayTracker {
    entries: DashMap<String, Entry>,
    /// Registration order, for oldest-first eviction on overflow.
    order: Mutex<VecDeque<String>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ReplayTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Register a replay origin and hand back its token.
    pub fn register(&self, origin: ReplayOrigin) -> String {
        self.sweep_expired();

        if self.entries.len() >= MAX_ENTRIES {
            let oldest = self.order.lock().pop_front();
            if let Some(token) = oldest {
                self.entries.remove(&token);
            }
        }

        let token = random_token();
        self.entries.insert(
            token.clone(),
            Entry {
                origin,
                expires_at: Instant::now() + TTL,
            },
        );
        self.order.lock().push_back(token.clone());
        token
    }

    /// Consume a token. Single-use; expired or unknown tokens yield
    /// `None`.
    pub fn consume(&self, token: &str) -> Option<ReplayOrigin> {
        let (_, entry) = self.entries.remove(token)?;
        if entry.expires_at < Instant::now() {
            return None;
        }
        Some(entry.origin)
    }

    /// Start the background sweep task.
    pub fn start_sweeper(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tracker.sweep_expired();
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Cancel the background sweep.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at >= now);
        let mut order = self.order.lock();
        order.retain(|token| self.entries.contains_key(token));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn random_token() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
