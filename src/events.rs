//! Interceptor event log
//!
//! A fixed-capacity in-memory ring of typed interceptor-runtime events.
//! Every append assigns a monotonically increasing sequence number; when
//! the ring is full the oldest event is dropped and the running severity
//! counters are adjusted so they always describe exactly the retained
//! slice. Consumers poll with [`EventLog::since`] using the last sequence
//! number they saw.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Severity of an event, derived from its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Closed set of interceptor-runtime event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Matched,
    Mocked,
    Modified,
    Observed,
    Loaded,
    Reload,
    UserLog,
    MatchTimeout,
    HandlerTimeout,
    InvalidResponse,
    ForwardAfterComplete,
    MatchError,
    HandlerError,
    LoadError,
}

impl EventType {
    /// Static type-to-level table.
    pub fn level(self) -> EventLevel {
        match self {
            EventType::Matched
            | EventType::Mocked
            | EventType::Modified
            | EventType::Observed
            | EventType::Loaded
            | EventType::Reload
            | EventType::UserLog => EventLevel::Info,
            EventType::MatchTimeout
            | EventType::HandlerTimeout
            | EventType::InvalidResponse
            | EventType::ForwardAfterComplete => EventLevel::Warn,
            EventType::MatchError | EventType::HandlerError | EventType::LoadError => {
                EventLevel::Error
            }
        }
    }
}

/// Request attribution attached to per-exchange events.
#[derive(Debug, Clone, Default)]
pub struct RequestRef {
    pub id: String,
    pub url: String,
    pub method: String,
}

/// A single recorded interceptor-runtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorEvent {
    /// Monotonically increasing within a process lifetime.
    pub seq: u64,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub level: EventLevel,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Name of the interceptor the event concerns, or the script file for
    /// load failures.
    pub interceptor: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    /// Error detail for `*_error` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Running per-level population of the retained slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub info: u64,
    pub warn: u64,
    pub error: u64,
}

impl EventCounts {
    fn bump(&mut self, level: EventLevel, delta: i64) {
        let slot = match level {
            EventLevel::Info => &mut self.info,
            EventLevel::Warn => &mut self.warn,
            EventLevel::Error => &mut self.error,
        };
        *slot = slot.checked_add_signed(delta).unwrap_or(0);
    }
}

/// Predicates for [`EventLog::since`]. Absent fields are wildcards.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    /// Minimum severity (hierarchical: `warn` includes `error`).
    pub level: Option<EventLevel>,
    /// Exact interceptor name.
    pub interceptor: Option<String>,
    /// Exact event type.
    #[serde(rename = "type")]
    pub event_type: Option<EventType>,
    pub limit: Option<usize>,
}

struct Inner {
    ring: VecDeque<Arc<InterceptorEvent>>,
    next_seq: u64,
    counts: EventCounts,
}

/// Fixed-capacity ring of interceptor events.
pub struct EventLog {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                next_seq: 1,
                counts: EventCounts::default(),
            }),
        }
    }

    /// Append an event, assigning its sequence number and timestamp.
    ///
    /// Returns the assigned sequence number.
    pub fn append(
        &self,
        event_type: EventType,
        interceptor: impl Into<String>,
        message: impl Into<String>,
        request: Option<&RequestRef>,
        error: Option<String>,
    ) -> u64 {
        let level = event_type.level();
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if inner.ring.len() == self.capacity {
            if let Some(evicted) = inner.ring.pop_front() {
                let lvl = evicted.level;
                inner.counts.bump(lvl, -1);
            }
        }

        let event = InterceptorEvent {
            seq,
            timestamp: Utc::now().timestamp_millis(),
            level,
            event_type,
            interceptor: interceptor.into(),
            message: message.into(),
            request_id: request.map(|r| r.id.clone()),
            request_url: request.map(|r| r.url.clone()),
            request_method: request.map(|r| r.method.clone()),
            error,
        };
        inner.ring.push_back(Arc::new(event));
        inner.counts.bump(level, 1);
        seq
    }

    /// Chronological events with `seq > after_seq` matching every predicate.
    pub fn since(&self, after_seq: u64, query: &EventQuery) -> Vec<Arc<InterceptorEvent>> {
        let inner = self.inner.lock();
        let limit = query.limit.unwrap_or(usize::MAX);
        inner
            .ring
            .iter()
            .filter(|e| e.seq > after_seq)
            .filter(|e| query.level.map_or(true, |min| e.level >= min))
            .filter(|e| {
                query
                    .interceptor
                    .as_deref()
                    .map_or(true, |name| e.interceptor == name)
            })
            .filter(|e| query.event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The most recent `n` events, chronological.
    pub fn latest(&self, n: usize) -> Vec<Arc<InterceptorEvent>> {
        let inner = self.inner.lock();
        let skip = inner.ring.len().saturating_sub(n);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    /// Running severity counters for the retained slice.
    pub fn counts(&self) -> EventCounts {
        self.inner.lock().counts
    }

    /// Number of retained error-level events with `seq > after_seq`.
    pub fn error_count_since(&self, after_seq: u64) -> u64 {
        let inner = self.inner.lock();
        inner
            .ring
            .iter()
            .filter(|e| e.seq > after_seq && e.level == EventLevel::Error)
            .count() as u64
    }

    /// Drop all retained events and reset the counters. Sequence numbers
    /// keep advancing from where they were.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.ring.clear();
        inner.counts = EventCounts::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(capacity: usize) -> EventLog {
        EventLog::new(capacity)
    }

    #[test]
    fn test_seq_strictly_increases() {
        let log = log_with(10);
        let a = log.append(EventType::Matched, "m", "hit", None, None);
        let b = log.append(EventType::Mocked, "m", "served", None, None);
        assert!(a < b);
    }

    #[test]
    fn test_level_derivation_table() {
        assert_eq!(EventType::UserLog.level(), EventLevel::Info);
        assert_eq!(EventType::ForwardAfterComplete.level(), EventLevel::Warn);
        assert_eq!(EventType::LoadError.level(), EventLevel::Error);
    }

    #[test]
    fn test_overflow_adjusts_counts() {
        let log = log_with(3);
        log.append(EventType::HandlerError, "a", "boom", None, Some("x".into()));
        log.append(EventType::Matched, "a", "hit", None, None);
        log.append(EventType::Matched, "a", "hit", None, None);
        // Overflows: the handler_error event is evicted.
        log.append(EventType::Matched, "a", "hit", None, None);

        let counts = log.counts();
        assert_eq!(counts.error, 0);
        assert_eq!(counts.info, 3);
        assert_eq!(counts.warn, 0);
    }

    #[test]
    fn test_since_filters_and_is_chronological() {
        let log = log_with(10);
        let first = log.append(EventType::Matched, "a", "hit", None, None);
        log.append(EventType::HandlerError, "a", "boom", None, None);
        log.append(EventType::Matched, "b", "hit", None, None);

        let all = log.since(0, &EventQuery::default());
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));

        let after_first = log.since(first, &EventQuery::default());
        assert_eq!(after_first.len(), 2);

        let errors_only = log.since(
            0,
            &EventQuery {
                level: Some(EventLevel::Error),
                ..Default::default()
            },
        );
        assert_eq!(errors_only.len(), 1);
        assert_eq!(errors_only[0].event_type, EventType::HandlerError);

        let by_name = log.since(
            0,
            &EventQuery {
                interceptor: Some("b".into()),
                ..Default::default()
            },
        );
        assert_eq!(by_name.len(), 1);
    }

    #[test]
    fn test_level_filter_is_hierarchical() {
        let log = log_with(10);
        log.append(EventType::Matched, "a", "hit", None, None);
        log.append(EventType::MatchTimeout, "a", "slow", None, None);
        log.append(EventType::MatchError, "a", "boom", None, None);

        let warn_and_up = log.since(
            0,
            &EventQuery {
                level: Some(EventLevel::Warn),
                ..Default::default()
            },
        );
        assert_eq!(warn_and_up.len(), 2);
    }

    #[test]
    fn test_latest_returns_tail() {
        let log = log_with(10);
        for i in 0..5 {
            log.append(EventType::UserLog, "a", format!("msg {i}"), None, None);
        }
        let latest = log.latest(2);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].message, "msg 4");
    }

    #[test]
    fn test_error_count_since() {
        let log = log_with(10);
        log.append(EventType::MatchError, "a", "boom", None, None);
        let mid = log.append(EventType::Matched, "a", "hit", None, None);
        log.append(EventType::HandlerError, "a", "boom", None, None);

        assert_eq!(log.error_count_since(0), 2);
        assert_eq!(log.error_count_since(mid), 1);
    }

    #[test]
    fn test_clear_keeps_seq_monotonic() {
        let log = log_with(10);
        let before = log.append(EventType::Matched, "a", "hit", None, None);
        log.clear();
        assert_eq!(log.counts(), EventCounts::default());
        let after = log.append(EventType::Matched, "a", "hit", None, None);
        assert!(after > before);
    }

    #[test]
    fn test_request_attribution_is_recorded() {
        let log = log_with(4);
        let req = RequestRef {
            id: "req-1".into(),
            url: "https://api.test/v1".into(),
            method: "GET".into(),
        };
        log.append(EventType::Mocked, "mocker", "served mock", Some(&req), None);
        let events = log.latest(1);
        assert_eq!(events[0].request_id.as_deref(), Some("req-1"));
        assert_eq!(events[0].request_method.as_deref(), Some("GET"));
    }
}
