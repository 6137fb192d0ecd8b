//! Interceptor runner
//!
//! Mediates the two-phase protocol between the proxy and a user handler.
//! The request phase selects the first matching interceptor and runs its
//! handler on a blocking thread; the handler either returns a mock,
//! parks on `forward()`, or passes through. The response phase delivers
//! the upstream response into the parked handler and collects its final
//! verdict.
//!
//! Pending state is keyed by request id. Every pending entry is removed
//! by exactly one of: the mock path, response-phase completion, or
//! [`InterceptorRunner::cleanup`].

use crate::events::{EventLog, EventType, RequestRef};
use crate::interceptors::context::{ForwardHandle, HandlerContext, ProcsiClient};
use crate::interceptors::script::{
    parse_script_response, Interceptor, ResponseShape, ScriptHost, ScriptResponse,
};
use crate::interceptors::{RequestSnapshot, UpstreamResponse};
use crate::repo::{InterceptionType, RequestRepository};
use dashmap::DashMap;
use rhai::Dynamic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Which interceptor touched an exchange, and how. `kind` is `None`
/// until (and unless) the handler mocks or modifies.
#[derive(Debug, Clone)]
pub struct Interception {
    pub name: String,
    pub kind: Option<InterceptionType>,
}

/// Outcome of the request phase.
pub enum RequestPhase {
    /// No interceptor selected, or the handler passed through.
    Pass,
    /// The handler produced a response without forwarding; the proxy
    /// must not call upstream.
    Mock {
        response: ScriptResponse,
        interception: Interception,
    },
    /// The handler wants the upstream response; the proxy forwards and
    /// later calls [`InterceptorRunner::handle_response`].
    Forwarded { interception: Interception },
}

/// Outcome of the response phase.
#[derive(Debug, Clone, Default)]
pub struct ResponsePhase {
    /// Replaces the upstream response on the modify path.
    pub override_response: Option<ScriptResponse>,
    /// Interception metadata to persist; `None` when the handler failed
    /// and the exchange degrades to pass-through.
    pub interception: Option<Interception>,
}

struct PendingEntry {
    interceptor: Arc<Interceptor>,
    /// Sender half of the `forward()` delivery channel. Dropping it
    /// aborts a parked `forward()`.
    delivery: Option<oneshot::Sender<UpstreamResponse>>,
    /// Present while the handler is parked on `forward()`.
    handler_task: Option<JoinHandle<Result<Dynamic, String>>>,
    /// Response object returned by a handler that had already called
    /// `forward()` when it finished the request phase.
    stashed: Option<ScriptResponse>,
    forward: Arc<ForwardHandle>,
    kill: Arc<AtomicBool>,
    request_ref: RequestRef,
}

impl PendingEntry {
    fn abort(&mut self) {
        self.kill.store(true, Ordering::Release);
        self.delivery.take();
        self.forward.mark_completed();
        if let Some(task) = self.handler_task.take() {
            // The blocking thread terminates at its next progress step.
            drop(task);
        }
    }
}

/// Drives interceptor selection and the handler protocol.
pub struct InterceptorRunner {
    host: Arc<ScriptHost>,
    repo: Arc<RequestRepository>,
    events: Arc<EventLog>,
    pending: DashMap<String, PendingEntry>,
    match_timeout: Duration,
    handler_timeout: Duration,
}

impl InterceptorRunner {
    pub fn new(
        repo: Arc<RequestRepository>,
        events: Arc<EventLog>,
        match_timeout: Duration,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            host: Arc::new(ScriptHost::new()),
            repo,
            events,
            pending: DashMap::new(),
            match_timeout,
            handler_timeout,
        }
    }

    /// Request phase: select an interceptor from `interceptors` (the
    /// caller's point-in-time snapshot) and run its handler.
    pub async fn handle_request(
        &self,
        interceptors: &[Arc<Interceptor>],
        snapshot: RequestSnapshot,
    ) -> RequestPhase {
        if interceptors.is_empty() {
            return RequestPhase::Pass;
        }
        let snapshot = Arc::new(snapshot);
        let request_ref = RequestRef {
            id: snapshot.id.clone(),
            url: snapshot.url.clone(),
            method: snapshot.method.clone(),
        };

        let Some(selected) = self.select(interceptors, &snapshot, &request_ref).await else {
            return RequestPhase::Pass;
        };

        self.events.append(
            EventType::Matched,
            selected.name.clone(),
            format!("matched {} {}", snapshot.method, snapshot.url),
            Some(&request_ref),
            None,
        );

        self.run_request_phase(selected, snapshot, request_ref).await
    }

    /// Response phase: deliver the upstream response into the pending
    /// handler, if any, and collect its verdict. A missing pending entry
    /// makes this a no-op.
    pub async fn handle_response(
        &self,
        request_id: &str,
        upstream: UpstreamResponse,
    ) -> ResponsePhase {
        let Some((_, mut entry)) = self.pending.remove(request_id) else {
            return ResponsePhase::default();
        };
        let name = entry.interceptor.name.clone();

        if let Some(delivery) = entry.delivery.take() {
            let _ = delivery.send(upstream);
        }

        // Outcome decided during the request phase: the handler already
        // returned a response after calling forward().
        if let Some(stashed) = entry.stashed.take() {
            entry.forward.mark_completed();
            self.events.append(
                EventType::Modified,
                name.clone(),
                "handler modified the upstream response",
                Some(&entry.request_ref),
                None,
            );
            return ResponsePhase {
                override_response: Some(stashed),
                interception: Some(Interception {
                    name,
                    kind: Some(InterceptionType::Modified),
                }),
            };
        }

        let Some(mut task) = entry.handler_task.take() else {
            // The handler finished in the request phase returning
            // nothing; it only wanted to observe.
            entry.forward.mark_completed();
            self.events.append(
                EventType::Observed,
                name.clone(),
                "handler observed the exchange",
                Some(&entry.request_ref),
                None,
            );
            return ResponsePhase {
                override_response: None,
                interception: Some(Interception { name, kind: None }),
            };
        };

        let joined = tokio::time::timeout(self.handler_timeout, &mut task).await;
        entry.forward.mark_completed();

        let outcome = match joined {
            Err(_) => {
                entry.kill.store(true, Ordering::Release);
                self.events.append(
                    EventType::HandlerTimeout,
                    name,
                    format!("handler exceeded {}ms in the response phase", self.handler_timeout.as_millis()),
                    Some(&entry.request_ref),
                    None,
                );
                return ResponsePhase::default();
            }
            Ok(joined) => joined,
        };

        match outcome {
            Err(join_error) => {
                self.events.append(
                    EventType::HandlerError,
                    name,
                    "handler thread failed",
                    Some(&entry.request_ref),
                    Some(join_error.to_string()),
                );
                ResponsePhase::default()
            }
            Ok(Err(script_error)) => {
                self.events.append(
                    EventType::HandlerError,
                    name,
                    "handler raised an error",
                    Some(&entry.request_ref),
                    Some(script_error),
                );
                ResponsePhase::default()
            }
            Ok(Ok(value)) => match parse_script_response(&value) {
                ResponseShape::Valid(response) => {
                    self.events.append(
                        EventType::Modified,
                        name.clone(),
                        "handler modified the upstream response",
                        Some(&entry.request_ref),
                        None,
                    );
                    ResponsePhase {
                        override_response: Some(response),
                        interception: Some(Interception {
                            name,
                            kind: Some(InterceptionType::Modified),
                        }),
                    }
                }
                ResponseShape::Absent => {
                    self.events.append(
                        EventType::Observed,
                        name.clone(),
                        "handler observed the exchange",
                        Some(&entry.request_ref),
                        None,
                    );
                    ResponsePhase {
                        override_response: None,
                        interception: Some(Interception { name, kind: None }),
                    }
                }
                ResponseShape::Invalid(reason) => {
                    self.events.append(
                        EventType::InvalidResponse,
                        name,
                        reason,
                        Some(&entry.request_ref),
                        None,
                    );
                    ResponsePhase::default()
                }
            },
        }
    }

    /// Forcibly drop the pending entry for `request_id`, unwinding any
    /// parked `forward()` with an abort. Called on client disconnect and
    /// on shutdown.
    pub fn cleanup(&self, request_id: &str) {
        if let Some((_, mut entry)) = self.pending.remove(request_id) {
            tracing::debug!(request_id, "Cleaning up pending interception");
            entry.abort();
        }
    }

    /// Unwind every pending entry. Shutdown path.
    pub fn cleanup_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.cleanup(&id);
        }
    }

    /// Number of in-flight pending entries (shutdown diagnostics).
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn select(
        &self,
        interceptors: &[Arc<Interceptor>],
        snapshot: &Arc<RequestSnapshot>,
        request_ref: &RequestRef,
    ) -> Option<Arc<Interceptor>> {
        let request_map = crate::interceptors::context::snapshot_to_map(snapshot);

        for interceptor in interceptors {
            if !interceptor.has_matcher() {
                return Some(interceptor.clone());
            }

            let host = self.host.clone();
            let candidate = interceptor.clone();
            let map = request_map.clone();
            let kill = Arc::new(AtomicBool::new(false));
            let kill_for_task = kill.clone();
            let task = tokio::task::spawn_blocking(move || {
                host.call_matcher(&candidate, map, kill_for_task)
            });

            match tokio::time::timeout(self.match_timeout, task).await {
                Ok(Ok(Ok(true))) => return Some(interceptor.clone()),
                Ok(Ok(Ok(false))) => {}
                Ok(Ok(Err(error))) => {
                    self.events.append(
                        EventType::MatchError,
                        interceptor.name.clone(),
                        "matches raised an error",
                        Some(request_ref),
                        Some(error),
                    );
                }
                Ok(Err(join_error)) => {
                    self.events.append(
                        EventType::MatchError,
                        interceptor.name.clone(),
                        "matches thread failed",
                        Some(request_ref),
                        Some(join_error.to_string()),
                    );
                }
                Err(_) => {
                    kill.store(true, Ordering::Release);
                    self.events.append(
                        EventType::MatchTimeout,
                        interceptor.name.clone(),
                        format!("matches exceeded {}ms", self.match_timeout.as_millis()),
                        Some(request_ref),
                        None,
                    );
                }
            }
        }
        None
    }

    async fn run_request_phase(
        &self,
        interceptor: Arc<Interceptor>,
        snapshot: Arc<RequestSnapshot>,
        request_ref: RequestRef,
    ) -> RequestPhase {
        let request_id = snapshot.id.clone();
        let name = interceptor.name.clone();

        let (signal_tx, mut signal_rx) = oneshot::channel();
        let (delivery_tx, delivery_rx) = oneshot::channel();
        let forward = Arc::new(ForwardHandle::new(signal_tx, delivery_rx));
        let kill = Arc::new(AtomicBool::new(false));

        let ctx = HandlerContext::new(
            snapshot.clone(),
            forward.clone(),
            ProcsiClient::new(self.repo.clone()),
            self.events.clone(),
            name.clone(),
        );

        self.pending.insert(
            request_id.clone(),
            PendingEntry {
                interceptor: interceptor.clone(),
                delivery: Some(delivery_tx),
                handler_task: None,
                stashed: None,
                forward: forward.clone(),
                kill: kill.clone(),
                request_ref: request_ref.clone(),
            },
        );

        let host = self.host.clone();
        let kill_for_task = kill.clone();
        let task_interceptor = interceptor.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            host.call_handler(&task_interceptor, ctx, kill_for_task)
        });

        let deadline = tokio::time::sleep(self.handler_timeout);
        tokio::pin!(deadline);

        let joined = tokio::select! {
            joined = &mut task => Some(joined),
            _ = &mut signal_rx => None,
            _ = &mut deadline => {
                kill.store(true, Ordering::Release);
                if let Some((_, mut entry)) = self.pending.remove(&request_id) {
                    entry.abort();
                }
                self.events.append(
                    EventType::HandlerTimeout,
                    name,
                    format!("handler exceeded {}ms in the request phase", self.handler_timeout.as_millis()),
                    Some(&request_ref),
                    None,
                );
                return RequestPhase::Pass;
            }
        };

        let Some(joined) = joined else {
            // forward() was requested: park the handler on the pending
            // entry and let the proxy go upstream.
            if let Some(mut entry) = self.pending.get_mut(&request_id) {
                entry.handler_task = Some(task);
            }
            return RequestPhase::Forwarded {
                interception: Interception { name, kind: None },
            };
        };

        // The handler finished during the request phase. Classification
        // depends on whether it called forward(), not on select order.
        let forwarded = forward.was_called();

        let value = match joined {
            Err(join_error) => {
                self.drop_pending(&request_id);
                self.events.append(
                    EventType::HandlerError,
                    name,
                    "handler thread failed",
                    Some(&request_ref),
                    Some(join_error.to_string()),
                );
                return RequestPhase::Pass;
            }
            Ok(Err(script_error)) => {
                self.drop_pending(&request_id);
                self.events.append(
                    EventType::HandlerError,
                    name,
                    "handler raised an error",
                    Some(&request_ref),
                    Some(script_error),
                );
                return RequestPhase::Pass;
            }
            Ok(Ok(value)) => value,
        };

        match (parse_script_response(&value), forwarded) {
            (ResponseShape::Valid(response), false) => {
                self.drop_pending(&request_id);
                forward.mark_completed();
                self.events.append(
                    EventType::Mocked,
                    name.clone(),
                    format!("served mock with status {}", response.status),
                    Some(&request_ref),
                    None,
                );
                RequestPhase::Mock {
                    response,
                    interception: Interception {
                        name,
                        kind: Some(InterceptionType::Mocked),
                    },
                }
            }
            (ResponseShape::Valid(response), true) => {
                // forward() was called without being awaited to
                // completion; the override applies once the upstream
                // response exists.
                if let Some(mut entry) = self.pending.get_mut(&request_id) {
                    entry.stashed = Some(response);
                }
                RequestPhase::Forwarded {
                    interception: Interception { name, kind: None },
                }
            }
            (ResponseShape::Absent, true) => RequestPhase::Forwarded {
                interception: Interception { name, kind: None },
            },
            (ResponseShape::Absent, false) => {
                self.drop_pending(&request_id);
                forward.mark_completed();
                RequestPhase::Pass
            }
            (ResponseShape::Invalid(reason), _) => {
                self.drop_pending(&request_id);
                forward.mark_completed();
                self.events.append(
                    EventType::InvalidResponse,
                    name,
                    reason,
                    Some(&request_ref),
                    None,
                );
                RequestPhase::Pass
            }
        }
    }

    fn drop_pending(&self, request_id: &str) {
        self.pending.remove(request_id);
    }
}
