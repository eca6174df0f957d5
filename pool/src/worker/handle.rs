// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The logical worker handle held by the registry, dispatcher, and
//! supervisor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{sync::{Arc,
                 atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering}},
          time::{Duration, Instant}};
use tokio::sync::{mpsc, oneshot};

use super::{stderr::StderrBuffer, task::WorkerMsg};
use crate::{error::{ErrorContext, PoolError},
            ids::{RequestIds, WorkerId}};

/// Reply address for one in-flight request: receives the command's result or
/// a structured failure, exactly once.
pub(crate) type ReplySender = oneshot::Sender<Result<Value, PoolError>>;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Draining,
    Terminated,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Ready,
            2 => Self::Busy,
            3 => Self::Draining,
            _ => Self::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Ready => 1,
            Self::Busy => 2,
            Self::Draining => 3,
            Self::Terminated => 4,
        }
    }
}

/// Result of a [`WorkerHandle::health_check`] probe.
///
/// An unhealthy report never kills the worker by itself; that decision
/// belongs to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthReport {
    Healthy { latency: Duration },
    Unhealthy { reason: String },
}

/// Observability snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub state: WorkerState,
    pub requests_handled: u64,
    pub errors: u64,
    pub last_latency_ms: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// State shared between the worker task and every handle clone.
///
/// The task is the only writer of `state`; handles read it for cheap
/// observability without a round trip through the inbox.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    state: AtomicU8,
    requests_handled: AtomicU64,
    errors: AtomicU64,
    last_latency_ms: AtomicU64,
    started_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    pub(crate) stderr: Arc<StderrBuffer>,
}

impl WorkerShared {
    pub fn new(stderr: Arc<StderrBuffer>) -> Self {
        let now = Utc::now();
        Self {
            state: AtomicU8::new(WorkerState::Starting.as_u8()),
            requests_handled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
            started_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            stderr,
        }
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn record_response(&self, latency: Duration, is_error: bool) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.last_latency_ms
            .store(latency.as_millis().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_protocol_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Clonable logical address of one worker.
///
/// Holding a handle confers no subprocess ownership: dropping every handle
/// does not kill the worker (the supervisor terminates it explicitly), and
/// no handle method can observe the `Child` directly.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    pool_name: Arc<str>,
    inbox: mpsc::UnboundedSender<WorkerMsg>,
    shared: Arc<WorkerShared>,
    request_ids: RequestIds,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: WorkerId,
        pool_name: Arc<str>,
        inbox: mpsc::UnboundedSender<WorkerMsg>,
        shared: Arc<WorkerShared>,
        request_ids: RequestIds,
    ) -> Self {
        Self {
            id,
            pool_name,
            inbox,
            shared,
            request_ids,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.to_string(),
            state: self.shared.state(),
            requests_handled: self.shared.requests_handled.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
            last_latency_ms: self.shared.last_latency_ms.load(Ordering::Relaxed),
            started_at: self.shared.started_at,
            last_activity_at: DateTime::from_timestamp_millis(
                self.shared.last_activity_ms.load(Ordering::Relaxed),
            )
            .unwrap_or(self.shared.started_at),
        }
    }

    pub(crate) fn error_context(&self) -> ErrorContext {
        ErrorContext::for_pool(self.pool_name.as_ref()).with_worker(self.id.to_string())
    }

    /// Enqueues a request for the subprocess. Returns as soon as the message
    /// is accepted by the worker task's inbox; the response (or failure) is
    /// delivered asynchronously through `reply`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::WorkerDied`] if the worker task is already gone.
    /// Duplicate-id and draining refusals arrive through `reply`, since only
    /// the task owns the pending mailbox.
    pub(crate) fn send(
        &self,
        request_id: u64,
        command: String,
        args: Value,
        reply: ReplySender,
    ) -> Result<(), PoolError> {
        self.inbox
            .send(WorkerMsg::Send {
                request_id,
                command,
                args,
                reply,
            })
            .map_err(|_| PoolError::WorkerDied {
                context: self.error_context().with_request(request_id),
            })
    }

    /// Best-effort reap of a timed-out request's mailbox entry. A response
    /// that still arrives is dropped as an orphan.
    pub(crate) fn abandon(&self, request_id: u64) {
        let _ = self.inbox.send(WorkerMsg::Abandon { request_id });
    }

    /// Asks the worker to stop accepting requests, finish its pending work,
    /// and exit.
    pub(crate) fn drain(&self) {
        let _ = self.inbox.send(WorkerMsg::Drain);
    }

    /// Force-terminates the worker.
    pub(crate) fn terminate(&self, detail: impl Into<String>) {
        let _ = self.inbox.send(WorkerMsg::Terminate {
            detail: detail.into(),
        });
    }

    /// Probes liveness with an internal `ping` carrying a fresh request id.
    ///
    /// Reports [`HealthReport::Unhealthy`] on timeout, on a worker-side
    /// error, or on a dead inbox; it never terminates the worker itself.
    pub async fn health_check(&self, timeout: Duration) -> HealthReport {
        let request_id = self.request_ids.next();
        let (reply_tx, reply_rx) = oneshot::channel();
        let probe_started = Instant::now();

        if self
            .send(
                request_id,
                scriptpool_protocol::commands::PING.into(),
                serde_json::json!({}),
                reply_tx,
            )
            .is_err()
        {
            return HealthReport::Unhealthy {
                reason: "worker task is gone".into(),
            };
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_elapsed) => {
                self.abandon(request_id);
                HealthReport::Unhealthy {
                    reason: format!("no ping response within {} ms", timeout.as_millis()),
                }
            }
            Ok(Err(_dropped)) => HealthReport::Unhealthy {
                reason: "worker dropped the ping reply".into(),
            },
            Ok(Ok(Ok(_result))) => HealthReport::Healthy {
                latency: probe_started.elapsed(),
            },
            Ok(Ok(Err(error))) => HealthReport::Unhealthy {
                reason: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            WorkerState::Starting,
            WorkerState::Ready,
            WorkerState::Busy,
            WorkerState::Draining,
            WorkerState::Terminated,
        ] {
            assert_eq!(WorkerState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn state_renders_snake_case() {
        assert_eq!(WorkerState::Draining.to_string(), "draining");
        assert_eq!(WorkerState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn shared_counters_accumulate() {
        let shared = WorkerShared::new(Arc::new(StderrBuffer::default()));
        shared.record_response(Duration::from_millis(12), false);
        shared.record_response(Duration::from_millis(40), true);
        assert_eq!(shared.requests_handled.load(Ordering::Relaxed), 2);
        assert_eq!(shared.errors.load(Ordering::Relaxed), 1);
        assert_eq!(shared.last_latency_ms.load(Ordering::Relaxed), 40);
    }

    #[test]
    fn shared_state_transitions_are_visible() {
        let shared = WorkerShared::new(Arc::new(StderrBuffer::default()));
        assert_eq!(shared.state(), WorkerState::Starting);
        shared.set_state(WorkerState::Ready);
        assert_eq!(shared.state(), WorkerState::Ready);
        shared.set_state(WorkerState::Terminated);
        assert_eq!(shared.state(), WorkerState::Terminated);
    }
}
