// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The dispatcher: checkout/checkin, queueing, backpressure, stats.
//!
//! One task owns all dispatch state: the `available` deque (FIFO of
//! return, which spreads load evenly), the `busy` set, and the two-priority
//! pending queue. Everyone else talks to it through [`DispatcherHandle`]
//! messages, so `available ∩ busy = ∅` and the queue invariants hold by
//! construction rather than by locking discipline.
//!
//! Checkout timeouts are caller-side deadlines: the caller races its reply
//! channel against the timeout and, on expiry, sends an abandon message so
//! the queue entry is reaped promptly instead of leaking until a worker
//! frees up. A checked-out worker travels inside a [`WorkerLease`] whose
//! `Drop` checks it back in, so a cancelled caller future cannot leak a
//! worker out of the pool.

use serde::Serialize;
use std::{collections::{HashMap, VecDeque},
          sync::{Arc,
                 atomic::{AtomicU64, Ordering}},
          time::{Duration, Instant}};
use tokio::sync::{mpsc, oneshot};

use crate::{error::{ErrorContext, PoolError},
            ids::WorkerId,
            worker::{WorkerHandle, WorkerState}};

/// Request priority. `High` entries dispatch ahead of every `Normal` entry;
/// within a class, FIFO order is strict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// How a leased worker came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckinOutcome {
    /// The request completed with a success reply.
    Success,
    /// The request completed with an error (or timed out).
    Error,
    /// The lease was dropped without a completed request.
    Released,
}

/// Point-in-time pool statistics. Pure observation: computing it never
/// changes dispatch state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub busy: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub uptime_ms: u64,
    pub session_count: usize,
    pub requests_served: u64,
    pub errors: u64,
}

impl PoolStats {
    fn empty() -> Self {
        Self {
            size: 0,
            available: 0,
            busy: 0,
            queue_depth: 0,
            in_flight: 0,
            uptime_ms: 0,
            session_count: 0,
            requests_served: 0,
            errors: 0,
        }
    }
}

enum DispatcherMsg {
    Checkout {
        ticket: u64,
        priority: Priority,
        deadline: Instant,
        session_id: Option<String>,
        reply: oneshot::Sender<Result<WorkerHandle, PoolError>>,
    },
    /// Caller's checkout deadline fired; reap its queue entry.
    AbandonCheckout { ticket: u64 },
    Checkin {
        worker_id: WorkerId,
        outcome: CheckinOutcome,
    },
    WorkerReady { handle: WorkerHandle },
    WorkerGone { worker_id: WorkerId },
    /// Restart budget exhausted; reject everything from now on.
    MarkFailed,
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A worker checked out to one caller.
///
/// Either consume it with [`WorkerLease::checkin`] or let it drop: both
/// routes return the worker, so a caller future cancelled mid-request never
/// strands a worker outside the pool.
#[derive(Debug)]
pub(crate) struct WorkerLease {
    handle: WorkerHandle,
    dispatcher: mpsc::UnboundedSender<DispatcherMsg>,
    returned: bool,
}

impl WorkerLease {
    pub fn worker(&self) -> &WorkerHandle {
        &self.handle
    }

    pub fn checkin(mut self, outcome: CheckinOutcome) {
        self.returned = true;
        let _ = self.dispatcher.send(DispatcherMsg::Checkin {
            worker_id: self.handle.id(),
            outcome,
        });
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.returned {
            let _ = self.dispatcher.send(DispatcherMsg::Checkin {
                worker_id: self.handle.id(),
                outcome: CheckinOutcome::Released,
            });
        }
    }
}

/// Clonable address of the dispatcher task.
#[derive(Debug, Clone)]
pub(crate) struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    tickets: Arc<AtomicU64>,
    pool_name: Arc<str>,
}

impl DispatcherHandle {
    /// Checks out a worker, queueing under saturation, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// [`PoolError::CheckoutTimeout`] when no worker frees up in time,
    /// [`PoolError::QueueFull`] past the queue bound, and
    /// [`PoolError::PoolShutdown`] / [`PoolError::PoolFailed`] when the pool
    /// is no longer serving.
    pub async fn checkout(
        &self,
        priority: Priority,
        timeout: Duration,
        session_id: Option<&str>,
    ) -> Result<WorkerLease, PoolError> {
        let context = || {
            ErrorContext::for_pool(self.pool_name.as_ref()).with_session(session_id)
        };
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(DispatcherMsg::Checkout {
                ticket,
                priority,
                deadline: Instant::now() + timeout,
                session_id: session_id.map(ToOwned::to_owned),
                reply: reply_tx,
            })
            .map_err(|_| PoolError::PoolShutdown { context: context() })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_elapsed) => {
                let _ = self.tx.send(DispatcherMsg::AbandonCheckout { ticket });
                Err(PoolError::CheckoutTimeout {
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    context: context(),
                })
            }
            Ok(Err(_dispatcher_gone)) => {
                Err(PoolError::PoolShutdown { context: context() })
            }
            Ok(Ok(Err(error))) => Err(error),
            Ok(Ok(Ok(handle))) => Ok(WorkerLease {
                handle,
                dispatcher: self.tx.clone(),
                returned: false,
            }),
        }
    }

    pub fn worker_ready(&self, handle: WorkerHandle) {
        let _ = self.tx.send(DispatcherMsg::WorkerReady { handle });
    }

    pub fn worker_gone(&self, worker_id: WorkerId) {
        let _ = self.tx.send(DispatcherMsg::WorkerGone { worker_id });
    }

    pub fn mark_failed(&self) {
        let _ = self.tx.send(DispatcherMsg::MarkFailed);
    }

    /// Snapshot of dispatch state. `session_count` is filled in by the pool
    /// facade, which owns the session tracker.
    pub async fn stats(&self) -> PoolStats {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(DispatcherMsg::Stats { reply: reply_tx }).is_err() {
            return PoolStats::empty();
        }
        reply_rx.await.unwrap_or_else(|_| PoolStats::empty())
    }

    /// Stops checkout, fails every queued request with `pool_shutdown`.
    /// Idempotent; worker draining is the supervisor's side of shutdown.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(DispatcherMsg::Shutdown { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

struct QueueEntry {
    ticket: u64,
    deadline: Instant,
    enqueued_at: Instant,
    session_id: Option<String>,
    reply: oneshot::Sender<Result<WorkerHandle, PoolError>>,
}

struct Dispatcher {
    pool_name: Arc<str>,
    available: VecDeque<WorkerHandle>,
    busy: HashMap<WorkerId, WorkerHandle>,
    queue_high: VecDeque<QueueEntry>,
    queue_normal: VecDeque<QueueEntry>,
    max_queue_depth: usize,
    shutdown: bool,
    failed: bool,
    started_at: Instant,
    requests_served: u64,
    errors: u64,
}

/// Launches the dispatcher task and returns its handle.
pub(crate) fn spawn_dispatcher(
    pool_name: &str,
    max_queue_depth: usize,
) -> DispatcherHandle {
    let pool_name: Arc<str> = Arc::from(pool_name);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut dispatcher = Dispatcher {
        pool_name: Arc::clone(&pool_name),
        available: VecDeque::new(),
        busy: HashMap::new(),
        queue_high: VecDeque::new(),
        queue_normal: VecDeque::new(),
        max_queue_depth,
        shutdown: false,
        failed: false,
        started_at: Instant::now(),
        requests_served: 0,
        errors: 0,
    };

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            dispatcher.handle(msg);
        }
        tracing::debug!(pool = %dispatcher.pool_name, "dispatcher task exited");
    });

    DispatcherHandle {
        tx,
        tickets: Arc::new(AtomicU64::new(1)),
        pool_name,
    }
}

impl Dispatcher {
    fn handle(&mut self, msg: DispatcherMsg) {
        match msg {
            DispatcherMsg::Checkout {
                ticket,
                priority,
                deadline,
                session_id,
                reply,
            } => self.on_checkout(ticket, priority, deadline, session_id, reply),
            DispatcherMsg::AbandonCheckout { ticket } => {
                self.queue_high.retain(|entry| entry.ticket != ticket);
                self.queue_normal.retain(|entry| entry.ticket != ticket);
            }
            DispatcherMsg::Checkin { worker_id, outcome } => {
                self.on_checkin(worker_id, outcome);
            }
            DispatcherMsg::WorkerReady { handle } => self.on_worker_ready(handle),
            DispatcherMsg::WorkerGone { worker_id } => {
                self.busy.remove(&worker_id);
                self.available.retain(|handle| handle.id() != worker_id);
            }
            DispatcherMsg::MarkFailed => {
                if !self.failed {
                    self.failed = true;
                    tracing::error!(pool = %self.pool_name, "pool marked failed");
                    self.fail_queued(|context| PoolError::PoolFailed { context });
                }
            }
            DispatcherMsg::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            DispatcherMsg::Shutdown { reply } => {
                if !self.shutdown {
                    self.shutdown = true;
                    tracing::info!(pool = %self.pool_name, "dispatcher shutting down");
                    self.fail_queued(|context| PoolError::PoolShutdown { context });
                }
                let _ = reply.send(());
            }
        }
    }

    fn on_checkout(
        &mut self,
        ticket: u64,
        priority: Priority,
        deadline: Instant,
        session_id: Option<String>,
        reply: oneshot::Sender<Result<WorkerHandle, PoolError>>,
    ) {
        let context = ErrorContext::for_pool(self.pool_name.as_ref())
            .with_session(session_id.as_deref());
        if self.shutdown {
            let _ = reply.send(Err(PoolError::PoolShutdown { context }));
            return;
        }
        if self.failed {
            let _ = reply.send(Err(PoolError::PoolFailed { context }));
            return;
        }

        // Fast path: a live worker is waiting.
        while let Some(handle) = self.available.pop_front() {
            if handle.state() == WorkerState::Terminated {
                continue;
            }
            let worker_id = handle.id();
            self.busy.insert(worker_id, handle.clone());
            if reply.send(Ok(handle)).is_err() {
                // Caller vanished between send and receive; undo.
                if let Some(handle) = self.busy.remove(&worker_id) {
                    self.available.push_back(handle);
                }
            }
            return;
        }

        // Saturated: queue, bounded by max_queue_depth.
        self.purge_queues();
        let depth = self.queue_high.len() + self.queue_normal.len();
        if depth >= self.max_queue_depth {
            let _ = reply.send(Err(PoolError::QueueFull {
                depth,
                max: self.max_queue_depth,
                context,
            }));
            return;
        }
        let entry = QueueEntry {
            ticket,
            deadline,
            enqueued_at: Instant::now(),
            session_id,
            reply,
        };
        match priority {
            Priority::High => self.queue_high.push_back(entry),
            Priority::Normal => self.queue_normal.push_back(entry),
        }
    }

    fn on_checkin(&mut self, worker_id: WorkerId, outcome: CheckinOutcome) {
        match outcome {
            CheckinOutcome::Success => self.requests_served += 1,
            CheckinOutcome::Error => {
                self.requests_served += 1;
                self.errors += 1;
            }
            CheckinOutcome::Released => {}
        }
        let Some(handle) = self.busy.remove(&worker_id) else {
            return;
        };
        if handle.state() == WorkerState::Terminated {
            // The supervisor replaces it; a queued request waits for the
            // replacement's WorkerReady.
            return;
        }
        self.offer(handle);
    }

    fn on_worker_ready(&mut self, handle: WorkerHandle) {
        if self.shutdown || self.failed {
            // A replacement that raced shutdown: drain it instead of
            // serving from a pool that no longer dispatches.
            handle.drain();
            return;
        }
        self.offer(handle);
    }

    /// Hands the worker to the longest-waiting live queue entry, or parks it
    /// at the back of `available` (FIFO of return).
    fn offer(&mut self, handle: WorkerHandle) {
        loop {
            let entry = match self.pop_queued() {
                Some(entry) => entry,
                None => {
                    self.available.push_back(handle);
                    return;
                }
            };
            let worker_id = handle.id();
            tracing::trace!(
                pool = %self.pool_name,
                worker = %worker_id,
                waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                session = entry.session_id.as_deref().unwrap_or("-"),
                "dequeued request matched to worker"
            );
            self.busy.insert(worker_id, handle.clone());
            if entry.reply.send(Ok(handle.clone())).is_ok() {
                return;
            }
            // Receiver dropped (deadline raced us); try the next entry.
            self.busy.remove(&worker_id);
        }
    }

    /// Next live queue entry: strict priority across classes, FIFO within.
    fn pop_queued(&mut self) -> Option<QueueEntry> {
        let now = Instant::now();
        for queue in [&mut self.queue_high, &mut self.queue_normal] {
            while let Some(entry) = queue.pop_front() {
                if entry.deadline <= now || entry.reply.is_closed() {
                    continue;
                }
                return Some(entry);
            }
        }
        None
    }

    fn purge_queues(&mut self) {
        let now = Instant::now();
        let live = |entry: &QueueEntry| entry.deadline > now && !entry.reply.is_closed();
        self.queue_high.retain(live);
        self.queue_normal.retain(live);
    }

    fn fail_queued(&mut self, make_error: impl Fn(ErrorContext) -> PoolError) {
        for entry in self
            .queue_high
            .drain(..)
            .chain(self.queue_normal.drain(..))
        {
            let context = ErrorContext::for_pool(self.pool_name.as_ref())
                .with_session(entry.session_id.as_deref());
            let _ = entry.reply.send(Err(make_error(context)));
        }
    }

    fn stats(&mut self) -> PoolStats {
        self.purge_queues();
        self.available
            .retain(|handle| handle.state() != WorkerState::Terminated);
        PoolStats {
            size: self.available.len() + self.busy.len(),
            available: self.available.len(),
            busy: self.busy.len(),
            queue_depth: self.queue_high.len() + self.queue_normal.len(),
            in_flight: self.busy.len(),
            uptime_ms: u64::try_from(self.started_at.elapsed().as_millis())
                .unwrap_or(u64::MAX),
            session_count: 0,
            requests_served: self.requests_served,
            errors: self.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::test_support::ready_handle;
    use pretty_assertions::assert_eq;

    fn dispatcher(max_queue_depth: usize) -> DispatcherHandle {
        spawn_dispatcher("default", max_queue_depth)
    }

    #[tokio::test]
    async fn checkout_hands_out_available_worker() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);

        let lease = handle
            .checkout(Priority::Normal, Duration::from_millis(200), None)
            .await
            .expect("worker should be available");
        assert_eq!(lease.worker().id().to_string(), "worker-1");

        let stats = handle.stats().await;
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.in_flight, 1);
    }

    #[tokio::test]
    async fn checkin_returns_worker_fifo() {
        let handle = dispatcher(10);
        let (first, _inbox_1) = ready_handle(1);
        let (second, _inbox_2) = ready_handle(2);
        handle.worker_ready(first);
        handle.worker_ready(second);

        let lease = handle
            .checkout(Priority::Normal, Duration::from_millis(200), None)
            .await
            .unwrap();
        // FIFO: the first registered worker goes out first.
        assert_eq!(lease.worker().id().to_string(), "worker-1");
        lease.checkin(CheckinOutcome::Success);

        // worker-2 is now at the front, worker-1 re-parked at the back.
        let lease = handle
            .checkout(Priority::Normal, Duration::from_millis(200), None)
            .await
            .unwrap();
        assert_eq!(lease.worker().id().to_string(), "worker-2");
        let lease_2 = handle
            .checkout(Priority::Normal, Duration::from_millis(200), None)
            .await
            .unwrap();
        assert_eq!(lease_2.worker().id().to_string(), "worker-1");
    }

    #[tokio::test]
    async fn saturated_checkout_times_out_with_context() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);

        let _held = handle
            .checkout(Priority::Normal, Duration::from_millis(200), None)
            .await
            .unwrap();

        let error = handle
            .checkout(Priority::Normal, Duration::from_millis(50), Some("s1"))
            .await
            .expect_err("no worker should free up");
        match error {
            PoolError::CheckoutTimeout { context, .. } => {
                assert_eq!(context.pool_name, "default");
                assert_eq!(context.session_id.as_deref(), Some("s1"));
            }
            other => panic!("expected CheckoutTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_caller_is_served_on_checkin() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);

        let lease = handle
            .checkout(Priority::Normal, Duration::from_millis(200), None)
            .await
            .unwrap();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .checkout(Priority::Normal, Duration::from_secs(2), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        lease.checkin(CheckinOutcome::Success);

        let lease = waiter.await.unwrap().expect("queued caller must be served");
        assert_eq!(lease.worker().id().to_string(), "worker-1");
    }

    #[tokio::test]
    async fn queue_overflow_fails_fast() {
        let handle = dispatcher(2);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);
        let _held = handle
            .checkout(Priority::Normal, Duration::from_millis(500), None)
            .await
            .unwrap();

        // Two queue slots fill up...
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let handle = handle.clone();
            waiters.push(tokio::spawn(async move {
                handle
                    .checkout(Priority::Normal, Duration::from_millis(400), None)
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // ...and the third fails fast with queue_full.
        let error = handle
            .checkout(Priority::Normal, Duration::from_millis(400), None)
            .await
            .expect_err("queue is full");
        assert!(matches!(error, PoolError::QueueFull { depth: 2, max: 2, .. }));

        drop(waiters);
    }

    #[tokio::test]
    async fn high_priority_dispatches_before_normal() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);
        let lease = handle
            .checkout(Priority::Normal, Duration::from_millis(500), None)
            .await
            .unwrap();

        let normal_waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .checkout(Priority::Normal, Duration::from_secs(2), Some("normal"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let high_waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .checkout(Priority::High, Duration::from_secs(2), Some("high"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Return the worker once: the high-priority caller must win even
        // though it enqueued later.
        lease.checkin(CheckinOutcome::Success);
        let high_lease = high_waiter.await.unwrap().expect("high priority first");
        high_lease.checkin(CheckinOutcome::Success);

        let normal_lease = normal_waiter.await.unwrap().expect("normal served next");
        normal_lease.checkin(CheckinOutcome::Success);
    }

    #[tokio::test]
    async fn dropped_lease_checks_worker_back_in() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);

        {
            let _lease = handle
                .checkout(Priority::Normal, Duration::from_millis(200), None)
                .await
                .unwrap();
            // Dropped here without explicit checkin.
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = handle.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(stats.busy, 0);
        // A released lease is not a served request.
        assert_eq!(stats.requests_served, 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_checkouts_and_is_idempotent() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);

        handle.shutdown().await;
        handle.shutdown().await;

        let error = handle
            .checkout(Priority::Normal, Duration::from_millis(100), None)
            .await
            .expect_err("shutdown pool must refuse");
        assert!(matches!(error, PoolError::PoolShutdown { .. }));
    }

    #[tokio::test]
    async fn shutdown_fails_queued_requests() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);
        let _held = handle
            .checkout(Priority::Normal, Duration::from_millis(500), None)
            .await
            .unwrap();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .checkout(Priority::Normal, Duration::from_secs(5), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PoolError::PoolShutdown { .. })));
    }

    #[tokio::test]
    async fn mark_failed_rejects_with_pool_failed() {
        let handle = dispatcher(10);
        handle.mark_failed();
        let error = handle
            .checkout(Priority::Normal, Duration::from_millis(100), None)
            .await
            .expect_err("failed pool must reject");
        assert!(matches!(error, PoolError::PoolFailed { .. }));
    }

    #[tokio::test]
    async fn stats_is_a_pure_observation() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        handle.worker_ready(worker);

        let first = handle.stats().await;
        let second = handle.stats().await;
        assert_eq!(first.available, second.available);
        assert_eq!(first.size, second.size);
        assert_eq!(first.requests_served, second.requests_served);
    }

    #[tokio::test]
    async fn worker_gone_removes_from_available() {
        let handle = dispatcher(10);
        let (worker, _inbox) = ready_handle(1);
        let worker_id = worker.id();
        handle.worker_ready(worker);

        handle.worker_gone(worker_id);
        let stats = handle.stats().await;
        assert_eq!(stats.size, 0);
    }
}
