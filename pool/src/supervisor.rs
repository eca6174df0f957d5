// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The supervisor: keep `pool_size` workers alive, never block dispatch.
//!
//! Startup launches every worker's init in parallel (sequential init would
//! multiply user-visible startup latency by `pool_size`) and succeeds as
//! long as `min_ready` workers finish their handshake, retrying stragglers
//! in the background with bounded attempts.
//!
//! After startup the supervisor loop owns all lifecycle policy: it consumes
//! worker termination events, deregisters the dead worker everywhere,
//! consults the sliding-window restart budget, and spawns replacements with
//! a small randomized backoff so a crash-looping executable cannot hot-spin
//! the spawn path. Exhausting the budget marks the whole pool failed.
//! Request traffic never routes through here; the dispatcher keeps serving
//! while replacements happen on this task.
//!
//! Idle workers are health-probed on an interval; a probe never kills a
//! worker directly, but three consecutive unhealthy reports do (which then
//! flows through the ordinary replacement path, budget included).

use rand::Rng;
use std::{collections::HashMap,
          sync::Arc,
          time::{Duration, Instant}};
use tokio::{sync::{mpsc, oneshot},
            task::JoinSet};

use crate::{config::PoolConfig,
            dispatcher::DispatcherHandle,
            error::{ErrorContext, PoolError},
            ids::{RequestIds, WorkerId, WorkerIds},
            registry::Registry,
            worker::{HealthReport, TerminationReason, WorkerEvent, WorkerHandle,
                     WorkerState, spawn_worker}};

/// Scheduling slack added on top of `init_timeout` for each parallel start.
const INIT_DEADLINE_SLACK: Duration = Duration::from_secs(2);

/// Bounded attempts when a spawn (startup straggler or replacement) fails.
const MAX_SPAWN_ATTEMPTS: u32 = 3;

/// Base of the randomized replacement backoff.
const RESTART_BACKOFF_BASE_MS: u64 = 250;

/// Consecutive unhealthy probes before the supervisor terminates a worker.
const HEALTH_STRIKES: u32 = 3;

enum SupervisorCmd {
    Shutdown {
        drain_timeout: Duration,
        reply: oneshot::Sender<()>,
    },
}

enum SupervisorMsg {
    SpawnOutcome {
        result: Result<WorkerHandle, PoolError>,
        attempt: u32,
    },
    ProbeOutcome {
        id: WorkerId,
        healthy: bool,
        reason: Option<String>,
    },
    DrainDeadline,
}

/// Address of the supervisor task.
#[derive(Debug, Clone)]
pub(crate) struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorCmd>,
}

impl SupervisorHandle {
    /// Drains every worker and waits up to `drain_timeout` before
    /// force-terminating stragglers. Returns once the pool's workers are
    /// gone or given up on.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(SupervisorCmd::Shutdown {
                drain_timeout,
                reply: reply_tx,
            })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// Boots the pool's workers in parallel and launches the supervision loop.
///
/// # Errors
///
/// Returns [`PoolError::StartError`] when fewer than `min_ready` workers
/// complete the init handshake; every already-started worker is terminated
/// before returning.
pub(crate) async fn start_supervisor(
    config: Arc<PoolConfig>,
    registry: Registry,
    dispatcher: DispatcherHandle,
    request_ids: RequestIds,
) -> Result<SupervisorHandle, PoolError> {
    let worker_ids = Arc::new(WorkerIds::default());
    let (events_tx, events_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<SupervisorMsg>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<SupervisorCmd>();

    // Parallel startup: every worker races its own init deadline.
    let mut starts = JoinSet::new();
    for _ in 0..config.pool_size {
        let id = worker_ids.next();
        let config = Arc::clone(&config);
        let request_ids = request_ids.clone();
        let events_tx = events_tx.clone();
        starts.spawn(async move {
            let deadline = config.init_timeout() + INIT_DEADLINE_SLACK;
            match tokio::time::timeout(
                deadline,
                spawn_worker(id, Arc::clone(&config), request_ids, events_tx),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(PoolError::StartError {
                    detail: format!(
                        "worker start exceeded its {} ms deadline",
                        deadline.as_millis()
                    ),
                    context: ErrorContext::for_pool(&config.name)
                        .with_worker(id.to_string()),
                }),
            }
        });
    }

    let mut started = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = starts.join_next().await {
        match joined {
            Ok(Ok(handle)) => started.push(handle),
            Ok(Err(error)) => failures.push(error),
            Err(join_error) => failures.push(PoolError::StartError {
                detail: format!("worker start task panicked: {join_error}"),
                context: ErrorContext::for_pool(&config.name),
            }),
        }
    }

    if started.len() < config.min_ready {
        for handle in &started {
            handle.terminate("startup aborted: min_ready not reached");
        }
        let last = failures
            .last()
            .map_or_else(|| "no failure detail".into(), |error| error.to_string());
        return Err(PoolError::StartError {
            detail: format!(
                "only {} of {} workers started (min_ready {}); last failure: {last}",
                started.len(),
                config.pool_size,
                config.min_ready
            ),
            context: ErrorContext::for_pool(&config.name),
        });
    }

    tracing::info!(
        pool = %config.name,
        ready = started.len(),
        target = config.pool_size,
        "pool workers started"
    );
    for handle in started {
        registry.insert(handle.clone());
        dispatcher.worker_ready(handle);
    }

    // Stragglers keep trying in the background, through the same bounded
    // retry path replacements use.
    for error in failures {
        let _ = internal_tx.send(SupervisorMsg::SpawnOutcome {
            result: Err(error),
            attempt: 1,
        });
    }

    let supervisor = Supervisor {
        config,
        registry,
        dispatcher,
        request_ids,
        worker_ids,
        events_tx,
        internal_tx,
        restarts: Vec::new(),
        health_failures: HashMap::new(),
        shutting_down: false,
        failed: false,
        drain_waiters: Vec::new(),
    };
    tokio::spawn(supervisor.run(events_rx, internal_rx, cmd_rx));

    Ok(SupervisorHandle { tx: cmd_tx })
}

struct Supervisor {
    config: Arc<PoolConfig>,
    registry: Registry,
    dispatcher: DispatcherHandle,
    request_ids: RequestIds,
    worker_ids: Arc<WorkerIds>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    internal_tx: mpsc::UnboundedSender<SupervisorMsg>,
    /// Replacement instants inside the sliding budget window.
    restarts: Vec<Instant>,
    health_failures: HashMap<WorkerId, u32>,
    shutting_down: bool,
    failed: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

enum LoopEvent {
    Worker(WorkerEvent),
    Internal(SupervisorMsg),
    Command(SupervisorCmd),
    HealthTick,
    Stop,
}

impl Supervisor {
    async fn run(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<SupervisorMsg>,
        mut cmd_rx: mpsc::UnboundedReceiver<SupervisorCmd>,
    ) {
        let mut health_interval = self.config.health_check_interval().map(|every| {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so probing
            // starts one interval after boot.
            interval.reset();
            interval
        });

        let mut cmd_open = true;
        loop {
            let event = tokio::select! {
                maybe = events_rx.recv() => {
                    maybe.map_or(LoopEvent::Stop, LoopEvent::Worker)
                }
                maybe = internal_rx.recv() => {
                    maybe.map_or(LoopEvent::Stop, LoopEvent::Internal)
                }
                maybe = cmd_rx.recv(), if cmd_open => {
                    match maybe {
                        Some(cmd) => LoopEvent::Command(cmd),
                        // Pool facade dropped; keep consuming worker events
                        // until the last worker is gone.
                        None => {
                            cmd_open = false;
                            if self.registry.is_empty() {
                                LoopEvent::Stop
                            } else {
                                continue;
                            }
                        }
                    }
                }
                _ = tick(&mut health_interval) => LoopEvent::HealthTick,
            };

            match event {
                LoopEvent::Worker(event) => self.on_worker_event(event),
                LoopEvent::Internal(msg) => self.on_internal(msg),
                LoopEvent::Command(SupervisorCmd::Shutdown {
                    drain_timeout,
                    reply,
                }) => self.on_shutdown(drain_timeout, reply),
                LoopEvent::HealthTick => self.probe_all(),
                LoopEvent::Stop => return,
            }

            if !cmd_open && self.registry.is_empty() {
                return;
            }
        }
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        let WorkerEvent { id, reason } = event;
        self.registry.remove(id);
        self.dispatcher.worker_gone(id);
        self.health_failures.remove(&id);

        if self.shutting_down {
            self.finish_drain_if_done();
            return;
        }

        match reason {
            TerminationReason::Drained => {
                // A drain outside shutdown only happens when a replacement
                // raced pool shutdown; nothing to replace.
                tracing::debug!(worker = %id, "worker drained outside shutdown");
            }
            TerminationReason::Crashed { detail } => {
                tracing::warn!(worker = %id, %detail, "worker lost, considering replacement");
                self.maybe_replace();
            }
        }
    }

    /// Replacement gate: sliding-window restart budget.
    fn maybe_replace(&mut self) {
        if self.failed || self.shutting_down {
            return;
        }
        let window = self.config.max_restarts_window();
        let now = Instant::now();
        self.restarts.retain(|instant| now - *instant < window);

        if self.restarts.len() >= self.config.max_restarts {
            tracing::error!(
                pool = %self.config.name,
                max_restarts = self.config.max_restarts,
                window_ms = self.config.max_restarts_window_ms,
                "restart budget exhausted, pool failed"
            );
            self.failed = true;
            self.dispatcher.mark_failed();
            return;
        }
        self.restarts.push(now);
        self.spawn_replacement(1);
    }

    /// Spawns a replacement on its own task after a jittered backoff; the
    /// outcome comes back through the internal channel.
    fn spawn_replacement(&self, attempt: u32) {
        let config = Arc::clone(&self.config);
        let request_ids = self.request_ids.clone();
        let events_tx = self.events_tx.clone();
        let internal_tx = self.internal_tx.clone();
        let id = self.worker_ids.next();

        let jitter = rand::rng().random_range(0..RESTART_BACKOFF_BASE_MS);
        let backoff = Duration::from_millis(
            RESTART_BACKOFF_BASE_MS * u64::from(attempt.saturating_sub(1)) + jitter,
        );

        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let deadline = config.init_timeout() + INIT_DEADLINE_SLACK;
            let result = match tokio::time::timeout(
                deadline,
                spawn_worker(id, Arc::clone(&config), request_ids, events_tx),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(PoolError::StartError {
                    detail: "replacement start exceeded its deadline".into(),
                    context: ErrorContext::for_pool(&config.name)
                        .with_worker(id.to_string()),
                }),
            };
            let _ = internal_tx.send(SupervisorMsg::SpawnOutcome { result, attempt });
        });
    }

    fn on_internal(&mut self, msg: SupervisorMsg) {
        match msg {
            SupervisorMsg::SpawnOutcome { result, attempt } => match result {
                Ok(handle) => {
                    if self.shutting_down || self.failed {
                        handle.terminate("pool no longer serving");
                        return;
                    }
                    tracing::info!(worker = %handle.id(), "worker joined the pool");
                    self.registry.insert(handle.clone());
                    self.dispatcher.worker_ready(handle);
                }
                Err(error) => {
                    if self.shutting_down || self.failed {
                        return;
                    }
                    if attempt < MAX_SPAWN_ATTEMPTS {
                        tracing::warn!(
                            %error,
                            attempt,
                            "worker start failed, retrying"
                        );
                        self.spawn_replacement(attempt + 1);
                    } else {
                        tracing::error!(
                            %error,
                            attempts = MAX_SPAWN_ATTEMPTS,
                            "worker start failed terminally, pool degraded"
                        );
                        if self.registry.is_empty() {
                            self.failed = true;
                            self.dispatcher.mark_failed();
                        }
                    }
                }
            },
            SupervisorMsg::ProbeOutcome { id, healthy, reason } => {
                self.on_probe(id, healthy, reason);
            }
            SupervisorMsg::DrainDeadline => {
                if self.shutting_down && !self.registry.is_empty() {
                    tracing::warn!(
                        remaining = self.registry.len(),
                        "drain timed out, force-terminating remaining workers"
                    );
                    for handle in self.registry.all() {
                        handle.terminate("pool drain timed out");
                    }
                }
                // Per contract, shutdown returns after the drain window even
                // if stragglers had to be force-terminated.
                for waiter in self.drain_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    fn on_probe(&mut self, id: WorkerId, healthy: bool, reason: Option<String>) {
        if healthy {
            self.health_failures.remove(&id);
            return;
        }
        let strikes = self.health_failures.entry(id).or_insert(0);
        *strikes += 1;
        tracing::warn!(
            worker = %id,
            strikes = *strikes,
            reason = reason.as_deref().unwrap_or("unknown"),
            "health probe failed"
        );
        if *strikes >= HEALTH_STRIKES {
            if let Some(handle) = self.registry.get(id) {
                handle.terminate(format!(
                    "failed {HEALTH_STRIKES} consecutive health probes"
                ));
            }
        }
    }

    /// Probes every idle worker; results come back as internal messages so
    /// slow probes never stall this loop.
    fn probe_all(&self) {
        if self.shutting_down || self.failed {
            return;
        }
        for handle in self.registry.all() {
            if handle.state() != WorkerState::Ready {
                continue;
            }
            let internal_tx = self.internal_tx.clone();
            let timeout = self.config.health_check_timeout();
            tokio::spawn(async move {
                let id = handle.id();
                let report = handle.health_check(timeout).await;
                let (healthy, reason) = match report {
                    HealthReport::Healthy { .. } => (true, None),
                    HealthReport::Unhealthy { reason } => (false, Some(reason)),
                };
                let _ = internal_tx.send(SupervisorMsg::ProbeOutcome {
                    id,
                    healthy,
                    reason,
                });
            });
        }
    }

    fn on_shutdown(&mut self, drain_timeout: Duration, reply: oneshot::Sender<()>) {
        if self.registry.is_empty() {
            let _ = reply.send(());
            self.shutting_down = true;
            return;
        }
        self.drain_waiters.push(reply);
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        tracing::info!(
            pool = %self.config.name,
            workers = self.registry.len(),
            "draining pool workers"
        );
        for handle in self.registry.all() {
            handle.drain();
        }
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(drain_timeout).await;
            let _ = internal_tx.send(SupervisorMsg::DrainDeadline);
        });
    }

    fn finish_drain_if_done(&mut self) {
        if self.registry.is_empty() {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
