// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The pool facade: the caller-level API over dispatcher + supervisor.
//!
//! [`ScriptPool::start`] boots everything (dispatcher task, parallel worker
//! startup under the supervisor, session sweeper) and hands back one value
//! that is cheap to share behind an `Arc`. [`ScriptPool::execute`] is the
//! whole request path: normalize the command name, record the session,
//! enforce the message-size bound, check a worker out, run the framed
//! exchange under a deadline, and check the worker back in on every exit
//! path.
//!
//! Session ids are injected into `args` for server-side observability; the
//! subprocess SHOULD ignore them for dispatch purposes, and the pool
//! certainly does: worker selection never sees session state.

use serde_json::Value;
use std::{sync::{Arc,
                 atomic::{AtomicBool, Ordering}},
          time::Duration};
use tokio::sync::oneshot;

use crate::{config::PoolConfig,
            dispatcher::{CheckinOutcome, DispatcherHandle, PoolStats, Priority,
                         spawn_dispatcher},
            error::{ErrorContext, PoolError},
            ids::RequestIds,
            registry::Registry,
            session::{SessionRecord, SessionTracker},
            supervisor::{SupervisorHandle, start_supervisor},
            worker::WorkerSnapshot};

/// Per-call knobs. Anything left `None` falls back to the pool config.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub checkout_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub priority: Priority,
}

impl ExecuteOptions {
    #[must_use]
    pub fn high_priority(mut self) -> Self {
        self.priority = Priority::High;
        self
    }
}

/// A running process pool.
#[derive(Debug)]
pub struct ScriptPool {
    config: Arc<PoolConfig>,
    dispatcher: DispatcherHandle,
    supervisor: SupervisorHandle,
    registry: Registry,
    sessions: SessionTracker,
    request_ids: RequestIds,
    shut_down: AtomicBool,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ScriptPool {
    /// Validates the config, boots `pool_size` workers in parallel, and
    /// returns once at least `min_ready` of them finished their init
    /// handshake (stragglers keep starting in the background).
    ///
    /// # Errors
    ///
    /// [`PoolError::StartError`] on config validation failure or when fewer
    /// than `min_ready` workers came up.
    pub async fn start(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let config = Arc::new(config);

        let registry = Registry::default();
        let dispatcher = spawn_dispatcher(&config.name, config.max_queue_depth);
        let request_ids = RequestIds::default();
        let supervisor = start_supervisor(
            Arc::clone(&config),
            registry.clone(),
            dispatcher.clone(),
            request_ids.clone(),
        )
        .await?;

        let sessions =
            SessionTracker::new(config.max_sessions, config.session_idle_ttl());
        let sweep_every =
            Duration::from_millis((config.session_idle_ttl_ms / 4).clamp(1000, 60_000));
        let sweeper = sessions.spawn_sweeper(sweep_every);

        Ok(Self {
            config,
            dispatcher,
            supervisor,
            registry,
            sessions,
            request_ids,
            shut_down: AtomicBool::new(false),
            sweeper,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Executes `command` on some healthy worker, tracked under
    /// `session_id`. `args` must be a JSON object (the wire contract);
    /// anything else fails with `invalid_args` before any side effects.
    ///
    /// # Errors
    ///
    /// Any [`PoolError`] from the taxonomy; never a panic. The dispatcher
    /// does not retry on the caller's behalf.
    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
        args: Value,
        options: ExecuteOptions,
    ) -> Result<Value, PoolError> {
        self.execute_inner(Some(session_id), command, args, options)
            .await
    }

    /// [`ScriptPool::execute`] without session tracking.
    ///
    /// # Errors
    ///
    /// Same failure surface as [`ScriptPool::execute`].
    pub async fn execute_anonymous(
        &self,
        command: &str,
        args: Value,
        options: ExecuteOptions,
    ) -> Result<Value, PoolError> {
        self.execute_inner(None, command, args, options).await
    }

    async fn execute_inner(
        &self,
        session_id: Option<&str>,
        command: &str,
        args: Value,
        options: ExecuteOptions,
    ) -> Result<Value, PoolError> {
        let context = ErrorContext::for_pool(&self.config.name).with_session(session_id);
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown { context });
        }

        let command = normalize_command(command);

        // The wire contract requires `args` to be a JSON object; reject
        // anything else before session tracking or wire side effects.
        let mut args = args;
        if !args.is_object() {
            return Err(PoolError::InvalidArgs {
                detail: format!("args must be a JSON object, got {}", json_kind(&args)),
                context,
            });
        }

        if let Some(session_id) = session_id {
            // Observability only; dispatch below never reads session state.
            self.sessions.touch(session_id);
            if let Some(object) = args.as_object_mut() {
                object.insert("session_id".into(), Value::String(session_id.into()));
            }
        }

        let serialized_len = match serde_json::to_vec(&args) {
            Ok(bytes) => bytes.len(),
            Err(error) => {
                return Err(PoolError::FramingError {
                    detail: format!("args are not serializable: {error}"),
                    context,
                });
            }
        };
        if serialized_len > self.config.max_message_size {
            return Err(PoolError::MessageTooLarge {
                len: serialized_len,
                max: self.config.max_message_size,
                context,
            });
        }

        let checkout_timeout = options
            .checkout_timeout
            .unwrap_or_else(|| self.config.checkout_timeout());
        let request_timeout = options
            .request_timeout
            .unwrap_or_else(|| self.config.request_timeout());

        let lease = self
            .dispatcher
            .checkout(options.priority, checkout_timeout, session_id)
            .await?;
        let worker = lease.worker().clone();
        let request_id = self.request_ids.next();
        let request_context = context
            .clone()
            .with_worker(worker.id().to_string())
            .with_request(request_id);

        let (reply_tx, reply_rx) = oneshot::channel();
        if let Err(error) = worker.send(request_id, command, args, reply_tx) {
            lease.checkin(CheckinOutcome::Error);
            return Err(error.enrich(&request_context));
        }

        match tokio::time::timeout(request_timeout, reply_rx).await {
            Err(_elapsed) => {
                // Reap the mailbox entry; a late response is dropped as an
                // orphan. The command may still complete in the subprocess.
                worker.abandon(request_id);
                lease.checkin(CheckinOutcome::Error);
                Err(PoolError::RequestTimeout {
                    waited_ms: u64::try_from(request_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    context: request_context,
                })
            }
            Ok(Err(_reply_dropped)) => {
                lease.checkin(CheckinOutcome::Error);
                Err(PoolError::WorkerDied {
                    context: request_context,
                })
            }
            Ok(Ok(Ok(result))) => {
                lease.checkin(CheckinOutcome::Success);
                Ok(result)
            }
            Ok(Ok(Err(error))) => {
                lease.checkin(CheckinOutcome::Error);
                Err(error.enrich(&request_context))
            }
        }
    }

    /// Point-in-time statistics; pure observation.
    pub async fn stats(&self) -> PoolStats {
        let mut stats = self.dispatcher.stats().await;
        stats.session_count = self.sessions.len();
        stats
    }

    /// Snapshot of every tracked session.
    pub fn session_info(&self) -> std::collections::HashMap<String, SessionRecord> {
        self.sessions.snapshot()
    }

    /// Drops one session record. Affects observability only; no worker
    /// state changes.
    pub fn remove_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.remove(session_id)
    }

    /// Per-worker observability snapshots.
    pub fn worker_info(&self) -> Vec<WorkerSnapshot> {
        self.registry
            .all()
            .iter()
            .map(super::worker::WorkerHandle::snapshot)
            .collect()
    }

    /// Graceful shutdown: refuse new work, fail the queue, drain every
    /// worker, and wait up to `drain_timeout` (config default when `None`)
    /// before force-terminating stragglers. Idempotent.
    pub async fn shutdown(&self, drain_timeout: Option<Duration>) {
        self.shut_down.store(true, Ordering::Release);
        let drain_timeout =
            drain_timeout.unwrap_or_else(|| self.config.drain_timeout());
        self.dispatcher.shutdown().await;
        self.supervisor.shutdown(drain_timeout).await;
        self.sweeper.abort();
    }
}

impl Drop for ScriptPool {
    fn drop(&mut self) {
        self.sweeper.abort();
        if !self.shut_down.load(Ordering::Acquire) {
            // Best effort when dropped without an explicit shutdown; the
            // subprocesses also carry kill-on-drop.
            for handle in self.registry.all() {
                handle.drain();
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Canonical command form: lowercase snake_case. Camel humps, hyphens,
/// spaces, and dots all become underscores.
fn normalize_command(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_lower_or_digit = false;
    for ch in raw.trim().chars() {
        if ch == '-' || ch == ' ' || ch == '.' {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
        } else if ch.is_uppercase() {
            if prev_lower_or_digit && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower_or_digit = false;
        } else {
            out.push(ch);
            prev_lower_or_digit = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}
