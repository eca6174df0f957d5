// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The worker task: spawn, init handshake, request/response loop, death.
//!
//! Ownership is strict. The task spawned by [`spawn_worker`] is the only
//! holder of the [`Child`], its stdin writer, and the pending mailbox. A
//! reader task decodes stdout frames and a stderr task drains diagnostics,
//! but both only *send into* the worker task's inbox; neither mutates state.
//! Serializing every mutation through one inbox is what makes the state
//! machine exact:
//!
//! ```text
//! starting --init ok--> ready
//! starting --init fail / timeout--> terminated
//! ready --send--> busy
//! busy --response delivered (pending empty)--> ready
//! busy / ready --write error / EOF / stderr fatal--> terminated
//! ready / busy --drain()--> draining
//! draining --pending empty or drain_timeout--> terminated
//! ```
//!
//! Serial-per-worker is dispatcher policy, not a mailbox limitation: the
//! pending map is keyed by request id, so a supervisor health ping may
//! briefly overlap a leased request and both still correlate correctly.

use serde_json::Value;
use std::{collections::HashMap,
          ops::ControlFlow,
          process::Stdio,
          sync::Arc,
          time::Instant};
use tokio::{process::{Child, ChildStdin, ChildStdout, Command},
            sync::mpsc};

use scriptpool_protocol::{FrameError, INIT_REQUEST_ID, MalformedResponse, WireRequest,
                          WireResponse, encode_frame, log_frame_message, parse_response,
                          read_frame, write_frame};

use super::{handle::{ReplySender, WorkerHandle, WorkerShared, WorkerState},
            stderr::{StderrBuffer, spawn_stderr_reader}};
use crate::{config::PoolConfig,
            error::{ErrorContext, PoolError},
            ids::{RequestIds, WorkerId}};

/// Messages accepted by the worker task's inbox.
pub(crate) enum WorkerMsg {
    Send {
        request_id: u64,
        command: String,
        args: Value,
        reply: ReplySender,
    },
    /// Best-effort reap of a timed-out request.
    Abandon { request_id: u64 },
    Drain,
    Terminate { detail: String },
    /// A validated response frame from the reader task.
    Incoming(WireResponse),
    /// A frame that failed response validation (logged, dropped).
    Malformed(MalformedResponse),
    /// The reader task stopped: clean EOF (`None`) or a fatal codec error.
    ReaderClosed(Option<FrameError>),
}

/// Why a worker reached `terminated`. Sent to the supervisor exactly once
/// per worker.
#[derive(Debug)]
pub(crate) enum TerminationReason {
    /// Graceful drain completed (or was force-finished after its timeout).
    /// Never triggers a replacement.
    Drained,
    /// Anything else: crash, stdio failure, framing violation, health kill.
    Crashed { detail: String },
}

/// Termination notification, worker task → supervisor.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub id: WorkerId,
    pub reason: TerminationReason,
}

struct PendingEntry {
    reply: ReplySender,
    sent_at: Instant,
}

/// Spawns the subprocess, runs the init handshake, and on success launches
/// the worker task + reader task, returning a `ready` handle.
///
/// # Errors
///
/// Returns [`PoolError::StartError`] if the spawn fails, the handshake is
/// rejected, or no ok init response arrives within `init_timeout`. The
/// subprocess is killed before returning in every failure path.
pub(crate) async fn spawn_worker(
    id: WorkerId,
    config: Arc<PoolConfig>,
    request_ids: RequestIds,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerHandle, PoolError> {
    let pool_name: Arc<str> = Arc::from(config.name.as_str());
    let start_error = |detail: String| PoolError::StartError {
        detail,
        context: ErrorContext::for_pool(&config.name).with_worker(id.to_string()),
    };

    let mut command = Command::new(&config.worker.exec_path);
    command
        .args(&config.worker.args)
        .envs(&config.worker.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &config.worker.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|error| {
        start_error(format!(
            "failed to spawn `{}`: {error}",
            config.worker.exec_path.display()
        ))
    })?;

    let Some(mut stdin) = child.stdin.take() else {
        return Err(start_error("stdin pipe missing after spawn".into()));
    };
    let Some(mut stdout) = child.stdout.take() else {
        return Err(start_error("stdout pipe missing after spawn".into()));
    };
    let Some(child_stderr) = child.stderr.take() else {
        return Err(start_error("stderr pipe missing after spawn".into()));
    };

    let stderr_buffer = Arc::new(StderrBuffer::default());
    spawn_stderr_reader(child_stderr, Arc::clone(&stderr_buffer), id);
    let shared = Arc::new(WorkerShared::new(Arc::clone(&stderr_buffer)));

    // Init handshake: request id 0, awaited before anything else touches
    // the pipes. Log frames and malformed frames arriving early are
    // tolerated and dropped.
    let init_request = WireRequest::init(serde_json::json!({
        "pool": config.name,
        "worker": id.to_string(),
    }));
    let init_frame = encode_frame(&init_request, config.max_frame_bytes)
        .map_err(|error| start_error(format!("init frame encode failed: {error}")))?;

    let handshake = async {
        write_frame(&mut stdin, &init_frame)
            .await
            .map_err(|error| format!("init write failed: {error}"))?;
        loop {
            match read_frame(&mut stdout, config.max_frame_bytes).await {
                Ok(Some(value)) => match parse_response(&value) {
                    Ok(response) if response.is_log_frame() => {
                        stderr_buffer.push(log_frame_message(&response));
                    }
                    Ok(response)
                        if response.request_id() == Some(INIT_REQUEST_ID) =>
                    {
                        if response.success {
                            return Ok(());
                        }
                        let why = response.error.map_or_else(
                            || "init rejected".into(),
                            |error| format!("{}: {}", error.kind, error.message),
                        );
                        return Err(format!("init rejected by worker: {why}"));
                    }
                    Ok(response) => {
                        tracing::warn!(
                            worker = %id,
                            id = response.id,
                            "unexpected response before init completed, dropped"
                        );
                    }
                    Err(reason) => {
                        tracing::warn!(worker = %id, %reason, "malformed frame during init, dropped");
                    }
                },
                Ok(None) => return Err("worker closed stdout before init response".into()),
                Err(error) => return Err(format!("init read failed: {error}")),
            }
        }
    };

    let handshake_outcome = tokio::time::timeout(config.init_timeout(), handshake).await;
    let failure = match handshake_outcome {
        Ok(Ok(())) => None,
        Ok(Err(detail)) => Some(detail),
        Err(_elapsed) => Some(format!(
            "init handshake timed out after {} ms",
            config.init_timeout_ms
        )),
    };
    if let Some(detail) = failure {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return Err(start_error(format!(
            "{detail}; stderr: {}",
            stderr_buffer.tail_for_diagnostics()
        )));
    }

    shared.set_state(WorkerState::Ready);
    tracing::debug!(worker = %id, pool = %config.name, "worker ready");

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<WorkerMsg>();
    spawn_reader(stdout, config.max_frame_bytes, inbox_tx.clone(), id);

    let handle = WorkerHandle::new(
        id,
        Arc::clone(&pool_name),
        inbox_tx.clone(),
        Arc::clone(&shared),
        request_ids,
    );

    let task = WorkerTask {
        id,
        pool_name,
        config,
        stdin: Some(stdin),
        pending: HashMap::new(),
        shared,
        events,
        inbox_tx,
        draining: false,
        exit_status: None,
    };
    tokio::spawn(task.run(inbox_rx, child));

    Ok(handle)
}

/// Reader task: pulls frames off stdout, validates them, and forwards into
/// the worker inbox until EOF or a fatal codec error.
fn spawn_reader(
    mut stdout: ChildStdout,
    max_frame_bytes: usize,
    inbox: mpsc::UnboundedSender<WorkerMsg>,
    id: WorkerId,
) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut stdout, max_frame_bytes).await {
                Ok(Some(value)) => {
                    let msg = match parse_response(&value) {
                        Ok(response) => WorkerMsg::Incoming(response),
                        Err(reason) => WorkerMsg::Malformed(reason),
                    };
                    if inbox.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = inbox.send(WorkerMsg::ReaderClosed(None));
                    break;
                }
                Err(error) => {
                    tracing::warn!(worker = %id, %error, "worker stdout framing failure");
                    let _ = inbox.send(WorkerMsg::ReaderClosed(Some(error)));
                    break;
                }
            }
        }
    });
}

struct WorkerTask {
    id: WorkerId,
    pool_name: Arc<str>,
    config: Arc<PoolConfig>,
    stdin: Option<ChildStdin>,
    pending: HashMap<u64, PendingEntry>,
    shared: Arc<WorkerShared>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    /// Kept for scheduling the drain deadline back into our own inbox.
    inbox_tx: mpsc::UnboundedSender<WorkerMsg>,
    draining: bool,
    exit_status: Option<std::process::ExitStatus>,
}

enum LoopEvent {
    Msg(WorkerMsg),
    Exited(std::io::Result<std::process::ExitStatus>),
}

impl WorkerTask {
    async fn run(
        mut self,
        mut inbox_rx: mpsc::UnboundedReceiver<WorkerMsg>,
        mut child: Child,
    ) {
        loop {
            let event = tokio::select! {
                maybe = inbox_rx.recv() => match maybe {
                    Some(msg) => LoopEvent::Msg(msg),
                    // Unreachable while self.inbox_tx is alive.
                    None => return,
                },
                status = child.wait(), if self.exit_status.is_none() => {
                    LoopEvent::Exited(status)
                }
            };

            let flow = match event {
                LoopEvent::Msg(msg) => self.handle_msg(msg, &mut child).await,
                LoopEvent::Exited(status) => self.on_child_exit(status, &mut child).await,
            };
            if flow.is_break() {
                return;
            }
        }
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::for_pool(self.pool_name.as_ref()).with_worker(self.id.to_string())
    }

    async fn handle_msg(&mut self, msg: WorkerMsg, child: &mut Child) -> ControlFlow<()> {
        match msg {
            WorkerMsg::Send {
                request_id,
                command,
                args,
                reply,
            } => self.on_send(request_id, command, args, reply, child).await,
            WorkerMsg::Abandon { request_id } => {
                if self.pending.remove(&request_id).is_some() {
                    tracing::debug!(
                        worker = %self.id,
                        request_id,
                        "pending entry reaped after request timeout"
                    );
                    self.after_pending_shrunk();
                }
                ControlFlow::Continue(())
            }
            WorkerMsg::Drain => {
                if !self.draining && self.shared.state() != WorkerState::Terminated {
                    self.draining = true;
                    self.shared.set_state(WorkerState::Draining);
                    tracing::debug!(worker = %self.id, "draining");
                    if self.pending.is_empty() {
                        self.begin_drain_exit();
                    }
                }
                ControlFlow::Continue(())
            }
            WorkerMsg::Terminate { detail } => {
                let reason = if self.draining {
                    TerminationReason::Drained
                } else {
                    TerminationReason::Crashed {
                        detail: detail.clone(),
                    }
                };
                self.terminal(
                    PoolError::WorkerDied {
                        context: self.context(),
                    },
                    reason,
                    child,
                )
                .await;
                ControlFlow::Break(())
            }
            WorkerMsg::Incoming(response) => {
                self.on_response(response);
                ControlFlow::Continue(())
            }
            WorkerMsg::Malformed(reason) => {
                tracing::warn!(
                    worker = %self.id,
                    %reason,
                    "malformed response frame dropped"
                );
                self.shared.record_protocol_error();
                ControlFlow::Continue(())
            }
            WorkerMsg::ReaderClosed(maybe_error) => {
                self.on_reader_closed(maybe_error, child).await
            }
        }
    }

    async fn on_send(
        &mut self,
        request_id: u64,
        command: String,
        args: Value,
        reply: ReplySender,
        child: &mut Child,
    ) -> ControlFlow<()> {
        if self.draining {
            let _ = reply.send(Err(PoolError::WorkerDraining {
                context: self.context().with_request(request_id),
            }));
            return ControlFlow::Continue(());
        }
        if self.pending.contains_key(&request_id) {
            let _ = reply.send(Err(PoolError::DuplicateRequestId {
                request_id,
                context: self.context(),
            }));
            return ControlFlow::Continue(());
        }

        let request = WireRequest::new(request_id, command, args);
        let frame = match encode_frame(&request, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(FrameError::OversizeFrame { len, max }) => {
                let _ = reply.send(Err(PoolError::OversizeFrame {
                    len,
                    max,
                    context: self.context().with_request(request_id),
                }));
                return ControlFlow::Continue(());
            }
            Err(error) => {
                let _ = reply.send(Err(PoolError::FramingError {
                    detail: error.to_string(),
                    context: self.context().with_request(request_id),
                }));
                return ControlFlow::Continue(());
            }
        };

        let Some(stdin) = self.stdin.as_mut() else {
            let _ = reply.send(Err(PoolError::WorkerDied {
                context: self.context().with_request(request_id),
            }));
            return ControlFlow::Continue(());
        };

        self.pending.insert(
            request_id,
            PendingEntry {
                reply,
                sent_at: Instant::now(),
            },
        );
        if self.shared.state() == WorkerState::Ready {
            self.shared.set_state(WorkerState::Busy);
        }
        self.shared.touch();

        if let Err(error) = write_frame(stdin, &frame).await {
            tracing::warn!(worker = %self.id, %error, "stdin write failed");
            self.terminal(
                PoolError::WorkerDied {
                    context: self.context(),
                },
                TerminationReason::Crashed {
                    detail: format!(
                        "stdin write failed: {error}; stderr: {}",
                        self.shared.stderr.tail_for_diagnostics()
                    ),
                },
                child,
            )
            .await;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn on_response(&mut self, response: WireResponse) {
        if response.is_log_frame() {
            self.shared
                .stderr
                .push(format!("[frame] {}", log_frame_message(&response)));
            return;
        }
        let Some(request_id) = response.request_id() else {
            tracing::debug!(worker = %self.id, id = response.id, "response with negative id dropped");
            return;
        };

        match self.pending.remove(&request_id) {
            Some(entry) => {
                let latency = entry.sent_at.elapsed();
                let outcome = if response.success {
                    Ok(response.result.unwrap_or(Value::Null))
                } else {
                    match response.error {
                        Some(error) => Err(PoolError::WorkerRuntime {
                            kind: error.kind,
                            message: error.message,
                            details: error.details,
                            context: self.context().with_request(request_id),
                        }),
                        None => Err(PoolError::MalformedResponse {
                            reason: "failure response without error body".into(),
                            context: self.context().with_request(request_id),
                        }),
                    }
                };
                self.shared.record_response(latency, outcome.is_err());
                let _ = entry.reply.send(outcome);
                self.after_pending_shrunk();
            }
            None => {
                // The caller's deadline reaped this id; the command still ran.
                tracing::warn!(
                    worker = %self.id,
                    request_id,
                    "orphan_response: no pending entry for id"
                );
            }
        }
    }

    /// Shared tail of every path that removes a pending entry.
    fn after_pending_shrunk(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        if self.draining {
            self.begin_drain_exit();
        } else if self.shared.state() == WorkerState::Busy {
            self.shared.set_state(WorkerState::Ready);
        }
    }

    /// Pending is empty and we are draining: close stdin so the subprocess
    /// sees EOF and exits, and arm the force-terminate deadline.
    fn begin_drain_exit(&mut self) {
        if self.stdin.take().is_some() {
            let inbox = self.inbox_tx.clone();
            let drain_timeout = self.config.drain_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(drain_timeout).await;
                let _ = inbox.send(WorkerMsg::Terminate {
                    detail: "drain timed out".into(),
                });
            });
        }
    }

    async fn on_reader_closed(
        &mut self,
        maybe_error: Option<FrameError>,
        child: &mut Child,
    ) -> ControlFlow<()> {
        if self.draining && maybe_error.is_none() {
            // Normal EOF en route to exit; child.wait() finishes the drain.
            return ControlFlow::Continue(());
        }

        let (pending_error, detail) = match maybe_error {
            Some(FrameError::OversizeFrame { len, max }) => (
                PoolError::OversizeFrame {
                    len,
                    max,
                    context: self.context(),
                },
                format!("oversize frame on stdout ({len} > {max} bytes)"),
            ),
            Some(error) => (
                PoolError::FramingError {
                    detail: error.to_string(),
                    context: self.context(),
                },
                format!("stdout framing failure: {error}"),
            ),
            None => (
                PoolError::WorkerDied {
                    context: self.context(),
                },
                format!(
                    "stdout closed; stderr: {}",
                    self.shared.stderr.tail_for_diagnostics()
                ),
            ),
        };
        self.terminal(pending_error, TerminationReason::Crashed { detail }, child)
            .await;
        ControlFlow::Break(())
    }

    async fn on_child_exit(
        &mut self,
        status: std::io::Result<std::process::ExitStatus>,
        child: &mut Child,
    ) -> ControlFlow<()> {
        if let Ok(status) = &status {
            self.exit_status = Some(*status);
        }
        if self.draining {
            self.terminal(
                PoolError::WorkerDied {
                    context: self.context(),
                },
                TerminationReason::Drained,
                child,
            )
            .await;
            return ControlFlow::Break(());
        }

        let detail = match status {
            Ok(status) => format!(
                "subprocess {status}; stderr: {}",
                self.shared.stderr.tail_for_diagnostics()
            ),
            Err(error) => format!("subprocess wait failed: {error}"),
        };
        self.terminal(
            PoolError::WorkerDied {
                context: self.context(),
            },
            TerminationReason::Crashed { detail },
            child,
        )
        .await;
        ControlFlow::Break(())
    }

    /// The single terminal path: retire the id, fail every pending caller,
    /// reap the subprocess, and notify the supervisor exactly once.
    async fn terminal(
        &mut self,
        pending_error: PoolError,
        reason: TerminationReason,
        child: &mut Child,
    ) {
        self.shared.set_state(WorkerState::Terminated);
        self.stdin = None;

        let base_context = self.context();
        let failed = self.pending.len();
        for (request_id, entry) in self.pending.drain() {
            let per_request = pending_error
                .clone()
                .enrich(&base_context.clone().with_request(request_id));
            let _ = entry.reply.send(Err(per_request));
        }
        if failed > 0 {
            tracing::warn!(worker = %self.id, failed, "failed pending requests at termination");
        }

        if self.exit_status.is_none() {
            let _ = child.start_kill();
            if let Ok(status) = child.wait().await {
                self.exit_status = Some(status);
            }
        }

        match &reason {
            TerminationReason::Drained => {
                tracing::info!(worker = %self.id, "worker drained");
            }
            TerminationReason::Crashed { detail } => {
                tracing::error!(worker = %self.id, %detail, "worker terminated");
            }
        }
        let _ = self.events.send(WorkerEvent {
            id: self.id,
            reason,
        });
    }
}
