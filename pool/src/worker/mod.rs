// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The worker: one subprocess, exclusively owned by one tokio task.
//!
//! Each worker is an actor. The task in [`task`] owns the
//! [`tokio::process::Child`], its stdin writer, and the pending mailbox of
//! in-flight requests; everyone else holds a [`WorkerHandle`], a logical
//! address that can enqueue sends, probes, and drain/terminate commands but
//! can never touch the subprocess directly. A dedicated reader task decodes
//! stdout frames and feeds them back through the same inbox, so every state
//! mutation happens on the worker task.
//!
//! Responses are correlated by request id through the pending mailbox and
//! delivered to the caller's reply address exactly once; a response whose id
//! has already been reaped (request timeout) is logged as an orphan and
//! dropped. stderr output lands in a bounded ring buffer that is surfaced
//! when the worker dies.

mod handle;
mod stderr;
mod task;

#[cfg(test)]
pub(crate) mod test_support;

pub use handle::{HealthReport, WorkerHandle, WorkerSnapshot, WorkerState};
pub(crate) use task::{TerminationReason, WorkerEvent, spawn_worker};
