// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! # scriptpool
//!
//! An async process pool that multiplexes concurrent requests onto a fixed
//! set of long-lived worker subprocesses, each hosting an embedded scripting
//! runtime. Callers hand the pool a command and a JSON args object; the pool
//! dispatches to exactly one healthy worker, runs a length-framed
//! request/response exchange over the worker's stdio, and returns the result
//! or a structured `(category, type)` error.
//!
//! # Architecture
//!
//! Everything is an actor with one owner per resource:
//!
//! - Each **worker** ([`worker`]) is a tokio task exclusively owning its
//!   subprocess handle, stdin writer, and pending-request mailbox, fed by a
//!   dedicated stdout reader task. Responses are correlated by monotonic
//!   request id and delivered exactly once; late responses after a timeout
//!   are dropped as orphans.
//! - The **dispatcher** ([`dispatcher`]) owns checkout/checkin state: a
//!   FIFO-of-return `available` deque, the `busy` set, and a two-priority
//!   bounded queue for callers that arrive under saturation.
//! - The **supervisor** ([`supervisor`]) starts all workers in parallel,
//!   watches termination events, replaces crashed workers under a
//!   sliding-window restart budget, and health-probes idle workers. It never
//!   sits on the request path.
//! - The **registry** ([`registry`]) is a plain discovery table from worker
//!   id to logical handle, and the **session tracker** ([`session`]) is
//!   observability-only bookkeeping that dispatch never consults.
//!
//! The [`pool::ScriptPool`] facade ties these together behind
//! `execute` / `execute_anonymous` / `stats` / `session_info` / `shutdown`.
//!
//! # Example
//!
//! ```rust,no_run
//! use scriptpool::{ExecuteOptions, PoolConfig, ScriptPool, WorkerCommand};
//!
//! # async fn demo() -> Result<(), scriptpool::PoolError> {
//! let config = PoolConfig::with_worker(WorkerCommand::new("/usr/local/bin/rt-worker"));
//! let pool = ScriptPool::start(config).await?;
//!
//! let result = pool
//!     .execute("session-1", "ping", serde_json::json!({}), ExecuteOptions::default())
//!     .await?;
//! assert_eq!(result["status"], "ok");
//!
//! pool.shutdown(None).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod pool;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod worker;

pub use config::{PoolConfig, WorkerCommand};
pub use dispatcher::{PoolStats, Priority};
pub use error::{ErrorCategory, ErrorContext, PoolError};
pub use ids::WorkerId;
pub use pool::{ExecuteOptions, ScriptPool};
pub use session::SessionRecord;
pub use worker::{HealthReport, WorkerSnapshot, WorkerState};
