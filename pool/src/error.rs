// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Structured error taxonomy for the pool API.
//!
//! Every failure carries a `(category, type)` pair plus an [`ErrorContext`]
//! naming the pool and, where known, the session, worker, and request
//! involved. Callers branch on [`PoolError::category`] /
//! [`PoolError::kind`]; the [`Display`](std::fmt::Display) rendition is the
//! human message. Nothing in the pool panics across the public API, and no
//! error is ever swallowed: the dispatcher never retries on the caller's
//! behalf, because commands may not be idempotent.

use serde_json::Value;

/// Coarse error category, the first half of the `(category, type)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    TimeoutError,
    ResourceError,
    CommunicationError,
    ProtocolError,
    WorkerError,
}

/// Diagnostic context attached to every [`PoolError`].
///
/// The pool name is always present; the rest is filled in as far as the
/// failure site knows it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub pool_name: String,
    pub session_id: Option<String>,
    pub worker_id: Option<String>,
    pub request_id: Option<u64>,
}

impl ErrorContext {
    pub fn for_pool(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(ToOwned::to_owned);
        self
    }

    #[must_use]
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    #[must_use]
    pub fn with_request(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool={}", self.pool_name)?;
        if let Some(session_id) = &self.session_id {
            write!(f, " session={session_id}")?;
        }
        if let Some(worker_id) = &self.worker_id {
            write!(f, " worker={worker_id}")?;
        }
        if let Some(request_id) = self.request_id {
            write!(f, " request={request_id}")?;
        }
        Ok(())
    }
}

/// Every failure the pool API can return.
///
/// The variant set mirrors the wire-facing taxonomy exactly; see
/// [`PoolError::category`] and [`PoolError::kind`] for the `(category,
/// type)` mapping.
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
pub enum PoolError {
    /// No worker became available before the checkout deadline.
    #[error("no worker became available within {waited_ms} ms ({context})")]
    #[diagnostic(
        code(scriptpool::timeout::checkout),
        help(
            "The pool is saturated. Retry with backoff, raise `pool_size`, \
             or raise `checkout_timeout_ms`."
        )
    )]
    CheckoutTimeout { waited_ms: u64, context: ErrorContext },

    /// The worker accepted the request but produced no response in time.
    ///
    /// The command may still have executed; its late response is dropped as
    /// an orphan.
    #[error("no response within {waited_ms} ms, side effect indeterminate ({context})")]
    #[diagnostic(code(scriptpool::timeout::request))]
    RequestTimeout { waited_ms: u64, context: ErrorContext },

    /// The pool is shutting down or already shut down.
    #[error("pool is shut down ({context})")]
    #[diagnostic(code(scriptpool::resource::pool_shutdown))]
    PoolShutdown { context: ErrorContext },

    /// The restart budget was exhausted and the pool declared itself failed.
    #[error("pool failed: worker restart budget exhausted ({context})")]
    #[diagnostic(
        code(scriptpool::resource::pool_failed),
        help(
            "Workers are crash-looping. Inspect the worker executable and its \
             stderr capture, then restart the pool."
        )
    )]
    PoolFailed { context: ErrorContext },

    /// The pending-request queue is at `max_queue_depth`.
    #[error("request queue is full at {depth}/{max} entries ({context})")]
    #[diagnostic(code(scriptpool::resource::queue_full))]
    QueueFull {
        depth: usize,
        max: usize,
        context: ErrorContext,
    },

    /// The named pool does not exist.
    #[error("pool `{pool_name}` is not available")]
    #[diagnostic(code(scriptpool::resource::pool_not_available))]
    PoolNotAvailable { pool_name: String },

    /// The serialized request exceeds `max_message_size`.
    #[error("request args are {len} bytes which exceeds the {max} byte limit ({context})")]
    #[diagnostic(code(scriptpool::resource::message_too_large))]
    MessageTooLarge {
        len: usize,
        max: usize,
        context: ErrorContext,
    },

    /// The request's `args` violate the wire contract (must be a JSON
    /// object). Rejected before any session or wire side effects.
    #[error("invalid request args: {detail} ({context})")]
    #[diagnostic(
        code(scriptpool::protocol::invalid_args),
        help("Pass `args` as a JSON object, e.g. `{{\"key\": ...}}`.")
    )]
    InvalidArgs {
        detail: String,
        context: ErrorContext,
    },

    /// The worker terminated while it owned the request.
    #[error("worker terminated while owning the request ({context})")]
    #[diagnostic(code(scriptpool::communication::worker_died))]
    WorkerDied { context: ErrorContext },

    /// The worker produced bytes that are not a valid frame. Fatal to the
    /// worker.
    #[error("malformed frame on worker stdout: {detail} ({context})")]
    #[diagnostic(code(scriptpool::communication::framing_error))]
    FramingError {
        detail: String,
        context: ErrorContext,
    },

    /// The worker announced a frame larger than `max_frame_bytes`. Fatal to
    /// the worker.
    #[error("worker frame of {len} bytes exceeds the {max} byte limit ({context})")]
    #[diagnostic(code(scriptpool::communication::oversize_frame))]
    OversizeFrame {
        len: usize,
        max: usize,
        context: ErrorContext,
    },

    /// A response frame was missing required fields.
    #[error("malformed response from worker: {reason} ({context})")]
    #[diagnostic(code(scriptpool::protocol::malformed_response))]
    MalformedResponse {
        reason: String,
        context: ErrorContext,
    },

    /// A request id was reused while still in flight. Indicates a bug in the
    /// id source, never a wire condition.
    #[error("request id {request_id} is already in flight ({context})")]
    #[diagnostic(code(scriptpool::protocol::duplicate_request_id))]
    DuplicateRequestId {
        request_id: u64,
        context: ErrorContext,
    },

    /// The worker is draining and refuses new requests.
    #[error("worker is draining and refuses new requests ({context})")]
    #[diagnostic(code(scriptpool::resource::worker_draining))]
    WorkerDraining { context: ErrorContext },

    /// Subprocess spawn or init handshake failed.
    #[error("worker failed to start: {detail} ({context})")]
    #[diagnostic(code(scriptpool::worker::start_error))]
    StartError {
        detail: String,
        context: ErrorContext,
    },

    /// The subprocess answered with its own error body; `kind` is
    /// runtime-defined.
    #[error("worker reported `{kind}`: {message} ({context})")]
    #[diagnostic(code(scriptpool::worker::runtime_error))]
    WorkerRuntime {
        kind: String,
        message: String,
        details: Option<Value>,
        context: ErrorContext,
    },
}

impl PoolError {
    /// The error's category, the first half of the `(category, type)` pair.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CheckoutTimeout { .. } | Self::RequestTimeout { .. } => {
                ErrorCategory::TimeoutError
            }
            Self::PoolShutdown { .. }
            | Self::PoolFailed { .. }
            | Self::QueueFull { .. }
            | Self::PoolNotAvailable { .. }
            | Self::MessageTooLarge { .. }
            | Self::WorkerDraining { .. } => ErrorCategory::ResourceError,
            Self::WorkerDied { .. }
            | Self::FramingError { .. }
            | Self::OversizeFrame { .. } => ErrorCategory::CommunicationError,
            Self::MalformedResponse { .. }
            | Self::DuplicateRequestId { .. }
            | Self::InvalidArgs { .. } => ErrorCategory::ProtocolError,
            Self::StartError { .. } | Self::WorkerRuntime { .. } => {
                ErrorCategory::WorkerError
            }
        }
    }

    /// The error's type name, the second half of the `(category, type)`
    /// pair. For [`PoolError::WorkerRuntime`] this is the runtime-defined
    /// `error.type` from the wire.
    pub fn kind(&self) -> &str {
        match self {
            Self::CheckoutTimeout { .. } => "checkout_timeout",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::PoolShutdown { .. } => "pool_shutdown",
            Self::PoolFailed { .. } => "pool_failed",
            Self::QueueFull { .. } => "queue_full",
            Self::PoolNotAvailable { .. } => "pool_not_available",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::InvalidArgs { .. } => "invalid_args",
            Self::WorkerDied { .. } => "worker_died",
            Self::FramingError { .. } => "framing_error",
            Self::OversizeFrame { .. } => "oversize_frame",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::DuplicateRequestId { .. } => "duplicate_request_id",
            Self::WorkerDraining { .. } => "worker_draining",
            Self::StartError { .. } => "start_error",
            Self::WorkerRuntime { kind, .. } => kind,
        }
    }

    /// Whether the caller may reasonably retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CheckoutTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::QueueFull { .. }
                | Self::WorkerDied { .. }
                | Self::WorkerDraining { .. }
        )
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::CheckoutTimeout { context, .. }
            | Self::RequestTimeout { context, .. }
            | Self::PoolShutdown { context }
            | Self::PoolFailed { context }
            | Self::QueueFull { context, .. }
            | Self::MessageTooLarge { context, .. }
            | Self::InvalidArgs { context, .. }
            | Self::WorkerDied { context }
            | Self::FramingError { context, .. }
            | Self::OversizeFrame { context, .. }
            | Self::MalformedResponse { context, .. }
            | Self::DuplicateRequestId { context, .. }
            | Self::WorkerDraining { context }
            | Self::StartError { context, .. }
            | Self::WorkerRuntime { context, .. } => Some(context),
            Self::PoolNotAvailable { .. } => None,
        }
    }

    /// Fills in context fields the failure site did not know, leaving
    /// already-populated ones untouched.
    #[must_use]
    pub fn enrich(mut self, extra: &ErrorContext) -> Self {
        if let Some(context) = self.context_mut() {
            if context.pool_name.is_empty() {
                context.pool_name.clone_from(&extra.pool_name);
            }
            if context.session_id.is_none() {
                context.session_id.clone_from(&extra.session_id);
            }
            if context.worker_id.is_none() {
                context.worker_id.clone_from(&extra.worker_id);
            }
            if context.request_id.is_none() {
                context.request_id = extra.request_id;
            }
        }
        self
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::CheckoutTimeout { context, .. }
            | Self::RequestTimeout { context, .. }
            | Self::PoolShutdown { context }
            | Self::PoolFailed { context }
            | Self::QueueFull { context, .. }
            | Self::MessageTooLarge { context, .. }
            | Self::InvalidArgs { context, .. }
            | Self::WorkerDied { context }
            | Self::FramingError { context, .. }
            | Self::OversizeFrame { context, .. }
            | Self::MalformedResponse { context, .. }
            | Self::DuplicateRequestId { context, .. }
            | Self::WorkerDraining { context }
            | Self::StartError { context, .. }
            | Self::WorkerRuntime { context, .. } => Some(context),
            Self::PoolNotAvailable { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn ctx() -> ErrorContext {
        ErrorContext::for_pool("default")
    }

    #[test_case(PoolError::CheckoutTimeout { waited_ms: 5, context: ctx() },
                ErrorCategory::TimeoutError, "checkout_timeout")]
    #[test_case(PoolError::RequestTimeout { waited_ms: 5, context: ctx() },
                ErrorCategory::TimeoutError, "request_timeout")]
    #[test_case(PoolError::PoolShutdown { context: ctx() },
                ErrorCategory::ResourceError, "pool_shutdown")]
    #[test_case(PoolError::PoolFailed { context: ctx() },
                ErrorCategory::ResourceError, "pool_failed")]
    #[test_case(PoolError::QueueFull { depth: 4, max: 4, context: ctx() },
                ErrorCategory::ResourceError, "queue_full")]
    #[test_case(PoolError::WorkerDied { context: ctx() },
                ErrorCategory::CommunicationError, "worker_died")]
    #[test_case(PoolError::FramingError { detail: "x".into(), context: ctx() },
                ErrorCategory::CommunicationError, "framing_error")]
    #[test_case(PoolError::OversizeFrame { len: 2, max: 1, context: ctx() },
                ErrorCategory::CommunicationError, "oversize_frame")]
    #[test_case(PoolError::MalformedResponse { reason: "x".into(), context: ctx() },
                ErrorCategory::ProtocolError, "malformed_response")]
    #[test_case(PoolError::InvalidArgs { detail: "x".into(), context: ctx() },
                ErrorCategory::ProtocolError, "invalid_args")]
    #[test_case(PoolError::DuplicateRequestId { request_id: 1, context: ctx() },
                ErrorCategory::ProtocolError, "duplicate_request_id")]
    #[test_case(PoolError::StartError { detail: "x".into(), context: ctx() },
                ErrorCategory::WorkerError, "start_error")]
    fn taxonomy_pairs_are_stable(
        error: PoolError,
        category: ErrorCategory,
        kind: &str,
    ) {
        assert_eq!(error.category(), category);
        assert_eq!(error.kind(), kind);
    }

    #[test]
    fn runtime_errors_surface_the_wire_type() {
        let error = PoolError::WorkerRuntime {
            kind: "name_error".into(),
            message: "undefined variable".into(),
            details: None,
            context: ctx(),
        };
        assert_eq!(error.category(), ErrorCategory::WorkerError);
        assert_eq!(error.kind(), "name_error");
    }

    #[test]
    fn category_names_render_snake_case() {
        assert_eq!(ErrorCategory::TimeoutError.to_string(), "timeout_error");
        assert_eq!(
            ErrorCategory::CommunicationError.to_string(),
            "communication_error"
        );
    }

    #[test]
    fn enrich_fills_only_missing_fields() {
        let error = PoolError::WorkerDied {
            context: ErrorContext::for_pool("default").with_worker("worker-3"),
        };
        let enriched = error.enrich(
            &ErrorContext::for_pool("ignored")
                .with_session(Some("s1"))
                .with_worker("worker-9")
                .with_request(17),
        );
        let context = enriched.context().unwrap();
        assert_eq!(context.pool_name, "default");
        assert_eq!(context.session_id.as_deref(), Some("s1"));
        assert_eq!(context.worker_id.as_deref(), Some("worker-3"));
        assert_eq!(context.request_id, Some(17));
    }

    #[test]
    fn context_renders_known_fields() {
        let context = ErrorContext::for_pool("default")
            .with_session(Some("s1"))
            .with_request(4);
        assert_eq!(context.to_string(), "pool=default session=s1 request=4");
    }
}
