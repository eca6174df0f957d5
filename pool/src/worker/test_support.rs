// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! In-crate test fixtures: worker handles with no subprocess behind them.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::{handle::{WorkerHandle, WorkerShared},
            stderr::StderrBuffer,
            task::WorkerMsg};
use crate::{ids::{RequestIds, WorkerId},
            worker::WorkerState};

/// A `ready` handle whose inbox is a bare channel. Useful for dispatcher and
/// registry tests that exercise bookkeeping, not subprocess I/O. Keep the
/// receiver alive for as long as the handle must look ready.
pub(crate) fn ready_handle(
    raw_id: u64,
) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerMsg>) {
    let shared = Arc::new(WorkerShared::new(Arc::new(StderrBuffer::default())));
    shared.set_state(WorkerState::Ready);
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let handle = WorkerHandle::new(
        WorkerId::new(raw_id),
        Arc::from("default"),
        inbox_tx,
        shared,
        RequestIds::default(),
    );
    (handle, inbox_rx)
}
