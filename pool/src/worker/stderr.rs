// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Bounded capture of a worker subprocess's stderr.
//!
//! Workers are free to chatter on stderr (tracing output, runtime warnings).
//! None of it is interesting until the worker dies, at which point the last
//! few lines are usually the whole story. The ring buffer keeps exactly
//! that: the most recent [`STDERR_RING_CAPACITY`] lines, surfaced in
//! `start_error` / `worker_died` diagnostics. Spontaneous log frames on
//! stdout (id `-1`) are routed here as well.

use std::{collections::VecDeque, sync::Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::ids::WorkerId;

/// Maximum retained stderr lines per worker.
pub(crate) const STDERR_RING_CAPACITY: usize = 256;

/// How many lines of the tail go into error details.
pub(crate) const STDERR_TAIL_LINES: usize = 10;

#[derive(Debug, Default)]
pub(crate) struct StderrBuffer {
    lines: Mutex<VecDeque<String>>,
}

impl StderrBuffer {
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("stderr ring lock poisoned");
        if lines.len() == STDERR_RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The last `n` captured lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().expect("stderr ring lock poisoned");
        lines.iter().rev().take(n).rev().cloned().collect()
    }

    /// The tail joined for embedding in an error detail string.
    pub fn tail_for_diagnostics(&self) -> String {
        let tail = self.tail(STDERR_TAIL_LINES);
        if tail.is_empty() {
            "<no stderr captured>".into()
        } else {
            tail.join(" | ")
        }
    }
}

/// Reads the subprocess's stderr line by line into the ring buffer until
/// EOF. Runs as its own task for the worker's whole lifetime.
pub(crate) fn spawn_stderr_reader(
    stderr: tokio::process::ChildStderr,
    buffer: std::sync::Arc<StderrBuffer>,
    id: WorkerId,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::trace!(worker = %id, stderr_line = %line);
                    buffer.push(line);
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(worker = %id, %error, "stderr read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ring_keeps_only_the_most_recent_lines() {
        let buffer = StderrBuffer::default();
        for i in 0..(STDERR_RING_CAPACITY + 10) {
            buffer.push(format!("line {i}"));
        }
        let tail = buffer.tail(STDERR_RING_CAPACITY + 10);
        assert_eq!(tail.len(), STDERR_RING_CAPACITY);
        assert_eq!(tail.first().unwrap(), "line 10");
        assert_eq!(
            tail.last().unwrap(),
            &format!("line {}", STDERR_RING_CAPACITY + 9)
        );
    }

    #[test]
    fn tail_is_oldest_first() {
        let buffer = StderrBuffer::default();
        buffer.push("first".into());
        buffer.push("second".into());
        buffer.push("third".into());
        assert_eq!(buffer.tail(2), vec!["second".to_owned(), "third".to_owned()]);
    }

    #[test]
    fn diagnostics_tail_handles_empty_capture() {
        let buffer = StderrBuffer::default();
        assert_eq!(buffer.tail_for_diagnostics(), "<no stderr captured>");
        buffer.push("panic: oh no".into());
        assert_eq!(buffer.tail_for_diagnostics(), "panic: oh no");
    }
}
