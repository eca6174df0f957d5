// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Session tracker: observability only, by construction.
//!
//! The dispatcher updates this table fire-and-forget; nothing in checkout or
//! worker selection ever reads it. That one-way dependency is the invariant
//! worth protecting: if session affinity is ever wanted, it must be built
//! as a layer *above* the pool, not wired in here.
//!
//! The table is bounded twice over: a background sweeper evicts records idle
//! past `session_idle_ttl`, and inserts past `max_sessions` evict the
//! longest-inactive record first.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::{collections::HashMap,
          sync::{Arc, Mutex},
          time::Duration};

/// One session's observability record.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub operations: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionTracker {
    inner: Arc<Mutex<HashMap<String, SessionRecord>>>,
    max_sessions: usize,
    idle_ttl: Duration,
}

impl SessionTracker {
    pub fn new(max_sessions: usize, idle_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_sessions,
            idle_ttl,
        }
    }

    /// Records one operation for `session_id`, creating the record on first
    /// sight. Fire-and-forget: never fails, never blocks on anything but the
    /// table lock.
    pub fn touch(&self, session_id: &str) {
        let now = Utc::now();
        let mut table = self.inner.lock().expect("session table lock poisoned");

        if let Some(record) = table.get_mut(session_id) {
            record.operations += 1;
            record.last_activity_at = now;
            return;
        }

        if table.len() >= self.max_sessions {
            Self::evict_oldest(&mut table);
        }
        table.insert(
            session_id.to_owned(),
            SessionRecord {
                operations: 1,
                started_at: now,
                last_activity_at: now,
            },
        );
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner
            .lock()
            .expect("session table lock poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner
            .lock()
            .expect("session table lock poisoned")
            .remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> HashMap<String, SessionRecord> {
        self.inner
            .lock()
            .expect("session table lock poisoned")
            .clone()
    }

    /// Evicts records idle longer than the TTL. Returns how many went.
    pub(crate) fn sweep(&self, now: DateTime<Utc>) -> usize {
        let ttl = TimeDelta::from_std(self.idle_ttl).unwrap_or(TimeDelta::MAX);
        let mut table = self.inner.lock().expect("session table lock poisoned");
        let before = table.len();
        table.retain(|_, record| now - record.last_activity_at <= ttl);
        before - table.len()
    }

    fn evict_oldest(table: &mut HashMap<String, SessionRecord>) {
        let oldest = table
            .iter()
            .min_by_key(|(_, record)| record.last_activity_at)
            .map(|(session_id, _)| session_id.clone());
        if let Some(session_id) = oldest {
            table.remove(&session_id);
        }
    }

    /// Launches the background sweeper. The returned handle is aborted at
    /// pool shutdown.
    pub(crate) fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let evicted = tracker.sweep(Utc::now());
                if evicted > 0 {
                    tracing::debug!(evicted, "session sweeper evicted idle records");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tracker(max: usize, ttl: Duration) -> SessionTracker {
        SessionTracker::new(max, ttl)
    }

    #[test]
    fn touch_creates_then_increments() {
        let sessions = tracker(10, Duration::from_secs(3600));
        sessions.touch("s1");
        sessions.touch("s1");
        sessions.touch("s1");
        let record = sessions.get("s1").unwrap();
        assert_eq!(record.operations, 3);
        assert!(record.last_activity_at >= record.started_at);
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn last_activity_is_monotone_across_touches() {
        let sessions = tracker(10, Duration::from_secs(3600));
        sessions.touch("s1");
        let first = sessions.get("s1").unwrap().last_activity_at;
        sessions.touch("s1");
        let second = sessions.get("s1").unwrap().last_activity_at;
        assert!(second >= first);
    }

    #[test]
    fn sweep_evicts_only_idle_records() {
        let sessions = tracker(10, Duration::from_millis(50));
        sessions.touch("idle");
        sessions.touch("fresh");

        // Age the idle record by sweeping from the future.
        let future = Utc::now() + TimeDelta::milliseconds(100);
        {
            // Refresh "fresh" so its activity is close to the sweep time.
            let mut table = sessions.inner.lock().unwrap();
            table.get_mut("fresh").unwrap().last_activity_at = future;
        }

        let evicted = sessions.sweep(future);
        assert_eq!(evicted, 1);
        assert!(sessions.get("idle").is_none());
        assert!(sessions.get("fresh").is_some());
    }

    #[test]
    fn capacity_overflow_evicts_longest_inactive() {
        let sessions = tracker(2, Duration::from_secs(3600));
        sessions.touch("a");
        sessions.touch("b");
        // Make "a" the most recently active.
        sessions.touch("a");
        sessions.touch("c");

        assert_eq!(sessions.len(), 2);
        assert!(sessions.get("b").is_none(), "oldest-inactive must go first");
        assert!(sessions.get("a").is_some());
        assert!(sessions.get("c").is_some());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let sessions = tracker(10, Duration::from_secs(3600));
        sessions.touch("s1");
        let snapshot = sessions.snapshot();
        sessions.touch("s1");
        assert_eq!(snapshot["s1"].operations, 1);
        assert_eq!(sessions.get("s1").unwrap().operations, 2);
    }
}
