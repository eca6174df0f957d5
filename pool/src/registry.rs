// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Discovery table from worker id to logical handle.
//!
//! The registry owns nothing: it maps stable [`WorkerId`]s to
//! [`WorkerHandle`] clones for O(1) lookup, and deregistration on death is
//! atomic (one write-lock acquisition). The subprocess itself lives with the
//! worker task, never here.

use std::{collections::HashMap,
          sync::{Arc, RwLock}};

use crate::{ids::WorkerId, worker::WorkerHandle};

#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<WorkerId, WorkerHandle>>>,
}

impl Registry {
    pub fn get(&self, id: WorkerId) -> Option<WorkerHandle> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
    }

    pub(crate) fn insert(&self, handle: WorkerHandle) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(handle.id(), handle);
    }

    /// Removes and returns the handle, if the id was still registered.
    pub(crate) fn remove(&self, id: WorkerId) -> Option<WorkerHandle> {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live handle.
    pub fn all(&self) -> Vec<WorkerHandle> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
