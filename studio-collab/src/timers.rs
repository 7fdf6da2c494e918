//! Cancellable keyed timers backed by spawned tokio tasks.
//!
//! Each key holds at most one pending timer; scheduling a key again
//! aborts the previous one. A timer removes its own entry when it fires,
//! so [`TimerSet::pending`] only counts timers that can still run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::lock;

#[derive(Default)]
struct TimerTable {
    next_id: u64,
    entries: HashMap<String, (u64, AbortHandle)>,
}

/// Shared handle to a set of named timers.
#[derive(Clone, Default)]
pub struct TimerSet {
    table: Arc<Mutex<TimerTable>>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`. Must be called inside a tokio runtime.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let set = self.clone();
        let mut table = lock(&self.table);
        let id = table.next_id;
        table.next_id += 1;

        let own_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            set.finish(&own_key, id);
            task.await;
        });

        if let Some((_, previous)) = table.entries.insert(key, (id, handle.abort_handle())) {
            previous.abort();
        }
    }

    /// Call `tick` every `period` until it returns `false` or the timer is cancelled.
    pub fn repeat<F>(&self, key: impl Into<String>, period: Duration, mut tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let key = key.into();
        let set = self.clone();
        let mut table = lock(&self.table);
        let id = table.next_id;
        table.next_id += 1;

        let own_key = key.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !tick() {
                    break;
                }
            }
            set.finish(&own_key, id);
        });

        if let Some((_, previous)) = table.entries.insert(key, (id, handle.abort_handle())) {
            previous.abort();
        }
    }

    /// Cancel one timer. Returns whether it was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.table).entries.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer, returning how many were cancelled.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = lock(&self.table).entries.drain().collect();
        for (_, (_, handle)) in &drained {
            handle.abort();
        }
        drained.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.table).entries.contains_key(key)
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.table).entries.len()
    }

    fn finish(&self, key: &str, id: u64) {
        let mut table = lock(&self.table);
        if matches!(table.entries.get(key), Some((current, _)) if *current == id) {
            table.entries.remove(key);
        }
    }
}
