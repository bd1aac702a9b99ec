//! Task realization counters for one build invocation

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

#[derive(Debug, Default)]
pub struct BuildMetrics {
    active: AtomicBool,
    eager: AtomicUsize,
    lazy: AtomicUsize,
    lazy_realized: AtomicUsize,
    eager_by_type: Mutex<BTreeMap<String, usize>>,
}

/// Counter values at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub eager: usize,
    pub lazy: usize,
    pub lazy_realized: usize,
    pub eager_by_type: BTreeMap<String, usize>,
}

impl BuildMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin collecting; counts recorded before `start` are discarded
    pub fn start(&self) {
        self.reset();
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn eager_task(&self, type_name: &str) {
        if !self.is_active() {
            return;
        }
        self.eager.fetch_add(1, Ordering::Relaxed);
        let mut by_type = self
            .eager_by_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *by_type.entry(type_name.to_string()).or_default() += 1;
    }

    pub fn lazy_task(&self) {
        if self.is_active() {
            self.lazy.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn lazy_task_realized(&self) {
        if self.is_active() {
            self.lazy_realized.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            eager: self.eager.load(Ordering::Relaxed),
            lazy: self.lazy.load(Ordering::Relaxed),
            lazy_realized: self.lazy_realized.load(Ordering::Relaxed),
            eager_by_type: self
                .eager_by_type
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Log the collected counts, then stop and reset
    pub fn flush(&self) -> MetricsSnapshot {
        let snapshot = self.snapshot();
        if self.active.swap(false, Ordering::SeqCst) {
            info!(
                eager = snapshot.eager,
                lazy = snapshot.lazy,
                lazy_realized = snapshot.lazy_realized,
                "task creation statistics"
            );
            for (type_name, count) in &snapshot.eager_by_type {
                info!(type_name = %type_name, count, "eagerly created tasks");
            }
        }
        self.reset();
        snapshot
    }

    fn reset(&self) {
        self.eager.store(0, Ordering::Relaxed);
        self.lazy.store(0, Ordering::Relaxed);
        self.lazy_realized.store(0, Ordering::Relaxed);
        self.eager_by_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
