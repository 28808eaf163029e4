//! Reference-counted tracking of in-flight reindex operations.
//!
//! Watcher batches and single-file events overlap; a plain boolean would
//! report idle as soon as the first of them finished.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Snapshot of the coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexState {
    pub in_progress: bool,
    /// Files of every outstanding operation, first-seen order, no duplicates
    pub pending_files: Vec<String>,
    pub last_reindex_timestamp: Option<DateTime<Utc>>,
    pub last_reindex_duration_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    outstanding: usize,
    pending: Vec<String>,
    pending_set: HashSet<String>,
    last_timestamp: Option<DateTime<Utc>>,
    last_duration_ms: Option<u64>,
}

impl Inner {
    fn finish(&mut self, op: &str) -> bool {
        if self.outstanding == 0 {
            warn!("Reindex {} called with no operation in progress, ignoring", op);
            return false;
        }
        self.outstanding -= 1;
        if self.outstanding > 0 {
            debug!("{} reindex operations still outstanding", self.outstanding);
            return false;
        }
        self.pending.clear();
        self.pending_set.clear();
        true
    }
}

#[derive(Debug, Default)]
pub struct ReindexCoordinator {
    inner: Mutex<Inner>,
}

impl ReindexCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent across a panicking holder: every mutation is a single step
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an operation over `files`. Empty input is ignored.
    pub fn start<S: AsRef<str>>(&self, files: &[S]) {
        if files.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.outstanding += 1;
        for file in files {
            let file = file.as_ref();
            if inner.pending_set.insert(file.to_string()) {
                inner.pending.push(file.to_string());
            }
        }
        debug!(
            "Reindex started ({} outstanding, {} pending files)",
            inner.outstanding,
            inner.pending.len()
        );
    }

    /// Finish an operation successfully.
    pub fn complete(&self, duration_ms: u64) {
        let mut inner = self.lock();
        if inner.finish("complete") {
            inner.last_timestamp = Some(Utc::now());
            inner.last_duration_ms = Some(duration_ms);
        }
    }

    /// Finish an operation that did not succeed. Timing is left untouched.
    pub fn fail(&self) {
        self.lock().finish("fail");
    }

    pub fn is_in_progress(&self) -> bool {
        self.lock().outstanding > 0
    }

    pub fn snapshot(&self) -> ReindexState {
        let inner = self.lock();
        ReindexState {
            in_progress: inner.outstanding > 0,
            pending_files: inner.pending.clone(),
            last_reindex_timestamp: inner.last_timestamp,
            last_reindex_duration_ms: inner.last_duration_ms,
        }
    }
}
