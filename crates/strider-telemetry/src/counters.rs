use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Default)]
struct Inner {
    runs_started: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    runs_stopped: AtomicU64,
    steps_ok: AtomicU64,
    steps_failed: AtomicU64,
    sweeps: AtomicU64,
    reconcile_updated: AtomicU64,
    reconcile_skipped: AtomicU64,
    reconcile_expired: AtomicU64,
    reconcile_failed: AtomicU64,
}

/// Process-wide monotonic counters. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct Counters {
    inner: Arc<Inner>,
}

/// Point-in-time copy of [`Counters`], served on `/health`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_stopped: u64,
    pub steps_ok: u64,
    pub steps_failed: u64,
    pub sweeps: u64,
    pub reconcile_updated: u64,
    pub reconcile_skipped: u64,
    pub reconcile_expired: u64,
    pub reconcile_failed: u64,
}

fn bump(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_started(&self) {
        bump(&self.inner.runs_started, 1);
    }

    pub fn run_succeeded(&self) {
        bump(&self.inner.runs_succeeded, 1);
    }

    pub fn run_failed(&self) {
        bump(&self.inner.runs_failed, 1);
    }

    /// A run that was cancelled still finalizes, so it is counted here and
    /// in succeeded or failed.
    pub fn run_stopped(&self) {
        bump(&self.inner.runs_stopped, 1);
    }

    pub fn step_ok(&self) {
        bump(&self.inner.steps_ok, 1);
    }

    pub fn step_failed(&self) {
        bump(&self.inner.steps_failed, 1);
    }

    pub fn sweep(&self, updated: u64, skipped: u64, expired: u64, failed: u64) {
        bump(&self.inner.sweeps, 1);
        bump(&self.inner.reconcile_updated, updated);
        bump(&self.inner.reconcile_skipped, skipped);
        bump(&self.inner.reconcile_expired, expired);
        bump(&self.inner.reconcile_failed, failed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let i = &self.inner;
        CountersSnapshot {
            runs_started: load(&i.runs_started),
            runs_succeeded: load(&i.runs_succeeded),
            runs_failed: load(&i.runs_failed),
            runs_stopped: load(&i.runs_stopped),
            steps_ok: load(&i.steps_ok),
            steps_failed: load(&i.steps_failed),
            sweeps: load(&i.sweeps),
            reconcile_updated: load(&i.reconcile_updated),
            reconcile_skipped: load(&i.reconcile_skipped),
            reconcile_expired: load(&i.reconcile_expired),
            reconcile_failed: load(&i.reconcile_failed),
        }
    }
}
