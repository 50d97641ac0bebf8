use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use strider_core::{Identity, RunId};

struct WalkEntry {
    run_id: RunId,
    cancel: CancellationToken,
}

/// Identities that currently have a route run in progress.
///
/// Each entry carries the run's cancellation token, so removing an identity
/// and cancelling its run are one operation.
#[derive(Default)]
pub struct WalkingSet {
    entries: DashMap<Identity, WalkEntry>,
}

impl WalkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `identity` as walking under a fresh run id. An entry left by an
    /// earlier run is replaced; its token is cancelled.
    pub fn begin(&self, identity: &Identity) -> (RunId, CancellationToken) {
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let previous = self.entries.insert(
            identity.clone(),
            WalkEntry {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        debug!(identity = %identity, run_id = %run_id, "walking set");
        (run_id, cancel)
    }

    /// Stop request: drop the identity and cancel its run. Returns whether a
    /// run was walking.
    pub fn stop(&self, identity: &Identity) -> bool {
        match self.entries.remove(identity) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!(identity = %identity, run_id = %entry.run_id, "walking stopped");
                true
            }
            None => false,
        }
    }

    /// Called by the run itself as its last action. Only removes the entry
    /// if it still belongs to `run_id`.
    pub fn finish(&self, identity: &Identity, run_id: &RunId) -> bool {
        self.entries
            .remove_if(identity, |_, entry| &entry.run_id == run_id)
            .is_some()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Whether `identity` is still walking under `run_id`.
    pub fn is_current(&self, identity: &Identity, run_id: &RunId) -> bool {
        self.entries
            .get(identity)
            .is_some_and(|entry| &entry.run_id == run_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancel every run. Used on shutdown.
    pub fn stop_all(&self) -> usize {
        let count = self.entries.len();
        for entry in self.entries.iter() {
            entry.value().cancel.cancel();
        }
        self.entries.clear();
        count
    }
}
