//! Route orchestrator: connects inbound commands to the route executor.
//!
//! Enforces the start preconditions (a viewer is connected, no run is alive
//! for the identity) and owns the spawned run tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use strider_core::{ExecutionContext, Identity, Notification};
use strider_engine::{EngineError, RouteExecutor, RunOutcome};

use crate::registry::SessionRegistry;

/// Tracks a spawned run from start until its task exits.
struct ActiveRun {
    started_at: Instant,
}

pub struct RouteOrchestrator {
    executor: Arc<RouteExecutor>,
    registry: Arc<SessionRegistry>,
    active_runs: Arc<DashMap<Identity, ActiveRun>>,
    tasks: TaskTracker,
    stop_echo_delay: Duration,
}

impl RouteOrchestrator {
    pub fn new(
        executor: Arc<RouteExecutor>,
        registry: Arc<SessionRegistry>,
        stop_echo_delay: Duration,
    ) -> Self {
        Self {
            executor,
            registry,
            active_runs: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            stop_echo_delay,
        }
    }

    /// Spawn a run for `ctx.identity`. Returns once the run is scheduled.
    pub fn start(&self, ctx: ExecutionContext) -> Result<(), EngineError> {
        let identity = ctx.identity.clone();
        if !self.registry.contains(&identity) {
            return Err(EngineError::NoViewer);
        }

        match self.active_runs.entry(identity.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyWalking),
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    started_at: Instant::now(),
                });
            }
        }

        // Walking before the caller hears back, so an immediate stop lands.
        let claim = self.executor.claim(&identity);
        let executor = Arc::clone(&self.executor);
        let active_runs = Arc::clone(&self.active_runs);
        info!(identity = %identity, steps = ctx.route.len(), "route run accepted");

        self.tasks.spawn(async move {
            let outcome = executor.run_claimed(ctx, claim).await;
            let elapsed = active_runs
                .remove(&identity)
                .map(|(_, run)| run.started_at.elapsed());
            match outcome {
                RunOutcome::Done { last_index, error_count, stopped } => info!(
                    identity = %identity,
                    last_index,
                    error_count,
                    stopped,
                    elapsed_ms = elapsed.map(|d| d.as_millis() as u64),
                    "route run finished"
                ),
                RunOutcome::Failed(reason) => info!(
                    identity = %identity,
                    reason = %reason,
                    "route run failed"
                ),
            }
        });
        Ok(())
    }

    /// Remove the identity from the walking set and echo a `stop` message
    /// to its viewer after the configured delay.
    pub fn request_stop(&self, identity: &Identity) -> bool {
        let was_walking = self.executor.walking().stop(identity);
        debug!(identity = %identity, was_walking, "stop requested");

        let registry = Arc::clone(&self.registry);
        let identity = identity.clone();
        let delay = self.stop_echo_delay;
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            registry.send(&identity, &Notification::stop_echo());
        });
        was_walking
    }

    pub fn is_walking(&self, identity: &Identity) -> bool {
        self.executor.walking().contains(identity)
    }

    /// Whether a run task is alive, including one still finalizing after a stop.
    pub fn is_running(&self, identity: &Identity) -> bool {
        self.active_runs.contains_key(identity)
    }

    pub fn active_count(&self) -> usize {
        self.active_runs.len()
    }

    /// Cancel every run and wait for the tasks to finish finalizing.
    pub async fn shutdown(&self) -> usize {
        let stopped = self.executor.walking().stop_all();
        self.tasks.close();
        self.tasks.wait().await;
        stopped
    }
}
