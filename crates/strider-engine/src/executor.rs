use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use strider_core::{
    ExecutionContext, Identity, LocationService, LocationUpdate, Notification, RunId,
};
use strider_store::{UserStore, UserUpdate};
use strider_telemetry::Counters;

use crate::notifier::Notifier;
use crate::walking::WalkingSet;

const DEFAULT_ERROR_BUDGET: u32 = 3;

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Step failures tolerated before the run is cut short. The run aborts
    /// once the count exceeds this.
    pub error_budget: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            error_budget: DEFAULT_ERROR_BUDGET,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Preparing,
    Stepping,
    Finalizing,
    Done,
    Failed,
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Done {
        /// Steps attempted, failures included.
        last_index: usize,
        error_count: u32,
        stopped: bool,
    },
    Failed(String),
}

/// A walking-set entry taken for a run that has not started yet. Stop
/// requests made after [`RouteExecutor::claim`] cancel the run before its
/// first step.
pub struct RunClaim {
    run_id: RunId,
    cancel: CancellationToken,
}

/// Walks one route for one identity. Shared across runs; each `run` call
/// owns its own context and state.
pub struct RouteExecutor {
    upstream: Arc<dyn LocationService>,
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    walking: Arc<WalkingSet>,
    counters: Counters,
    config: ExecutorConfig,
}

struct Stepped {
    last_index: usize,
    error_count: u32,
    stopped: bool,
}

impl RouteExecutor {
    pub fn new(
        upstream: Arc<dyn LocationService>,
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        walking: Arc<WalkingSet>,
        counters: Counters,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            upstream,
            store,
            notifier,
            walking,
            counters,
            config,
        }
    }

    pub fn walking(&self) -> &Arc<WalkingSet> {
        &self.walking
    }

    /// Mark `identity` as walking ahead of [`run_claimed`](Self::run_claimed).
    pub fn claim(&self, identity: &Identity) -> RunClaim {
        let (run_id, cancel) = self.walking.begin(identity);
        RunClaim { run_id, cancel }
    }

    /// Claim and drive the run in one go.
    pub async fn run(&self, ctx: ExecutionContext) -> RunOutcome {
        let claim = self.claim(&ctx.identity);
        self.run_claimed(ctx, claim).await
    }

    /// Drive the run to completion. Always delivers exactly one terminal
    /// notification and always removes the walking entry it was claimed with.
    #[instrument(skip_all, fields(identity = %ctx.identity, steps = ctx.route.len()))]
    pub async fn run_claimed(&self, ctx: ExecutionContext, claim: RunClaim) -> RunOutcome {
        let identity = ctx.identity.clone();
        self.counters.run_started();

        let mut state = RunState::Preparing;
        let RunClaim { run_id, cancel } = claim;
        if let Err(e) = self.store.mark_walking(&identity, true) {
            error!(error = %e, "failed to persist walking flag");
            self.notifier.notify(&identity, Notification::fatal(e.to_string()));
            return self.end(&identity, &run_id, state, RunOutcome::Failed(e.to_string()));
        }

        state = self.transition(state, RunState::Stepping);
        let stepped = self.step_through(&ctx, &run_id, &cancel).await;
        if stepped.stopped {
            self.counters.run_stopped();
        }

        state = self.transition(state, RunState::Finalizing);
        let outcome = match self.finalize(&ctx, stepped.last_index).await {
            Ok(()) => {
                self.notifier.notify(&identity, Notification::success());
                RunOutcome::Done {
                    last_index: stepped.last_index,
                    error_count: stepped.error_count,
                    stopped: stepped.stopped,
                }
            }
            Err(message) => {
                error!(error = %message, "finalize failed");
                self.notifier.notify(&identity, Notification::fatal(message.clone()));
                if let Err(e) = self.store.mark_walking(&identity, false) {
                    warn!(error = %e, "failed to clear walking flag after finalize failure");
                }
                RunOutcome::Failed(message)
            }
        };
        self.end(&identity, &run_id, state, outcome)
    }

    async fn step_through(
        &self,
        ctx: &ExecutionContext,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Stepped {
        let identity = &ctx.identity;
        let total = ctx.route.len();
        let mut last_index = 0usize;
        let mut error_count = 0u32;

        for (i, step) in ctx.route.steps().iter().enumerate() {
            if cancel.is_cancelled() || !self.walking.is_current(identity, run_id) {
                info!(last_index, "run stopped");
                self.notifier
                    .notify(identity, Notification::stopped(last_index.saturating_sub(1)));
                return Stepped {
                    last_index,
                    error_count,
                    stopped: true,
                };
            }

            let update = LocationUpdate::moving(*step, ctx.speed_kmh, ctx.battery);
            match self.upstream.update_location(identity, &update).await {
                Ok(()) => {
                    last_index += 1;
                    self.counters.step_ok();
                    let progress = (i + 1) as f64 / total as f64;
                    self.notifier.notify(identity, Notification::location(*step, progress));
                    debug!(step = i, progress, "step committed");

                    tokio::select! {
                        _ = tokio::time::sleep(ctx.interval) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Err(e) => {
                    last_index += 1;
                    error_count += 1;
                    self.counters.step_failed();
                    warn!(
                        step = i,
                        error_count,
                        error = %e,
                        kind = e.error_kind(),
                        retryable = e.is_retryable(),
                        "step failed"
                    );
                    self.notifier
                        .notify(identity, Notification::step_error(e.to_string(), error_count));
                    if error_count > self.config.error_budget {
                        warn!(last_index, "error budget exhausted");
                        self.notifier
                            .notify(identity, Notification::budget_exhausted(last_index));
                        break;
                    }
                }
            }
        }

        Stepped {
            last_index,
            error_count,
            stopped: false,
        }
    }

    /// Pin the user at the last attempted step and commit it.
    async fn finalize(&self, ctx: &ExecutionContext, last_index: usize) -> Result<(), String> {
        let step = ctx.route.step_clamped(last_index.saturating_sub(1));
        let now = Utc::now();

        let update = LocationUpdate::stationary(step, ctx.battery, Some(now));
        self.upstream
            .update_location(&ctx.identity, &update)
            .await
            .map_err(|e| e.to_string())?;

        let record = UserUpdate::default()
            .position(step)
            .stayed_at(now)
            .battery(ctx.battery)
            .walking(false)
            .expires_at(ctx.expires);
        self.store
            .save(&ctx.identity, &record)
            .map_err(|e| e.to_string())
    }

    fn transition(&self, from: RunState, to: RunState) -> RunState {
        debug!(?from, ?to, "run state");
        to
    }

    fn end(
        &self,
        identity: &Identity,
        run_id: &RunId,
        state: RunState,
        outcome: RunOutcome,
    ) -> RunOutcome {
        let terminal = match outcome {
            RunOutcome::Done { .. } => {
                self.counters.run_succeeded();
                RunState::Done
            }
            RunOutcome::Failed(_) => {
                self.counters.run_failed();
                RunState::Failed
            }
        };
        self.transition(state, terminal);
        self.walking.finish(identity, run_id);
        outcome
    }
}
