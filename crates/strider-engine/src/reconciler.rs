use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strider_core::{LocationService, LocationUpdate};
use strider_store::UserStore;
use strider_telemetry::Counters;

use crate::error::EngineError;
use crate::walking::WalkingSet;

/// Battery level reported for users that never stored one.
const DEFAULT_BATTERY: f64 = 100.0;

/// Tally of one reconcile sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub updated: usize,
    pub skipped: usize,
    pub expired: usize,
    /// Upstream updates that failed.
    pub failed: usize,
    /// Expiry deletes the store refused.
    pub expire_failed: usize,
}

impl SweepReport {
    /// Aggregate error for a sweep in which some updates or expiries failed.
    pub fn error(&self) -> Option<EngineError> {
        (self.failed > 0 || self.expire_failed > 0).then(|| EngineError::PartialSweep {
            failed: self.failed,
            attempted: self.updated + self.failed,
            expire_failed: self.expire_failed,
        })
    }
}

enum Dispatch {
    Updated,
    Skipped,
    Failed,
}

/// Keeps idle users pinned upstream at their last committed position and
/// expires sessions past their deadline.
pub struct Reconciler {
    upstream: Arc<dyn LocationService>,
    store: Arc<dyn UserStore>,
    walking: Arc<WalkingSet>,
    counters: Counters,
}

impl Reconciler {
    pub fn new(
        upstream: Arc<dyn LocationService>,
        store: Arc<dyn UserStore>,
        walking: Arc<WalkingSet>,
        counters: Counters,
    ) -> Self {
        Self {
            upstream,
            store,
            walking,
            counters,
        }
    }

    /// One pass over every positioned record. Updates run concurrently; one
    /// identity's failure does not affect the others.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let records = self.store.list_positioned()?;
        let now = Utc::now();
        let mut report = SweepReport::default();
        let mut pending = Vec::new();

        for record in records {
            if record.walking || self.walking.contains(&record.identity) {
                report.skipped += 1;
                continue;
            }
            if record.is_expired(now) {
                match self.store.expire(&record.identity) {
                    Ok(true) => {
                        info!(identity = %record.identity, "session expired");
                        report.expired += 1;
                    }
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        warn!(identity = %record.identity, error = %e, "failed to expire session");
                        report.expire_failed += 1;
                    }
                }
                continue;
            }
            let Some(step) = record.position() else {
                report.skipped += 1;
                continue;
            };
            let update = LocationUpdate::stationary(
                step,
                record.battery.unwrap_or(DEFAULT_BATTERY),
                record.stayed_at,
            );
            pending.push((record.identity, update));
        }

        let results = join_all(pending.iter().map(|(identity, update)| async move {
            // A run may have claimed the identity since it was listed.
            if self.walking.contains(identity) {
                debug!(identity = %identity, "walking since listed, skipped");
                return Dispatch::Skipped;
            }
            match self.upstream.update_location(identity, update).await {
                Ok(()) => Dispatch::Updated,
                Err(e) => {
                    warn!(
                        identity = %identity,
                        error = %e,
                        kind = e.error_kind(),
                        retryable = e.is_retryable(),
                        "reconcile update failed"
                    );
                    Dispatch::Failed
                }
            }
        }))
        .await;

        for result in results {
            match result {
                Dispatch::Updated => report.updated += 1,
                Dispatch::Skipped => report.skipped += 1,
                Dispatch::Failed => report.failed += 1,
            }
        }

        self.counters.sweep(
            report.updated as u64,
            report.skipped as u64,
            report.expired as u64,
            (report.failed + report.expire_failed) as u64,
        );
        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `period` until `cancel` fires. A
    /// failing sweep is logged and the next tick proceeds as normal.
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.sweep().await {
                    Ok(report) => {
                        info!(
                            updated = report.updated,
                            skipped = report.skipped,
                            expired = report.expired,
                            failed = report.failed,
                            expire_failed = report.expire_failed,
                            "reconcile sweep"
                        );
                        if let Some(e) = report.error() {
                            warn!(error = %e, "reconcile sweep incomplete");
                        }
                    }
                    Err(e) => warn!(error = %e, "reconcile sweep skipped"),
                }
            }
            debug!("reconciler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use strider_core::{Identity, RouteStep};
    use strider_store::{Database, StoreError, UserRecord, UserRepo, UserUpdate};
    use strider_upstream::MockLocationService;

    use super::*;

    struct Harness {
        upstream: Arc<MockLocationService>,
        store: Arc<UserRepo>,
        walking: Arc<WalkingSet>,
        counters: Counters,
        reconciler: Arc<Reconciler>,
    }

    fn harness(upstream: MockLocationService) -> Harness {
        let upstream = Arc::new(upstream);
        let store = Arc::new(UserRepo::new(Database::in_memory().unwrap()));
        let walking = Arc::new(WalkingSet::new());
        let counters = Counters::new();
        let reconciler = Arc::new(Reconciler::new(
            upstream.clone(),
            store.clone(),
            walking.clone(),
            counters.clone(),
        ));
        Harness {
            upstream,
            store,
            walking,
            counters,
            reconciler,
        }
    }

    fn place(h: &Harness, name: &str, update: UserUpdate) -> Identity {
        let id = Identity::new(name);
        h.store
            .save(&id, &update.position(RouteStep::new(35.0, 139.0)))
            .unwrap();
        id
    }

    #[tokio::test]
    async fn idle_users_are_reaffirmed() {
        let h = harness(MockLocationService::new());
        let stayed = Utc::now() - ChronoDuration::minutes(5);
        let a = place(&h, "alice", UserUpdate::default().battery(42.0).stayed_at(stayed));
        let b = place(&h, "bob", UserUpdate::default());

        let report = h.reconciler.sweep().await.unwrap();
        assert_eq!(report.updated, 2);
        assert!(report.error().is_none());

        let sent_a = &h.upstream.updates_for(&a)[0];
        assert_eq!(sent_a.speed_kmh, 0.0);
        assert_eq!(sent_a.battery, 42.0);
        assert!(!sent_a.is_active);
        assert_eq!(sent_a.stayed_at.map(|t| t.timestamp()), Some(stayed.timestamp()));

        let sent_b = &h.upstream.updates_for(&b)[0];
        assert_eq!(sent_b.battery, DEFAULT_BATTERY);
    }

    #[tokio::test]
    async fn walking_users_are_never_touched() {
        let h = harness(MockLocationService::new());
        let flagged = place(&h, "flagged", UserUpdate::default().walking(true));
        let live = place(&h, "live", UserUpdate::default());
        let _ = h.walking.begin(&live);

        let report = h.reconciler.sweep().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.updated, 0);
        assert!(h.upstream.updates_for(&flagged).is_empty());
        assert!(h.upstream.updates_for(&live).is_empty());
    }

    #[tokio::test]
    async fn unpositioned_users_are_not_listed() {
        let h = harness(MockLocationService::new());
        h.store
            .save(&Identity::new("nowhere"), &UserUpdate::default().battery(50.0))
            .unwrap();
        let report = h.reconciler.sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(h.upstream.update_count(), 0);
    }

    #[tokio::test]
    async fn expired_sessions_are_cleared_for_good() {
        let h = harness(MockLocationService::new());
        let past = Utc::now() - ChronoDuration::seconds(1);
        let future = Utc::now() + ChronoDuration::hours(1);
        let gone = place(&h, "gone", UserUpdate::default().expires_at(Some(past)));
        let kept = place(&h, "kept", UserUpdate::default().expires_at(Some(future)));

        let first = h.reconciler.sweep().await.unwrap();
        assert_eq!(first.expired, 1);
        assert_eq!(first.updated, 1);
        assert!(h.upstream.updates_for(&gone).is_empty());
        assert_eq!(h.upstream.updates_for(&kept).len(), 1);

        let record = h.store.get(&gone).unwrap().unwrap();
        assert_eq!(record.position(), None);
        assert_eq!(record.expires_at, None);

        let second = h.reconciler.sweep().await.unwrap();
        assert_eq!(second.expired, 0);
        assert!(h.upstream.updates_for(&gone).is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let bad = Identity::new("bad");
        let h = harness(MockLocationService::new().fail_identity(&bad));
        place(&h, "bad", UserUpdate::default());
        let good = place(&h, "good", UserUpdate::default());

        let report = h.reconciler.sweep().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(h.upstream.updates_for(&good).len(), 1);
        assert!(matches!(
            report.error(),
            Some(EngineError::PartialSweep { failed: 1, attempted: 2, expire_failed: 0 })
        ));
        assert_eq!(h.counters.snapshot().reconcile_failed, 1);
    }

    #[tokio::test]
    async fn updates_are_dispatched_concurrently() {
        let h = harness(MockLocationService::new().with_delay(Duration::from_millis(200)));
        for name in ["a", "b", "c", "d"] {
            place(&h, name, UserUpdate::default());
        }
        let started = std::time::Instant::now();
        let report = h.reconciler.sweep().await.unwrap();
        assert_eq!(report.updated, 4);
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_ticks_each_period_until_cancelled() {
        let h = harness(MockLocationService::new());
        place(&h, "idle", UserUpdate::default());
        let cancel = CancellationToken::new();
        let handle = h
            .reconciler
            .clone()
            .spawn(Duration::from_secs(30), cancel.clone());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(h.upstream.update_count(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.upstream.update_count(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.upstream.update_count(), 2);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.counters.snapshot().sweeps, 2);
    }

    type ExpireHook = Box<dyn Fn(&Identity) -> Result<(), StoreError> + Send + Sync>;

    /// A real repo that lists `first` ahead of everyone else and runs a hook
    /// before each expiry.
    struct HookedStore {
        inner: UserRepo,
        first: Identity,
        on_expire: ExpireHook,
    }

    impl UserStore for HookedStore {
        fn save(&self, identity: &Identity, update: &UserUpdate) -> Result<(), StoreError> {
            self.inner.save(identity, update)
        }
        fn get(&self, identity: &Identity) -> Result<Option<UserRecord>, StoreError> {
            self.inner.get(identity)
        }
        fn list_positioned(&self) -> Result<Vec<UserRecord>, StoreError> {
            let mut all = self.inner.list_positioned()?;
            all.sort_by_key(|r| r.identity != self.first);
            Ok(all)
        }
        fn expire(&self, identity: &Identity) -> Result<bool, StoreError> {
            (self.on_expire)(identity)?;
            self.inner.expire(identity)
        }
    }

    fn hooked(
        upstream: Arc<MockLocationService>,
        walking: Arc<WalkingSet>,
        first: &Identity,
        on_expire: ExpireHook,
    ) -> (UserRepo, Reconciler) {
        let repo = UserRepo::new(Database::in_memory().unwrap());
        let store = Arc::new(HookedStore {
            inner: repo.clone(),
            first: first.clone(),
            on_expire,
        });
        let reconciler = Reconciler::new(upstream, store, walking, Counters::new());
        (repo, reconciler)
    }

    #[tokio::test]
    async fn run_claimed_mid_sweep_is_not_reconciled() {
        let upstream = Arc::new(MockLocationService::new());
        let walking = Arc::new(WalkingSet::new());
        let late = Identity::new("late-walker");

        let claimer = Arc::clone(&walking);
        let claimed = late.clone();
        let (repo, reconciler) = hooked(
            upstream.clone(),
            walking.clone(),
            &late,
            Box::new(move |_| {
                let _ = claimer.begin(&claimed);
                Ok(())
            }),
        );
        let here = UserUpdate::default().position(RouteStep::new(35.0, 139.0));
        repo.save(&late, &here).unwrap();
        let stale = Identity::new("stale");
        let past = Utc::now() - ChronoDuration::seconds(1);
        repo.save(&stale, &here.clone().expires_at(Some(past))).unwrap();

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.updated, 0);
        assert!(upstream.updates_for(&late).is_empty());
    }

    #[tokio::test]
    async fn expiry_failures_are_tallied_apart_from_updates() {
        let upstream = Arc::new(MockLocationService::new());
        let idle = Identity::new("idle");
        let (repo, reconciler) = hooked(
            upstream.clone(),
            Arc::new(WalkingSet::new()),
            &idle,
            Box::new(|_| Err(StoreError::Database("locked".into()))),
        );
        let here = UserUpdate::default().position(RouteStep::new(35.0, 139.0));
        repo.save(&idle, &here).unwrap();
        let past = Utc::now() - ChronoDuration::seconds(1);
        repo.save(&Identity::new("stale"), &here.clone().expires_at(Some(past)))
            .unwrap();

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.expire_failed, 1);
        assert!(matches!(
            report.error(),
            Some(EngineError::PartialSweep { failed: 0, attempted: 1, expire_failed: 1 })
        ));
    }
}
