//! Load controller.
//!
//! Runs `setup`, then reconciles the VU pool against the schedule on a fixed
//! tick until the schedule ends (or the run is aborted), drains the pool and
//! runs `teardown`. The final metric snapshot and threshold verdicts come
//! back as a [`RunReport`].

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::error::EngineError;
use crate::stats::{builtin, MetricRegistry, RunReport, SharedRegistry, Tags};

pub mod check;
pub mod context;
pub mod control;
pub mod http;
pub mod plan;
pub mod schedule;
pub mod vu;

pub use check::{CheckResult, Checks};
pub use context::VuContext;
pub use control::{parse_control_command, ControlCommand, ControlState, SharedControl};
pub use http::{HttpRequest, HttpResponse, HttpTimings, HttpTransport, ReqwestTransport, SharedTransport};
pub use plan::TestPlan;
pub use schedule::{Schedule, Stage};
pub use vu::{IterationOutcome, VuState};

use vu::{panic_message, VuExit, VuHandle, VuShared};

/// Stand-in deadline for graceful stop windows too large to add to `now`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// User logic driven by the engine. The engine never looks inside it.
///
/// `setup` runs once before any VU starts and its result is shared read-only
/// with every iteration. `teardown` runs once after every VU has stopped.
#[async_trait]
pub trait Scenario: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    async fn setup(&self, vu: &mut VuContext) -> anyhow::Result<Self::Data>;

    async fn iteration(&self, vu: &mut VuContext, data: &Self::Data) -> anyhow::Result<()>;

    async fn teardown(&self, _vu: &mut VuContext, _data: &Self::Data) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The set of VUs owned by the controller.
struct Pool<S: Scenario> {
    shared: Arc<VuShared<S>>,
    /// Oldest first, so retirement pops from the back.
    running: Vec<VuHandle>,
    /// Asked to stop, still finishing an iteration.
    draining: Vec<VuHandle>,
    next_id: u64,
    spawned: usize,
    /// VUs that exited after reaching their iteration cap.
    completed: usize,
    crashed: usize,
    max_active: usize,
}

impl<S: Scenario> Pool<S> {
    fn new(shared: Arc<VuShared<S>>) -> Self {
        Self {
            shared,
            running: Vec::new(),
            draining: Vec::new(),
            next_id: 1,
            spawned: 0,
            completed: 0,
            crashed: 0,
            max_active: 0,
        }
    }

    fn active(&self) -> usize {
        self.running.len() + self.draining.len()
    }

    fn is_empty(&self) -> bool {
        self.active() == 0
    }

    fn spawn(&mut self, n: usize) {
        for _ in 0..n {
            let id = self.next_id;
            self.next_id += 1;
            self.running.push(VuHandle::spawn(id, self.shared.clone()));
            self.spawned += 1;
        }
        self.max_active = self.max_active.max(self.active());
    }

    /// Gracefully stop the `n` most recently started VUs.
    fn retire(&mut self, n: usize) {
        for _ in 0..n {
            let Some(handle) = self.running.pop() else {
                break;
            };
            tracing::debug!(vu = handle.id, "retiring vu");
            handle.request_stop();
            self.draining.push(handle);
        }
    }

    fn stop_all(&mut self) {
        let n = self.running.len();
        self.retire(n);
    }

    /// Collect VUs whose task has returned.
    async fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.running.drain(..).partition(VuHandle::is_finished);
        self.running = running;
        let (drained, draining): (Vec<_>, Vec<_>) =
            self.draining.drain(..).partition(VuHandle::is_finished);
        self.draining = draining;

        for handle in done.into_iter().chain(drained) {
            let id = handle.id;
            match handle.task.await {
                Ok(report) => match report.exit {
                    VuExit::Completed => self.completed += 1,
                    VuExit::Crashed => self.crashed += 1,
                    VuExit::Stopped => {}
                },
                Err(e) => {
                    tracing::warn!(vu = id, error = %e, "vu task failed");
                    self.crashed += 1;
                }
            }
        }
    }

    /// Wait for every draining VU until `deadline`, then cancel the rest.
    /// Returns how many iterations were cut short.
    async fn drain(&mut self, deadline: Instant) -> usize {
        let mut interrupted = 0;
        for mut handle in std::mem::take(&mut self.draining) {
            match tokio::time::timeout_at(deadline, &mut handle.task).await {
                Ok(Ok(report)) => match report.exit {
                    VuExit::Completed => self.completed += 1,
                    VuExit::Crashed => self.crashed += 1,
                    VuExit::Stopped => {}
                },
                Ok(Err(e)) => tracing::warn!(vu = handle.id, error = %e, "vu task failed"),
                Err(_) => {
                    tracing::warn!(
                        vu = handle.id,
                        state = ?handle.state(),
                        "graceful stop window elapsed, interrupting iteration"
                    );
                    handle.task.abort();
                    interrupted += 1;
                }
            }
        }
        interrupted
    }
}

/// Run clock that excludes time spent paused.
struct RunClock {
    start: Instant,
    paused_at_start: Duration,
    control: SharedControl,
}

impl RunClock {
    fn start(control: SharedControl) -> Self {
        Self {
            start: Instant::now(),
            paused_at_start: control.total_paused(),
            control,
        }
    }

    fn elapsed(&self) -> Duration {
        let paused = self
            .control
            .total_paused()
            .saturating_sub(self.paused_at_start);
        self.start.elapsed().saturating_sub(paused)
    }
}

pub struct Engine {
    plan: TestPlan,
    registry: SharedRegistry,
    control: SharedControl,
    transport: SharedTransport,
}

impl Engine {
    /// Each engine owns a fresh metric registry, so metrics never leak
    /// between runs.
    pub fn new(plan: TestPlan, transport: SharedTransport) -> Self {
        Self {
            plan,
            registry: Arc::new(MetricRegistry::new()),
            control: Arc::new(ControlState::new()),
            transport,
        }
    }

    /// Share run control with an outside driver (signal handler, stdin).
    pub fn with_control(mut self, control: SharedControl) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> SharedControl {
        self.control.clone()
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn plan(&self) -> &TestPlan {
        &self.plan
    }

    fn context(&self, vu_id: u64, group: &str) -> VuContext {
        let mut ctx = VuContext::new(
            vu_id,
            self.registry.clone(),
            self.control.clone(),
            self.transport.clone(),
        );
        ctx.push_group(group);
        ctx
    }

    fn gauge(&self, name: &str, value: f64) {
        if let Err(e) = self.registry.gauge_set(name, value, &Tags::new()) {
            tracing::warn!(metric = name, error = %e, "failed to record gauge");
        }
    }

    /// Execute the plan to completion.
    pub async fn run<S: Scenario>(self, scenario: S) -> Result<RunReport, EngineError> {
        for (k, v) in &self.plan.tags {
            self.control.add_tag(k.clone(), v.clone());
        }
        let scenario = Arc::new(scenario);

        tracing::info!("running setup");
        let mut setup_ctx = self.context(0, "setup");
        let data = match AssertUnwindSafe(scenario.setup(&mut setup_ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(data)) => Arc::new(data),
            Ok(Err(e)) => {
                tracing::error!(error = %format!("{:#}", e), "setup failed");
                return Err(EngineError::Setup(e));
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!(panic = %msg, "setup panicked");
                return Err(EngineError::Setup(anyhow::anyhow!("panicked: {}", msg)));
            }
        };

        let mut pool = Pool::new(Arc::new(VuShared {
            scenario: scenario.clone(),
            data: data.clone(),
            registry: self.registry.clone(),
            control: self.control.clone(),
            transport: self.transport.clone(),
            max_iterations: self.plan.iterations,
            min_iteration_duration: self.plan.min_iteration_duration,
        }));

        let schedule = &self.plan.schedule;
        let total = schedule.total_duration();
        let peak = schedule.peak();
        let capped = self.plan.iterations.is_some();
        let abortable = self.plan.thresholds.abortable_metrics();

        tracing::info!(
            duration = ?total,
            peak_vus = peak,
            stages = schedule.stages().len(),
            "starting load"
        );

        let clock = RunClock::start(self.control.clone());
        let mut ticker = tokio::time::interval(self.plan.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_check = Duration::ZERO;
        let mut stage = None;

        loop {
            ticker.tick().await;
            pool.reap().await;

            if self.control.is_aborted() {
                tracing::warn!(
                    reason = self.control.abort_reason().as_deref().unwrap_or("unknown"),
                    "run aborted"
                );
                break;
            }

            let elapsed = clock.elapsed();
            if elapsed >= total {
                tracing::info!("schedule finished");
                break;
            }
            if capped && pool.is_empty() && pool.spawned >= peak {
                tracing::info!(vus = pool.spawned, "all vus reached their iteration cap");
                break;
            }

            let current = schedule.stage_index_at(elapsed);
            if current != stage {
                if let Some(i) = current {
                    let s = schedule.stages()[i];
                    tracing::info!(stage = i + 1, target = s.target, duration = ?s.duration, "stage started");
                }
                stage = current;
            }

            let desired = schedule.target_at(elapsed);
            let budget = pool.active() + if capped { pool.completed } else { 0 };
            if desired > budget {
                pool.spawn(desired - budget);
            } else if desired < pool.running.len() {
                pool.retire(pool.running.len() - desired);
            }

            self.gauge(builtin::VUS, pool.active() as f64);
            self.gauge(builtin::VUS_MAX, pool.max_active as f64);

            if !abortable.is_empty()
                && elapsed.saturating_sub(last_check) >= self.plan.threshold_interval
            {
                last_check = elapsed;
                let snapshot = self.registry.snapshot_of(&abortable, elapsed);
                if let Some(v) = self.plan.thresholds.checkpoint(&snapshot) {
                    let reason = format!("threshold '{}: {}' breached", v.metric, v.expression);
                    tracing::warn!(observed = ?v.observed, "{}", reason);
                    self.control.abort(reason);
                }
            }
        }

        pool.stop_all();
        let deadline = Instant::now()
            .checked_add(self.plan.graceful_stop)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let interrupted = pool.drain(deadline).await;
        if interrupted > 0 {
            if let Err(e) = self.registry.counter_add(
                builtin::ITERATIONS_INTERRUPTED,
                interrupted as f64,
                &Tags::new(),
            ) {
                tracing::warn!(error = %e, "failed to record interrupted iterations");
            }
        }
        self.gauge(builtin::VUS, 0.0);
        tracing::info!(
            vus = pool.spawned,
            crashed = pool.crashed,
            interrupted,
            "all vus stopped"
        );

        tracing::info!("running teardown");
        let mut teardown_ctx = self.context(0, "teardown");
        match AssertUnwindSafe(scenario.teardown(&mut teardown_ctx, &data))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %format!("{:#}", e), "teardown failed");
                return Err(EngineError::Teardown(e));
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!(panic = %msg, "teardown panicked");
                return Err(EngineError::Teardown(anyhow::anyhow!("panicked: {}", msg)));
            }
        }

        let duration = clock.elapsed();
        let snapshot = self.registry.snapshot(duration);
        let verdicts = self.plan.thresholds.evaluate(&snapshot);
        let report = RunReport {
            snapshot,
            verdicts,
            duration,
            aborted: self.control.abort_reason(),
        };
        tracing::info!(
            duration = ?duration,
            thresholds_passed = report.thresholds_passed(),
            "run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::http::mock::MockTransport;
    use crate::error::VuCrash;
    use crate::stats::thresholds::{ThresholdSet, ThresholdSource};
    use crate::stats::{Aggregator, ExitStatus};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn engine(plan: TestPlan) -> Engine {
        Engine::new(plan, Arc::new(MockTransport::new(200, Duration::from_millis(50))))
    }

    fn count(report: &RunReport, metric: &str) -> f64 {
        report
            .snapshot
            .aggregate(metric, &Aggregator::Count, &Tags::new())
            .unwrap_or(0.0)
    }

    /// Sleeps for `think` per iteration and tracks concurrency and VU ids.
    struct Tracking {
        think: Duration,
        t0: Instant,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        per_vu: Mutex<HashMap<u64, (u64, u64)>>,
        late: Mutex<BTreeSet<u64>>,
        teardowns: AtomicUsize,
        in_flight_at_teardown: AtomicUsize,
    }

    impl Tracking {
        fn new(think: Duration) -> Self {
            Self {
                think,
                t0: Instant::now(),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                per_vu: Mutex::new(HashMap::new()),
                late: Mutex::new(BTreeSet::new()),
                teardowns: AtomicUsize::new(0),
                in_flight_at_teardown: AtomicUsize::new(usize::MAX),
            }
        }
    }

    #[async_trait]
    impl Scenario for Arc<Tracking> {
        type Data = String;

        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<String> {
            Ok("token".to_string())
        }

        async fn iteration(&self, vu: &mut VuContext, data: &String) -> anyhow::Result<()> {
            assert_eq!(data, "token");
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            self.per_vu.lock().entry(vu.vu_id()).or_default().0 += 1;
            let since = self.t0.elapsed();
            if since >= secs(6) && since < secs(9) {
                self.late.lock().insert(vu.vu_id());
            }

            let res = vu.get("http://localhost/").await;
            vu.check(&res).that("status is 200", |r| r.status == 200);
            vu.sleep(self.think).await;

            self.per_vu.lock().entry(vu.vu_id()).or_default().1 += 1;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown(&self, _vu: &mut VuContext, data: &String) -> anyhow::Result<()> {
            assert_eq!(data, "token");
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            self.in_flight_at_teardown
                .store(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_scenario() {
        let plan = TestPlan::new(Schedule::new(
            0,
            vec![
                Stage::new(secs(10), 5),
                Stage::new(secs(20), 5),
                Stage::new(secs(10), 0),
            ],
        ));
        let tracking = Arc::new(Tracking::new(secs(1)));
        let report = engine(plan).run(tracking.clone()).await.unwrap();

        // 150 VU-seconds of load at ~1.05s per iteration
        let iterations = count(&report, builtin::ITERATIONS);
        assert!(
            (120.0..=165.0).contains(&iterations),
            "unexpected iteration count {}",
            iterations
        );
        assert_eq!(count(&report, builtin::HTTP_REQS), iterations);
        assert!(tracking.peak_in_flight.load(Ordering::SeqCst) <= 5);
        let vus_max = report
            .snapshot
            .aggregate(builtin::VUS_MAX, &Aggregator::Max, &Tags::new())
            .unwrap();
        assert_eq!(vus_max, 5.0);
        assert!(report.snapshot.get(builtin::ITERATIONS_INTERRUPTED).is_none());
        assert_eq!(report.exit_status(), ExitStatus::Passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retirement_is_lifo_and_never_interrupts() {
        let plan = TestPlan::new(Schedule::new(
            10,
            vec![
                Stage::new(secs(5), 10),
                Stage::new(Duration::ZERO, 6),
                Stage::new(secs(5), 6),
            ],
        ));
        let tracking = Arc::new(Tracking::new(Duration::from_millis(700)));
        let report = engine(plan).run(tracking.clone()).await.unwrap();

        let per_vu = tracking.per_vu.lock();
        let ids: BTreeSet<u64> = per_vu.keys().copied().collect();
        assert_eq!(ids, (1..=10).collect());
        for (id, (started, finished)) in per_vu.iter() {
            assert_eq!(started, finished, "vu {} has an unfinished iteration", id);
        }
        assert_eq!(*tracking.late.lock(), (1..=6).collect::<BTreeSet<u64>>());
        assert!(report.snapshot.get(builtin::ITERATIONS_INTERRUPTED).is_none());

        let started: u64 = per_vu.values().map(|(s, _)| s).sum();
        assert_eq!(count(&report, builtin::ITERATIONS), started as f64);
        assert_eq!(count(&report, builtin::ITERATION_DURATION), started as f64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_runs_once_after_drain() {
        let plan = TestPlan::new(Schedule::constant(3, secs(2)));
        let tracking = Arc::new(Tracking::new(Duration::from_millis(300)));
        let report = engine(plan).run(tracking.clone()).await.unwrap();

        assert_eq!(tracking.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(tracking.in_flight_at_teardown.load(Ordering::SeqCst), 0);
        assert!(report.aborted.is_none());
        let checks = report
            .snapshot
            .aggregate(builtin::CHECKS, &Aggregator::Rate, &Tags::new())
            .unwrap();
        assert_eq!(checks, 1.0);
    }

    struct FailingSetup {
        iterations: AtomicUsize,
    }

    #[async_trait]
    impl Scenario for Arc<FailingSetup> {
        type Data = ();

        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            anyhow::bail!("auth server unavailable")
        }

        async fn iteration(&self, _vu: &mut VuContext, _data: &()) -> anyhow::Result<()> {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_error_aborts_before_any_vu() {
        let scenario = Arc::new(FailingSetup {
            iterations: AtomicUsize::new(0),
        });
        let eng = engine(TestPlan::new(Schedule::constant(5, secs(5))));
        let registry = eng.registry();
        let err = eng.run(scenario.clone()).await.unwrap_err();

        assert!(matches!(err, EngineError::Setup(_)));
        assert!(err.to_string().contains("auth server unavailable"));
        assert_eq!(scenario.iterations.load(Ordering::SeqCst), 0);
        assert!(registry.kind_of(builtin::VUS).is_none());
    }

    struct FailingTeardown;

    #[async_trait]
    impl Scenario for FailingTeardown {
        type Data = ();

        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn iteration(&self, vu: &mut VuContext, _data: &()) -> anyhow::Result<()> {
            vu.sleep(Duration::from_millis(100)).await;
            anyhow::bail!("unexpected response")
        }

        async fn teardown(&self, _vu: &mut VuContext, _data: &()) -> anyhow::Result<()> {
            anyhow::bail!("cleanup endpoint returned 500")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_error_is_fatal() {
        let err = engine(TestPlan::new(Schedule::constant(1, secs(1))))
            .run(FailingTeardown)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Teardown(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_abort() {
        let eng = engine(TestPlan::new(Schedule::constant(4, secs(60))));
        let control = eng.control();
        tokio::spawn(async move {
            tokio::time::sleep(secs(3)).await;
            control.abort("interrupted");
        });
        let tracking = Arc::new(Tracking::new(Duration::from_millis(500)));
        let report = eng.run(tracking.clone()).await.unwrap();

        assert_eq!(report.aborted.as_deref(), Some("interrupted"));
        assert!(report.duration < secs(5));
        assert_eq!(report.exit_status(), ExitStatus::Aborted);
        let per_vu = tracking.per_vu.lock();
        assert!(per_vu.values().all(|(s, f)| s == f));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_on_fail_threshold() {
        let mut spec = BTreeMap::new();
        spec.insert(
            builtin::ITERATION_FAILED.to_string(),
            vec![ThresholdSource {
                expression: "rate<0.1".to_string(),
                abort_on_fail: true,
                delay_abort_eval: None,
            }],
        );
        let plan = TestPlan::new(Schedule::constant(2, secs(60)))
            .with_thresholds(ThresholdSet::parse(&spec).unwrap());
        let report = engine(plan).run(AlwaysFails).await.unwrap();

        assert!(report.duration < secs(5));
        assert!(report.aborted.unwrap().contains("iteration_failed"));
        assert!(!report.verdicts[0].passed);
    }

    /// Always fails, with a trivial teardown.
    struct AlwaysFails;

    #[async_trait]
    impl Scenario for AlwaysFails {
        type Data = ();

        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn iteration(&self, vu: &mut VuContext, _data: &()) -> anyhow::Result<()> {
            vu.sleep(Duration::from_millis(100)).await;
            anyhow::bail!("unexpected response")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_test_thresholds() {
        let mut spec = BTreeMap::new();
        spec.insert(
            builtin::ITERATION_FAILED.to_string(),
            vec![ThresholdSource {
                expression: "rate<0.1".to_string(),
                abort_on_fail: false,
                delay_abort_eval: None,
            }],
        );
        spec.insert(
            "never_recorded".to_string(),
            vec![ThresholdSource {
                expression: "count>0".to_string(),
                abort_on_fail: false,
                delay_abort_eval: None,
            }],
        );
        let plan = TestPlan::new(Schedule::constant(1, secs(2)))
            .with_thresholds(ThresholdSet::parse(&spec).unwrap());
        let report = engine(plan).run(AlwaysFails).await.unwrap();

        assert!(report.aborted.is_none());
        assert_eq!(report.verdicts.len(), 2);
        assert!(report.verdicts.iter().all(|v| !v.passed));
        assert_eq!(report.exit_status(), ExitStatus::ThresholdsFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_cap_ends_run_early() {
        let plan = TestPlan::new(Schedule::constant(3, secs(60))).with_iterations(4);
        let tracking = Arc::new(Tracking::new(Duration::from_millis(200)));
        let report = engine(plan).run(tracking.clone()).await.unwrap();

        assert_eq!(count(&report, builtin::ITERATIONS), 12.0);
        assert!(report.duration < secs(5));
        assert_eq!(tracking.per_vu.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_window_interrupts_stragglers() {
        let plan = TestPlan::new(Schedule::constant(2, secs(2))).with_graceful_stop(secs(1));
        let tracking = Arc::new(Tracking::new(secs(60)));
        let report = engine(plan).run(tracking).await.unwrap();

        assert_eq!(count(&report, builtin::ITERATIONS_INTERRUPTED), 2.0);
        assert!(report.snapshot.get(builtin::ITERATIONS).is_none());
        assert!(report.duration < secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_sleep_is_not_an_interrupted_iteration() {
        let plan = TestPlan::new(Schedule::constant(1, secs(2)))
            .with_graceful_stop(secs(1))
            .with_min_iteration_duration(secs(10));
        let tracking = Arc::new(Tracking::new(Duration::from_millis(10)));
        let report = engine(plan).run(tracking).await.unwrap();

        assert_eq!(count(&report, builtin::ITERATIONS), 1.0);
        assert!(report.snapshot.get(builtin::ITERATIONS_INTERRUPTED).is_none());
        assert!(report.duration < secs(3));
    }

    struct CrashFirstVu {
        seen: Mutex<BTreeSet<u64>>,
    }

    #[async_trait]
    impl Scenario for Arc<CrashFirstVu> {
        type Data = ();

        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn iteration(&self, vu: &mut VuContext, _data: &()) -> anyhow::Result<()> {
            self.seen.lock().insert(vu.vu_id());
            vu.sleep(Duration::from_millis(200)).await;
            if vu.vu_id() == 1 {
                return Err(VuCrash::new("session corrupted").into());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_vu_is_replaced_with_fresh_id() {
        let scenario = Arc::new(CrashFirstVu {
            seen: Mutex::new(BTreeSet::new()),
        });
        let report = engine(TestPlan::new(Schedule::constant(2, secs(3))))
            .run(scenario.clone())
            .await
            .unwrap();

        assert_eq!(count(&report, builtin::VUS_CRASHED), 1.0);
        assert_eq!(*scenario.seen.lock(), BTreeSet::from([1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_schedule_clock() {
        let eng = engine(TestPlan::new(Schedule::constant(1, secs(4))));
        let control = eng.control();
        tokio::spawn(async move {
            tokio::time::sleep(secs(1)).await;
            control.pause();
            tokio::time::sleep(secs(5)).await;
            control.resume();
        });
        let start = Instant::now();
        let report = eng.run(Arc::new(Tracking::new(Duration::from_millis(100)))).await.unwrap();

        assert!(start.elapsed() >= secs(9));
        assert!(report.duration < secs(5));
    }
}
