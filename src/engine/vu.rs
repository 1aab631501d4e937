//! Virtual user executor.
//!
//! Each VU is a tokio task running the scenario's iteration function in a
//! loop. State moves `Idle -> Running -> (Stopping | Crashed) -> Terminated`.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::context::VuContext;
use super::control::SharedControl;
use super::http::SharedTransport;
use super::Scenario;
use crate::error::VuCrash;
use crate::stats::{builtin, SharedRegistry, Tags};

const PAUSE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VuState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Crashed = 3,
    Terminated = 4,
}

impl VuState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VuState::Idle,
            1 => VuState::Running,
            2 => VuState::Stopping,
            3 => VuState::Crashed,
            _ => VuState::Terminated,
        }
    }
}

/// Result of one call to the iteration function.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub vu_id: u64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl IterationOutcome {
    fn record(&self, registry: &SharedRegistry, tags: &Tags) {
        let results = [
            registry.counter_add(builtin::ITERATIONS, 1.0, tags),
            registry.trend_add(
                builtin::ITERATION_DURATION,
                self.duration.as_secs_f64() * 1000.0,
                tags,
            ),
            registry.rate_add(builtin::ITERATION_FAILED, self.error.is_some(), tags),
        ];
        for e in results.into_iter().filter_map(Result::err) {
            tracing::warn!(vu = self.vu_id, error = %e, "failed to record iteration metric");
        }
    }
}

/// Why a VU task returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuExit {
    /// Stop was requested (retirement, end of test or abort).
    Stopped,
    /// The per-VU iteration cap was reached.
    Completed,
    Crashed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct VuReport {
    pub iterations: u64,
    pub exit: VuExit,
}

/// Everything a VU task needs, shared by the whole pool.
pub(crate) struct VuShared<S: Scenario> {
    pub scenario: Arc<S>,
    pub data: Arc<S::Data>,
    pub registry: SharedRegistry,
    pub control: SharedControl,
    pub transport: SharedTransport,
    pub max_iterations: Option<u64>,
    pub min_iteration_duration: Option<Duration>,
}

/// Controller-side handle of a running VU.
pub(crate) struct VuHandle {
    pub id: u64,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    pub task: JoinHandle<VuReport>,
}

impl VuHandle {
    pub fn spawn<S: Scenario>(id: u64, shared: Arc<VuShared<S>>) -> Self {
        let state = Arc::new(AtomicU8::new(VuState::Idle as u8));
        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(id, shared, state.clone(), stop.clone()));
        Self {
            id,
            state,
            stop,
            task,
        }
    }

    /// Ask the VU to finish its current iteration and exit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        enter_stopping(&self.state);
    }

    pub fn state(&self) -> VuState {
        VuState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// `Idle`/`Running` to `Stopping`; later states are left alone.
fn enter_stopping(state: &AtomicU8) {
    let _ = state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
        match VuState::from_u8(s) {
            VuState::Idle | VuState::Running => Some(VuState::Stopping as u8),
            _ => None,
        }
    });
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

async fn run<S: Scenario>(
    id: u64,
    shared: Arc<VuShared<S>>,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
) -> VuReport {
    let set_state = |s: VuState| state.store(s as u8, Ordering::SeqCst);
    let mut ctx = VuContext::new(
        id,
        shared.registry.clone(),
        shared.control.clone(),
        shared.transport.clone(),
    );
    let control = &shared.control;
    let should_stop = || stop.load(Ordering::SeqCst) || control.is_aborted();

    let _ = state.compare_exchange(
        VuState::Idle as u8,
        VuState::Running as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
    tracing::debug!(vu = id, "vu started");

    let mut iterations: u64 = 0;
    let exit = loop {
        while control.is_paused() && !should_stop() {
            tokio::time::sleep(PAUSE_POLL).await;
        }
        if should_stop() {
            enter_stopping(&state);
            break VuExit::Stopped;
        }
        if shared.max_iterations.is_some_and(|max| iterations >= max) {
            break VuExit::Completed;
        }

        ctx.set_iteration(iterations);
        ctx.reset_groups();
        let started_at = Utc::now();
        let start = Instant::now();
        let result = AssertUnwindSafe(shared.scenario.iteration(&mut ctx, &shared.data))
            .catch_unwind()
            .await;
        let duration = start.elapsed();

        let (error, crash) = match result {
            Ok(Ok(())) => (None, None),
            Ok(Err(e)) => {
                let crash = e.downcast_ref::<VuCrash>().map(|c| c.reason.clone());
                (Some(format!("{:#}", e)), crash)
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                (Some(format!("panicked: {}", msg)), Some(msg))
            }
        };

        ctx.reset_groups();
        let outcome = IterationOutcome {
            vu_id: id,
            started_at,
            duration,
            error,
        };
        if let Some(e) = &outcome.error {
            tracing::debug!(vu = id, iteration = iterations, error = %e, "iteration failed");
        }
        outcome.record(&shared.registry, &ctx.tags());
        iterations += 1;

        if let Some(reason) = crash {
            set_state(VuState::Crashed);
            tracing::warn!(vu = id, reason = %reason, "virtual user crashed");
            if let Err(e) = shared
                .registry
                .counter_add(builtin::VUS_CRASHED, 1.0, &ctx.tags())
            {
                tracing::warn!(vu = id, error = %e, "failed to record crash");
            }
            break VuExit::Crashed;
        }

        // Pacing is cut short by a stop request; no iteration is in flight.
        if let Some(min) = shared.min_iteration_duration {
            let until = start.checked_add(min);
            while !should_stop() && until.map_or(true, |u| Instant::now() < u) {
                let step = Instant::now() + PAUSE_POLL;
                tokio::time::sleep_until(until.map_or(step, |u| u.min(step))).await;
            }
        }
    };

    if exit != VuExit::Crashed {
        enter_stopping(&state);
    }
    tracing::debug!(vu = id, iterations, ?exit, "vu finished");
    set_state(VuState::Terminated);
    VuReport { iterations, exit }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::control::ControlState;
    use crate::engine::http::mock::MockTransport;
    use crate::stats::{Aggregator, MetricRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Scenario for Flaky {
        type Data = ();

        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn iteration(&self, vu: &mut VuContext, _data: &()) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            vu.sleep(Duration::from_millis(100)).await;
            if n % 2 == 1 {
                anyhow::bail!("bad response");
            }
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Scenario for Panics {
        type Data = ();

        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn iteration(&self, _vu: &mut VuContext, _data: &()) -> anyhow::Result<()> {
            panic!("index out of bounds");
        }
    }

    struct CrashOnThird;

    #[async_trait]
    impl Scenario for CrashOnThird {
        type Data = ();

        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn iteration(&self, vu: &mut VuContext, _data: &()) -> anyhow::Result<()> {
            if vu.iteration() == 2 {
                return Err(VuCrash::new("lost session").into());
            }
            Ok(())
        }
    }

    fn shared<S: Scenario<Data = ()>>(
        scenario: S,
        max_iterations: Option<u64>,
    ) -> Arc<VuShared<S>> {
        Arc::new(VuShared {
            scenario: Arc::new(scenario),
            data: Arc::new(()),
            registry: Arc::new(MetricRegistry::new()),
            control: Arc::new(ControlState::new()),
            transport: Arc::new(MockTransport::new(200, Duration::ZERO)),
            max_iterations,
            min_iteration_duration: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_errors_do_not_stop_the_vu() {
        let shared = shared(Flaky::default(), Some(8));
        let handle = VuHandle::spawn(1, shared.clone());
        let report = handle.task.await.unwrap();
        assert_eq!(report.iterations, 8);
        assert_eq!(report.exit, VuExit::Completed);

        let snap = shared.registry.snapshot(Duration::from_secs(1));
        let none = Tags::new();
        assert_eq!(snap.aggregate(builtin::ITERATIONS, &Aggregator::Count, &none).unwrap(), 8.0);
        assert_eq!(
            snap.aggregate(builtin::ITERATION_FAILED, &Aggregator::Rate, &none).unwrap(),
            0.5
        );
        assert!(snap.get(builtin::VUS_CRASHED).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vu_crash_terminates() {
        let shared = shared(CrashOnThird, None);
        let handle = VuHandle::spawn(7, shared.clone());
        let state = handle.state.clone();
        let report = handle.task.await.unwrap();
        assert_eq!(report.exit, VuExit::Crashed);
        assert_eq!(report.iterations, 3);
        assert_eq!(VuState::from_u8(state.load(Ordering::SeqCst)), VuState::Terminated);

        let snap = shared.registry.snapshot(Duration::from_secs(1));
        assert_eq!(
            snap.aggregate(builtin::VUS_CRASHED, &Aggregator::Count, &Tags::new()).unwrap(),
            1.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_crashes_the_vu() {
        let shared = shared(Panics, None);
        let report = VuHandle::spawn(2, shared.clone()).task.await.unwrap();
        assert_eq!(report.exit, VuExit::Crashed);
        assert_eq!(report.iterations, 1);

        let snap = shared.registry.snapshot(Duration::from_secs(1));
        assert_eq!(
            snap.aggregate(builtin::ITERATION_FAILED, &Aggregator::Rate, &Tags::new()).unwrap(),
            1.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_current_iteration() {
        let shared = shared(Flaky::default(), None);
        let handle = VuHandle::spawn(1, shared.clone());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.state(), VuState::Running);
        handle.request_stop();
        assert_eq!(handle.state(), VuState::Stopping);
        let state = handle.state.clone();
        let report = handle.task.await.unwrap();
        assert_eq!(report.exit, VuExit::Stopped);
        assert_eq!(report.iterations, 3);
        assert_eq!(VuState::from_u8(state.load(Ordering::SeqCst)), VuState::Terminated);

        let snap = shared.registry.snapshot(Duration::from_secs(1));
        let count = snap
            .aggregate(builtin::ITERATION_DURATION, &Aggregator::Count, &Tags::new())
            .unwrap();
        assert_eq!(count, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_at_iteration_boundary() {
        let shared = shared(Flaky::default(), None);
        shared.control.pause();
        let handle = VuHandle::spawn(1, shared.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(shared.scenario.calls.load(Ordering::SeqCst), 0);

        shared.control.resume();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(shared.scenario.calls.load(Ordering::SeqCst) >= 2);
        shared.control.abort("done");
        let report = handle.task.await.unwrap();
        assert_eq!(report.exit, VuExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_iteration_duration_paces_the_loop() {
        let mut inner = shared(CrashOnThird, Some(2));
        Arc::get_mut(&mut inner).unwrap().min_iteration_duration = Some(Duration::from_secs(1));
        let start = Instant::now();
        let report = VuHandle::spawn(1, inner).task.await.unwrap();
        assert_eq!(report.iterations, 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_cuts_pacing_short() {
        let mut inner = shared(Flaky::default(), None);
        Arc::get_mut(&mut inner).unwrap().min_iteration_duration = Some(Duration::from_secs(10));
        let handle = VuHandle::spawn(1, inner);
        // first iteration takes 100ms, then the VU pads towards 10s
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.request_stop();

        let start = Instant::now();
        let report = tokio::time::timeout(Duration::from_secs(1), handle.task)
            .await
            .expect("vu kept pacing after stop")
            .unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(report.exit, VuExit::Stopped);
        assert!(start.elapsed() <= PAUSE_POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_finishes_current_iteration() {
        let shared = shared(Flaky::default(), None);
        let handle = VuHandle::spawn(1, shared.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        shared.control.abort("stop");
        let report = handle.task.await.unwrap();
        assert_eq!(report.exit, VuExit::Stopped);
        assert_eq!(report.iterations, 2);
    }
}
