//! Telemetry runtimes
//!
//! Both runtimes follow Idle -> Running -> Stopped. Stopped is terminal.
//! `stop` is synchronous: once it returns, the provider is never sampled
//! again, so the device it reads from can be torn down right after.

use super::{TelemetryProvider, TelemetryState};
use crate::error::BackendError;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::error;
use web_time::Instant;

/// Start/stop control shared by the threaded and cooperative runtimes.
pub trait ScheduledTask {
    /// No-op unless idle.
    fn start(&mut self) -> Result<(), BackendError>;
    /// No-op unless running. Returns only after polling has ceased.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Stopped,
}

fn sample_once<P: TelemetryProvider + ?Sized>(provider: &mut P, state: &TelemetryState) {
    let start = Instant::now();
    provider.sample(state);
    state.record_sample(start.elapsed());
}

/// Polls on a dedicated worker thread.
pub struct ThreadedRuntime {
    state: Arc<TelemetryState>,
    provider: Option<Box<dyn TelemetryProvider + Send>>,
    interval: Duration,
    phase: Phase,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedRuntime {
    pub fn new(
        state: Arc<TelemetryState>,
        provider: Box<dyn TelemetryProvider + Send>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            provider: Some(provider),
            interval,
            phase: Phase::Idle,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Takes one sample on the calling thread. Only valid before `start`.
    pub fn prime(&mut self) {
        if let Some(provider) = self.provider.as_mut() {
            sample_once(provider, &self.state);
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl ScheduledTask for ThreadedRuntime {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.phase != Phase::Idle {
            return Ok(());
        }
        let Some(mut provider) = self.provider.take() else {
            return Ok(());
        };

        self.running.store(true, Ordering::Release);
        self.state.clear_error_latch();

        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("sluice-telemetry".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    sample_once(&mut provider, &state);
                    let deadline = Instant::now() + interval;
                    // `stop` unparks us; spurious wakeups go back to sleep.
                    while running.load(Ordering::Acquire) {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        thread::park_timeout(deadline - now);
                    }
                }
            });

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                self.phase = Phase::Running;
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                self.phase = Phase::Stopped;
                Err(err.into())
            }
        }
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            if worker.join().is_err() {
                error!("Telemetry worker panicked.");
            }
        }
        self.phase = Phase::Stopped;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for ThreadedRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs a task later on the same thread.
pub trait Scheduler: Clone + 'static {
    fn defer(&self, delay: Duration, task: Box<dyn FnOnce()>);
}

struct Pump<S> {
    state: Arc<TelemetryState>,
    provider: RefCell<Box<dyn TelemetryProvider>>,
    active: Cell<bool>,
    interval: Duration,
    scheduler: S,
}

fn schedule<S: Scheduler>(pump: &Rc<Pump<S>>) {
    let weak: Weak<Pump<S>> = Rc::downgrade(pump);
    pump.scheduler.defer(
        pump.interval,
        Box::new(move || {
            if let Some(pump) = weak.upgrade() {
                fire(&pump);
            }
        }),
    );
}

fn fire<S: Scheduler>(pump: &Rc<Pump<S>>) {
    if !pump.active.get() {
        return;
    }
    sample_once(&mut *pump.provider.borrow_mut(), &pump.state);
    schedule(pump);
}

/// Single-threaded runtime: each sample re-schedules the next one.
pub struct CooperativeRuntime<S: Scheduler> {
    pump: Rc<Pump<S>>,
    phase: Phase,
}

impl<S: Scheduler> CooperativeRuntime<S> {
    pub fn new(
        state: Arc<TelemetryState>,
        provider: Box<dyn TelemetryProvider>,
        interval: Duration,
        scheduler: S,
    ) -> Self {
        Self {
            pump: Rc::new(Pump {
                state,
                provider: RefCell::new(provider),
                active: Cell::new(false),
                interval,
                scheduler,
            }),
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl<S: Scheduler> ScheduledTask for CooperativeRuntime<S> {
    /// Samples immediately, then every interval.
    fn start(&mut self) -> Result<(), BackendError> {
        if self.phase != Phase::Idle {
            return Ok(());
        }
        self.pump.active.set(true);
        self.pump.state.clear_error_latch();
        self.phase = Phase::Running;
        fire(&self.pump);
        Ok(())
    }

    fn stop(&mut self) {
        if !self.pump.active.replace(false) {
            return;
        }
        self.phase = Phase::Stopped;
    }

    fn is_running(&self) -> bool {
        self.pump.active.get()
    }
}

impl<S: Scheduler> Drop for CooperativeRuntime<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Deferred {
    due: Instant,
    task: Box<dyn FnOnce()>,
}

/// Scheduler driven by the host's own loop (e.g. once per UI frame).
#[derive(Clone, Default)]
pub struct FrameScheduler {
    queue: Rc<RefCell<Vec<Deferred>>>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Runs every task due at `now`. Tasks deferred meanwhile wait for the next call.
    pub fn run_due(&self, now: Instant) -> usize {
        let ready = {
            let mut queue = self.queue.borrow_mut();
            let (ready, waiting): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *queue).into_iter().partition(|d| d.due <= now);
            *queue = waiting;
            ready
        };
        let count = ready.len();
        for deferred in ready {
            (deferred.task)();
        }
        count
    }
}

impl Scheduler for FrameScheduler {
    fn defer(&self, delay: Duration, task: Box<dyn FnOnce()>) {
        self.queue.borrow_mut().push(Deferred {
            due: Instant::now() + delay,
            task,
        });
    }
}

/// Browser scheduler backed by `setTimeout`.
#[cfg(target_arch = "wasm32")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutScheduler;

#[cfg(target_arch = "wasm32")]
impl Scheduler for TimeoutScheduler {
    fn defer(&self, delay: Duration, task: Box<dyn FnOnce()>) {
        use wasm_bindgen::{closure::Closure, JsCast};

        let Some(window) = web_sys::window() else {
            error!("No window available; telemetry refresh dropped.");
            return;
        };
        let callback = Closure::once_into_js(task);
        let scheduled = window.set_timeout_with_callback_and_timeout_and_arguments_0(
            callback.unchecked_ref(),
            delay.as_millis().min(i32::MAX as u128) as i32,
        );
        if scheduled.is_err() {
            error!("setTimeout rejected the telemetry refresh.");
        }
    }
}


#[cfg(all(test, target_arch = "wasm32"))]
mod wasm_tests {
    use super::*;
    use crate::telemetry::ProviderKind;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    struct Warm;

    impl TelemetryProvider for Warm {
        fn sample(&mut self, state: &TelemetryState) {
            state.store_thermal_bucket(1);
        }
    }

    #[wasm_bindgen_test]
    fn cooperative_start_samples_in_the_browser() {
        let state = Arc::new(TelemetryState::new(ProviderKind::Browser, "warm"));
        let scheduler = FrameScheduler::new();
        let interval = Duration::from_millis(5);
        let mut runtime =
            CooperativeRuntime::new(Arc::clone(&state), Box::new(Warm), interval, scheduler.clone());

        runtime.start().unwrap();
        assert_eq!(state.sample_count(), 1);
        assert_eq!(state.thermal_bucket(), 1);

        assert_eq!(scheduler.run_due(Instant::now() + interval * 2), 1);
        assert_eq!(state.sample_count(), 2);
        runtime.stop();
    }

    #[wasm_bindgen_test]
    fn timeout_scheduler_accepts_a_refresh() {
        let state = Arc::new(TelemetryState::new(ProviderKind::Browser, "warm"));
        let mut runtime = CooperativeRuntime::new(
            Arc::clone(&state),
            Box::new(Warm),
            Duration::from_secs(60),
            TimeoutScheduler,
        );
        runtime.start().unwrap();
        assert_eq!(state.sample_count(), 1);
        runtime.stop();
    }
}
