//! System runner: one dedicated worker thread per system.
//!
//! A [`ThreadedSystem`] owns a [`System`] value and walks it through
//! `Created -> Configured -> Running -> Stopped`. While running, the value
//! lives on the worker thread and nowhere else. Each tick the worker:
//!
//! 1. Executes up to `max_commands_per_tick` queued commands.
//! 2. Delivers every pending stream event to the system's handlers.
//! 3. Calls [`System::on_tick`].
//! 4. Sleeps out the rest of the tick period.
//!
//! Failures never cross the thread boundary. Panicking commands, handlers
//! and ticks are caught, logged and published on the event stream as
//! [`SystemFaultEvent`]s. Fatal ones end the loop.
//!
//! Every fault is also kept in the runner's own fault log, which stream
//! backpressure cannot touch. Owners collect it with
//! [`ThreadedSystem::take_faults`].

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use engine_messaging::{
    CommandQueue, EventBus, EventReader, EventStream, FaultSource, Severity, SystemFaultEvent, panic_message,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SystemConfig;
use crate::context::{SystemContext, TickContext};
use crate::error::{SystemError, TickError};
use crate::services::ServiceLocator;
use crate::system::System;

// ── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`ThreadedSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// Constructed; no context yet.
    Created,
    /// Context stored; no thread yet.
    Configured,
    /// Worker thread spawned.
    Running,
    /// Worker thread joined. Terminal.
    Stopped,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

// ── Stats ───────────────────────────────────────────────────────────────────

/// Snapshot of a system's worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStats {
    /// Completed `on_tick` calls, including ones that returned an error.
    pub ticks: u64,
    /// Commands that ran to completion.
    pub commands_executed: u64,
    /// Commands that panicked.
    pub commands_failed: u64,
    /// Stream events delivered to handlers.
    pub events_delivered: u64,
    /// Stream handlers that panicked.
    pub handler_failures: u64,
    /// `on_tick` calls that returned [`TickError::Recoverable`].
    pub recoverable_errors: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    commands_executed: AtomicU64,
    commands_failed: AtomicU64,
    events_delivered: AtomicU64,
    handler_failures: AtomicU64,
    recoverable_errors: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SystemStats {
        SystemStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            recoverable_errors: self.recoverable_errors.load(Ordering::Relaxed),
        }
    }
}

/// Fault reports kept per runner until the owner collects them. The oldest
/// are evicted first, so a fatal report (always the last) survives.
pub const FAULT_LOG_CAPACITY: usize = 256;

/// State shared between the controlling thread and the worker.
#[derive(Default)]
struct Shared {
    running: AtomicBool,
    faulted: AtomicBool,
    counters: Counters,
    faults: Mutex<VecDeque<SystemFaultEvent>>,
}

impl Shared {
    fn record_fault(&self, fault: SystemFaultEvent) {
        let mut faults = self.faults.lock();
        if faults.len() >= FAULT_LOG_CAPACITY {
            faults.pop_front();
        }
        faults.push_back(fault);
    }
}

// ── ThreadedSystem ──────────────────────────────────────────────────────────

/// Owns a [`System`] and the worker thread that runs it.
pub struct ThreadedSystem<S: System> {
    config: SystemConfig,
    instance_id: Uuid,
    state: SystemState,
    queue: Arc<CommandQueue<S>>,
    /// Present in every state except `Running`.
    system: Option<S>,
    /// Set by `configure`, moved onto the worker by `start`.
    wiring: Option<(SystemContext<S>, EventReader<S>)>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<S>>,
}

impl<S: System> ThreadedSystem<S> {
    /// Wrap `system` with a default config named after it.
    #[must_use]
    pub fn new(system: S) -> Self {
        let config = SystemConfig::new(system.name());
        Self::with_config(system, config)
    }

    /// Wrap `system` with an explicit config.
    ///
    /// An unusable fixed rate is replaced with the fallback rate, and the
    /// system's own [`System::dependencies`] are merged into the config.
    #[must_use]
    pub fn with_config(system: S, mut config: SystemConfig) -> Self {
        if !config.cadence.is_valid() {
            warn!(
                system = config.name,
                cadence = ?config.cadence,
                "unusable tick rate, using fallback"
            );
            config.cadence = config.cadence.sanitized();
        }
        for dependency in system.dependencies() {
            config.add_dependency(*dependency);
        }
        let queue = match config.queue_capacity {
            Some(capacity) => CommandQueue::bounded(capacity),
            None => CommandQueue::new(),
        };
        Self {
            config,
            instance_id: Uuid::new_v4(),
            state: SystemState::Created,
            queue: Arc::new(queue),
            system: Some(system),
            wiring: None,
            shared: Arc::new(Shared::default()),
            worker: None,
        }
    }

    /// The system's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Unique id of this instance.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The active config.
    #[must_use]
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SystemState {
        self.state
    }

    /// The system's command queue. Clone the `Arc` to enqueue from elsewhere.
    #[must_use]
    pub fn queue(&self) -> &Arc<CommandQueue<S>> {
        &self.queue
    }

    /// The system value, unless it is out on the worker thread.
    #[must_use]
    pub fn system(&self) -> Option<&S> {
        self.system.as_ref()
    }

    /// Mutable access to the system value, unless it is out on the worker.
    pub fn system_mut(&mut self) -> Option<&mut S> {
        self.system.as_mut()
    }

    /// Whether the worker thread exists and has not exited.
    #[must_use]
    pub fn is_worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Whether the worker left its loop because of a fatal error.
    #[must_use]
    pub fn faulted(&self) -> bool {
        self.shared.faulted.load(Ordering::Acquire)
    }

    /// Current worker counters.
    #[must_use]
    pub fn stats(&self) -> SystemStats {
        self.shared.counters.snapshot()
    }

    /// Names of systems this one depends on.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.config.dependencies
    }

    /// Take every fault reported since the last call, oldest first.
    pub fn take_faults(&self) -> Vec<SystemFaultEvent> {
        self.shared.faults.lock().drain(..).collect()
    }

    fn invalid(&self, action: &'static str) -> SystemError {
        SystemError::InvalidTransition {
            system: self.config.name.clone(),
            action,
            state: self.state,
        }
    }

    /// Build the system's context, with its own scope of `services`, and let
    /// it resolve services and subscribe to events. Runs on the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidTransition`] unless `Created`, or
    /// whatever the system's own `configure` returns. On error the system
    /// stays `Created`.
    pub fn configure(
        &mut self,
        services: Arc<ServiceLocator>,
        stream: Arc<EventStream>,
    ) -> Result<(), SystemError> {
        if self.state != SystemState::Created {
            return Err(self.invalid("configure"));
        }
        let Some(system) = self.system.as_mut() else {
            return Err(self.invalid("configure"));
        };

        let context = SystemContext::new(
            self.config.name.as_str(),
            self.instance_id,
            Arc::new(services.create_scope()),
            stream,
            Arc::clone(&self.queue),
        );
        let mut reader = EventReader::new();
        system.configure(&context, &mut reader)?;

        debug!(
            system = self.config.name,
            subscriptions = reader.len(),
            "system configured"
        );
        self.wiring = Some((context, reader));
        self.state = SystemState::Configured;
        Ok(())
    }

    /// Spawn the worker thread, which calls `on_start` and enters the tick
    /// loop.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidTransition`] unless `Configured`, or
    /// [`SystemError::Spawn`] if the OS refuses the thread. A failed spawn
    /// loses the system value and leaves the runner `Stopped`.
    pub fn start(&mut self) -> Result<(), SystemError> {
        if self.state != SystemState::Configured {
            return Err(self.invalid("start"));
        }
        let (Some(system), Some((context, reader))) = (self.system.take(), self.wiring.take()) else {
            return Err(self.invalid("start"));
        };

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name(format!("system-{}", self.config.name))
            .spawn(move || run_worker(system, context, reader, &shared, &config));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.state = SystemState::Running;
                info!(
                    system = self.config.name,
                    instance_id = %self.instance_id,
                    "system started"
                );
                Ok(())
            }
            Err(source) => {
                self.shared.running.store(false, Ordering::Release);
                self.state = SystemState::Stopped;
                Err(SystemError::Spawn {
                    system: self.config.name.clone(),
                    source,
                })
            }
        }
    }

    /// Clear the run flag, wake the worker, and join it.
    ///
    /// Blocks for at most the remainder of the current tick plus the
    /// execution of commands still queued. Calling `stop` on a stopped system
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidTransition`] if the system never
    /// started, or [`SystemError::WorkerPanicked`] if the worker died outside
    /// every contained region.
    pub fn stop(&mut self) -> Result<(), SystemError> {
        match self.state {
            SystemState::Stopped => return Ok(()),
            SystemState::Created | SystemState::Configured => return Err(self.invalid("stop")),
            SystemState::Running => {}
        }

        self.shared.running.store(false, Ordering::Release);
        self.state = SystemState::Stopped;
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        handle.thread().unpark();

        match handle.join() {
            Ok(system) => {
                self.system = Some(system);
                info!(
                    system = self.config.name,
                    instance_id = %self.instance_id,
                    ticks = self.shared.counters.ticks.load(Ordering::Relaxed),
                    "system stopped"
                );
                Ok(())
            }
            Err(payload) => {
                // The worker never reached its own shutdown path.
                self.queue.close();
                let message = panic_message(payload.as_ref());
                error!(system = self.config.name, reason = %message, "worker thread panicked");
                Err(SystemError::WorkerPanicked {
                    system: self.config.name.clone(),
                    message,
                })
            }
        }
    }

    /// Stop if running, then hand back the system value.
    ///
    /// Returns `None` if the value was lost to a worker panic or a failed
    /// spawn.
    pub fn into_inner(mut self) -> Option<S> {
        if self.state == SystemState::Running {
            let _ = self.stop();
        }
        self.system.take()
    }
}

impl<S: System> Drop for ThreadedSystem<S> {
    fn drop(&mut self) {
        if self.state == SystemState::Running
            && let Err(err) = self.stop()
        {
            warn!(system = self.config.name, error = %err, "stop on drop failed");
        }
    }
}

impl<S: System> fmt::Debug for ThreadedSystem<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedSystem")
            .field("name", &self.config.name)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state)
            .field("queued_commands", &self.queue.len())
            .finish_non_exhaustive()
    }
}

// ── ManagedSystem ───────────────────────────────────────────────────────────

/// Type-erased lifecycle control, for owners that hold systems of different
/// types side by side.
pub trait ManagedSystem: Send {
    /// The system's name.
    fn name(&self) -> &str;
    /// Unique id of this instance.
    fn instance_id(&self) -> Uuid;
    /// Current lifecycle state.
    fn state(&self) -> SystemState;
    /// See [`ThreadedSystem::configure`].
    ///
    /// # Errors
    ///
    /// As [`ThreadedSystem::configure`].
    fn configure(&mut self, services: Arc<ServiceLocator>, stream: Arc<EventStream>) -> Result<(), SystemError>;
    /// See [`ThreadedSystem::start`].
    ///
    /// # Errors
    ///
    /// As [`ThreadedSystem::start`].
    fn start(&mut self) -> Result<(), SystemError>;
    /// See [`ThreadedSystem::stop`].
    ///
    /// # Errors
    ///
    /// As [`ThreadedSystem::stop`].
    fn stop(&mut self) -> Result<(), SystemError>;
    /// Whether the worker thread exists and has not exited.
    fn is_worker_alive(&self) -> bool;
    /// Whether the worker left its loop because of a fatal error.
    fn faulted(&self) -> bool;
    /// Current worker counters.
    fn stats(&self) -> SystemStats;
    /// Names of systems this one depends on.
    fn dependencies(&self) -> &[String];
    /// See [`ThreadedSystem::take_faults`].
    fn take_faults(&self) -> Vec<SystemFaultEvent>;
}

impl<S: System> ManagedSystem for ThreadedSystem<S> {
    fn name(&self) -> &str {
        ThreadedSystem::name(self)
    }

    fn instance_id(&self) -> Uuid {
        ThreadedSystem::instance_id(self)
    }

    fn state(&self) -> SystemState {
        ThreadedSystem::state(self)
    }

    fn configure(&mut self, services: Arc<ServiceLocator>, stream: Arc<EventStream>) -> Result<(), SystemError> {
        ThreadedSystem::configure(self, services, stream)
    }

    fn start(&mut self) -> Result<(), SystemError> {
        ThreadedSystem::start(self)
    }

    fn stop(&mut self) -> Result<(), SystemError> {
        ThreadedSystem::stop(self)
    }

    fn is_worker_alive(&self) -> bool {
        ThreadedSystem::is_worker_alive(self)
    }

    fn faulted(&self) -> bool {
        ThreadedSystem::faulted(self)
    }

    fn stats(&self) -> SystemStats {
        ThreadedSystem::stats(self)
    }

    fn dependencies(&self) -> &[String] {
        ThreadedSystem::dependencies(self)
    }

    fn take_faults(&self) -> Vec<SystemFaultEvent> {
        ThreadedSystem::take_faults(self)
    }
}

// ── Worker ──────────────────────────────────────────────────────────────────

/// Records [`SystemFaultEvent`]s in the fault log and publishes them.
struct FaultReporter<'a, S> {
    context: &'a SystemContext<S>,
    shared: &'a Shared,
}

impl<S> FaultReporter<'_, S> {
    fn report(&self, source: FaultSource, severity: Severity, message: String) {
        let fault = SystemFaultEvent {
            system: self.context.name().to_string(),
            instance_id: self.context.instance_id().to_string(),
            source,
            severity,
            message,
        };
        self.shared.record_fault(fault.clone());
        if let Err(err) = self.context.stream().publish(fault) {
            debug!(system = self.context.name(), error = %err, "fault not published on stream");
        }
    }
}

fn run_worker<S: System>(
    mut system: S,
    context: SystemContext<S>,
    mut reader: EventReader<S>,
    shared: &Shared,
    config: &SystemConfig,
) -> S {
    let bus = EventBus::new();
    let faults = FaultReporter {
        context: &context,
        shared,
    };
    let name = context.name();

    let started = {
        let mut ctx = TickContext::new(&context, &bus, 0, Duration::ZERO);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| system.on_start(&mut ctx)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.message().to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(message) = failure {
            error!(system = name, reason = %message, "on_start failed");
            shared.faulted.store(true, Ordering::Release);
            faults.report(FaultSource::Start, Severity::Fatal, message);
            false
        } else {
            true
        }
    };

    if started {
        tick_loop(&mut system, &context, &mut reader, &bus, shared, config, &faults);
    }

    // No more commands are accepted; the ones already queued still run.
    context.queue().close();
    let report = context.queue().drain(&mut system, usize::MAX);
    record_commands(shared, name, report, &faults);

    let mut ctx = TickContext::new(&context, &bus, 0, Duration::ZERO);
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| system.on_stop(&mut ctx))) {
        let message = panic_message(payload.as_ref());
        error!(system = name, reason = %message, "on_stop panicked");
        faults.report(FaultSource::Stop, Severity::Recoverable, message);
    }

    debug!(system = name, "worker exiting");
    system
}

fn record_commands<S>(
    shared: &Shared,
    name: &str,
    report: engine_messaging::DrainReport,
    faults: &FaultReporter<'_, S>,
) {
    Counters::add(&shared.counters.commands_executed, report.executed);
    Counters::add(&shared.counters.commands_failed, report.failed.len());
    for err in report.failed {
        warn!(system = name, error = %err, "command failed");
        faults.report(FaultSource::Command, Severity::Recoverable, err.to_string());
    }
}

fn tick_loop<S: System>(
    system: &mut S,
    context: &SystemContext<S>,
    reader: &mut EventReader<S>,
    bus: &EventBus,
    shared: &Shared,
    config: &SystemConfig,
    faults: &FaultReporter<'_, S>,
) {
    let name = context.name();
    let period = config.cadence.period();
    let budget = config.command_budget();
    let mut tick = 0u64;
    let mut last = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        let began = Instant::now();
        let delta = began.duration_since(last);
        last = began;
        tick += 1;

        let report = context.queue().drain(system, budget);
        record_commands(shared, name, report, faults);

        let stats = reader.drain_all(system);
        Counters::add(&shared.counters.events_delivered, stats.delivered);
        Counters::add(&shared.counters.handler_failures, stats.failures.len());
        for failure in stats.failures {
            warn!(system = name, event = failure.event, reason = %failure.message, "event handler panicked");
            faults.report(
                FaultSource::EventHandler,
                Severity::Recoverable,
                format!("{}: {}", failure.event, failure.message),
            );
        }

        let mut ctx = TickContext::new(context, bus, tick, delta);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| system.on_tick(&mut ctx)));
        Counters::add(&shared.counters.ticks, 1);
        let fatal = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(TickError::Recoverable(message))) => {
                warn!(system = name, tick, reason = %message, "tick failed");
                Counters::add(&shared.counters.recoverable_errors, 1);
                faults.report(FaultSource::Tick, Severity::Recoverable, message);
                None
            }
            Ok(Err(TickError::Fatal(message))) => Some(message),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(message) = fatal {
            error!(system = name, tick, reason = %message, "fatal system error, leaving tick loop");
            shared.faulted.store(true, Ordering::Release);
            faults.report(FaultSource::Tick, Severity::Fatal, message);
            return;
        }

        match period {
            Some(period) => {
                let elapsed = began.elapsed();
                if elapsed > period {
                    warn!(
                        system = name,
                        tick,
                        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                        budget_ms = period.as_secs_f64() * 1000.0,
                        "tick exceeded time budget"
                    );
                } else {
                    sleep_until(began + period, &shared.running);
                }
            }
            None => thread::yield_now(),
        }
    }
}

/// Park until `deadline`, returning early once `running` is cleared.
fn sleep_until(deadline: Instant, running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use engine_messaging::{Backpressure, StreamOptions};

    use super::*;
    use crate::config::Cadence;
    use crate::services::ServiceRegistry;

    fn hubs() -> (Arc<ServiceLocator>, Arc<EventStream>) {
        (
            Arc::new(ServiceRegistry::new().freeze()),
            Arc::new(EventStream::new()),
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[derive(Default)]
    struct Calls {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    #[derive(Default)]
    struct Sampler {
        calls: Arc<Calls>,
        counter: u32,
        sum: u64,
        threads: Vec<Option<String>>,
    }

    impl System for Sampler {
        fn name(&self) -> &str {
            "sampler"
        }

        fn configure(
            &mut self,
            context: &SystemContext<Self>,
            events: &mut EventReader<Self>,
        ) -> Result<(), SystemError> {
            events.subscribe(context.stream(), |sampler: &mut Self, value: &u64| sampler.sum += value);
            Ok(())
        }

        fn on_start(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
            self.calls.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_tick(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
            Ok(())
        }

        fn on_stop(&mut self, _ctx: &mut TickContext<'_, Self>) {
            self.calls.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_start_then_immediate_stop() {
        let sampler = Sampler::default();
        let calls = Arc::clone(&sampler.calls);
        let mut runner = ThreadedSystem::new(sampler);
        let (services, stream) = hubs();
        runner.configure(services, stream).unwrap();
        for _ in 0..10 {
            runner.queue().enqueue(|sampler| sampler.counter += 1).unwrap();
        }

        runner.start().unwrap();
        runner.stop().unwrap();

        assert_eq!(runner.state(), SystemState::Stopped);
        assert!(!runner.is_worker_alive());
        assert_eq!(calls.started.load(Ordering::SeqCst), 1);
        assert_eq!(calls.stopped.load(Ordering::SeqCst), 1);
        // Nothing queued before stop is dropped.
        assert_eq!(runner.system().unwrap().counter, 10);
        assert_eq!(runner.stats().commands_executed, 10);
    }

    #[test]
    fn test_enqueue_after_stop_is_rejected() {
        let mut runner = ThreadedSystem::new(Sampler::default());
        let (services, stream) = hubs();
        runner.configure(services, stream).unwrap();
        runner.start().unwrap();
        runner.stop().unwrap();

        let err = runner.queue().enqueue(|sampler| sampler.counter += 1).unwrap_err();
        assert_eq!(err, engine_messaging::MessagingError::QueueClosed);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut runner = ThreadedSystem::new(Sampler::default());
        assert!(matches!(
            runner.start(),
            Err(SystemError::InvalidTransition { action: "start", .. })
        ));
        assert!(matches!(
            runner.stop(),
            Err(SystemError::InvalidTransition { action: "stop", .. })
        ));

        let (services, stream) = hubs();
        runner.configure(Arc::clone(&services), Arc::clone(&stream)).unwrap();
        assert!(runner.configure(services, stream).is_err());

        runner.start().unwrap();
        assert!(runner.start().is_err());
        runner.stop().unwrap();
        // Stopping twice is a no-op; restarting is not allowed.
        runner.stop().unwrap();
        assert!(matches!(
            runner.start(),
            Err(SystemError::InvalidTransition {
                state: SystemState::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn test_commands_run_on_worker_thread() {
        let config = SystemConfig::new("sampler").with_cadence(Cadence::Variable);
        let mut runner = ThreadedSystem::with_config(Sampler::default(), config);
        let (services, stream) = hubs();
        runner.configure(services, stream).unwrap();
        runner.start().unwrap();

        let queue = Arc::clone(runner.queue());
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..50 {
                        queue
                            .enqueue(|sampler: &mut Sampler| {
                                sampler.counter += 1;
                                sampler.threads.push(thread::current().name().map(str::to_string));
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        runner.stop().unwrap();
        let sampler = runner.into_inner().unwrap();
        assert_eq!(sampler.counter, 200);
        assert!(
            sampler
                .threads
                .iter()
                .all(|name| name.as_deref() == Some("system-sampler"))
        );
    }

    #[test]
    fn test_stream_events_delivered_on_worker() {
        let config = SystemConfig::new("sampler").with_cadence(Cadence::Variable);
        let mut runner = ThreadedSystem::with_config(Sampler::default(), config);
        let (services, stream) = hubs();
        runner.configure(services, Arc::clone(&stream)).unwrap();
        runner.start().unwrap();

        for value in [1u64, 2, 3] {
            stream.publish(value).unwrap();
        }
        assert!(wait_until(|| runner.stats().events_delivered == 3));
        runner.stop().unwrap();
        assert_eq!(runner.system().unwrap().sum, 6);
    }

    #[test]
    fn test_configure_error_keeps_created() {
        struct Needy;

        impl System for Needy {
            fn name(&self) -> &str {
                "needy"
            }

            fn configure(
                &mut self,
                context: &SystemContext<Self>,
                _events: &mut EventReader<Self>,
            ) -> Result<(), SystemError> {
                context.resolve::<String>()?;
                Ok(())
            }

            fn on_tick(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
                Ok(())
            }
        }

        let mut runner = ThreadedSystem::new(Needy);
        let (services, stream) = hubs();
        let err = runner.configure(services, stream).unwrap_err();
        assert!(matches!(err, SystemError::Service(_)));
        assert_eq!(runner.state(), SystemState::Created);
        assert!(!runner.is_worker_alive());
    }

    /// Fails recoverably on tick 1 and fatally on tick 3.
    struct Flaky {
        stopped: Arc<Mutex<u32>>,
    }

    impl System for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn on_tick(&mut self, ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
            match ctx.tick() {
                1 => Err(TickError::recoverable("sensor timeout")),
                3 => Err(TickError::fatal("device lost")),
                _ => Ok(()),
            }
        }

        fn on_stop(&mut self, _ctx: &mut TickContext<'_, Self>) {
            if let Ok(mut stopped) = self.stopped.lock() {
                *stopped += 1;
            }
        }
    }

    #[test]
    fn test_recoverable_then_fatal() {
        let stopped = Arc::new(Mutex::new(0));
        let config = SystemConfig::new("flaky").with_cadence(Cadence::Variable);
        let mut runner = ThreadedSystem::with_config(
            Flaky {
                stopped: Arc::clone(&stopped),
            },
            config,
        );
        let (services, stream) = hubs();
        let faults = stream.subscribe::<SystemFaultEvent>(StreamOptions::unbounded());
        runner.configure(services, stream).unwrap();
        runner.start().unwrap();

        assert!(wait_until(|| !runner.is_worker_alive()));
        assert!(runner.faulted());
        assert_eq!(runner.stats().ticks, 3);
        assert_eq!(runner.stats().recoverable_errors, 1);

        let severities: Vec<_> = faults.drain().into_iter().map(|f| (f.source, f.severity)).collect();
        assert_eq!(
            severities,
            vec![
                (FaultSource::Tick, Severity::Recoverable),
                (FaultSource::Tick, Severity::Fatal),
            ]
        );

        runner.stop().unwrap();
        assert_eq!(*stopped.lock().unwrap(), 1);
    }

    #[test]
    fn test_tick_panic_is_contained_and_fatal() {
        struct Panicky;

        impl System for Panicky {
            fn name(&self) -> &str {
                "panicky"
            }

            fn on_tick(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
                panic!("index out of range");
            }
        }

        let mut runner = ThreadedSystem::new(Panicky);
        let (services, stream) = hubs();
        let faults = stream.subscribe::<SystemFaultEvent>(StreamOptions::unbounded());
        runner.configure(services, stream).unwrap();
        runner.start().unwrap();

        assert!(wait_until(|| !runner.is_worker_alive()));
        runner.stop().unwrap();
        assert!(runner.system().is_some());

        let reported = faults.drain();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].is_fatal());
        assert_eq!(reported[0].system, "panicky");
        assert!(reported[0].message.contains("index out of range"));
    }

    #[test]
    fn test_panicking_command_does_not_stop_system() {
        let config = SystemConfig::new("sampler").with_cadence(Cadence::Variable);
        let mut runner = ThreadedSystem::with_config(Sampler::default(), config);
        let (services, stream) = hubs();
        let faults = stream.subscribe::<SystemFaultEvent>(StreamOptions::unbounded());
        runner.configure(services, stream).unwrap();

        runner.queue().enqueue(|_| panic!("bad command")).unwrap();
        runner.queue().enqueue(|sampler| sampler.counter += 1).unwrap();
        runner.start().unwrap();

        assert!(wait_until(|| runner.stats().commands_executed == 1));
        assert!(runner.is_worker_alive());
        assert!(!runner.faulted());
        runner.stop().unwrap();

        assert_eq!(runner.stats().commands_failed, 1);
        let reported = faults.drain();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].source, FaultSource::Command);
        assert_eq!(reported[0].severity, Severity::Recoverable);
    }

    #[test]
    fn test_overflowing_tick_rate_still_stops_cleanly() {
        let sampler = Sampler::default();
        let calls = Arc::clone(&sampler.calls);
        let config = SystemConfig::new("sampler").with_cadence(Cadence::fixed(1e-20));
        let mut runner = ThreadedSystem::with_config(sampler, config);
        assert_eq!(runner.config().cadence, Cadence::fixed(crate::config::FALLBACK_HZ));

        let (services, stream) = hubs();
        runner.configure(services, stream).unwrap();
        runner.queue().enqueue(|sampler| sampler.counter += 1).unwrap();
        runner.start().unwrap();
        runner.stop().unwrap();

        assert_eq!(calls.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(runner.into_inner().unwrap().counter, 1);
    }

    #[test]
    fn test_huge_queue_capacity_is_not_preallocated() {
        let config = SystemConfig::new("sampler").with_queue_capacity(usize::MAX);
        let runner = ThreadedSystem::with_config(Sampler::default(), config);
        runner.queue().enqueue(|sampler| sampler.counter += 1).unwrap();
        assert_eq!(runner.queue().len(), 1);
    }

    #[test]
    fn test_fault_log_survives_rejecting_stream_subscriber() {
        let stopped = Arc::new(Mutex::new(0));
        let config = SystemConfig::new("flaky").with_cadence(Cadence::Variable);
        let mut runner = ThreadedSystem::with_config(
            Flaky {
                stopped: Arc::clone(&stopped),
            },
            config,
        );
        let (services, stream) = hubs();
        // Full after the first report and never drained.
        let stuck = stream.subscribe::<SystemFaultEvent>(StreamOptions::bounded(1, Backpressure::Reject));
        runner.configure(services, stream).unwrap();
        runner.start().unwrap();

        assert!(wait_until(|| !runner.is_worker_alive()));
        assert_eq!(stuck.len(), 1);

        let logged: Vec<_> = runner.take_faults().into_iter().map(|f| f.severity).collect();
        assert_eq!(logged, vec![Severity::Recoverable, Severity::Fatal]);
        assert!(runner.take_faults().is_empty());
        runner.stop().unwrap();
    }

    #[test]
    fn test_worker_panic_outside_hooks_closes_queue() {
        /// Panics when dropped on a system worker thread.
        #[derive(Clone)]
        struct Poison;

        impl Drop for Poison {
            fn drop(&mut self) {
                let on_worker = thread::current()
                    .name()
                    .is_some_and(|name| name.starts_with("system-"));
                if on_worker {
                    panic!("poisoned event dropped");
                }
            }
        }

        struct Victim;

        impl System for Victim {
            fn name(&self) -> &str {
                "victim"
            }

            fn configure(
                &mut self,
                context: &SystemContext<Self>,
                events: &mut EventReader<Self>,
            ) -> Result<(), SystemError> {
                events.subscribe(context.stream(), |_: &mut Self, _: &Poison| {});
                Ok(())
            }

            fn on_tick(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
                Ok(())
            }
        }

        let config = SystemConfig::new("victim").with_cadence(Cadence::Variable);
        let mut runner = ThreadedSystem::with_config(Victim, config);
        let (services, stream) = hubs();
        runner.configure(services, Arc::clone(&stream)).unwrap();
        runner.start().unwrap();
        stream.publish(Poison).unwrap();

        assert!(wait_until(|| !runner.is_worker_alive()));
        let err = runner.stop().unwrap_err();
        assert!(matches!(err, SystemError::WorkerPanicked { .. }));
        assert_eq!(runner.state(), SystemState::Stopped);
        assert_eq!(
            runner.queue().enqueue(|_| {}),
            Err(engine_messaging::MessagingError::QueueClosed)
        );
    }

    #[test]
    fn test_declared_dependencies_merge_into_config() {
        struct Follower;

        impl System for Follower {
            fn name(&self) -> &str {
                "follower"
            }

            fn dependencies(&self) -> &[&str] {
                &["leader"]
            }

            fn on_tick(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
                Ok(())
            }
        }

        let config = SystemConfig::new("follower")
            .with_dependency("input")
            .with_dependency("leader");
        let runner = ThreadedSystem::with_config(Follower, config);
        assert_eq!(runner.dependencies(), ["input", "leader"]);
    }

    #[test]
    fn test_drop_stops_running_worker() {
        let sampler = Sampler::default();
        let calls = Arc::clone(&sampler.calls);
        {
            let mut runner = ThreadedSystem::new(sampler);
            let (services, stream) = hubs();
            runner.configure(services, stream).unwrap();
            runner.start().unwrap();
        }
        assert_eq!(calls.stopped.load(Ordering::SeqCst), 1);
    }
}
