//! The engine: owns the shared hubs and every system's lifecycle.
//!
//! ## Lifecycle
//!
//! 1. **Build**: register services and add systems. Each system's command
//!    queue is also registered as a named service under the system's name.
//! 2. **Start**: the service registry is frozen and the start order is
//!    resolved from system dependencies. Every system is configured with its
//!    own service scope, and only if all of them configured successfully are
//!    their worker threads started, in that order.
//! 3. **Frames**: [`Engine::run_frame`] broadcasts frame events, collects
//!    fault reports from the systems, and stops systems whose worker has
//!    failed.
//! 4. **Shutdown**: [`EngineShutdownEvent`] is broadcast and systems are
//!    stopped in reverse start order.
//!
//! The engine holds a same-thread [`EventBus`], so it stays on the thread
//! that created it.

use std::sync::Arc;

use engine_messaging::{
    CommandQueue, CommandReply, EngineShutdownEvent, EventBus, EventStream, FaultSource, FrameBeginEvent,
    FrameEndEvent, MessagingError, Severity, SystemFaultEvent,
};
use engine_system::{
    ServiceError, ServiceLifetime, ServiceLocator, ServiceRegistry, System, SystemError, SystemState, SystemStats,
    ThreadedSystem,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::frame::{FrameClock, FrameTiming};
use crate::registry::SystemRegistry;

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting services and systems.
    Building,
    /// Systems started; frames may run.
    Running,
    /// Shut down, or failed to start. Terminal.
    Stopped,
}

/// What happened during one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    /// The frame's number, starting at 1.
    pub frame_number: u64,
    /// Fault reports collected during the frame.
    pub faults: Vec<SystemFaultEvent>,
    /// Systems stopped this frame because of a fatal fault or a dead worker.
    pub stopped: Vec<String>,
}

/// A typed handle to one system's command queue.
pub struct SystemHandle<S> {
    name: Arc<str>,
    instance_id: Uuid,
    queue: Arc<CommandQueue<S>>,
}

impl<S> SystemHandle<S> {
    /// The system's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The system's instance id.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The system's command queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<CommandQueue<S>> {
        &self.queue
    }

    /// Run `command` on the system's worker thread.
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::enqueue`].
    pub fn enqueue<F>(&self, command: F) -> Result<(), MessagingError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.queue.enqueue(command)
    }

    /// Run `command` on the system's worker thread and get its result back.
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::call`].
    pub fn call<R, F>(&self, command: F) -> Result<CommandReply<R>, MessagingError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        self.queue.call(command)
    }
}

impl<S> Clone for SystemHandle<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            instance_id: self.instance_id,
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<S> std::fmt::Debug for SystemHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemHandle")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// Orchestrates systems and owns the hubs they share.
pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    /// `Some` until `start` freezes it.
    registry: Option<ServiceRegistry>,
    services: Arc<ServiceLocator>,
    stream: Arc<EventStream>,
    bus: EventBus,
    systems: SystemRegistry,
    /// Registry indices in start order. Set by `start`.
    order: Vec<usize>,
    clock: FrameClock,
}

impl Engine {
    /// Create an engine in the build phase.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let stream = Arc::new(EventStream::new());
        let clock = FrameClock::new(config.frame_rate);
        Self {
            config,
            state: EngineState::Building,
            registry: Some(ServiceRegistry::new()),
            services: Arc::new(ServiceLocator::default()),
            stream,
            bus: EventBus::new(),
            systems: SystemRegistry::new(),
            order: Vec::new(),
            clock,
        }
    }

    /// The engine's config.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The engine-wide event stream.
    #[must_use]
    pub fn stream(&self) -> &Arc<EventStream> {
        &self.stream
    }

    /// The frozen services. Empty until `start`.
    #[must_use]
    pub fn services(&self) -> &Arc<ServiceLocator> {
        &self.services
    }

    /// The engine thread's own bus. Fault reports are republished here.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The frame clock.
    #[must_use]
    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    fn registry_mut(&mut self) -> Result<&mut ServiceRegistry, EngineError> {
        self.registry.as_mut().ok_or(EngineError::AlreadyStarted)
    }

    /// Register a service under its type.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyStarted`] after `start`, or a
    /// duplicate-registration error.
    pub fn register_service<T: Send + Sync + 'static>(&mut self, instance: Arc<T>) -> Result<(), EngineError> {
        self.registry_mut()?.register(instance)?;
        Ok(())
    }

    /// Register a service under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyStarted`] after `start`, or a
    /// duplicate-registration error.
    pub fn register_named_service<T: Send + Sync + 'static>(
        &mut self,
        name: impl Into<String>,
        instance: Arc<T>,
    ) -> Result<(), EngineError> {
        self.registry_mut()?.register_named(name, instance)?;
        Ok(())
    }

    /// Register a service factory under its type. Scoped services are built
    /// once per system.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyStarted`] after `start`, or a
    /// duplicate-registration error.
    pub fn register_service_factory<T, F>(&mut self, lifetime: ServiceLifetime, factory: F) -> Result<(), EngineError>
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceLocator) -> Result<Arc<T>, ServiceError> + Send + Sync + 'static,
    {
        self.registry_mut()?.register_factory(lifetime, factory)?;
        Ok(())
    }

    /// Add a system. Its config comes from the engine config's overrides for
    /// its name. Its command queue is registered as a service under that
    /// name, so other systems can resolve it as `CommandQueue<S>`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyStarted`] after `start`, or
    /// [`EngineError::DuplicateSystem`] if the name is taken.
    pub fn add_system<S: System>(&mut self, system: S) -> Result<SystemHandle<S>, EngineError> {
        if self.state != EngineState::Building {
            return Err(EngineError::AlreadyStarted);
        }
        let name = system.name().to_string();
        if self.systems.contains(&name) {
            return Err(EngineError::DuplicateSystem { name });
        }

        let config = self.config.system_config(&name);
        let runner = ThreadedSystem::with_config(system, config);
        let handle = SystemHandle {
            name: Arc::from(name.as_str()),
            instance_id: runner.instance_id(),
            queue: Arc::clone(runner.queue()),
        };
        self.registry_mut()?
            .register_named(name.as_str(), Arc::clone(&handle.queue))?;
        self.systems.insert(Box::new(runner))?;

        debug!(system = name, instance_id = %handle.instance_id, "system added");
        Ok(handle)
    }

    /// Register a handler for fault reports, run on the engine thread during
    /// [`Engine::run_frame`].
    ///
    /// # Errors
    ///
    /// Fails if called from inside a bus handler.
    pub fn on_fault<F>(&self, handler: F) -> Result<(), EngineError>
    where
        F: FnMut(&SystemFaultEvent) + 'static,
    {
        self.bus.subscribe(handler)?;
        Ok(())
    }

    /// Freeze services, resolve the start order, configure every system,
    /// then start them in that order.
    ///
    /// If the dependencies are unsatisfiable or any system fails to
    /// configure, no thread is spawned. If one fails to start, the ones
    /// already started are stopped again. Either way the engine ends up
    /// [`EngineState::Stopped`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyStarted`] unless building,
    /// [`EngineError::MissingDependency`] or [`EngineError::DependencyCycle`],
    /// or the first configure or start error.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Building {
            return Err(EngineError::AlreadyStarted);
        }
        let registry = self.registry.take().ok_or(EngineError::AlreadyStarted)?;
        self.services = Arc::new(registry.freeze());

        self.order = match self.systems.start_order() {
            Ok(order) => order,
            Err(err) => {
                error!(error = %err, "unsatisfiable system dependencies, aborting startup");
                self.state = EngineState::Stopped;
                return Err(err);
            }
        };

        for &index in &self.order {
            let Some(system) = self.systems.get_index_mut(index) else {
                continue;
            };
            if let Err(err) = system.configure(Arc::clone(&self.services), Arc::clone(&self.stream)) {
                error!(system = system.name(), error = %err, "configuration failed, aborting startup");
                self.state = EngineState::Stopped;
                return Err(err.into());
            }
        }

        let mut failure = None;
        for &index in &self.order {
            let Some(system) = self.systems.get_index_mut(index) else {
                continue;
            };
            if let Err(err) = system.start() {
                error!(system = system.name(), error = %err, "start failed, rolling back");
                failure = Some(err);
                break;
            }
        }
        if let Some(err) = failure {
            for &index in self.order.iter().rev() {
                if let Some(system) = self.systems.get_index_mut(index)
                    && system.state() == SystemState::Running
                    && let Err(stop_err) = system.stop()
                {
                    warn!(system = system.name(), error = %stop_err, "rollback stop failed");
                }
            }
            self.state = EngineState::Stopped;
            return Err(err.into());
        }

        self.state = EngineState::Running;
        info!(
            systems = self.systems.len(),
            services = self.services.len(),
            frame_rate = self.clock.frame_rate(),
            "engine started"
        );
        Ok(())
    }

    /// Run one frame: broadcast [`FrameBeginEvent`], handle fault reports,
    /// broadcast [`FrameEndEvent`].
    ///
    /// Every fault is republished on the engine's [`EventBus`]. A system that
    /// reported a fatal fault, or whose worker died, is stopped. A frame
    /// event refused by a full subscriber is logged and the frame goes on.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] unless running.
    pub fn run_frame(&mut self) -> Result<FrameReport, EngineError> {
        if self.state != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        let timing = self.clock.begin();
        Ok(self.frame(&timing))
    }

    fn frame(&mut self, timing: &FrameTiming) -> FrameReport {
        let begin = FrameBeginEvent {
            frame_number: timing.frame_number,
            delta_time: timing.delta.as_secs_f32(),
        };
        if let Err(err) = self.stream.publish(begin) {
            warn!(frame = timing.frame_number, error = %err, "frame begin not delivered");
        }

        let mut report = FrameReport {
            frame_number: timing.frame_number,
            ..FrameReport::default()
        };
        self.handle_faults(&mut report);

        let end = FrameEndEvent {
            frame_number: timing.frame_number,
            frame_time: timing.began.elapsed().as_secs_f32(),
        };
        if let Err(err) = self.stream.publish(end) {
            warn!(frame = timing.frame_number, error = %err, "frame end not delivered");
        }
        self.clock.finish(timing);
        report
    }

    /// Collect every system's fault log, then stop each running system that
    /// faulted or whose worker is gone.
    fn handle_faults(&mut self, report: &mut FrameReport) {
        let bus = &self.bus;
        let stream = &self.stream;
        for system in self.systems.iter_mut() {
            for fault in system.take_faults() {
                dispatch_fault(bus, fault, report);
            }

            let failed = system.faulted() || !system.is_worker_alive();
            if system.state() != SystemState::Running || !failed {
                continue;
            }
            let name = system.name().to_string();
            match system.stop() {
                Ok(()) => {}
                Err(SystemError::WorkerPanicked { message, .. }) => {
                    let fault = SystemFaultEvent {
                        system: name.clone(),
                        instance_id: system.instance_id().to_string(),
                        source: FaultSource::Worker,
                        severity: Severity::Fatal,
                        message,
                    };
                    if let Err(err) = stream.publish(fault.clone()) {
                        debug!(system = name, error = %err, "fault not published on stream");
                    }
                    dispatch_fault(bus, fault, report);
                }
                Err(err) => error!(system = name, error = %err, "stopping failed system failed"),
            }
            // Reported while stopping, e.g. by `on_stop`.
            for fault in system.take_faults() {
                dispatch_fault(bus, fault, report);
            }
            report.stopped.push(name);
        }
    }

    /// Run `frames` frames on the calling thread, sleeping out each frame's
    /// budget. Stops early once no system is running.
    ///
    /// # Errors
    ///
    /// As [`Engine::run_frame`].
    pub fn run_for(&mut self, frames: u64) -> Result<u64, EngineError> {
        if self.state != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        let mut completed = 0;
        while completed < frames {
            let timing = self.clock.begin();
            self.frame(&timing);
            completed += 1;
            if self.running_systems() == 0 && !self.systems.is_empty() {
                warn!(frames = completed, "no systems left running");
                break;
            }
            self.clock.sleep_remaining(&timing);
        }
        Ok(completed)
    }

    /// Number of systems whose worker is running.
    #[must_use]
    pub fn running_systems(&self) -> usize {
        self.systems.count_in(SystemState::Running)
    }

    /// Lifecycle state of the system called `name`.
    #[must_use]
    pub fn system_state(&self, name: &str) -> Option<SystemState> {
        self.systems.get(name).map(|system| system.state())
    }

    /// Worker counters of the system called `name`.
    #[must_use]
    pub fn system_stats(&self, name: &str) -> Option<SystemStats> {
        self.systems.get(name).map(|system| system.stats())
    }

    /// Names of all systems, in registration order.
    pub fn system_names(&self) -> impl Iterator<Item = &str> {
        self.systems.iter().map(|system| system.name())
    }

    /// Broadcast [`EngineShutdownEvent`] and stop every system in reverse
    /// start order. Does nothing unless running.
    ///
    /// # Errors
    ///
    /// Returns the first stop error; every system is still stopped.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Running {
            return Ok(());
        }
        info!(frames = self.clock.frame_number(), "engine shutting down");
        if let Err(err) = self.stream.publish(EngineShutdownEvent) {
            warn!(error = %err, "shutdown event not delivered");
        }

        let mut first_error = None;
        for &index in self.order.iter().rev() {
            let Some(system) = self.systems.get_index_mut(index) else {
                continue;
            };
            if let Err(err) = system.stop() {
                error!(system = system.name(), error = %err, "stop failed");
                first_error.get_or_insert(err);
            }
        }
        self.state = EngineState::Stopped;

        // Faults raised while stopping still reach the handlers.
        let mut report = FrameReport::default();
        self.handle_faults(&mut report);

        info!("engine shut down");
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

fn dispatch_fault(bus: &EventBus, fault: SystemFaultEvent, report: &mut FrameReport) {
    if fault.is_fatal() {
        error!(
            system = fault.system,
            source = ?fault.source,
            reason = %fault.message,
            "fatal system fault"
        );
    } else {
        warn!(
            system = fault.system,
            source = ?fault.source,
            reason = %fault.message,
            "system fault"
        );
    }
    if let Err(err) = bus.publish(&fault) {
        warn!(error = %err, "fault handlers not run");
    }
    report.faults.push(fault);
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("systems", &self.systems)
            .field("frame", &self.clock.frame_number())
            .finish_non_exhaustive()
    }
}
