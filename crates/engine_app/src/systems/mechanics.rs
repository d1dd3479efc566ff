//! Simulation-time stub.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use engine_messaging::{EngineShutdownEvent, EventReader, FrameBeginEvent};
use engine_system::{System, SystemContext, SystemError, TickContext, TickError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Broadcast by [`MechanicsSystem`] after every simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MechanicsStepEvent {
    /// Step counter, starting at 1.
    pub step: u64,
    /// Simulated seconds elapsed so far.
    pub simulated_time: f64,
}

/// Advances simulated time at its own cadence, independent of the frame rate.
#[derive(Debug)]
pub struct MechanicsSystem {
    time_scale: f64,
    paused: bool,
    steps: u64,
    simulated_time: f64,
    last_frame: u64,
    shutdown_requested: bool,
    /// Steps announced on the worker's local bus.
    announced: Arc<AtomicU64>,
}

impl MechanicsSystem {
    /// Create a running, real-time mechanics system.
    #[must_use]
    pub fn new() -> Self {
        Self {
            time_scale: 1.0,
            paused: false,
            steps: 0,
            simulated_time: 0.0,
            last_frame: 0,
            shutdown_requested: false,
            announced: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Scale simulated time relative to wall time. Negative values clamp to 0.
    pub fn set_time_scale(&mut self, scale: f64) {
        self.time_scale = scale.max(0.0);
    }

    /// Stop or resume advancing time.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Whether time is frozen.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Steps taken so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Simulated seconds elapsed.
    #[must_use]
    pub fn simulated_time(&self) -> f64 {
        self.simulated_time
    }

    /// Most recent engine frame seen.
    #[must_use]
    pub fn last_frame(&self) -> u64 {
        self.last_frame
    }

    /// Whether an [`EngineShutdownEvent`] has been delivered.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Steps announced on the worker-local bus.
    #[must_use]
    pub fn announced_steps(&self) -> u64 {
        self.announced.load(Ordering::Relaxed)
    }
}

impl Default for MechanicsSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl System for MechanicsSystem {
    fn name(&self) -> &str {
        "mechanics"
    }

    fn configure(
        &mut self,
        context: &SystemContext<Self>,
        events: &mut EventReader<Self>,
    ) -> Result<(), SystemError> {
        events.subscribe(context.stream(), |mechanics: &mut Self, frame: &FrameBeginEvent| {
            mechanics.last_frame = frame.frame_number;
        });
        events.subscribe(context.stream(), |mechanics: &mut Self, _: &EngineShutdownEvent| {
            mechanics.shutdown_requested = true;
        });
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
        let announced = Arc::clone(&self.announced);
        ctx.bus().subscribe(move |step: &MechanicsStepEvent| {
            announced.store(step.step, Ordering::Relaxed);
            trace!(step = step.step, "step announced");
        })?;
        debug!(time_scale = self.time_scale, "mechanics started");
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
        if self.paused {
            return Ok(());
        }
        self.steps += 1;
        self.simulated_time += ctx.delta().as_secs_f64() * self.time_scale;

        let step = MechanicsStepEvent {
            step: self.steps,
            simulated_time: self.simulated_time,
        };
        ctx.bus().publish(&step)?;
        ctx.publish(step)?;
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut TickContext<'_, Self>) {
        debug!(
            steps = self.steps,
            simulated_time = self.simulated_time,
            "mechanics stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use engine_messaging::{EventStream, StreamOptions};
    use engine_system::{Cadence, ServiceRegistry, SystemConfig, ThreadedSystem};

    use super::*;

    fn runner() -> (ThreadedSystem<MechanicsSystem>, Arc<EventStream>) {
        let stream = Arc::new(EventStream::new());
        let config = SystemConfig::new("mechanics").with_cadence(Cadence::fixed(1000.0));
        let mut runner = ThreadedSystem::with_config(MechanicsSystem::new(), config);
        runner
            .configure(Arc::new(ServiceRegistry::new().freeze()), Arc::clone(&stream))
            .unwrap();
        (runner, stream)
    }

    #[test]
    fn test_steps_advance_and_are_broadcast() {
        let (mut runner, stream) = runner();
        let steps = stream.subscribe::<MechanicsStepEvent>(StreamOptions::unbounded());
        runner.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while steps.len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        runner.stop().unwrap();

        let mechanics = runner.into_inner().unwrap();
        let received = steps.drain();
        assert!(received.len() >= 3);
        assert_eq!(received.len() as u64, mechanics.steps());
        assert!(received.windows(2).all(|pair| pair[0].step + 1 == pair[1].step));
        assert_eq!(mechanics.announced_steps(), mechanics.steps());
    }

    #[test]
    fn test_paused_does_not_advance() {
        let (mut runner, _stream) = runner();
        runner.system_mut().unwrap().set_paused(true);
        runner.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        runner.stop().unwrap();

        let mechanics = runner.system().unwrap();
        assert!(mechanics.is_paused());
        assert_eq!(mechanics.steps(), 0);
        assert!(mechanics.simulated_time().abs() < f64::EPSILON);
    }

    #[test]
    fn test_commands_adjust_time_scale() {
        let (mut runner, _stream) = runner();
        runner.start().unwrap();
        runner
            .queue()
            .enqueue(|mechanics| mechanics.set_time_scale(-2.0))
            .unwrap();
        let scale = runner
            .queue()
            .call(|mechanics| mechanics.time_scale)
            .unwrap()
            .blocking_recv()
            .unwrap();
        runner.stop().unwrap();
        assert!(scale.abs() < f64::EPSILON);
    }
}
