//! The infrastructure handed to a system.
//!
//! A [`SystemContext`] is built once per system by whoever owns the shared
//! hubs (normally the engine) and never changes afterwards. It is the only
//! path by which a system reaches services, the event stream, or its own
//! command queue. [`TickContext`] wraps it for the duration of one hook call
//! on the worker thread and adds the worker-local [`EventBus`].

use std::sync::Arc;
use std::time::Duration;

use engine_messaging::{CommandQueue, Event, EventBus, EventStream, MessagingError, PublishReceipt};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::services::ServiceLocator;

/// Immutable wiring for one system instance.
pub struct SystemContext<S> {
    name: Arc<str>,
    instance_id: Uuid,
    services: Arc<ServiceLocator>,
    stream: Arc<EventStream>,
    queue: Arc<CommandQueue<S>>,
}

impl<S> SystemContext<S> {
    /// Bundle the shared hubs for the system called `name`.
    #[must_use]
    pub fn new(
        name: impl Into<Arc<str>>,
        instance_id: Uuid,
        services: Arc<ServiceLocator>,
        stream: Arc<EventStream>,
        queue: Arc<CommandQueue<S>>,
    ) -> Self {
        Self {
            name: name.into(),
            instance_id,
            services,
            stream,
            queue,
        }
    }

    /// The owning system's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning system's instance id.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// This system's service scope.
    #[must_use]
    pub fn services(&self) -> &Arc<ServiceLocator> {
        &self.services
    }

    /// The engine-wide event stream.
    #[must_use]
    pub fn stream(&self) -> &Arc<EventStream> {
        &self.stream
    }

    /// This system's own command queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<CommandQueue<S>> {
        &self.queue
    }

    /// Shorthand for `self.services().resolve::<T>()`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if `T` was never registered.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ServiceError> {
        self.services.resolve::<T>()
    }
}

impl<S> Clone for SystemContext<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            instance_id: self.instance_id,
            services: Arc::clone(&self.services),
            stream: Arc::clone(&self.stream),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<S> std::fmt::Debug for SystemContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemContext")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id)
            .field("services", &self.services.len())
            .field("queued_commands", &self.queue.len())
            .finish()
    }
}

/// What a system's hooks see on the worker thread.
pub struct TickContext<'a, S> {
    context: &'a SystemContext<S>,
    bus: &'a EventBus,
    tick: u64,
    delta: Duration,
}

impl<'a, S> TickContext<'a, S> {
    pub(crate) fn new(context: &'a SystemContext<S>, bus: &'a EventBus, tick: u64, delta: Duration) -> Self {
        Self {
            context,
            bus,
            tick,
            delta,
        }
    }

    /// The system's immutable context.
    #[must_use]
    pub fn context(&self) -> &'a SystemContext<S> {
        self.context
    }

    /// The worker thread's own same-thread bus.
    #[must_use]
    pub fn bus(&self) -> &'a EventBus {
        self.bus
    }

    /// Tick counter, starting at 1. Zero inside `on_start` and `on_stop`.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Time since the previous tick began.
    #[must_use]
    pub fn delta(&self) -> Duration {
        self.delta
    }

    /// [`delta`](Self::delta) in seconds.
    #[must_use]
    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// Broadcast `event` on the engine-wide stream.
    ///
    /// # Errors
    ///
    /// Propagates [`MessagingError::StreamFull`] from a rejecting subscriber.
    pub fn publish<E: Event>(&self, event: E) -> Result<PublishReceipt, MessagingError> {
        self.context.stream.publish(event)
    }
}

#[cfg(test)]
mod tests {
    use engine_messaging::{FrameBeginEvent, StreamOptions};

    use super::*;
    use crate::services::ServiceRegistry;

    struct Sampler;

    fn context() -> SystemContext<Sampler> {
        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(7u32)).unwrap();
        SystemContext::new(
            "sampler",
            Uuid::new_v4(),
            Arc::new(registry.freeze()),
            Arc::new(EventStream::new()),
            Arc::new(CommandQueue::new()),
        )
    }

    #[test]
    fn test_context_exposes_wiring() {
        let ctx = context();
        assert_eq!(ctx.name(), "sampler");
        assert_eq!(*ctx.resolve::<u32>().unwrap(), 7);
        assert!(ctx.resolve::<u64>().is_err());
        assert!(ctx.queue().is_empty());
    }

    #[test]
    fn test_clone_shares_hubs() {
        let ctx = context();
        let copy = ctx.clone();
        assert!(Arc::ptr_eq(ctx.stream(), copy.stream()));
        assert!(Arc::ptr_eq(ctx.queue(), copy.queue()));
        assert_eq!(ctx.instance_id(), copy.instance_id());
    }

    #[test]
    fn test_tick_context_publishes_on_stream() {
        let ctx = context();
        let subscription = ctx.stream().subscribe::<FrameBeginEvent>(StreamOptions::unbounded());
        let bus = EventBus::new();
        let tick = TickContext::new(&ctx, &bus, 3, Duration::from_millis(16));

        assert_eq!(tick.tick(), 3);
        assert!((tick.delta_seconds() - 0.016).abs() < 1e-6);
        tick.publish(FrameBeginEvent {
            frame_number: 3,
            delta_time: tick.delta_seconds(),
        })
        .unwrap();
        assert_eq!(subscription.drain().len(), 1);
    }
}
