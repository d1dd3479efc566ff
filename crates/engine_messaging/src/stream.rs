//! Asynchronous, cross-thread event delivery.
//!
//! An [`EventStream`] is a shared hub with one channel per event type.
//! Producers on any thread [`publish`](EventStream::publish); every
//! [`Subscription`] owns its own fan-out queue which its consumer drains once
//! per tick. Handlers never run on the publishing thread.
//!
//! ## Ordering
//!
//! Each publish is stamped with a hub-wide sequence number while holding the
//! channel lock, so all subscribers of a channel observe the same order and a
//! drain yields events in strictly increasing sequence order.
//!
//! ## Backpressure
//!
//! Subscriptions are unbounded unless [`StreamOptions::capacity`] is set, in
//! which case [`Backpressure`] decides what happens to a full queue. A
//! consumer must never publish to a `Block` channel it subscribes to itself
//! while its own queue is full: it would wait for a drain only it can perform.

use std::any::{Any, TypeId, type_name};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MessagingError, panic_message};

/// Marker for types that can travel on an [`EventStream`].
///
/// Implemented for every `Clone + Send + 'static` type.
pub trait Event: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Event for T {}

/// What a bounded subscription does when its queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// The publisher waits until the consumer drains.
    #[default]
    Block,
    /// The oldest queued event is discarded to make room.
    DropOldest,
    /// The new event is discarded for this subscriber.
    DropNewest,
    /// The publish fails with [`MessagingError::StreamFull`] and no
    /// subscriber receives the event.
    Reject,
}

/// Per-subscription queue settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Maximum queued events. `None` means unbounded. Zero is treated as one.
    pub capacity: Option<usize>,
    /// Policy applied when `capacity` is reached.
    pub backpressure: Backpressure,
}

impl StreamOptions {
    /// Unbounded queue.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Bounded queue with the given overflow policy.
    #[must_use]
    pub fn bounded(capacity: usize, backpressure: Backpressure) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            backpressure,
        }
    }
}

/// An event together with the sequence number assigned when it was published.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<E> {
    /// Hub-wide publish sequence number.
    pub sequence: u64,
    /// The payload.
    pub event: E,
}

/// What happened to a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Sequence number stamped on the event.
    pub sequence: u64,
    /// Subscribers whose queue accepted the event.
    pub delivered: usize,
    /// Subscribers for which an event was discarded by their policy.
    pub dropped: usize,
}

// ── Internal channel state ──────────────────────────────────────────────────

struct QueueState<E> {
    events: VecDeque<Envelope<E>>,
    closed: bool,
    dropped: u64,
}

struct SubscriberQueue<E> {
    id: u64,
    options: StreamOptions,
    state: Mutex<QueueState<E>>,
    /// Signalled when the consumer frees space (for `Block` publishers).
    space: Condvar,
    /// Signalled when an event arrives (for `recv_timeout`).
    arrived: Condvar,
}

enum Offer {
    Delivered,
    Dropped,
    Closed,
}

impl<E> SubscriberQueue<E> {
    fn is_full(&self, state: &QueueState<E>) -> bool {
        self.options
            .capacity
            .is_some_and(|capacity| state.events.len() >= capacity)
    }

    fn offer(&self, envelope: Envelope<E>) -> Offer {
        let mut state = self.state.lock();
        if state.closed {
            return Offer::Closed;
        }
        let mut outcome = Offer::Delivered;
        if self.is_full(&state) {
            match self.options.backpressure {
                Backpressure::Block => {
                    while !state.closed && self.is_full(&state) {
                        self.space.wait(&mut state);
                    }
                    if state.closed {
                        return Offer::Closed;
                    }
                }
                Backpressure::DropOldest => {
                    state.events.pop_front();
                    state.dropped += 1;
                    outcome = Offer::Dropped;
                }
                // `Reject` is checked for every subscriber before any offer;
                // reaching here means the queue filled concurrently, which
                // cannot happen while the channel lock is held.
                Backpressure::DropNewest | Backpressure::Reject => {
                    state.dropped += 1;
                    return Offer::Dropped;
                }
            }
        }
        state.events.push_back(envelope);
        drop(state);
        self.arrived.notify_one();
        outcome
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.events.clear();
        drop(state);
        self.space.notify_all();
        self.arrived.notify_all();
    }
}

struct Channel<E> {
    /// Held for the whole fan-out of a publish: serialises publishers so
    /// every subscriber sees one order.
    subscribers: Mutex<Vec<Arc<SubscriberQueue<E>>>>,
    next_id: AtomicU64,
}

impl<E> Channel<E> {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|queue| queue.id != id);
    }
}

// ── EventStream ─────────────────────────────────────────────────────────────

/// Multi-producer, multi-consumer event hub. Share it behind an [`Arc`].
pub struct EventStream {
    /// `TypeId::of::<E>()` -> `Arc<Channel<E>>`.
    channels: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    sequence: AtomicU64,
}

impl EventStream {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            sequence: AtomicU64::new(1),
        }
    }

    fn channel<E: Event>(&self) -> Option<Arc<Channel<E>>> {
        let erased = Arc::clone(
            self.channels
                .entry(TypeId::of::<E>())
                .or_insert_with(|| Arc::new(Channel::<E>::new()))
                .value(),
        );
        // Keyed by `TypeId::of::<E>()`, so this always matches.
        erased.downcast::<Channel<E>>().ok()
    }

    fn existing_channel<E: Event>(&self) -> Option<Arc<Channel<E>>> {
        let erased = Arc::clone(self.channels.get(&TypeId::of::<E>())?.value());
        erased.downcast::<Channel<E>>().ok()
    }

    /// Open a new subscription to events of type `E`.
    ///
    /// Only events published after this call are delivered to it.
    #[must_use]
    pub fn subscribe<E: Event>(&self, options: StreamOptions) -> Subscription<E> {
        let options = StreamOptions {
            capacity: options.capacity.map(|capacity| capacity.max(1)),
            ..options
        };
        let Some(channel) = self.channel::<E>() else {
            return Subscription::detached(options);
        };
        let queue = Arc::new(SubscriberQueue {
            id: channel.next_id.fetch_add(1, Ordering::Relaxed),
            options,
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            space: Condvar::new(),
            arrived: Condvar::new(),
        });
        channel.subscribers.lock().push(Arc::clone(&queue));
        Subscription {
            queue,
            channel: Arc::downgrade(&channel),
        }
    }

    /// Append `event` to every subscriber queue of its type. Callable from any
    /// thread; never runs handlers.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::StreamFull`] if a `Reject` subscriber is at
    /// capacity. In that case no subscriber receives the event.
    pub fn publish<E: Event>(&self, event: E) -> Result<PublishReceipt, MessagingError> {
        let Some(channel) = self.existing_channel::<E>() else {
            return Ok(PublishReceipt {
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                ..PublishReceipt::default()
            });
        };

        let subscribers = channel.subscribers.lock();
        for queue in subscribers.iter() {
            if queue.options.backpressure == Backpressure::Reject {
                let state = queue.state.lock();
                if !state.closed && queue.is_full(&state) {
                    debug!(
                        event = type_name::<E>(),
                        subscriber = queue.id,
                        "publish rejected by full subscriber"
                    );
                    return Err(MessagingError::StreamFull {
                        event: type_name::<E>(),
                        capacity: queue.options.capacity.unwrap_or_default(),
                    });
                }
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut receipt = PublishReceipt {
            sequence,
            ..PublishReceipt::default()
        };
        for queue in subscribers.iter() {
            let envelope = Envelope {
                sequence,
                event: event.clone(),
            };
            match queue.offer(envelope) {
                Offer::Delivered => receipt.delivered += 1,
                Offer::Dropped => {
                    receipt.dropped += 1;
                    // DropOldest still delivered the new event.
                    if queue.options.backpressure == Backpressure::DropOldest {
                        receipt.delivered += 1;
                    }
                }
                Offer::Closed => {}
            }
        }
        if receipt.dropped > 0 {
            debug!(
                event = type_name::<E>(),
                sequence,
                dropped = receipt.dropped,
                "backpressure discarded events"
            );
        }
        Ok(receipt)
    }

    /// Number of live subscriptions for `E`.
    #[must_use]
    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.existing_channel::<E>()
            .map_or(0, |channel| channel.subscribers.lock().len())
    }

    /// Number of event types that have ever been subscribed to.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("channels", &self.channels.len())
            .field("next_sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}

// ── Subscription ────────────────────────────────────────────────────────────

/// The receiving end of one subscriber's queue.
///
/// Owned by a single consumer. Dropping it unsubscribes.
pub struct Subscription<E: Event> {
    queue: Arc<SubscriberQueue<E>>,
    channel: Weak<Channel<E>>,
}

impl<E: Event> Subscription<E> {
    fn detached(options: StreamOptions) -> Self {
        Self {
            queue: Arc::new(SubscriberQueue {
                id: 0,
                options,
                state: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    closed: true,
                    dropped: 0,
                }),
                space: Condvar::new(),
                arrived: Condvar::new(),
            }),
            channel: Weak::new(),
        }
    }

    /// Swap out the whole backlog, in arrival order.
    #[must_use]
    pub fn drain(&self) -> Vec<E> {
        self.drain_envelopes()
            .into_iter()
            .map(|envelope| envelope.event)
            .collect()
    }

    /// Like [`Subscription::drain`], keeping sequence numbers.
    #[must_use]
    pub fn drain_envelopes(&self) -> Vec<Envelope<E>> {
        let backlog = std::mem::take(&mut self.queue.state.lock().events);
        if !backlog.is_empty() {
            self.queue.space.notify_all();
        }
        backlog.into()
    }

    /// Pop the oldest queued event, if any.
    #[must_use]
    pub fn try_pop(&self) -> Option<E> {
        let event = self.queue.state.lock().events.pop_front()?;
        self.queue.space.notify_all();
        Some(event.event)
    }

    /// Wait up to `timeout` for an event.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<E> {
        let mut state = self.queue.state.lock();
        if state.events.is_empty() && !state.closed {
            let _ = self.queue.arrived.wait_for(&mut state, timeout);
        }
        let event = state.events.pop_front()?;
        drop(state);
        self.queue.space.notify_all();
        Some(event.event)
    }

    /// Queued events not yet drained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.state.lock().events.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded by this subscription's backpressure policy so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    /// Whether the subscription still receives events.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.queue.state.lock().closed
    }

    /// The options this subscription was opened with.
    #[must_use]
    pub fn options(&self) -> StreamOptions {
        self.queue.options
    }

    /// Unsubscribe, discarding anything still queued.
    pub fn close(self) {
        drop(self);
    }
}

impl<E: Event> Drop for Subscription<E> {
    fn drop(&mut self) {
        // Close first so a blocked publisher lets go of the channel lock.
        self.queue.close();
        if let Some(channel) = self.channel.upgrade() {
            channel.unsubscribe(self.queue.id);
        }
    }
}

impl<E: Event> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &type_name::<E>())
            .field("id", &self.queue.id)
            .field("queued", &self.len())
            .finish()
    }
}

// ── EventReader ─────────────────────────────────────────────────────────────

/// An event handler that panicked during a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Type name of the event being handled.
    pub event: &'static str,
    /// The panic payload, rendered as text.
    pub message: String,
}

/// Summary of an [`EventReader`] drain.
#[derive(Debug, Default)]
pub struct DrainStats {
    /// Handler invocations that completed.
    pub delivered: usize,
    /// Handler invocations that panicked. Delivery continued after each.
    pub failures: Vec<HandlerFailure>,
}

trait Slot<T>: Send {
    fn event_type(&self) -> TypeId;
    fn drain_into(&mut self, target: &mut T, stats: &mut DrainStats);
}

struct HandlerSlot<E: Event, F> {
    subscription: Subscription<E>,
    handler: F,
}

impl<T, E, F> Slot<T> for HandlerSlot<E, F>
where
    E: Event,
    F: FnMut(&mut T, &E) + Send,
{
    fn event_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn drain_into(&mut self, target: &mut T, stats: &mut DrainStats) {
        for event in self.subscription.drain() {
            let handler = &mut self.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&mut *target, &event))) {
                Ok(()) => stats.delivered += 1,
                Err(payload) => stats.failures.push(HandlerFailure {
                    event: type_name::<E>(),
                    message: panic_message(payload.as_ref()),
                }),
            }
        }
    }
}

/// A consumer's set of subscriptions, each paired with a handler that gets
/// exclusive access to the consumer's state `T` when drained.
///
/// Build it before the consumer thread starts, then move it onto that thread
/// and call [`EventReader::drain_all`] once per tick.
pub struct EventReader<T> {
    slots: Vec<Box<dyn Slot<T>>>,
}

impl<T> EventReader<T> {
    /// Create a reader with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Subscribe to `E` on `stream` with an unbounded queue.
    pub fn subscribe<E, F>(&mut self, stream: &EventStream, handler: F)
    where
        E: Event,
        F: FnMut(&mut T, &E) + Send + 'static,
    {
        self.subscribe_with(stream, StreamOptions::unbounded(), handler);
    }

    /// Subscribe to `E` on `stream` with explicit queue options.
    pub fn subscribe_with<E, F>(&mut self, stream: &EventStream, options: StreamOptions, handler: F)
    where
        E: Event,
        F: FnMut(&mut T, &E) + Send + 'static,
    {
        self.slots.push(Box::new(HandlerSlot {
            subscription: stream.subscribe::<E>(options),
            handler,
        }));
    }

    /// Deliver the backlog of every subscription, in subscription order;
    /// within a subscription, in arrival order.
    pub fn drain_all(&mut self, target: &mut T) -> DrainStats {
        let mut stats = DrainStats::default();
        for slot in &mut self.slots {
            slot.drain_into(target, &mut stats);
        }
        stats
    }

    /// Deliver only the backlog of subscriptions to `E`.
    pub fn drain<E: Event>(&mut self, target: &mut T) -> DrainStats {
        let mut stats = DrainStats::default();
        for slot in &mut self.slots {
            if slot.event_type() == TypeId::of::<E>() {
                slot.drain_into(target, &mut stats);
            }
        }
        stats
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the reader has no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T> Default for EventReader<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReader")
            .field("subscriptions", &self.slots.len())
            .finish()
    }
}
