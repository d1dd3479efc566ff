//! Synchronous, same-thread publish/subscribe.
//!
//! An [`EventBus`] dispatches each published event to every handler
//! registered for its type, on the calling thread, before `publish` returns.
//! Handlers are not `Send`, which makes the bus itself `!Send`: the compiler
//! keeps a bus on the thread that created it.
//!
//! Publishing or subscribing from inside a handler on the same bus is
//! rejected with [`MessagingError::ReentrantPublish`] rather than recursing.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::error::MessagingError;

type Handler<E> = Box<dyn FnMut(&E)>;

/// Single-thread event registry keyed by event type.
#[derive(Default)]
pub struct EventBus {
    /// `TypeId::of::<E>()` -> `Vec<Handler<E>>`, in registration order.
    handlers: RefCell<HashMap<TypeId, Box<dyn Any>>>,
    /// Type name of the event currently being dispatched, if any.
    dispatching: Cell<Option<&'static str>>,
}

/// Clears the dispatch marker when a publish finishes, even by unwinding.
struct DispatchGuard<'a>(&'a Cell<Option<&'static str>>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(None);
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of type `E`. Handlers for the same type
    /// run in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ReentrantPublish`] when called from inside a
    /// handler of this bus.
    pub fn subscribe<E, F>(&self, handler: F) -> Result<(), MessagingError>
    where
        E: 'static,
        F: FnMut(&E) + 'static,
    {
        if let Some(event) = self.dispatching.get() {
            return Err(MessagingError::ReentrantPublish { event });
        }
        let mut handlers = self.handlers.borrow_mut();
        let entry = handlers
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<Handler<E>>::new()));
        if let Some(list) = entry.downcast_mut::<Vec<Handler<E>>>() {
            list.push(Box::new(handler));
        }
        Ok(())
    }

    /// Invoke every handler registered for `E`, synchronously, in
    /// registration order. Returns the number of handlers invoked.
    ///
    /// A panicking handler unwinds out of `publish`; the bus stays usable.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ReentrantPublish`] when called from inside a
    /// handler of this bus.
    pub fn publish<E: 'static>(&self, event: &E) -> Result<usize, MessagingError> {
        if let Some(active) = self.dispatching.get() {
            return Err(MessagingError::ReentrantPublish { event: active });
        }
        self.dispatching.set(Some(std::any::type_name::<E>()));
        let _guard = DispatchGuard(&self.dispatching);

        let mut handlers = self.handlers.borrow_mut();
        let Some(list) = handlers
            .get_mut(&TypeId::of::<E>())
            .and_then(|entry| entry.downcast_mut::<Vec<Handler<E>>>())
        else {
            return Ok(0);
        };
        for handler in list.iter_mut() {
            handler(event);
        }
        Ok(list.len())
    }

    /// Number of handlers registered for `E`.
    ///
    /// Reports zero while the bus is dispatching.
    #[must_use]
    pub fn subscriber_count<E: 'static>(&self) -> usize {
        self.handlers.try_borrow().map_or(0, |handlers| {
            handlers
                .get(&TypeId::of::<E>())
                .and_then(|entry| entry.downcast_ref::<Vec<Handler<E>>>())
                .map_or(0, Vec::len)
        })
    }

    /// Whether a publish is in progress on this bus.
    #[must_use]
    pub fn is_dispatching(&self) -> bool {
        self.dispatching.get().is_some()
    }

    /// Remove every handler.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ReentrantPublish`] when called from inside a
    /// handler of this bus.
    pub fn clear(&self) -> Result<(), MessagingError> {
        if let Some(event) = self.dispatching.get() {
            return Err(MessagingError::ReentrantPublish { event });
        }
        self.handlers.borrow_mut().clear();
        Ok(())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.handlers.try_borrow().map_or(0, |h| h.len()))
            .field("dispatching", &self.dispatching.get())
            .finish()
    }
}
