//! Messaging-layer error types.

/// Errors raised by command queues, the event bus and event streams.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    /// A bounded command queue is at capacity. The command was not enqueued.
    #[error("command queue is full (capacity {capacity})")]
    QueueFull {
        /// The configured queue capacity.
        capacity: usize,
    },

    /// The command queue has been closed by its consumer.
    #[error("command queue is closed")]
    QueueClosed,

    /// A subscriber using [`Backpressure::Reject`](crate::stream::Backpressure::Reject)
    /// has no room for the event. No subscriber received it.
    #[error("event stream for `{event}` is full (capacity {capacity})")]
    StreamFull {
        /// Type name of the rejected event.
        event: &'static str,
        /// Capacity of the first full subscriber queue.
        capacity: usize,
    },

    /// A handler tried to publish or subscribe on the bus that is currently
    /// dispatching to it.
    #[error("re-entrant use of event bus while publishing `{event}`")]
    ReentrantPublish {
        /// Type name of the event being dispatched when the violation occurred.
        event: &'static str,
    },

    /// The consumer dropped the command before producing a reply.
    #[error("command reply was dropped before completion")]
    ReplyDropped,
}

/// A single command failed while executing on its consumer thread.
///
/// The queue that produced it is unaffected; execution continues with the
/// next command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command panicked: {message}")]
pub struct CommandError {
    /// The panic payload, rendered as text when possible.
    pub message: String,
}

impl CommandError {
    /// Build a [`CommandError`] from a `catch_unwind` payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        Self {
            message: panic_message(payload),
        }
    }
}

/// Render a panic payload as text.
///
/// `panic!` with a literal yields `&str`, formatted panics yield `String`.
/// Anything else is reported opaquely.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
