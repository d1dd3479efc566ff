//! Thread-safe command queue.
//!
//! A [`CommandQueue`] marshals work onto the thread that owns some state. Any
//! number of producers may [`enqueue`](CommandQueue::enqueue) concurrently;
//! exactly one consumer (the owning system's worker thread) executes the
//! commands, in FIFO order, handing each one exclusive `&mut T` access to the
//! state it owns.
//!
//! ```rust
//! use engine_messaging::{CommandQueue, Execution};
//!
//! let queue = CommandQueue::<u32>::new();
//! queue.enqueue(|counter| *counter += 1).unwrap();
//!
//! let mut counter = 0;
//! assert_eq!(queue.try_execute(&mut counter).unwrap(), Execution::Ran);
//! assert_eq!(counter, 1);
//! assert_eq!(queue.try_execute(&mut counter).unwrap(), Execution::Empty);
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CommandError, MessagingError};

/// A deferred unit of work, run once on the consumer thread with exclusive
/// access to the consumer's state.
pub type Command<T> = Box<dyn FnOnce(&mut T) + Send + 'static>;

/// Outcome of a successful [`CommandQueue::try_execute`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// One command was popped and ran to completion.
    Ran,
    /// The queue was empty; nothing ran.
    Empty,
}

/// Summary of a bounded [`CommandQueue::drain`].
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Commands that ran to completion.
    pub executed: usize,
    /// Commands that panicked. Each was contained and skipped.
    pub failed: Vec<CommandError>,
}

impl DrainReport {
    /// Total commands popped from the queue, successful or not.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.executed + self.failed.len()
    }
}

struct Pending<T> {
    commands: VecDeque<Command<T>>,
    closed: bool,
}

/// Multi-producer, single-consumer FIFO of [`Command`]s.
///
/// Producers only ever hold the internal lock long enough to push; commands
/// run with the lock released, so a slow command never blocks producers.
pub struct CommandQueue<T = ()> {
    pending: Mutex<Pending<T>>,
    capacity: Option<usize>,
}

impl<T> CommandQueue<T> {
    /// Create an unbounded queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                commands: VecDeque::new(),
                closed: false,
            }),
            capacity: None,
        }
    }

    /// Create a queue holding at most `capacity` pending commands.
    ///
    /// A capacity of zero is treated as one. Storage grows on demand; the
    /// capacity is only a limit.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Pending {
                commands: VecDeque::new(),
                closed: false,
            }),
            capacity: Some(capacity.max(1)),
        }
    }

    /// The configured capacity, if bounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Append a command to the tail of the queue. Callable from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::QueueFull`] if the queue is bounded and at
    /// capacity, or [`MessagingError::QueueClosed`] once the consumer has
    /// closed it. The command is dropped in both cases.
    pub fn enqueue<F>(&self, command: F) -> Result<(), MessagingError>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.push(Box::new(command))
    }

    /// Append an already boxed command.
    ///
    /// # Errors
    ///
    /// Same as [`CommandQueue::enqueue`].
    pub fn push(&self, command: Command<T>) -> Result<(), MessagingError> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(MessagingError::QueueClosed);
        }
        if let Some(capacity) = self.capacity
            && pending.commands.len() >= capacity
        {
            return Err(MessagingError::QueueFull { capacity });
        }
        pending.commands.push_back(command);
        Ok(())
    }

    /// Enqueue a command whose return value is sent back to the caller.
    ///
    /// The returned [`CommandReply`] can be awaited or, from a plain thread,
    /// waited on with [`CommandReply::blocking_recv`].
    ///
    /// # Errors
    ///
    /// Same as [`CommandQueue::enqueue`].
    pub fn call<R, F>(&self, command: F) -> Result<CommandReply<R>, MessagingError>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(move |target| {
            // The caller may have stopped waiting; that is not an error here.
            let _ = tx.send(command(target));
        })?;
        Ok(CommandReply { rx })
    }

    /// Pop and run exactly one command, if any. Consumer thread only.
    ///
    /// Never blocks waiting for work.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the popped command panicked. The panic is
    /// contained and the queue remains usable.
    pub fn try_execute(&self, target: &mut T) -> Result<Execution, CommandError> {
        // Pop under the lock, run without it.
        let Some(command) = self.pending.lock().commands.pop_front() else {
            return Ok(Execution::Empty);
        };
        panic::catch_unwind(AssertUnwindSafe(|| command(target)))
            .map(|_| Execution::Ran)
            .map_err(|payload| CommandError::from_panic(payload.as_ref()))
    }

    /// Run up to `max` commands, containing failures.
    ///
    /// Bounding the drain keeps a producer backlog from starving the
    /// consumer's own cadence.
    pub fn drain(&self, target: &mut T, max: usize) -> DrainReport {
        let mut report = DrainReport::default();
        while report.attempted() < max {
            match self.try_execute(target) {
                Ok(Execution::Ran) => report.executed += 1,
                Ok(Execution::Empty) => break,
                Err(err) => report.failed.push(err),
            }
        }
        report
    }

    /// Refuse further commands. Already queued commands stay queued so the
    /// consumer can still drain them.
    pub fn close(&self) {
        self.pending.lock().closed = true;
    }

    /// Whether [`CommandQueue::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Advisory emptiness snapshot. Only a loop-termination hint; it may be
    /// stale by the time the caller acts on it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().commands.is_empty()
    }

    /// Advisory count of pending commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().commands.len()
    }
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CommandQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("CommandQueue")
            .field("pending", &pending.commands.len())
            .field("closed", &pending.closed)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Handle to the result of a command enqueued with [`CommandQueue::call`].
#[derive(Debug)]
pub struct CommandReply<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> CommandReply<R> {
    /// Block the current thread until the command has run.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ReplyDropped`] if the command panicked or was
    /// discarded without running.
    pub fn blocking_recv(self) -> Result<R, MessagingError> {
        self.rx
            .blocking_recv()
            .map_err(|_| MessagingError::ReplyDropped)
    }

    /// Check for the result without blocking. `Ok(None)` means the command
    /// has not run yet.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ReplyDropped`] if the reply can never arrive.
    pub fn try_recv(&mut self) -> Result<Option<R>, MessagingError> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(MessagingError::ReplyDropped),
        }
    }
}

impl<R> Future for CommandReply<R> {
    type Output = Result<R, MessagingError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| MessagingError::ReplyDropped))
    }
}
