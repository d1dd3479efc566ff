//! # engine_messaging
//!
//! Cross-thread communication layer for the engine.
//!
//! This crate provides:
//!
//! - [`command`]: [`CommandQueue`], the way any thread schedules work onto
//!   the thread that owns some state.
//! - [`bus`]: [`EventBus`], synchronous same-thread publish/subscribe.
//! - [`stream`]: [`EventStream`], asynchronous cross-thread delivery drained
//!   by each consumer once per tick, plus the per-consumer [`EventReader`].
//! - [`events`]: frame, shutdown and fault event payloads.
//! - [`error`]: messaging error types.

pub mod bus;
pub mod command;
pub mod error;
pub mod events;
pub mod stream;

pub use bus::EventBus;
pub use command::{Command, CommandQueue, CommandReply, DrainReport, Execution};
pub use error::{CommandError, MessagingError, panic_message};
pub use events::{
    EngineShutdownEvent, FaultSource, FrameBeginEvent, FrameEndEvent, Severity, SystemFaultEvent,
};
pub use stream::{
    Backpressure, DrainStats, Envelope, Event, EventReader, EventStream, HandlerFailure,
    PublishReceipt, StreamOptions, Subscription,
};
