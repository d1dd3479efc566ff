//! Event payloads shared by the engine and every system.
//!
//! Events are plain values. Frame and shutdown events are broadcast on the
//! [`EventStream`](crate::EventStream); [`SystemFaultEvent`] is how a worker
//! thread reports failures without letting them cross the thread boundary.

use serde::{Deserialize, Serialize};

// ── Frame lifecycle ─────────────────────────────────────────────────────────

/// Published by the engine at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameBeginEvent {
    /// Monotonically increasing frame counter, starting at 1.
    pub frame_number: u64,
    /// Seconds elapsed since the previous frame began.
    pub delta_time: f32,
}

/// Published by the engine once a frame's bookkeeping is done.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameEndEvent {
    /// The frame that ended.
    pub frame_number: u64,
    /// Seconds the engine spent on the frame.
    pub frame_time: f32,
}

/// Broadcast once when the engine begins shutting down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineShutdownEvent;

// ── Fault reporting ─────────────────────────────────────────────────────────

/// Where inside a system a fault originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSource {
    /// A queued command panicked.
    Command,
    /// An event-stream handler panicked.
    EventHandler,
    /// `on_start` failed.
    Start,
    /// `on_tick` returned an error or panicked.
    Tick,
    /// `on_stop` panicked.
    Stop,
    /// The worker thread itself died outside any contained region. Reported
    /// by the owner that joined it.
    Worker,
}

/// Whether the faulting system keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Logged and reported; the system continues with its next tick.
    Recoverable,
    /// The system has left its tick loop and is stopping.
    Fatal,
}

/// A failure reported by a system's worker thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFaultEvent {
    /// Name of the reporting system.
    pub system: String,
    /// Unique instance identifier of the reporting system.
    pub instance_id: String,
    /// Where the fault happened.
    pub source: FaultSource,
    /// Whether the system is going down.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
}

impl SystemFaultEvent {
    /// Returns `true` if the reporting system has stopped ticking.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}
