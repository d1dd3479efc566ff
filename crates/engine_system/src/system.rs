//! The `System` trait.

use engine_messaging::EventReader;

use crate::context::{SystemContext, TickContext};
use crate::error::{SystemError, TickError};

/// A unit of engine work that owns its state and runs on its own thread.
///
/// `configure` runs on the engine thread before the worker exists. Every
/// other hook runs only on the worker thread spawned by
/// [`ThreadedSystem`](crate::ThreadedSystem), which holds the value
/// exclusively while it runs. Other threads reach the system only through its
/// command queue or the event stream.
pub trait System: Send + Sized + 'static {
    /// Stable name used for logging, thread names and service lookup.
    fn name(&self) -> &str;

    /// Names of systems that must be started before this one. They are
    /// stopped after it.
    fn dependencies(&self) -> &[&str] {
        &[]
    }

    /// Resolve services and subscribe to stream events.
    ///
    /// # Errors
    ///
    /// Any error aborts engine startup before a thread is spawned.
    fn configure(
        &mut self,
        _context: &SystemContext<Self>,
        _events: &mut EventReader<Self>,
    ) -> Result<(), SystemError> {
        Ok(())
    }

    /// Called once on the worker thread before the first tick.
    ///
    /// # Errors
    ///
    /// Any error is treated as fatal and the tick loop never starts.
    fn on_start(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
        Ok(())
    }

    /// Called once per tick, after queued commands and pending events have
    /// been delivered.
    ///
    /// # Errors
    ///
    /// [`TickError::Recoverable`] is reported and the loop continues;
    /// [`TickError::Fatal`] ends the loop.
    fn on_tick(&mut self, ctx: &mut TickContext<'_, Self>) -> Result<(), TickError>;

    /// Called once on the worker thread after the loop exits.
    fn on_stop(&mut self, _ctx: &mut TickContext<'_, Self>) {}
}
