//! # engine_app
//!
//! The engine orchestrator. [`Engine`] owns the shared service locator,
//! event stream and fault bus, and drives every system through its lifecycle:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use engine_app::systems::{DisplaySettings, DisplaySystem, MechanicsSystem};
//! use engine_app::{Engine, EngineConfig};
//!
//! # fn main() -> Result<(), engine_app::EngineError> {
//! let mut engine = Engine::new(EngineConfig::default());
//! engine.register_service(Arc::new(DisplaySettings::default()))?;
//! let mechanics = engine.add_system(MechanicsSystem::new())?;
//! engine.add_system(DisplaySystem::new())?;
//!
//! engine.start()?;
//! engine.run_for(120)?;
//! mechanics.enqueue(|mechanics| mechanics.set_paused(true))?;
//! engine.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod registry;
pub mod systems;

pub use config::EngineConfig;
pub use engine::{Engine, EngineState, FrameReport, SystemHandle};
pub use error::EngineError;
pub use frame::{FrameClock, FrameTiming};
pub use registry::SystemRegistry;
