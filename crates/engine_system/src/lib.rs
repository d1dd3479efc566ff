//! # engine_system
//!
//! Threaded system runtime for the engine.
//!
//! This crate turns a [`System`] implementation into a component that owns
//! its state on a dedicated worker thread. Each system:
//!
//! 1. Is configured with an immutable [`SystemContext`]: its own service
//!    scope, the shared event stream, and its own command queue.
//! 2. Subscribes to stream events it cares about while configuring.
//! 3. On start, gets a worker thread that drains commands, delivers events
//!    and calls [`System::on_tick`] at its configured cadence.
//! 4. On stop, executes whatever commands are still queued, then runs
//!    [`System::on_stop`] and hands its state back.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use engine_messaging::EventStream;
//! use engine_system::{ServiceRegistry, System, ThreadedSystem, TickContext, TickError};
//!
//! #[derive(Default)]
//! struct Counter {
//!     ticks: u64,
//! }
//!
//! impl System for Counter {
//!     fn name(&self) -> &str {
//!         "counter"
//!     }
//!
//!     fn on_tick(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
//!         self.ticks += 1;
//!         Ok(())
//!     }
//! }
//!
//! let services = Arc::new(ServiceRegistry::new().freeze());
//! let stream = Arc::new(EventStream::new());
//!
//! let mut system = ThreadedSystem::new(Counter::default());
//! system.configure(services, stream).unwrap();
//! system.start().unwrap();
//! system.queue().enqueue(|counter| counter.ticks += 100).unwrap();
//! system.stop().unwrap();
//!
//! assert!(system.system().unwrap().ticks >= 100);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod runner;
pub mod services;
pub mod system;

pub use config::{Cadence, SystemConfig, SystemOverrides};
pub use context::{SystemContext, TickContext};
pub use error::{ServiceError, SystemError, TickError};
pub use runner::{FAULT_LOG_CAPACITY, ManagedSystem, SystemState, SystemStats, ThreadedSystem};
pub use services::{ServiceKey, ServiceLifetime, ServiceLocator, ServiceRegistry};
pub use system::System;
