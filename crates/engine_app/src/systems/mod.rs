//! Built-in systems run by the `engine_app` binary.
//!
//! Both are placeholders for real domain work: mechanics advances simulated
//! time, display counts the frames it would have presented.

pub mod display;
pub mod mechanics;

pub use display::{DisplaySettings, DisplaySystem};
pub use mechanics::{MechanicsStepEvent, MechanicsSystem};
