//! System configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tick rate used when a configured rate is unusable.
pub const FALLBACK_HZ: f64 = 60.0;

/// Default tick rate for a fixed cadence.
pub const DEFAULT_HZ: f64 = 120.0;

/// Default bound on commands executed per tick.
pub const DEFAULT_MAX_COMMANDS_PER_TICK: usize = 64;

/// How often a system's worker thread ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Cadence {
    /// Tick at a fixed rate, sleeping between ticks.
    Fixed {
        /// Ticks per second.
        hz: f64,
    },
    /// Tick as fast as possible, yielding between ticks.
    Variable,
}

impl Cadence {
    /// A fixed cadence of `hz` ticks per second.
    #[must_use]
    pub fn fixed(hz: f64) -> Self {
        Self::Fixed { hz }
    }

    /// Target time between tick starts, or `None` for a variable cadence.
    ///
    /// Rates that do not yield a representable period (non-positive,
    /// non-finite, or so small the period overflows) fall back to
    /// [`FALLBACK_HZ`].
    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        match *self {
            Self::Fixed { hz } => Some(fixed_period(hz).unwrap_or_else(fallback_period)),
            Self::Variable => None,
        }
    }

    /// Whether a fixed rate yields a representable period.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Fixed { hz } => fixed_period(hz).is_some(),
            Self::Variable => true,
        }
    }

    /// This cadence, or a fixed [`FALLBACK_HZ`] one if it is not valid.
    #[must_use]
    pub fn sanitized(self) -> Self {
        if self.is_valid() { self } else { Self::fixed(FALLBACK_HZ) }
    }
}

fn fixed_period(hz: f64) -> Option<Duration> {
    if !(hz.is_finite() && hz > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / hz).ok()
}

fn fallback_period() -> Duration {
    Duration::from_secs(1).div_f64(FALLBACK_HZ)
}

impl Default for Cadence {
    fn default() -> Self {
        Self::Fixed { hz: DEFAULT_HZ }
    }
}

fn default_max_commands() -> usize {
    DEFAULT_MAX_COMMANDS_PER_TICK
}

/// Configuration for one threaded system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Stable system name (e.g. `"mechanics"`), used in logs and thread names.
    pub name: String,
    /// Tick pacing.
    #[serde(default)]
    pub cadence: Cadence,
    /// Upper bound on queued commands executed per tick.
    #[serde(default = "default_max_commands")]
    pub max_commands_per_tick: usize,
    /// Bound on pending commands. `None` means unbounded.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Names of systems that must start before this one and stop after it.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SystemConfig {
    /// Create a config with defaults for everything except the name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cadence: Cadence::default(),
            max_commands_per_tick: DEFAULT_MAX_COMMANDS_PER_TICK,
            queue_capacity: None,
            dependencies: Vec::new(),
        }
    }

    /// Set the tick cadence.
    #[must_use]
    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    /// Set the per-tick command budget. Zero is raised to one.
    #[must_use]
    pub fn with_max_commands_per_tick(mut self, max: usize) -> Self {
        self.max_commands_per_tick = max.max(1);
        self
    }

    /// Bound the command queue.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Declare that `system` must start before this one.
    #[must_use]
    pub fn with_dependency(mut self, system: impl Into<String>) -> Self {
        self.add_dependency(system);
        self
    }

    /// Add `system` to the dependencies unless already listed.
    pub fn add_dependency(&mut self, system: impl Into<String>) {
        let system = system.into();
        if !self.dependencies.contains(&system) {
            self.dependencies.push(system);
        }
    }

    /// The per-tick command budget, never zero.
    #[must_use]
    pub fn command_budget(&self) -> usize {
        self.max_commands_per_tick.max(1)
    }

    /// Overlay `overrides` onto this config.
    pub fn apply(&mut self, overrides: &SystemOverrides) {
        if let Some(cadence) = overrides.cadence {
            self.cadence = cadence;
        }
        if let Some(max) = overrides.max_commands_per_tick {
            self.max_commands_per_tick = max.max(1);
        }
        if let Some(capacity) = overrides.queue_capacity {
            self.queue_capacity = Some(capacity);
        }
        if let Some(dependencies) = &overrides.dependencies {
            for dependency in dependencies {
                self.add_dependency(dependency.as_str());
            }
        }
    }
}

/// Partial [`SystemConfig`], as found in an engine config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemOverrides {
    /// Replacement cadence.
    pub cadence: Option<Cadence>,
    /// Replacement per-tick command budget.
    pub max_commands_per_tick: Option<usize>,
    /// Replacement queue bound.
    pub queue_capacity: Option<usize>,
    /// Extra start-order dependencies.
    pub dependencies: Option<Vec<String>>,
}
