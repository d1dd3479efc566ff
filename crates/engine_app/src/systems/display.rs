//! Presentation stub.

use std::sync::Arc;

use engine_messaging::{Backpressure, EventReader, FrameBeginEvent, StreamOptions};
use engine_system::{System, SystemContext, SystemError, TickContext, TickError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::mechanics::MechanicsStepEvent;

/// Window parameters, provided to [`DisplaySystem`] as a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySettings {
    /// Window title.
    pub title: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            title: "engine".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Mechanics steps buffered between presents. Older ones are dropped.
const STEP_BACKLOG: usize = 32;

/// "Presents" once per engine frame, showing the latest simulated time.
#[derive(Debug, Default)]
pub struct DisplaySystem {
    settings: Option<Arc<DisplaySettings>>,
    pending_frame: Option<u64>,
    frames_presented: u64,
    last_presented: u64,
    simulated_time: f64,
}

impl DisplaySystem {
    /// Create a display with no settings resolved yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames presented so far.
    #[must_use]
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Number of the last frame presented.
    #[must_use]
    pub fn last_presented(&self) -> u64 {
        self.last_presented
    }

    /// Latest simulated time received from mechanics.
    #[must_use]
    pub fn simulated_time(&self) -> f64 {
        self.simulated_time
    }

    /// The resolved settings, once configured.
    #[must_use]
    pub fn settings(&self) -> Option<&DisplaySettings> {
        self.settings.as_deref()
    }
}

impl System for DisplaySystem {
    fn name(&self) -> &str {
        "display"
    }

    fn dependencies(&self) -> &[&str] {
        &["mechanics"]
    }

    fn configure(
        &mut self,
        context: &SystemContext<Self>,
        events: &mut EventReader<Self>,
    ) -> Result<(), SystemError> {
        let settings = context.resolve::<DisplaySettings>()?;
        if settings.width == 0 || settings.height == 0 {
            return Err(SystemError::configure(
                context.name(),
                format!("unusable resolution {}x{}", settings.width, settings.height),
            ));
        }
        self.settings = Some(settings);
        events.subscribe(context.stream(), |display: &mut Self, frame: &FrameBeginEvent| {
            display.pending_frame = Some(frame.frame_number);
        });
        events.subscribe_with(
            context.stream(),
            StreamOptions::bounded(STEP_BACKLOG, Backpressure::DropOldest),
            |display: &mut Self, step: &MechanicsStepEvent| {
                display.simulated_time = step.simulated_time;
            },
        );
        Ok(())
    }

    fn on_start(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
        let Some(settings) = self.settings.as_deref() else {
            return Err(TickError::fatal("display settings missing"));
        };
        info!(
            title = settings.title,
            width = settings.width,
            height = settings.height,
            "display opened"
        );
        Ok(())
    }

    fn on_tick(&mut self, _ctx: &mut TickContext<'_, Self>) -> Result<(), TickError> {
        if let Some(frame) = self.pending_frame.take() {
            self.frames_presented += 1;
            self.last_presented = frame;
            trace!(frame, simulated_time = self.simulated_time, "frame presented");
        }
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut TickContext<'_, Self>) {
        debug!(frames = self.frames_presented, "display closed");
    }
}
