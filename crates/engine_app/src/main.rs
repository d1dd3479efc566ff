//! # engine_app
//!
//! Runs the engine with its built-in systems until the frame limit is
//! reached, every system has stopped, or Ctrl-C is pressed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use engine_app::systems::{DisplaySettings, DisplaySystem, MechanicsSystem};
use engine_app::{Engine, EngineConfig};
use engine_messaging::SystemFaultEvent;

#[derive(Parser)]
#[command(name = "engine_app", about = "Runs the engine with its built-in systems")]
struct Args {
    /// Path to a JSON engine config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many frames (0 = run until Ctrl-C)
    #[arg(short, long)]
    frames: Option<u64>,

    /// Target frames per second
    #[arg(long)]
    frame_rate: Option<f64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(frames) = args.frames {
        config.max_frames = frames;
    }
    if let Some(frame_rate) = args.frame_rate {
        config.frame_rate = frame_rate;
    }

    // Initialise structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_thread_names(true)
        .init();

    let max_frames = config.max_frames;
    let mut engine = Engine::new(config);
    engine.register_service(Arc::new(DisplaySettings::default()))?;
    let mechanics = engine.add_system(MechanicsSystem::new())?;
    engine.add_system(DisplaySystem::new())?;
    engine.on_fault(|fault: &SystemFaultEvent| {
        if fault.is_fatal() {
            warn!(system = fault.system, "system lost; restart is not supported, continuing without it");
        }
    })?;

    engine.start().context("engine failed to start")?;
    info!(max_frames, "engine running");

    let mut interval = tokio::time::interval(engine.clock().period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = engine.run_frame()?;
                if max_frames > 0 && report.frame_number >= max_frames {
                    info!(frames = report.frame_number, "frame limit reached");
                    break;
                }
                if engine.running_systems() == 0 {
                    warn!(frames = report.frame_number, "no systems left running");
                    break;
                }
            }
            result = &mut ctrl_c => {
                result.context("failed to listen for Ctrl-C")?;
                info!("interrupt received");
                break;
            }
        }
    }

    match mechanics.call(|mechanics| (mechanics.steps(), mechanics.simulated_time())) {
        Ok(reply) => match reply.await {
            Ok((steps, simulated_time)) => info!(steps, simulated_time, "mechanics summary"),
            Err(err) => warn!(error = %err, "mechanics summary unavailable"),
        },
        Err(err) => warn!(error = %err, "mechanics no longer accepts commands"),
    }

    if let Err(err) = engine.shutdown() {
        error!(error = %err, "shutdown incomplete");
        return Err(err.into());
    }
    info!("engine exited cleanly");
    Ok(())
}
