//! Wires the subsystems together and owns their startup and shutdown order.
//!
//! Start: glasses (optional), capture thread, window. Stop: capture thread
//! (which tears down any portal session it owns), IMU stream off, then the
//! engine's reader threads.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument, warn};

use crate::capture::{spawn_capture, CaptureSource, ScreencastSource, V4l2Capture};
use crate::display::Sdl2Display;
use crate::error::VisorError;
use crate::glasses::{open_glasses, CommandEngine, OrientationHandle};
use crate::pipeline::FrameShuttle;
use crate::{utils, Config, GlassesConfig, SourceKind};

/// Running glasses: engine plus the orientation record it feeds.
pub struct GlassesSession {
    engine: CommandEngine,
    orientation: OrientationHandle,
}

impl GlassesSession {
    #[instrument(skip(config))]
    pub fn open(config: &GlassesConfig) -> std::result::Result<Self, VisorError> {
        let endpoints = open_glasses(config.selector())?;
        let engine = CommandEngine::new(endpoints, config.engine());
        engine.start()?;
        let orientation = engine.track_orientation(config.warmup_samples, config.rewarmup_samples);

        if let Err(e) = engine.enable_imu() {
            engine.stop();
            return Err(e.into());
        }
        Ok(Self { engine, orientation })
    }

    pub fn orientation(&self) -> &OrientationHandle {
        &self.orientation
    }

    pub fn engine(&self) -> &CommandEngine {
        &self.engine
    }

    /// Turn the IMU stream off and join the reader threads (IMU, then MCU).
    pub fn close(self) {
        match self.engine.set_imu(false) {
            Ok(_) => info!("IMU stream disabled"),
            Err(e) => warn!("disabling IMU failed: {}", e),
        }
        self.engine.stop();
    }
}

fn open_source(config: &Config) -> Result<Box<dyn CaptureSource>> {
    match config.capture.source {
        SourceKind::V4l2 => {
            let mut capture = config.capture.clone();
            capture.device = utils::resolve_device(&capture.device)
                .ok_or_else(|| eyre!("no capture device at {}", capture.device.display()))?;
            info!("Using capture device: {}", capture.device.display());
            Ok(Box::new(V4l2Capture::open(&capture)?))
        }
        SourceKind::Screencast => Ok(Box::new(ScreencastSource::new(config.screencast.clone()))),
    }
}

/// Run the viewer until the window closes.
pub fn run(config: &Config) -> Result<()> {
    let glasses = if config.glasses.enabled {
        match GlassesSession::open(&config.glasses) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Glasses unavailable, continuing without head tracking: {}", e);
                None
            }
        }
    } else {
        None
    };

    let result = run_capture_and_display(config, glasses.as_ref().map(GlassesSession::orientation));

    if let Some(session) = glasses {
        session.close();
    }
    info!("Visor shut down");
    result
}

fn run_capture_and_display(config: &Config, orientation: Option<&OrientationHandle>) -> Result<()> {
    let (width, height) = (config.capture.width, config.capture.height);
    let shuttle = Arc::new(FrameShuttle::new(width, height));

    let source = open_source(config)?;
    let mut capture = spawn_capture(source, Arc::clone(&shuttle), (width, height))?;

    let shown = Sdl2Display::new(&config.display).and_then(|mut display| display.run(&shuttle, orientation));

    capture.stop();
    let stats = shuttle.stats();
    info!(
        "Frames: {} committed, {} presented, {} overwritten",
        stats.committed, stats.swapped, stats.overwritten
    );
    shown
}
