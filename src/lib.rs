pub mod app;
pub mod capture;
pub mod display;
pub mod error;
pub mod glasses;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::glasses::{DeviceSelector, EngineConfig};

pub use error::{Result, VisorError};

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub glasses: GlassesConfig,
    pub screencast: ScreencastConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    V4l2,
    Screencast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    pub allow_mjpeg: bool,
    /// Skip conversion and show the gradient.
    pub test_pattern: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    /// Orbit radius of the virtual screen.
    pub plane_distance: f32,
    pub plane_scale: f32,
    pub fov_deg: f32,
    pub near: f32,
    pub far: f32,
    pub target_fps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlassesConfig {
    pub enabled: bool,
    pub vendor_id: u16,
    pub mcu_interface: i32,
    pub imu_interface: i32,
    pub warmup_samples: u32,
    /// Samples discarded after a shake reset.
    pub rewarmup_samples: u32,
    pub exec_timeout_ms: u64,
    pub read_timeout_ms: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreencastConfig {
    pub setup_timeout_ms: u64,
    pub max_width: u32,
    pub max_height: u32,
    pub max_fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::V4l2,
            device: PathBuf::from("/dev/video0"),
            width: 1920,
            height: 1080,
            fps: 30,
            buffer_count: 4,
            allow_mjpeg: true,
            test_pattern: false,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fullscreen: false,
            plane_distance: 1.0,
            plane_scale: 1.0,
            fov_deg: 45.0,
            near: 1.0,
            far: 100.0,
            target_fps: 60,
        }
    }
}

impl Default for GlassesConfig {
    fn default() -> Self {
        let selector = DeviceSelector::default();
        let engine = EngineConfig::default();
        Self {
            enabled: false,
            vendor_id: selector.vendor_id,
            mcu_interface: selector.mcu_interface,
            imu_interface: selector.imu_interface,
            warmup_samples: 20,
            rewarmup_samples: 30,
            exec_timeout_ms: engine.exec_timeout.as_millis() as u64,
            read_timeout_ms: engine.read_timeout_ms,
        }
    }
}

impl Default for ScreencastConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: 10_000,
            max_width: 4096,
            max_height: 4096,
            max_fps: 1000,
        }
    }
}

impl GlassesConfig {
    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector {
            vendor_id: self.vendor_id,
            mcu_interface: self.mcu_interface,
            imu_interface: self.imu_interface,
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            exec_timeout: Duration::from_millis(self.exec_timeout_ms),
            read_timeout_ms: self.read_timeout_ms,
        }
    }
}

impl Config {
    /// Built-in defaults, then the optional TOML file, then `VISOR__SECTION__KEY`
    /// environment variables.
    pub fn load(file: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("VISOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture size {}x{}",
                capture.width, capture.height
            )));
        }
        if capture.fps == 0 {
            return Err(ConfigError::Invalid("capture fps must be positive".into()));
        }
        if self.display.near <= 0.0 || self.display.far <= self.display.near {
            return Err(ConfigError::Invalid(format!(
                "clip planes near={} far={}",
                self.display.near, self.display.far
            )));
        }
        Ok(())
    }

    /// Repair values that have a documented fallback instead of failing.
    pub fn sanitize(&mut self) {
        if self.display.plane_scale <= 0.0 || !self.display.plane_scale.is_finite() {
            warn!(
                "plane scale must be positive (got {}), using 1.0",
                self.display.plane_scale
            );
            self.display.plane_scale = 1.0;
        }
        if self.capture.buffer_count < capture::v4l2::MIN_BUFFERS {
            warn!(
                "buffer_count {} below minimum, using {}",
                self.capture.buffer_count,
                capture::v4l2::MIN_BUFFERS
            );
            self.capture.buffer_count = capture::v4l2::MIN_BUFFERS;
        }
    }
}

/// Install the fmt subscriber used by the binaries. `RUST_LOG` overrides the
/// default `visor=info` filter.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("visor=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    registry.with(tracing_tracy::TracyLayer::default()).init();

    #[cfg(not(feature = "profiling"))]
    registry.init();
}
