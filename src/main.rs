//! Visor: captured video on a head-tracked virtual screen.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::Result;
use tracing::{error, info};

use visor::{app, Config, SourceKind};

#[derive(Debug, Parser)]
#[command(name = "visor", version, about = "Show a capture device or the desktop on a head-tracked virtual screen")]
struct Cli {
    /// Capture device path
    #[arg(long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Use a full-screen window
    #[arg(long)]
    fullscreen: bool,

    /// Enable head tracking from the HID glasses
    #[arg(long)]
    viture: bool,

    /// Show a gradient instead of converted frames
    #[arg(long)]
    test_pattern: bool,

    /// Capture the desktop through the screencast portal
    #[arg(long)]
    xdg: bool,

    /// Distance of the virtual screen from the head
    #[arg(long, value_name = "F", allow_negative_numbers = true)]
    plane_distance: Option<f32>,

    /// Scale of the virtual screen; non-positive values fall back to 1.0
    #[arg(long, value_name = "F", allow_negative_numbers = true)]
    plane_scale: Option<f32>,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Requested capture width
    #[arg(long)]
    width: Option<u32>,

    /// Requested capture height
    #[arg(long)]
    height: Option<u32>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.capture.device = device.clone();
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(distance) = self.plane_distance {
            config.display.plane_distance = distance;
        }
        if let Some(scale) = self.plane_scale {
            config.display.plane_scale = scale;
        }
        config.display.fullscreen |= self.fullscreen;
        config.glasses.enabled |= self.viture;
        config.capture.test_pattern |= self.test_pattern;
        if self.xdg {
            config.capture.source = SourceKind::Screencast;
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.sanitize();
    config.validate()?;

    info!("Visor launching...");
    app::run(&config)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Usage errors exit 1; --help and --version exit 0.
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporter: {}", e);
    }
    visor::init_tracing();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:#}", e);
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}
