//! Glasses diagnostic: log every MCU event and the live head orientation.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};

use visor::app::GlassesSession;
use visor::Config;

#[derive(Debug, Parser)]
#[command(name = "glasses_probe", version, about = "Stream events and orientation from the HID glasses")]
struct Cli {
    /// How long to stream before disabling the IMU
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    visor::init_tracing();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let session = match GlassesSession::open(&config.glasses) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to open glasses: {}", e);
            return ExitCode::FAILURE;
        }
    };

    session.engine().set_event_listener(|event| {
        info!(
            "MCU event 0x{:04x} len={} ts={} data=[{}]",
            event.id,
            event.data.len(),
            event.timestamp,
            hex(&event.data)
        );
    });

    let orientation = session.orientation().clone();
    let deadline = Instant::now() + Duration::from_secs(cli.seconds);
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_secs(1));
        let state = orientation.load();
        match state.relative() {
            Some(o) => info!(
                "roll={:7.2} pitch={:7.2} yaw={:7.2} (ts={}, resets={})",
                o.roll, o.pitch, o.yaw, state.timestamp, state.resets
            ),
            None => info!("warming up ({} samples left)", state.warmup_remaining),
        }
    }

    session.engine().clear_listeners();
    session.close();
    ExitCode::SUCCESS
}
