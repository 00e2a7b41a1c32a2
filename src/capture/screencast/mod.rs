//! Screen capture through the desktop portal and PipeWire.
//!
//! The portal handshake runs on a single-threaded tokio runtime owned by the
//! capture thread, bounded by the setup timeout and by the stop flag. Once a
//! node is granted, the same thread runs the PipeWire loop until stopped.

pub mod portal;
pub mod stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::CaptureSource;
use crate::error::{Result, RpcError, TransportError};
use crate::pipeline::FrameShuttle;
use crate::ScreencastConfig;

pub use portal::PortalSession;
pub use stream::FrameSink;

pub struct ScreencastSource {
    config: ScreencastConfig,
}

impl ScreencastSource {
    pub fn new(config: ScreencastConfig) -> Self {
        Self { config }
    }
}

async fn wait_for_stop(stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

impl CaptureSource for ScreencastSource {
    fn name(&self) -> &str {
        "screencast"
    }

    fn run(&mut self, shuttle: &Arc<FrameShuttle>, stop: &Arc<AtomicBool>) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Io)?;
        let deadline = Duration::from_millis(self.config.setup_timeout_ms);

        let mut session: Option<PortalSession> = None;
        let setup = runtime.block_on(async {
            let handshake = async {
                let portal = session.insert(PortalSession::connect().await?);
                let node_id = portal.negotiate().await?;
                let fd = portal.open_pipewire_remote().await?;
                Ok::<_, RpcError>((node_id, fd))
            };
            tokio::select! {
                result = tokio::time::timeout(deadline, handshake) => {
                    result.unwrap_or(Err(RpcError::Timeout(self.config.setup_timeout_ms)))
                }
                _ = wait_for_stop(stop) => Err(RpcError::Aborted),
            }
        });

        let result = setup.and_then(|(node_id, fd)| {
            info!("Screencast node {} granted", node_id);
            stream::run_stream(fd, node_id, Arc::clone(shuttle), Arc::clone(stop), &self.config)
        });

        if let Some(mut portal) = session {
            runtime.block_on(portal.close());
        }
        result.map_err(Into::into)
    }
}
