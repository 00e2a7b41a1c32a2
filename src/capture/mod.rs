//! Capture sources and the thread that drives them into the frame shuttle.

pub mod convert;
pub mod frame;
pub mod screencast;
pub mod v4l2;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::Result;
use crate::pipeline::FrameShuttle;

pub use frame::{CaptureDescriptor, PixelFormat, PlaneLayout, Surface};
pub use screencast::ScreencastSource;
pub use v4l2::V4l2Capture;

/// Something that fills the shuttle's back surface until told to stop.
pub trait CaptureSource: Send {
    fn name(&self) -> &str;

    /// Blocks until `stop` is set or the source fails.
    fn run(&mut self, shuttle: &Arc<FrameShuttle>, stop: &Arc<AtomicBool>) -> Result<()>;
}

/// Publishes the gradient once and idles. Stands in for a failed source.
pub struct TestPatternSource {
    width: u32,
    height: u32,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl CaptureSource for TestPatternSource {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn run(&mut self, shuttle: &Arc<FrameShuttle>, stop: &Arc<AtomicBool>) -> Result<()> {
        let mut back = shuttle.producer_begin();
        back.resize(self.width, self.height);
        convert::fill_test_pattern(&mut back.data, self.width, self.height);
        shuttle.producer_commit(back);
        metrics::counter!("visor_frames_fallback").increment(1);

        while !stop.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }
}

/// Handle to the capture thread.
pub struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Run `source` on its own thread. If it fails, the thread switches to the
/// test pattern at `fallback` dimensions and keeps running until stopped.
pub fn spawn_capture(
    mut source: Box<dyn CaptureSource>,
    shuttle: Arc<FrameShuttle>,
    fallback: (u32, u32),
) -> std::io::Result<CaptureWorker> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);

    let handle = std::thread::Builder::new()
        .name("visor-capture".into())
        .spawn(move || {
            info!("Capture started: {}", source.name());
            if let Err(e) = source.run(&shuttle, &flag) {
                error!("{} failed: {}", source.name(), e);
                drop(source);
                if !flag.load(Ordering::Acquire) {
                    warn!("Falling back to test pattern");
                    let mut pattern = TestPatternSource::new(fallback.0, fallback.1);
                    if let Err(e) = pattern.run(&shuttle, &flag) {
                        error!("test pattern failed: {}", e);
                    }
                }
            }
            info!("Capture stopped");
        })?;

    Ok(CaptureWorker {
        stop,
        handle: Some(handle),
    })
}

impl CaptureWorker {
    /// Signal the thread and join it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
