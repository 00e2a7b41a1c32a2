use std::path::{Path, PathBuf};

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

/// Formats the capture source can negotiate, in preference order.
const WANTED: [&[u8; 4]; 3] = [b"NV24", b"YUYV", b"MJPG"];

/// Detected capture device info
#[derive(Debug, Clone, PartialEq)]
pub struct FoundDevice {
    pub path: PathBuf,
    pub card: String,
    pub fourcc: FourCC,
}

/// Return `preferred` if the node exists, otherwise the first capture node
/// under `/dev/video0..9` offering NV24, YUYV or MJPEG.
pub fn resolve_device(preferred: &Path) -> Option<PathBuf> {
    if preferred.exists() {
        return Some(preferred.to_path_buf());
    }
    info!("{} not found, auto-detecting capture devices...", preferred.display());
    auto_detect_device().map(|found| found.path)
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Option<FoundDevice> {
    (0..10)
        .map(|i| PathBuf::from(format!("/dev/video{}", i)))
        .filter(|path| path.exists())
        .find_map(|path| probe(&path))
}

fn probe(path: &Path) -> Option<FoundDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps
        .capabilities
        .intersects(Flags::VIDEO_CAPTURE | Flags::VIDEO_CAPTURE_MPLANE)
    {
        debug!("{}: not a capture device", path.display());
        return None;
    }

    // enum_formats only covers the single-plane queue; multi-plane NV24
    // devices are accepted on their capability alone.
    let offered: Vec<FourCC> = dev
        .enum_formats()
        .map(|formats| formats.into_iter().map(|f| f.fourcc).collect())
        .unwrap_or_default();
    let fourcc = WANTED
        .iter()
        .map(|code| FourCC::new(code))
        .find(|code| offered.contains(code))
        .or_else(|| {
            caps.capabilities
                .contains(Flags::VIDEO_CAPTURE_MPLANE)
                .then(|| FourCC::new(b"NV24"))
        })?;

    info!("Found {} device: {} - {}", fourcc, path.display(), caps.card);
    Some(FoundDevice {
        path: path.to_path_buf(),
        card: caps.card,
        fourcc,
    })
}
