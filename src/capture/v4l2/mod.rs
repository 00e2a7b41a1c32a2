//! V4L2 capture with memory-mapped buffer pools. Single-plane devices use
//! `v4l`'s mmap stream; multi-plane ones go through `mplane`.

mod mplane;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use self::mplane::MplaneStream;
use super::convert;
use super::frame::{CaptureDescriptor, PixelFormat, PlaneLayout};
use super::CaptureSource;
use crate::error::{FormatError, Result, TransportError};
use crate::pipeline::FrameShuttle;
use crate::CaptureConfig;

/// Kernel buffers requested per stream.
pub const MIN_BUFFERS: u32 = 4;

const MAX_PLANES: usize = 2;

/// One entry of the format negotiation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub format: PixelFormat,
    pub multi_plane: bool,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.multi_plane {
            write!(f, "{}-MPLANE", self.format)
        } else {
            write!(f, "{}", self.format)
        }
    }
}

/// Formats tried, in order: NV24 multi-plane, YUYV, then MJPEG if allowed.
pub fn candidates(allow_mjpeg: bool) -> Vec<Candidate> {
    let mut list = vec![
        Candidate {
            format: PixelFormat::Nv24,
            multi_plane: true,
        },
        Candidate {
            format: PixelFormat::Yuyv,
            multi_plane: false,
        },
    ];
    if allow_mjpeg {
        list.push(Candidate {
            format: PixelFormat::Mjpeg,
            multi_plane: false,
        });
    }
    list
}

/// First candidate `try_set` accepts wins. The returned descriptor carries
/// whatever dimensions the device settled on.
pub fn negotiate<F>(
    device: &str,
    candidates: &[Candidate],
    mut try_set: F,
) -> std::result::Result<CaptureDescriptor, FormatError>
where
    F: FnMut(Candidate) -> Option<CaptureDescriptor>,
{
    for &candidate in candidates {
        if let Some(desc) = try_set(candidate) {
            return Ok(desc);
        }
        debug!("{}: {} rejected", device, candidate);
    }
    Err(FormatError::Unsupported {
        device: device.to_owned(),
        tried: candidates
            .iter()
            .map(Candidate::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    })
}

enum Pool {
    Single(MmapStream<'static>),
    Multi(MplaneStream),
}

pub struct V4l2Capture {
    // Released before the device closes.
    pool: Pool,
    _device: Device,
    name: String,
    descriptor: CaptureDescriptor,
    frame_interval: Duration,
    test_pattern: bool,
}

impl V4l2Capture {
    /// Open the node, negotiate a format and map its buffer pool.
    #[instrument(skip(config), fields(device = %config.device.display()))]
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let name = config.device.display().to_string();
        let device = Device::with_path(&config.device).map_err(TransportError::Io)?;
        let fd = device.handle().fd();

        let caps = device.query_caps().map_err(TransportError::Io)?;
        info!("Device: {} ({})", caps.card, caps.driver);
        let flags = caps.capabilities;
        if !flags.intersects(CapFlags::VIDEO_CAPTURE | CapFlags::VIDEO_CAPTURE_MPLANE) {
            return Err(FormatError::NotCapture(name).into());
        }
        if !flags.contains(CapFlags::STREAMING) {
            return Err(FormatError::NoStreaming(name).into());
        }

        let descriptor = negotiate(&name, &candidates(config.allow_mjpeg), |candidate| {
            if candidate.multi_plane {
                flags.contains(CapFlags::VIDEO_CAPTURE_MPLANE).then_some(())?;
                mplane::set_format(fd, candidate.format, config.width, config.height)
            } else {
                flags.contains(CapFlags::VIDEO_CAPTURE).then_some(())?;
                set_format_single(&device, candidate.format, config.width, config.height)
            }
        })?;
        info!(
            "Negotiated {} {}x{} ({} plane(s), {} bytes per line)",
            descriptor.format,
            descriptor.width,
            descriptor.height,
            descriptor.layout.plane_count(),
            descriptor.strides[0]
        );
        if (descriptor.width, descriptor.height) != (config.width, config.height) {
            warn!(
                "Requested {}x{}, device chose {}x{}",
                config.width, config.height, descriptor.width, descriptor.height
            );
        }

        let frame_interval = Duration::from_secs(1) / config.fps.max(1);
        let count = config.buffer_count.max(MIN_BUFFERS);
        let pool = match descriptor.layout {
            PlaneLayout::Single => {
                let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, count)
                    .map_err(TransportError::Io)?;
                stream.set_timeout((frame_interval / 2).max(Duration::from_millis(1)));
                info!("{}: mapped {} buffers", name, count);
                Pool::Single(stream)
            }
            PlaneLayout::Multi(planes) => Pool::Multi(MplaneStream::new(fd, &name, planes as usize, count)?),
        };

        Ok(Self {
            pool,
            _device: device,
            name,
            descriptor,
            frame_interval,
            test_pattern: config.test_pattern,
        })
    }

    pub fn descriptor(&self) -> CaptureDescriptor {
        self.descriptor
    }
}

fn set_format_single(
    device: &Device,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Option<CaptureDescriptor> {
    let wanted = v4l::format::Format::new(width, height, FourCC::new(&format.fourcc()));
    let actual = match device.set_format(&wanted) {
        Ok(actual) => actual,
        Err(e) => {
            debug!("S_FMT {} failed: {}", format, e);
            return None;
        }
    };
    (actual.fourcc.repr == format.fourcc()).then_some(CaptureDescriptor {
        width: actual.width,
        height: actual.height,
        format,
        layout: PlaneLayout::Single,
        strides: [actual.stride, 0],
    })
}

fn publish(shuttle: &FrameShuttle, desc: &CaptureDescriptor, planes: &[&[u8]], test_pattern: bool) {
    let mut back = shuttle.producer_begin();
    convert::convert_into(desc, planes, &mut back, test_pattern);
    shuttle.producer_commit(back);
    metrics::counter!("visor_frames_captured").increment(1);
}

impl CaptureSource for V4l2Capture {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, shuttle: &Arc<FrameShuttle>, stop: &Arc<AtomicBool>) -> Result<()> {
        let pause = self.frame_interval / 2;
        let Self {
            pool,
            name,
            descriptor,
            test_pattern,
            ..
        } = self;

        match pool {
            Pool::Single(stream) => {
                while !stop.load(Ordering::Acquire) {
                    match stream.next() {
                        Ok((buf, meta)) => {
                            let used = (meta.bytesused as usize).min(buf.len());
                            publish(shuttle, descriptor, &[&buf[..used]], *test_pattern);
                        }
                        // The stream already waited half a frame.
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(pause),
                        Err(e) => return Err(TransportError::Io(e).into()),
                    }
                }
                if let Err(e) = Stream::stop(stream) {
                    warn!("{}: STREAMOFF failed: {}", name, e);
                }
            }
            Pool::Multi(stream) => {
                stream.stream_on()?;
                while !stop.load(Ordering::Acquire) {
                    let Some(frame) = stream.dequeue()? else {
                        std::thread::sleep(pause);
                        continue;
                    };
                    let planes = stream.planes(&frame).map_err(|e| {
                        warn!("{}: {}", name, e);
                        e
                    })?;
                    publish(shuttle, descriptor, &planes, *test_pattern);
                    stream.queue(frame.index)?;
                }
                stream.stream_off();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(format: PixelFormat, layout: PlaneLayout) -> CaptureDescriptor {
        CaptureDescriptor {
            width: 1920,
            height: 1080,
            format,
            layout,
            strides: [0, 0],
        }
    }

    #[test]
    fn test_candidate_order() {
        let names: Vec<_> = candidates(true).iter().map(ToString::to_string).collect();
        assert_eq!(names, ["NV24-MPLANE", "YUYV", "MJPEG"]);
        assert_eq!(candidates(false).len(), 2);
    }

    #[test]
    fn test_nv24_preferred() {
        let got = negotiate("/dev/video0", &candidates(true), |c| {
            Some(desc(c.format, PlaneLayout::Multi(2)))
        })
        .unwrap();
        assert_eq!(got.format, PixelFormat::Nv24);
    }

    #[test]
    fn test_falls_back_to_yuyv() {
        let mut tried = Vec::new();
        let got = negotiate("/dev/video0", &candidates(true), |c| {
            tried.push(c);
            (c.format == PixelFormat::Yuyv).then(|| desc(c.format, PlaneLayout::Single))
        })
        .unwrap();
        assert_eq!(got.format, PixelFormat::Yuyv);
        assert_eq!(got.layout, PlaneLayout::Single);
        assert_eq!(tried.len(), 2);
    }

    #[test]
    fn test_device_dimensions_are_authoritative() {
        let got = negotiate("/dev/video0", &candidates(false), |c| {
            Some(CaptureDescriptor {
                width: 1280,
                height: 720,
                format: c.format,
                layout: PlaneLayout::Multi(1),
                strides: [1280, 0],
            })
        })
        .unwrap();
        assert_eq!((got.width, got.height), (1280, 720));
    }

    #[test]
    fn test_nothing_supported() {
        let err = negotiate("/dev/video3", &candidates(false), |_| None).unwrap_err();
        match err {
            FormatError::Unsupported { device, tried } => {
                assert_eq!(device, "/dev/video3");
                assert_eq!(tried, "NV24-MPLANE, YUYV");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
