//! PipeWire consumer for the portal's screencast node.

use std::cell::Cell;
use std::io::Cursor;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pipewire as pw;
use pw::spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use pw::spa::param::video::{VideoFormat, VideoInfoRaw};
use pw::spa::param::{format_utils, ParamType};
use pw::spa::pod::serialize::PodSerializer;
use pw::spa::pod::{self, Pod};
use pw::spa::utils::{Direction, Fraction, Rectangle, SpaTypes};
use pw::stream::{Stream, StreamFlags, StreamState};
use tracing::{debug, error, info, warn};

use crate::capture::convert::{self, ChannelOrder, Conversion};
use crate::capture::frame::PixelFormat;
use crate::error::RpcError;
use crate::pipeline::FrameShuttle;
use crate::ScreencastConfig;

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Negotiated {
    format: PixelFormat,
    width: u32,
    height: u32,
}

/// Writes four-channel stream buffers into the shuttle as RGB.
pub struct FrameSink {
    shuttle: Arc<FrameShuttle>,
    negotiated: Option<Negotiated>,
}

impl FrameSink {
    pub fn new(shuttle: Arc<FrameShuttle>) -> Self {
        Self {
            shuttle,
            negotiated: None,
        }
    }

    pub fn set_format(&mut self, format: PixelFormat, width: u32, height: u32) {
        let next = Negotiated {
            format,
            width,
            height,
        };
        if self.negotiated != Some(next) {
            info!("Screencast format {} {}x{}", format, width, height);
        }
        self.negotiated = Some(next);
    }

    pub fn clear_format(&mut self) {
        self.negotiated = None;
    }

    /// Convert one buffer. `stride` is bytes per row; zero or negative means
    /// tightly packed. Returns `None` while no format is negotiated.
    pub fn push(&mut self, frame: &[u8], stride: i32) -> Option<Conversion> {
        let Negotiated {
            format,
            width,
            height,
        } = self.negotiated?;
        let order = match format {
            PixelFormat::Bgrx => ChannelOrder::Bgr,
            _ => ChannelOrder::Rgb,
        };

        let mut back = self.shuttle.producer_begin();
        back.resize(width, height);
        let result = convert::packed32_to_rgb(
            frame,
            usize::try_from(stride).unwrap_or(0),
            order,
            &mut back.data,
            width,
            height,
        );
        self.shuttle.producer_commit(back);

        metrics::counter!("visor_frames_captured").increment(1);
        if result == Conversion::Pattern {
            metrics::counter!("visor_frames_fallback").increment(1);
        }
        Some(result)
    }
}

fn pixel_format(format: VideoFormat) -> Option<PixelFormat> {
    match format {
        VideoFormat::RGBx => Some(PixelFormat::Rgbx),
        VideoFormat::RGBA => Some(PixelFormat::Rgba),
        VideoFormat::BGRx => Some(PixelFormat::Bgrx),
        _ => None,
    }
}

fn pw_error(e: impl std::fmt::Debug) -> RpcError {
    RpcError::PipeWire(format!("{:?}", e))
}

/// EnumFormat offer: RGBx, RGBA or BGRx at any size and rate up to the limits.
fn format_offer(limits: &ScreencastConfig) -> Result<Vec<u8>, RpcError> {
    let object = pod::object!(
        SpaTypes::ObjectParamFormat,
        ParamType::EnumFormat,
        pod::property!(FormatProperties::MediaType, Id, MediaType::Video),
        pod::property!(FormatProperties::MediaSubtype, Id, MediaSubtype::Raw),
        pod::property!(
            FormatProperties::VideoFormat,
            Choice,
            Enum,
            Id,
            VideoFormat::RGBx,
            VideoFormat::RGBx,
            VideoFormat::RGBA,
            VideoFormat::BGRx
        ),
        pod::property!(
            FormatProperties::VideoSize,
            Choice,
            Range,
            Rectangle,
            Rectangle {
                width: 1920,
                height: 1080
            },
            Rectangle {
                width: 1,
                height: 1
            },
            Rectangle {
                width: limits.max_width,
                height: limits.max_height
            }
        ),
        pod::property!(
            FormatProperties::VideoFramerate,
            Choice,
            Range,
            Fraction,
            Fraction { num: 60, denom: 1 },
            Fraction { num: 0, denom: 1 },
            Fraction {
                num: limits.max_fps,
                denom: 1
            }
        ),
    );
    let (cursor, _) = PodSerializer::serialize(Cursor::new(Vec::new()), &pod::Value::Object(object))
        .map_err(pw_error)?;
    Ok(cursor.into_inner())
}

struct StreamData {
    info: VideoInfoRaw,
    sink: FrameSink,
}

/// Consume `node_id` over the portal's PipeWire descriptor until `stop` is
/// set or the stream errors. Everything PipeWire-side is torn down on return.
pub fn run_stream(
    fd: OwnedFd,
    node_id: u32,
    shuttle: Arc<FrameShuttle>,
    stop: Arc<AtomicBool>,
    limits: &ScreencastConfig,
) -> Result<(), RpcError> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None)?;
    let context = pw::context::Context::new(&mainloop)?;
    let core = context.connect_fd(fd, None)?;

    let stream = Stream::new(
        &core,
        "visor-screencast",
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )?;

    let failed = Rc::new(Cell::new(false));
    let on_state = {
        let mainloop = mainloop.clone();
        let failed = Rc::clone(&failed);
        move |_: &pw::stream::StreamRef, _: &mut StreamData, old: StreamState, new: StreamState| {
            debug!("Stream state {:?} -> {:?}", old, new);
            if let StreamState::Error(message) = new {
                error!("screencast stream error: {}", message);
                failed.set(true);
                mainloop.quit();
            }
        }
    };

    let _listener = stream
        .add_local_listener_with_user_data(StreamData {
            info: VideoInfoRaw::new(),
            sink: FrameSink::new(shuttle),
        })
        .state_changed(on_state)
        .param_changed(|_, data, id, param| {
            let Some(param) = param else {
                return;
            };
            if id != ParamType::Format.as_raw() {
                return;
            }
            let Ok((media_type, media_subtype)) = format_utils::parse_format(param) else {
                return;
            };
            if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
                return;
            }
            if let Err(e) = data.info.parse(param) {
                warn!("unparseable video format: {:?}", e);
                return;
            }

            let size = data.info.size();
            match pixel_format(data.info.format()) {
                Some(format) => data.sink.set_format(format, size.width, size.height),
                None => {
                    warn!("unsupported screencast format {:?}", data.info.format());
                    data.sink.clear_format();
                }
            }
        })
        .process(|stream, data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            let Some(plane) = datas.first_mut() else {
                return;
            };
            let chunk = plane.chunk();
            let (offset, size, stride) = (chunk.offset() as usize, chunk.size() as usize, chunk.stride());
            let Some(bytes) = plane.data() else {
                return;
            };
            let end = offset.saturating_add(size).min(bytes.len());
            let start = offset.min(end);
            data.sink.push(&bytes[start..end], stride);
        })
        .register()?;

    let offer = format_offer(limits)?;
    let offer = Pod::from_bytes(&offer).ok_or_else(|| RpcError::PipeWire("malformed format offer".into()))?;
    stream.connect(
        Direction::Input,
        Some(node_id),
        StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
        &mut [offer],
    )?;
    info!("Connected to screencast node {}", node_id);

    let timer = mainloop.loop_().add_timer({
        let mainloop = mainloop.clone();
        move |_| {
            if stop.load(Ordering::Acquire) {
                mainloop.quit();
            }
        }
    });
    timer
        .update_timer(Some(STOP_POLL), Some(STOP_POLL))
        .into_result()
        .map_err(pw_error)?;

    mainloop.run();

    if let Err(e) = stream.disconnect() {
        warn!("stream disconnect failed: {}", e);
    }
    info!("Screencast stream closed");
    if failed.get() {
        return Err(RpcError::PipeWire("stream entered error state".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_pushed_before_format() {
        let shuttle = Arc::new(FrameShuttle::new(2, 2));
        let mut sink = FrameSink::new(Arc::clone(&shuttle));
        assert_eq!(sink.push(&[0; 16], 8), None);
        assert!(shuttle.consumer_try_swap().is_none());
    }

    #[test]
    fn test_bgrx_with_padded_stride() {
        let shuttle = Arc::new(FrameShuttle::new(1, 1));
        let mut sink = FrameSink::new(Arc::clone(&shuttle));
        sink.set_format(PixelFormat::Bgrx, 2, 2);

        // Two BGRx pixels per row plus four bytes of padding.
        let frame = [
            1, 2, 3, 0, 4, 5, 6, 0, 9, 9, 9, 9, //
            7, 8, 9, 0, 10, 11, 12, 0, 9, 9, 9, 9,
        ];
        assert_eq!(sink.push(&frame, 12), Some(Conversion::Converted));

        let front = shuttle.consumer_try_swap().unwrap();
        assert!(front.dims_changed);
        assert_eq!(front.surface.pixel(0, 0), Some([3, 2, 1]));
        assert_eq!(front.surface.pixel(1, 1), Some([12, 11, 10]));
    }

    #[test]
    fn test_resize_flags_texture_respecification() {
        let shuttle = Arc::new(FrameShuttle::new(1, 1));
        let mut sink = FrameSink::new(Arc::clone(&shuttle));

        sink.set_format(PixelFormat::Rgbx, 1, 1);
        sink.push(&[10, 20, 30, 0], 0);
        assert!(shuttle.consumer_try_swap().unwrap().dims_changed);

        sink.push(&[10, 20, 30, 0], 0);
        assert!(!shuttle.consumer_try_swap().unwrap().dims_changed);

        sink.set_format(PixelFormat::Rgbx, 2, 1);
        sink.push(&[1, 2, 3, 0, 4, 5, 6, 0], 0);
        let front = shuttle.consumer_try_swap().unwrap();
        assert!(front.dims_changed);
        assert_eq!(front.surface.pixel(1, 0), Some([4, 5, 6]));
    }

    #[test]
    fn test_short_buffer_yields_pattern() {
        let shuttle = Arc::new(FrameShuttle::new(1, 1));
        let mut sink = FrameSink::new(shuttle);
        sink.set_format(PixelFormat::Rgba, 4, 4);
        assert_eq!(sink.push(&[0; 8], 16), Some(Conversion::Pattern));
    }

    #[test]
    fn test_supported_video_formats() {
        assert_eq!(pixel_format(VideoFormat::RGBx), Some(PixelFormat::Rgbx));
        assert_eq!(pixel_format(VideoFormat::BGRx), Some(PixelFormat::Bgrx));
        assert_eq!(pixel_format(VideoFormat::NV12), None);
    }
}
