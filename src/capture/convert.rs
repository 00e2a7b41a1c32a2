//! CPU pixel conversion into packed RGB888.
//!
//! Every converter writes into a caller-owned buffer and never fails: when the
//! input cannot be converted the gradient test pattern is written instead and
//! [`Conversion::Pattern`] is returned.

use std::time::Instant;

use jpeg_decoder::{Decoder, PixelFormat as JpegFormat};
use tracing::warn;

use super::frame::{rgb_len, CaptureDescriptor, PixelFormat, Surface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Converted,
    /// The test pattern was written instead.
    Pattern,
}

/// Channel order of four-byte packed pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[inline]
fn clip(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range YUV to RGB with integer coefficients.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clip((298 * c + 409 * e + 128) >> 8),
        clip((298 * c - 100 * d - 208 * e + 128) >> 8),
        clip((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Gradient used whenever a real frame is unavailable.
pub fn fill_test_pattern(rgb: &mut [u8], width: u32, height: u32) {
    let w = width as usize;
    let pixels = w * height as usize;
    for (i, px) in rgb.chunks_exact_mut(3).take(pixels).enumerate() {
        let (x, y) = (i % w, i / w);
        px[0] = ((x + y) % 256) as u8;
        px[1] = ((2 * x + y) % 256) as u8;
        px[2] = ((3 * x + y) % 256) as u8;
    }
}

fn pattern(rgb: &mut [u8], width: u32, height: u32) -> Conversion {
    fill_test_pattern(rgb, width, height);
    Conversion::Pattern
}

/// Row pitch in bytes; zero means rows are packed back to back.
fn pitch(stride: usize, packed: usize) -> usize {
    if stride == 0 {
        packed
    } else {
        stride
    }
}

/// Bytes spanned by `rows` lines of `line` bytes spaced `pitch` apart.
fn span(pitch: usize, line: usize, rows: usize) -> usize {
    if rows == 0 {
        0
    } else {
        pitch * (rows - 1) + line
    }
}

/// NV24 with separate luma and interleaved chroma planes. `strides` holds
/// the bytes per line of each plane, zero for packed rows.
pub fn nv24_to_rgb(
    y_plane: &[u8],
    uv_plane: &[u8],
    strides: [usize; 2],
    rgb: &mut [u8],
    width: u32,
    height: u32,
) -> Conversion {
    let (w, h) = (width as usize, height as usize);
    let y_pitch = pitch(strides[0], w);
    let uv_pitch = pitch(strides[1], w * 2);
    if y_pitch < w
        || uv_pitch < w * 2
        || rgb.len() < w * h * 3
        || y_plane.len() < span(y_pitch, w, h)
        || uv_plane.len() < span(uv_pitch, w * 2, h)
    {
        warn!(
            "NV24: short planes for {}x{} (y={}, uv={}, strides {}/{})",
            width,
            height,
            y_plane.len(),
            uv_plane.len(),
            y_pitch,
            uv_pitch
        );
        return pattern(rgb, width, height);
    }

    for row in 0..h {
        let luma = &y_plane[row * y_pitch..row * y_pitch + w];
        let chroma = &uv_plane[row * uv_pitch..row * uv_pitch + w * 2];
        let out = &mut rgb[row * w * 3..(row + 1) * w * 3];
        for ((px, &y), uv) in out.chunks_exact_mut(3).zip(luma).zip(chroma.chunks_exact(2)) {
            px.copy_from_slice(&yuv_to_rgb(y, uv[0], uv[1]));
        }
    }
    Conversion::Converted
}

/// NV24 delivered in one plane: luma first, then chroma lines twice as wide,
/// starting at `stride * height`.
pub fn nv24_packed_to_rgb(plane: &[u8], stride: usize, rgb: &mut [u8], width: u32, height: u32) -> Conversion {
    let y_pitch = pitch(stride, width as usize);
    let luma_len = y_pitch * height as usize;
    if plane.len() < luma_len {
        warn!("NV24: single plane of {} bytes is too short", plane.len());
        return pattern(rgb, width, height);
    }
    let (y_plane, uv_plane) = plane.split_at(luma_len);
    nv24_to_rgb(y_plane, uv_plane, [y_pitch, y_pitch * 2], rgb, width, height)
}

fn yuyv_to_packed(
    yuyv: &[u8],
    bytesused: usize,
    stride: usize,
    out: &mut [u8],
    width: u32,
    height: u32,
    order: ChannelOrder,
) -> Conversion {
    let (w, h) = (width as usize, height as usize);
    let line = w * 2;
    let stride = pitch(stride, line);
    let needed = span(stride, line, h);
    let available = bytesused.min(yuyv.len());
    if stride < line || available < needed || out.len() < w * h * 3 {
        warn!(
            "YUYV: not enough data for {}x{} (stride {}, expected {}, got {})",
            width, height, stride, needed, available
        );
        return pattern(out, width, height);
    }

    let put = |px: &mut [u8], rgb: [u8; 3]| match order {
        ChannelOrder::Rgb => px.copy_from_slice(&rgb),
        ChannelOrder::Bgr => {
            px[0] = rgb[2];
            px[1] = rgb[1];
            px[2] = rgb[0];
        }
    };

    for row in 0..h {
        let src = &yuyv[row * stride..row * stride + line];
        let dst = &mut out[row * w * 3..(row + 1) * w * 3];
        for (x, group) in (0..w).step_by(2).zip(src.chunks(4)) {
            // An odd width leaves a trailing half group.
            let (y0, u, y1, v) = match *group {
                [y0, u, y1, v] => (y0, u, y1, v),
                [y0, u] => (y0, u, 0, 128),
                _ => continue,
            };
            put(&mut dst[x * 3..x * 3 + 3], yuv_to_rgb(y0, u, v));
            if x + 1 < w {
                put(&mut dst[x * 3 + 3..x * 3 + 6], yuv_to_rgb(y1, u, v));
            }
        }
    }
    Conversion::Converted
}

/// YUYV 4:2:2 to RGB. `bytesused` is what the device reported for the
/// buffer and `stride` its bytes per line (zero when rows are packed).
pub fn yuyv_to_rgb(
    yuyv: &[u8],
    bytesused: usize,
    stride: usize,
    rgb: &mut [u8],
    width: u32,
    height: u32,
) -> Conversion {
    yuyv_to_packed(yuyv, bytesused, stride, rgb, width, height, ChannelOrder::Rgb)
}

/// YUYV 4:2:2 to BGR, same length rules as [`yuyv_to_rgb`].
pub fn yuyv_to_bgr(
    yuyv: &[u8],
    bytesused: usize,
    stride: usize,
    bgr: &mut [u8],
    width: u32,
    height: u32,
) -> Conversion {
    yuyv_to_packed(yuyv, bytesused, stride, bgr, width, height, ChannelOrder::Bgr)
}

/// Decode one MJPEG buffer. Anything but an exact `width x height` image
/// yields the test pattern.
pub fn mjpeg_to_rgb(jpeg: &[u8], rgb: &mut [u8], width: u32, height: u32) -> Conversion {
    let mut decoder = Decoder::new(jpeg);
    let pixels = match decoder.decode() {
        Ok(p) => p,
        Err(e) => {
            warn!("MJPEG: decode failed: {}", e);
            return pattern(rgb, width, height);
        }
    };
    let Some(info) = decoder.info() else {
        return pattern(rgb, width, height);
    };

    if info.width as u32 != width || info.height as u32 != height {
        warn!(
            "MJPEG: decoded {}x{}, expected {}x{}",
            info.width, info.height, width, height
        );
        return pattern(rgb, width, height);
    }

    let len = rgb_len(width, height);
    if rgb.len() < len {
        return pattern(rgb, width, height);
    }

    match info.pixel_format {
        JpegFormat::RGB24 if pixels.len() >= len => {
            rgb[..len].copy_from_slice(&pixels[..len]);
        }
        JpegFormat::L8 if pixels.len() * 3 >= len => {
            for (px, &l) in rgb[..len].chunks_exact_mut(3).zip(&pixels) {
                px.fill(l);
            }
        }
        other => {
            warn!("MJPEG: unsupported decoded format {:?}", other);
            return pattern(rgb, width, height);
        }
    }
    Conversion::Converted
}

/// Four-byte packed pixels (RGBx, RGBA, BGRx) with row `stride` to RGB.
pub fn packed32_to_rgb(
    src: &[u8],
    stride: usize,
    order: ChannelOrder,
    rgb: &mut [u8],
    width: u32,
    height: u32,
) -> Conversion {
    let (w, h) = (width as usize, height as usize);
    let stride = if stride == 0 { w * 4 } else { stride };
    let needed = if h == 0 { 0 } else { stride * (h - 1) + w * 4 };
    if stride < w * 4 || src.len() < needed || rgb.len() < w * h * 3 {
        warn!(
            "packed frame too short for {}x{} (stride {}, {} bytes)",
            width,
            height,
            stride,
            src.len()
        );
        return pattern(rgb, width, height);
    }

    for row in 0..h {
        let line = &src[row * stride..row * stride + w * 4];
        let out = &mut rgb[row * w * 3..(row + 1) * w * 3];
        for (dst, px) in out.chunks_exact_mut(3).zip(line.chunks_exact(4)) {
            match order {
                ChannelOrder::Rgb => dst.copy_from_slice(&px[..3]),
                ChannelOrder::Bgr => {
                    dst[0] = px[2];
                    dst[1] = px[1];
                    dst[2] = px[0];
                }
            }
        }
    }
    Conversion::Converted
}

/// Convert one captured buffer into `surface` according to `desc`.
///
/// `planes` holds each plane already trimmed to its used bytes.
pub fn convert_into(
    desc: &CaptureDescriptor,
    planes: &[&[u8]],
    surface: &mut Surface,
    test_pattern: bool,
) -> Conversion {
    let started = Instant::now();
    let (w, h) = (desc.width, desc.height);
    let [stride, uv_stride] = desc.strides.map(|s| s as usize);
    surface.resize(w, h);
    let out = &mut surface.data[..];

    let result = if test_pattern {
        pattern(out, w, h)
    } else {
        match (desc.format, planes) {
            (PixelFormat::Nv24, [y, uv]) => nv24_to_rgb(y, uv, [stride, uv_stride], out, w, h),
            (PixelFormat::Nv24, [single]) => nv24_packed_to_rgb(single, stride, out, w, h),
            (PixelFormat::Yuyv, [data, ..]) => yuyv_to_rgb(data, data.len(), stride, out, w, h),
            (PixelFormat::Mjpeg, [data, ..]) => mjpeg_to_rgb(data, out, w, h),
            (PixelFormat::Rgbx | PixelFormat::Rgba, [data, ..]) => {
                packed32_to_rgb(data, stride, ChannelOrder::Rgb, out, w, h)
            }
            (PixelFormat::Bgrx, [data, ..]) => packed32_to_rgb(data, stride, ChannelOrder::Bgr, out, w, h),
            (format, planes) => {
                warn!("{}: unexpected plane count {}", format, planes.len());
                pattern(out, w, h)
            }
        }
    };

    metrics::histogram!("visor_convert_time_us").record(started.elapsed().as_micros() as f64);
    if result == Conversion::Pattern {
        metrics::counter!("visor_frames_fallback").increment(1);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PlaneLayout;
    use proptest::prelude::*;

    #[test]
    fn test_yuv_reference_points() {
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
        // Limited-range white saturates to full white with these coefficients.
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_rgb(81, 90, 240), [255, 0, 0]);
        assert_eq!(yuv_to_rgb(0, 0, 0), [0, 135, 0]);
        assert_eq!(yuv_to_rgb(255, 255, 255), [255, 125, 255]);
    }

    #[test]
    fn test_nv24_two_planes() {
        let y = [235, 16, 81, 235];
        let uv = [128, 128, 128, 128, 90, 240, 128, 128];
        let mut rgb = [0u8; 12];
        assert_eq!(nv24_to_rgb(&y, &uv, [0, 0], &mut rgb, 2, 2), Conversion::Converted);
        assert_eq!(&rgb[0..3], &[255, 255, 255]);
        assert_eq!(&rgb[3..6], &[0, 0, 0]);
        assert_eq!(&rgb[6..9], &[255, 0, 0]);
    }

    #[test]
    fn test_nv24_single_plane_reads_uv_after_luma() {
        let plane = [81, 16, 90, 240, 128, 128];
        let mut rgb = [0u8; 6];
        assert_eq!(nv24_packed_to_rgb(&plane, 0, &mut rgb, 2, 1), Conversion::Converted);
        assert_eq!(rgb, [255, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_nv24_short_uv_falls_back() {
        let mut rgb = [0u8; 12];
        assert_eq!(nv24_to_rgb(&[16; 4], &[128; 6], [0, 0], &mut rgb, 2, 2), Conversion::Pattern);
        assert_eq!(&rgb[3..6], &[1, 2, 3]);
    }

    #[test]
    fn test_yuyv_rgb_and_bgr_share_chroma() {
        let yuyv = [81, 90, 81, 240];
        let mut rgb = [0u8; 6];
        assert_eq!(yuyv_to_rgb(&yuyv, 4, 0, &mut rgb, 2, 1), Conversion::Converted);
        assert_eq!(rgb, [255, 0, 0, 255, 0, 0]);

        let mut bgr = [0u8; 6];
        assert_eq!(yuyv_to_bgr(&yuyv, 4, 0, &mut bgr, 2, 1), Conversion::Converted);
        assert_eq!(bgr, [0, 0, 255, 0, 0, 255]);
    }

    #[test]
    fn test_yuyv_short_bytesused_emits_pattern() {
        let yuyv = [16u8; 16];
        let mut rgb = [0u8; 24];
        assert_eq!(yuyv_to_rgb(&yuyv, 15, 0, &mut rgb, 4, 2), Conversion::Pattern);
        let mut expected = [0u8; 24];
        fill_test_pattern(&mut expected, 4, 2);
        assert_eq!(rgb, expected);

        let mut bgr = [0u8; 24];
        assert_eq!(yuyv_to_bgr(&yuyv, 15, 0, &mut bgr, 4, 2), Conversion::Pattern);
    }

    #[test]
    fn test_yuyv_skips_row_padding() {
        // 2x2 with 4 bytes per line = 8 bytes of payload + 4 of padding.
        let yuyv = [
            81, 90, 81, 240, 0xEE, 0xEE, 0xEE, 0xEE, //
            235, 128, 16, 128, 0xEE, 0xEE, 0xEE, 0xEE,
        ];
        let mut rgb = [0u8; 12];
        assert_eq!(yuyv_to_rgb(&yuyv, yuyv.len(), 8, &mut rgb, 2, 2), Conversion::Converted);
        assert_eq!(rgb, [255, 0, 0, 255, 0, 0, 255, 255, 255, 0, 0, 0]);

        // The last line may omit its padding.
        assert_eq!(yuyv_to_rgb(&yuyv, 12, 8, &mut rgb, 2, 2), Conversion::Converted);
        assert_eq!(yuyv_to_rgb(&yuyv, 11, 8, &mut rgb, 2, 2), Conversion::Pattern);
        // A stride shorter than a line is rejected.
        assert_eq!(yuyv_to_rgb(&yuyv, yuyv.len(), 2, &mut rgb, 2, 2), Conversion::Pattern);
    }

    #[test]
    fn test_nv24_skips_row_padding() {
        // 1x2 image, luma lines of 4 bytes, chroma lines of 4 bytes.
        let y = [81, 0xEE, 0xEE, 0xEE, 235, 0xEE, 0xEE, 0xEE];
        let uv = [90, 240, 0xEE, 0xEE, 128, 128, 0xEE, 0xEE];
        let mut rgb = [0u8; 6];
        assert_eq!(nv24_to_rgb(&y, &uv, [4, 4], &mut rgb, 1, 2), Conversion::Converted);
        assert_eq!(rgb, [255, 0, 0, 255, 255, 255]);

        // Single plane: chroma starts after `stride * height` luma bytes.
        let plane = [
            81, 0xEE, 235, 0xEE, //
            90, 240, 0xEE, 0xEE, 128, 128, 0xEE, 0xEE,
        ];
        assert_eq!(nv24_packed_to_rgb(&plane, 2, &mut rgb, 1, 2), Conversion::Converted);
        assert_eq!(rgb, [255, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_convert_into_uses_descriptor_stride() {
        let desc = CaptureDescriptor {
            width: 2,
            height: 2,
            format: PixelFormat::Yuyv,
            layout: PlaneLayout::Single,
            strides: [8, 0],
        };
        let padded = [
            235, 128, 235, 128, 235, 128, 235, 128, //
            16, 128, 16, 128, 0xEE, 0xEE, 0xEE, 0xEE,
        ];
        let mut surface = Surface::new(2, 2);
        assert_eq!(convert_into(&desc, &[&padded], &mut surface, false), Conversion::Converted);
        assert_eq!(surface.pixel(1, 0), Some([255, 255, 255]));
        assert_eq!(surface.pixel(0, 1), Some([0, 0, 0]));
    }

    #[test]
    fn test_pattern_values() {
        let mut rgb = [0u8; 3 * 300 * 2];
        fill_test_pattern(&mut rgb, 300, 2);
        let at = |x: usize, y: usize| {
            let i = (y * 300 + x) * 3;
            [rgb[i], rgb[i + 1], rgb[i + 2]]
        };
        assert_eq!(at(0, 0), [0, 0, 0]);
        assert_eq!(at(1, 1), [2, 3, 4]);
        assert_eq!(at(200, 1), [201, 145, 89]);
    }

    #[test]
    fn test_packed32_honours_stride_and_order() {
        // 2x2 with 4 bytes of row padding.
        let src = [
            10, 20, 30, 0, 40, 50, 60, 0, 9, 9, 9, 9, //
            70, 80, 90, 0, 100, 110, 120, 0, 9, 9, 9, 9,
        ];
        let mut rgb = [0u8; 12];
        packed32_to_rgb(&src, 12, ChannelOrder::Rgb, &mut rgb, 2, 2);
        assert_eq!(rgb, [10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120]);

        packed32_to_rgb(&src, 12, ChannelOrder::Bgr, &mut rgb, 2, 2);
        assert_eq!(&rgb[..3], &[30, 20, 10]);

        assert_eq!(
            packed32_to_rgb(&src[..19], 12, ChannelOrder::Rgb, &mut rgb, 2, 2),
            Conversion::Pattern
        );
    }

    #[test]
    fn test_mjpeg_garbage_falls_back() {
        let mut rgb = [0u8; 12];
        assert_eq!(mjpeg_to_rgb(&[0xFF, 0xD8, 0x00], &mut rgb, 2, 2), Conversion::Pattern);
        assert_eq!(&rgb[3..6], &[1, 2, 3]);
    }

    #[test]
    fn test_convert_into_resizes_surface() {
        let desc = CaptureDescriptor {
            width: 2,
            height: 1,
            format: PixelFormat::Yuyv,
            layout: PlaneLayout::Single,
            strides: [0, 0],
        };
        let mut surface = Surface::new(8, 8);
        let yuyv = [235, 128, 16, 128];
        assert_eq!(convert_into(&desc, &[&yuyv], &mut surface, false), Conversion::Converted);
        assert_eq!((surface.width, surface.height), (2, 1));
        assert_eq!(surface.data, vec![255, 255, 255, 0, 0, 0]);

        assert_eq!(convert_into(&desc, &[&yuyv], &mut surface, true), Conversion::Pattern);
    }

    proptest! {
        #[test]
        fn prop_converters_never_panic(
            w in 1u32..16,
            h in 1u32..16,
            input in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let len = (w * h * 3) as usize;
            let mut rgb = vec![0u8; len];
            nv24_packed_to_rgb(&input, 0, &mut rgb, w, h);
            yuyv_to_rgb(&input, input.len(), 0, &mut rgb, w, h);
            yuyv_to_bgr(&input, input.len(), (w * 2 + 6) as usize, &mut rgb, w, h);
            packed32_to_rgb(&input, 0, ChannelOrder::Bgr, &mut rgb, w, h);
            mjpeg_to_rgb(&input, &mut rgb, w, h);
            prop_assert_eq!(rgb.len(), len);
        }

        #[test]
        fn prop_nv24_components_in_range(y in any::<u8>(), u in any::<u8>(), v in any::<u8>()) {
            let mut rgb = [0u8; 3];
            prop_assert_eq!(nv24_to_rgb(&[y], &[u, v], [0, 0], &mut rgb, 1, 1), Conversion::Converted);
            prop_assert_eq!(rgb, yuv_to_rgb(y, u, v));
        }
    }
}
