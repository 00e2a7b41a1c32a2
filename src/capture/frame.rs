use serde::{Deserialize, Serialize};

/// Pixel formats a capture source can hand to the converters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4:4:4 two-plane YUV, full-resolution interleaved UV.
    Nv24,
    /// 4:2:2 packed `Y0 U Y1 V`.
    Yuyv,
    Mjpeg,
    /// Four bytes per pixel, first three R G B.
    Rgbx,
    Rgba,
    /// Four bytes per pixel, first three B G R.
    Bgrx,
}

impl PixelFormat {
    /// V4L2 fourcc code.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Nv24 => *b"NV24",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Rgbx => *b"XB24",
            PixelFormat::Rgba => *b"AB24",
            PixelFormat::Bgrx => *b"XR24",
        }
    }

    pub fn fourcc_u32(self) -> u32 {
        u32::from_le_bytes(self.fourcc())
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        match &code {
            b"NV24" => Some(PixelFormat::Nv24),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Nv24 => "NV24",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Rgbx => "RGBx",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgrx => "BGRx",
        };
        f.write_str(name)
    }
}

/// How the kernel lays out one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneLayout {
    /// Classic single-plane buffer type.
    Single,
    /// Multi-plane buffer type with this many planes.
    Multi(u8),
}

impl PlaneLayout {
    pub fn plane_count(self) -> usize {
        match self {
            PlaneLayout::Single => 1,
            PlaneLayout::Multi(n) => n as usize,
        }
    }
}

/// Negotiated capture format. The dimensions are whatever the source settled
/// on, not what was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub layout: PlaneLayout,
    /// Bytes per line of the first two planes; zero when rows are packed.
    pub strides: [u32; 2],
}

impl CaptureDescriptor {
    pub fn rgb_len(&self) -> usize {
        rgb_len(self.width, self.height)
    }
}

/// Bytes in a packed RGB888 image.
pub fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Top-down RGB888 image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; rgb_len(width, height)],
        }
    }

    /// Resize in place, keeping the allocation where possible.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data.resize(rgb_len(width, height), 0);
    }

    pub fn fill(&mut self, rgb: [u8; 3]) {
        for px in self.data.chunks_exact_mut(3) {
            px.copy_from_slice(&rgb);
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        self.data.get(i..i + 3).map(|p| [p[0], p[1], p[2]])
    }
}
