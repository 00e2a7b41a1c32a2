//! Multi-plane streaming, which `v4l`'s mmap stream does not cover. The
//! kernel structs come from `v4l::v4l_sys`; the ioctls go through nix.

use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::ptr::NonNull;

use libc::c_int;
use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::format::FieldOrder;
use v4l::memory::Memory;
use v4l::v4l_sys::{v4l2_buffer, v4l2_format, v4l2_plane, v4l2_requestbuffers, VIDEO_MAX_PLANES};

use super::MAX_PLANES;
use crate::capture::frame::{CaptureDescriptor, PixelFormat, PlaneLayout};
use crate::error::{Result, TransportError, VisorError};

nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);

const KERNEL_PLANES: usize = VIDEO_MAX_PLANES as usize;
const BUF_TYPE: u32 = Type::VideoCaptureMplane as u32;

type PlaneArray = [v4l2_plane; KERNEL_PLANES];

fn zeroed<T>() -> T {
    // SAFETY: only used for plain-old-data kernel structs; all-zero is valid.
    unsafe { std::mem::zeroed() }
}

fn io_error(e: Errno) -> VisorError {
    VisorError::Transport(TransportError::Io(e.into()))
}

/// `S_FMT` on the multi-plane buffer type. `None` when the driver refuses
/// or substitutes another format.
pub(super) fn set_format(fd: RawFd, format: PixelFormat, width: u32, height: u32) -> Option<CaptureDescriptor> {
    let mut fmt: v4l2_format = zeroed();
    fmt.type_ = BUF_TYPE;
    // SAFETY: zeroed union, every member is plain data.
    let mut pix = unsafe { fmt.fmt.pix_mp };
    pix.width = width;
    pix.height = height;
    pix.pixelformat = format.fourcc_u32();
    pix.field = FieldOrder::Progressive as u32;
    pix.num_planes = MAX_PLANES as u8;
    fmt.fmt.pix_mp = pix;

    // SAFETY: `fmt` is a valid v4l2_format for this fd.
    if let Err(e) = unsafe { vidioc_s_fmt(fd, &mut fmt) } {
        debug!("S_FMT {}-MPLANE failed: {}", format, e);
        return None;
    }
    // SAFETY: the kernel filled the pix_mp member.
    let pix = unsafe { fmt.fmt.pix_mp };
    let (fourcc, planes) = (pix.pixelformat, pix.num_planes);
    if fourcc != format.fourcc_u32() || !(1..=MAX_PLANES as u8).contains(&planes) {
        debug!("S_FMT {}-MPLANE answered {:08X} with {} planes", format, fourcc, planes);
        return None;
    }
    let plane_fmt = pix.plane_fmt;
    let mut strides = [0; MAX_PLANES];
    for (stride, plane) in strides.iter_mut().zip(&plane_fmt[..planes as usize]) {
        *stride = plane.bytesperline;
    }
    Some(CaptureDescriptor {
        width: pix.width,
        height: pix.height,
        format,
        layout: PlaneLayout::Multi(planes),
        strides,
    })
}

struct MappedPlane {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// SAFETY: the mapping is owned by exactly one stream and only read from the
// thread currently running it.
unsafe impl Send for MappedPlane {}

impl MappedPlane {
    fn map(fd: RawFd, len: u32, offset: u32) -> Result<Self> {
        let length = NonZeroUsize::new(len as usize).ok_or_else(|| io_error(Errno::EINVAL))?;
        // SAFETY: `fd` stays open for the lifetime of the owning capture.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        // SAFETY: fresh shared mapping of a kernel buffer; unmapped in Drop.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        }
        .map_err(io_error)?;
        Ok(Self {
            ptr,
            len: len as usize,
        })
    }

    fn bytes(&self, start: usize, end: usize) -> &[u8] {
        let end = end.min(self.len);
        let start = start.min(end);
        // SAFETY: the range lies inside the mapping, which outlives `&self`.
        let all = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) };
        &all[start..end]
    }
}

impl Drop for MappedPlane {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping created in `map`.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap failed: {}", e);
        }
    }
}

/// Used byte range of each plane of a dequeued buffer.
pub(super) struct Dequeued {
    pub index: u32,
    ranges: [(usize, usize); MAX_PLANES],
}

/// Memory-mapped multi-plane buffer pool on an open device node.
pub(super) struct MplaneStream {
    fd: RawFd,
    name: String,
    plane_count: usize,
    buffers: Vec<Vec<MappedPlane>>,
    streaming: bool,
}

impl MplaneStream {
    /// Request `count` buffers, map every plane and queue them all.
    pub fn new(fd: RawFd, name: &str, plane_count: usize, count: u32) -> Result<Self> {
        let mut stream = Self {
            fd,
            name: name.to_owned(),
            plane_count: plane_count.min(MAX_PLANES),
            buffers: Vec::new(),
            streaming: false,
        };

        let mut req: v4l2_requestbuffers = zeroed();
        req.count = count;
        req.type_ = BUF_TYPE;
        req.memory = Memory::Mmap as u32;
        // SAFETY: `req` is a valid v4l2_requestbuffers for this fd.
        unsafe { vidioc_reqbufs(fd, &mut req) }.map_err(io_error)?;
        if req.count == 0 {
            return Err(io_error(Errno::ENOMEM));
        }
        if req.count < count {
            warn!("{}: driver granted {} of {} buffers", name, req.count, count);
        }

        for index in 0..req.count {
            let mut planes: PlaneArray = zeroed();
            let mut buf = blank_buffer(index, &mut planes);
            // SAFETY: `buf` and `planes` outlive the call.
            unsafe { vidioc_querybuf(fd, &mut buf) }.map_err(io_error)?;

            let mapped = planes[..(buf.length as usize).min(stream.plane_count)]
                .iter()
                // SAFETY: mem_offset is the member QUERYBUF fills for MMAP.
                .map(|p| MappedPlane::map(fd, p.length, unsafe { p.m.mem_offset }))
                .collect::<Result<Vec<_>>>()?;
            stream.buffers.push(mapped);
            stream.queue(index)?;
        }
        info!("{}: mapped {} multi-plane buffers", name, stream.buffers.len());
        Ok(stream)
    }

    pub fn queue(&self, index: u32) -> Result<()> {
        let mut planes: PlaneArray = zeroed();
        let mut buf = blank_buffer(index, &mut planes);
        buf.length = self.plane_count as u32;
        // SAFETY: `buf` and `planes` outlive the call.
        unsafe { vidioc_qbuf(self.fd, &mut buf) }.map_err(io_error)?;
        Ok(())
    }

    /// `None` when no buffer is ready yet.
    pub fn dequeue(&self) -> Result<Option<Dequeued>> {
        let mut planes: PlaneArray = zeroed();
        let mut buf = blank_buffer(0, &mut planes);
        // SAFETY: `buf` and `planes` outlive the call.
        match unsafe { vidioc_dqbuf(self.fd, &mut buf) } {
            Ok(_) => {}
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(io_error(e)),
        }

        let mut ranges = [(0, 0); MAX_PLANES];
        for (range, plane) in ranges.iter_mut().zip(&planes[..self.plane_count]) {
            *range = (plane.data_offset as usize, plane.bytesused as usize);
        }
        Ok(Some(Dequeued {
            index: buf.index,
            ranges,
        }))
    }

    /// Used bytes of each plane of `frame`.
    pub fn planes(&self, frame: &Dequeued) -> std::result::Result<Vec<&[u8]>, TransportError> {
        let mapped = self
            .buffers
            .get(frame.index as usize)
            .ok_or(TransportError::UnknownBuffer {
                index: frame.index,
                pool: self.buffers.len(),
            })?;
        Ok(mapped
            .iter()
            .zip(&frame.ranges)
            .map(|(plane, &(start, end))| plane.bytes(start, end))
            .collect())
    }

    pub fn stream_on(&mut self) -> Result<()> {
        let kind = BUF_TYPE as c_int;
        // SAFETY: STREAMON reads one int.
        unsafe { vidioc_streamon(self.fd, &kind) }.map_err(io_error)?;
        self.streaming = true;
        info!("{}: streaming", self.name);
        Ok(())
    }

    pub fn stream_off(&mut self) {
        if !self.streaming {
            return;
        }
        let kind = BUF_TYPE as c_int;
        // SAFETY: STREAMOFF reads one int.
        if let Err(e) = unsafe { vidioc_streamoff(self.fd, &kind) } {
            warn!("{}: STREAMOFF failed: {}", self.name, e);
        }
        self.streaming = false;
    }
}

impl Drop for MplaneStream {
    fn drop(&mut self) {
        self.stream_off();
        debug!("{}: releasing {} buffers", self.name, self.buffers.len());
    }
}

fn blank_buffer(index: u32, planes: &mut PlaneArray) -> v4l2_buffer {
    let mut buf: v4l2_buffer = zeroed();
    buf.index = index;
    buf.type_ = BUF_TYPE;
    buf.memory = Memory::Mmap as u32;
    buf.m.planes = planes.as_mut_ptr();
    buf.length = KERNEL_PLANES as u32;
    buf
}
