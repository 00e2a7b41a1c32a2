//! HID endpoints for the glasses.
//!
//! The glasses expose two HID interfaces on the same vendor id: the MCU
//! interface carries command replies and events, the IMU interface streams
//! orientation reports. Each reader thread owns its own handle; commands are
//! written through a second handle opened on the MCU path so the reader never
//! has to share its device.

use hidapi::{HidApi, HidDevice};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::glasses::frame::PACKET_SIZE;

/// A blocking, bidirectional HID report carrier.
pub trait HidEndpoint: Send {
    /// Read one report. `Ok(None)` means the timeout elapsed with no data.
    fn read_timeout(
        &mut self,
        buf: &mut [u8],
        timeout_ms: i32,
    ) -> Result<Option<usize>, TransportError>;

    /// Write one report, returning the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;
}

/// The three handles the command engine needs.
pub struct GlassesEndpoints {
    pub mcu_reader: Box<dyn HidEndpoint>,
    pub mcu_writer: Box<dyn HidEndpoint>,
    pub imu_reader: Box<dyn HidEndpoint>,
}

/// Where to find the glasses on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelector {
    pub vendor_id: u16,
    pub mcu_interface: i32,
    pub imu_interface: i32,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self {
            vendor_id: 0x35CA,
            mcu_interface: 1,
            imu_interface: 0,
        }
    }
}

/// [`HidEndpoint`] backed by an open hidapi device.
pub struct HidapiEndpoint {
    device: HidDevice,
    label: &'static str,
}

impl HidapiEndpoint {
    pub fn new(device: HidDevice, label: &'static str) -> Self {
        Self { device, label }
    }
}

impl HidEndpoint for HidapiEndpoint {
    fn read_timeout(
        &mut self,
        buf: &mut [u8],
        timeout_ms: i32,
    ) -> Result<Option<usize>, TransportError> {
        match self.device.read_timeout(buf, timeout_ms)? {
            0 => Ok(None),
            n => Ok(Some(n)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let written = self.device.write(buf)?;
        if written < buf.len() {
            debug!("{}: short write {}/{}", self.label, written, buf.len());
        }
        Ok(written)
    }
}

/// Find the device path for `interface` among devices with `vendor_id`.
/// Product id is deliberately not filtered.
fn find_interface_path(
    api: &HidApi,
    vendor_id: u16,
    interface: i32,
) -> Result<std::ffi::CString, TransportError> {
    api.device_list()
        .find(|d| d.vendor_id() == vendor_id && d.interface_number() == interface)
        .map(|d| d.path().to_owned())
        .ok_or(TransportError::DeviceNotFound {
            vendor_id,
            interface,
        })
}

/// Enumerate and open both glasses interfaces.
pub fn open_glasses(selector: DeviceSelector) -> Result<GlassesEndpoints, TransportError> {
    let api = HidApi::new()?;

    let mcu_path = find_interface_path(&api, selector.vendor_id, selector.mcu_interface)?;
    let imu_path = find_interface_path(&api, selector.vendor_id, selector.imu_interface)?;

    info!("Opening glasses MCU interface at {:?}", mcu_path);
    let mcu_reader = api.open_path(&mcu_path)?;
    let mcu_writer = api.open_path(&mcu_path)?;

    info!("Opening glasses IMU interface at {:?}", imu_path);
    let imu_reader = api.open_path(&imu_path)?;

    if let Ok(Some(product)) = mcu_reader.get_product_string() {
        info!("Glasses: {}", product);
    }

    Ok(GlassesEndpoints {
        mcu_reader: Box::new(HidapiEndpoint::new(mcu_reader, "mcu")),
        mcu_writer: Box::new(HidapiEndpoint::new(mcu_writer, "mcu-out")),
        imu_reader: Box::new(HidapiEndpoint::new(imu_reader, "imu")),
    })
}

/// Write a whole packet, treating a short write as an error.
pub fn write_packet(
    endpoint: &mut dyn HidEndpoint,
    packet: &[u8; PACKET_SIZE],
) -> Result<(), TransportError> {
    let written = endpoint.write(packet)?;
    if written != PACKET_SIZE {
        return Err(TransportError::ShortWrite {
            written,
            expected: PACKET_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod stub {
    //! In-memory endpoints for exercising the engine without hardware.

    use std::collections::VecDeque;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use super::*;

    /// How the stub MCU answers a written command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Reply {
        /// Echo the packet with the header cmd_id zeroed and `[status]` as payload.
        Echo { status: u8 },
        /// Swallow the command.
        Silent,
    }

    #[derive(Default)]
    struct Queue {
        reports: VecDeque<[u8; PACKET_SIZE]>,
        closed: bool,
        fail_reads: bool,
    }

    /// Shared inbound report queue: the test side pushes, a reader endpoint pops.
    #[derive(Clone, Default)]
    pub struct Wire {
        queue: Arc<(Mutex<Queue>, Condvar)>,
    }

    impl Wire {
        pub fn push(&self, report: [u8; PACKET_SIZE]) {
            let (lock, cv) = &*self.queue;
            lock.lock().unwrap().reports.push_back(report);
            cv.notify_all();
        }

        pub fn fail(&self) {
            let (lock, cv) = &*self.queue;
            lock.lock().unwrap().fail_reads = true;
            cv.notify_all();
        }

        pub fn close(&self) {
            let (lock, cv) = &*self.queue;
            lock.lock().unwrap().closed = true;
            cv.notify_all();
        }

        pub fn reader(&self) -> WireReader {
            WireReader { wire: self.clone() }
        }
    }

    pub struct WireReader {
        wire: Wire,
    }

    impl HidEndpoint for WireReader {
        fn read_timeout(
            &mut self,
            buf: &mut [u8],
            timeout_ms: i32,
        ) -> Result<Option<usize>, TransportError> {
            let (lock, cv) = &*self.wire.queue;
            let guard = lock.lock().unwrap();
            let (mut q, _) = cv
                .wait_timeout_while(guard, Duration::from_millis(timeout_ms as u64), |q| {
                    q.reports.is_empty() && !q.closed && !q.fail_reads
                })
                .unwrap();
            if q.fail_reads {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "stub unplugged",
                )));
            }
            match q.reports.pop_front() {
                Some(report) => {
                    let n = buf.len().min(PACKET_SIZE);
                    buf[..n].copy_from_slice(&report[..n]);
                    Ok(Some(n))
                }
                None => Ok(None),
            }
        }

        fn write(&mut self, _buf: &[u8]) -> Result<usize, TransportError> {
            Err(TransportError::Closed)
        }
    }

    /// Writer endpoint that answers each command on `wire` according to `reply`.
    pub struct EchoWriter {
        pub wire: Wire,
        pub reply: Arc<Mutex<Reply>>,
    }

    impl HidEndpoint for EchoWriter {
        fn read_timeout(
            &mut self,
            _buf: &mut [u8],
            _timeout_ms: i32,
        ) -> Result<Option<usize>, TransportError> {
            Ok(None)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
            if let Reply::Echo { status } = *self.reply.lock().unwrap() {
                self.wire.push(crate::glasses::frame::build(0, &[status]));
            }
            Ok(buf.len())
        }
    }

    /// Build a full endpoint set. Returns the MCU wire, IMU wire and the reply switch.
    pub fn endpoints(reply: Reply) -> (GlassesEndpoints, Wire, Wire, Arc<Mutex<Reply>>) {
        let mcu = Wire::default();
        let imu = Wire::default();
        let reply = Arc::new(Mutex::new(reply));
        let endpoints = GlassesEndpoints {
            mcu_reader: Box::new(mcu.reader()),
            mcu_writer: Box::new(EchoWriter {
                wire: mcu.clone(),
                reply: reply.clone(),
            }),
            imu_reader: Box::new(imu.reader()),
        };
        (endpoints, mcu, imu, reply)
    }
}
