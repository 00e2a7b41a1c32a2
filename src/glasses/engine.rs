//! Synchronous commands over the asynchronous MCU channel.
//!
//! Two reader threads own the inbound handles. The MCU reader routes zero-id
//! packets into the reply slot while an [`CommandEngine::exec`] is waiting and
//! everything else to the event listener; the IMU reader decodes samples and
//! hands them to the IMU listener. Only one command is ever in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ExecError, ProtocolError, TransportError};
use crate::glasses::frame::{self, Parsed, MAGIC_IMU, MAGIC_MCU, PACKET_SIZE};
use crate::glasses::orientation::{ImuSample, OrientationHandle, OrientationTracker};
use crate::glasses::transport::{self, GlassesEndpoints, HidEndpoint};

/// Turn the IMU stream on or off; data `[0|1]`.
pub const CMD_SET_IMU: u16 = 0x15;

/// Status reported when a reply failed its CRC check.
pub const STATUS_CORRUPT: u8 = 0xFE;
/// Status reported when a reply carried no payload.
pub const STATUS_EMPTY: u8 = 0xFF;

/// Reply to a synchronous command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub status: u8,
    pub payload: Vec<u8>,
}

/// Asynchronous MCU message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuEvent {
    pub id: u16,
    pub timestamp: u32,
    pub data: Vec<u8>,
}

pub type EventListener = Box<dyn Fn(&McuEvent) + Send + Sync>;
pub type ImuListener = Box<dyn Fn(&ImuSample) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub exec_timeout: Duration,
    pub read_timeout_ms: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_millis(2000),
            read_timeout_ms: 1000,
        }
    }
}

#[derive(Default)]
struct ReplySlot {
    /// Set just before a command is written. Only zero-id packets read at or
    /// after this instant count as its reply.
    waiting_since: Option<Instant>,
    reply: Option<[u8; PACKET_SIZE]>,
}

impl ReplySlot {
    /// Take `report` as the reply to the waiting command, if it can be one.
    fn accept(&mut self, report: &[u8], received: Instant) -> bool {
        match self.waiting_since {
            Some(since) if received >= since => {
                let mut reply = [0u8; PACKET_SIZE];
                let n = report.len().min(PACKET_SIZE);
                reply[..n].copy_from_slice(&report[..n]);
                self.reply = Some(reply);
                true
            }
            _ => false,
        }
    }
}

struct Shared {
    stop: AtomicBool,
    failed: AtomicBool,
    /// Set when the IMU reader dies; shared with orientation handles.
    imu_lost: Arc<AtomicBool>,
    slot: Mutex<ReplySlot>,
    replied: Condvar,
    event_listener: ArcSwapOption<EventListener>,
    imu_listener: ArcSwapOption<ImuListener>,
}

impl Shared {
    fn fail(&self, reader: &str, e: &TransportError) {
        error!("{} reader failed: {}", reader, e);
        self.failed.store(true, Ordering::Release);
        let _slot = lock(&self.slot);
        self.replied.notify_all();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type Readers = (Box<dyn HidEndpoint>, Box<dyn HidEndpoint>);

pub struct CommandEngine {
    shared: Arc<Shared>,
    config: EngineConfig,
    /// Serialises outbound commands; holds the MCU write handle.
    outbound: Mutex<Option<Box<dyn HidEndpoint>>>,
    /// Reader handles waiting for `start`.
    pending: Mutex<Option<Readers>>,
    /// Reader threads in start order: MCU, IMU.
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CommandEngine {
    pub fn new(endpoints: GlassesEndpoints, config: EngineConfig) -> Self {
        let GlassesEndpoints {
            mcu_reader,
            mcu_writer,
            imu_reader,
        } = endpoints;

        Self {
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                imu_lost: Arc::new(AtomicBool::new(false)),
                slot: Mutex::new(ReplySlot::default()),
                replied: Condvar::new(),
                event_listener: ArcSwapOption::empty(),
                imu_listener: ArcSwapOption::empty(),
            }),
            config,
            outbound: Mutex::new(Some(mcu_writer)),
            pending: Mutex::new(Some((mcu_reader, imu_reader))),
            threads: Mutex::new(Vec::with_capacity(2)),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn both reader threads. Fails if the engine was already started.
    pub fn start(&self) -> Result<(), TransportError> {
        let (mcu, imu) = lock(&self.pending).take().ok_or(TransportError::Closed)?;
        let read_timeout = self.config.read_timeout_ms;

        let shared = self.shared.clone();
        let mcu_thread = std::thread::Builder::new()
            .name("visor-mcu".into())
            .spawn(move || mcu_reader_loop(mcu, shared, read_timeout))?;

        let shared = self.shared.clone();
        let imu_thread = match std::thread::Builder::new()
            .name("visor-imu".into())
            .spawn(move || imu_reader_loop(imu, shared, read_timeout))
        {
            Ok(t) => t,
            Err(e) => {
                self.shared.stop.store(true, Ordering::Release);
                let _ = mcu_thread.join();
                return Err(e.into());
            }
        };

        lock(&self.threads).extend([mcu_thread, imu_thread]);
        self.running.store(true, Ordering::Release);
        info!("Glasses command engine started");
        Ok(())
    }

    /// Signal the readers, join IMU then MCU, and release the write handle.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let _slot = lock(&self.shared.slot);
            self.shared.replied.notify_all();
        }

        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in threads.into_iter().rev() {
            let name = handle.thread().name().unwrap_or("reader").to_owned();
            if handle.join().is_err() {
                warn!("{} thread panicked", name);
            }
        }

        lock(&self.outbound).take();
        lock(&self.pending).take();
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Glasses command engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.shared.failed.load(Ordering::Acquire)
    }

    pub fn set_event_listener(&self, listener: impl Fn(&McuEvent) + Send + Sync + 'static) {
        let listener: EventListener = Box::new(listener);
        self.shared.event_listener.store(Some(Arc::new(listener)));
    }

    pub fn set_imu_listener(&self, listener: impl Fn(&ImuSample) + Send + Sync + 'static) {
        let listener: ImuListener = Box::new(listener);
        self.shared.imu_listener.store(Some(Arc::new(listener)));
    }

    pub fn clear_listeners(&self) {
        self.shared.event_listener.store(None);
        self.shared.imu_listener.store(None);
    }

    /// Route IMU samples into a fresh orientation tracker and return its read handle.
    ///
    /// Replaces any IMU listener previously installed. The handle reports
    /// itself lost if the IMU reader fails.
    pub fn track_orientation(&self, warmup_samples: u32, rewarmup_samples: u32) -> OrientationHandle {
        let tracker =
            OrientationTracker::with_loss_flag(warmup_samples, rewarmup_samples, self.shared.imu_lost.clone());
        let handle = tracker.handle();
        let tracker = Mutex::new(tracker);
        self.set_imu_listener(move |sample| {
            lock(&tracker).update(*sample);
        });
        handle
    }

    /// Send one command and wait for its reply.
    #[instrument(skip(self, data))]
    pub fn exec(&self, cmd_id: u16, data: &[u8]) -> Result<CommandReply, ExecError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ExecError::NotReady);
        }
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(ExecError::Transport("reader thread failed".into()));
        }

        let mut outbound = lock(&self.outbound);
        let writer = outbound.as_mut().ok_or(ExecError::NotReady)?;

        let packet = frame::build(cmd_id, data);
        let started = Instant::now();

        // Arm and write in one critical section: the reader cannot route a
        // zero-id packet between the two.
        {
            let mut slot = lock(&self.shared.slot);
            slot.reply = None;
            slot.waiting_since = Some(Instant::now());
            if let Err(e) = transport::write_packet(writer.as_mut(), &packet) {
                slot.waiting_since = None;
                warn!("command 0x{:04X}: write failed: {}", cmd_id, e);
                return Err(ExecError::Transport(e.to_string()));
            }
        }

        let reply = self.wait_reply(started + self.config.exec_timeout, cmd_id)?;
        metrics::histogram!("visor_exec_time_us").record(started.elapsed().as_micros() as f64);
        Ok(decode_reply(cmd_id, &reply))
    }

    fn wait_reply(&self, deadline: Instant, cmd_id: u16) -> Result<[u8; PACKET_SIZE], ExecError> {
        let mut slot = lock(&self.shared.slot);
        let result = loop {
            if let Some(reply) = slot.reply.take() {
                break Ok(reply);
            }
            if self.shared.failed.load(Ordering::Acquire) {
                break Err(ExecError::Transport("reader thread failed".into()));
            }
            if self.shared.stop.load(Ordering::Acquire) {
                break Err(ExecError::NotReady);
            }
            let now = Instant::now();
            if now >= deadline {
                let ms = self.config.exec_timeout.as_millis() as u64;
                warn!("command 0x{:04X}: {}", cmd_id, ProtocolError::Timeout);
                break Err(ExecError::Timeout(ms));
            }
            slot = self
                .shared
                .replied
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        slot.waiting_since = None;
        result
    }

    /// Send a command carrying a single data byte and return its status.
    pub fn exec_byte(&self, cmd_id: u16, byte: u8) -> Result<u8, ExecError> {
        self.exec(cmd_id, &[byte]).map(|r| r.status)
    }

    /// Switch the IMU stream. Returns the device status; 0 means success.
    pub fn set_imu(&self, enable: bool) -> Result<u8, ExecError> {
        let state = if enable { "on" } else { "off" };
        let status = self.exec_byte(CMD_SET_IMU, u8::from(enable))?;
        if status == 0 {
            info!("IMU stream {}", state);
        } else {
            warn!("Turning IMU stream {} failed with status 0x{:02X}", state, status);
        }
        Ok(status)
    }

    /// Turn the IMU stream on, treating a non-zero status as failure.
    pub fn enable_imu(&self) -> Result<(), ExecError> {
        match self.set_imu(true)? {
            0 => Ok(()),
            status => Err(ExecError::Status {
                cmd_id: CMD_SET_IMU,
                status,
            }),
        }
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_reply(cmd_id: u16, reply: &[u8; PACKET_SIZE]) -> CommandReply {
    let (packet, corrupt) = match frame::parse(reply, MAGIC_MCU) {
        Ok(Parsed::Valid(p)) => (p, false),
        Ok(Parsed::CrcMismatch { packet, error }) => {
            warn!("command 0x{:04X}: reply {}", cmd_id, error);
            metrics::counter!("visor_hid_crc_errors").increment(1);
            (packet, true)
        }
        Err(e) => {
            warn!("command 0x{:04X}: unreadable reply: {}", cmd_id, e);
            return CommandReply {
                status: STATUS_CORRUPT,
                payload: Vec::new(),
            };
        }
    };

    match packet.payload.split_first() {
        Some(_) if corrupt => CommandReply {
            status: STATUS_CORRUPT,
            payload: packet.payload[1..].to_vec(),
        },
        Some((&status, rest)) => CommandReply {
            status,
            payload: rest.to_vec(),
        },
        None => CommandReply {
            status: if corrupt { STATUS_CORRUPT } else { STATUS_EMPTY },
            payload: Vec::new(),
        },
    }
}

fn mcu_reader_loop(mut device: Box<dyn HidEndpoint>, shared: Arc<Shared>, timeout_ms: i32) {
    let mut buf = [0u8; PACKET_SIZE];
    info!("MCU reader started");

    while !shared.stop.load(Ordering::Acquire) {
        let n = match device.read_timeout(&mut buf, timeout_ms) {
            Ok(None) => continue,
            Ok(Some(n)) => n,
            Err(e) => {
                shared.fail("MCU", &e);
                break;
            }
        };
        let received = Instant::now();

        let report = &buf[..n];
        if report.len() < 2 || report[..2] != MAGIC_MCU {
            warn!("MCU: dropping report with bad header ({} bytes)", n);
            continue;
        }

        if frame::peek_cmd_id(report) == Some(0) {
            let mut slot = lock(&shared.slot);
            if slot.accept(report, received) {
                shared.replied.notify_all();
                continue;
            }
            debug!("MCU: zero-id packet with no command outstanding, treating as event");
        }

        dispatch_event(&shared, report);
    }

    info!("MCU reader stopped");
}

fn dispatch_event(shared: &Shared, report: &[u8]) {
    let packet = match frame::parse(report, MAGIC_MCU) {
        Ok(Parsed::Valid(p)) => p,
        Ok(Parsed::CrcMismatch { packet, error }) => {
            warn!("MCU: dropping event 0x{:04X}: {}", packet.cmd_id, error);
            metrics::counter!("visor_hid_crc_errors").increment(1);
            return;
        }
        Err(e) => {
            warn!("MCU: dropping event: {}", e);
            return;
        }
    };

    metrics::counter!("visor_hid_events").increment(1);
    if let Some(listener) = shared.event_listener.load_full() {
        listener(&McuEvent {
            id: packet.cmd_id,
            timestamp: packet.timestamp,
            data: packet.payload.to_vec(),
        });
    }
}

fn imu_reader_loop(mut device: Box<dyn HidEndpoint>, shared: Arc<Shared>, timeout_ms: i32) {
    let mut buf = [0u8; PACKET_SIZE];
    info!("IMU reader started");

    while !shared.stop.load(Ordering::Acquire) {
        let n = match device.read_timeout(&mut buf, timeout_ms) {
            Ok(None) => continue,
            Ok(Some(n)) => n,
            Err(e) => {
                shared.imu_lost.store(true, Ordering::Release);
                shared.fail("IMU", &e);
                break;
            }
        };

        let packet = match frame::parse(&buf[..n], MAGIC_IMU) {
            Ok(Parsed::Valid(p)) => p,
            Ok(Parsed::CrcMismatch { error, .. }) => {
                warn!("IMU: dropping sample: {}", error);
                metrics::counter!("visor_hid_crc_errors").increment(1);
                continue;
            }
            Err(e) => {
                warn!("IMU: dropping report: {}", e);
                continue;
            }
        };

        let Some(sample) = ImuSample::decode(packet.payload, packet.timestamp) else {
            warn!("IMU: payload too short ({} bytes)", packet.payload.len());
            continue;
        };

        metrics::counter!("visor_imu_samples").increment(1);
        if let Some(listener) = shared.imu_listener.load_full() {
            listener(&sample);
        }
    }

    info!("IMU reader stopped");
}
