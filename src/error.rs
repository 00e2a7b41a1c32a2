//! Error kinds shared across the glasses engine and the capture pipeline.

/// Top-level error for the library.
#[derive(Debug, thiserror::Error)]
pub enum VisorError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("command failed: {0}")]
    Exec(#[from] ExecError),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("screencast portal error: {0}")]
    Rpc(#[from] RpcError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// HID or device-node I/O failure. Fatal to the thread that owns the handle.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("device not found (VID={vendor_id:04X} interface={interface})")]
    DeviceNotFound { vendor_id: u16, interface: i32 },

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("driver returned buffer {index}, pool has {pool}")]
    UnknownBuffer { index: u32, pool: usize },

    #[error("transport closed")]
    Closed,
}

/// Per-packet decoding failures. Always recovered by dropping the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad magic {0:02X} {1:02X}")]
    BadMagic(u8, u8),

    #[error("short frame ({0} bytes)")]
    ShortFrame(usize),

    #[error("bad length field 0x{0:04X}")]
    BadLength(u16),

    #[error("CRC mismatch: computed {computed:04X}, packet carries {received:04X}")]
    Crc { computed: u16, received: u16 },

    #[error("timed out waiting for a reply")]
    Timeout,
}

/// Errors returned by [`crate::glasses::CommandEngine::exec`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("command engine is not running")]
    NotReady,

    #[error("no reply within {0} ms")]
    Timeout(u64),

    #[error("command 0x{cmd_id:04X} answered status 0x{status:02X}")]
    Status { cmd_id: u16, status: u8 },

    #[error("transport failed: {0}")]
    Transport(String),
}

/// Capture format negotiation failures.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("no supported pixel format on {device} (tried {tried})")]
    Unsupported { device: String, tried: String },

    #[error("device {0} cannot capture video")]
    NotCapture(String),

    #[error("device {0} does not support streaming I/O")]
    NoStreaming(String),
}

/// Screencast portal / media-bus failures. Fatal to the screencast source.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("D-Bus value error: {0}")]
    Variant(#[from] zbus::zvariant::Error),

    #[error("{step} was rejected by the portal (response code {code})")]
    Rejected { step: &'static str, code: u32 },

    #[error("{step} response is missing `{key}`")]
    MissingKey { step: &'static str, key: &'static str },

    #[error("portal setup timed out after {0} ms")]
    Timeout(u64),

    #[error("PipeWire error: {0}")]
    PipeWire(String),

    #[error("screencast thread exited before setup completed")]
    Aborted,
}

impl From<pipewire::Error> for RpcError {
    fn from(e: pipewire::Error) -> Self {
        RpcError::PipeWire(e.to_string())
    }
}

/// Configuration and command-line problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, VisorError>;
