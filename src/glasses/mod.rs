//! USB-HID smart glasses: packet codec, transport, command engine and head tracking.

pub mod engine;
pub mod frame;
pub mod gesture;
pub mod orientation;
pub mod transport;

pub use engine::{CommandEngine, CommandReply, EngineConfig, McuEvent, CMD_SET_IMU};
pub use orientation::{ImuSample, Orientation, OrientationHandle, OrientationState, OrientationTracker};
pub use transport::{open_glasses, DeviceSelector, GlassesEndpoints, HidEndpoint};
