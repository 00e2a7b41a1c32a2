pub mod shuttle;

pub use shuttle::{FrameShuttle, FrontFrame, ShuttleStats, SlotIndices};
