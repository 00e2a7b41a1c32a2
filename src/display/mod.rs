pub mod camera;
pub mod display;
pub mod renderer;

pub use camera::{Camera, Pose};
pub use display::Sdl2Display;
