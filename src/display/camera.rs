//! Head-tracked transform for the virtual screen quad.

use glam::{Mat4, Vec3};

use crate::glasses::{Orientation, OrientationHandle, OrientationState};
use crate::DisplayConfig;

pub const AUTO_TILT_DEG: f32 = 15.0;
pub const AUTO_STEP_DEG: f32 = 0.2;

const EYE: Vec3 = Vec3::new(0.0, 0.0, 2.0);

/// What to draw this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pose {
    /// Head angles relative to the calibration offset, in degrees.
    Tracked(Orientation),
    /// Fixed tilt plus a slow yaw sweep, used without glasses or once the
    /// IMU stream is lost.
    Auto { yaw: f32 },
    /// Glasses present but not calibrated yet.
    Hidden,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AutoRotation {
    angle: f32,
}

impl AutoRotation {
    pub fn advance(&mut self) -> f32 {
        self.angle += AUTO_STEP_DEG;
        if self.angle > 360.0 {
            self.angle -= 360.0;
        }
        self.angle
    }
}

/// Latest record of a live orientation source.
pub fn live_state(handle: Option<&OrientationHandle>) -> Option<OrientationState> {
    handle.filter(|h| !h.is_lost()).map(OrientationHandle::load)
}

/// `state` is `None` when no orientation source is running.
pub fn choose_pose(state: Option<&OrientationState>, auto: &mut AutoRotation) -> Pose {
    match state {
        Some(state) => state.relative().map_or(Pose::Hidden, Pose::Tracked),
        None => Pose::Auto { yaw: auto.advance() },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Camera {
    fov_y_deg: f32,
    near: f32,
    far: f32,
    distance: f32,
    scale: f32,
}

impl Camera {
    pub fn new(config: &DisplayConfig) -> Self {
        Self {
            fov_y_deg: config.fov_deg,
            near: config.near,
            far: config.far,
            distance: config.plane_distance,
            scale: config.plane_scale,
        }
    }

    pub fn projection(&self, viewport_aspect: f32) -> Mat4 {
        Mat4::perspective_rh_gl(self.fov_y_deg.to_radians(), viewport_aspect, self.near, self.far)
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(EYE, Vec3::ZERO, Vec3::Y)
    }

    /// Rotate about the origin (yaw on Y, pitch on X, roll on Z), push the
    /// plane out along the rotated Z axis, then scale. The quad itself spans
    /// `±frame_aspect` by `±1`.
    pub fn model(&self, pose: Pose, frame_aspect: f32) -> Mat4 {
        let rotation = match pose {
            Pose::Tracked(o) => {
                Mat4::from_rotation_y(o.yaw.to_radians())
                    * Mat4::from_rotation_x(o.pitch.to_radians())
                    * Mat4::from_rotation_z(o.roll.to_radians())
            }
            Pose::Auto { yaw } => {
                Mat4::from_rotation_x(AUTO_TILT_DEG.to_radians()) * Mat4::from_rotation_y(yaw.to_radians())
            }
            Pose::Hidden => Mat4::IDENTITY,
        };
        rotation
            * Mat4::from_translation(Vec3::new(0.0, 0.0, -self.distance))
            * Mat4::from_scale(Vec3::new(frame_aspect * self.scale, self.scale, 1.0))
    }

    pub fn mvp(&self, pose: Pose, viewport_aspect: f32, frame_aspect: f32) -> Mat4 {
        self.projection(viewport_aspect) * self.view() * self.model(pose, frame_aspect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn camera(distance: f32, scale: f32) -> Camera {
        Camera::new(&DisplayConfig {
            plane_distance: distance,
            plane_scale: scale,
            ..DisplayConfig::default()
        })
    }

    fn approx(a: Vec3, b: Vec3) {
        assert!((a - b).length() < 1e-4, "{a:?} != {b:?}");
    }

    #[test]
    fn test_untracked_without_glasses_auto_rotates() {
        let mut auto = AutoRotation::default();
        assert_eq!(choose_pose(None, &mut auto), Pose::Auto { yaw: 0.2 });
        assert_eq!(choose_pose(None, &mut auto), Pose::Auto { yaw: 0.4 });
    }

    #[test]
    fn test_auto_rotation_wraps() {
        let mut auto = AutoRotation { angle: 359.9 };
        let yaw = auto.advance();
        assert!(yaw < 1.0 && yaw > 0.0);
    }

    #[test]
    fn test_uncalibrated_glasses_hide_quad() {
        let state = OrientationState::default();
        let mut auto = AutoRotation::default();
        assert_eq!(choose_pose(Some(&state), &mut auto), Pose::Hidden);
    }

    #[test]
    fn test_lost_imu_before_calibration_falls_back_to_auto() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        use crate::glasses::OrientationTracker;

        let lost = Arc::new(AtomicBool::new(false));
        let tracker = OrientationTracker::with_loss_flag(20, 30, lost.clone());
        let handle = tracker.handle();
        let mut auto = AutoRotation::default();
        assert_eq!(choose_pose(live_state(Some(&handle)).as_ref(), &mut auto), Pose::Hidden);

        lost.store(true, Ordering::Release);
        assert_eq!(
            choose_pose(live_state(Some(&handle)).as_ref(), &mut auto),
            Pose::Auto { yaw: 0.2 }
        );
        assert!(live_state(None).is_none());
    }

    #[test]
    fn test_calibrated_pose_is_relative() {
        let state = OrientationState {
            current: Orientation::new(1.0, 12.0, 35.0),
            initial_offset: Orientation::new(1.0, 2.0, 5.0),
            offset_set: true,
            ..OrientationState::default()
        };
        let mut auto = AutoRotation::default();
        match choose_pose(Some(&state), &mut auto) {
            Pose::Tracked(o) => {
                assert_eq!((o.roll, o.pitch, o.yaw), (0.0, 10.0, 30.0));
            }
            other => panic!("unexpected pose {other:?}"),
        }
    }

    #[test]
    fn test_identity_pose_places_plane_at_distance() {
        let cam = camera(1.0, 1.0);
        let centre = cam.model(Pose::Tracked(Orientation::default()), 16.0 / 9.0) * Vec4::W;
        approx(centre.truncate(), Vec3::new(0.0, 0.0, -1.0));

        let clip = cam.mvp(Pose::Tracked(Orientation::default()), 1.0, 1.0) * Vec4::W;
        assert!((clip.w - 3.0).abs() < 1e-4);
        assert!(clip.x.abs() < 1e-4 && clip.y.abs() < 1e-4);
    }

    #[test]
    fn test_yaw_orbits_plane_around_origin() {
        let cam = camera(1.0, 1.0);
        let pose = Pose::Tracked(Orientation::new(0.0, 0.0, 90.0));
        let centre = cam.model(pose, 1.0) * Vec4::W;
        approx(centre.truncate(), Vec3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_scale_and_aspect() {
        let cam = camera(2.0, 0.5);
        let corner = cam.model(Pose::Tracked(Orientation::default()), 2.0) * Vec4::new(1.0, 1.0, 0.0, 1.0);
        approx(corner.truncate(), Vec3::new(1.0, 0.5, -2.0));
    }
}
