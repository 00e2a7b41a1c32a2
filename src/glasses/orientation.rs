//! Head orientation from the IMU stream.
//!
//! The IMU reader thread is the only writer: it owns an [`OrientationTracker`]
//! and publishes a fresh [`OrientationState`] after every sample. Renderers
//! hold an [`OrientationHandle`] and load the latest state without locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::glasses::gesture::ShakeDetector;

/// Euler angles in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Orientation {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl Orientation {
    pub fn new(roll: f32, pitch: f32, yaw: f32) -> Self {
        Self { roll, pitch, yaw }
    }

    /// Component-wise difference, `self - origin`.
    pub fn relative_to(&self, origin: &Orientation) -> Orientation {
        Orientation {
            roll: self.roll - origin.roll,
            pitch: self.pitch - origin.pitch,
            yaw: self.yaw - origin.yaw,
        }
    }
}

/// One decoded IMU report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub orientation: Orientation,
    /// Device clock, milliseconds.
    pub timestamp: u32,
}

/// Bytes of the IMU record holding roll, pitch and yaw.
pub const IMU_ANGLES_LEN: usize = 12;

impl ImuSample {
    /// Decode the three big-endian floats at the start of an IMU payload.
    ///
    /// Yaw is negated to match the renderer's coordinate system.
    pub fn decode(payload: &[u8], timestamp: u32) -> Option<Self> {
        let angles = payload.get(..IMU_ANGLES_LEN)?;
        let float_at = |i: usize| {
            f32::from_be_bytes([angles[i], angles[i + 1], angles[i + 2], angles[i + 3]])
        };
        Some(Self {
            orientation: Orientation {
                roll: float_at(0),
                pitch: float_at(4),
                yaw: -float_at(8),
            },
            timestamp,
        })
    }
}

/// Published orientation record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OrientationState {
    pub current: Orientation,
    pub initial_offset: Orientation,
    pub offset_set: bool,
    pub warmup_remaining: u32,
    pub timestamp: u32,
    /// Number of gesture resets so far.
    pub resets: u32,
}

impl OrientationState {
    /// Orientation relative to the captured offset, once calibrated.
    pub fn relative(&self) -> Option<Orientation> {
        self.offset_set
            .then(|| self.current.relative_to(&self.initial_offset))
    }
}

/// What a single sample did to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Sample discarded during warm-up.
    WarmingUp,
    /// Sample captured as the new offset.
    Calibrated,
    Tracking,
    /// A shake gesture cleared the offset and restarted warm-up.
    GestureReset,
}

/// Cloneable read side of the orientation record.
#[derive(Clone)]
pub struct OrientationHandle {
    shared: Arc<ArcSwap<OrientationState>>,
    source_lost: Arc<AtomicBool>,
}

impl OrientationHandle {
    pub fn load(&self) -> OrientationState {
        **self.shared.load()
    }

    pub fn is_calibrated(&self) -> bool {
        self.shared.load().offset_set
    }

    /// The sample source stopped for good; the record will not change again.
    pub fn is_lost(&self) -> bool {
        self.source_lost.load(Ordering::Acquire)
    }
}

/// Single-writer orientation state machine.
pub struct OrientationTracker {
    state: OrientationState,
    detector: ShakeDetector,
    rewarmup_samples: u32,
    shared: Arc<ArcSwap<OrientationState>>,
    source_lost: Arc<AtomicBool>,
}

impl OrientationTracker {
    pub fn new(warmup_samples: u32, rewarmup_samples: u32) -> Self {
        Self::with_loss_flag(warmup_samples, rewarmup_samples, Arc::new(AtomicBool::new(false)))
    }

    /// Tracker whose handles report [`OrientationHandle::is_lost`] once the
    /// sample source sets `source_lost`.
    pub fn with_loss_flag(warmup_samples: u32, rewarmup_samples: u32, source_lost: Arc<AtomicBool>) -> Self {
        let state = OrientationState {
            warmup_remaining: warmup_samples,
            ..OrientationState::default()
        };
        Self {
            state,
            detector: ShakeDetector::new(),
            rewarmup_samples,
            shared: Arc::new(ArcSwap::from_pointee(state)),
            source_lost,
        }
    }

    pub fn handle(&self) -> OrientationHandle {
        OrientationHandle {
            shared: self.shared.clone(),
            source_lost: self.source_lost.clone(),
        }
    }

    pub fn state(&self) -> &OrientationState {
        &self.state
    }

    pub fn update(&mut self, sample: ImuSample) -> TrackerEvent {
        let event = self.step(sample);
        self.shared.store(Arc::new(self.state));
        event
    }

    fn step(&mut self, sample: ImuSample) -> TrackerEvent {
        let s = &mut self.state;
        s.timestamp = sample.timestamp;

        if s.warmup_remaining > 0 {
            s.warmup_remaining -= 1;
            return TrackerEvent::WarmingUp;
        }

        let mut event = TrackerEvent::Tracking;
        if !s.offset_set {
            s.initial_offset = sample.orientation;
            s.offset_set = true;
            event = TrackerEvent::Calibrated;
            info!(
                "Orientation offset captured: roll={:.2} pitch={:.2} yaw={:.2}",
                sample.orientation.roll, sample.orientation.pitch, sample.orientation.yaw
            );
        }

        s.current = sample.orientation;

        if self.detector.update(sample.orientation.yaw, sample.timestamp) {
            s.offset_set = false;
            s.warmup_remaining = self.rewarmup_samples;
            s.resets += 1;
            info!(
                "Shake gesture detected, re-centring after {} samples",
                self.rewarmup_samples
            );
            return TrackerEvent::GestureReset;
        }

        debug_assert!(!s.offset_set || s.warmup_remaining == 0);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(roll: f32, pitch: f32, yaw: f32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&roll.to_be_bytes());
        p.extend_from_slice(&pitch.to_be_bytes());
        p.extend_from_slice(&yaw.to_be_bytes());
        p.extend_from_slice(&[0u8; 8]);
        p
    }

    fn sample(yaw: f32, ts: u32) -> ImuSample {
        ImuSample {
            orientation: Orientation::new(0.5, -1.0, yaw),
            timestamp: ts,
        }
    }

    #[test]
    fn test_decode_is_big_endian_with_negated_yaw() {
        let s = ImuSample::decode(&payload(1.5, -2.25, 90.0), 42).unwrap();
        assert_eq!(s.orientation, Orientation::new(1.5, -2.25, -90.0));
        assert_eq!(s.timestamp, 42);

        // 1.0f32 big-endian is 3F 80 00 00.
        let raw = [0x3F, 0x80, 0, 0, 0, 0, 0, 0, 0x3F, 0x80, 0, 0];
        let s = ImuSample::decode(&raw, 0).unwrap();
        assert_eq!(s.orientation.roll, 1.0);
        assert_eq!(s.orientation.yaw, -1.0);
    }

    #[test]
    fn test_decode_short_payload() {
        assert!(ImuSample::decode(&[0u8; 11], 0).is_none());
    }

    #[test]
    fn test_warmup_then_offset_capture() {
        let mut t = OrientationTracker::new(20, 30);
        let handle = t.handle();

        for i in 0..20 {
            assert_eq!(t.update(sample(10.0, i)), TrackerEvent::WarmingUp);
            assert!(!handle.is_calibrated());
        }
        assert_eq!(t.update(sample(12.0, 20)), TrackerEvent::Calibrated);

        let state = handle.load();
        assert!(state.offset_set);
        assert_eq!(state.warmup_remaining, 0);
        assert_eq!(state.initial_offset.yaw, 12.0);

        t.update(sample(13.0, 21));
        let rel = handle.load().relative().unwrap();
        assert_eq!(rel.yaw, 1.0);
        assert_eq!(rel.roll, 0.0);
    }

    #[test]
    fn test_handle_reports_lost_source() {
        let lost = Arc::new(AtomicBool::new(false));
        let mut t = OrientationTracker::with_loss_flag(5, 5, lost.clone());
        let handle = t.handle();
        t.update(sample(1.0, 0));
        assert!(!handle.is_lost());

        lost.store(true, Ordering::Release);
        assert!(handle.is_lost());
        assert!(t.handle().is_lost());
        assert!(!OrientationTracker::new(0, 0).handle().is_lost());
    }

    #[test]
    fn test_shake_resets_offset_and_rewarms() {
        let mut t = OrientationTracker::new(0, 30);
        let handle = t.handle();

        let mut ts = 0;
        assert_eq!(t.update(sample(0.0, ts)), TrackerEvent::Calibrated);

        let mut reset = false;
        for i in 0..8 {
            ts += 100;
            let yaw = if i % 2 == 0 { 3.0 } else { -3.0 };
            if t.update(sample(yaw, ts)) == TrackerEvent::GestureReset {
                reset = true;
                break;
            }
        }
        assert!(reset);

        let state = handle.load();
        assert!(!state.offset_set);
        assert_eq!(state.warmup_remaining, 30);
        assert_eq!(state.resets, 1);
        assert!(state.relative().is_none());

        for _ in 0..30 {
            ts += 10;
            assert_eq!(t.update(sample(-3.0, ts)), TrackerEvent::WarmingUp);
            assert!(!handle.is_calibrated());
        }
        ts += 10;
        assert_eq!(t.update(sample(5.0, ts)), TrackerEvent::Calibrated);
        assert_eq!(handle.load().initial_offset.yaw, 5.0);
    }
}
