//! Head-shake detector used to re-centre the view.
//!
//! The first swing is measured against an exponentially smoothed yaw so slow
//! drift never counts; every following swing must reverse across the raw yaw
//! of the previous crossing.

/// Degrees a swing must cover to count.
pub const SHAKE_THRESHOLD_DEG: f32 = 2.0;
/// Crossings must all land within this window.
pub const SHAKE_WINDOW_MS: u32 = 3000;
/// Crossings needed to trigger a reset.
pub const SHAKES_TO_RESET: u32 = 4;

const SMOOTHING: f32 = 0.99;

#[derive(Debug, Clone, Default)]
pub struct ShakeDetector {
    /// Smoothed reference, seeded by the first sample.
    avg_yaw: Option<f32>,
    last_yaw: f32,
    direction: i8,
    shake_count: u32,
    window_start: Option<u32>,
}

impl ShakeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one yaw sample (degrees) stamped with the device clock (ms).
    ///
    /// Returns `true` when a shake gesture completed; the detector has already
    /// reset itself around `yaw` when that happens.
    pub fn update(&mut self, yaw: f32, now_ms: u32) -> bool {
        let avg = *self.avg_yaw.get_or_insert(yaw);
        let window_start = *self.window_start.get_or_insert(now_ms);

        if now_ms.wrapping_sub(window_start) > SHAKE_WINDOW_MS {
            self.shake_count = 0;
            self.direction = 0;
            self.window_start = Some(now_ms);
        }

        match self.direction {
            0 => {
                let delta = yaw - avg;
                if delta.abs() > SHAKE_THRESHOLD_DEG {
                    self.direction = if delta > 0.0 { 1 } else { -1 };
                    self.last_yaw = avg;
                }
            }
            1 if yaw - self.last_yaw > SHAKE_THRESHOLD_DEG => self.cross(yaw, -1),
            -1 if yaw - self.last_yaw < -SHAKE_THRESHOLD_DEG => self.cross(yaw, 1),
            _ => {}
        }

        self.avg_yaw = Some(SMOOTHING * avg + (1.0 - SMOOTHING) * yaw);

        if self.shake_count >= SHAKES_TO_RESET {
            self.reset(yaw, now_ms);
            return true;
        }
        false
    }

    fn cross(&mut self, yaw: f32, next_direction: i8) {
        self.direction = next_direction;
        self.last_yaw = yaw;
        self.shake_count += 1;
        tracing::debug!("shake crossing {} at yaw {:.2}", self.shake_count, yaw);
    }

    /// Forget all swings and re-seed the reference at `yaw`.
    pub fn reset(&mut self, yaw: f32, now_ms: u32) {
        *self = Self {
            avg_yaw: Some(yaw),
            window_start: Some(now_ms),
            ..Self::default()
        };
    }

    pub fn avg_yaw(&self) -> Option<f32> {
        self.avg_yaw
    }

    pub fn shake_count(&self) -> u32 {
        self.shake_count
    }
}
