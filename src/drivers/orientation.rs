//! Tilt from gravity plus gyro-integrated heading.
//!
//! Roll and pitch are recomputed from the accelerometer on every sample.
//! Yaw is the only integrated angle: it accumulates gyro-Z rate over the
//! wall-clock time between samples and is kept in (-180, 180].

/// Ticks per degree/second for the default gyroscope range.
pub const DEFAULT_GYRO_SCALE: f64 = 131.0;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OrientationState {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub last_sample_time_ms: Option<i64>,
}

impl OrientationState {
    /// True once at least one sample has been seen since the last reset.
    pub fn has_yaw_estimate(&self) -> bool {
        self.last_sample_time_ms.is_some()
    }
}

/// Roll and pitch in degrees from an accelerometer reading in g.
pub fn tilt_from_accel(accel_g: [f64; 3]) -> (f64, f64) {
    let [ax, ay, az] = accel_g;
    let roll = ay.atan2(az).to_degrees();
    let pitch = (-ax).atan2((ay * ay + az * az).sqrt()).to_degrees();
    (roll, pitch)
}

/// Folds an angle into (-180, 180].
pub fn wrap_degrees(angle: f64) -> f64 {
    if angle > -180.0 && angle <= 180.0 {
        return angle;
    }
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped <= -180.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}

pub struct OrientationIntegrator {
    state: OrientationState,
    gyro_scale: f64,
}

impl OrientationIntegrator {
    pub fn new(gyro_scale: f64) -> Self {
        Self {
            state: OrientationState::default(),
            gyro_scale,
        }
    }

    pub fn state(&self) -> OrientationState {
        self.state
    }

    /// Integrates one gyro-Z reading taken at `sample_time_ms`.
    ///
    /// The first sample after a reset only records its timestamp. A zero or
    /// negative elapsed time leaves yaw unchanged.
    pub fn update(&mut self, gyro_z_raw: i32, sample_time_ms: i64) -> OrientationState {
        if let Some(last) = self.state.last_sample_time_ms {
            match sample_time_ms.checked_sub(last) {
                Some(elapsed_ms) if elapsed_ms > 0 => {
                    let rate_dps = gyro_z_raw as f64 / self.gyro_scale;
                    let dt = elapsed_ms as f64 / 1000.0;
                    self.state.yaw = wrap_degrees(self.state.yaw + rate_dps * dt);
                }
                _ => log::debug!("unusable interval {last} -> {sample_time_ms} ms; yaw held"),
            }
        }
        self.state.last_sample_time_ms = Some(sample_time_ms);
        self.state
    }

    /// Updates roll/pitch from the accelerometer and integrates yaw in one step.
    pub fn observe(
        &mut self,
        accel_g: [f64; 3],
        gyro_z_raw: i32,
        sample_time_ms: i64,
    ) -> OrientationState {
        let (roll, pitch) = tilt_from_accel(accel_g);
        self.state.roll = roll;
        self.state.pitch = pitch;
        self.update(gyro_z_raw, sample_time_ms)
    }

    pub fn reset(&mut self) {
        self.state = OrientationState::default();
    }
}

impl Default for OrientationIntegrator {
    fn default() -> Self {
        Self::new(DEFAULT_GYRO_SCALE)
    }
}
