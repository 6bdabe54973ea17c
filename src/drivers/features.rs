//! Biomechanical metrics derived from one raw sample.
//!
//! Output precision per field:
//!
//! | field | rounding |
//! |---|---|
//! | temperatures, joint angle, range of motion | 1 decimal |
//! | gait speed, ground reaction force | 2 decimals |
//! | cadence | whole number |
//! | heart rate (reported) | nearest integer |
//! | heart rate (estimated) | floor of `60 + gait_speed * 40`, clamped to 60..=220 |
use serde::{Deserialize, Serialize};

use crate::drivers::orientation::{tilt_from_accel, OrientationState};
use crate::drivers::RawSample;

/// Ticks per g for the default accelerometer range.
pub const DEFAULT_ACCEL_SCALE: f64 = 16384.0;
pub const STANDARD_GRAVITY: f64 = 9.8;
pub const MIN_HEART_RATE_BPM: f64 = 60.0;
pub const MAX_HEART_RATE_BPM: f64 = 220.0;

/// How the heart rate of a derived sample is obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartRateSource {
    /// Use the heart-rate field of the nine-field layout.
    #[default]
    Reported,
    /// Estimate from movement intensity (gait speed).
    Estimated,
}

/// Named metrics for one sample. Field names on the wire match the backend.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DerivedSample {
    pub timestamp_ms: i64,
    #[serde(rename = "body_temperature")]
    pub body_temperature_c: f64,
    #[serde(rename = "ambient_temperature")]
    pub ambient_temperature_c: f64,
    #[serde(rename = "heart_rate")]
    pub heart_rate_bpm: f64,
    #[serde(rename = "joint_angles")]
    pub joint_angle_deg: f64,
    #[serde(rename = "gait_speed")]
    pub gait_speed_mps: f64,
    #[serde(rename = "cadence")]
    pub cadence_steps_per_min: f64,
    #[serde(rename = "ground_reaction_force")]
    pub ground_reaction_force_n: f64,
    #[serde(rename = "range_of_motion")]
    pub range_of_motion_deg: f64,
}

pub struct FeatureDeriver {
    heart_rate: HeartRateSource,
    accel_scale: f64,
}

impl FeatureDeriver {
    pub fn new(heart_rate: HeartRateSource, accel_scale: f64) -> Self {
        Self {
            heart_rate,
            accel_scale,
        }
    }

    /// Maps a raw sample plus the post-update orientation to derived metrics.
    ///
    /// Roll and pitch are recomputed here from `raw`; only `orientation.yaw`
    /// is read from the integrator state.
    pub fn derive(
        &self,
        raw: &RawSample,
        orientation: &OrientationState,
        timestamp_ms: i64,
    ) -> DerivedSample {
        let accel_g = raw.accel_g(self.accel_scale);
        let [ax, ay, az] = accel_g;
        let (roll, pitch) = tilt_from_accel(accel_g);
        let yaw = if orientation.has_yaw_estimate() {
            orientation.yaw
        } else {
            0.0
        };

        let gait_speed = round_to(magnitude(ax, ay, az), 2);
        let heart_rate_bpm = match (self.heart_rate, raw.heart_rate_raw) {
            (HeartRateSource::Reported, Some(bpm)) => bpm as f64,
            // config validation rules out Reported without the field; fall back
            (HeartRateSource::Reported, None) | (HeartRateSource::Estimated, _) => {
                estimate_heart_rate(gait_speed)
            }
        };

        DerivedSample {
            timestamp_ms,
            body_temperature_c: round_to(raw.body_temp_c, 1),
            ambient_temperature_c: round_to(raw.ambient_temp_c, 1),
            heart_rate_bpm,
            joint_angle_deg: round_to(roll, 1),
            gait_speed_mps: gait_speed,
            cadence_steps_per_min: (roll.abs() * 2.0).round(),
            ground_reaction_force_n: round_to(az * STANDARD_GRAVITY, 2),
            range_of_motion_deg: round_to(roll.abs() + pitch.abs() + yaw.abs(), 1),
        }
    }
}

impl Default for FeatureDeriver {
    fn default() -> Self {
        Self::new(HeartRateSource::Reported, DEFAULT_ACCEL_SCALE)
    }
}

/// Movement-intensity heart rate heuristic used when the board reports none.
pub fn estimate_heart_rate(gait_speed: f64) -> f64 {
    (MIN_HEART_RATE_BPM + gait_speed * 40.0)
        .floor()
        .clamp(MIN_HEART_RATE_BPM, MAX_HEART_RATE_BPM)
}

fn magnitude(x: f64, y: f64, z: f64) -> f64 {
    (x * x + y * y + z * z).sqrt()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
