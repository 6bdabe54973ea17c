use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::drivers::buffer::DEFAULT_HISTORY_CAPACITY;
use crate::drivers::features::DEFAULT_ACCEL_SCALE;
use crate::drivers::orientation::DEFAULT_GYRO_SCALE;
use crate::drivers::{ConfigError, HeartRateSource, WireLayout};

/// Per-connection pipeline settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub layout: WireLayout,
    pub heart_rate: HeartRateSource,
    /// Lines containing any of these substrings are ignored (case-sensitive).
    pub banner_markers: Vec<String>,
    pub history_capacity: usize,
    /// Accelerometer ticks per g.
    pub accel_scale: f64,
    /// Gyroscope ticks per degree/second.
    pub gyro_scale: f64,
    /// Keep the text after the last newline of a chunk and prepend it to the next one.
    pub carry_partial_lines: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::nine_field()
    }
}

impl PipelineConfig {
    /// Firmware that reports heart rate as the third field.
    pub fn nine_field() -> Self {
        Self {
            layout: WireLayout::NineField,
            heart_rate: HeartRateSource::Reported,
            banner_markers: default_banner_markers(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            accel_scale: DEFAULT_ACCEL_SCALE,
            gyro_scale: DEFAULT_GYRO_SCALE,
            carry_partial_lines: false,
        }
    }

    /// Firmware without a heart-rate sensor; heart rate is estimated.
    pub fn eight_field() -> Self {
        Self {
            layout: WireLayout::EightField,
            heart_rate: HeartRateSource::Estimated,
            history_capacity: 100,
            ..Self::nine_field()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: PipelineConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        check_scale("accelerometer", self.accel_scale)?;
        check_scale("gyroscope", self.gyro_scale)?;
        if self.heart_rate == HeartRateSource::Reported && !self.layout.has_heart_rate() {
            return Err(ConfigError::HeartRateUnavailable);
        }
        Ok(())
    }
}

fn default_banner_markers() -> Vec<String> {
    vec!["Bluetooth".to_string(), "Format".to_string()]
}

fn check_scale(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidScale { name, value })
    }
}
