use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::drivers::ForwardError;
use crate::engine::{SampleSink, SensorRecord};

pub const CSV_HEADER: &str = concat!(
    "timestamp_ms,session_id,data_source,body_temperature,ambient_temperature,heart_rate,",
    "joint_angles,gait_speed,cadence,ground_reaction_force,range_of_motion"
);

/// Writes forwarded samples to a CSV file, one row per sample.
pub struct SampleRecorder {
    writer: BufWriter<File>,
    path: PathBuf,
    rows: u64,
}

impl SampleRecorder {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{CSV_HEADER}")?;
        log::info!("recording samples to {}", path.display());
        Ok(Self {
            writer,
            path,
            rows: 0,
        })
    }

    /// New file in `dir` named after the session label and the current time.
    pub fn in_dir(dir: impl AsRef<Path>, label: &str) -> io::Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let filename = format!("session_{label}_{timestamp}.csv");
        Self::create(dir.as_ref().join(filename))
    }

    pub fn write_record(&mut self, record: &SensorRecord) -> io::Result<()> {
        let s = &record.sample;
        writeln!(
            self.writer,
            "{},{},{},{:.1},{:.1},{},{:.1},{:.2},{},{:.2},{:.1}",
            s.timestamp_ms,
            record.session_id,
            record.data_source.as_str(),
            s.body_temperature_c,
            s.ambient_temperature_c,
            s.heart_rate_bpm,
            s.joint_angle_deg,
            s.gait_speed_mps,
            s.cadence_steps_per_min,
            s.ground_reaction_force_n,
            s.range_of_motion_deg,
        )?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.writer.flush()?;
        log::info!("recording saved ({} rows)", self.rows);
        Ok(())
    }
}

impl SampleSink for SampleRecorder {
    fn persist(&mut self, record: &SensorRecord) -> Result<(), ForwardError> {
        self.write_record(record)?;
        self.writer.flush()?;
        Ok(())
    }
}
