// src/engine.rs
//! Outbound side: the background forwarding worker and the shapes exchanged
//! with the persistence and prediction services.
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::drivers::{DerivedSample, ForwardError};
use crate::types::{DataSource, ForwardEvent, SessionContext};

/// One derived sample tagged for the persistence service.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SensorRecord {
    pub session_id: String,
    #[serde(flatten)]
    pub sample: DerivedSample,
    pub data_source: DataSource,
}

impl SensorRecord {
    pub fn new(session: &SessionContext, sample: DerivedSample) -> Self {
        Self {
            session_id: session.session_id.clone(),
            sample,
            data_source: session.data_source,
        }
    }
}

/// Persistence collaborator. Called on the forwarding worker thread.
pub trait SampleSink: Send + 'static {
    fn persist(&mut self, record: &SensorRecord) -> Result<(), ForwardError>;
}

impl<F> SampleSink for F
where
    F: FnMut(&SensorRecord) -> Result<(), ForwardError> + Send + 'static,
{
    fn persist(&mut self, record: &SensorRecord) -> Result<(), ForwardError> {
        self(record)
    }
}

struct Job {
    sequence: u64,
    record: SensorRecord,
}

/// Queue in front of a [`SampleSink`] running on its own thread.
///
/// `forward` never waits on the sink; every outcome is reported on the
/// event channel handed to [`Forwarder::spawn`].
pub struct Forwarder {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    next_sequence: u64,
}

impl Forwarder {
    pub fn spawn<S: SampleSink>(mut sink: S, events: Sender<ForwardEvent>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = thread::spawn(move || {
            for job in rx {
                let event = match sink.persist(&job.record) {
                    Ok(()) => ForwardEvent::Persisted {
                        sequence: job.sequence,
                    },
                    Err(err) => {
                        log::warn!("forwarding sample #{} failed: {err}", job.sequence);
                        ForwardEvent::Failed {
                            sequence: job.sequence,
                            reason: err.to_string(),
                        }
                    }
                };
                // receiver gone means nobody is listening any more; keep draining
                events.send(event).ok();
            }
            log::debug!("forwarding worker drained");
        });
        Self {
            jobs: Some(tx),
            handle: Some(handle),
            next_sequence: 0,
        }
    }

    /// Numbers records from `first` instead of zero.
    pub fn starting_at(mut self, first: u64) -> Self {
        self.next_sequence = first;
        self
    }

    /// Sequence number the next forwarded record will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Queues a record and returns its sequence number.
    pub fn forward(&mut self, record: SensorRecord) -> Result<u64, ForwardError> {
        let jobs = self.jobs.as_ref().ok_or(ForwardError::WorkerGone)?;
        let sequence = self.next_sequence;
        jobs.send(Job { sequence, record }).map_err(|_| ForwardError::WorkerGone)?;
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Closes the queue and waits for already queued records to finish.
    pub fn shutdown(mut self) -> Result<(), ForwardError> {
        self.jobs.take();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                log::error!("forwarding worker panicked");
                ForwardError::WorkerGone
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        // detach: pending jobs finish on their own
        self.jobs.take();
    }
}

/// Feature vector in the order the risk model expects.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredictionRequest {
    pub heart_rate: f64,
    pub body_temperature: f64,
    pub joint_angles: f64,
    pub gait_speed: f64,
    pub cadence: f64,
    pub step_count: u32,
    pub jump_height: f64,
    pub ground_reaction_force: f64,
    pub range_of_motion: f64,
    pub ambient_temperature: f64,
}

impl PredictionRequest {
    pub const FEATURE_NAMES: [&'static str; 10] = [
        "heart_rate",
        "body_temperature",
        "joint_angles",
        "gait_speed",
        "cadence",
        "step_count",
        "jump_height",
        "ground_reaction_force",
        "range_of_motion",
        "ambient_temperature",
    ];

    /// Step count and jump height are not measured by the wearable and start at zero.
    pub fn from_sample(sample: &DerivedSample) -> Self {
        Self {
            heart_rate: sample.heart_rate_bpm,
            body_temperature: sample.body_temperature_c,
            joint_angles: sample.joint_angle_deg,
            gait_speed: sample.gait_speed_mps,
            cadence: sample.cadence_steps_per_min,
            step_count: 0,
            jump_height: 0.0,
            ground_reaction_force: sample.ground_reaction_force_n,
            range_of_motion: sample.range_of_motion_deg,
            ambient_temperature: sample.ambient_temperature_c,
        }
    }

    pub fn with_step_count(mut self, step_count: u32) -> Self {
        self.step_count = step_count;
        self
    }

    pub fn with_jump_height(mut self, jump_height: f64) -> Self {
        self.jump_height = jump_height;
        self
    }

    pub fn as_vector(&self) -> [f64; 10] {
        [
            self.heart_rate,
            self.body_temperature,
            self.joint_angles,
            self.gait_speed,
            self.cadence,
            self.step_count as f64,
            self.jump_height,
            self.ground_reaction_force,
            self.range_of_motion,
            self.ambient_temperature,
        ]
    }

    /// Every feature except ambient temperature must be non-negative.
    pub fn validate(&self) -> Result<(), ForwardError> {
        let values = self.as_vector();
        for (name, value) in Self::FEATURE_NAMES.iter().zip(values) {
            if *name == "ambient_temperature" {
                continue;
            }
            if value < 0.0 || value.is_nan() {
                return Err(ForwardError::Rejected(format!(
                    "invalid value for {name}: must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskLevel {
    Healthy,
    LowRisk,
    Injured,
}

impl RiskLevel {
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(RiskLevel::Healthy),
            1 => Some(RiskLevel::LowRisk),
            2 => Some(RiskLevel::Injured),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskLevel::Healthy => "Healthy",
            RiskLevel::LowRisk => "Low Risk",
            RiskLevel::Injured => "Injured",
        }
    }
}

/// Response of the prediction service, passed through to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub risk_level: i64,
    #[serde(default)]
    pub risk_label: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub probabilities: Vec<f64>,
    #[serde(default)]
    pub alerts: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl PredictionResult {
    pub fn risk(&self) -> Option<RiskLevel> {
        RiskLevel::from_level(self.risk_level)
    }

    pub fn label(&self) -> &str {
        if !self.risk_label.is_empty() {
            return &self.risk_label;
        }
        self.risk().map(|r| r.label()).unwrap_or("Unknown")
    }

    pub fn advisory(&self) -> String {
        if self.recommendations.is_empty() {
            "Continue training safely.".to_string()
        } else {
            self.recommendations.join("\n")
        }
    }
}

/// Prediction collaborator. Owns its own transport and timeout policy.
pub trait PredictionService {
    fn predict(&self, request: &PredictionRequest) -> Result<PredictionResult, ForwardError>;
}
