//! Sensor pipeline for the stride wearable: turns the board's comma separated
//! text stream into derived gait samples, keeps a rolling history, and hands
//! samples to a persistence sink and a risk prediction service.
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod types;

pub use config::PipelineConfig;
pub use drivers::{DerivedSample, SessionSampleAggregator};
pub use types::{DataSource, SessionContext};
