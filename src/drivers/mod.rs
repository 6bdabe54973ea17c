// src/drivers/mod.rs
pub mod aggregator;
pub mod buffer;
pub mod error;
pub mod features;
pub mod frame;
pub mod orientation;
pub mod pipeline;
pub mod source;

pub use aggregator::{IngestReport, SessionSampleAggregator};
pub use buffer::HistoryBuffer;
pub use error::{ConfigError, DecodeError, ForwardError, PipelineError};
pub use features::{DerivedSample, FeatureDeriver, HeartRateSource};
pub use frame::{DecodedChunk, FrameDecoder, RawSample, WireLayout};
pub use orientation::{OrientationIntegrator, OrientationState};
pub use pipeline::SamplePipeline;
pub use source::{Chunk, ChunkSource, ManualSource, MockSource, ReplaySource};
