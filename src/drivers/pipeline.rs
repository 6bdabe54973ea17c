use crate::drivers::aggregator::{IngestReport, SessionSampleAggregator};
use crate::drivers::source::ChunkSource;
use crate::drivers::PipelineError;

/// Pulls chunks from a source and feeds them to an aggregator.
pub struct SamplePipeline<S: ChunkSource> {
    source: S,
    aggregator: SessionSampleAggregator,
}

impl<S: ChunkSource> SamplePipeline<S> {
    pub fn new(source: S, aggregator: SessionSampleAggregator) -> Self {
        Self { source, aggregator }
    }

    /// Ingests the next chunk, if the source has one.
    pub fn pump_once(&mut self) -> Result<Option<IngestReport>, PipelineError> {
        let Some(chunk) = self.source.next_chunk()? else {
            return Ok(None);
        };
        let report = self.aggregator.ingest(&chunk.text, chunk.received_at_ms)?;
        Ok(Some(report))
    }

    /// Drains a finite source, then flushes any carried partial line.
    pub fn run_to_end(&mut self) -> Result<IngestReport, PipelineError> {
        let mut total = IngestReport::default();
        let mut last_ms = None;
        while let Some(chunk) = self.source.next_chunk()? {
            last_ms = Some(chunk.received_at_ms);
            total.absorb(self.aggregator.ingest(&chunk.text, chunk.received_at_ms)?);
        }
        if let Some(now_ms) = last_ms {
            total.absorb(self.aggregator.flush(now_ms)?);
        }
        Ok(total)
    }

    pub fn aggregator(&self) -> &SessionSampleAggregator {
        &self.aggregator
    }

    pub fn aggregator_mut(&mut self) -> &mut SessionSampleAggregator {
        &mut self.aggregator
    }

    pub fn into_parts(self) -> (S, SessionSampleAggregator) {
        (self.source, self.aggregator)
    }
}
