//! Per-connection orchestration: decode, integrate, derive, buffer, forward.
use std::borrow::Cow;
use std::mem;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::config::PipelineConfig;
use crate::drivers::{
    DerivedSample, FeatureDeriver, FrameDecoder, HistoryBuffer, OrientationIntegrator,
    OrientationState, PipelineError,
};
use crate::engine::{
    Forwarder, PredictionRequest, PredictionResult, PredictionService, SampleSink, SensorRecord,
};
use crate::types::{ConnectionState, ForwardEvent, SessionContext};

/// Longest partial line kept between chunks before it is discarded.
const MAX_FRAGMENT_BYTES: usize = 512;

/// What one `ingest` call did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngestReport {
    pub lines_decoded: usize,
    pub lines_skipped: usize,
    pub samples_appended: usize,
    pub forwarded: usize,
    /// Records that could not even be queued for forwarding.
    pub forward_errors: Vec<String>,
}

impl IngestReport {
    pub fn absorb(&mut self, other: IngestReport) {
        self.lines_decoded += other.lines_decoded;
        self.lines_skipped += other.lines_skipped;
        self.samples_appended += other.samples_appended;
        self.forwarded += other.forwarded;
        self.forward_errors.extend(other.forward_errors);
    }
}

pub struct SessionSampleAggregator {
    decoder: FrameDecoder,
    integrator: OrientationIntegrator,
    deriver: FeatureDeriver,
    history: HistoryBuffer,
    accel_scale: f64,
    carry_partial_lines: bool,
    fragment: String,
    state: ConnectionState,
    session: Option<SessionContext>,
    forwarder: Option<Forwarder>,
    // replaced sinks still draining their queues
    retired: Vec<Forwarder>,
    // one channel for the aggregator's lifetime; every worker gets a clone
    events_tx: Sender<ForwardEvent>,
    events_rx: Receiver<ForwardEvent>,
    sample_count: u64,
    last_updated_ms: Option<i64>,
    forward_failures: u64,
}

impl SessionSampleAggregator {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel();
        Ok(Self {
            decoder: FrameDecoder::new(config.layout, config.banner_markers.clone()),
            integrator: OrientationIntegrator::new(config.gyro_scale),
            deriver: FeatureDeriver::new(config.heart_rate, config.accel_scale),
            history: HistoryBuffer::with_capacity(config.history_capacity)?,
            accel_scale: config.accel_scale,
            carry_partial_lines: config.carry_partial_lines,
            fragment: String::new(),
            state: ConnectionState::Disconnected,
            session: None,
            forwarder: None,
            retired: Vec::new(),
            events_tx,
            events_rx,
            sample_count: 0,
            last_updated_ms: None,
            forward_failures: 0,
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn begin_connect(&mut self) -> Result<(), PipelineError> {
        self.transition(ConnectionState::Connecting)
    }

    /// Transport is up. Integrator and history start fresh.
    pub fn mark_connected(&mut self) -> Result<(), PipelineError> {
        self.transition(ConnectionState::Connected)?;
        self.reset_stream_state();
        Ok(())
    }

    /// Shorthand for `begin_connect` followed by `mark_connected`.
    pub fn connect(&mut self) -> Result<(), PipelineError> {
        self.begin_connect()?;
        self.mark_connected()
    }

    /// Valid from any state, including a failed connection attempt.
    /// Queued forwarding jobs are left to finish on their own.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            log::info!("connection {:?} -> Disconnected", self.state);
        }
        self.state = ConnectionState::Disconnected;
        self.reset_stream_state();
    }

    fn transition(&mut self, to: ConnectionState) -> Result<(), PipelineError> {
        let allowed = matches!(
            (self.state, to),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connected)
        );
        if !allowed {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        log::info!("connection {:?} -> {:?}", self.state, to);
        self.state = to;
        Ok(())
    }

    pub fn attach_session(&mut self, session: SessionContext) {
        log::info!(
            "session {} attached ({})",
            session.session_id,
            session.data_source.as_str()
        );
        self.session = Some(session);
    }

    pub fn detach_session(&mut self) -> Option<SessionContext> {
        self.session.take()
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref()
    }

    /// Starts a forwarding worker for `sink`.
    ///
    /// A previous sink keeps draining the records already queued for it, and
    /// its outcomes are still reported through `poll_forward_events`.
    pub fn attach_sink<S: SampleSink>(&mut self, sink: S) {
        let mut first_sequence = 0;
        if let Some(previous) = self.forwarder.take() {
            log::info!("replacing forwarding sink");
            first_sequence = previous.next_sequence();
            self.retired.push(previous);
        }
        let forwarder = Forwarder::spawn(sink, self.events_tx.clone())
            .starting_at(first_sequence);
        self.forwarder = Some(forwarder);
    }

    /// Runs one chunk through decode, integrate, derive, append and forward.
    ///
    /// Every sample in the chunk is stamped with `now_ms`.
    pub fn ingest(&mut self, chunk: &str, now_ms: i64) -> Result<IngestReport, PipelineError> {
        if self.state != ConnectionState::Connected {
            log::warn!("dropping {} bytes received while {:?}", chunk.len(), self.state);
            return Err(PipelineError::NotConnected);
        }
        let text: Cow<str> = if self.carry_partial_lines {
            match self.reassemble(chunk) {
                Some(complete) => Cow::Owned(complete),
                None => return Ok(IngestReport::default()),
            }
        } else {
            Cow::Borrowed(chunk)
        };
        Ok(self.process(&text, now_ms))
    }

    /// Decodes a carried partial line as if its newline had arrived.
    pub fn flush(&mut self, now_ms: i64) -> Result<IngestReport, PipelineError> {
        if self.state != ConnectionState::Connected {
            return Err(PipelineError::NotConnected);
        }
        let fragment = mem::take(&mut self.fragment);
        Ok(self.process(&fragment, now_ms))
    }

    // Joins the carried fragment with `chunk` and keeps the new trailing
    // fragment. Returns the complete lines, if any.
    fn reassemble(&mut self, chunk: &str) -> Option<String> {
        let mut joined = mem::take(&mut self.fragment);
        joined.push_str(chunk);
        let Some(idx) = joined.rfind('\n') else {
            self.keep_fragment(joined);
            return None;
        };
        let tail = joined.split_off(idx + 1);
        self.keep_fragment(tail);
        Some(joined)
    }

    fn keep_fragment(&mut self, fragment: String) {
        if fragment.len() > MAX_FRAGMENT_BYTES {
            log::debug!("discarding {}-byte unterminated line", fragment.len());
            return;
        }
        self.fragment = fragment;
    }

    fn process(&mut self, text: &str, now_ms: i64) -> IngestReport {
        let decoded = self.decoder.decode_counted(text);
        let mut report = IngestReport {
            lines_decoded: decoded.samples.len(),
            lines_skipped: decoded.skipped,
            ..IngestReport::default()
        };
        for raw in decoded.samples {
            let accel_g = raw.accel_g(self.accel_scale);
            let orientation = self.integrator.observe(accel_g, raw.gyro_z(), now_ms);
            let derived = self.deriver.derive(&raw, &orientation, now_ms);
            self.history.append(derived);
            self.sample_count += 1;
            self.last_updated_ms = Some(now_ms);
            report.samples_appended += 1;

            if let (Some(session), Some(forwarder)) = (&self.session, self.forwarder.as_mut()) {
                match forwarder.forward(SensorRecord::new(session, derived)) {
                    Ok(_) => report.forwarded += 1,
                    Err(err) => {
                        log::warn!("could not queue sample for forwarding: {err}");
                        self.forward_failures += 1;
                        report.forward_errors.push(err.to_string());
                    }
                }
            }
        }
        report
    }

    /// User "clear data": history and integrated angle go together.
    pub fn clear_data(&mut self) {
        log::info!("clearing {} buffered samples", self.history.len());
        self.reset_stream_state();
    }

    fn reset_stream_state(&mut self) {
        self.integrator.reset();
        self.history.clear();
        self.fragment.clear();
    }

    /// Drains forwarding outcomes reported so far without blocking.
    pub fn poll_forward_events(&mut self) -> Vec<ForwardEvent> {
        let mut events = Vec::new();
        // the aggregator holds a sender, so the channel never disconnects
        while let Ok(event) = self.events_rx.try_recv() {
            if event.is_failure() {
                self.forward_failures += 1;
            }
            events.push(event);
        }
        events
    }

    /// Closes every forwarding queue, waits for queued records and returns
    /// the outcomes not yet polled.
    pub fn shutdown_forwarder(&mut self) -> Result<Vec<ForwardEvent>, PipelineError> {
        let mut result = Ok(());
        for forwarder in self.retired.drain(..).chain(self.forwarder.take()) {
            if let Err(err) = forwarder.shutdown() {
                result = Err(err);
            }
        }
        // workers have exited; everything they sent is already queued
        let events = self.poll_forward_events();
        result?;
        Ok(events)
    }

    /// Submits the most recent sample to the prediction service.
    pub fn request_prediction<P>(&self, service: &P) -> Result<PredictionResult, PipelineError>
    where
        P: PredictionService + ?Sized,
    {
        let latest = self.history.latest().ok_or(PipelineError::NoSamples)?;
        let request = PredictionRequest::from_sample(latest);
        request.validate()?;
        service.predict(&request).map_err(|err| {
            log::warn!("prediction request failed: {err}");
            PipelineError::Forward(err)
        })
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn snapshot(&self) -> Vec<DerivedSample> {
        self.history.snapshot()
    }

    pub fn latest(&self) -> Option<&DerivedSample> {
        self.history.latest()
    }

    pub fn orientation(&self) -> OrientationState {
        self.integrator.state()
    }

    /// Samples derived over the aggregator's lifetime; not reset by clears.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn last_updated_ms(&self) -> Option<i64> {
        self.last_updated_ms
    }

    pub fn forward_failures(&self) -> u64 {
        self.forward_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ForwardError, HeartRateSource};
    use crate::types::DataSource;
    use std::cell::Cell;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const REFERENCE: &str = "37.1,22.4,72,1638,-512,16100,0,0,131\n";

    fn connected(config: PipelineConfig) -> SessionSampleAggregator {
        let mut aggregator = SessionSampleAggregator::new(&config).unwrap();
        aggregator.connect().unwrap();
        aggregator
    }

    fn wait_for_events(
        aggregator: &mut SessionSampleAggregator,
        count: usize,
    ) -> Vec<ForwardEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while events.len() < count && Instant::now() < deadline {
            events.extend(aggregator.poll_forward_events());
            std::thread::sleep(Duration::from_millis(5));
        }
        events
    }

    #[test]
    fn reference_chunk_then_half_second_later() {
        let mut aggregator = connected(PipelineConfig::default());
        let t0 = 1_700_000_000_000;
        let report = aggregator.ingest(REFERENCE, t0).unwrap();
        assert_eq!(report.samples_appended, 1);

        let first = *aggregator.latest().unwrap();
        assert_eq!(first.heart_rate_bpm, 72.0);
        assert_eq!(first.body_temperature_c, 37.1);
        assert_eq!(first.timestamp_ms, t0);
        assert_eq!(aggregator.orientation().yaw, 0.0);
        assert!((first.range_of_motion_deg - 7.6).abs() < 1e-9);

        aggregator.ingest(REFERENCE, t0 + 500).unwrap();
        assert!((aggregator.orientation().yaw - 0.5).abs() < 1e-12);
        let second = aggregator.latest().unwrap();
        // 7.628 + 0.5
        assert!((second.range_of_motion_deg - 8.1).abs() < 1e-9);
        assert_eq!(aggregator.sample_count(), 2);
        assert_eq!(aggregator.last_updated_ms(), Some(t0 + 500));
    }

    #[test]
    fn banner_lines_are_silently_skipped() {
        let mut aggregator = connected(PipelineConfig::default());
        let chunk = format!("Bluetooth Connected\n{REFERENCE}{REFERENCE}");
        let report = aggregator.ingest(&chunk, 0).unwrap();
        assert_eq!(report.lines_decoded, 2);
        assert_eq!(report.lines_skipped, 0);
        assert_eq!(aggregator.history().len(), 2);
    }

    #[test]
    fn ingest_requires_connection() {
        let mut aggregator = SessionSampleAggregator::new(&PipelineConfig::default()).unwrap();
        assert!(matches!(
            aggregator.ingest(REFERENCE, 0),
            Err(PipelineError::NotConnected)
        ));
        aggregator.begin_connect().unwrap();
        assert!(aggregator.ingest(REFERENCE, 0).is_err());
        aggregator.mark_connected().unwrap();
        assert!(aggregator.ingest(REFERENCE, 0).is_ok());
        aggregator.disconnect();
        assert!(aggregator.ingest(REFERENCE, 10).is_err());
        assert!(aggregator.history().is_empty());
        assert_eq!(aggregator.sample_count(), 1);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut aggregator = SessionSampleAggregator::new(&PipelineConfig::default()).unwrap();
        assert!(matches!(
            aggregator.mark_connected(),
            Err(PipelineError::InvalidTransition {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connected
            })
        ));
        aggregator.connect().unwrap();
        assert!(aggregator.begin_connect().is_err());
        assert_eq!(aggregator.connection_state(), ConnectionState::Connected);
        // failed attempt: Connecting -> Disconnected
        aggregator.disconnect();
        aggregator.begin_connect().unwrap();
        aggregator.disconnect();
        assert_eq!(aggregator.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_starts_fresh() {
        let mut aggregator = connected(PipelineConfig::default());
        aggregator.ingest(REFERENCE, 0).unwrap();
        aggregator.ingest(REFERENCE, 2_000).unwrap();
        assert!(aggregator.orientation().yaw > 0.0);
        aggregator.disconnect();
        aggregator.connect().unwrap();
        assert_eq!(aggregator.orientation(), OrientationState::default());
        assert!(aggregator.history().is_empty());
    }

    #[test]
    fn clear_data_replays_identically() {
        let mut aggregator = connected(PipelineConfig::default());
        let chunks = [
            ("37.0,22.0,70,100,-200,16000,0,0,262\n", 0),
            ("37.1,22.1,71,300,-100,15800,0,0,-524\n", 250),
            ("37.2,22.2,72,-50,50,16300,0,0,1310\n", 600),
        ];
        let mut run = || {
            aggregator.clear_data();
            for (chunk, t) in chunks {
                aggregator.ingest(chunk, t).unwrap();
            }
            aggregator.snapshot()
        };
        let first = run();
        let second = run();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_lines_do_not_abort_the_chunk() {
        let mut aggregator = connected(PipelineConfig::default());
        let chunk = format!("garbage\n1,2,3\n{REFERENCE}37.1,x,72,1,2,3,4,5,6\n{REFERENCE}");
        let report = aggregator.ingest(&chunk, 0).unwrap();
        assert_eq!(report.lines_decoded, 2);
        assert_eq!(report.lines_skipped, 3);
        assert_eq!(aggregator.history().len(), 2);
    }

    #[test]
    fn eight_field_variant_estimates_heart_rate() {
        let mut aggregator = connected(PipelineConfig::eight_field());
        aggregator.ingest("36.6,21.9,0,0,16384,0,0,0\n", 0).unwrap();
        let sample = aggregator.latest().unwrap();
        assert_eq!(sample.heart_rate_bpm, 100.0);
        assert_eq!(aggregator.history().capacity(), 100);
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let config = PipelineConfig {
            history_capacity: 3,
            ..PipelineConfig::default()
        };
        let mut aggregator = connected(config);
        for t in 0..10 {
            aggregator.ingest(REFERENCE, t * 100).unwrap();
        }
        let stamps: Vec<i64> = aggregator.snapshot().iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(stamps, vec![700, 800, 900]);
        assert_eq!(aggregator.sample_count(), 10);
    }

    #[test]
    fn split_lines_are_lost_without_carry() {
        let mut aggregator = connected(PipelineConfig::default());
        let (head, tail) = REFERENCE.split_at(15);
        let a = aggregator.ingest(head, 0).unwrap();
        let b = aggregator.ingest(tail, 10).unwrap();
        assert_eq!(a.lines_skipped + b.lines_skipped, 2);
        assert!(aggregator.history().is_empty());
    }

    #[test]
    fn carry_reassembles_split_lines() {
        let config = PipelineConfig {
            carry_partial_lines: true,
            ..PipelineConfig::default()
        };
        let mut aggregator = connected(config);
        let stream = format!("{REFERENCE}{REFERENCE}37.1,22.4,72,1638,-512,16100,0,0,131");
        let mut appended = 0;
        for (i, piece) in stream.as_bytes().chunks(7).enumerate() {
            let text = std::str::from_utf8(piece).unwrap();
            let report = aggregator.ingest(text, i as i64 * 10).unwrap();
            assert_eq!(report.lines_skipped, 0);
            appended += report.samples_appended;
        }
        assert_eq!(appended, 2);
        let flushed = aggregator.flush(1_000).unwrap();
        assert_eq!(flushed.samples_appended, 1);
        assert_eq!(aggregator.history().len(), 3);
    }

    #[test]
    fn forwarding_only_with_active_session() {
        let mut aggregator = connected(PipelineConfig::default());
        aggregator.attach_sink(|_: &SensorRecord| -> Result<(), ForwardError> { Ok(()) });
        let report = aggregator.ingest(REFERENCE, 0).unwrap();
        assert_eq!(report.forwarded, 0);

        aggregator.attach_session(SessionContext::new("42", DataSource::Arduino));
        let report = aggregator.ingest(REFERENCE, 100).unwrap();
        assert_eq!(report.forwarded, 1);
        let events = aggregator.shutdown_forwarder().unwrap();
        assert_eq!(events, vec![ForwardEvent::Persisted { sequence: 0 }]);
    }

    #[test]
    fn forwarding_failures_are_advisory() {
        let mut aggregator = connected(PipelineConfig::default());
        aggregator.attach_session(SessionContext::new("42", DataSource::Mock));
        aggregator.attach_sink(|record: &SensorRecord| {
            if record.sample.timestamp_ms == 100 {
                Err(ForwardError::Rejected("Missing field: step_count".into()))
            } else {
                Ok(())
            }
        });
        for t in [0, 100, 200] {
            aggregator.ingest(REFERENCE, t).unwrap();
        }
        let events = wait_for_events(&mut aggregator, 3);
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().filter(|e| e.is_failure()).count(), 1);
        assert_eq!(aggregator.forward_failures(), 1);
        assert_eq!(aggregator.history().len(), 3);
        // ingestion continues after the failure
        assert!(aggregator.ingest(REFERENCE, 300).is_ok());
    }

    #[test]
    fn replaced_sink_still_reports_queued_failures() {
        let mut aggregator = connected(PipelineConfig::default());
        aggregator.attach_session(SessionContext::new("42", DataSource::Arduino));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        aggregator.attach_sink(move |_: &SensorRecord| -> Result<(), ForwardError> {
            gate_rx.recv().ok();
            Err(ForwardError::Timeout)
        });
        aggregator.ingest(REFERENCE, 0).unwrap();

        aggregator.attach_sink(|_: &SensorRecord| -> Result<(), ForwardError> { Ok(()) });
        aggregator.ingest(REFERENCE, 100).unwrap();
        gate_tx.send(()).unwrap();

        let mut events = aggregator.shutdown_forwarder().unwrap();
        events.sort_by_key(|e| e.sequence());
        assert_eq!(
            events,
            vec![
                ForwardEvent::Failed {
                    sequence: 0,
                    reason: ForwardError::Timeout.to_string(),
                },
                ForwardEvent::Persisted { sequence: 1 },
            ]
        );
        assert_eq!(aggregator.forward_failures(), 1);
    }

    #[test]
    fn disconnect_does_not_wait_for_queued_forwards() {
        let mut aggregator = connected(PipelineConfig::default());
        aggregator.attach_session(SessionContext::new("42", DataSource::Mock));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        aggregator.attach_sink(move |record: &SensorRecord| -> Result<(), ForwardError> {
            gate_rx.recv().map_err(|_| ForwardError::WorkerGone)?;
            if record.sample.timestamp_ms == 100 {
                Err(ForwardError::Rejected("duplicate sample".into()))
            } else {
                Ok(())
            }
        });
        aggregator.ingest(REFERENCE, 0).unwrap();
        aggregator.ingest(REFERENCE, 100).unwrap();

        // both records are still stuck in the sink
        aggregator.disconnect();
        assert_eq!(aggregator.connection_state(), ConnectionState::Disconnected);
        assert!(aggregator.history().is_empty());
        assert!(aggregator.poll_forward_events().is_empty());

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        let events = wait_for_events(&mut aggregator, 2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ForwardEvent::Persisted { sequence: 0 });
        assert!(matches!(&events[1], ForwardEvent::Failed { sequence: 1, .. }));
        assert_eq!(aggregator.forward_failures(), 1);
        assert!(aggregator.shutdown_forwarder().unwrap().is_empty());
    }

    struct FixedService {
        calls: Cell<usize>,
    }

    impl PredictionService for FixedService {
        fn predict(&self, request: &PredictionRequest) -> Result<PredictionResult, ForwardError> {
            self.calls.set(self.calls.get() + 1);
            Ok(PredictionResult {
                risk_level: if request.heart_rate > 160.0 { 2 } else { 0 },
                risk_label: String::new(),
                confidence: 0.9,
                probabilities: vec![0.9, 0.05, 0.05],
                alerts: vec![],
                recommendations: vec![],
            })
        }
    }

    #[test]
    fn prediction_uses_latest_sample() {
        let service = FixedService { calls: Cell::new(0) };
        let mut aggregator = connected(PipelineConfig::default());
        assert!(matches!(
            aggregator.request_prediction(&service),
            Err(PipelineError::NoSamples)
        ));
        // level board: roll 0, every feature non-negative
        aggregator.ingest("37.0,22.0,175,0,0,16384,0,0,0\n", 0).unwrap();
        let result = aggregator.request_prediction(&service).unwrap();
        assert_eq!(result.label(), "Injured");
        assert_eq!(service.calls.get(), 1);
    }

    #[test]
    fn prediction_rejects_negative_features_before_calling() {
        let service = FixedService { calls: Cell::new(0) };
        let config = PipelineConfig {
            heart_rate: HeartRateSource::Reported,
            ..PipelineConfig::default()
        };
        let mut aggregator = connected(config);
        // negative roll gives a negative joint angle
        aggregator.ingest(REFERENCE, 0).unwrap();
        assert!(matches!(
            aggregator.request_prediction(&service),
            Err(PipelineError::Forward(ForwardError::Rejected(_)))
        ));
        assert_eq!(service.calls.get(), 0);
    }
}
