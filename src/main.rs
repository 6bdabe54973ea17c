// src/main.rs
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stridesense::drivers::{ChunkSource, MockSource, ReplaySource, SamplePipeline};
use stridesense::recorder::SampleRecorder;
use stridesense::{DataSource, PipelineConfig, SessionContext, SessionSampleAggregator};

// Radio link delivers roughly one notification of this size every 20 ms.
const REPLAY_CHUNK_BYTES: usize = 64;
const REPLAY_INTERVAL_MS: i64 = 20;

#[derive(Parser, Debug)]
#[command(name = "stridesense", about = "Runs wearable sensor captures through the gait pipeline")]
struct Args {
    /// Capture file recorded from the board
    #[arg(value_name = "CAPTURE", conflicts_with = "mock", required_unless_present = "mock")]
    capture: Option<PathBuf>,

    /// Generate N synthetic chunks instead of replaying a capture
    #[arg(long, value_name = "N")]
    mock: Option<usize>,

    /// Pipeline settings (JSON)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// CSV file, or a directory for a timestamped one
    #[arg(long, value_name = "PATH")]
    record: Option<PathBuf>,
}

enum Input {
    Capture(PathBuf),
    Mock(usize),
}

impl Args {
    fn input(&self) -> Result<Input> {
        match (&self.capture, self.mock) {
            (_, Some(chunks)) => Ok(Input::Mock(chunks)),
            (Some(path), None) => Ok(Input::Capture(path.clone())),
            (None, None) => anyhow::bail!("either a capture file or --mock is required"),
        }
    }
}

fn pipeline_config(args: &Args, input: &Input) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => match input {
            Input::Mock(_) => PipelineConfig::eight_field(),
            Input::Capture(_) => PipelineConfig::default(),
        },
    };
    // fixed-size replay chunks split lines anywhere
    if matches!(input, Input::Capture(_)) && !config.carry_partial_lines {
        if args.config.is_some() {
            log::warn!("carry_partial_lines is off; enabling it for capture replay");
        }
        config.carry_partial_lines = true;
    }
    Ok(config)
}

fn run<S: ChunkSource>(
    source: S,
    aggregator: SessionSampleAggregator,
) -> Result<SessionSampleAggregator> {
    let mut pipeline = SamplePipeline::new(source, aggregator);
    while let Some(report) = pipeline.pump_once()? {
        if report.lines_skipped > 0 {
            log::debug!("skipped {} malformed lines", report.lines_skipped);
        }
        let aggregator = pipeline.aggregator_mut();
        aggregator.poll_forward_events();
        for sample in aggregator.history().recent(report.samples_appended) {
            println!("{}", serde_json::to_string(&sample)?);
        }
    }
    let (_, mut aggregator) = pipeline.into_parts();
    let tail = aggregator.flush(aggregator.last_updated_ms().unwrap_or_default())?;
    for sample in aggregator.history().recent(tail.samples_appended) {
        println!("{}", serde_json::to_string(&sample)?);
    }
    Ok(aggregator)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let input = args.input()?;
    let config = pipeline_config(&args, &input)?;

    let mut aggregator = SessionSampleAggregator::new(&config)?;
    aggregator.connect()?;

    if let Some(target) = &args.record {
        let data_source = match input {
            Input::Mock(_) => DataSource::Mock,
            Input::Capture(_) => DataSource::Arduino,
        };
        let session = SessionContext::new("local", data_source);
        let recorder = if target.is_dir() {
            SampleRecorder::in_dir(target, &session.session_id)
        } else {
            SampleRecorder::create(target)
        }
        .with_context(|| format!("creating recording at {}", target.display()))?;
        aggregator.attach_session(session);
        aggregator.attach_sink(recorder);
    }

    let mut aggregator = match input {
        Input::Capture(path) => {
            let source = ReplaySource::open(&path, REPLAY_CHUNK_BYTES, 0, REPLAY_INTERVAL_MS)?;
            run(source, aggregator)?
        }
        Input::Mock(chunks) => {
            let source = MockSource::new(config.layout, chunks, 0).interval_ms(REPLAY_INTERVAL_MS);
            run(source, aggregator)?
        }
    };

    aggregator.shutdown_forwarder()?;
    if aggregator.forward_failures() > 0 {
        log::warn!("{} samples failed to persist", aggregator.forward_failures());
    }
    log::info!(
        "processed {} samples, final yaw {:.1}",
        aggregator.sample_count(),
        aggregator.orientation().yaw
    );
    aggregator.disconnect();
    Ok(())
}
