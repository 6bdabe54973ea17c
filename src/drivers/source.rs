use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::{PipelineError, WireLayout};

/// Text delivered by the transport in one notification.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub received_at_ms: i64,
}

impl Chunk {
    pub fn new(text: impl Into<String>, received_at_ms: i64) -> Self {
        Self {
            text: text.into(),
            received_at_ms,
        }
    }
}

/// Something that can yield transport chunks on demand.
pub trait ChunkSource {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, PipelineError>;
}

/// In-memory source useful for tests and deterministic playback.
pub struct ManualSource {
    queue: VecDeque<Chunk>,
}

impl ManualSource {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            queue: chunks.into_iter().collect(),
        }
    }
}

impl ChunkSource for ManualSource {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, PipelineError> {
        Ok(self.queue.pop_front())
    }
}

/// Replays a recorded capture as fixed-size byte chunks, one every `interval_ms`.
///
/// Chunk boundaries do not respect line boundaries, just like the radio link.
/// A multibyte character is never split; its bytes move to the next chunk.
pub struct ReplaySource {
    data: Vec<u8>,
    cursor: usize,
    chunk_bytes: usize,
    interval_ms: i64,
    next_time_ms: i64,
}

impl ReplaySource {
    pub fn from_text(
        text: impl Into<String>,
        chunk_bytes: usize,
        start_ms: i64,
        interval_ms: i64,
    ) -> Self {
        Self {
            data: text.into().into_bytes(),
            cursor: 0,
            chunk_bytes: chunk_bytes.max(1),
            interval_ms,
            next_time_ms: start_ms,
        }
    }

    pub fn open(
        path: impl AsRef<Path>,
        chunk_bytes: usize,
        start_ms: i64,
        interval_ms: i64,
    ) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|e| PipelineError::Source(format!("{}: {e}", path.display())))?;
        Ok(Self {
            data,
            cursor: 0,
            chunk_bytes: chunk_bytes.max(1),
            interval_ms,
            next_time_ms: start_ms,
        })
    }
}

impl ChunkSource for ReplaySource {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, PipelineError> {
        if self.cursor >= self.data.len() {
            return Ok(None);
        }
        let mut end = (self.cursor + self.chunk_bytes).min(self.data.len());
        // back up while `end` points at a UTF-8 continuation byte
        let mut boundary = end;
        while boundary > self.cursor
            && boundary < self.data.len()
            && is_continuation(self.data[boundary])
        {
            boundary -= 1;
        }
        if boundary > self.cursor {
            end = boundary;
        }
        let text = String::from_utf8_lossy(&self.data[self.cursor..end]).into_owned();
        self.cursor = end;
        let chunk = Chunk::new(text, self.next_time_ms);
        self.next_time_ms += self.interval_ms;
        Ok(Some(chunk))
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Synthetic board output for sessions run without hardware.
pub struct MockSource {
    rng: StdRng,
    layout: WireLayout,
    remaining: usize,
    lines_per_chunk: usize,
    interval_ms: i64,
    next_time_ms: i64,
    phase: f64,
}

impl MockSource {
    pub fn new(layout: WireLayout, chunks: usize, start_ms: i64) -> Self {
        Self::with_rng(StdRng::from_entropy(), layout, chunks, start_ms)
    }

    /// Deterministic output for a given seed.
    pub fn seeded(layout: WireLayout, chunks: usize, start_ms: i64, seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), layout, chunks, start_ms)
    }

    fn with_rng(rng: StdRng, layout: WireLayout, chunks: usize, start_ms: i64) -> Self {
        Self {
            rng,
            layout,
            remaining: chunks,
            lines_per_chunk: 1,
            interval_ms: 100,
            next_time_ms: start_ms,
            phase: 0.0,
        }
    }

    pub fn lines_per_chunk(mut self, lines: usize) -> Self {
        self.lines_per_chunk = lines.max(1);
        self
    }

    pub fn interval_ms(mut self, interval_ms: i64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    fn frame(&mut self) -> String {
        self.phase += 0.1;
        let body = 37.0 + self.rng.gen_range(-0.3..0.3);
        let ambient = 22.5 + self.rng.gen_range(-0.5..0.5);
        let ax = (self.phase.sin() * 2000.0) as i32 + self.rng.gen_range(-200..200);
        let ay = (self.phase.cos() * 1500.0) as i32 + self.rng.gen_range(-200..200);
        let az = 16384 + self.rng.gen_range(-800..800);
        let gx = self.rng.gen_range(-2000..2000);
        let gy = self.rng.gen_range(-2000..2000);
        let gz = self.rng.gen_range(-2000..2000);
        match self.layout {
            WireLayout::EightField => {
                format!("{body:.1},{ambient:.1},{ax},{ay},{az},{gx},{gy},{gz}")
            }
            WireLayout::NineField => {
                let heart_rate = self.rng.gen_range(160..180);
                format!("{body:.1},{ambient:.1},{heart_rate},{ax},{ay},{az},{gx},{gy},{gz}")
            }
        }
    }
}

impl ChunkSource for MockSource {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, PipelineError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut text = String::new();
        for _ in 0..self.lines_per_chunk {
            text.push_str(&self.frame());
            text.push('\n');
        }
        let chunk = Chunk::new(text, self.next_time_ms);
        self.next_time_ms += self.interval_ms;
        Ok(Some(chunk))
    }
}
