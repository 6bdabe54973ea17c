//! Line decoder for the wearable's text stream.
//!
//! The board prints one record per line, comma separated:
//! `temp1,temp2[,heart_rate],ax,ay,az,gx,gy,gz`. Banner lines (connection
//! notices, column header echoes) are filtered by substring before parsing.
use serde::{Deserialize, Serialize};

use crate::drivers::DecodeError;

/// Which record layout the firmware emits. Chosen once per connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireLayout {
    /// `temp1,temp2,ax,ay,az,gx,gy,gz`
    EightField,
    /// `temp1,temp2,heart_rate,ax,ay,az,gx,gy,gz`
    #[default]
    NineField,
}

impl WireLayout {
    pub fn field_count(&self) -> usize {
        match self {
            WireLayout::EightField => 8,
            WireLayout::NineField => 9,
        }
    }

    pub fn has_heart_rate(&self) -> bool {
        matches!(self, WireLayout::NineField)
    }

    // index of ax; gyro follows three fields later
    fn motion_offset(&self) -> usize {
        match self {
            WireLayout::EightField => 2,
            WireLayout::NineField => 3,
        }
    }
}

/// One decoded, unscaled record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawSample {
    pub body_temp_c: f64,
    pub ambient_temp_c: f64,
    /// Present only for [`WireLayout::NineField`].
    pub heart_rate_raw: Option<i32>,
    pub accel_raw: [i32; 3],
    pub gyro_raw: [i32; 3],
}

impl RawSample {
    pub fn gyro_z(&self) -> i32 {
        self.gyro_raw[2]
    }

    /// Accelerometer ticks converted to g using `scale` ticks per g.
    pub fn accel_g(&self, scale: f64) -> [f64; 3] {
        self.accel_raw.map(|v| v as f64 / scale)
    }
}

/// Result of decoding one chunk, with the number of lines dropped as malformed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedChunk {
    pub samples: Vec<RawSample>,
    pub skipped: usize,
}

pub struct FrameDecoder {
    layout: WireLayout,
    banner_markers: Vec<String>,
}

impl FrameDecoder {
    pub fn new(layout: WireLayout, banner_markers: Vec<String>) -> Self {
        Self {
            layout,
            banner_markers,
        }
    }

    /// Lazily yields the valid samples of `chunk` in line order.
    /// Malformed lines are logged and skipped.
    pub fn decode<'a>(&'a self, chunk: &'a str) -> impl Iterator<Item = RawSample> + 'a {
        chunk
            .split('\n')
            .filter_map(move |line| match self.parse_line(line) {
                Ok(sample) => sample,
                Err(err) => {
                    log::debug!("skipping malformed line {:?}: {err}", line.trim());
                    None
                }
            })
    }

    /// Same as [`FrameDecoder::decode`], collected, with a count of malformed lines.
    pub fn decode_counted(&self, chunk: &str) -> DecodedChunk {
        let mut out = DecodedChunk::default();
        for line in chunk.split('\n') {
            match self.parse_line(line) {
                Ok(Some(sample)) => out.samples.push(sample),
                Ok(None) => {}
                Err(err) => {
                    log::debug!("skipping malformed line {:?}: {err}", line.trim());
                    out.skipped += 1;
                }
            }
        }
        out
    }

    /// Parses a single line. `Ok(None)` means the line carries no data
    /// (blank or banner) and is not an error.
    pub fn parse_line(&self, line: &str) -> Result<Option<RawSample>, DecodeError> {
        let line = line.trim();
        if line.is_empty() || self.is_banner(line) {
            return Ok(None);
        }
        let tokens: Vec<&str> = line.split(',').map(str::trim).collect();
        let expected = self.layout.field_count();
        if tokens.len() != expected {
            return Err(DecodeError::TokenCount {
                expected,
                actual: tokens.len(),
            });
        }

        let body_temp_c = parse_float(&tokens, 0)?;
        let ambient_temp_c = parse_float(&tokens, 1)?;
        let heart_rate_raw = if self.layout.has_heart_rate() {
            Some(parse_int(&tokens, 2)?)
        } else {
            None
        };
        let base = self.layout.motion_offset();
        let mut accel_raw = [0; 3];
        let mut gyro_raw = [0; 3];
        for axis in 0..3 {
            accel_raw[axis] = parse_int(&tokens, base + axis)?;
            gyro_raw[axis] = parse_int(&tokens, base + 3 + axis)?;
        }

        Ok(Some(RawSample {
            body_temp_c,
            ambient_temp_c,
            heart_rate_raw,
            accel_raw,
            gyro_raw,
        }))
    }

    fn is_banner(&self, line: &str) -> bool {
        self.banner_markers
            .iter()
            .any(|marker| !marker.is_empty() && line.contains(marker.as_str()))
    }
}

fn parse_float(tokens: &[&str], index: usize) -> Result<f64, DecodeError> {
    tokens[index]
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid(tokens, index))
}

fn parse_int(tokens: &[&str], index: usize) -> Result<i32, DecodeError> {
    tokens[index]
        .parse::<i32>()
        .map_err(|_| invalid(tokens, index))
}

fn invalid(tokens: &[&str], index: usize) -> DecodeError {
    DecodeError::InvalidField {
        index,
        token: tokens[index].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["Bluetooth".into(), "Format".into()]
    }

    #[test]
    fn nine_field_line_decodes_every_field() {
        let decoder = FrameDecoder::new(WireLayout::NineField, markers());
        let sample = decoder
            .parse_line("37.1,22.4,72,1638,-512,16100,0,0,131")
            .unwrap()
            .unwrap();
        assert_eq!(sample.body_temp_c, 37.1);
        assert_eq!(sample.ambient_temp_c, 22.4);
        assert_eq!(sample.heart_rate_raw, Some(72));
        assert_eq!(sample.accel_raw, [1638, -512, 16100]);
        assert_eq!(sample.gyro_raw, [0, 0, 131]);
        assert_eq!(sample.gyro_z(), 131);
    }

    #[test]
    fn eight_field_line_has_no_heart_rate() {
        let decoder = FrameDecoder::new(WireLayout::EightField, markers());
        let sample = decoder
            .parse_line(" 36.5 , 21.0 , 100, 200, 16384, -5, 6, -262 ")
            .unwrap()
            .unwrap();
        assert_eq!(sample.heart_rate_raw, None);
        assert_eq!(sample.accel_raw, [100, 200, 16384]);
        assert_eq!(sample.gyro_raw, [-5, 6, -262]);
        let g = sample.accel_g(16384.0);
        assert!((g[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn layouts_are_not_mixed() {
        let nine = FrameDecoder::new(WireLayout::NineField, markers());
        let eight = FrameDecoder::new(WireLayout::EightField, markers());
        assert_eq!(
            nine.parse_line("36.5,21.0,100,200,16384,-5,6,-262"),
            Err(DecodeError::TokenCount {
                expected: 9,
                actual: 8
            })
        );
        assert!(eight.parse_line("37.1,22.4,72,1638,-512,16100,0,0,131").is_err());
    }

    #[test]
    fn malformed_lines_are_skipped_in_order() {
        let decoder = FrameDecoder::new(WireLayout::NineField, markers());
        let chunk = "37.0,22.0,70,1,2,3,4,5,6\n\
                     37.1,abc,71,1,2,3,4,5,6\n\
                     37.2,22.0,72,1,2,3,4,5\n\
                     37.3,22.0,73,1,2,3,4,5,6\n\
                     37.4,22.0,7.5,1,2,3,4,5,6\n\
                     37.5,NaN,75,1,2,3,4,5,6\n\
                     37.6,22.0,76,1,2,3,4,5,6";
        let decoded = decoder.decode_counted(chunk);
        let rates: Vec<_> = decoded.samples.iter().map(|s| s.heart_rate_raw).collect();
        assert_eq!(rates, vec![Some(70), Some(73), Some(76)]);
        assert_eq!(decoded.skipped, 4);

        let lazy: Vec<_> = decoder.decode(chunk).collect();
        assert_eq!(lazy, decoded.samples);
    }

    #[test]
    fn banner_and_blank_lines_are_not_errors() {
        let decoder = FrameDecoder::new(WireLayout::NineField, markers());
        let chunk = "Bluetooth Connected\n\n   \n37.1,22.4,72,1638,-512,16100,0,0,131\r\n\
                     Format: T1,T2,HR,AX,AY,AZ,GX,GY,GZ\n";
        let decoded = decoder.decode_counted(chunk);
        assert_eq!(decoded.samples.len(), 1);
        assert_eq!(decoded.skipped, 0);
    }

    #[test]
    fn banner_markers_are_configurable_and_case_sensitive() {
        let decoder = FrameDecoder::new(WireLayout::NineField, vec!["READY".into()]);
        assert_eq!(decoder.parse_line("BOARD READY"), Ok(None));
        // not a configured marker, so it is parsed and rejected
        assert!(decoder.parse_line("Bluetooth Connected").is_err());
        assert!(decoder.parse_line("board ready").is_err());
    }

    #[test]
    fn empty_chunk_yields_nothing() {
        let decoder = FrameDecoder::new(WireLayout::NineField, markers());
        assert_eq!(decoder.decode_counted(""), DecodedChunk::default());
        assert_eq!(decoder.decode("\n\n").count(), 0);
    }
}
