//! Spectrum analysis: windowing, FFT and log-spaced bar binning.

mod bins;
mod fft;

use std::fmt;

use num_complex::Complex32;

use crate::{ProtocolConfig, Result, VisBridgeError};

pub use bins::{bin_edges, magnitude_to_level, mean_magnitude, BinRange, DB_FLOOR};
pub use fft::{fft_in_place, hann_window};

/// Window coefficients and bin edges derived from the protocol constants.
///
/// Built once at startup and only read afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumTables {
    fft_size: usize,
    window: Vec<f32>,
    edges: Vec<BinRange>,
}

impl SpectrumTables {
    /// Precomputes the Hanning window and the bar edges for `protocol`.
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            fft_size: protocol.fft_size,
            window: hann_window(protocol.fft_size),
            edges: bin_edges(protocol),
        }
    }

    /// Samples per analysis block.
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of bars, one per edge.
    pub fn bar_count(&self) -> usize {
        self.edges.len()
    }

    /// Hanning coefficients, `fft_size` of them.
    pub fn window(&self) -> &[f32] {
        &self.window
    }

    /// Bin range of every bar, lowest frequency first.
    pub fn edges(&self) -> &[BinRange] {
        &self.edges
    }
}

/// One frame of normalised bar levels, each in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarFrame {
    values: Vec<f32>,
}

impl BarFrame {
    /// Wraps already normalised levels.
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Levels in bar order.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Number of bars in the frame.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for a frame without bars.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index and value of the loudest bar.
    pub fn peak_bar(&self) -> Option<(usize, f32)> {
        self.values
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Wire encoding: the values as consecutive little-endian `f32`s.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`BarFrame::to_le_bytes`]. Trailing bytes that do not form
    /// a whole `f32` are ignored.
    #[cfg(test)]
    pub(crate) fn from_le_bytes(bytes: &[u8]) -> Self {
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Self { values }
    }
}

/// Turns sample blocks into bar frames.
///
/// Owns the immutable [`SpectrumTables`] plus scratch buffers that are
/// reused between calls.
pub struct SpectrumAnalyzer {
    tables: SpectrumTables,
    spectrum: Vec<Complex32>,
    magnitudes: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self::with_tables(SpectrumTables::new(protocol))
    }

    pub fn with_tables(tables: SpectrumTables) -> Self {
        let size = tables.fft_size();
        Self {
            tables,
            spectrum: vec![Complex32::new(0.0, 0.0); size],
            magnitudes: vec![0.0; size / 2],
        }
    }

    pub fn tables(&self) -> &SpectrumTables {
        &self.tables
    }

    /// Windows `samples`, transforms them and bins the magnitudes into one
    /// frame. `samples` must hold exactly `fft_size` values.
    pub fn compute_bars(&mut self, samples: &[f32]) -> Result<BarFrame> {
        if samples.len() != self.tables.fft_size() {
            return Err(VisBridgeError::msg(format!(
                "sample block holds {} samples, expected {}",
                samples.len(),
                self.tables.fft_size()
            )));
        }

        for ((slot, sample), weight) in self
            .spectrum
            .iter_mut()
            .zip(samples)
            .zip(self.tables.window())
        {
            *slot = Complex32::new(sample * weight, 0.0);
        }

        fft_in_place(&mut self.spectrum);

        for (magnitude, bin) in self.magnitudes.iter_mut().zip(&self.spectrum) {
            *magnitude = bin.norm();
        }

        Ok(self.bars_from_magnitudes())
    }

    fn bars_from_magnitudes(&self) -> BarFrame {
        let fft_size = self.tables.fft_size();
        let values = self
            .tables
            .edges()
            .iter()
            .map(|&range| magnitude_to_level(mean_magnitude(&self.magnitudes, range), fft_size))
            .collect();
        BarFrame::new(values)
    }
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("fft_size", &self.tables.fft_size())
            .field("bar_count", &self.tables.bar_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn tone(freq: f32, amplitude: f32, protocol: &ProtocolConfig) -> Vec<f32> {
        (0..protocol.fft_size)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / protocol.sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn silence_produces_zero_bars() {
        let protocol = ProtocolConfig::default();
        let mut analyzer = SpectrumAnalyzer::new(&protocol);

        let frame = analyzer.compute_bars(&vec![0.0; protocol.fft_size]).unwrap();

        assert_eq!(frame.len(), protocol.bar_count);
        assert!(frame.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn one_kilohertz_tone_lights_its_own_bar() {
        let protocol = ProtocolConfig {
            fft_size: 1024,
            bar_count: 24,
            sample_rate: 44_100,
            ..Default::default()
        };
        let mut analyzer = SpectrumAnalyzer::new(&protocol);
        let frame = analyzer.compute_bars(&tone(1_000.0, 1.0, &protocol)).unwrap();

        let expected_bin = (1_000.0 * protocol.fft_size as f32 / protocol.sample_rate as f32).round()
            as usize;
        let (peak, level) = frame.peak_bar().unwrap();
        let peak_range = analyzer.tables().edges()[peak];
        assert!(
            peak_range.low <= expected_bin + 1 && peak_range.high + 1 >= expected_bin,
            "peak bar {peak} covers {peak_range:?}, tone is at bin {expected_bin}"
        );
        assert!(level > 0.5, "peak level {level}");

        for (bar, range) in analyzer.tables().edges().iter().enumerate() {
            let distant = range.high + 12 < expected_bin || range.low > expected_bin + 12;
            if distant {
                assert!(frame.values()[bar] < 0.05, "bar {bar} {range:?} = {}", frame.values()[bar]);
            }
        }
    }

    #[test]
    fn bars_stay_normalised_for_arbitrary_input() {
        let protocol = ProtocolConfig::default();
        let mut analyzer = SpectrumAnalyzer::new(&protocol);

        let mut state = 0x2545_f491_u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as f32 / u32::MAX as f32 * 2.0 - 1.0
        };

        for scale in [1e-6_f32, 1.0, 1e3, 1e12] {
            let block: Vec<f32> = (0..protocol.fft_size).map(|_| next() * scale).collect();
            let frame = analyzer.compute_bars(&block).unwrap();
            assert!(
                frame.values().iter().all(|v| (0.0..=1.0).contains(v)),
                "scale {scale}: {:?}",
                frame.values()
            );
        }

        let square: Vec<f32> = (0..protocol.fft_size)
            .map(|i| if (i / 16) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let frame = analyzer.compute_bars(&square).unwrap();
        assert!(frame.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn rejects_wrong_block_length() {
        let mut analyzer = SpectrumAnalyzer::new(&ProtocolConfig::default());
        assert!(analyzer.compute_bars(&[0.0; 100]).is_err());
    }

    #[test]
    fn frame_encodes_little_endian_floats() {
        let frame = BarFrame::new(vec![0.0, 0.5, 1.0]);
        let bytes = frame.to_le_bytes();

        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[4..8], &0.5_f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(BarFrame::from_le_bytes(&bytes), frame);
    }

    #[test]
    fn tables_match_protocol_dimensions() {
        let protocol = ProtocolConfig {
            fft_size: 512,
            bar_count: 16,
            ..Default::default()
        };
        let tables = SpectrumTables::new(&protocol);

        assert_eq!(tables.fft_size(), 512);
        assert_eq!(tables.window().len(), 512);
        assert_eq!(tables.bar_count(), 16);
        assert_eq!(tables.edges().len(), 16);
        assert!(!tables.edges()[0].contains(0), "DC bin must never feed a bar");
    }
}
