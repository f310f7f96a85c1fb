use crate::ProtocolConfig;

/// Lower bound of the normalised loudness range, in dB.
pub const DB_FLOOR: f32 = -60.0;
const LEVEL_EPSILON: f32 = 1e-10;

/// Inclusive range of FFT bins averaged into one bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinRange {
    pub low: usize,
    pub high: usize,
}

impl BinRange {
    pub fn len(&self) -> usize {
        if self.high < self.low {
            0
        } else {
            self.high - self.low + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, bin: usize) -> bool {
        (self.low..=self.high).contains(&bin)
    }
}

/// Log-spaced bin ranges, one per bar.
///
/// Bar `i` spans the frequencies `f(i)..f(i + 1)` where
/// `f(i) = freq_min * (freq_max / freq_min)^(i / bar_count)`. The DC bin is
/// never used and every range lies inside `1..=fft_size / 2 - 1`.
pub fn bin_edges(protocol: &ProtocolConfig) -> Vec<BinRange> {
    let bars = protocol.bar_count;
    let max_bin = protocol.half_size().saturating_sub(1).max(1);
    let ratio = protocol.freq_max / protocol.freq_min;
    let to_bin = |freq: f32| -> usize {
        let bin = (freq * protocol.fft_size as f32 / protocol.sample_rate as f32).round();
        if bin.is_finite() && bin > 0.0 {
            bin as usize
        } else {
            0
        }
    };

    (0..bars)
        .map(|i| {
            let f_low = protocol.freq_min * ratio.powf(i as f32 / bars as f32);
            let f_high = protocol.freq_min * ratio.powf((i + 1) as f32 / bars as f32);

            let low = to_bin(f_low).clamp(1, max_bin);
            let mut high = to_bin(f_high).min(max_bin);
            if high < low {
                high = low;
            }

            BinRange { low, high }
        })
        .collect()
}

/// Mean magnitude over `range`, or `0` when the range is empty or falls
/// outside `magnitudes`.
pub fn mean_magnitude(magnitudes: &[f32], range: BinRange) -> f32 {
    if range.is_empty() || range.low >= magnitudes.len() {
        return 0.0;
    }

    let high = range.high.min(magnitudes.len() - 1);
    let slice = &magnitudes[range.low..=high];
    slice.iter().sum::<f32>() / slice.len() as f32
}

/// Maps a mean bin magnitude onto `[0, 1]`: the value is scaled by
/// `fft_size / 2`, converted to dB and normalised against a -60 dB..0 dB
/// range.
pub fn magnitude_to_level(mean: f32, fft_size: usize) -> f32 {
    let reference = fft_size as f32 * 0.5;
    let db = 20.0 * (mean / reference + LEVEL_EPSILON).log10();
    let level = (db - DB_FLOOR) / -DB_FLOOR;

    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocols() -> Vec<ProtocolConfig> {
        let base = ProtocolConfig::default();
        vec![
            base.clone(),
            ProtocolConfig {
                fft_size: 256,
                bar_count: 64,
                ..base.clone()
            },
            ProtocolConfig {
                fft_size: 4096,
                bar_count: 7,
                sample_rate: 48_000,
                freq_min: 20.0,
                freq_max: 24_000.0,
                ..base.clone()
            },
            ProtocolConfig {
                fft_size: 8,
                bar_count: 10,
                ..base
            },
        ]
    }

    #[test]
    fn edges_stay_inside_usable_bins_and_never_decrease() {
        for protocol in protocols() {
            let edges = bin_edges(&protocol);
            let max_bin = protocol.fft_size / 2 - 1;
            assert_eq!(edges.len(), protocol.bar_count);

            for edge in &edges {
                assert!(1 <= edge.low, "{edge:?}");
                assert!(edge.low <= edge.high, "{edge:?}");
                assert!(edge.high <= max_bin, "{edge:?}");
            }
            for pair in edges.windows(2) {
                assert!(pair[0].low <= pair[1].low);
                assert!(pair[0].high <= pair[1].high);
            }
        }
    }

    #[test]
    fn default_edges_follow_rounded_log_mapping() {
        let protocol = ProtocolConfig::default();
        let edges = bin_edges(&protocol);

        // 40 Hz * 1024 / 44100 = 0.93 -> bin 1
        assert_eq!(edges[0].low, 1);
        // 16 kHz * 1024 / 44100 = 371.5 -> bin 372
        assert_eq!(edges[protocol.bar_count - 1].high, 372);
    }

    #[test]
    fn empty_range_means_zero() {
        let magnitudes = [1.0, 2.0, 3.0];
        assert_eq!(mean_magnitude(&magnitudes, BinRange { low: 2, high: 1 }), 0.0);
        assert_eq!(mean_magnitude(&magnitudes, BinRange { low: 5, high: 6 }), 0.0);
        assert_eq!(mean_magnitude(&magnitudes, BinRange { low: 1, high: 2 }), 2.5);
    }

    #[test]
    fn level_is_bounded_for_any_finite_magnitude() {
        for mean in [0.0, 1e-30, 1e-3, 0.5, 1.0, 512.0, 1e6, f32::MAX] {
            let level = magnitude_to_level(mean, 1024);
            assert!((0.0..=1.0).contains(&level), "{mean} -> {level}");
        }
        assert_eq!(magnitude_to_level(0.0, 1024), 0.0);
        assert_eq!(magnitude_to_level(512.0, 1024), 1.0);
        assert_eq!(magnitude_to_level(f32::NAN, 1024), 0.0);
    }

    #[test]
    fn level_is_linear_in_db() {
        // -30 dB relative to full scale lands halfway.
        let mean = 512.0 * 10f32.powf(-30.0 / 20.0);
        let level = magnitude_to_level(mean, 1024);
        assert!((level - 0.5).abs() < 1e-3, "{level}");
    }
}
