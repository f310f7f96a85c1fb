use std::{
    f64::consts::TAU,
    thread,
    time::{Duration, Instant},
};

use crate::{Result, VisBridgeError};

mod capture;

pub use capture::{list_devices, CpalSource};

/// Outcome of a single [`AudioSource::read_block`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The block was filled with fresh samples.
    Filled,
    /// Not enough samples arrived before the timeout. The block contents
    /// are unspecified and the caller should try again.
    TimedOut,
}

/// Mono sample provider driven by the main loop.
pub trait AudioSource {
    /// Fills `block` completely, waiting at most `timeout` for samples.
    ///
    /// An `Err` means the source is unusable and will not recover.
    fn read_block(&mut self, block: &mut [f32], timeout: Duration) -> Result<ReadStatus>;

    /// Called when the last client leaves. Sources may stop the backend.
    fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when a client attaches. Sources should discard audio buffered
    /// while paused so the first frame reflects what is playing now.
    fn resume(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Deterministic sine generator.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    frequency: f64,
    amplitude: f32,
    sample_rate: u32,
    phase: f64,
    paced: bool,
    next_block_at: Option<Instant>,
    reads: usize,
}

impl SyntheticSource {
    pub fn tone(frequency: f32, amplitude: f32, sample_rate: u32) -> Self {
        Self {
            frequency: f64::from(frequency),
            amplitude,
            sample_rate,
            phase: 0.0,
            paced: false,
            next_block_at: None,
            reads: 0,
        }
    }

    pub fn silence(sample_rate: u32) -> Self {
        Self::tone(0.0, 0.0, sample_rate)
    }

    /// Deliver blocks no faster than real time, like a capture device.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Number of completed reads so far.
    pub fn reads(&self) -> usize {
        self.reads
    }

    fn block_duration(&self, len: usize) -> Duration {
        Duration::from_secs_f64(len as f64 / f64::from(self.sample_rate.max(1)))
    }

    fn fill(&mut self, block: &mut [f32]) {
        let step = TAU * self.frequency / f64::from(self.sample_rate.max(1));
        for sample in block.iter_mut() {
            *sample = self.amplitude * self.phase.sin() as f32;
            self.phase = (self.phase + step) % TAU;
        }
    }
}

impl AudioSource for SyntheticSource {
    fn read_block(&mut self, block: &mut [f32], timeout: Duration) -> Result<ReadStatus> {
        if self.sample_rate == 0 {
            return Err(VisBridgeError::capture("synthetic source has no sample rate"));
        }

        if self.paced {
            let now = Instant::now();
            let due = *self.next_block_at.get_or_insert(now);
            let wait = due.saturating_duration_since(now);
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(ReadStatus::TimedOut);
            }
            thread::sleep(wait);
            self.next_block_at = Some(due + self.block_duration(block.len()));
        }

        self.fill(block);
        self.reads += 1;
        Ok(ReadStatus::Filled)
    }

    fn resume(&mut self) -> Result<()> {
        self.next_block_at = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn generates_continuous_tone() {
        let mut source = SyntheticSource::tone(1_000.0, 0.5, 48_000);
        let mut first = vec![0.0; 48];
        let mut second = vec![0.0; 48];

        source.read_block(&mut first, Duration::ZERO).unwrap();
        source.read_block(&mut second, Duration::ZERO).unwrap();

        // 1 kHz at 48 kHz repeats every 48 samples.
        for (a, b) in first.iter().zip(&second) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
        assert!(first.iter().all(|s| s.abs() <= 0.5 + 1e-6));
        assert_eq!(source.reads(), 2);
    }

    #[test]
    fn silence_is_all_zero() {
        let mut source = SyntheticSource::silence(44_100);
        let mut block = vec![1.0; 256];
        source.read_block(&mut block, Duration::ZERO).unwrap();
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn paced_source_times_out_instead_of_oversleeping() {
        let mut source = SyntheticSource::tone(440.0, 1.0, 1_000).paced(true);
        let mut block = vec![0.0; 500];

        assert_eq!(
            source.read_block(&mut block, Duration::from_millis(10)).unwrap(),
            ReadStatus::Filled
        );
        // The next block is due 500 ms later.
        let started = Instant::now();
        assert_eq!(
            source.read_block(&mut block, Duration::from_millis(10)).unwrap(),
            ReadStatus::TimedOut
        );
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(source.reads(), 1);
    }
}
