use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Result, VisBridgeError};

/// Samples per analysis window. Must be a power of two.
pub const FFT_SIZE: usize = 1024;
/// Number of bars in every frame sent to the client.
pub const BAR_COUNT: usize = 24;
/// Capture rate in Hz. Audio is requested at exactly this rate.
pub const SAMPLE_RATE: u32 = 44_100;
/// Lowest frequency (Hz) covered by the first bar.
pub const FREQ_MIN: f32 = 40.0;
/// Highest frequency (Hz) covered by the last bar.
pub const FREQ_MAX: f32 = 16_000.0;
/// TCP port the WebSocket listener binds to.
pub const WS_PORT: u16 = 8765;
/// Target number of frames per second pushed to the client.
pub const SEND_FPS: u32 = 60;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub protocol: ProtocolConfig,
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    #[serde(rename = "loop")]
    pub stream: LoopConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Fields missing from the file keep
    /// their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Checks every section. Called once at startup before any device or
    /// socket is opened.
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        if self.capture.read_timeout_ms == 0 {
            return Err(VisBridgeError::invalid_config(
                "capture.read_timeout_ms must be positive",
            ));
        }
        if self.capture.queue_blocks == 0 {
            return Err(VisBridgeError::invalid_config(
                "capture.queue_blocks must be positive",
            ));
        }
        Ok(())
    }
}

/// Constants shared with the client. Every downstream computation is
/// defined in terms of these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub fft_size: usize,
    pub bar_count: usize,
    pub sample_rate: u32,
    pub freq_min: f32,
    pub freq_max: f32,
    pub port: u16,
    pub send_fps: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            fft_size: FFT_SIZE,
            bar_count: BAR_COUNT,
            sample_rate: SAMPLE_RATE,
            freq_min: FREQ_MIN,
            freq_max: FREQ_MAX,
            port: WS_PORT,
            send_fps: SEND_FPS,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fft_size < 4 || !self.fft_size.is_power_of_two() {
            return Err(VisBridgeError::invalid_config(format!(
                "fft_size must be a power of two >= 4, got {}",
                self.fft_size
            )));
        }
        if self.bar_count == 0 {
            return Err(VisBridgeError::invalid_config("bar_count must be positive"));
        }
        if self.sample_rate == 0 {
            return Err(VisBridgeError::invalid_config("sample_rate must be positive"));
        }
        if !(self.freq_min > 0.0 && self.freq_min < self.freq_max) {
            return Err(VisBridgeError::invalid_config(format!(
                "frequency range must satisfy 0 < freq_min < freq_max, got {}..{}",
                self.freq_min, self.freq_max
            )));
        }
        if self.freq_max > self.nyquist() {
            return Err(VisBridgeError::invalid_config(format!(
                "freq_max {} Hz exceeds the Nyquist frequency {} Hz",
                self.freq_max,
                self.nyquist()
            )));
        }
        if self.send_fps == 0 {
            return Err(VisBridgeError::invalid_config("send_fps must be positive"));
        }
        Ok(())
    }

    /// Time between two sent frames: `1_000_000 / send_fps` microseconds.
    pub fn send_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.send_fps.max(1)))
    }

    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 * 0.5
    }

    /// Number of meaningful bins for real-valued input.
    pub fn half_size(&self) -> usize {
        self.fft_size / 2
    }

    /// Size of one binary frame on the wire.
    pub fn frame_bytes(&self) -> usize {
        self.bar_count * std::mem::size_of::<f32>()
    }
}

/// Settings for the WebSocket listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Upper bound on the time a connecting client may take to finish the
    /// upgrade handshake.
    pub handshake_timeout_ms: u64,
    /// Upper bound on a single frame write before the client is dropped.
    pub send_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            handshake_timeout_ms: 500,
            send_timeout_ms: 100,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }
}

/// Settings for the audio source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Substring of the device name to capture from. When unset the
    /// platform's monitor/loopback endpoint is used.
    pub device: Option<String>,
    /// How long a single read waits before the loop re-checks for shutdown.
    pub read_timeout_ms: u64,
    /// Capacity of the sample ring between the backend callback and the
    /// loop, in analysis blocks.
    pub queue_blocks: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            read_timeout_ms: 100,
            queue_blocks: 8,
        }
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Pacing of the main loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Sleep between polls while no client is attached.
    pub idle_sleep_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { idle_sleep_ms: 50 }
    }
}

impl LoopConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.protocol.frame_bytes(), 96);
        assert_eq!(config.protocol.send_interval(), Duration::from_micros(16_666));
    }

    #[test]
    fn rejects_non_power_of_two_fft() {
        let protocol = ProtocolConfig {
            fft_size: 1000,
            ..Default::default()
        };
        assert!(matches!(
            protocol.validate(),
            Err(VisBridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_range_above_nyquist() {
        let protocol = ProtocolConfig {
            freq_max: 30_000.0,
            ..Default::default()
        };
        assert!(protocol.validate().is_err());

        let inverted = ProtocolConfig {
            freq_min: 500.0,
            freq_max: 100.0,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{ "protocol": { "port": 9000 }, "loop": { "idle_sleep_ms": 10 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.protocol.port, 9000);
        assert_eq!(config.protocol.fft_size, FFT_SIZE);
        assert_eq!(config.stream.idle_sleep(), Duration::from_millis(10));
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("visbridge-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "capture": { "device": "Monitor of Speakers" } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.capture.device.as_deref(), Some("Monitor of Speakers"));
        assert_eq!(config.capture.queue_blocks, 8);
    }
}
