//! Core library for the visualiser audio bridge.
//!
//! Live system audio is captured in fixed-size mono blocks, transformed into
//! a small set of log-spaced, normalised frequency bars and pushed to a single
//! local WebSocket client at a fixed frame rate. Each module owns one stage of
//! that pipeline; [`pipeline::Streamer`] ties them together.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod server;

pub use analysis::{BarFrame, BinRange, SpectrumAnalyzer, SpectrumTables};
pub use audio::{AudioSource, CpalSource, ReadStatus, SyntheticSource};
pub use config::{AppConfig, CaptureConfig, LoopConfig, ProtocolConfig, ServerConfig};
pub use error::{Result, VisBridgeError};
pub use pipeline::{SendPacer, StreamState, StreamStats, Streamer};
pub use server::{FrameSink, WsServer};
