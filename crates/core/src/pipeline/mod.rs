use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, trace};

use crate::{
    AudioSource, FrameSink, LoopConfig, ProtocolConfig, ReadStatus, Result, SpectrumAnalyzer,
};

/// Lifecycle of the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No client attached; no audio is read.
    Idle,
    /// A client is attached; blocks are captured, analysed and sent.
    Streaming,
    /// Terminal.
    ShuttingDown,
}

/// Limiter for the send cadence.
///
/// After every released frame the next one is due one full interval later,
/// measured from the moment of release. Consecutive sends are therefore never
/// closer than the interval, however often [`SendPacer::ready`] is called.
#[derive(Debug, Clone)]
pub struct SendPacer {
    interval: Duration,
    next_send: Option<Instant>,
}

impl SendPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_send: None,
        }
    }

    /// Forgets the schedule so the next call to `ready` fires immediately.
    pub fn reset(&mut self) {
        self.next_send = None;
    }

    /// Whether a frame may go out at `now`. A `true` result starts the next
    /// interval.
    pub fn ready(&mut self, now: Instant) -> bool {
        if matches!(self.next_send, Some(due) if now < due) {
            return false;
        }
        self.next_send = Some(now + self.interval);
        true
    }
}

/// Counters collected over the lifetime of a [`Streamer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub blocks_read: u64,
    pub read_timeouts: u64,
    pub frames_computed: u64,
    pub frames_sent: u64,
    pub clients_lost: u64,
    /// The loop ended because the audio source failed rather than on request.
    pub capture_failed: bool,
}

/// The main loop: polls the sink, reads audio while a client is attached
/// and forwards paced bar frames.
pub struct Streamer<S, K> {
    source: S,
    sink: K,
    analyzer: SpectrumAnalyzer,
    block: Vec<f32>,
    pacer: SendPacer,
    idle_sleep: Duration,
    read_timeout: Duration,
    state: StreamState,
    stats: StreamStats,
}

impl<S: AudioSource, K: FrameSink> Streamer<S, K> {
    pub fn new(
        source: S,
        sink: K,
        protocol: &ProtocolConfig,
        settings: &LoopConfig,
        read_timeout: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            analyzer: SpectrumAnalyzer::new(protocol),
            block: vec![0.0; protocol.fft_size],
            pacer: SendPacer::new(protocol.send_interval()),
            idle_sleep: settings.idle_sleep(),
            read_timeout,
            state: StreamState::Idle,
            stats: StreamStats::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Runs until `shutdown` is set or capture fails, then releases the
    /// client.
    ///
    /// A capture failure ends the loop like a shutdown request does; it is
    /// logged and recorded in [`StreamStats::capture_failed`]. The flag is
    /// checked once per iteration, so shutdown latency is bounded by one read
    /// timeout plus one poll.
    pub fn run(&mut self, shutdown: &AtomicBool) -> StreamStats {
        info!("waiting for a client");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested");
                break;
            }
            if let Err(err) = self.step() {
                error!(stage = "capture", %err, "audio capture failed, shutting down");
                self.stats.capture_failed = true;
                break;
            }
        }

        self.shut_down();
        self.stats
    }

    /// Performs one loop iteration and returns the resulting state.
    pub fn step(&mut self) -> Result<StreamState> {
        if self.state == StreamState::ShuttingDown {
            return Ok(self.state);
        }

        self.sink.poll();

        if !self.sink.has_client() {
            if self.state == StreamState::Streaming {
                self.enter_idle()?;
            }
            thread::sleep(self.idle_sleep);
            return Ok(self.state);
        }

        if self.state == StreamState::Idle {
            self.enter_streaming()?;
        }

        match self.source.read_block(&mut self.block, self.read_timeout) {
            Ok(ReadStatus::Filled) => self.stats.blocks_read += 1,
            Ok(ReadStatus::TimedOut) => {
                self.stats.read_timeouts += 1;
                trace!("audio read timed out");
                return Ok(self.state);
            }
            Err(err) => {
                self.state = StreamState::ShuttingDown;
                return Err(err);
            }
        }

        let frame = match self.analyzer.compute_bars(&self.block) {
            Ok(frame) => frame,
            Err(err) => {
                error!(stage = "transform", %err, "dropping block");
                return Ok(self.state);
            }
        };
        self.stats.frames_computed += 1;

        if self.pacer.ready(Instant::now()) {
            if self.sink.send(&frame) {
                self.stats.frames_sent += 1;
            } else {
                self.stats.clients_lost += 1;
                debug!(stage = "send", "frame not delivered");
                self.enter_idle()?;
            }
        }

        Ok(self.state)
    }

    fn enter_streaming(&mut self) -> Result<()> {
        info!("client attached, streaming");
        self.source.resume()?;
        self.pacer.reset();
        self.state = StreamState::Streaming;
        Ok(())
    }

    fn enter_idle(&mut self) -> Result<()> {
        info!(
            frames_sent = self.stats.frames_sent,
            "client gone, idling"
        );
        self.state = StreamState::Idle;
        self.source.pause()
    }

    fn shut_down(&mut self) {
        if self.state == StreamState::Streaming {
            if let Err(err) = self.source.pause() {
                debug!(%err, "pausing capture during shutdown failed");
            }
        }
        self.state = StreamState::ShuttingDown;
        self.sink.stop();
        info!(
            blocks_read = self.stats.blocks_read,
            frames_sent = self.stats.frames_sent,
            "stream stopped"
        );
    }

    /// Consumes the streamer, handing back the source and sink.
    pub fn into_parts(self) -> (S, K) {
        (self.source, self.sink)
    }
}
