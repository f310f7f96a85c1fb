use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use tracing::{debug, info, trace, warn};

use super::{AudioSource, ReadStatus};
use crate::{CaptureConfig, ProtocolConfig, Result, VisBridgeError};

#[cfg(target_os = "linux")]
const MONITOR_SOURCE: &str = "@DEFAULT_MONITOR@";

/// How often a waiting read checks the ring for new samples.
const READ_POLL: Duration = Duration::from_millis(2);

/// Live capture from the platform's output monitor / loopback endpoint.
///
/// The backend callback copies samples into a preallocated ring buffer and
/// never allocates. [`AudioSource::read_block`] waits until a whole block is
/// available and pops it out.
pub struct CpalSource {
    stream: cpal::Stream,
    device_name: String,
    samples: HeapConsumer<f32>,
    stream_error: Arc<Mutex<Option<String>>>,
    dropped_samples: Arc<AtomicUsize>,
    reported_drops: usize,
}

impl CpalSource {
    /// Opens the capture stream in a paused state.
    ///
    /// Requests mono `f32` at the protocol sample rate with a buffer of one
    /// FFT window. No resampling or channel mixing is performed, so a
    /// backend that cannot provide this format is an error.
    pub fn open(protocol: &ProtocolConfig, capture: &CaptureConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, capture.device.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());

        let buffer_size = fixed_buffer_size(&device, protocol.fft_size);
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(protocol.sample_rate),
            buffer_size,
        };
        debug!(device = %device_name, ?config, "building capture stream");

        let ring = HeapRb::<f32>::new(protocol.fft_size * capture.queue_blocks);
        let (mut producer, consumer) = ring.split();
        let stream_error = Arc::new(Mutex::new(None));
        let dropped_samples = Arc::new(AtomicUsize::new(0));

        let error_slot = stream_error.clone();
        let drops = dropped_samples.clone();
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    push_samples(&mut producer, &drops, data);
                },
                move |err| {
                    if let Ok(mut slot) = error_slot.lock() {
                        slot.get_or_insert_with(|| err.to_string());
                    }
                },
                None,
            )
            .map_err(|err| {
                VisBridgeError::capture(format!("cannot open stream on {device_name}: {err}"))
            })?;

        // Some backends start streams immediately.
        if let Err(err) = stream.pause() {
            debug!(%err, "backend does not support pausing the capture stream");
        }

        info!(
            device = %device_name,
            sample_rate = protocol.sample_rate,
            fft_size = protocol.fft_size,
            ring_blocks = capture.queue_blocks,
            "audio capture opened"
        );

        Ok(Self {
            stream,
            device_name,
            samples: consumer,
            stream_error,
            dropped_samples,
            reported_drops: 0,
        })
    }

    fn check_stream_error(&self) -> Result<()> {
        let slot = self
            .stream_error
            .lock()
            .map_err(|_| VisBridgeError::capture("stream error slot has been poisoned"))?;
        match slot.as_ref() {
            Some(err) => Err(VisBridgeError::capture(format!(
                "{} reported: {err}",
                self.device_name
            ))),
            None => Ok(()),
        }
    }

    fn report_drops(&mut self) {
        let dropped = self.dropped_samples.load(Ordering::Relaxed);
        if dropped > self.reported_drops {
            trace!(
                dropped = dropped - self.reported_drops,
                "capture ring full, samples discarded"
            );
            self.reported_drops = dropped;
        }
    }
}

impl AudioSource for CpalSource {
    fn read_block(&mut self, block: &mut [f32], timeout: Duration) -> Result<ReadStatus> {
        let deadline = Instant::now() + timeout;

        while self.samples.len() < block.len() {
            self.check_stream_error()?;

            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadStatus::TimedOut);
            }
            thread::sleep(READ_POLL.min(deadline - now));
        }

        self.report_drops();
        let copied = self.samples.pop_slice(block);
        debug_assert_eq!(copied, block.len());
        Ok(ReadStatus::Filled)
    }

    fn pause(&mut self) -> Result<()> {
        if let Err(err) = self.stream.pause() {
            warn!(stage = "capture", %err, "could not pause capture stream");
        }
        Ok(())
    }

    /// Drops whatever was buffered while paused so the first block is current.
    fn resume(&mut self) -> Result<()> {
        let discarded = self.samples.clear();
        if discarded > 0 {
            debug!(samples = discarded, "discarded stale audio");
        }
        self.stream
            .play()
            .map_err(|err| VisBridgeError::capture(format!("cannot start stream: {err}")))
    }
}

impl fmt::Debug for CpalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalSource")
            .field("device_name", &self.device_name)
            .field("buffered", &self.samples.len())
            .field("capacity", &self.samples.capacity())
            .finish()
    }
}

/// Runs on the backend's audio thread. Samples that do not fit are counted
/// and dropped.
fn push_samples(producer: &mut HeapProducer<f32>, drops: &AtomicUsize, data: &[f32]) {
    let pushed = producer.push_slice(data);
    if pushed < data.len() {
        drops.fetch_add(data.len() - pushed, Ordering::Relaxed);
    }
}

/// Names of the capture devices the default host exposes.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|err| VisBridgeError::capture(format!("cannot enumerate devices: {err}")))?;
    Ok(devices.filter_map(|device| device.name().ok()).collect())
}

fn select_device(host: &cpal::Host, requested: Option<&str>) -> Result<cpal::Device> {
    if let Some(wanted) = requested {
        return find_input_device(host, wanted)?.ok_or_else(|| {
            VisBridgeError::capture(format!("no capture device matching {wanted:?}"))
        });
    }

    platform_monitor_device(host)
}

fn find_input_device(host: &cpal::Host, wanted: &str) -> Result<Option<cpal::Device>> {
    let wanted = wanted.to_lowercase();
    let mut devices = host
        .input_devices()
        .map_err(|err| VisBridgeError::capture(format!("cannot enumerate devices: {err}")))?;
    Ok(devices.find(|device| {
        device
            .name()
            .map(|name| name.to_lowercase().contains(&wanted))
            .unwrap_or(false)
    }))
}

/// PulseAudio and PipeWire read the source to record from out of
/// `PULSE_SOURCE`; the ALSA `pulse` device then yields the monitor of the
/// default sink.
#[cfg(target_os = "linux")]
fn platform_monitor_device(host: &cpal::Host) -> Result<cpal::Device> {
    if std::env::var_os("PULSE_SOURCE").is_none() {
        std::env::set_var("PULSE_SOURCE", MONITOR_SOURCE);
    }

    if let Some(device) = find_input_device(host, "pulse")? {
        return Ok(device);
    }

    warn!("no pulse capture device found, falling back to the default input");
    host.default_input_device()
        .ok_or_else(|| VisBridgeError::capture("no default input device available"))
}

/// WASAPI captures the output mix when an input stream is built on an
/// output device.
#[cfg(target_os = "windows")]
fn platform_monitor_device(host: &cpal::Host) -> Result<cpal::Device> {
    host.default_output_device()
        .ok_or_else(|| VisBridgeError::capture("no default output device available for loopback"))
}

/// No native loopback here; a virtual loopback driver set as the default
/// input, or an explicit device name, provides the output mix.
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn platform_monitor_device(host: &cpal::Host) -> Result<cpal::Device> {
    host.default_input_device()
        .ok_or_else(|| VisBridgeError::capture("no default input device available"))
}

fn fixed_buffer_size(device: &cpal::Device, frames: usize) -> cpal::BufferSize {
    let Ok(frames) = u32::try_from(frames) else {
        return cpal::BufferSize::Default;
    };

    let supported = match device.supported_input_configs() {
        Ok(mut configs) => configs.any(|range| match range.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => (*min..=*max).contains(&frames),
            cpal::SupportedBufferSize::Unknown => false,
        }),
        Err(_) => false,
    };

    if supported {
        cpal::BufferSize::Fixed(frames)
    } else {
        cpal::BufferSize::Default
    }
}
