use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use visbridge_core::{
    audio, AppConfig, AudioSource, CpalSource, Streamer, SyntheticSource, VisBridgeError,
    WsServer,
};

fn main() -> visbridge_core::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.list_devices {
        for name in audio::list_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let config = cli.resolve_config()?;
    config.validate()?;

    let protocol = &config.protocol;
    tracing::info!(
        fft_size = protocol.fft_size,
        bar_count = protocol.bar_count,
        sample_rate = protocol.sample_rate,
        send_fps = protocol.send_fps,
        "visualiser audio bridge starting"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .map_err(|err| VisBridgeError::msg(format!("cannot install signal handler: {err}")))?;
    }

    let server = WsServer::bind(protocol, &config.server)?;

    match cli.test_tone {
        Some(frequency) => {
            tracing::info!(frequency, "streaming a synthetic test tone");
            let source = SyntheticSource::tone(frequency, 0.5, protocol.sample_rate).paced(true);
            run(source, server, &config, &shutdown)
        }
        None => {
            let source = CpalSource::open(protocol, &config.capture)?;
            run(source, server, &config, &shutdown)
        }
    }
}

fn run<S: AudioSource>(
    source: S,
    server: WsServer,
    config: &AppConfig,
    shutdown: &AtomicBool,
) -> visbridge_core::Result<()> {
    let mut streamer = Streamer::new(
        source,
        server,
        &config.protocol,
        &config.stream,
        config.capture.read_timeout(),
    );
    let stats = streamer.run(shutdown);
    if stats.capture_failed {
        tracing::warn!(
            blocks_read = stats.blocks_read,
            "audio capture stopped, exiting after releasing the client"
        );
    }
    tracing::info!(
        frames_sent = stats.frames_sent,
        clients_lost = stats.clients_lost,
        "clean shutdown"
    );
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Streams live audio spectrum bars to a local visualiser client",
    long_about = None
)]
struct Cli {
    /// JSON configuration file. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port the WebSocket listener binds to.
    #[arg(short, long)]
    port: Option<u16>,

    /// Address the WebSocket listener binds to.
    #[arg(long)]
    bind: Option<String>,

    /// Target frames per second sent to the client.
    #[arg(long)]
    fps: Option<u32>,

    /// Capture from the first device whose name contains this text instead
    /// of the output monitor.
    #[arg(short, long)]
    device: Option<String>,

    /// Stream a sine tone of this frequency (Hz) instead of captured audio.
    #[arg(long, value_name = "HZ")]
    test_tone: Option<f32>,

    /// Print the available capture devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn resolve_config(&self) -> visbridge_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => {
                tracing::debug!(?path, "loading configuration");
                AppConfig::load(path)?
            }
            None => AppConfig::default(),
        };

        if let Some(port) = self.port {
            config.protocol.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(fps) = self.fps {
            config.protocol.send_fps = fps;
        }
        if let Some(device) = &self.device {
            config.capture.device = Some(device.clone());
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from(["vis-capture", "--port", "9001", "--fps", "30", "-d", "monitor"]);
        let config = cli.resolve_config().unwrap();

        assert_eq!(config.protocol.port, 9001);
        assert_eq!(config.protocol.send_fps, 30);
        assert_eq!(config.capture.device.as_deref(), Some("monitor"));
        assert_eq!(config.server.bind_address, "127.0.0.1");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["vis-capture", "--config", "/nonexistent/visbridge.json"]);
        assert!(matches!(cli.resolve_config(), Err(VisBridgeError::Io(_))));
    }
}
