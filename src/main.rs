use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use washcam::config::{ClientConfig, URL_ENV};
use washcam::events::{ClientEvent, EventBus};
use washcam::session::SessionState;
use washcam::stream::CaptureMode;
use washcam::video::{create_backend, BackendKind, DeviceRegistry};
use washcam::Client;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// washcam command line arguments
#[derive(Parser, Debug)]
#[command(name = "washcam")]
#[command(version, about = "Stream camera frames to an inference service and track progress", long_about = None)]
struct CliArgs {
    /// WebSocket endpoint (ws:// or wss://)
    #[arg(short = 'u', long, env = URL_ENV, value_name = "URL")]
    url: Option<String>,

    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Video device to use (e.g. /dev/video0)
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<String>,

    /// List video devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Camera backend (v4l2, synthetic)
    #[arg(long, value_name = "BACKEND")]
    backend: Option<BackendKind>,

    /// Milliseconds between sent frames
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,

    /// JPEG quality (1-100)
    #[arg(short = 'q', long, value_name = "QUALITY")]
    quality: Option<u8>,

    /// Send frames unrotated
    #[arg(long)]
    no_rotate: bool,

    /// Capture mode (local, remote)
    #[arg(long, value_name = "MODE")]
    mode: Option<CaptureMode>,

    /// Camera URL for the server to pull from (remote mode)
    #[arg(long, value_name = "URL")]
    camera_url: Option<String>,

    /// Send {"action":"start"} after connecting
    #[arg(long)]
    send_start: bool,

    /// Connect timeout in seconds (0 = wait indefinitely)
    #[arg(long, value_name = "SECS")]
    connect_timeout_secs: Option<u64>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log format (text, json)
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.log_format, args.verbose);

    // Install default crypto provider (required by rustls 0.23+ for wss://)
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting washcam v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load_or_default(args.config.as_deref())?;
    apply_cli_overrides(&mut config, &args);

    let backend = create_backend(config.capture.backend);
    tracing::info!("Camera backend: {}", backend.name());

    if args.list_devices {
        let registry = DeviceRegistry::new(backend, Arc::new(EventBus::new()));
        let devices = registry.list_devices(true).await;
        if devices.is_empty() {
            println!("No video devices found");
        }
        for device in devices {
            println!("{}\t{}", device.id, device.display_name());
        }
        return Ok(());
    }

    let client = Client::new(config, backend)?;
    client.init().await;

    let render = tokio::spawn(render_state(client.subscribe_state()));
    let notify = tokio::spawn(log_events(client.clone()));

    client.start().await;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutdown signal received");
        }
        _ = read_commands(client.clone()) => {}
    }

    client.shutdown().await;
    render.abort();
    notify.abort();
    tracing::info!("washcam stopped");
    Ok(())
}

fn apply_cli_overrides(config: &mut ClientConfig, args: &CliArgs) {
    config.apply_env_url(args.url.clone());
    if let Some(ref device) = args.device {
        config.capture.device = Some(device.clone());
    }
    if let Some(backend) = args.backend {
        config.capture.backend = backend;
    }
    if let Some(interval) = args.interval_ms {
        config.sampler.interval_ms = interval;
    }
    if let Some(quality) = args.quality {
        config.sampler.jpeg_quality = quality;
    }
    if args.no_rotate {
        config.sampler.rotate_180 = false;
    }
    if let Some(mode) = args.mode {
        config.transport.mode = mode;
    }
    if let Some(ref camera_url) = args.camera_url {
        config.transport.camera_url = Some(camera_url.clone());
    }
    if args.send_start {
        config.transport.send_start_action = true;
    }
    if let Some(secs) = args.connect_timeout_secs {
        config.transport.connect_timeout_secs = secs;
    }
}

/// Terminal presentation: one line per state change
async fn render_state(mut state: tokio::sync::watch::Receiver<SessionState>) {
    loop {
        let line = {
            let snapshot = state.borrow_and_update();
            let meters: Vec<String> = snapshot
                .meters()
                .iter()
                .map(|m| format!("{} {}% ({})", m.name, m.percent, m.count))
                .collect();
            format!("[{}] {}", snapshot.status, meters.join(" | "))
        };
        tracing::info!("{}", line);

        if state.changed().await.is_err() {
            break;
        }
    }
}

async fn log_events(client: Arc<Client>) {
    let mut events = client.subscribe_events();
    loop {
        match events.recv().await {
            Ok(ClientEvent::Completed { message, .. }) => {
                tracing::info!("*** {} *** (type 'dismiss' to hide, 'restart' to go again)", message);
            }
            Ok(ClientEvent::CaptureFailed { device, reason }) => {
                tracing::warn!("Camera {} unavailable: {}", device, reason);
            }
            Ok(ClientEvent::DevicesChanged { devices }) => {
                tracing::info!("{} video device(s) available", devices.len());
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Event listener lagged by {} events", n);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read intents from stdin until `quit` or EOF
async fn read_commands(client: Arc<Client>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("start"), _) => {
                client.start().await;
            }
            (Some("reset"), _) => client.reset().await,
            (Some("restart"), _) => {
                client.restart().await;
            }
            (Some("dismiss"), _) => client.dismiss_notification(),
            (Some("devices"), _) => {
                let selected = client.selected_device();
                for device in client.refresh_devices(true).await {
                    let marker = if selected.as_deref() == Some(device.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{} {}\t{}", marker, device.id, device.display_name());
                }
            }
            (Some("select"), Some(id)) => {
                if let Err(e) = client.select_device(id).await {
                    tracing::warn!("Cannot select {}: {}", id, e);
                }
            }
            (Some("stats"), _) => {
                let stats = client.sampler_stats();
                println!(
                    "phase={} emitted={} dropped={} skipped={} queued={} queue_drops={}",
                    client.phase(),
                    stats.frames_emitted,
                    stats.frames_dropped,
                    stats.ticks_skipped,
                    client.sent_frames(),
                    client.dropped_frames()
                );
            }
            (Some("quit"), _) | (Some("exit"), _) => return,
            (Some(other), _) => {
                println!(
                    "Unknown command '{}'. Commands: start, reset, restart, dismiss, devices, select <id>, stats, quit",
                    other
                );
            }
            (None, _) => {}
        }
    }

    // Keep running after stdin closes (e.g. under a service manager)
    std::future::pending::<()>().await;
}

fn init_logging(level: LogLevel, format: LogFormat, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "washcam=error",
        LogLevel::Warn => "washcam=warn",
        LogLevel::Info => "washcam=info",
        LogLevel::Verbose => "washcam=debug,tungstenite=info",
        LogLevel::Debug => "washcam=debug,tungstenite=debug",
        LogLevel::Trace => "washcam=trace,tungstenite=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = installed {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
