//! framegrab: capture frames from a device and hand the latest one to consumers

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use framegrab::capture::{FrameShape, Property};
use framegrab::session::{parse_property, run_worker_process, WorkerArgs};
use framegrab::{utils, CaptureProperties, CaptureSession, Config, DeviceId, Transport};

#[derive(Parser)]
#[command(name = "framegrab", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List capture-capable V4L2 devices
    Devices,

    /// Stream from a device and log throughput until Ctrl-C
    Watch {
        /// Device index, node path, `pattern[:label]` or `auto`
        #[arg(long)]
        device: Option<String>,
        #[arg(long, value_enum)]
        transport: Option<TransportArg>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        fps: Option<f64>,
    },

    /// Cross-process capture worker, spawned by a session
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        buffer: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
        #[arg(long, default_value_t = 3)]
        channels: u32,
        #[arg(long)]
        parent_pid: Option<i32>,
        #[arg(long = "prop", value_parser = parse_property)]
        props: Vec<(Property, f64)>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    InProcess,
    SharedMemory,
}

impl From<TransportArg> for Transport {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::InProcess => Transport::InProcess,
            TransportArg::SharedMemory => Transport::SharedMemory,
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framegrab=info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::uptime());

    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Devices => {
            let devices = utils::list_devices();
            if devices.is_empty() {
                warn!("No capture devices found");
            }
            for device in devices {
                println!("{}\t{:?}\t{}", device.path, device.format, device.card);
            }
            Ok(())
        }
        Command::Watch {
            device,
            transport,
            width,
            height,
            fps,
        } => {
            let mut config = config;
            if let Some(device) = device {
                config.capture.device = device;
            }
            if let Some(transport) = transport {
                config.pipeline.transport = transport.into();
            }
            config.capture.width = width.unwrap_or(config.capture.width);
            config.capture.height = height.unwrap_or(config.capture.height);
            config.capture.fps = fps.unwrap_or(config.capture.fps);
            framegrab::CONFIG.store(Arc::new(config));
            watch().await
        }
        Command::Worker {
            buffer,
            device,
            width,
            height,
            channels,
            parent_pid,
            props,
        } => {
            let mut properties = CaptureProperties::default();
            for (property, value) in props {
                properties.insert(property, value);
            }
            let args = WorkerArgs {
                buffer,
                device: DeviceId::from(device.as_str()),
                shape: FrameShape {
                    height,
                    width,
                    channels,
                },
                properties,
                parent_pid,
            };
            tokio::task::spawn_blocking(move || run_worker_process(args)).await??;
            Ok(())
        }
    }
}

async fn watch() -> Result<()> {
    let config = framegrab::CONFIG.load_full();
    info!("framegrab launching...");

    let device = if config.capture.device == "auto" {
        utils::auto_detect_device()?.id()
    } else {
        DeviceId::from(config.capture.device.as_str())
    };
    info!("Using capture device: {}", device);

    let stop = Arc::new(AtomicBool::new(false));
    let mut task = {
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || -> framegrab::Result<()> {
            let mut session = CaptureSession::new(config.pipeline.clone());
            session.open(device, config.capture.properties())?;
            if let Some(name) = session.buffer_name() {
                info!("Frames shared at {}", name);
            }

            let poll = Duration::from_secs_f64(1.0 / config.capture.fps.max(1.0));
            let mut window = Instant::now();
            let (mut last_sequence, mut fresh) = (0, 0u32);
            while !stop.load(Ordering::Acquire) {
                let frame = match session.wait_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Capture stalled: {}", e);
                        break;
                    }
                };
                if frame.sequence() != last_sequence {
                    last_sequence = frame.sequence();
                    fresh += 1;
                }
                if window.elapsed() >= Duration::from_secs(1) {
                    info!(
                        "{:.1} fps, frame {} ({})",
                        f64::from(fresh) / window.elapsed().as_secs_f64(),
                        last_sequence,
                        frame.shape()
                    );
                    window = Instant::now();
                    fresh = 0;
                }
                std::thread::sleep(poll);
            }
            session.close();
            Ok(())
        })
    };

    tokio::select! {
        result = &mut task => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            stop.store(true, Ordering::Release);
            task.await??;
        }
    }

    info!("framegrab shutting down");
    Ok(())
}
