//! CLI entry point for camera-capture
//!
//! Drives the capture pipeline against the in-process mock driver:
//! - list connected cameras
//! - open a camera and capture frames in continuous or triggered mode
//!
//! # Usage
//!
//! ```bash
//! camera-capture list
//! camera-capture capture --frames 50 --fps 10
//! camera-capture capture --triggered --frames 5 --format mono8
//! ```

use anyhow::Result;
use camera_capture::capture::{Continuous, Triggered};
use camera_capture::config::{CaptureConfig, DEFAULT_CONFIG_PATH};
use camera_capture::device::{DeviceSession, WhiteBalance};
use camera_capture::discovery::{list_cameras, ConnectionKind};
use camera_capture::driver::mock::MockDriver;
use camera_capture::driver::CameraDriver;
use camera_capture::image::PixelFormat;
use camera_capture::logging;
use camera_capture::{AppResult, FrameMeta, ImageView};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Longest wait for a single frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "camera-capture")]
#[command(about = "Event-driven camera acquisition pipeline", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected cameras
    List,

    /// Open the first camera and capture frames
    Capture {
        /// Frames to capture
        #[arg(long, default_value = "25")]
        frames: u64,

        /// Target frame rate
        #[arg(long)]
        fps: Option<f64>,

        /// Pixel format (mono8, mono16, rgb8, rgb16); overrides the config file
        #[arg(long)]
        format: Option<PixelFormat>,

        /// Fixed color temperature in Kelvin instead of auto white balance
        #[arg(long)]
        kelvin: Option<u32>,

        /// Software-triggered capture instead of free-running video
        #[arg(long)]
        triggered: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CaptureConfig::load_from(&cli.config)?;
    config.validate()?;
    logging::init_from_config(&config)?;

    let driver: Arc<dyn CameraDriver> = Arc::new(MockDriver::new());

    match cli.command {
        Commands::List => list(&*driver),
        Commands::Capture {
            frames,
            fps,
            format,
            kelvin,
            triggered,
        } => {
            let mut config = config;
            if let Some(format) = format {
                config.device.pixel_format = format;
            }
            let options = CaptureOptions {
                frames,
                fps,
                kelvin,
                triggered,
            };
            capture(driver, &config, options).await
        }
    }
}

fn list(driver: &dyn CameraDriver) -> Result<()> {
    let cameras = list_cameras(driver)?;
    if cameras.is_empty() {
        println!("No cameras found");
        return Ok(());
    }

    for camera in cameras {
        let connection = match &camera.connection {
            ConnectionKind::Usb => "USB".to_string(),
            ConnectionKind::Ethernet { address, autoconf } => {
                if *autoconf {
                    format!("GigE {address} (autoconf)")
                } else {
                    format!("GigE {address}")
                }
            }
        };
        println!(
            "{}  {}  {}{}",
            camera.label(),
            connection,
            camera.camera_id,
            if camera.available { "" } else { "  [in use]" }
        );
    }
    Ok(())
}

struct CaptureOptions {
    frames: u64,
    fps: Option<f64>,
    kelvin: Option<u32>,
    triggered: bool,
}

async fn capture(
    driver: Arc<dyn CameraDriver>,
    config: &CaptureConfig,
    options: CaptureOptions,
) -> Result<()> {
    let camera = list_cameras(&*driver)?
        .into_iter()
        .find(|c| c.available)
        .ok_or_else(|| anyhow::anyhow!("no available camera"))?;

    let device = DeviceSession::builder(driver, camera)
        .with_config(config)
        .on_capture_error(|event| {
            eprintln!(
                "capture error {}: +{} (total {})",
                event.kind, event.new_events, event.total
            );
        })
        .open_async()
        .await?;

    let (width, height) = device.resolution();
    println!(
        "Opened {} ({}x{}, {}, {} buffers)",
        device.camera().label(),
        width,
        height,
        device.pixel_format(),
        device.buffer_count()
    );

    if let Some(fps) = options.fps {
        let actual = device.set_fps(fps)?;
        println!("Frame rate: {actual:.2} fps");
    }
    match options.kelvin {
        Some(kelvin) => {
            let applied = device.set_white_balance_kelvin(kelvin)?;
            println!("White balance: {applied} K");
        }
        None => device.set_white_balance(WhiteBalance::Auto)?,
    }

    // The sessions are synchronous and thread-based; keep them off the runtime.
    let frames = options.frames;
    let triggered = options.triggered;
    let (device, received, elapsed) = tokio::task::spawn_blocking(move || {
        let received = Arc::new(AtomicU64::new(0));
        let on_frame = frame_logger(received.clone());

        let start = Instant::now();
        let result = if triggered {
            run_triggered(&device, frames, on_frame, &received)
        } else {
            run_continuous(&device, frames, on_frame, &received)
        };
        result.map(|()| (device, received.load(Ordering::SeqCst), start.elapsed()))
    })
    .await??;

    println!(
        "Captured {} frames in {:.2}s",
        received,
        elapsed.as_secs_f64()
    );

    let stats = device.error_stats();
    if stats.is_empty() {
        println!("No capture errors");
    } else {
        for (kind, record) in &stats.records {
            println!("{}: {} ({})", kind, record.count, kind.description());
        }
    }

    device.close()?;
    Ok(())
}

fn frame_logger(
    received: Arc<AtomicU64>,
) -> impl Fn(ImageView<'_>, FrameMeta) -> Result<()> + Send + Sync + 'static {
    move |image, meta| {
        received.fetch_add(1, Ordering::SeqCst);
        info!(
            frame = meta.frame_number,
            timestamp = %meta.timestamp,
            width = image.width(),
            height = image.height(),
            "Frame received"
        );
        Ok(())
    }
}

fn wait_for_frames(received: &AtomicU64, frames: u64, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while received.load(Ordering::SeqCst) < frames {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

fn run_continuous<F>(
    device: &DeviceSession,
    frames: u64,
    on_frame: F,
    received: &AtomicU64,
) -> AppResult<()>
where
    F: Fn(ImageView<'_>, FrameMeta) -> Result<()>
        + Send
        + Sync
        + 'static,
{
    let mut session = device.capture::<Continuous, _>(on_frame)?;
    if !wait_for_frames(received, frames, FRAME_TIMEOUT * frames.max(1) as u32) {
        warn!(received = received.load(Ordering::SeqCst), frames, "Timed out waiting for frames");
    }
    session.stop();
    Ok(())
}

fn run_triggered<F>(
    device: &DeviceSession,
    frames: u64,
    on_frame: F,
    received: &AtomicU64,
) -> AppResult<()>
where
    F: Fn(ImageView<'_>, FrameMeta) -> Result<()>
        + Send
        + Sync
        + 'static,
{
    let mut session = device.capture::<Triggered, _>(on_frame)?;
    for n in 1..=frames {
        session.trigger(true)?;
        if !wait_for_frames(received, n, FRAME_TIMEOUT) {
            warn!(trigger = n, "Triggered frame did not arrive");
        }
    }
    session.stop();
    Ok(())
}
