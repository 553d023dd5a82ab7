use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use touchguard_hw::Camera;

/// Calibration records samples for several seconds; the default D-Bus
/// method timeout is too short for it.
const METHOD_TIMEOUT: Duration = Duration::from_secs(300);

#[zbus::proxy(
    interface = "org.freedesktop.TouchGuard1",
    default_service = "org.freedesktop.TouchGuard1",
    default_path = "/org/freedesktop/TouchGuard1"
)]
trait TouchGuard {
    async fn status(&self) -> zbus::Result<String>;
    async fn calibrate(&self, label: &str) -> zbus::Result<u32>;
    async fn run(&self) -> zbus::Result<bool>;
    async fn stop(&self) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "touchguard", about = "TouchGuard face-touch monitor CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Record one calibration phase
    Calibrate {
        /// Which phase to record: "not-touching" (step 1) or "touching" (step 2)
        label: String,
    },
    /// Start monitoring
    Run,
    /// Stop monitoring
    Stop,
    /// Follow status changes until interrupted
    Watch {
        /// Polling interval in milliseconds
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },
    /// List V4L2 video devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device path
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        /// Number of frames to capture
        #[arg(long, default_value_t = 10)]
        frames: usize,
        /// Save the last frame as PNG
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let proxy = connect().await?;
            let status = proxy.status().await.context("Status() failed")?;
            print_status(&status)?;
        }
        Commands::Calibrate { label } => {
            let proxy = connect().await?;
            println!("Recording \"{label}\" samples, hold still...");
            let count = proxy
                .calibrate(&label)
                .await
                .context("Calibrate() failed")?;
            println!("Calibration done: {count} examples stored for \"{label}\"");
        }
        Commands::Run => {
            let proxy = connect().await?;
            proxy.run().await.context("Run() failed")?;
            println!("Monitoring started");
        }
        Commands::Stop => {
            let proxy = connect().await?;
            if proxy.stop().await.context("Stop() failed")? {
                println!("Monitoring stopped");
            } else {
                println!("Monitoring was not running");
            }
        }
        Commands::Watch { interval_ms } => {
            let proxy = connect().await?;
            watch(&proxy, Duration::from_millis(interval_ms.max(10))).await?;
        }
        Commands::Devices => list_devices(),
        Commands::Test {
            device,
            frames,
            save,
        } => camera_test(&device, frames, save)?,
    }

    Ok(())
}

async fn connect() -> Result<TouchGuardProxy<'static>> {
    let conn = zbus::connection::Builder::session()?
        .method_timeout(METHOD_TIMEOUT)
        .build()
        .await
        .context("cannot connect to the session bus")?;
    tracing::debug!(unique_name = ?conn.unique_name(), "connected to session bus");
    let proxy = TouchGuardProxy::new(&conn)
        .await
        .context("touchguardd is not reachable")?;
    Ok(proxy)
}

fn print_status(raw: &str) -> Result<()> {
    let status: serde_json::Value = serde_json::from_str(raw).context("malformed status")?;
    println!("touchguardd {}", status["version"].as_str().unwrap_or("?"));
    println!("  state:    {}", status["state"].as_str().unwrap_or("?"));
    println!("  note:     {}", status["note"].as_str().unwrap_or(""));
    println!("  touched:  {}", status["touched"].as_bool().unwrap_or(false));
    println!(
        "  examples: {} not touching / {} touching",
        status["examples"]["not_touched"], status["examples"]["touched"]
    );
    let next = match status["step"].as_u64() {
        Some(1) => "touchguard calibrate not-touching",
        Some(2) => "touchguard calibrate touching",
        Some(3) => "touchguard run",
        _ => "",
    };
    if !next.is_empty() {
        println!("  next:     {next}");
    }
    Ok(())
}

async fn watch(proxy: &TouchGuardProxy<'_>, interval: Duration) -> Result<()> {
    let mut last = String::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let raw = proxy.status().await.context("Status() failed")?;
        tracing::debug!(status = %raw, "polled status");
        let status: serde_json::Value = serde_json::from_str(&raw).context("malformed status")?;
        let line = watch_line(&status);
        if line != last {
            println!("{line}");
            last = line;
        }
    }
}

/// One-line rendering of a status snapshot: progress while calibrating,
/// a touch marker otherwise.
fn watch_line(status: &serde_json::Value) -> String {
    let note = status["note"].as_str().unwrap_or("");
    match status["progress"].as_f64() {
        Some(p) => format!("[{:>3.0} %] {note}", p * 100.0),
        None => {
            let marker = if status["touched"].as_bool().unwrap_or(false) { "!!" } else { "  " };
            format!("{marker} {note}")
        }
    }
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 video devices found");
        return;
    }
    for dev in &devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}

fn camera_test(device: &str, frames: usize, save: Option<PathBuf>) -> Result<()> {
    if frames == 0 {
        bail!("--frames must be at least 1");
    }
    println!("Opening {device}...");
    let mut camera = Camera::open(device, 640, 480).with_context(|| format!("cannot open {device}"))?;
    println!(
        "  {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let mut last = None;
    let mut dark = 0usize;
    for _ in 0..frames {
        let frame = camera.capture_frame().context("capture failed")?;
        tracing::debug!(sequence = frame.sequence, bytes = frame.data.len(), "captured frame");
        if frame.is_dark {
            dark += 1;
        }
        println!(
            "  frame {:>3}: brightness {:>6.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { " (dark)" } else { "" }
        );
        last = Some(frame);
    }
    println!("Captured {frames} frames, {dark} dark");

    if let (Some(path), Some(frame)) = (save, last) {
        let image = image::RgbImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image
            .save(&path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        println!("Saved last frame to {}", path.display());
    }
    Ok(())
}
