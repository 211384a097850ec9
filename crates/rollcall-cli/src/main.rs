use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::registry::{is_valid_label, label_for, reference_images};
use rollcall_core::{AttendanceLedger, Config, OnnxExtractor};
use rollcall_hw::Camera;
use std::path::{Path, PathBuf};

/// Frames discarded after opening the camera so exposure can settle.
const WARMUP_FRAMES: usize = 5;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance CLI")]
struct Cli {
    /// Directory of known-face reference images [default: from config]
    #[arg(long, global = true)]
    known_faces: Option<PathBuf>,
    /// Directory of per-day attendance files [default: from config]
    #[arg(long, global = true)]
    logs: Option<PathBuf>,
    /// V4L2 camera device [default: from config]
    #[arg(long, global = true)]
    device: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// The daemon's configuration with command-line flags applied on top.
    fn config(&self) -> Result<Config> {
        let mut config = Config::load().context("failed to load configuration")?;
        if let Some(dir) = &self.known_faces {
            config.known_faces_dir = dir.clone();
        }
        if let Some(dir) = &self.logs {
            config.logs_dir = dir.clone();
        }
        if let Some(device) = &self.device {
            config.camera_device = device.clone();
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance session
    Start,
    /// Stop the running session
    Stop,
    /// Clear the session so everyone can be logged again
    Clear,
    /// Show daemon status
    Status,
    /// Show recently logged attendance
    Recent,
    /// Save the current annotated frame as PNG
    Snapshot {
        /// Output file
        #[arg(default_value = "snapshot.png")]
        path: PathBuf,
    },
    /// Print the attendance file for a day
    Report {
        /// Day to print (YYYY-MM-DD), today if omitted
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// List known faces
    Faces,
    /// Capture a reference image from the camera
    Capture {
        /// Person's name, used as the label
        name: String,
        /// Replace an existing image with the same name
        #[arg(short, long)]
        force: bool,
    },
    /// Run installation diagnostics
    Test {
        /// Directory containing the ONNX models
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start(&self) -> zbus::Result<()>;
    fn stop(&self) -> zbus::Result<()>;
    fn clear(&self) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
    fn recent_log(&self) -> zbus::Result<String>;
    fn snapshot(&self, path: &str) -> zbus::Result<()>;
}

async fn daemon() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable; is the daemon running?")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Start => {
            daemon().await?.start().await.context("start failed")?;
            println!("Running");
        }
        Commands::Stop => {
            daemon().await?.stop().await?;
            println!("Stopped");
        }
        Commands::Clear => {
            daemon().await?.clear().await?;
            println!("Session cleared");
        }
        Commands::Status => {
            let raw = daemon().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Recent => {
            let raw = daemon().await?.recent_log().await?;
            let lines: Vec<String> = serde_json::from_str(&raw)?;
            if lines.is_empty() {
                println!("Nobody logged this session");
            }
            for line in lines {
                println!("{line}");
            }
        }
        Commands::Snapshot { path } => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                std::env::current_dir()?.join(path)
            };
            daemon()
                .await?
                .snapshot(&path.to_string_lossy())
                .await
                .context("snapshot failed")?;
            println!("Saved {}", path.display());
        }
        Commands::Report { date } => {
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            report(&cli.config()?.logs_dir, date)?;
        }
        Commands::Faces => faces(&cli.config()?.known_faces_dir)?,
        Commands::Capture { name, force } => {
            let config = cli.config()?;
            capture(&config.camera_device, &config.known_faces_dir, name, *force)?;
        }
        Commands::Test { model_dir } => {
            let mut config = cli.config()?;
            if let Some(dir) = model_dir {
                config.model_dir = dir.clone();
            }
            diagnostics(&config)?;
        }
    }

    Ok(())
}

fn report(logs: &Path, date: NaiveDate) -> Result<()> {
    let ledger = AttendanceLedger::new(logs);
    let records = ledger.read_day(date)?;
    if records.is_empty() {
        println!("No attendance recorded on {date}");
        return Ok(());
    }
    println!("Attendance for {date} ({} present)", records.len());
    for record in records {
        println!("  {:<24} {}", record.label, record.time);
    }
    Ok(())
}

fn faces(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        println!("No known faces directory at {}", dir.display());
        return Ok(());
    }
    let images = reference_images(dir)?;
    if images.is_empty() {
        println!("No reference images in {}", dir.display());
        return Ok(());
    }
    for path in images {
        if let Some(label) = label_for(&path) {
            println!("{label:<24} {}", path.display());
        }
    }
    Ok(())
}

/// Trim `name` and check it can become both a file name and a label.
fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if !is_valid_label(name) || name.contains(['/', '\\']) || name.starts_with('.') {
        bail!("invalid name {name:?}: must be a plain file name");
    }
    Ok(name)
}

fn capture(device: &str, dir: &Path, name: &str, force: bool) -> Result<()> {
    let name = validate_name(name)?;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{name}.jpg"));
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace)", path.display());
    }

    let mut camera = Camera::open(device)?;
    for _ in 0..WARMUP_FRAMES {
        if let Err(e) = camera.capture_frame() {
            tracing::debug!(error = %e, "warmup frame failed");
        }
    }
    let frame = camera.capture_frame()?;
    let still = frame
        .to_image()
        .context("captured frame has an inconsistent size")?;
    still
        .save_with_format(&path, image::ImageFormat::Jpeg)
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("Saved {} ({}x{})", path.display(), frame.width, frame.height);
    println!("Restart rollcalld to load the new face.");
    Ok(())
}

fn diagnostics(config: &Config) -> Result<()> {
    println!("Video capture devices:");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("  none found");
    }
    for dev in &devices {
        println!("  {}: {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }

    let mut ok = true;

    println!("\nCamera {}:", config.camera_device);
    match Camera::open(&config.camera_device).and_then(|mut camera| {
        let frame = camera.capture_frame()?;
        Ok((camera.pixel_format(), frame))
    }) {
        Ok((format, frame)) => println!(
            "  ok: {}x{} {:?}, frame #{}",
            frame.width, frame.height, format, frame.sequence
        ),
        Err(e) => {
            ok = false;
            println!("  FAILED: {e}");
        }
    }

    println!("\nKnown faces in {}:", config.known_faces_dir.display());
    ok &= check_known_faces(&config.known_faces_dir);

    println!("\nAttendance logs in {}:", config.logs_dir.display());
    ok &= check_logs_dir(&config.logs_dir);

    println!("\nModels in {}:", config.model_dir.display());
    let detector = config.detector_model_path();
    let recognizer = config.recognizer_model_path();
    match OnnxExtractor::load(&detector, &recognizer) {
        Ok(_) => {
            println!("  ok: {}", detector.display());
            println!("  ok: {}", recognizer.display());
        }
        Err(e) => {
            ok = false;
            println!("  FAILED: {e}");
        }
    }

    if !ok {
        bail!("diagnostics found problems");
    }
    println!("\nAll checks passed");
    Ok(())
}

fn check_known_faces(dir: &Path) -> bool {
    if !dir.is_dir() {
        println!("  MISSING: directory does not exist");
        return false;
    }
    let images = match reference_images(dir) {
        Ok(images) => images,
        Err(e) => {
            println!("  FAILED: {e}");
            return false;
        }
    };
    let unusable = images.iter().filter(|p| label_for(p).is_none()).count();
    if unusable > 0 {
        println!("  warning: {unusable} file name(s) cannot be used as labels");
    }
    let usable = images.len() - unusable;
    if usable == 0 {
        println!("  FAILED: no reference images");
        return false;
    }
    println!("  ok: {usable} reference image(s)");
    true
}

fn check_logs_dir(dir: &Path) -> bool {
    match std::fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => {
            println!("  FAILED: not a directory");
            false
        }
        Ok(meta) if meta.permissions().readonly() => {
            println!("  FAILED: directory is read-only");
            false
        }
        Ok(_) => {
            println!("  ok");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("  ok: will be created on first attendance");
            true
        }
        Err(e) => {
            println!("  FAILED: {e}");
            false
        }
    }
}
