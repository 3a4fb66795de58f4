mod admin;
mod config;
mod detect;
mod report;
mod webcam;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use rollcall_core::{AdminSession, AttendanceLog, GalleryError, GalleryStore, Identity, OnnxEncoder};
use rollcall_hw::Camera;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face under a name
    Register {
        /// Name to register (case-insensitive)
        #[arg(short, long)]
        name: String,
        /// Image file to take the face from; captures from the webcam when omitted
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Run live attendance from the webcam
    Detect {
        /// Keep the latest annotated frame at this path
        #[arg(long)]
        preview: Option<PathBuf>,
    },
    /// Show attendance records
    Log {
        /// Only show records for this name
        #[arg(short, long)]
        name: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List registered names
    Users,
    /// Attendance per person and per day
    Stats,
    /// Open the interactive admin panel
    Admin,
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Register { name, image } => register(&config, &name, image)?,
        Commands::Detect { preview } => {
            init_storage(&config)?;
            detect::run(&config, preview).await?;
        }
        Commands::Log { name, json } => {
            let log = init_storage(&config)?;
            let records = match &name {
                Some(n) => match Identity::new(n) {
                    Ok(id) => log.records_for(id.as_str()),
                    Err(_) => Vec::new(),
                },
                None => log.records().iter().collect(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print!("{}", report::records_table(&records));
            }
        }
        Commands::Users => {
            let store = GalleryStore::open(&config.gallery_dir)?;
            let identities = store.identities()?;
            if identities.is_empty() {
                println!("No faces registered");
            }
            for identity in identities {
                println!("{identity}");
            }
        }
        Commands::Stats => {
            let log = init_storage(&config)?;
            if log.is_empty() {
                println!("No attendance records");
                return Ok(());
            }
            println!("Attendance per person");
            print!("{}", report::bar_chart(&log.counts_by_identity()));
            println!();
            println!("Daily attendance");
            print!("{}", report::daily_trend(&log.daily_totals()));
        }
        Commands::Admin => {
            init_storage(&config)?;
            let mut session = AdminSession::new(config.admin_password.clone());
            let stdin = std::io::stdin();
            admin::run(stdin.lock(), &mut std::io::stdout(), &mut session, &config.log_path)?;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

/// Create the gallery directory and the attendance table if missing.
fn init_storage(config: &Config) -> Result<AttendanceLog> {
    GalleryStore::open(&config.gallery_dir)
        .with_context(|| format!("creating gallery at {}", config.gallery_dir.display()))?;
    AttendanceLog::open(&config.log_path)
        .with_context(|| format!("opening attendance log {}", config.log_path.display()))
}

fn register(config: &Config, name: &str, image: Option<PathBuf>) -> Result<()> {
    let identity = Identity::new(name).context("Please enter a valid name")?;
    init_storage(config)?;

    let image = match image {
        Some(path) => image::open(&path)
            .with_context(|| format!("reading {}", path.display()))?
            .to_rgb8(),
        None => {
            let camera = Camera::open(
                &config.camera_device,
                config.capture_width,
                config.capture_height,
            )
            .context("camera unavailable")?;
            camera.capture_frame().context("frame capture failed")?.into_image()
        }
    };

    let mut encoder = OnnxEncoder::load(&config.model_dir).context("loading face models")?;
    let store = GalleryStore::open(&config.gallery_dir)?;
    match store.register(&identity, &image, &mut encoder) {
        Ok(path) => {
            println!("Registered {identity} ({})", path.display());
            Ok(())
        }
        Err(GalleryError::NoFaceDetected) => bail!("No face detected in the image"),
        Err(e) => Err(e.into()),
    }
}
