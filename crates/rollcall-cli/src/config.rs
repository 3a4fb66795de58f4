use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for the gallery, the attendance table and the config file.
    pub data_dir: PathBuf,
    /// One reference image per enrolled identity.
    pub gallery_dir: PathBuf,
    /// The `Name,Timestamp` attendance table.
    pub log_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Credential for the admin panel.
    pub admin_password: String,
    /// Events buffered between the detection thread and the terminal.
    pub event_capacity: usize,
}

/// Keys accepted in `rollcall.toml`. The data directory itself can only be
/// set from the environment since the file lives inside it.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    gallery_dir: Option<PathBuf>,
    log_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    camera_device: Option<String>,
    capture_width: Option<u32>,
    capture_height: Option<u32>,
    admin_password: Option<String>,
    event_capacity: Option<usize>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_sources(|key| std::env::var(key).ok())
    }

    fn from_sources(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir(&env));

        let file = match env("ROLLCALL_CONFIG").map(PathBuf::from) {
            Some(path) => read_file_config(&path)?,
            None => {
                let path = data_dir.join("rollcall.toml");
                if path.is_file() {
                    read_file_config(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };

        let gallery_dir = env("ROLLCALL_GALLERY_DIR")
            .map(PathBuf::from)
            .or(file.gallery_dir)
            .unwrap_or_else(|| data_dir.join("faces"));
        let log_path = env("ROLLCALL_LOG_PATH")
            .map(PathBuf::from)
            .or(file.log_path)
            .unwrap_or_else(|| data_dir.join("attendance.csv"));
        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(rollcall_core::default_model_dir);

        Ok(Self {
            gallery_dir,
            log_path,
            model_dir,
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            capture_width: env_parse(&env, "ROLLCALL_CAPTURE_WIDTH")
                .or(file.capture_width)
                .unwrap_or(640),
            capture_height: env_parse(&env, "ROLLCALL_CAPTURE_HEIGHT")
                .or(file.capture_height)
                .unwrap_or(480),
            admin_password: env("ROLLCALL_ADMIN_PASSWORD")
                .or(file.admin_password)
                .unwrap_or_else(|| "admin123".to_string()),
            event_capacity: env_parse(&env, "ROLLCALL_EVENT_CAPACITY")
                .or(file.event_capacity)
                .unwrap_or(4),
            data_dir,
        })
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

/// Unparseable values fall back to the next source.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}
