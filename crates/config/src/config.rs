//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Names accepted in `classify.priority`
pub const PRIORITY_NAMES: &[&str] = &["data", "dvd", "audio"];

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Optical drive configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveConfig {
    /// Block device of the optical drive
    #[serde(default = "default_device")]
    pub device: PathBuf,
    /// Seconds between drive polls while idle
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive unreadable polls before the cycle is abandoned
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Upper bound for the poll backoff while the disc is unreadable
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
    /// Eject the disc when a cycle finishes
    #[serde(default = "default_true")]
    pub eject_on_completion: bool,
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/sr0")
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    6
}

fn default_retry_backoff_max_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            poll_interval_secs: default_poll_interval_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
            eject_on_completion: true,
        }
    }
}

/// Filesystem roots
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Scratch area for in-flight jobs
    #[serde(default = "default_wip_root")]
    pub wip_root: PathBuf,
    /// Final output tree (`iso`, `redbook`, `dvd` live below it)
    #[serde(default = "default_out_root")]
    pub out_root: PathBuf,
}

fn default_wip_root() -> PathBuf {
    PathBuf::from("./wip")
}

fn default_out_root() -> PathBuf {
    PathBuf::from("./out")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            wip_root: default_wip_root(),
            out_root: default_out_root(),
        }
    }
}

/// Disc classification policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifyConfig {
    /// Order used when a disc exposes more than one known layout
    #[serde(default = "default_priority")]
    pub priority: Vec<String>,
}

fn default_priority() -> Vec<String> {
    PRIORITY_NAMES.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
        }
    }
}

/// Transcode fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    /// Maximum concurrent transcodes (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent: u32,
    /// Arguments passed to ffmpeg between input and output
    #[serde(default = "default_ffmpeg_args")]
    pub ffmpeg_args: Vec<String>,
    /// Seconds a title's size must stay unchanged before transcoding
    #[serde(default = "default_stability_wait_secs")]
    pub stability_wait_secs: u64,
    /// Extension of transcoded files
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
}

fn default_ffmpeg_args() -> Vec<String> {
    [
        "-c:v", "libx264", "-crf", "18", "-map", "0", "-c:a", "copy", "-c:s", "copy",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_stability_wait_secs() -> u64 {
    10
}

fn default_output_extension() -> String {
    "mp4".to_string()
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            ffmpeg_args: default_ffmpeg_args(),
            stability_wait_secs: default_stability_wait_secs(),
            output_extension: default_output_extension(),
        }
    }
}

/// MakeMKV registration handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MakeMkvConfig {
    /// Write a registration key into settings.conf before each extraction
    #[serde(default)]
    pub update_key: bool,
    /// Literal key; when absent the key is fetched from `key_url`
    #[serde(default)]
    pub key: Option<String>,
    /// Page publishing the free beta key
    #[serde(default = "default_key_url")]
    pub key_url: String,
    /// MakeMKV settings file (`~` is expanded)
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
}

fn default_key_url() -> String {
    "https://forum.makemkv.com/forum/viewtopic.php?t=1053".to_string()
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("~/.MakeMKV/settings.conf")
}

impl Default for MakeMkvConfig {
    fn default() -> Self {
        Self {
            update_key: false,
            key: None,
            key_url: default_key_url(),
            settings_path: default_settings_path(),
        }
    }
}

/// External process supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// Seconds between SIGTERM and SIGKILL on cancellation
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,
    /// Retry mount/umount/eject through sudo when they fail
    #[serde(default = "default_true")]
    pub use_sudo_fallback: bool,
}

fn default_termination_grace_secs() -> u64 {
    10
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            termination_grace_secs: default_termination_grace_secs(),
            use_sudo_fallback: true,
        }
    }
}

/// Output tree policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Eject discs whose identity is already present in the output tree
    #[serde(default)]
    pub skip_already_ripped: bool,
    /// Finish interrupted DVD transcodes found in WIP at startup
    #[serde(default = "default_true")]
    pub resume_interrupted: bool,
    /// Free bytes required on the WIP filesystem before a rip starts
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
    /// Optional JSON status snapshot written after every cycle
    #[serde(default)]
    pub status_file: Option<PathBuf>,
}

fn default_min_free_bytes() -> u64 {
    1024 * 1024 * 1024
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            skip_already_ripped: false,
            resume_interrupted: true,
            min_free_bytes: default_min_free_bytes(),
            status_file: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoggingConfig {
    /// Enable debug-level logging
    #[serde(default)]
    pub debug: bool,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub makemkv: MakeMkvConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RIPPER_DEVICE -> drive.device
    /// - RIPPER_WIP_ROOT -> paths.wip_root
    /// - RIPPER_OUT_ROOT -> paths.out_root
    /// - RIPPER_EJECT_ON_COMPLETION -> drive.eject_on_completion
    /// - RIPPER_MAX_CONCURRENT_TRANSCODES -> transcode.max_concurrent
    /// - RIPPER_MAKEMKV_KEY -> makemkv.key
    /// - RIPPER_DEBUG -> logging.debug
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RIPPER_DEVICE") {
            if !val.is_empty() {
                self.drive.device = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RIPPER_WIP_ROOT") {
            if !val.is_empty() {
                self.paths.wip_root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RIPPER_OUT_ROOT") {
            if !val.is_empty() {
                self.paths.out_root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RIPPER_EJECT_ON_COMPLETION") {
            if let Some(b) = parse_bool(&val) {
                self.drive.eject_on_completion = b;
            }
        }

        if let Ok(val) = env::var("RIPPER_MAX_CONCURRENT_TRANSCODES") {
            if let Ok(n) = val.parse::<u32>() {
                self.transcode.max_concurrent = n;
            }
        }

        if let Ok(val) = env::var("RIPPER_MAKEMKV_KEY") {
            if !val.is_empty() {
                self.makemkv.key = Some(val);
            }
        }

        if let Ok(val) = env::var("RIPPER_DEBUG") {
            if let Some(b) = parse_bool(&val) {
                self.logging.debug = b;
            }
        }
    }

    /// Reject values that parse but cannot drive the daemon
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drive.device.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("drive.device is empty".to_string()));
        }
        if self.drive.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "drive.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.classify.priority.is_empty() {
            return Err(ConfigError::Invalid(
                "classify.priority must not be empty".to_string(),
            ));
        }
        for (i, name) in self.classify.priority.iter().enumerate() {
            if !PRIORITY_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "classify.priority entry '{}' is not one of {:?}",
                    name, PRIORITY_NAMES
                )));
            }
            if self.classify.priority[..i].contains(name) {
                return Err(ConfigError::Invalid(format!(
                    "classify.priority lists '{}' twice",
                    name
                )));
            }
        }
        if self.transcode.output_extension.is_empty() {
            return Err(ConfigError::Invalid(
                "transcode.output_extension is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    ///
    /// A missing file is not an error: defaults are used and `Ok((config, false))`
    /// tells the caller nothing was read.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<(Self, bool), ConfigError> {
        let path = path.as_ref();
        let (mut config, found) = match Self::load_from_file(path) {
            Ok(config) => (config, true),
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                (Config::default(), false)
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok((config, found))
    }
}
