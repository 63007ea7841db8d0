//! DVD title extraction with makemkvcon, and registration key upkeep.

use crate::config::MakeMkvConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Settings key MakeMKV reads its registration from
const APP_KEY_SETTING: &str = "app_Key";

/// Upper bound on fetching the key page, connection included
pub const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for registration key updates
#[derive(Debug, Error)]
pub enum MakeMkvKeyError {
    #[error("Failed to fetch key page: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("No registration key found at {0}")]
    KeyNotFound(String),

    #[error("Failed to update settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key update cancelled")]
    Cancelled,
}

/// MakeMKV source specifier for a block device
pub fn makemkv_source(device: &Path) -> String {
    format!("dev:{}", device.display())
}

/// Build a makemkvcon command extracting every title of `device` into `out_dir`
pub fn build_makemkv_command(device: &Path, out_dir: &Path) -> Command {
    let mut cmd = Command::new("makemkvcon");
    // robot mode: one message per line
    cmd.arg("-r");
    cmd.arg("mkv");
    cmd.arg(makemkv_source(device));
    cmd.arg("all");
    cmd.arg(out_dir);
    cmd
}

/// Pull the beta key out of the forum page that publishes it
///
/// The key is the content of the first `<code>` block starting with `T-`.
pub fn extract_beta_key(page: &str) -> Option<String> {
    let mut rest = page;
    while let Some(start) = rest.find("<code>") {
        let after = &rest[start + "<code>".len()..];
        let end = after.find("</code>")?;
        let candidate = after[..end].trim();
        if candidate.starts_with("T-") && !candidate.contains(char::is_whitespace) {
            return Some(candidate.to_string());
        }
        rest = &after[end..];
    }
    None
}

/// Set `app_Key` in a settings.conf body, replacing any existing entry
pub fn upsert_app_key(settings: &str, key: &str) -> String {
    let entry = format!("{} = \"{}\"", APP_KEY_SETTING, key);
    let mut replaced = false;
    let mut lines: Vec<String> = settings
        .lines()
        .map(|line| {
            let name = line.split('=').next().unwrap_or("").trim();
            if name == APP_KEY_SETTING {
                replaced = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(entry);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Expand a leading `~/` using `$HOME`
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Fetch the current beta key, giving up after `timeout`
pub async fn fetch_beta_key(url: &str, timeout: Duration) -> Result<String, MakeMkvKeyError> {
    debug!(url, "Fetching MakeMKV beta key");
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let page = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    extract_beta_key(&page).ok_or_else(|| MakeMkvKeyError::KeyNotFound(url.to_string()))
}

/// Write the registration key into MakeMKV's settings file
///
/// Uses the configured key when present, otherwise fetches the current beta key.
/// The fetch stops early when `cancel` fires.
pub async fn update_makemkv_key(
    cfg: &MakeMkvConfig,
    cancel: &CancellationToken,
) -> Result<(), MakeMkvKeyError> {
    let key = match &cfg.key {
        Some(key) => key.clone(),
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MakeMkvKeyError::Cancelled),
            key = fetch_beta_key(&cfg.key_url, KEY_FETCH_TIMEOUT) => key?,
        },
    };

    let settings_path = expand_home(&cfg.settings_path);
    let current = match tokio::fs::read_to_string(&settings_path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if let Some(parent) = settings_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&settings_path, upsert_app_key(&current, &key)).await?;
    info!(settings = %settings_path.display(), "Updated MakeMKV registration key");
    Ok(())
}
