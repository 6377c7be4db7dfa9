use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use tracing::warn;
use url::Url;

pub const DEFAULT_PAINTER_MODE: &str = "repaint";
pub const DEFAULT_PAINTER_STYLE: &str = "anime";

pub const MIN_POLL_INTERVAL_SECONDS: u64 = 1;
pub const MAX_POLL_INTERVAL_SECONDS: u64 = 60 * 60;
pub const MAX_POLL_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub painter_url_file: PathBuf,
    pub painter_mode: String,
    pub painter_style: String,
    pub painter_http_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    pub poll_backoff_factor: f64,
    pub poll_max_interval_seconds: u64,
    pub poll_timeout_seconds: u64,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub rate_limit_seconds: u64,
    pub whitelist_file_path: String,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(name: &str, default: impl Into<PathBuf>) -> PathBuf {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => default.into(),
    }
}

fn normalize_backoff_factor(value: f64) -> f64 {
    if value.is_finite() && value >= 1.0 {
        return value;
    }
    warn!(
        "POLL_BACKOFF_FACTOR must be a finite number >= 1.0, got {}; using 1.0.",
        value
    );
    1.0
}

/// Returns `(interval, max_interval, timeout)` clamped to the supported
/// range. A timeout of 0 stays 0 and means "no timeout".
fn bound_poll_seconds(interval: u64, max_interval: u64, timeout: u64) -> (u64, u64, u64) {
    let interval = interval.clamp(MIN_POLL_INTERVAL_SECONDS, MAX_POLL_INTERVAL_SECONDS);
    let max_interval = max_interval.clamp(interval, MAX_POLL_INTERVAL_SECONDS);
    (interval, max_interval, timeout.min(MAX_POLL_TIMEOUT_SECONDS))
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow!("BOT_TOKEN is required"));
        }

        let (poll_interval_seconds, poll_max_interval_seconds, poll_timeout_seconds) =
            bound_poll_seconds(
                env_u64("POLL_INTERVAL_SECONDS", 10),
                env_u64("POLL_MAX_INTERVAL_SECONDS", 60),
                env_u64("POLL_TIMEOUT_SECONDS", 1800),
            );

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            painter_url_file: env_path("PAINTER_URL_FILE", "sd_painter_url"),
            painter_mode: env_string("PAINTER_MODE", DEFAULT_PAINTER_MODE),
            painter_style: env_string("PAINTER_STYLE", DEFAULT_PAINTER_STYLE),
            painter_http_timeout_seconds: env_u64("PAINTER_HTTP_TIMEOUT_SECONDS", 60).max(1),
            poll_interval_seconds,
            poll_backoff_factor: normalize_backoff_factor(env_f64("POLL_BACKOFF_FACTOR", 1.0)),
            poll_max_interval_seconds,
            poll_timeout_seconds,
            output_dir: env_path("OUTPUT_DIR", "outputs"),
            temp_dir: env_path("TEMP_DIR", env::temp_dir()),
            rate_limit_seconds: env_u64("RATE_LIMIT_SECONDS", 30),
            whitelist_file_path: env_string("WHITELIST_FILE_PATH", "allowed_chat.txt"),
        })
    }

    pub fn painter_http_timeout(&self) -> Duration {
        Duration::from_secs(self.painter_http_timeout_seconds)
    }
}

/// Reads the painter base URL from its one-line config file.
///
/// A missing or blank file means the feature is switched off and yields
/// `Ok(None)`. The file is re-read on every call so the service can be
/// toggled without a restart.
pub fn read_painter_base_url(path: &Path) -> Result<Option<String>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(anyhow!(
                "Failed to read painter url file {}: {err}",
                path.display()
            ))
        }
    };

    let base = raw.trim().trim_end_matches('/');
    if base.is_empty() {
        return Ok(None);
    }

    Url::parse(base).map_err(|err| anyhow!("Invalid painter url '{base}': {err}"))?;
    Ok(Some(base.to_string()))
}
