use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::sync::DataType;

pub const KEY_DATA_TYPES: &str = "sync.data_types";
pub const KEY_HISTORICAL_EPOCH: &str = "sync.historical_epoch";
pub const KEY_RATE_LIMIT: &str = "sync.rate_limit";
pub const KEY_MAX_ATTEMPTS: &str = "sync.max_attempts";
pub const KEY_WATCH_INTERVAL: &str = "sync.interval";
pub const KEY_REFRESH_MARGIN: &str = "auth.refresh_margin_secs";

/// Every key `config set` accepts.
pub const KNOWN_KEYS: &[&str] = &[
    KEY_DATA_TYPES,
    KEY_HISTORICAL_EPOCH,
    KEY_RATE_LIMIT,
    KEY_MAX_ATTEMPTS,
    KEY_WATCH_INTERVAL,
    KEY_REFRESH_MARGIN,
];

/// On-disk layout under the data directory (default `~/.withings`).
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub credentials: PathBuf,
    pub lock_file: PathBuf,
    pub env_file: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            database: data_dir.join("health_data.db"),
            credentials: data_dir.join("credentials.json"),
            lock_file: data_dir.join("sync.lock"),
            env_file: data_dir.join(".env"),
            data_dir,
        }
    }

    pub fn default_location() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
            .join(".withings");
        Ok(Self::new(dir))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

/// Read-only sync settings, resolved from `app_config` once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub data_types: Vec<DataType>,
    pub historical_epoch: NaiveDate,
    pub rate_limit: u32,
    pub max_attempts: u32,
    pub refresh_margin: chrono::Duration,
    pub watch_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            data_types: DataType::ALL.to_vec(),
            historical_epoch: NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default(),
            rate_limit: 120,
            max_attempts: 5,
            refresh_margin: chrono::Duration::seconds(60),
            watch_interval: Duration::from_secs(3600),
        }
    }
}

impl SyncSettings {
    /// Build settings from stored key/value pairs; missing keys keep defaults.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in pairs {
            settings.apply(key, value)?;
        }
        Ok(settings)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            KEY_DATA_TYPES => self.data_types = parse_data_types(value)?,
            KEY_HISTORICAL_EPOCH => self.historical_epoch = crate::date_util::parse_date(value)?,
            KEY_RATE_LIMIT => self.rate_limit = parse_positive(key, value)?,
            KEY_MAX_ATTEMPTS => self.max_attempts = parse_positive(key, value)?,
            KEY_WATCH_INTERVAL => {
                self.watch_interval = Duration::from_secs(parse_positive(key, value)?.into())
            }
            KEY_REFRESH_MARGIN => {
                let secs: i64 = value.trim().parse().map_err(|_| {
                    Error::Config(format!("{key} must be an integer, got '{value}'"))
                })?;
                if secs < 0 {
                    return Err(Error::Config(format!("{key} must not be negative")));
                }
                self.refresh_margin = chrono::Duration::seconds(secs);
            }
            // Unrelated keys share the table.
            _ => {}
        }
        Ok(())
    }

    /// Validate a single key/value before it is stored.
    pub fn validate(key: &str, value: &str) -> Result<()> {
        if !KNOWN_KEYS.contains(&key) {
            return Err(Error::Config(format!(
                "unknown key '{key}'. Known keys: {}",
                KNOWN_KEYS.join(", ")
            )));
        }
        Self::default().apply(key, value)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

/// Comma-separated list, e.g. `measurement,sleep`.
fn parse_data_types(value: &str) -> Result<Vec<DataType>> {
    let mut types = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let dt: DataType = part.parse()?;
        if !types.contains(&dt) {
            types.push(dt);
        }
    }
    if types.is_empty() {
        return Err(Error::Config(format!(
            "{KEY_DATA_TYPES} must name at least one data type"
        )));
    }
    Ok(types)
}

/// OAuth application registered with the vendor.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub callback_uri: String,
}

impl OAuthApp {
    /// Read `WITHINGS_CLIENT_ID`, `WITHINGS_CLIENT_SECRET` and
    /// `WITHINGS_CALLBACK_URI`, after loading `<data_dir>/.env` and `./.env`.
    pub fn from_env(paths: &Paths) -> Result<Self> {
        if paths.env_file.exists() {
            if let Err(e) = dotenvy::from_path(&paths.env_file) {
                log::warn!("Could not load {}: {e}", paths.env_file.display());
            }
        }
        dotenvy::dotenv().ok();

        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let client_id = var("WITHINGS_CLIENT_ID")
            .ok_or_else(|| Error::Config("WITHINGS_CLIENT_ID is not set".into()))?;
        let client_secret = var("WITHINGS_CLIENT_SECRET")
            .ok_or_else(|| Error::Config("WITHINGS_CLIENT_SECRET is not set".into()))?;
        let callback_uri =
            var("WITHINGS_CALLBACK_URI").unwrap_or_else(|| "http://localhost:8080".to_string());

        Ok(Self {
            client_id,
            client_secret,
            callback_uri,
        })
    }
}
