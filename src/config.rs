//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines the
//! fixed limits of the annotation pipeline.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Largest `Content-Length` (in bytes) accepted when downloading an image
pub const MAX_DOWNLOAD_SIZE: u64 = 5_000_000;
/// Longest side (in pixels) of an image sent for annotation
pub const MAX_IMAGE_SIZE: u32 = 1600;
/// Result cap for label and face detection
pub const MAX_RESULTS: u32 = 10;
/// Annotation calls allowed per calendar day
pub const DAILY_QUOTA: u32 = 30;
/// Network timeout for image downloads
pub const FETCH_TIMEOUT_SECS: u64 = 2;
/// Storage key of the persisted quota record
pub const QUOTA_KEY: &str = "QUOTA";

/// Which key/value backend persists the quota record
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Cloudflare R2 / S3 bucket
    R2,
    /// Local JSON file
    #[default]
    File,
    /// Process memory, lost on restart
    Memory,
}

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Comma-separated list of Telegram IDs allowed to reset the quota
    #[serde(rename = "admin_users")]
    pub admin_users_str: Option<String>,

    /// Backend used to persist the quota record
    #[serde(default)]
    pub storage_backend: StorageBackend,
    /// Path of the quota file for the `file` backend
    #[serde(default = "default_quota_file")]
    pub quota_file: String,

    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,

    /// Pause before the punchline of the generic failure reply
    #[serde(default = "default_failure_reply_delay_ms")]
    pub failure_reply_delay_ms: u64,
}

fn default_quota_file() -> String {
    "data/quota.json".to_string()
}

const fn default_failure_reply_delay_ms() -> u64 {
    2000
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use oxide_vision::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Eg.. `APP_STORAGE_BACKEND=memory ./target/app`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // UPPER_SNAKE_CASE variables map to snake_case keys; empty ones count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Returns the set of Telegram IDs allowed to run privileged commands
    #[must_use]
    pub fn admin_users(&self) -> HashSet<i64> {
        parse_id_list(self.admin_users_str.as_deref())
    }

    /// Returns the delay used by the generic failure reply
    #[must_use]
    pub const fn failure_reply_delay(&self) -> Duration {
        Duration::from_millis(self.failure_reply_delay_ms)
    }
}

fn parse_id_list(raw: Option<&str>) -> HashSet<i64> {
    raw.map(|s| {
        s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .filter_map(|id| id.parse::<i64>().ok())
            .collect()
    })
    .unwrap_or_default()
}
