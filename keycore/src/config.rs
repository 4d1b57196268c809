//! Engine configuration

use std::time::Duration;

use crate::error::{EngineError, EngineResult};

const DAY: i64 = 24 * 60 * 60;

/// Default server base URL
pub const DEFAULT_API_URL: &str = "https://nochat.io/api";

/// Default database file
pub const DEFAULT_DB_PATH: &str = "nochat-keys.db";

/// Tunables for key lifecycle maintenance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of one-time prekeys the pool is refilled to
    pub prekey_pool_target: u32,
    /// Pool size below which a refill is triggered
    pub prekey_low_water: u32,
    /// Signed prekey age (seconds) after which it is rotated
    pub signed_prekey_max_age: i64,
    /// Age (seconds) after which superseded signed prekeys are pruned
    pub signed_prekey_retention: i64,
    /// Sender key age (seconds) after which it is rotated
    pub sender_key_max_age: i64,
    /// Message count at which a sender key is rotated
    pub sender_key_max_messages: u64,
    /// Seconds without use after which a session counts as stale
    pub session_stale_after: i64,
    /// Delay before the first sender-key check after startup
    pub sender_key_startup_delay: Duration,
    /// Period of the sender-key rotation check
    pub sender_key_check_interval: Duration,
    /// How often the self-verification timer wakes up
    pub verification_check_interval: Duration,
    /// Minimum time (seconds) between two self-verifications
    pub verification_period: i64,
    /// Server base URL, without trailing slash
    pub api_url: String,
    /// SQLite database path
    pub db_path: String,
    /// Transport timeout for server calls
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prekey_pool_target: 110,
            prekey_low_water: 20,
            signed_prekey_max_age: 7 * DAY,
            signed_prekey_retention: 30 * DAY,
            sender_key_max_age: 7 * DAY,
            sender_key_max_messages: 1000,
            session_stale_after: 30 * DAY,
            sender_key_startup_delay: Duration::from_secs(60),
            sender_key_check_interval: Duration::from_secs(DAY as u64),
            verification_check_interval: Duration::from_secs(60 * 60),
            verification_period: DAY,
            api_url: DEFAULT_API_URL.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `NOCHAT_API_URL` and `NOCHAT_DB_PATH`
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Ok(api_url) = std::env::var("NOCHAT_API_URL") {
            config.api_url = api_url;
        }
        if let Ok(db_path) = std::env::var("NOCHAT_DB_PATH") {
            config.db_path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable together
    pub fn validate(&self) -> EngineResult<()> {
        let parsed = url::Url::parse(&self.api_url)
            .map_err(|e| EngineError::Config(format!("Invalid API URL {}: {}", self.api_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::Config(format!(
                "API URL must be http(s): {}",
                self.api_url
            )));
        }
        if self.prekey_low_water >= self.prekey_pool_target {
            return Err(EngineError::Config(format!(
                "Prekey low-water mark ({}) must be below the pool target ({})",
                self.prekey_low_water, self.prekey_pool_target
            )));
        }
        if self.db_path.is_empty() {
            return Err(EngineError::Config("Database path is empty".to_string()));
        }
        Ok(())
    }

    /// Base URL with any trailing slash removed
    pub fn api_base(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }
}
