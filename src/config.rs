//! OrbitPresence configuration
//!
//! Configuration comes from:
//! 1. Environment variables (PRESENCE_REDIS_URL)
//! 2. Command line overrides (see the `orbitpresence` binary)

/// Environment variable holding the store URL
pub const REDIS_URL_ENV: &str = "PRESENCE_REDIS_URL";

/// Store URL used when nothing is configured
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";

const URL_SCHEMES: &[&str] = &["redis://", "rediss://", "redis+unix://", "unix://"];

/// Connection settings shared by the command and notification connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Redis connection URL (database index and credentials go in the URL)
    pub redis_url: String,
}

impl Config {
    /// Create config for an explicit store URL
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(REDIS_URL_ENV) {
            Ok(url) => validate_url(&url)
                .map(Self::new)
                .map_err(|reason| ConfigError::InvalidEnv(REDIS_URL_ENV, reason)),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(std::env::VarError::NotUnicode(_)) => {
                Err(ConfigError::InvalidEnv(REDIS_URL_ENV, "expected UTF-8"))
            }
        }
    }

    /// Replace the store URL, checking its scheme
    pub fn with_redis_url(mut self, url: &str) -> Result<Self, ConfigError> {
        self.redis_url = validate_url(url).map_err(ConfigError::InvalidUrl)?;
        Ok(self)
    }
}

fn validate_url(url: &str) -> Result<String, &'static str> {
    let url = url.trim();
    if url.is_empty() {
        return Err("empty URL");
    }
    if !URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return Err("expected redis://, rediss://, redis+unix:// or unix:// URL");
    }
    Ok(url.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_URL)
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),

    #[error("invalid store URL: {0}")]
    InvalidUrl(&'static str),
}
