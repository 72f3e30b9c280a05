use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Window used by both presets.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Request cap used by both presets.
pub const DEFAULT_MAX_REQUESTS: u64 = 5;

pub const GENERAL_MESSAGE: &str = "Too many requests, please try again later.";

pub const LOGIN_MESSAGE: &str = "Too many login requests";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid rate limiter configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Immutable fixed window policy for a [RateLimiter](crate::RateLimiter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    window: Duration,
    max_requests: u64,
    message: Arc<str>,
}

impl LimiterConfig {
    /// Validates and creates a policy.
    ///
    /// # Arguments
    ///
    /// * `window`: Length of each counting window, must be non-zero.
    /// * `max_requests`: Requests admitted per key within one window, must be non-zero.
    /// * `message`: Returned in [Decision::Rejected](crate::Decision::Rejected).
    pub fn new(
        window: Duration,
        max_requests: u64,
        message: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if window.is_zero() {
            return Err(ConfigError::InvalidConfig("window duration must be non-zero"));
        }
        if max_requests == 0 {
            return Err(ConfigError::InvalidConfig("max requests must be non-zero"));
        }
        Ok(Self {
            window,
            max_requests,
            message: Arc::from(message.into()),
        })
    }

    /// General purpose policy: 5 requests per 15 minutes.
    pub fn general() -> Self {
        Self::preset(GENERAL_MESSAGE)
    }

    /// Login policy: 5 requests per 15 minutes, with a login specific message.
    pub fn login() -> Self {
        Self::preset(LOGIN_MESSAGE)
    }

    fn preset(message: &str) -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
            message: Arc::from(message),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
