//! Client configuration.

use crate::error::{ClientError, ClientResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the API client and conversation engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the message server (e.g., "http://localhost:8000").
    pub api_base_url: String,

    /// How often an open conversation polls for new messages (milliseconds).
    pub poll_interval_ms: u64,

    /// Upper bound on concurrently running decrypt jobs.
    pub max_decrypt_workers: usize,

    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,

    /// Keep plaintext of messages sent this session so they can be shown
    /// instead of the "sent, encrypted" placeholder.
    pub retain_sent_plaintext: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            poll_interval_ms: 2000,
            max_decrypt_workers: 4,
            request_timeout_secs: 30,
            retain_sent_plaintext: true,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON config; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> ClientResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(ClientError::Config("api_base_url is empty".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ClientError::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.max_decrypt_workers == 0 {
            return Err(ClientError::Config("max_decrypt_workers must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL without a trailing slash.
    pub(crate) fn base_url(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }
}
