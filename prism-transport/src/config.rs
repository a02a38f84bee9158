use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::batch::DEFAULT_MAX_BATCH_LEN;
use crate::error::TransportError;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP service root, e.g. `http://host:8080`
    pub base_url: String,
    /// WebSocket endpoint for render-loop streaming
    pub ws_url: String,
    /// Maximum escaped request length per HTTP unit
    pub max_batch_len: usize,
    /// Maximum encoded bytes per WebSocket command unit
    pub ws_max_batch_len: usize,
    /// Delay between execute-result polls, in milliseconds
    pub poll_delay_ms: u64,
    /// HTTP request timeout in milliseconds (0 = none)
    pub request_timeout_ms: u64,
    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Outgoing WebSocket frame channel capacity
    pub command_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            ws_url: "ws://127.0.0.1:8080/render_loop_stream/".to_string(),
            max_batch_len: DEFAULT_MAX_BATCH_LEN,
            ws_max_batch_len: 64 * 1024,
            poll_delay_ms: 1000,
            request_timeout_ms: 0,
            handshake_timeout_ms: 5000,
            command_channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Reads a JSON config file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overrides URLs from `PRISM_BASE_URL` and `PRISM_WS_URL`.
    pub fn with_env(self) -> Self {
        self.with_overrides(
            std::env::var("PRISM_BASE_URL").ok(),
            std::env::var("PRISM_WS_URL").ok(),
        )
    }

    fn with_overrides(mut self, base_url: Option<String>, ws_url: Option<String>) -> Self {
        if let Some(url) = base_url.filter(|u| !u.is_empty()) {
            self.base_url = url;
        }
        if let Some(url) = ws_url.filter(|u| !u.is_empty()) {
            self.ws_url = url;
        }
        self
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_batch_len, 2000);
        assert_eq!(config.poll_delay(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"base_url": "http://render:9000", "poll_delay_ms": 250}}"#).unwrap();
        let config = ClientConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.base_url, "http://render:9000");
        assert_eq!(config.poll_delay(), Duration::from_millis(250));
        assert_eq!(config.ws_url, ClientConfig::default().ws_url);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            ClientConfig::from_json_file(file.path()),
            Err(TransportError::Json(_))
        ));
    }

    #[test]
    fn test_overrides_ignore_empty() {
        let config = ClientConfig::default()
            .with_overrides(Some("http://other".into()), Some(String::new()));
        assert_eq!(config.base_url, "http://other");
        assert_eq!(config.ws_url, ClientConfig::default().ws_url);
    }
}
