//! Session configuration.
//!
//! Both configs deserialize from JSON with every field optional:
//!
//! ```
//! use bitrpc::{ClientConfig, ServerConfig};
//!
//! let client = ClientConfig::from_json_str(r#"{"default_timeout_ms": 250}"#).unwrap();
//! assert_eq!(client.default_timeout_ms, Some(250));
//!
//! let server = ServerConfig::from_json_str("{}").unwrap();
//! assert_eq!(server, ServerConfig::default());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::transport::DEFAULT_MAX_MESSAGE_SIZE;

/// Default maximum concurrently running request handlers per server.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Client session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout applied to calls whose context carries no deadline.
    pub default_timeout_ms: Option<u64>,
    /// Largest frame the client will send.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Default settings: no timeout, default message size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline applied to calls whose context has none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the largest frame the client will send.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// The default call timeout, if configured.
    #[inline]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Parse settings from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Server session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Request handlers allowed to run at once; further requests are
    /// answered with a server-busy error.
    pub max_concurrent_requests: usize,
    /// Largest frame the server will send.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many request handlers may run at once.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Set the largest frame the server will send.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Parse settings from JSON.
    ///
    /// # Errors
    ///
    /// Invalid JSON, or `max_concurrent_requests` of zero.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.max_concurrent_requests == 0 {
            return Err(RpcError::Protocol(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        Ok(config)
    }
}

/// Fail with `MessageTooLarge` if `len` exceeds `limit`.
#[inline]
pub(crate) fn check_size(len: usize, limit: usize) -> Result<()> {
    if len > limit {
        return Err(RpcError::MessageTooLarge { size: len, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.default_timeout(), None);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_client_builder() {
        let config = ClientConfig::new()
            .with_default_timeout(Duration::from_millis(1500))
            .with_max_message_size(1024);
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn test_server_from_json_partial() {
        let config = ServerConfig::from_json_str(r#"{"max_concurrent_requests": 8}"#).unwrap();
        assert_eq!(config.max_concurrent_requests, 8);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_server_rejects_zero_concurrency() {
        assert!(ServerConfig::from_json_str(r#"{"max_concurrent_requests": 0}"#).is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            ClientConfig::from_json_str("{not json"),
            Err(RpcError::Json(_))
        ));
    }

    #[test]
    fn test_check_size() {
        assert!(check_size(10, 10).is_ok());
        assert!(matches!(
            check_size(11, 10),
            Err(RpcError::MessageTooLarge { size: 11, limit: 10 })
        ));
    }
}
