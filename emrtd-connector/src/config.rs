//! Connector configuration.

use std::time::Duration;

use emrtd_core::SessionIdentity;

use crate::error::ConnectorError;
use crate::retry::RetryPolicy;

/// Liveness probe deadline after the socket opens.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the server's CLOSE after the result.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Delay before a transport disconnect is treated as meaningful.
pub const DEFAULT_DISCONNECT_SETTLE: Duration = Duration::from_millis(300);

/// Host platform ceiling for one chip reader session.
pub const DEFAULT_CHIP_SESSION_CEILING: Duration = Duration::from_secs(60);

/// Configuration for one validation session.
///
/// This struct does not implement `Clone` to prevent accidental duplication
/// of validation identifiers.
#[derive(Debug)]
pub struct ConnectorConfig {
    /// Validation server URL (e.g., "wss://server/ws1/validate")
    pub server_url: String,
    /// Validation and client ids sent in START.
    pub identity: SessionIdentity,
    /// Extra headers for the WebSocket upgrade request.
    pub http_headers: Vec<(String, String)>,
    /// Send MONITORING messages and request server diagnostics.
    pub enable_diagnostics: bool,
    /// Wait for RESULT. When false the session is fire-and-forget and a
    /// normal close after FINISH counts as success.
    pub receive_result: bool,
    /// Platform label sent in START.
    pub platform: String,
    /// Allow insecure ws:// connections (for localhost development only)
    pub insecure_dev: bool,
    /// Retry policy for the connect phase.
    pub retry: RetryPolicy,
    /// Liveness probe deadline.
    pub probe_timeout: Duration,
    /// Grace period for the server's CLOSE after completion.
    pub close_grace: Duration,
    /// Settle delay after a transport disconnect.
    pub disconnect_settle: Duration,
    /// Host ceiling for a chip reader phase.
    pub chip_session_ceiling: Duration,
    /// Turn an invalid outcome into [`ConnectorError::ValidationFailed`].
    pub require_valid_outcome: bool,
}

impl ConnectorConfig {
    /// Create a new configuration.
    pub fn new(
        server_url: impl Into<String>,
        validation_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            identity: SessionIdentity::new(validation_id, client_id),
            http_headers: Vec::new(),
            enable_diagnostics: false,
            receive_result: true,
            platform: std::env::consts::OS.to_string(),
            insecure_dev: false,
            retry: RetryPolicy::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            disconnect_settle: DEFAULT_DISCONNECT_SETTLE,
            chip_session_ceiling: DEFAULT_CHIP_SESSION_CEILING,
            require_valid_outcome: false,
        }
    }

    /// Add a header to the upgrade request.
    pub fn with_http_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_headers.push((name.into(), value.into()));
        self
    }

    /// Enable MONITORING messages.
    pub fn with_diagnostics(mut self) -> Self {
        self.enable_diagnostics = true;
        self
    }

    /// Do not wait for RESULT.
    pub fn fire_and_forget(mut self) -> Self {
        self.receive_result = false;
        self
    }

    /// Override the platform label.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Override the connect retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject outcomes that do not validate.
    pub fn with_required_valid_outcome(mut self) -> Self {
        self.require_valid_outcome = true;
        self
    }

    /// Override the close grace period and the disconnect settle delay.
    pub fn with_close_timing(mut self, close_grace: Duration, disconnect_settle: Duration) -> Self {
        self.close_grace = close_grace;
        self.disconnect_settle = disconnect_settle;
        self
    }

    /// Override the chip session ceiling.
    pub fn with_chip_session_ceiling(mut self, ceiling: Duration) -> Self {
        self.chip_session_ceiling = ceiling;
        self
    }

    /// Allow insecure ws:// connections (for localhost development only).
    ///
    /// # Security Warning
    ///
    /// This disables transport encryption. Only use for local testing.
    pub fn with_insecure_dev(mut self) -> Self {
        self.insecure_dev = true;
        self
    }

    /// Check the URL scheme.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.server_url.starts_with("wss://") {
            return Ok(());
        }
        if self.insecure_dev && self.server_url.starts_with("ws://") {
            return Ok(());
        }
        Err(ConnectorError::ConnectionFailed(
            "wss:// required (use insecure_dev for local testing)".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::new("wss://example.test/ws", "v-1", "c-1");
        assert_eq!(config.identity.validation_id(), "v-1");
        assert_eq!(config.identity.client_id(), "c-1");
        assert!(config.receive_result);
        assert!(!config.enable_diagnostics);
        assert_eq!(config.disconnect_settle, Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ws_requires_insecure_dev() {
        let config = ConnectorConfig::new("ws://127.0.0.1:9000", "v", "c");
        assert!(config.validate().is_err());
        assert!(config.with_insecure_dev().validate().is_ok());
    }

    #[test]
    fn test_other_schemes_rejected() {
        let config = ConnectorConfig::new("https://example.test", "v", "c").with_insecure_dev();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = ConnectorConfig::new("wss://example.test", "v", "c")
            .with_http_header("Authorization", "Bearer t")
            .with_diagnostics()
            .fire_and_forget();
        assert_eq!(
            config.http_headers,
            vec![("Authorization".to_string(), "Bearer t".to_string())]
        );
        assert!(config.enable_diagnostics);
        assert!(!config.receive_result);
    }
}
