use log::debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetError {
    /// JSON-RPC level failures (error objects, malformed responses)
    #[error("RPC Error: {0}")]
    RpcError(String),

    /// Network/connectivity issues below the RPC layer
    #[error("Network Error: {0}")]
    NetworkError(String),

    /// WebSocket connection/data issues - CRITICAL for real-time data
    #[error("WebSocket Error: {0}")]
    WebSocketError(String),

    /// Deadline exceeded (probe timer, request deadline, active-socket timeout)
    #[error("Timeout Error: {0}")]
    TimeoutError(String),

    /// Payload could not be decoded
    #[error("Parse Error: {0}")]
    ParseError(String),

    /// Configuration errors
    #[error("Config Error: {0}")]
    ConfigError(String),

    /// The transport (or its socket agent) was destroyed
    #[error("Transport Closed: {0}")]
    TransportClosed(String),

    /// Subscribe/unsubscribe rejected by the provider
    #[error("Subscription Error: {0}")]
    SubscriptionError(String),

    /// Automatic reconnection gave up
    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        NetError::ParseError(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<reqwest::Error> for NetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetError::TimeoutError(format!("HTTP request timed out: {}", err))
        } else if err.is_decode() {
            NetError::ParseError(format!("HTTP response decode failed: {}", err))
        } else {
            NetError::NetworkError(format!("HTTP error: {}", err))
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NetError::WebSocketError(err.to_string())
    }
}

impl From<url::ParseError> for NetError {
    fn from(err: url::ParseError) -> Self {
        NetError::ConfigError(format!("Invalid URL: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for NetError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetError::TimeoutError("deadline elapsed".to_string())
    }
}

impl NetError {
    /// Determines if an error is recoverable through retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            NetError::RpcError(_) => true,
            NetError::NetworkError(_) => true,
            NetError::WebSocketError(_) => true,
            NetError::TimeoutError(_) => true,
            NetError::ParseError(_) => false, // Data format issues aren't recoverable
            NetError::ConfigError(_) => false, // Config needs fixing
            NetError::TransportClosed(_) => true, // A fresh transport fixes it
            NetError::SubscriptionError(_) => true,
            NetError::ReconnectExhausted(_) => false, // Manual intervention needed
        }
    }

    /// Determines if operation should be retried immediately
    pub fn should_retry(&self) -> bool {
        self.is_recoverable()
            && match self {
                NetError::NetworkError(_) => true,
                NetError::TimeoutError(_) => true,
                NetError::WebSocketError(_) => true,
                NetError::RpcError(msg) => {
                    // Node-side hiccups are worth another try, rejected params are not
                    msg.contains("429") || msg.contains("busy") || msg.contains("timeout")
                }
                _ => false,
            }
    }

    /// Categorizes error for metrics and monitoring
    pub fn categorize(&self) -> ErrorCategory {
        match self {
            NetError::RpcError(_) | NetError::NetworkError(_) | NetError::TimeoutError(_) => {
                ErrorCategory::Network
            }
            NetError::WebSocketError(_) | NetError::SubscriptionError(_) => ErrorCategory::DataFeed,
            NetError::TransportClosed(_) => ErrorCategory::Network,
            NetError::ParseError(_) => ErrorCategory::Data,
            NetError::ConfigError(_) => ErrorCategory::Configuration,
            NetError::ReconnectExhausted(_) => ErrorCategory::Critical,
        }
    }

    /// True for the probe-timeout flavour of failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::TimeoutError(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    Network,
    DataFeed,
    Data,
    Configuration,
    Critical,
}

/// Exponential backoff schedule: `min(base * 2^attempt, max_delay)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait before the zero-based `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^31 ms is already far past any sane cap
        let factor = 2_u128.saturating_pow(attempt.min(31));
        let delay_ms = self.base_delay.as_millis().saturating_mul(factor);
        let delay = Duration::from_millis(delay_ms.min(self.max_delay.as_millis()) as u64);

        debug!("Backoff attempt {}: delay = {:?}", attempt, delay);
        delay
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

// Convenience type aliases
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_doubles_then_caps() {
        let policy = BackoffPolicy::new(20, Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..8).map(|a| policy.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_backoff_large_attempt_does_not_overflow() {
        let policy = BackoffPolicy::new(20, Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(30));
        assert!(policy.is_exhausted(20));
        assert!(!policy.is_exhausted(19));
    }

    #[test]
    fn test_error_classification() {
        assert!(NetError::TimeoutError("probe".into()).is_timeout());
        assert!(NetError::TimeoutError("probe".into()).should_retry());
        assert!(!NetError::ConfigError("bad".into()).is_recoverable());
        assert_eq!(
            NetError::ReconnectExhausted(20).categorize(),
            ErrorCategory::Critical
        );
        assert_eq!(
            NetError::WebSocketError("eof".into()).categorize(),
            ErrorCategory::DataFeed
        );
    }
}
