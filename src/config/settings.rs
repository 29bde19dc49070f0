use crate::error::{NetError, Result};
use crate::rpc::agent::AgentConfig;
use crate::rpc::manager::RpcManagerConfig;
use crate::rpc::rate_limiter::RateLimiterConfig;
use crate::utils::{redact_url, ws_url_from_http};
use crate::websocket::manager::SubscriptionManagerConfig;
use log::LevelFilter;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered endpoint list; the first one is the primary.
    pub rpc_urls: Vec<String>,
    pub ws_url: Option<String>,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,
    pub health_check_interval_ms: u64,
    pub keep_warm_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub unhealthy_threshold: u32,
    pub escalation_threshold: u32,
    pub reset_cooldown_secs: u64,
    pub stale_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub diagnostics_window_secs: u64,
    pub agent_idle_timeout_ms: u64,
    pub agent_active_timeout_ms: u64,
    pub agent_socket_ttl_ms: u64,
    pub subscribe_programs: Vec<String>,
    pub status_interval_secs: u64,
    pub log_level: LevelFilter,
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_urls: vec!["http://127.0.0.1:8899".to_string()],
            ws_url: None,
            rate_limit_rps: 50.0,
            rate_limit_burst: 50,
            health_check_interval_ms: 10_000,
            keep_warm_interval_ms: 1_000,
            heartbeat_interval_ms: 15_000,
            probe_timeout_ms: 5_000,
            request_timeout_ms: 8_000,
            unhealthy_threshold: 3,
            escalation_threshold: 2,
            reset_cooldown_secs: 30,
            stale_timeout_secs: 90,
            max_reconnect_attempts: 20,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            diagnostics_window_secs: 60,
            agent_idle_timeout_ms: 15_000,
            agent_active_timeout_ms: 10_000,
            agent_socket_ttl_ms: 60_000,
            subscribe_programs: Vec::new(),
            status_interval_secs: 30,
            log_level: LevelFilter::Info,
        }
    }
}

impl Config {
    /// Reads the process environment. Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let d = Config::default();

        let rpc_urls = match env::var("RPC_URLS") {
            Ok(list) if !parse_list(&list).is_empty() => parse_list(&list),
            _ => {
                let mut urls = vec![env::var("RPC_URL").unwrap_or_else(|_| d.rpc_urls[0].clone())];
                if let Ok(backups) = env::var("RPC_URL_BACKUP") {
                    urls.extend(parse_list(&backups));
                }
                urls
            }
        };

        Config {
            rpc_urls,
            ws_url: env::var("WS_URL").ok().filter(|s| !s.trim().is_empty()),
            rate_limit_rps: parse_or("RATE_LIMIT_RPS", d.rate_limit_rps),
            rate_limit_burst: parse_or("RATE_LIMIT_BURST", d.rate_limit_burst),
            health_check_interval_ms: parse_or("HEALTH_CHECK_INTERVAL_MS", d.health_check_interval_ms),
            keep_warm_interval_ms: parse_or("KEEP_WARM_INTERVAL_MS", d.keep_warm_interval_ms),
            heartbeat_interval_ms: parse_or("HEARTBEAT_INTERVAL_MS", d.heartbeat_interval_ms),
            probe_timeout_ms: parse_or("PROBE_TIMEOUT_MS", d.probe_timeout_ms),
            request_timeout_ms: parse_or("REQUEST_TIMEOUT_MS", d.request_timeout_ms),
            unhealthy_threshold: parse_or("UNHEALTHY_THRESHOLD", d.unhealthy_threshold),
            escalation_threshold: parse_or("ESCALATION_THRESHOLD", d.escalation_threshold),
            reset_cooldown_secs: parse_or("RESET_COOLDOWN_SECS", d.reset_cooldown_secs),
            stale_timeout_secs: parse_or("STALE_TIMEOUT_SECS", d.stale_timeout_secs),
            max_reconnect_attempts: parse_or("MAX_RECONNECT_ATTEMPTS", d.max_reconnect_attempts),
            reconnect_base_delay_ms: parse_or("RECONNECT_BASE_DELAY_MS", d.reconnect_base_delay_ms),
            reconnect_max_delay_ms: parse_or("RECONNECT_MAX_DELAY_MS", d.reconnect_max_delay_ms),
            diagnostics_window_secs: parse_or("DIAGNOSTICS_WINDOW_SECS", d.diagnostics_window_secs),
            agent_idle_timeout_ms: parse_or("AGENT_IDLE_TIMEOUT_MS", d.agent_idle_timeout_ms),
            agent_active_timeout_ms: parse_or("AGENT_ACTIVE_TIMEOUT_MS", d.agent_active_timeout_ms),
            agent_socket_ttl_ms: parse_or("AGENT_SOCKET_TTL_MS", d.agent_socket_ttl_ms),
            subscribe_programs: env::var("SUBSCRIBE_PROGRAMS")
                .map(|s| parse_list(&s))
                .unwrap_or_default(),
            status_interval_secs: parse_or("STATUS_INTERVAL_SECS", d.status_interval_secs),
            log_level: parse_or("LOG_LEVEL", d.log_level),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_urls.is_empty() {
            return Err(NetError::ConfigError("no RPC endpoints configured".to_string()));
        }
        for url in &self.rpc_urls {
            let parsed = url::Url::parse(url).map_err(|e| {
                NetError::ConfigError(format!("invalid RPC URL {}: {}", redact_url(url), e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(NetError::ConfigError(format!(
                    "RPC URL {} must be http(s)",
                    redact_url(url)
                )));
            }
        }
        if let Some(ws) = &self.ws_url {
            url::Url::parse(ws).map_err(|e| {
                NetError::ConfigError(format!("invalid WS_URL {}: {}", redact_url(ws), e))
            })?;
        }
        if !self.rate_limit_rps.is_finite() || self.rate_limit_rps <= 0.0 || self.rate_limit_burst == 0 {
            return Err(NetError::ConfigError(
                "RATE_LIMIT_RPS and RATE_LIMIT_BURST must be positive".to_string(),
            ));
        }
        if self.unhealthy_threshold == 0 || self.escalation_threshold == 0 {
            return Err(NetError::ConfigError(
                "failure thresholds must be at least 1".to_string(),
            ));
        }
        if self.max_reconnect_attempts == 0 || self.stale_timeout_secs == 0 {
            return Err(NetError::ConfigError(
                "MAX_RECONNECT_ATTEMPTS and STALE_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        // Loop periods feed tokio intervals, which panic on zero.
        for (key, value) in [
            ("HEALTH_CHECK_INTERVAL_MS", self.health_check_interval_ms),
            ("KEEP_WARM_INTERVAL_MS", self.keep_warm_interval_ms),
            ("HEARTBEAT_INTERVAL_MS", self.heartbeat_interval_ms),
            ("DIAGNOSTICS_WINDOW_SECS", self.diagnostics_window_secs),
            ("PROBE_TIMEOUT_MS", self.probe_timeout_ms),
            ("REQUEST_TIMEOUT_MS", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(NetError::ConfigError(format!("{} must be positive", key)));
            }
        }
        Ok(())
    }

    /// Streaming endpoint: `WS_URL`, or the primary RPC URL with a ws scheme.
    pub fn stream_url(&self) -> Result<String> {
        match &self.ws_url {
            Some(ws) => Ok(ws.clone()),
            None => {
                let primary = self
                    .rpc_urls
                    .first()
                    .ok_or_else(|| NetError::ConfigError("no RPC endpoints configured".to_string()))?;
                ws_url_from_http(primary)
            }
        }
    }

    pub fn log_settings(&self) {
        log::info!("⚙️ Configuration loaded:");
        for (i, url) in self.rpc_urls.iter().enumerate() {
            log::info!(
                "   RPC endpoint #{}{}: {}",
                i + 1,
                if i == 0 { " (primary)" } else { "" },
                redact_url(url)
            );
        }
        match self.stream_url() {
            Ok(ws) => log::info!("   Stream endpoint: {}", redact_url(&ws)),
            Err(e) => log::warn!("   Stream endpoint unavailable: {}", e),
        }
        log::info!(
            "   Rate limit: {} req/s, burst {}",
            self.rate_limit_rps,
            self.rate_limit_burst
        );
        log::info!(
            "   Health every {}ms (probe timeout {}ms, unhealthy after {}, reset cooldown {}s)",
            self.health_check_interval_ms,
            self.probe_timeout_ms,
            self.unhealthy_threshold,
            self.reset_cooldown_secs
        );
        log::info!(
            "   Heartbeat every {}ms (stale after {}s, max {} reconnects)",
            self.heartbeat_interval_ms,
            self.stale_timeout_secs,
            self.max_reconnect_attempts
        );
        log::info!("   Programs to watch: {}", self.subscribe_programs.len());
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity: self.rate_limit_burst,
            refill_per_sec: self.rate_limit_rps,
        }
    }

    pub fn rpc_manager_config(&self) -> RpcManagerConfig {
        RpcManagerConfig {
            endpoints: self.rpc_urls.clone(),
            rate_limit: self.rate_limiter_config(),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            keep_warm_interval: Duration::from_millis(self.keep_warm_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            unhealthy_threshold: self.unhealthy_threshold,
            escalation_threshold: self.escalation_threshold,
            reset_cooldown: Duration::from_secs(self.reset_cooldown_secs),
        }
    }

    pub fn subscription_manager_config(&self) -> SubscriptionManagerConfig {
        SubscriptionManagerConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            stale_timeout: Duration::from_secs(self.stale_timeout_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            diagnostics_window: Duration::from_secs(self.diagnostics_window_secs),
            ..SubscriptionManagerConfig::default()
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            idle_timeout: Duration::from_millis(self.agent_idle_timeout_ms),
            active_timeout: Duration::from_millis(self.agent_active_timeout_ms),
            socket_ttl: Duration::from_millis(self.agent_socket_ttl_ms),
            ..AgentConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_url().unwrap(), "ws://127.0.0.1:8899/");
    }

    #[test]
    fn test_projections_carry_thresholds() {
        let config = Config {
            unhealthy_threshold: 5,
            reset_cooldown_secs: 45,
            stale_timeout_secs: 120,
            max_reconnect_attempts: 7,
            ..Config::default()
        };
        let rpc = config.rpc_manager_config();
        assert_eq!(rpc.unhealthy_threshold, 5);
        assert_eq!(rpc.reset_cooldown, Duration::from_secs(45));
        assert_eq!(rpc.endpoints, config.rpc_urls);

        let stream = config.subscription_manager_config();
        assert_eq!(stream.stale_timeout, Duration::from_secs(120));
        assert_eq!(stream.max_reconnect_attempts, 7);
        assert_eq!(stream.reconnect_max_delay, Duration::from_secs(30));

        assert_eq!(config.agent_config().socket_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let no_endpoints = Config {
            rpc_urls: Vec::new(),
            ..Config::default()
        };
        assert!(matches!(no_endpoints.validate(), Err(NetError::ConfigError(_))));

        let bad_scheme = Config {
            rpc_urls: vec!["ftp://example.com".to_string()],
            ..Config::default()
        };
        assert!(bad_scheme.validate().is_err());

        let zero_rate = Config {
            rate_limit_rps: 0.0,
            ..Config::default()
        };
        assert!(zero_rate.validate().is_err());

        let zero_threshold = Config {
            unhealthy_threshold: 0,
            ..Config::default()
        };
        assert!(zero_threshold.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_periods() {
        let zero_heartbeat = Config {
            heartbeat_interval_ms: 0,
            ..Config::default()
        };
        match zero_heartbeat.validate() {
            Err(NetError::ConfigError(msg)) => assert!(msg.contains("HEARTBEAT_INTERVAL_MS")),
            other => panic!("expected config error, got {:?}", other),
        }

        let zero_health = Config {
            health_check_interval_ms: 0,
            ..Config::default()
        };
        assert!(zero_health.validate().is_err());

        let zero_warm = Config {
            keep_warm_interval_ms: 0,
            ..Config::default()
        };
        assert!(zero_warm.validate().is_err());

        let zero_window = Config {
            diagnostics_window_secs: 0,
            ..Config::default()
        };
        assert!(zero_window.validate().is_err());

        let infinite_rate = Config {
            rate_limit_rps: f64::INFINITY,
            ..Config::default()
        };
        assert!(infinite_rate.validate().is_err());
    }

    #[test]
    fn test_parse_list_trims_and_skips_blanks() {
        assert_eq!(
            parse_list(" https://a.example , ,https://b.example"),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }
}
