use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// HS256 secret for connection tokens. Without it the relay trusts the
    /// `user_id` query parameter, which is only acceptable on a closed LAN.
    pub jwt_secret: Option<String>,
    pub idle_timeout_seconds: u64,
    pub heartbeat_scan_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("LANLINE_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            jwt_secret: env::var("LANLINE_JWT_SECRET")
                .ok()
                .filter(|secret| !secret.is_empty()),
            idle_timeout_seconds: env::var("LANLINE_RELAY_IDLE_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(defaults.idle_timeout_seconds),
            heartbeat_scan_seconds: env::var("LANLINE_RELAY_HEARTBEAT_SCAN")
                .ok()
                .and_then(|t| t.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.heartbeat_scan_seconds),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn heartbeat_scan_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_scan_seconds.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            jwt_secret: None,
            idle_timeout_seconds: 600, // 10 minutes
            heartbeat_scan_seconds: 60,
        }
    }
}
