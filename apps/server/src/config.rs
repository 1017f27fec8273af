//! Server configuration from environment variables

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use strand_engine::{EngineConfig, HealthConfig};

/// Runtime configuration, read once at startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (`STRAND_BIND`, default `0.0.0.0:3000`)
    pub bind_addr: SocketAddr,

    /// Public base URL used in webhook callback URLs
    /// (`STRAND_PUBLIC_URL`, default derived from the bind address)
    pub public_base_url: String,

    /// Health supervisor timing (`STRAND_HEALTH_INTERVAL_SECS`,
    /// `STRAND_HEALTH_SUCCESS_WINDOW_SECS`, `STRAND_HEALTH_TIMEOUT_SECS`)
    pub health: HealthConfig,
}

fn env_duration(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{name} must be an integer number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    /// Load configuration from the environment
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = std::env::var("STRAND_BIND")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()
            .context("STRAND_BIND must be a socket address")?;

        let public_base_url = std::env::var("STRAND_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", bind_addr.port()));

        let defaults = HealthConfig::default();
        let health = HealthConfig {
            interval: env_duration("STRAND_HEALTH_INTERVAL_SECS", defaults.interval)?,
            success_window: env_duration(
                "STRAND_HEALTH_SUCCESS_WINDOW_SECS",
                defaults.success_window,
            )?,
            probe_timeout: env_duration("STRAND_HEALTH_TIMEOUT_SECS", defaults.probe_timeout)?,
        };

        Ok(Self {
            bind_addr,
            public_base_url,
            health,
        })
    }

    /// Engine configuration derived from the server settings
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            callback_base: self.public_base_url.clone(),
            health: self.health.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_carries_public_url() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            public_base_url: "https://orchestrator.example.com".to_string(),
            health: HealthConfig::default(),
        };

        let engine = config.engine_config();
        assert_eq!(engine.callback_base, "https://orchestrator.example.com");
    }
}
