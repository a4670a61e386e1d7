//! Configuration module for pass-service.

use service_core::config::{self as core_config, env_or, env_parse, env_required};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PassConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub broker: BrokerClientConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub period_secs: u64,
}

impl SchedulerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

#[derive(Debug, Clone)]
pub struct BrokerClientConfig {
    pub request_timeout_secs: u64,
}

impl BrokerClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PassConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let period_secs: u64 = env_parse("SCHEDULER_PERIOD_SECS", 30)?;
        if period_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SCHEDULER_PERIOD_SECS must be greater than zero"
            )));
        }

        Ok(Self {
            common,
            service_name: env_or("SERVICE_NAME", "pass-service"),
            log_level: env_or("LOG_LEVEL", "info"),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env_required("DATABASE_URL")?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            scheduler: SchedulerConfig {
                enabled: env_parse("SCHEDULER_ENABLED", true)?,
                period_secs,
            },
            broker: BrokerClientConfig {
                request_timeout_secs: env_parse("BROKER_REQUEST_TIMEOUT_SECS", 30)?,
            },
        })
    }
}
