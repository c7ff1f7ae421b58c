use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

use super::{database_url, server_bind_address};

const DEFAULT_WORKER_CONCURRENCY: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
const DEFAULT_PROVISION_QUEUE: &str = "notification_policies";
const DEFAULT_PROVISION_MAX_RETRIES: u32 = 3;
const DEFAULT_PROVISION_RETRY_ON: &str = "not_found,transient,permanent";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Settings for the background job workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub queue: String,
    pub provision_max_retries: u32,
    /// Error class names that trigger a retry of the provisioning job.
    pub provision_retry_on: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            queue: DEFAULT_PROVISION_QUEUE.to_string(),
            provision_max_retries: DEFAULT_PROVISION_MAX_RETRIES,
            provision_retry_on: split_list(DEFAULT_PROVISION_RETRY_ON),
        }
    }
}

impl WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let concurrency: usize = parse_var("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "WORKER_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        let poll_ms: u64 = parse_var("WORKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        let timeout_secs: u64 = parse_var("WORKER_JOB_TIMEOUT_SECS", DEFAULT_JOB_TIMEOUT_SECS)?;
        let provision_max_retries: u32 =
            parse_var("PROVISION_MAX_RETRIES", DEFAULT_PROVISION_MAX_RETRIES)?;

        let queue = env::var("PROVISION_QUEUE")
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|_| DEFAULT_PROVISION_QUEUE.to_string());
        if queue.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "PROVISION_QUEUE",
                value: queue,
            });
        }

        let retry_on = env::var("PROVISION_RETRY_ON")
            .unwrap_or_else(|_| DEFAULT_PROVISION_RETRY_ON.to_string());

        Ok(Self {
            concurrency,
            poll_interval: Duration::from_millis(poll_ms),
            job_timeout: Duration::from_secs(timeout_secs),
            queue,
            provision_max_retries,
            provision_retry_on: split_list(&retry_on),
        })
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url: database_url(),
            worker: WorkerConfig::from_env()?,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("APP_ENV must be one of 'development', 'production', or 'test' (got {0})")]
    InvalidEnvironment(String),
    #[error("invalid APP_BIND_ADDR value: {0}")]
    BindAddress(std::net::AddrParseError),
    #[error("invalid {name} value: {value}")]
    InvalidValue { name: &'static str, value: String },
}
