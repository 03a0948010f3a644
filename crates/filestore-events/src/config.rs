//! Event bus configuration.
//!
//! Selects the transport and carries broker connection parameters. Values are
//! loaded from environment variables with defaults suitable for local
//! development.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Missing required setting.
    #[error("Missing required setting: {0}")]
    Missing(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

/// Deployment mode, deciding which transport backs the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Single process; events are dispatched in-process.
    #[default]
    Monolith,
    /// Several processes; events travel through the broker.
    Microservices,
}

impl DeploymentMode {
    /// Configuration string for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Monolith => "monolith",
            DeploymentMode::Microservices => "microservices",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "monolith" => Ok(DeploymentMode::Monolith),
            "microservices" => Ok(DeploymentMode::Microservices),
            other => Err(ConfigError::InvalidValue {
                key: "DEPLOYMENT_MODE".to_string(),
                message: format!("expected `monolith` or `microservices`, got `{}`", other),
            }),
        }
    }
}

/// SASL credential pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// SASL username.
    pub username: String,
    /// SASL password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Broker connection parameters (microservices mode only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bootstrap addresses (`host:port`).
    pub brokers: Vec<String>,

    /// Client identifier, also used as the envelope source tag.
    pub client_id: String,

    /// Credentials; when present the connection is authenticated and encrypted.
    pub credentials: Option<Credentials>,

    /// Explicit replication factor for provisioned topics.
    pub replication_factor: Option<i16>,

    /// Timeout for broker requests in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: default_client_id(),
            credentials: None,
            replication_factor: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl BrokerConfig {
    /// Replication factor for new topics.
    ///
    /// Managed brokers (credentials present) get 3, self-hosted ones get 1,
    /// unless explicitly overridden.
    pub fn replication_factor(&self) -> i16 {
        self.replication_factor
            .unwrap_or(if self.credentials.is_some() { 3 } else { 1 })
    }

    /// Comma-separated bootstrap list.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBusConfig {
    /// Transport selector.
    pub mode: DeploymentMode,

    /// Broker connection parameters.
    pub broker: BrokerConfig,

    /// Role of this process, used to derive consumer group ids.
    pub service_role: String,

    /// How long a consumer waits for records before checking for shutdown.
    pub poll_timeout: Duration,

    /// Backoff for (re)connecting to the broker.
    pub connect_retry: RetryConfig,

    /// Backoff between redeliveries of a record whose handler failed.
    pub redelivery_backoff: RetryConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Monolith,
            broker: BrokerConfig::default(),
            service_role: "api".to_string(),
            poll_timeout: Duration::from_millis(500),
            connect_retry: RetryConfig::default(),
            redelivery_backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
                exponential_base: 2.0,
            },
        }
    }
}

impl EventBusConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DEPLOYMENT_MODE`: `monolith` (default) or `microservices`
    /// - `KAFKA_BROKERS`: Comma-separated broker list (default: localhost:9092)
    /// - `KAFKA_CLIENT_ID`: Client identifier (default: host name)
    /// - `KAFKA_USERNAME` / `KAFKA_PASSWORD`: SASL credentials
    /// - `KAFKA_REPLICATION_FACTOR`: Replication factor override
    /// - `SERVICE_ROLE`: Consumer role name (default: api)
    /// - `EVENT_BUS_POLL_TIMEOUT_MS`: Consumer poll timeout (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        let mode = match lookup("DEPLOYMENT_MODE") {
            Some(value) => value.parse()?,
            None => default.mode,
        };

        let brokers = lookup("KAFKA_BROKERS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or(default.broker.brokers);

        let credentials = match (lookup("KAFKA_USERNAME"), lookup("KAFKA_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "KAFKA_USERNAME".to_string(),
                    message: "username and password must be set together".to_string(),
                })
            }
        };

        let replication_factor = lookup("KAFKA_REPLICATION_FACTOR")
            .map(|value| {
                value
                    .parse::<i16>()
                    .ok()
                    .filter(|rf| *rf > 0)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key: "KAFKA_REPLICATION_FACTOR".to_string(),
                        message: format!("expected a positive integer, got `{}`", value),
                    })
            })
            .transpose()?;

        let poll_timeout = lookup("EVENT_BUS_POLL_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default.poll_timeout);

        Ok(Self {
            mode,
            broker: BrokerConfig {
                brokers,
                client_id: lookup("KAFKA_CLIENT_ID").unwrap_or(default.broker.client_id),
                credentials,
                replication_factor,
                request_timeout_ms: default.broker.request_timeout_ms,
            },
            service_role: lookup("SERVICE_ROLE").unwrap_or(default.service_role),
            poll_timeout,
            connect_retry: default.connect_retry,
            redelivery_backoff: default.redelivery_backoff,
        })
    }

    /// Set the deployment mode.
    pub fn with_mode(mut self, mode: DeploymentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the service role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.service_role = role.into();
        self
    }

    /// Validate settings required by the selected mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == DeploymentMode::Monolith {
            return Ok(());
        }
        if self.broker.brokers.is_empty() {
            return Err(ConfigError::Missing("KAFKA_BROKERS".to_string()));
        }
        if self.service_role.trim().is_empty() {
            return Err(ConfigError::Missing("SERVICE_ROLE".to_string()));
        }
        if self.broker.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("KAFKA_CLIENT_ID".to_string()));
        }
        Ok(())
    }
}

fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "filestore".to_string())
}
