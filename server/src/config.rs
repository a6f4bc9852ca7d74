//! Configuration management for the gateway.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Unparsable numbers fall back to their defaults; [`Config::validate`] then
//! rejects combinations the gateway cannot run with.

use certgate_runtime::{BackoffPolicy, GatewayConfig, Topology};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// RabbitMQ configuration
    pub broker: BrokerConfig,
    /// Request handling configuration
    pub requests: RequestConfig,
    /// HTTP server configuration
    pub server: ServerConfig,
}

/// RabbitMQ configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// AMQP URI
    pub url: String,
    /// Host checked by the startup probe
    pub host: String,
    /// Port checked by the startup probe
    pub port: u16,
    /// Queue requests are published to
    pub request_queue: String,
    /// `x-message-ttl` of the request queue in milliseconds
    pub request_queue_ttl_ms: u32,
    /// Queue replies are consumed from
    pub reply_queue: String,
    /// First reconnection delay in milliseconds
    pub reconnect_base_delay_ms: u64,
    /// Reconnection delay cap in milliseconds
    pub reconnect_max_delay_ms: u64,
    /// Retries before the fatal warning (and counter reset)
    pub reconnect_max_retries: u32,
    /// Bound on opening a session and declaring the topology, in milliseconds
    pub connect_timeout_ms: u64,
}

/// Request handling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// How long a caller waits for a reply, in milliseconds
    pub timeout_ms: u64,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Install the Prometheus recorder and serve `GET /metrics`
    pub metrics_enabled: bool,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// Configuration that cannot be run with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `REQUEST_TIMEOUT` is zero.
    #[error("REQUEST_TIMEOUT must be greater than zero")]
    ZeroTimeout,
    /// `CONNECT_TIMEOUT_MS` is zero.
    #[error("CONNECT_TIMEOUT_MS must be greater than zero")]
    ZeroConnectTimeout,
    /// A queue name is empty.
    #[error("{0} must not be empty")]
    EmptyQueueName(&'static str),
    /// The first backoff delay exceeds the cap.
    #[error("RECONNECT_BASE_DELAY_MS ({base}) exceeds RECONNECT_MAX_DELAY_MS ({cap})")]
    BackoffInverted {
        /// Configured base delay
        base: u64,
        /// Configured cap
        cap: u64,
    },
}

impl Config {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, one call per variable name.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Self {
            broker: BrokerConfig {
                url: text("RABBITMQ_URL", "amqp://rabbitmq"),
                host: text("RABBITMQ_HOST", "rabbitmq"),
                port: parsed(&lookup, "RABBITMQ_PORT", 5672),
                request_queue: text("REQUEST_QUEUE_NAME", "consulta_certificados"),
                request_queue_ttl_ms: parsed(&lookup, "REQUEST_QUEUE_TTL_MS", 1_800_000),
                reply_queue: text("REPLY_QUEUE_NAME", "api_response_queue"),
                reconnect_base_delay_ms: parsed(&lookup, "RECONNECT_BASE_DELAY_MS", 1000),
                reconnect_max_delay_ms: parsed(&lookup, "RECONNECT_MAX_DELAY_MS", 60_000),
                reconnect_max_retries: parsed(&lookup, "RECONNECT_MAX_RETRIES", 20),
                connect_timeout_ms: parsed(&lookup, "CONNECT_TIMEOUT_MS", 10_000),
            },
            requests: RequestConfig {
                timeout_ms: parsed(&lookup, "REQUEST_TIMEOUT", 30_000),
            },
            server: ServerConfig {
                host: text("SERVER_HOST", "0.0.0.0"),
                port: parsed(&lookup, "SERVER_PORT", 5001),
                metrics_enabled: parsed(&lookup, "METRICS_ENABLED", true),
                shutdown_timeout: parsed(&lookup, "SHUTDOWN_TIMEOUT", 10),
            },
        }
    }

    /// Reject configurations the gateway cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.broker.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        if self.broker.request_queue.is_empty() {
            return Err(ConfigError::EmptyQueueName("REQUEST_QUEUE_NAME"));
        }
        if self.broker.reply_queue.is_empty() {
            return Err(ConfigError::EmptyQueueName("REPLY_QUEUE_NAME"));
        }
        if self.broker.reconnect_base_delay_ms > self.broker.reconnect_max_delay_ms {
            return Err(ConfigError::BackoffInverted {
                base: self.broker.reconnect_base_delay_ms,
                cap: self.broker.reconnect_max_delay_ms,
            });
        }
        Ok(())
    }

    /// Reconnection schedule.
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::builder()
            .max_retries(self.broker.reconnect_max_retries)
            .initial_delay(Duration::from_millis(self.broker.reconnect_base_delay_ms))
            .max_delay(Duration::from_millis(self.broker.reconnect_max_delay_ms))
            .build()
    }

    /// Runtime settings for the gateway service.
    #[must_use]
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            topology: Topology {
                request_queue: self.broker.request_queue.clone(),
                request_queue_ttl_ms: self.broker.request_queue_ttl_ms,
                reply_queue: self.broker.reply_queue.clone(),
                ..Topology::default()
            },
            backoff: self.backoff(),
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.requests.timeout_ms),
            shutdown_timeout: Duration::from_secs(self.server.shutdown_timeout),
        }
    }

    /// HTTP listen address.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}
