use clap::ValueEnum;
use courier_models::NamingConvention;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one bootstrap server is required")]
    EmptyBootstrapServers,
    #[error("security mode {0} requires SASL credentials")]
    MissingSaslCredentials(&'static str),
    #[error("broker host must not be empty")]
    EmptyHost,
    #[error("timeout '{0}' must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("{field} must be at least 1, got {value}")]
    InvalidTopicDefault { field: &'static str, value: i32 },
}

/// Transport security for a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityMode {
    /// Value of librdkafka's `security.protocol`.
    pub fn protocol_name(&self) -> &'static str {
        match self {
            SecurityMode::Plaintext => "PLAINTEXT",
            SecurityMode::Ssl => "SSL",
            SecurityMode::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityMode::SaslSsl => "SASL_SSL",
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, SecurityMode::Ssl | SecurityMode::SaslSsl)
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(self, SecurityMode::SaslPlaintext | SecurityMode::SaslSsl)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslCredentials {
    #[serde(default = "default_sasl_mechanism")]
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

fn default_sasl_mechanism() -> String {
    "PLAIN".into()
}

/// Coordinates of a log broker cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub bootstrap_servers: Vec<String>,
    pub security: SecurityMode,
    pub sasl: Option<SaslCredentials>,
    pub ca_location: Option<String>,
    /// Turning this off accepts self-signed broker certificates.
    pub verify_certificates: bool,
    pub client_id: String,
    pub connect_timeout_seconds: u64,
    pub ack_timeout_seconds: u64,
    pub default_partitions: i32,
    pub default_replication_factor: i32,
    pub naming: NamingConvention,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".into()],
            security: SecurityMode::Plaintext,
            sasl: None,
            ca_location: None,
            verify_certificates: true,
            client_id: "courier".into(),
            connect_timeout_seconds: 10,
            ack_timeout_seconds: 10,
            default_partitions: 3,
            default_replication_factor: 1,
            naming: NamingConvention::default(),
        }
    }
}

impl KafkaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .bootstrap_servers
            .iter()
            .all(|server| server.trim().is_empty())
        {
            return Err(ConfigError::EmptyBootstrapServers);
        }
        if self.security.uses_sasl() && self.sasl.is_none() {
            return Err(ConfigError::MissingSaslCredentials(self.security.protocol_name()));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_seconds"));
        }
        if self.ack_timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout("ack_timeout_seconds"));
        }
        if self.default_partitions < 1 {
            return Err(ConfigError::InvalidTopicDefault {
                field: "default_partitions",
                value: self.default_partitions,
            });
        }
        if self.default_replication_factor < 1 {
            return Err(ConfigError::InvalidTopicDefault {
                field: "default_replication_factor",
                value: self.default_replication_factor,
            });
        }
        Ok(())
    }

    pub fn bootstrap_list(&self) -> String {
        self.bootstrap_servers
            .iter()
            .map(|server| server.trim())
            .filter(|server| !server.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_seconds)
    }
}

/// Coordinates of a queue broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub security: SecurityMode,
    pub heartbeat_seconds: u16,
    pub connect_timeout_seconds: u64,
    pub ack_timeout_seconds: u64,
    /// Base URL of the management plugin, used to list queues.
    pub management_url: Option<String>,
    pub naming: NamingConvention,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5672,
            username: "guest".into(),
            password: "guest".into(),
            vhost: "/".into(),
            security: SecurityMode::Plaintext,
            heartbeat_seconds: 600,
            connect_timeout_seconds: 10,
            ack_timeout_seconds: 10,
            management_url: None,
            naming: NamingConvention::default(),
        }
    }
}

impl RabbitMqConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.connect_timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_seconds"));
        }
        if self.ack_timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout("ack_timeout_seconds"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Management API base, defaulting to the plugin's standard port.
    pub fn management_base(&self) -> String {
        let scheme = if self.security.uses_tls() { "https" } else { "http" };
        self.management_url
            .clone()
            .unwrap_or_else(|| format!("{scheme}://{}:15672", self.host))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_seconds)
    }
}

/// Broker selection handed to the adapter factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BrokerConfig {
    Kafka(KafkaConfig),
    RabbitMq(RabbitMqConfig),
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            BrokerConfig::Kafka(config) => config.validate(),
            BrokerConfig::RabbitMq(config) => config.validate(),
        }
    }

    pub fn naming(&self) -> &NamingConvention {
        match self {
            BrokerConfig::Kafka(config) => &config.naming,
            BrokerConfig::RabbitMq(config) => &config.naming,
        }
    }
}
