use clap::Args;

use crate::settings::{ConfigError, KafkaConfig, RabbitMqConfig, SaslCredentials, SecurityMode};

/// Command-line and environment overrides for the log broker.
#[derive(Args, Debug, Clone)]
pub struct KafkaArgs {
    #[arg(
        long = "kafka-bootstrap-servers",
        env = "KAFKA_BOOTSTRAP_SERVERS",
        value_delimiter = ',',
        default_value = "localhost:9092"
    )]
    pub bootstrap_servers: Vec<String>,

    #[arg(
        long = "kafka-security-protocol",
        env = "KAFKA_SECURITY_PROTOCOL",
        value_enum,
        default_value_t = SecurityMode::Plaintext
    )]
    pub security: SecurityMode,

    #[arg(long = "kafka-sasl-mechanism", env = "KAFKA_SASL_MECHANISM", default_value = "PLAIN")]
    pub sasl_mechanism: String,

    #[arg(long = "kafka-sasl-username", env = "KAFKA_SASL_USERNAME")]
    pub sasl_username: Option<String>,

    #[arg(long = "kafka-sasl-password", env = "KAFKA_SASL_PASSWORD", hide_env_values = true)]
    pub sasl_password: Option<String>,

    #[arg(long = "kafka-ca-location", env = "KAFKA_SSL_CA_LOCATION")]
    pub ca_location: Option<String>,

    #[arg(long = "kafka-skip-cert-verification", default_value_t = false)]
    pub skip_cert_verification: bool,
}

impl KafkaArgs {
    pub fn into_config(self, timeout_seconds: u64) -> Result<KafkaConfig, ConfigError> {
        let sasl = match (self.sasl_username, self.sasl_password) {
            (Some(username), Some(password)) => Some(SaslCredentials {
                mechanism: self.sasl_mechanism,
                username,
                password,
            }),
            _ => None,
        };

        let config = KafkaConfig {
            bootstrap_servers: self
                .bootstrap_servers
                .into_iter()
                .filter(|value| !value.trim().is_empty())
                .collect(),
            security: self.security,
            sasl,
            ca_location: self.ca_location,
            verify_certificates: !self.skip_cert_verification,
            connect_timeout_seconds: timeout_seconds,
            ack_timeout_seconds: timeout_seconds,
            ..KafkaConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// Command-line and environment overrides for the queue broker.
#[derive(Args, Debug, Clone)]
pub struct RabbitMqArgs {
    #[arg(long = "rabbitmq-host", env = "RABBITMQ_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long = "rabbitmq-port", env = "RABBITMQ_PORT", default_value_t = 5672)]
    pub port: u16,

    #[arg(long = "rabbitmq-user", env = "RABBITMQ_USER", default_value = "guest")]
    pub username: String,

    #[arg(
        long = "rabbitmq-password",
        env = "RABBITMQ_PASSWORD",
        default_value = "guest",
        hide_env_values = true
    )]
    pub password: String,

    #[arg(long = "rabbitmq-vhost", env = "RABBITMQ_VHOST", default_value = "/")]
    pub vhost: String,

    #[arg(long = "rabbitmq-tls", default_value_t = false)]
    pub tls: bool,

    #[arg(long = "rabbitmq-management-url", env = "RABBITMQ_MANAGEMENT_URL")]
    pub management_url: Option<String>,
}

impl RabbitMqArgs {
    pub fn into_config(self, timeout_seconds: u64) -> Result<RabbitMqConfig, ConfigError> {
        let config = RabbitMqConfig {
            host: self.host,
            port: self.port,
            username: self.username,
            password: self.password,
            vhost: self.vhost,
            security: if self.tls {
                SecurityMode::Ssl
            } else {
                SecurityMode::Plaintext
            },
            connect_timeout_seconds: timeout_seconds,
            ack_timeout_seconds: timeout_seconds,
            management_url: self.management_url,
            ..RabbitMqConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
