//! Networked broker adapters.
//!
//! Each client library sits behind a cargo feature so consumers only link
//! the broker they talk to.

#[cfg(feature = "kafka")]
mod kafka;
#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "kafka")]
pub use kafka::KafkaAdapter;
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqAdapter;

use courier_config::BrokerConfig;
use log::info;

use crate::errors::BrokerError;
use crate::BrokerAdapter;

/// A fresh adapter for `config`. Call once per service: every adapter holds
/// its own connection.
pub fn build_adapter(config: &BrokerConfig) -> Result<Box<dyn BrokerAdapter>, BrokerError> {
    config.validate()?;
    match config {
        #[cfg(feature = "kafka")]
        BrokerConfig::Kafka(kafka) => {
            info!("Using Kafka at {}", kafka.bootstrap_list());
            Ok(Box::new(KafkaAdapter::new(kafka.clone())))
        }
        #[cfg(not(feature = "kafka"))]
        BrokerConfig::Kafka(kafka) => {
            info!(
                "Kafka at {} requested but support is not compiled in",
                kafka.bootstrap_list()
            );
            Err(BrokerError::NotImplemented(
                "kafka adapter (build with the `kafka` feature)",
            ))
        }
        #[cfg(feature = "rabbitmq")]
        BrokerConfig::RabbitMq(rabbit) => {
            info!("Using RabbitMQ at {}", rabbit.endpoint());
            Ok(Box::new(RabbitMqAdapter::new(rabbit.clone())))
        }
        #[cfg(not(feature = "rabbitmq"))]
        BrokerConfig::RabbitMq(rabbit) => {
            info!(
                "RabbitMQ at {} requested but support is not compiled in",
                rabbit.endpoint()
            );
            Err(BrokerError::NotImplemented(
                "rabbitmq adapter (build with the `rabbitmq` feature)",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_config::KafkaConfig;

    #[test]
    fn invalid_config_is_rejected_before_building() {
        let config = BrokerConfig::Kafka(KafkaConfig {
            bootstrap_servers: Vec::new(),
            ..KafkaConfig::default()
        });
        let err = build_adapter(&config).err().unwrap();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[cfg(not(feature = "rabbitmq"))]
    #[test]
    fn missing_feature_reports_not_implemented() {
        let config = BrokerConfig::RabbitMq(Default::default());
        let err = build_adapter(&config).err().unwrap();
        assert!(matches!(err, BrokerError::NotImplemented(_)));
    }
}
