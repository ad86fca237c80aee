mod args;
mod settings;

pub use args::{KafkaArgs, RabbitMqArgs};
pub use settings::{
    BrokerConfig, ConfigError, KafkaConfig, RabbitMqConfig, SaslCredentials, SecurityMode,
};
