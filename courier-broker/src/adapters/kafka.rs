use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_config::KafkaConfig;
use courier_models::{AckDecision, AddressableUnit, BrokerMetadata, TopicSpec};
use log::{debug, warn};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::{Message as _, Offset, TopicPartitionList};
use tokio::time::Instant;

use crate::connection::{ConnectionManager, ConnectionStrategy, Dialer};
use crate::errors::{BrokerError, ConnectionError, TopologyError, TopologyStep};
use crate::types::{ConsumerOptions, PublishMetadata, RawMessage};
use crate::{BrokerAdapter, Subscription};

const MESSAGE_ID_HEADER: &str = "message_id";
const PRIORITY_HEADER: &str = "priority";

/// Settings shared by every client this adapter creates.
fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_list())
        .set("client.id", &config.client_id)
        .set("security.protocol", config.security.protocol_name())
        .set(
            "socket.connection.setup.timeout.ms",
            config.connect_timeout().as_millis().to_string(),
        );

    if config.security.uses_sasl() {
        if let Some(sasl) = &config.sasl {
            client
                .set("sasl.mechanism", &sasl.mechanism)
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }
    }
    if config.security.uses_tls() {
        if let Some(ca_location) = &config.ca_location {
            client.set("ssl.ca.location", ca_location);
        }
        if !config.verify_certificates {
            client.set("enable.ssl.certificate.verification", "false");
        }
    }
    client
}

/// Producer tuned for durable, ordered delivery: every in-sync replica must
/// confirm and only one request is in flight so retries cannot reorder.
fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("acks", "all")
        .set("retries", "3")
        .set("max.in.flight.requests.per.connection", "1")
        .set(
            "message.timeout.ms",
            config.ack_timeout().as_millis().to_string(),
        );
    client
}

fn consumer_config(config: &KafkaConfig, group: &str, auto_commit: bool) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("group.id", group)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", if auto_commit { "true" } else { "false" });
    client
}

fn classify(endpoint: &str, err: KafkaError) -> ConnectionError {
    let endpoint = endpoint.to_string();
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::Authentication)
        | Some(RDKafkaErrorCode::SaslAuthenticationFailed) => {
            ConnectionError::AuthenticationRejected {
                endpoint,
                cause: Box::new(err),
            }
        }
        Some(RDKafkaErrorCode::SSL) => ConnectionError::Negotiation {
            endpoint,
            cause: Box::new(err),
        },
        _ => ConnectionError::unreachable(endpoint, err),
    }
}

/// Errors raised while consuming. Losing every broker ends a consume loop;
/// anything else is retried.
fn consume_error(err: KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::AllBrokersDown) => BrokerError::BrokerUnavailable(err.to_string()),
        _ => BrokerError::Consume(err.to_string()),
    }
}

fn to_raw(message: &BorrowedMessage<'_>) -> RawMessage {
    let mut message_id = None;
    let mut priority = None;
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let Some(value) = header.value else { continue };
            let value = String::from_utf8_lossy(value);
            match header.key {
                MESSAGE_ID_HEADER => message_id = Some(value.into_owned()),
                PRIORITY_HEADER => priority = value.parse().ok(),
                _ => {}
            }
        }
    }

    RawMessage {
        source: message.topic().to_string(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        message_id,
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        priority,
        metadata: BrokerMetadata::Log {
            partition: message.partition(),
            offset: message.offset(),
        },
    }
}

pub(crate) struct KafkaLink {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    open: AtomicBool,
}

struct KafkaDialer {
    config: KafkaConfig,
}

impl KafkaDialer {
    async fn fetch_metadata(
        producer: &FutureProducer,
        timeout: Duration,
    ) -> Result<Metadata, KafkaError> {
        let producer = producer.clone();
        match tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(None, timeout)
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(KafkaError::MetadataFetch(RDKafkaErrorCode::Fail)),
        }
    }
}

#[async_trait]
impl Dialer for KafkaDialer {
    type Connection = KafkaLink;

    fn endpoint(&self) -> String {
        self.config.bootstrap_list()
    }

    async fn dial(&self) -> Result<KafkaLink, ConnectionError> {
        let endpoint = self.endpoint();
        let producer: FutureProducer = producer_config(&self.config)
            .create()
            .map_err(|err| classify(&endpoint, err))?;
        let admin: AdminClient<DefaultClientContext> = base_config(&self.config)
            .create()
            .map_err(|err| classify(&endpoint, err))?;

        // client creation is lazy; a metadata round trip proves the cluster answers
        Self::fetch_metadata(&producer, self.config.connect_timeout())
            .await
            .map_err(|err| classify(&endpoint, err))?;

        Ok(KafkaLink {
            producer,
            admin,
            open: AtomicBool::new(true),
        })
    }

    fn is_alive(&self, connection: &KafkaLink) -> bool {
        connection.open.load(Ordering::SeqCst)
    }

    async fn hang_up(&self, connection: Arc<KafkaLink>) {
        connection.open.store(false, Ordering::SeqCst);
        let producer = connection.producer.clone();
        let timeout = self.config.ack_timeout();
        match tokio::task::spawn_blocking(move || producer.flush(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Flushing Kafka producer on close failed: {}", err),
            Err(err) => warn!("Flushing Kafka producer on close failed: {}", err),
        }
    }
}

/// Log-broker adapter over librdkafka.
pub struct KafkaAdapter {
    config: KafkaConfig,
    connections: ConnectionManager<KafkaDialer>,
    strategy: ConnectionStrategy,
}

impl KafkaAdapter {
    pub fn new(config: KafkaConfig) -> Self {
        let connect_timeout = config.connect_timeout();
        Self {
            connections: ConnectionManager::new(
                KafkaDialer {
                    config: config.clone(),
                },
                connect_timeout,
            ),
            config,
            strategy: ConnectionStrategy::Persistent,
        }
    }

    pub fn with_strategy(mut self, strategy: ConnectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn link(&self) -> Result<Arc<KafkaLink>, BrokerError> {
        match self.connections.current() {
            Some(link) if link.open.load(Ordering::SeqCst) => Ok(link),
            _ => Err(ConnectionError::unreachable(
                self.config.bootstrap_list(),
                "not connected",
            )
            .into()),
        }
    }

    fn topic<'a>(&self, unit: &'a AddressableUnit) -> Result<&'a TopicSpec, BrokerError> {
        match unit {
            AddressableUnit::Topic(spec) => Ok(spec),
            other => Err(BrokerError::UnsupportedUnit {
                unit: other.to_string(),
                broker: self.kind(),
            }),
        }
    }

    fn topic_names<'a>(&self, units: &'a [AddressableUnit]) -> Result<Vec<&'a str>, BrokerError> {
        units
            .iter()
            .map(|unit| self.topic(unit).map(|spec| spec.name.as_str()))
            .collect()
    }

    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new()
            .request_timeout(Some(self.config.ack_timeout()))
            .operation_timeout(Some(self.config.ack_timeout()))
    }

    fn stream_consumer(
        &self,
        units: &[AddressableUnit],
        group: &str,
        auto_commit: bool,
    ) -> Result<StreamConsumer, BrokerError> {
        let topics = self.topic_names(units)?;
        let consumer: StreamConsumer = consumer_config(&self.config, group, auto_commit)
            .create()
            .map_err(|err| BrokerError::from(classify(&self.config.bootstrap_list(), err)))?;
        consumer
            .subscribe(&topics)
            .map_err(|err| BrokerError::Consume(err.to_string()))?;
        Ok(consumer)
    }
}

#[async_trait]
impl BrokerAdapter for KafkaAdapter {
    fn kind(&self) -> &'static str {
        "kafka"
    }

    fn describe(&self) -> BTreeMap<String, String> {
        let mut details = BTreeMap::from([
            ("bootstrap_servers".to_string(), self.config.bootstrap_list()),
            (
                "security_protocol".to_string(),
                self.config.security.protocol_name().to_string(),
            ),
            ("client_id".to_string(), self.config.client_id.clone()),
        ]);
        if let Some(sasl) = &self.config.sasl {
            details.insert("sasl_mechanism".to_string(), sasl.mechanism.clone());
        }
        details
    }

    fn connection_strategy(&self) -> ConnectionStrategy {
        self.strategy
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        self.connections.connect().await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.connections.is_connected()
    }

    async fn close(&self) {
        self.connections.close().await;
    }

    async fn declare_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError> {
        let spec = self.topic(unit)?;
        let link = self.link()?;

        let partitions = spec.partitions.unwrap_or(self.config.default_partitions);
        let replication = spec
            .replication_factor
            .unwrap_or(self.config.default_replication_factor);
        let new_topic = NewTopic::new(
            &spec.name,
            partitions,
            TopicReplication::Fixed(replication),
        );

        let results = link
            .admin
            .create_topics(&[new_topic], &self.admin_options())
            .await
            .map_err(|err| TopologyError::new(TopologyStep::CreateTopic, &spec.name, err))?;
        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic {} already exists", spec.name);
                }
                Err((name, code)) => {
                    return Err(TopologyError::new(
                        TopologyStep::CreateTopic,
                        name,
                        KafkaError::AdminOp(code),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Topic names as reported by cluster metadata, internal topics excluded.
    async fn list_units(&self) -> Result<Vec<String>, BrokerError> {
        let link = self.link()?;
        let metadata = KafkaDialer::fetch_metadata(&link.producer, self.config.ack_timeout())
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))?;
        let mut names: Vec<String> = metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .filter(|name| !name.starts_with("__"))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError> {
        let spec = self.topic(unit)?;
        let link = self.link()?;

        let results = link
            .admin
            .delete_topics(&[spec.name.as_str()], &self.admin_options())
            .await
            .map_err(|err| TopologyError::new(TopologyStep::DeleteTopic, &spec.name, err))?;
        for result in results {
            if let Err((name, code)) = result {
                return Err(
                    TopologyError::new(TopologyStep::DeleteTopic, name, KafkaError::AdminOp(code))
                        .into(),
                );
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        unit: &AddressableUnit,
        payload: &[u8],
        metadata: &PublishMetadata,
    ) -> Result<BrokerMetadata, BrokerError> {
        let spec = self.topic(unit)?;
        let link = self.link()?;

        let priority = metadata.priority.map(|priority| priority.to_string());
        let mut headers = OwnedHeaders::new().insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(metadata.message_id.as_str()),
        });
        if let Some(priority) = &priority {
            headers = headers.insert(Header {
                key: PRIORITY_HEADER,
                value: Some(priority.as_str()),
            });
        }

        let mut record = FutureRecord::<str, [u8]>::to(&spec.name)
            .payload(payload)
            .headers(headers)
            .timestamp(metadata.timestamp.timestamp_millis());
        if let Some(key) = metadata.key.as_deref() {
            record = record.key(key);
        }

        let ack_timeout = self.config.ack_timeout();
        match link.producer.send(record, Timeout::After(ack_timeout)).await {
            Ok((partition, offset)) => Ok(BrokerMetadata::Log { partition, offset }),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)) => {
                Err(BrokerError::DeliveryTimeout(ack_timeout))
            }
            Err((err, _)) => Err(BrokerError::Publish(err.to_string())),
        }
    }

    /// Reads on a short-lived consumer in `group` and commits what it read
    /// before returning.
    async fn poll(
        &self,
        units: &[AddressableUnit],
        group: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        self.link()?;
        let consumer = self.stream_consumer(units, group, false)?;
        let deadline = Instant::now() + timeout;

        let mut taken = Vec::new();
        while taken.len() < max_messages {
            match tokio::time::timeout_at(deadline, consumer.recv()).await {
                Ok(Ok(message)) => taken.push(to_raw(&message)),
                Ok(Err(err)) => {
                    warn!("Kafka poll error: {}", err);
                    if let BrokerError::BrokerUnavailable(reason) = consume_error(err) {
                        return Err(BrokerError::BrokerUnavailable(reason));
                    }
                }
                Err(_) => break,
            }
        }

        if !taken.is_empty() {
            consumer
                .commit_consumer_state(CommitMode::Sync)
                .map_err(|err| BrokerError::Consume(err.to_string()))?;
        }
        consumer.unsubscribe();
        Ok(taken)
    }

    async fn subscribe(
        &self,
        units: &[AddressableUnit],
        group: &str,
        options: &ConsumerOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        self.link()?;
        let consumer = self.stream_consumer(units, group, options.auto_ack)?;
        Ok(Box::new(KafkaSubscription {
            consumer,
            seek_timeout: self.config.ack_timeout(),
        }))
    }

    async fn server_info(&self) -> Result<BTreeMap<String, String>, BrokerError> {
        let link = self.link()?;
        let metadata = KafkaDialer::fetch_metadata(&link.producer, self.config.ack_timeout())
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))?;
        let brokers = metadata
            .brokers()
            .iter()
            .map(|broker| format!("{}@{}:{}", broker.id(), broker.host(), broker.port()))
            .collect::<Vec<_>>()
            .join(",");
        Ok(BTreeMap::from([
            ("brokers".to_string(), brokers),
            (
                "origin_broker".to_string(),
                metadata.orig_broker_name().to_string(),
            ),
            ("topics".to_string(), metadata.topics().len().to_string()),
        ]))
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
    seek_timeout: Duration,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self, timeout: Duration) -> Result<Option<RawMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Some(to_raw(&message))),
            Ok(Err(err)) => Err(consume_error(err)),
            Err(_) => Ok(None),
        }
    }

    /// Ack and reject both move the committed offset past the message; a
    /// requeue seeks back so the same offset is read again.
    async fn settle(
        &mut self,
        message: &RawMessage,
        decision: AckDecision,
    ) -> Result<(), BrokerError> {
        let BrokerMetadata::Log { partition, offset } = message.metadata else {
            return Err(BrokerError::UnknownDelivery(message.metadata.to_string()));
        };

        match decision {
            AckDecision::Ack | AckDecision::Reject => {
                let mut offsets = TopicPartitionList::new();
                offsets
                    .add_partition_offset(&message.source, partition, Offset::Offset(offset + 1))
                    .map_err(|err| BrokerError::Consume(err.to_string()))?;
                self.consumer
                    .commit(&offsets, CommitMode::Async)
                    .map_err(consume_error)
            }
            AckDecision::Requeue => self
                .consumer
                .seek(
                    &message.source,
                    partition,
                    Offset::Offset(offset),
                    self.seek_timeout,
                )
                .map_err(consume_error),
        }
    }
}

impl Drop for KafkaSubscription {
    fn drop(&mut self) {
        self.consumer.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_config::{SaslCredentials, SecurityMode};

    #[test]
    fn producer_waits_for_all_replicas_in_order() {
        let client = producer_config(&KafkaConfig::default());
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("retries"), Some("3"));
        assert_eq!(
            client.get("max.in.flight.requests.per.connection"),
            Some("1")
        );
        assert_eq!(client.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client.get("security.protocol"), Some("PLAINTEXT"));
    }

    #[test]
    fn sasl_ssl_settings_are_applied() {
        let config = KafkaConfig {
            bootstrap_servers: vec!["a:9093".into(), " b:9093 ".into()],
            security: SecurityMode::SaslSsl,
            sasl: Some(SaslCredentials {
                mechanism: "SCRAM-SHA-512".into(),
                username: "svc".into(),
                password: "secret".into(),
            }),
            ca_location: Some("/etc/ssl/ca.pem".into()),
            verify_certificates: false,
            ..KafkaConfig::default()
        };
        let client = base_config(&config);
        assert_eq!(client.get("bootstrap.servers"), Some("a:9093,b:9093"));
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(client.get("sasl.username"), Some("svc"));
        assert_eq!(client.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
        assert_eq!(
            client.get("enable.ssl.certificate.verification"),
            Some("false")
        );
    }

    #[test]
    fn consumer_commits_manually_from_earliest() {
        let client = consumer_config(&KafkaConfig::default(), "billing", false);
        assert_eq!(client.get("group.id"), Some("billing"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn authentication_failures_are_classified() {
        let err = classify(
            "broker:9092",
            KafkaError::MetadataFetch(RDKafkaErrorCode::SaslAuthenticationFailed),
        );
        assert!(matches!(err, ConnectionError::AuthenticationRejected { .. }));

        let err = classify("broker:9092", KafkaError::MetadataFetch(RDKafkaErrorCode::SSL));
        assert!(matches!(err, ConnectionError::Negotiation { .. }));

        let err = classify(
            "broker:9092",
            KafkaError::MetadataFetch(RDKafkaErrorCode::BrokerTransportFailure),
        );
        assert!(matches!(err, ConnectionError::Unreachable { .. }));
        assert_eq!(err.endpoint(), "broker:9092");
    }

    #[test]
    fn losing_all_brokers_is_fatal_for_consumers() {
        let err = consume_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown,
        ));
        assert!(err.is_fatal());
        let err = consume_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        assert!(!err.is_fatal());
    }
}
