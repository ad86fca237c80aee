use std::time::Duration;

use chrono::Utc;
use courier_models::{
    AddressableUnit, BatchReport, BrokerMetadata, ConnectionReport, DeliveryOutcome, Message,
};
use log::{error, info};
use tokio::sync::Mutex;

use crate::connection::ConnectionStrategy;
use crate::errors::BrokerError;
use crate::types::PublishMetadata;
use crate::{codec, BrokerAdapter};

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// How long to wait for the broker to acknowledge one message.
    pub ack_timeout: Duration,
    /// Overrides the adapter's default connection handling.
    pub strategy: Option<ConnectionStrategy>,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            strategy: None,
        }
    }
}

/// Publishes messages through one adapter and one connection.
///
/// Calls are serialized, so messages leave in the order `publish` was
/// called even when the producer is shared between tasks.
///
/// A `timeout` outcome means the broker did not confirm in time. The message
/// may still have been stored, so consumers should deduplicate by id.
pub struct Producer {
    adapter: Box<dyn BrokerAdapter>,
    settings: ProducerSettings,
    send_lock: Mutex<()>,
}

impl Producer {
    pub fn new<A>(adapter: A) -> Self
    where
        A: BrokerAdapter,
    {
        Self::with_settings(Box::new(adapter), ProducerSettings::default())
    }

    pub fn with_settings(adapter: Box<dyn BrokerAdapter>, settings: ProducerSettings) -> Self {
        Self {
            adapter,
            settings,
            send_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    fn strategy(&self) -> ConnectionStrategy {
        self.settings
            .strategy
            .unwrap_or_else(|| self.adapter.connection_strategy())
    }

    pub async fn publish(&self, unit: &AddressableUnit, message: Message) -> DeliveryOutcome {
        let _guard = self.send_lock.lock().await;

        let outcome = match self.adapter.connect().await {
            Ok(()) => self.send(unit, message).await,
            Err(err) => {
                error!("Failed to connect to {} broker: {}", self.adapter.kind(), err);
                DeliveryOutcome::failed(message.id(), err.to_string())
            }
        };

        if self.strategy() == ConnectionStrategy::PerCall {
            self.adapter.close().await;
        }
        outcome
    }

    /// Send every message over one connection. A failed message never stops
    /// the rest of the batch.
    pub async fn publish_batch(
        &self,
        unit: &AddressableUnit,
        messages: Vec<Message>,
    ) -> BatchReport {
        let _guard = self.send_lock.lock().await;
        let mut report = BatchReport::default();

        if let Err(err) = self.adapter.connect().await {
            error!("Batch send to {} failed: {}", unit, err);
            let reason = err.to_string();
            for message in &messages {
                report.record(DeliveryOutcome::failed(message.id(), reason.clone()));
            }
            report.error = Some(reason);
            self.adapter.close().await;
            return report;
        }

        for message in messages {
            report.record(self.send(unit, message).await);
        }

        if self.strategy() == ConnectionStrategy::PerCall {
            self.adapter.close().await;
        }
        info!(
            "Batch to {}: {} sent, {} failed",
            unit, report.success, report.failed
        );
        report
    }

    async fn send(&self, unit: &AddressableUnit, mut message: Message) -> DeliveryOutcome {
        message.stamp(Utc::now());
        let id = message.id().to_string();

        match self.send_stamped(unit, &message).await {
            Ok(metadata) => {
                info!("Message {} sent to {} [{}]", id, unit, metadata);
                DeliveryOutcome::delivered(id, metadata)
            }
            Err(err) => {
                error!("Failed to send message {} to {}: {}", id, unit, err);
                DeliveryOutcome::failed(id, err.outcome_reason())
            }
        }
    }

    async fn send_stamped(
        &self,
        unit: &AddressableUnit,
        message: &Message,
    ) -> Result<BrokerMetadata, BrokerError> {
        let payload = codec::encode(message)?;
        let metadata = PublishMetadata::from_message(message);
        let timeout = self.settings.ack_timeout;
        match tokio::time::timeout(timeout, self.adapter.publish(unit, &payload, &metadata)).await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::DeliveryTimeout(timeout)),
        }
    }

    /// Dial, collect server details and disconnect. Only used for health
    /// reporting.
    pub async fn test_connection(&self) -> ConnectionReport {
        let _guard = self.send_lock.lock().await;
        let mut details = self.adapter.describe();

        let report = match self.adapter.connect().await {
            Ok(()) => match tokio::time::timeout(
                self.settings.ack_timeout,
                self.adapter.server_info(),
            )
            .await
            {
                Ok(Ok(info)) => {
                    details.extend(info);
                    ConnectionReport::success(
                        format!("Successfully connected to {}", self.adapter.kind()),
                        details,
                    )
                }
                Ok(Err(err)) => ConnectionReport::error(
                    format!("Connected but could not read server details: {err}"),
                    details,
                ),
                Err(_) => ConnectionReport::error(
                    "Connected but the server did not answer in time",
                    details,
                ),
            },
            Err(err) => ConnectionReport::error(format!("Connection test failed: {err}"), details),
        };

        self.adapter.close().await;
        report
    }

    pub fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    /// Release a connection kept open by the persistent strategy.
    pub async fn close(&self) {
        let _guard = self.send_lock.lock().await;
        self.adapter.close().await;
    }
}
