use std::time::Duration;

use courier_models::{AckDecision, AddressableUnit, MalformedMessage, ReceivedMessage};
use log::{error, info, warn};

use crate::errors::BrokerError;
use crate::stop::StopSignal;
use crate::types::{ConsumerOptions, RawMessage};
use crate::{codec, BrokerAdapter, Subscription};

/// One entry of a fetched batch. Undecodable payloads come back as `Err`.
pub type Fetched = Result<ReceivedMessage, MalformedMessage>;

const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Tally of a finished consume loop.
#[derive(Debug, Clone, Default)]
pub struct ConsumeSummary {
    pub handled: usize,
    pub acked: usize,
    pub requeued: usize,
    pub rejected: usize,
    pub malformed: Vec<MalformedMessage>,
}

impl ConsumeSummary {
    fn count(&mut self, decision: AckDecision) {
        self.handled += 1;
        match decision {
            AckDecision::Ack => self.acked += 1,
            AckDecision::Requeue => self.requeued += 1,
            AckDecision::Reject => self.rejected += 1,
        }
    }
}

/// Reads from one or more units on behalf of a consumer group (log broker)
/// or a queue consumer (queue broker).
pub struct Consumer {
    adapter: Box<dyn BrokerAdapter>,
    units: Vec<AddressableUnit>,
    group: String,
    options: ConsumerOptions,
}

impl Consumer {
    pub fn new<A>(adapter: A, units: Vec<AddressableUnit>, group: impl Into<String>) -> Self
    where
        A: BrokerAdapter,
    {
        Self::with_options(
            Box::new(adapter),
            units,
            group,
            ConsumerOptions::default(),
        )
    }

    pub fn with_options(
        adapter: Box<dyn BrokerAdapter>,
        units: Vec<AddressableUnit>,
        group: impl Into<String>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            adapter,
            units,
            group: group.into(),
            options,
        }
    }

    pub fn units(&self) -> &[AddressableUnit] {
        &self.units
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Deliver messages to `handler` until `stop` fires, the configured
    /// message limit is reached, or the connection fails. A stop request
    /// interrupts a pending wait for the next delivery. The connection is
    /// closed on every exit path.
    ///
    /// Malformed payloads never reach the handler. They are rejected, logged
    /// and listed in the returned summary.
    pub async fn consume_loop<H>(
        &self,
        mut handler: H,
        stop: &StopSignal,
    ) -> Result<ConsumeSummary, BrokerError>
    where
        H: FnMut(&ReceivedMessage) -> AckDecision + Send,
    {
        let result = self.run_loop(&mut handler, stop).await;
        self.adapter.close().await;
        match &result {
            Ok(summary) => info!(
                "Consumed {} messages from {} ({} malformed)",
                summary.handled,
                self.unit_names(),
                summary.malformed.len()
            ),
            Err(err) => error!("Consume loop on {} stopped: {}", self.unit_names(), err),
        }
        result
    }

    async fn run_loop<H>(
        &self,
        handler: &mut H,
        stop: &StopSignal,
    ) -> Result<ConsumeSummary, BrokerError>
    where
        H: FnMut(&ReceivedMessage) -> AckDecision + Send,
    {
        self.adapter.connect().await?;
        let mut subscription = self
            .adapter
            .subscribe(&self.units, &self.group, &self.options)
            .await?;
        info!(
            "Starting to consume from {} as '{}'",
            self.unit_names(),
            self.group
        );

        let mut summary = ConsumeSummary::default();
        loop {
            if stop.is_stopped() {
                break;
            }
            if let Some(limit) = self.options.max_messages {
                if summary.handled >= limit {
                    break;
                }
            }

            let next = tokio::select! {
                _ = stop.stopped() => break,
                next = subscription.next(self.options.receive_timeout) => next,
            };
            let raw = match next {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("Receive from {} failed: {}", self.unit_names(), err);
                    tokio::time::sleep(RETRY_PAUSE).await;
                    continue;
                }
            };

            match codec::decode(raw.clone()) {
                Ok(received) => {
                    let decision = handler(&received);
                    summary.count(decision);
                    self.settle(subscription.as_mut(), &raw, decision).await?;
                }
                Err(malformed) => {
                    warn!(
                        "Skipping malformed message from {} [{}]: {}",
                        malformed.source, malformed.metadata, malformed.error
                    );
                    self.settle(subscription.as_mut(), &raw, AckDecision::Reject)
                        .await?;
                    summary.malformed.push(malformed);
                }
            }
        }

        Ok(summary)
    }

    async fn settle(
        &self,
        subscription: &mut dyn Subscription,
        raw: &RawMessage,
        decision: AckDecision,
    ) -> Result<(), BrokerError> {
        if self.options.auto_ack {
            return Ok(());
        }
        let timeout = self.options.settle_timeout;
        let settled = match tokio::time::timeout(timeout, subscription.settle(raw, decision)).await
        {
            Ok(settled) => settled,
            Err(_) => Err(BrokerError::BrokerUnavailable(format!(
                "broker did not confirm {:?} of a message from {} within {:?}",
                decision, raw.source, timeout
            ))),
        };
        match settled {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(
                    "Could not settle message from {} [{}] as {:?}: {}",
                    raw.source, raw.metadata, decision, err
                );
                Ok(())
            }
        }
    }

    /// Pull at most `max_messages` within `timeout` on a fresh connection
    /// that is closed before returning.
    pub async fn fetch_batch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Fetched>, BrokerError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let result = self.fetch_raw(max_messages, timeout).await;
        self.adapter.close().await;

        let fetched: Vec<Fetched> = result?.into_iter().map(codec::decode).collect();
        for entry in &fetched {
            if let Err(malformed) = entry {
                warn!(
                    "Fetched malformed message from {} [{}]: {}",
                    malformed.source, malformed.metadata, malformed.error
                );
            }
        }
        Ok(fetched)
    }

    async fn fetch_raw(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        self.adapter.connect().await?;
        self.adapter
            .poll(&self.units, &self.group, max_messages, timeout)
            .await
    }

    fn unit_names(&self) -> String {
        self.units
            .iter()
            .map(|unit| unit.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
