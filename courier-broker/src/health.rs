//! End-to-end broker check: connect, list, declare a throwaway unit, send a
//! probe through it, read it back and clean up.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use courier_models::{AddressableUnit, ExchangeKind, Message, QueueBinding, TopicSpec};
use log::{info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::consumer::Consumer;
use crate::errors::BrokerError;
use crate::producer::{Producer, ProducerSettings};
use crate::topology::TopologyService;
use crate::types::ConsumerOptions;
use crate::BrokerAdapter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStep {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub steps: Vec<HealthStep>,
    /// Connection coordinates and server details gathered on the way.
    pub details: BTreeMap<String, String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|step| step.ok)
    }

    fn pass(&mut self, name: &'static str, detail: impl Into<String>) {
        let detail = detail.into();
        info!("{}: {}", name, detail);
        self.steps.push(HealthStep {
            name,
            ok: true,
            detail,
        });
    }

    fn fail(&mut self, name: &'static str, detail: impl Into<String>) {
        let detail = detail.into();
        warn!("{} failed: {}", name, detail);
        self.steps.push(HealthStep {
            name,
            ok: false,
            detail,
        });
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            let mark = if step.ok { "ok" } else { "FAILED" };
            writeln!(f, "[{mark:>6}] {}: {}", step.name, step.detail)?;
        }
        Ok(())
    }
}

/// Shape of the throwaway unit a check declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Topic,
    Queue,
}

impl ProbeKind {
    /// A uniquely named unit so concurrent checks never collide.
    pub fn unit(&self) -> AddressableUnit {
        let suffix = Uuid::new_v4().simple().to_string();
        let suffix = &suffix[..8];
        match self {
            ProbeKind::Topic => TopicSpec::new(format!("courier_health_check_{suffix}"))
                .partitions(1)
                .into(),
            ProbeKind::Queue => QueueBinding::new(
                format!("courier_health_check_exchange_{suffix}"),
                format!("courier_health_check_{suffix}"),
                "health_check",
                ExchangeKind::Direct,
            )
            .into(),
        }
    }
}

/// Runs the check with a fresh adapter per service, as production code
/// would. Later steps are skipped after the first failure but a declared
/// probe unit is always removed again.
pub async fn run_health_check<F>(
    make_adapter: F,
    probe: ProbeKind,
    timeout: Duration,
) -> HealthReport
where
    F: Fn() -> Result<Box<dyn BrokerAdapter>, BrokerError>,
{
    let mut report = HealthReport::default();
    if let Err(err) = probe_broker(&make_adapter, probe, timeout, &mut report).await {
        report.fail("setup", err.to_string());
    }
    report
}

async fn probe_broker<F>(
    make_adapter: &F,
    probe: ProbeKind,
    timeout: Duration,
    report: &mut HealthReport,
) -> Result<(), BrokerError>
where
    F: Fn() -> Result<Box<dyn BrokerAdapter>, BrokerError>,
{
    let settings = ProducerSettings {
        ack_timeout: timeout,
        strategy: None,
    };
    let producer = Producer::with_settings(make_adapter()?, settings);
    let connection = producer.test_connection().await;
    report.details.extend(connection.details.clone());
    if !connection.is_success() {
        report.fail("connect", connection.message);
        return Ok(());
    }
    report.pass("connect", connection.message);

    let topology = TopologyService::from_boxed(make_adapter()?).with_timeout(timeout);
    match topology.list_units().await {
        Ok(units) => report.pass("list units", format!("{} units visible", units.len())),
        Err(err) => {
            report.fail("list units", err.to_string());
            return Ok(());
        }
    }

    let unit = probe.unit();
    if let Err(err) = topology.declare_unit(&unit).await {
        report.fail("declare test unit", err.to_string());
        return Ok(());
    }
    report.pass("declare test unit", unit.to_string());

    let exchanged = exchange_probe(make_adapter, &producer, &unit, timeout, report).await;

    match topology.delete_unit(&unit).await {
        Ok(()) => report.pass("cleanup", format!("removed {}", unit.name())),
        Err(err) => report.fail("cleanup", err.to_string()),
    }
    producer.close().await;
    topology.close().await;
    exchanged
}

async fn exchange_probe<F>(
    make_adapter: &F,
    producer: &Producer,
    unit: &AddressableUnit,
    timeout: Duration,
    report: &mut HealthReport,
) -> Result<(), BrokerError>
where
    F: Fn() -> Result<Box<dyn BrokerAdapter>, BrokerError>,
{
    let probe = Message::from_serializable(&json!({
        "check": "health",
        "unit": unit.name(),
    }))
    .map_err(|err| BrokerError::Internal(err.to_string()))?;
    let probe_id = probe.id().to_string();

    let outcome = producer.publish(unit, probe).await;
    if !outcome.success {
        report.fail("publish", outcome.error.unwrap_or_default());
        return Ok(());
    }
    match outcome.broker_metadata {
        Some(metadata) => report.pass("publish", format!("{probe_id} [{metadata}]")),
        None => report.pass("publish", probe_id.clone()),
    }

    let consumer = Consumer::with_options(
        make_adapter()?,
        vec![unit.clone()],
        format!("courier-health-{}", Uuid::new_v4().simple()),
        ConsumerOptions::default(),
    );
    match consumer.fetch_batch(1, timeout).await {
        Ok(fetched) => match fetched.into_iter().next() {
            Some(Ok(received)) if received.message.id() == probe_id => {
                report.pass("consume", "probe received and verified");
            }
            Some(Ok(received)) => report.fail(
                "consume",
                format!("expected {probe_id}, got {}", received.message.id()),
            ),
            Some(Err(malformed)) => report.fail("consume", malformed.error),
            None => report.fail("consume", format!("nothing arrived within {timeout:?}")),
        },
        Err(err) => report.fail("consume", err.to_string()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::{InMemoryLogBroker, InMemoryQueueBroker};

    #[tokio::test]
    async fn healthy_log_broker_passes_every_step() {
        let broker = InMemoryLogBroker::new();
        let report = run_health_check(
            || Ok(Box::new(broker.adapter()) as Box<dyn BrokerAdapter>),
            ProbeKind::Topic,
            Duration::from_secs(1),
        )
        .await;

        assert!(report.is_healthy(), "{report}");
        let names: Vec<_> = report.steps.iter().map(|step| step.name).collect();
        assert_eq!(
            names,
            [
                "connect",
                "list units",
                "declare test unit",
                "publish",
                "consume",
                "cleanup"
            ]
        );
    }

    #[tokio::test]
    async fn healthy_queue_broker_cleans_up() {
        let broker = InMemoryQueueBroker::new();
        let report = run_health_check(
            || Ok(Box::new(broker.adapter()) as Box<dyn BrokerAdapter>),
            ProbeKind::Queue,
            Duration::from_secs(1),
        )
        .await;
        assert!(report.is_healthy(), "{report}");

        let adapter = broker.adapter();
        adapter.connect().await.unwrap();
        assert!(adapter.list_units().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_broker_stops_after_connect() {
        let broker = InMemoryQueueBroker::new();
        broker.set_reachable(false);
        let report = run_health_check(
            || Ok(Box::new(broker.adapter()) as Box<dyn BrokerAdapter>),
            ProbeKind::Queue,
            Duration::from_secs(1),
        )
        .await;
        assert!(!report.is_healthy());
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].name, "connect");
    }

    #[test]
    fn probe_units_are_unique() {
        assert_ne!(ProbeKind::Topic.unit(), ProbeKind::Topic.unit());
        assert!(ProbeKind::Queue
            .unit()
            .name()
            .starts_with("courier_health_check_"));
    }
}
