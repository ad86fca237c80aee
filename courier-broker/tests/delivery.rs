//! Delivery behaviour through the public services, run against both
//! in-process brokers.
//!
//! Covers:
//! - idempotent declaration
//! - body and id surviving a publish/consume round trip
//! - per-key ordering on partitioned topics
//! - malformed payloads being skipped by the consume loop
//! - handler decisions (ack, requeue, reject) reaching the broker
//! - broker refusals surfacing as failed outcomes and topology steps

use std::time::Duration;

use courier_broker::in_memory::{InMemoryLogBroker, InMemoryQueueBroker};
use courier_broker::{
    BrokerAdapter, BrokerError, ConsumerOptions, Consumer, Producer, StopSignal,
    TopologyService, TopologyStep,
};
use courier_models::{
    AckDecision, AddressableUnit, ExchangeKind, Message, MessageBody, QueueBinding, TopicSpec,
};
use serde_json::{json, Value};

fn body(value: Value) -> MessageBody {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

fn limited(max_messages: usize) -> ConsumerOptions {
    ConsumerOptions {
        max_messages: Some(max_messages),
        receive_timeout: Duration::from_millis(100),
        ..ConsumerOptions::default()
    }
}

fn consumer<A: BrokerAdapter>(
    adapter: A,
    unit: &AddressableUnit,
    options: ConsumerOptions,
) -> Consumer {
    Consumer::with_options(Box::new(adapter), vec![unit.clone()], "test-group", options)
}

fn notifications() -> AddressableUnit {
    QueueBinding::new(
        "notif_ex",
        "notif_q",
        "notif.info.medium",
        ExchangeKind::Direct,
    )
    .into()
}

#[tokio::test]
async fn declaring_twice_leaves_one_topic() {
    let broker = InMemoryLogBroker::new();
    let topology = TopologyService::new(broker.adapter());
    let unit: AddressableUnit = TopicSpec::new("events.page_view").partitions(3).into();

    topology.declare_unit(&unit).await.unwrap();
    topology.declare_unit(&unit).await.unwrap();

    let units = topology.list_units().await.unwrap();
    assert_eq!(units, vec!["events.page_view".to_string()]);
}

#[tokio::test]
async fn declaring_twice_leaves_one_queue() {
    let broker = InMemoryQueueBroker::new();
    let topology = TopologyService::new(broker.adapter());
    let unit = notifications();

    topology.declare_unit(&unit).await.unwrap();
    topology.declare_unit(&unit).await.unwrap();

    assert_eq!(topology.list_units().await.unwrap(), vec!["notif_q".to_string()]);
    assert_eq!(broker.exchange_kind("notif_ex"), Some(ExchangeKind::Direct));
}

#[tokio::test]
async fn log_round_trip_keeps_id_and_body() {
    let broker = InMemoryLogBroker::new();
    let unit = AddressableUnit::topic("orders");
    let sent = Message::with_id(
        "order-17",
        body(json!({"total": 12.5, "lines": [{"sku": "A1", "qty": 2}]})),
    );

    let producer = Producer::new(broker.adapter());
    let outcome = producer.publish(&unit, sent.clone()).await;
    assert!(outcome.success, "{outcome:?}");
    producer.close().await;

    let mut seen = Vec::new();
    let summary = consumer(broker.adapter(), &unit, limited(1))
        .consume_loop(
            |received| {
                seen.push(received.message.clone());
                AckDecision::Ack
            },
            &StopSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.acked, 1);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id(), "order-17");
    assert_eq!(seen[0].body, sent.body);
    assert!(seen[0].timestamp().is_some());
    assert_eq!(broker.committed_offset("test-group", "orders", 0), 1);
}

#[tokio::test]
async fn queue_round_trip_keeps_id_and_body() {
    let broker = InMemoryQueueBroker::new();
    let unit = notifications();
    TopologyService::new(broker.adapter())
        .declare_unit(&unit)
        .await
        .unwrap();

    let sent = Message::with_id("n-1", body(json!({"title": "hi", "tags": ["a", "b"]})));
    let outcome = Producer::new(broker.adapter()).publish(&unit, sent.clone()).await;
    assert!(outcome.success, "{outcome:?}");

    let mut seen = Vec::new();
    consumer(broker.adapter(), &unit, limited(1))
        .consume_loop(
            |received| {
                seen.push(received.clone());
                AckDecision::Ack
            },
            &StopSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].message.id(), "n-1");
    assert_eq!(seen[0].message.body, sent.body);
    assert_eq!(seen[0].source, "notif_q");
    assert_eq!(broker.depth("notif_q"), 0);
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn same_key_keeps_send_order_across_partitions() {
    let broker = InMemoryLogBroker::new();
    let unit: AddressableUnit = TopicSpec::new("accounts").partitions(4).into();
    TopologyService::new(broker.adapter())
        .declare_unit(&unit)
        .await
        .unwrap();

    let producer = Producer::new(broker.adapter());
    for step in 0..5 {
        let message = Message::with_id(format!("m{step}"), body(json!({"step": step})))
            .with_key("user-1");
        assert!(producer.publish(&unit, message).await.success);
    }
    let noise = Message::with_id("other", body(json!({"step": 0}))).with_key("user-2");
    assert!(producer.publish(&unit, noise).await.success);
    producer.close().await;

    let fetched = consumer(broker.adapter(), &unit, ConsumerOptions::default())
        .fetch_batch(20, Duration::from_millis(500))
        .await
        .unwrap();

    let ordered: Vec<String> = fetched
        .into_iter()
        .map(|entry| entry.unwrap().message)
        .filter(|message| message.key.as_deref() == Some("user-1"))
        .map(|message| message.id().to_string())
        .collect();
    assert_eq!(ordered, ["m0", "m1", "m2", "m3", "m4"]);
}

#[tokio::test]
async fn consume_loop_skips_malformed_log_record() {
    let broker = InMemoryLogBroker::new();
    let unit = AddressableUnit::topic("events.raw");
    broker.append_raw("events.raw", None, "definitely not json");

    let valid = Message::with_id("good", body(json!({"ok": true})));
    assert!(Producer::new(broker.adapter()).publish(&unit, valid).await.success);

    let mut handled = Vec::new();
    let summary = consumer(broker.adapter(), &unit, limited(1))
        .consume_loop(
            |received| {
                handled.push(received.message.id().to_string());
                AckDecision::Ack
            },
            &StopSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(handled, ["good"]);
    assert_eq!(summary.handled, 1);
    assert_eq!(summary.malformed.len(), 1);
    assert_eq!(summary.malformed[0].source, "events.raw");
    assert_eq!(broker.committed_offset("test-group", "events.raw", 0), 2);
}

#[tokio::test]
async fn consume_loop_skips_malformed_queue_message() {
    let broker = InMemoryQueueBroker::new();
    let unit = notifications();
    TopologyService::new(broker.adapter())
        .declare_unit(&unit)
        .await
        .unwrap();
    assert!(broker.push_raw("notif_q", "[1, 2, 3]"));

    let valid = Message::with_id("good", body(json!({"title": "fine"})));
    assert!(Producer::new(broker.adapter()).publish(&unit, valid).await.success);

    let mut handled = Vec::new();
    let summary = consumer(broker.adapter(), &unit, limited(1))
        .consume_loop(
            |received| {
                handled.push(received.message.id().to_string());
                AckDecision::Ack
            },
            &StopSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(handled, ["good"]);
    assert_eq!(summary.malformed.len(), 1);
    assert!(summary.malformed[0].error.contains("JSON object"));
    assert_eq!(broker.depth("notif_q"), 0);
}

#[tokio::test]
async fn notification_is_fetched_with_priority() {
    let broker = InMemoryQueueBroker::new();
    let unit = notifications();
    TopologyService::new(broker.adapter())
        .declare_unit(&unit)
        .await
        .unwrap();

    let message = Message::with_id("abc", body(json!({"title": "hi"})))
        .with_priority(5)
        .unwrap();
    let outcome = Producer::new(broker.adapter()).publish(&unit, message).await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.message_id, "abc");

    let fetched = consumer(broker.adapter(), &unit, ConsumerOptions::default())
        .fetch_batch(1, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(fetched.len(), 1);
    let received = fetched.into_iter().next().unwrap().unwrap();
    assert_eq!(received.message.id(), "abc");
    assert_eq!(received.message.body["title"], json!("hi"));
    assert_eq!(received.message.priority(), Some(5));
}

#[tokio::test]
async fn batch_of_page_views_is_consumed_in_full() {
    let broker = InMemoryLogBroker::new();
    let unit: AddressableUnit = TopicSpec::new("events.page_view").partitions(1).into();
    TopologyService::new(broker.adapter())
        .declare_unit(&unit)
        .await
        .unwrap();

    let messages: Vec<Message> = (0..10)
        .map(|page| Message::new(body(json!({"page": format!("/p/{page}")}))))
        .collect();
    let mut sent_ids: Vec<String> = messages.iter().map(|m| m.id().to_string()).collect();

    let report = Producer::new(broker.adapter())
        .publish_batch(&unit, messages)
        .await;
    assert_eq!(report.total, 10);
    assert_eq!(report.success, 10);
    assert!(report.failed_ids().is_empty());

    let fetched = consumer(broker.adapter(), &unit, ConsumerOptions::default())
        .fetch_batch(20, Duration::from_millis(500))
        .await
        .unwrap();
    let mut received_ids: Vec<String> = fetched
        .into_iter()
        .map(|entry| entry.unwrap().message.id().to_string())
        .collect();

    assert_eq!(received_ids.len(), 10);
    sent_ids.sort();
    received_ids.sort();
    assert_eq!(received_ids, sent_ids);
}

#[tokio::test]
async fn requeued_queue_message_is_redelivered() {
    let broker = InMemoryQueueBroker::new();
    let unit = notifications();
    TopologyService::new(broker.adapter())
        .declare_unit(&unit)
        .await
        .unwrap();
    let message = Message::with_id("retry-me", body(json!({"attempt": 1})));
    assert!(Producer::new(broker.adapter()).publish(&unit, message).await.success);

    let mut deliveries = Vec::new();
    let summary = consumer(broker.adapter(), &unit, limited(2))
        .consume_loop(
            |received| {
                deliveries.push(received.message.id().to_string());
                if deliveries.len() == 1 {
                    AckDecision::Requeue
                } else {
                    AckDecision::Ack
                }
            },
            &StopSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(deliveries, ["retry-me", "retry-me"]);
    assert_eq!((summary.requeued, summary.acked), (1, 1));
    assert_eq!(broker.depth("notif_q"), 0);
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn requeued_log_record_is_read_again() {
    let broker = InMemoryLogBroker::new();
    let unit = AddressableUnit::topic("jobs");
    let message = Message::with_id("job-1", body(json!({"run": true})));
    assert!(Producer::new(broker.adapter()).publish(&unit, message).await.success);

    let mut deliveries = 0;
    let summary = consumer(broker.adapter(), &unit, limited(2))
        .consume_loop(
            |_| {
                deliveries += 1;
                if deliveries == 1 {
                    AckDecision::Requeue
                } else {
                    AckDecision::Ack
                }
            },
            &StopSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.handled, 2);
    assert_eq!(broker.committed_offset("test-group", "jobs", 0), 1);
}

#[tokio::test]
async fn rejected_message_goes_to_dead_letter_queue() {
    let broker = InMemoryQueueBroker::new();
    let topology = TopologyService::new(broker.adapter());
    let parking: AddressableUnit =
        QueueBinding::new("parking_ex", "parking_q", "jobs", ExchangeKind::Fanout).into();
    let jobs: AddressableUnit =
        QueueBinding::new("jobs_ex", "jobs_q", "jobs", ExchangeKind::Direct)
            .dead_letter_exchange("parking_ex")
            .into();
    topology.declare_units(&[parking, jobs.clone()]).await.unwrap();

    let message = Message::with_id("poison", body(json!({"bad": true})));
    assert!(Producer::new(broker.adapter()).publish(&jobs, message).await.success);

    let summary = consumer(broker.adapter(), &jobs, limited(1))
        .consume_loop(|_| AckDecision::Reject, &StopSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.rejected, 1);
    assert_eq!(broker.depth("jobs_q"), 0);
    assert_eq!(broker.depth("parking_q"), 1);
}

#[tokio::test]
async fn auto_ack_consumer_leaves_nothing_unacked() {
    let broker = InMemoryQueueBroker::new();
    let unit = notifications();
    TopologyService::new(broker.adapter())
        .declare_unit(&unit)
        .await
        .unwrap();
    let producer = Producer::new(broker.adapter());
    for n in 0..3 {
        let message = Message::with_id(format!("n{n}"), body(json!({"n": n})));
        assert!(producer.publish(&unit, message).await.success);
    }

    let options = ConsumerOptions {
        auto_ack: true,
        ..limited(3)
    };
    let summary = consumer(broker.adapter(), &unit, options)
        .consume_loop(|_| AckDecision::Requeue, &StopSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.handled, 3);
    assert_eq!(broker.depth("notif_q"), 0);
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn publish_to_missing_exchange_fails_with_broker_reason() {
    let broker = InMemoryQueueBroker::new();
    let unit: AddressableUnit =
        QueueBinding::new("ghost_ex", "ghost_q", "ghost", ExchangeKind::Direct).into();

    let outcome = Producer::new(broker.adapter())
        .publish(&unit, Message::with_id("lost", body(json!({"n": 1}))))
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.message_id, "lost");
    assert!(outcome.broker_metadata.is_none());
    let reason = outcome.error.unwrap();
    assert!(
        reason.contains("NOT_FOUND - no exchange 'ghost_ex'"),
        "{reason}"
    );
}

#[tokio::test]
async fn declare_units_reports_the_step_that_failed() {
    let broker = InMemoryQueueBroker::new();
    let topology = TopologyService::new(broker.adapter());
    let first: AddressableUnit =
        QueueBinding::new("shared_ex", "first_q", "first", ExchangeKind::Direct).into();
    let clashing_exchange: AddressableUnit =
        QueueBinding::new("shared_ex", "second_q", "second.#", ExchangeKind::Topic).into();

    let err = topology
        .declare_units(&[first, clashing_exchange])
        .await
        .unwrap_err();
    match err {
        BrokerError::Topology(failure) => {
            assert_eq!(failure.step, TopologyStep::DeclareExchange);
            assert_eq!(failure.unit, "shared_ex");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(topology.list_units().await.unwrap(), vec!["first_q".to_string()]);

    let clashing_queue: AddressableUnit =
        QueueBinding::new("shared_ex", "first_q", "first", ExchangeKind::Direct)
            .max_priority(9)
            .into();
    let err = topology.declare_unit(&clashing_queue).await.unwrap_err();
    assert!(
        matches!(&err, BrokerError::Topology(failure) if failure.step == TopologyStep::DeclareQueue),
        "{err:?}"
    );
}
