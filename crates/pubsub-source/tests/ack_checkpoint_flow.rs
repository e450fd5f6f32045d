//! End-to-end acknowledgment flow through the public reader API, backed by
//! the in-memory client.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pubsub_source::emitter::{PubSubRecordEmitter, RawPayload};
use pubsub_source::source::PubSubReader;
use pubsub_source::testing::{CollectingOutput, MockPubSubClient};
use pubsub_source::{
    AckId, ConnectorConfig, InputStatus, PubSubError, PubSubMessage, PubSubSource,
    PubSubSourceConfig, SourceReader, SubscriptionSplit,
};

const PATH: &str = "projects/proj/subscriptions/orders";

type Reader = PubSubReader<MockPubSubClient, PubSubRecordEmitter<RawPayload>>;

fn message(ack: &str) -> PubSubMessage {
    let mut m = PubSubMessage::new(ack, format!("msg-{ack}"), Bytes::from(ack.to_string()));
    m.publish_time_millis = 1_000;
    m
}

fn setup(config: PubSubSourceConfig) -> (Reader, Arc<MockPubSubClient>) {
    let client = Arc::new(MockPubSubClient::new());
    let source = PubSubSource::new(config, Arc::clone(&client)).unwrap();
    let mut reader = source
        .create_reader(PubSubRecordEmitter::new(RawPayload))
        .unwrap();
    reader.add_splits(source.splits());
    (reader, client)
}

fn ids(raw: &[&str]) -> Vec<AckId> {
    raw.iter().map(|s| AckId::from(*s)).collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_acks_wait_for_their_checkpoint() {
    let (mut reader, client) = setup(PubSubSourceConfig::new("proj", "orders"));
    let mut out = CollectingOutput::new();

    client.publish(PATH, [message("a"), message("b")]);
    assert_eq!(
        reader.poll_next(&mut out).await.unwrap(),
        InputStatus::MoreAvailable
    );
    reader.snapshot_state(1).unwrap();

    client.publish(PATH, [message("c")]);
    reader.poll_next(&mut out).await.unwrap();
    reader.snapshot_state(2).unwrap();

    // Nothing is acknowledged before a checkpoint completes.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(client.acknowledged(PATH).is_empty());

    reader.notify_checkpoint_complete(1).unwrap();
    client.wait_for_acks(2, Duration::from_secs(1)).await.unwrap();
    assert_eq!(client.acknowledged(PATH), ids(&["a", "b"]));

    reader.notify_checkpoint_complete(2).unwrap();
    client.wait_for_acks(3, Duration::from_secs(1)).await.unwrap();
    assert_eq!(client.acknowledged(PATH), ids(&["a", "b", "c"]));

    assert_eq!(out.len(), 3);
    assert!(out.timestamps().all(|ts| ts == Some(1_000)));
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_later_completion_covers_skipped_notifications() {
    let (mut reader, client) = setup(PubSubSourceConfig::new("proj", "orders"));
    let mut out = CollectingOutput::new();

    client.publish(PATH, [message("a"), message("b")]);
    reader.poll_next(&mut out).await.unwrap();
    reader.snapshot_state(1).unwrap();
    client.publish(PATH, [message("c")]);
    reader.poll_next(&mut out).await.unwrap();
    reader.snapshot_state(2).unwrap();

    reader.notify_checkpoint_complete(2).unwrap();
    client.wait_for_acks(3, Duration::from_secs(1)).await.unwrap();
    assert_eq!(client.acknowledged(PATH), ids(&["a", "b", "c"]));

    // Late or repeated notifications release nothing further.
    reader.notify_checkpoint_complete(1).unwrap();
    reader.notify_checkpoint_complete(2).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.ack_calls(), 1);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_non_monotonic_checkpoint_is_rejected() {
    let (mut reader, _client) = setup(PubSubSourceConfig::new("proj", "orders"));
    reader.snapshot_state(5).unwrap();

    let err = reader.snapshot_state(5).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, PubSubError::ContractViolation(_)));
}

#[tokio::test]
async fn test_completing_unknown_checkpoint_is_rejected() {
    let (mut reader, _client) = setup(PubSubSourceConfig::new("proj", "orders"));
    reader.snapshot_state(1).unwrap();

    let err = reader.notify_checkpoint_complete(2).unwrap_err();
    assert!(matches!(err, PubSubError::ContractViolation(_)));
}

#[tokio::test]
async fn test_flow_control_suspends_until_acknowledged() {
    let config = PubSubSourceConfig::new("proj", "orders")
        .with_max_outstanding_messages_count(2)
        .with_max_messages_per_pull(2);
    let (mut reader, client) = setup(config);
    let mut out = CollectingOutput::new();

    client.publish(PATH, ["a", "b", "c", "d", "e"].map(message));
    reader.poll_next(&mut out).await.unwrap();
    assert_eq!(out.len(), 2);

    // Limit reached: no pull happens.
    assert_eq!(
        reader.poll_next(&mut out).await.unwrap(),
        InputStatus::NothingAvailable
    );
    assert_eq!(client.pending(PATH), 3);

    reader.snapshot_state(1).unwrap();
    reader.notify_checkpoint_complete(1).unwrap();
    client.wait_for_acks(2, Duration::from_secs(1)).await.unwrap();

    assert_eq!(
        reader.poll_next(&mut out).await.unwrap(),
        InputStatus::MoreAvailable
    );
    assert_eq!(out.len(), 4);
    assert_eq!(client.pending(PATH), 1);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_acknowledgment_is_not_rolled_back() {
    let config = PubSubSourceConfig::new("proj", "orders")
        .with_ack_retry(3, Duration::from_millis(1));
    let (mut reader, client) = setup(config);
    let mut out = CollectingOutput::new();

    client.publish(PATH, [message("a"), message("b")]);
    reader.poll_next(&mut out).await.unwrap();
    reader.snapshot_state(1).unwrap();

    client.fail_next_acks(3);
    reader.notify_checkpoint_complete(1).unwrap();
    wait_until(|| reader.metrics().ack_failures.load(Ordering::Relaxed) == 2).await;
    assert_eq!(client.ack_calls(), 3);
    assert!(client.acknowledged(PATH).is_empty());

    // The ids are gone from the tracker: a later checkpoint does not retry them.
    reader.snapshot_state(2).unwrap();
    reader.notify_checkpoint_complete(2).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.ack_calls(), 3);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_ack_retry_recovers_from_transient_failure() {
    let config = PubSubSourceConfig::new("proj", "orders")
        .with_ack_retry(3, Duration::from_millis(1));
    let (mut reader, client) = setup(config);
    let mut out = CollectingOutput::new();

    client.publish(PATH, [message("a")]);
    reader.poll_next(&mut out).await.unwrap();
    reader.snapshot_state(1).unwrap();

    client.fail_next_acks(1);
    reader.notify_checkpoint_complete(1).unwrap();
    client.wait_for_acks(1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(client.ack_calls(), 2);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_outstanding_leases_are_extended() {
    let config = PubSubSourceConfig::new("proj", "orders")
        .with_lease_extension_interval(Duration::from_millis(10));
    let (mut reader, client) = setup(config);
    let mut out = CollectingOutput::new();

    client.publish(PATH, [message("a")]);
    reader.poll_next(&mut out).await.unwrap();

    wait_until(|| !client.extended(PATH).is_empty()).await;
    assert!(client.extended(PATH).iter().all(|id| id.as_str() == "a"));
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_returns_assigned_split() {
    let (mut reader, _client) = setup(PubSubSourceConfig::new("proj", "orders"));
    let splits = reader.snapshot_state(1).unwrap();
    assert_eq!(splits, vec![SubscriptionSplit::new("proj", "orders")]);
}

#[test]
fn test_lease_shorter_than_ack_deadline_rejected() {
    let mut props = ConnectorConfig::new("pubsub");
    props.set("project", "proj");
    props.set("subscription", "orders");
    props.set("lease.extension.interval.ms", "10");
    props.set("max.lease.duration.ms", "0");

    let err = PubSubSource::from_connector_config(&props, Arc::new(MockPubSubClient::new()))
        .unwrap_err();
    assert!(matches!(err, PubSubError::ConfigurationError(_)));
}
