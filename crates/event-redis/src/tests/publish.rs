//! Forwarding, dropping and serialization behavior.

use super::harness::{eventually, ready_publisher, test_config, LogCapture, MemoryStore};
use crate::connection::ConnectionState;
use crate::event::Event;
use crate::publisher::{EventPublisher, PublishOutcome};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn test_ready_publish_pushes_once_and_acks_length_one() {
    let store = MemoryStore::new();
    let publisher = ready_publisher(&store, test_config()).await;
    assert_eq!(store.len("fs"), 0);

    let outcome = publisher.publish(&Event::new().with("event", "CHANNEL_CREATE"));
    assert_eq!(outcome, PublishOutcome::Submitted);

    assert!(publisher.shutdown(Duration::from_secs(1)).await);
    assert_eq!(store.entries("fs"), vec![r#"{"event":"CHANNEL_CREATE"}"#]);
    assert_eq!(store.replies(), vec![1]);

    let stats = publisher.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.last_queue_len, 1);
}

#[tokio::test]
async fn test_ack_callback_receives_resulting_length() {
    let store = MemoryStore::new();
    let publisher = ready_publisher(&store, test_config()).await;
    let manager = publisher.connection().clone();

    let (tx, rx) = tokio::sync::oneshot::channel();
    manager
        .push("fs", r#"{"event":"CHANNEL_CREATE"}"#.to_string(), move |result| {
            let _ = tx.send(result.map_err(|e| e.to_string()));
        })
        .unwrap();

    let len = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("ack should arrive")
        .unwrap();
    assert_eq!(len, Ok(1));
}

#[tokio::test]
async fn test_not_ready_publish_warns_with_payload() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let store = MemoryStore::new();
    store.drop_link();
    let publisher =
        EventPublisher::start_with(test_config(), store.connector(), &tokio::runtime::Handle::current())
            .unwrap();

    assert!(
        eventually(Duration::from_secs(1), || store.connect_attempts() == 1
            && publisher.connection().state() == ConnectionState::Disconnected)
        .await
    );

    let outcome = publisher.publish(&Event::new().with("event", "X"));
    assert_eq!(outcome, PublishOutcome::NotReady);
    assert_eq!(store.push_count(), 0);

    let with_payload: Vec<String> = logs
        .lines_at("WARN")
        .into_iter()
        .filter(|line| line.contains(r#"{"event":"X"}"#))
        .collect();
    assert_eq!(with_payload.len(), 1, "logs: {:#?}", logs.lines());
    assert_eq!(publisher.stats().dropped_not_ready, 1);
}

#[tokio::test]
async fn test_never_connected_publisher_drops() {
    let store = MemoryStore::new();
    let manager = crate::connection::ConnectionManager::new(
        test_config(),
        store.connector(),
        &tokio::runtime::Handle::current(),
    );
    let publisher = EventPublisher::new(std::sync::Arc::new(manager));

    assert_eq!(
        publisher.publish(&json!({"event": "HEARTBEAT"})),
        PublishOutcome::NotReady
    );
    assert_eq!(store.connect_attempts(), 0);
}

#[tokio::test]
async fn test_stored_payload_round_trips() {
    let store = MemoryStore::new();
    let publisher = ready_publisher(&store, test_config()).await;

    let event = Event::new()
        .with("event", "CHANNEL_ANSWER")
        .with("Unique-ID", "0f7c2a6e-3d7c-4b9b-9a51-0a1b2c3d4e5f")
        .with(
            "variables",
            json!({"sip_from_user": "1000", "codecs": ["PCMU", "OPUS"], "ptime": 20}),
        )
        .with("_body", "line one\nline two");

    publisher.publish(&event);
    assert!(publisher.shutdown(Duration::from_secs(1)).await);

    let stored = store.entries("fs");
    assert_eq!(stored.len(), 1);
    let decoded: Event = serde_json::from_str(&stored[0]).unwrap();
    assert_eq!(decoded, event);
}

#[tokio::test]
async fn test_host_types_publish_directly() {
    #[derive(Serialize)]
    struct ChannelEvent<'a> {
        event: &'a str,
        sequence: u64,
    }

    let store = MemoryStore::new();
    let publisher = ready_publisher(&store, test_config()).await;

    publisher.publish(&ChannelEvent {
        event: "CHANNEL_HANGUP",
        sequence: 7,
    });
    assert!(publisher.shutdown(Duration::from_secs(1)).await);

    assert_eq!(
        store.entries("fs"),
        vec![r#"{"event":"CHANNEL_HANGUP","sequence":7}"#]
    );
}

#[tokio::test]
async fn test_unserializable_event_is_dropped_and_logged() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let store = MemoryStore::new();
    let publisher = ready_publisher(&store, test_config()).await;

    // JSON object keys must be strings
    let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
    bad.insert((1, 2), 3);

    assert_eq!(publisher.publish(&bad), PublishOutcome::Unserializable);
    assert_eq!(publisher.stats().dropped_unserializable, 1);
    assert!(publisher.connection().is_ready());

    let errors = logs.lines_at("ERROR");
    assert!(
        errors.iter().any(|line| line.contains("could not be serialized")),
        "logs: {:#?}",
        logs.lines()
    );

    assert!(publisher.shutdown(Duration::from_secs(1)).await);
    assert_eq!(store.push_count(), 0);
}

#[tokio::test]
async fn test_store_rejection_is_swallowed() {
    let store = MemoryStore::new();
    let publisher = ready_publisher(&store, test_config()).await;
    store.set_reject_pushes(true);

    assert_eq!(
        publisher.publish(&json!({"event": "CUSTOM"})),
        PublishOutcome::Submitted
    );
    assert!(eventually(Duration::from_secs(1), || publisher.stats().failed == 1).await);

    // A rejected push does not take the link down
    assert!(publisher.connection().is_ready());
    assert_eq!(store.len("fs"), 0);
}

#[tokio::test]
async fn test_custom_queue_name() {
    let store = MemoryStore::new();
    let mut config = test_config();
    config.endpoint.queue_name = "freeswitch:events".to_string();
    let publisher = ready_publisher(&store, config).await;

    assert_eq!(publisher.queue_name(), "freeswitch:events");
    publisher.publish(&json!({"event": "RE_SCHEDULE"}));
    assert!(publisher.shutdown(Duration::from_secs(1)).await);

    assert_eq!(store.len("freeswitch:events"), 1);
    assert_eq!(store.len("fs"), 0);
}
