//! Submission order and concurrent publishers.

use super::harness::{ready_publisher, test_config, MemoryStore};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_sequential_publishes_keep_order() {
    let store = MemoryStore::new();
    let publisher = ready_publisher(&store, test_config()).await;

    for seq in 0..50 {
        publisher.publish(&json!({"event": "DTMF", "seq": seq}));
    }
    assert!(publisher.shutdown(Duration::from_secs(2)).await);

    let seqs: Vec<i64> = store
        .entries("fs")
        .iter()
        .map(|entry| serde_json::from_str::<Value>(entry).unwrap()["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, (0..50).collect::<Vec<_>>());
    assert_eq!(store.replies(), (1..=50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_slow_store_batches_but_keeps_order() {
    let store = MemoryStore::new();
    store.set_push_delay(Duration::from_millis(20));
    let mut config = test_config();
    config.max_pipeline = 4;
    let publisher = ready_publisher(&store, config).await;

    for seq in 0..20 {
        publisher.publish(&json!({"seq": seq}));
    }
    assert!(publisher.shutdown(Duration::from_secs(5)).await);

    let seqs: Vec<i64> = store
        .entries("fs")
        .iter()
        .map(|entry| serde_json::from_str::<Value>(entry).unwrap()["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    assert!(store.max_batch() <= 4, "pipeline exceeded: {}", store.max_batch());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_publishers_deliver_every_event_once() {
    const THREADS: usize = 10;
    const PER_THREAD: usize = 100;

    let store = MemoryStore::new();
    let mut config = test_config();
    config.max_pipeline = 16;
    let publisher = ready_publisher(&store, config).await;

    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let publisher = &publisher;
            scope.spawn(move || {
                for seq in 0..PER_THREAD {
                    publisher.publish(&json!({
                        "event": "CHANNEL_CREATE",
                        "thread": thread,
                        "seq": seq,
                    }));
                }
            });
        }
    });

    assert!(publisher.shutdown(Duration::from_secs(5)).await);

    let total = THREADS * PER_THREAD;
    assert_eq!(store.len("fs"), total);

    let mut replies = store.replies();
    replies.sort_unstable();
    assert_eq!(replies, (1..=total as i64).collect::<Vec<_>>());

    let stats = publisher.stats();
    assert_eq!(stats.submitted, total as u64);
    assert_eq!(stats.acknowledged, total as u64);

    // Each thread's events land in the order that thread published them
    let mut last_seen: HashMap<u64, i64> = HashMap::new();
    for entry in store.entries("fs") {
        let value: Value = serde_json::from_str(&entry).unwrap();
        let thread = value["thread"].as_u64().unwrap();
        let seq = value["seq"].as_i64().unwrap();
        let previous = last_seen.insert(thread, seq).unwrap_or(-1);
        assert_eq!(seq, previous + 1, "thread {} out of order", thread);
    }
    assert!(store.max_batch() <= 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_pushes_ack_their_own_lengths() {
    const THREADS: usize = 10;
    const PER_THREAD: usize = 100;

    let store = MemoryStore::new();
    let mut config = test_config();
    config.max_pipeline = 16;
    let publisher = ready_publisher(&store, config).await;
    let manager = publisher.connection().clone();

    let acks: Arc<Mutex<HashMap<String, i64>>> = Arc::default();

    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let manager = &manager;
            let acks = &acks;
            scope.spawn(move || {
                for seq in 0..PER_THREAD {
                    let payload = json!({"thread": thread, "seq": seq}).to_string();
                    let acks = acks.clone();
                    let key = payload.clone();
                    manager
                        .push("fs", payload, move |result| {
                            acks.lock().unwrap().insert(key, result.unwrap());
                        })
                        .unwrap();
                }
            });
        }
    });

    assert!(manager.flush(Duration::from_secs(5)).await);

    let total = THREADS * PER_THREAD;
    let acks = acks.lock().unwrap().clone();
    assert_eq!(acks.len(), total);

    let mut lengths: Vec<i64> = acks.values().copied().collect();
    lengths.sort_unstable();
    assert_eq!(lengths, (1..=total as i64).collect::<Vec<_>>());

    // The callback for the i-th entry pushed saw a list of length i
    for (index, entry) in store.entries("fs").iter().enumerate() {
        assert_eq!(acks[entry], index as i64 + 1, "wrong ack for {}", entry);
    }

    // Within one thread, lengths grow in submission order
    for thread in 0..THREADS {
        let per_thread: Vec<i64> = (0..PER_THREAD)
            .map(|seq| acks[&json!({"thread": thread, "seq": seq}).to_string()])
            .collect();
        assert!(
            per_thread.windows(2).all(|pair| pair[0] < pair[1]),
            "thread {} acks out of order: {:?}",
            thread,
            per_thread
        );
    }
}
