//! The host-facing publish entry point.
//!
//! Every failure is contained here: `publish` never returns an error and
//! never blocks on the network. Events that cannot be delivered are logged
//! with their full payload so they are recoverable from the log sink.

use crate::config::BridgeConfig;
use crate::connection::{ConnectionManager, ConnectionState, PushRejected};
use crate::error::{BridgeError, BridgeResult};
use crate::store::{QueueConnector, RedisConnector};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// What happened to one published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the connection manager; acknowledged asynchronously.
    Submitted,
    /// Dropped because the link was not ready. Payload was logged.
    NotReady,
    /// Dropped because it could not be serialized.
    Unserializable,
}

/// Point-in-time publisher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishStats {
    pub submitted: u64,
    pub dropped_not_ready: u64,
    pub dropped_unserializable: u64,
    pub acknowledged: u64,
    pub failed: u64,
    /// Queue length reported by the most recent acknowledgement.
    pub last_queue_len: i64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    dropped_not_ready: AtomicU64,
    dropped_unserializable: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    last_queue_len: AtomicI64,
}

/// Serializes host events and pushes them onto the configured queue.
///
/// Safe to share across threads; `publish` takes `&self`.
pub struct EventPublisher {
    connection: Arc<ConnectionManager>,
    queue_name: String,
    counters: Arc<Counters>,
    shut_down: AtomicBool,
    flushed: AtomicBool,
}

impl EventPublisher {
    /// Wrap an existing manager. The queue is the manager's endpoint queue.
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        let queue_name = connection.endpoint().queue_name.clone();
        Self {
            connection,
            queue_name,
            counters: Arc::new(Counters::default()),
            shut_down: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
        }
    }

    /// Build a Redis-backed publisher and start connecting.
    ///
    /// Fails only on malformed configuration; an unreachable store just
    /// leaves the publisher not ready.
    pub fn start(config: BridgeConfig, runtime: &Handle) -> BridgeResult<Self> {
        Self::start_with(config, Arc::new(RedisConnector::new()), runtime)
    }

    /// Same as [`EventPublisher::start`] over any connector.
    pub fn start_with(
        config: BridgeConfig,
        connector: Arc<dyn QueueConnector>,
        runtime: &Handle,
    ) -> BridgeResult<Self> {
        info!(
            host = %config.endpoint.host,
            port = config.endpoint.port,
            queue = %config.endpoint.queue_name,
            "Event publisher initialising"
        );

        let connection = Arc::new(ConnectionManager::new(config, connector, runtime));
        connection.connect(log_state_change)?;

        Ok(Self::new(connection))
    }

    /// The underlying connection manager.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Target queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Serialize `event` and push it if the link is ready.
    pub fn publish<E: Serialize + ?Sized>(&self, event: &E) -> PublishOutcome {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                let err = BridgeError::from(e);
                error!(error = %err, "Dropping event that could not be serialized");
                self.counters
                    .dropped_unserializable
                    .fetch_add(1, Ordering::Relaxed);
                return PublishOutcome::Unserializable;
            }
        };

        if !self.connection.is_ready() {
            self.drop_not_ready(&payload);
            return PublishOutcome::NotReady;
        }

        let bytes = payload.len();
        let counters = self.counters.clone();
        let submitted = self
            .connection
            .push(self.queue_name.as_str(), payload, move |result| {
                on_acknowledged(&counters, bytes, result)
            });

        match submitted {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                PublishOutcome::Submitted
            }
            Err(PushRejected { payload }) => {
                self.drop_not_ready(&payload);
                PublishOutcome::NotReady
            }
        }
    }

    fn drop_not_ready(&self, payload: &str) {
        self.counters
            .dropped_not_ready
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            queue = %self.queue_name,
            payload = %payload,
            "Publish without active connection, event dropped"
        );
    }

    /// Snapshot of the publisher counters.
    pub fn stats(&self) -> PublishStats {
        let c = &self.counters;
        PublishStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            dropped_not_ready: c.dropped_not_ready.load(Ordering::Relaxed),
            dropped_unserializable: c.dropped_unserializable.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            last_queue_len: c.last_queue_len.load(Ordering::Relaxed),
        }
    }

    /// Flush pending pushes within `deadline`, then close the connection.
    ///
    /// Returns whether every pending push was confirmed. Repeated calls
    /// return the first result without flushing again.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already requested");
            return self.flushed.load(Ordering::Acquire);
        }

        let pending = self.connection.outstanding();
        info!(
            pending,
            deadline_ms = deadline.as_millis() as u64,
            "Shutdown requested, flushing publisher"
        );

        let flushed = self.connection.flush(deadline).await;
        self.flushed.store(flushed, Ordering::Release);

        if flushed {
            info!(pending, "All pending pushes confirmed");
        } else {
            warn!(
                remaining = self.connection.outstanding(),
                deadline_ms = deadline.as_millis() as u64,
                "Flush did not confirm every pending push"
            );
        }

        self.connection.close();

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            acknowledged = stats.acknowledged,
            failed = stats.failed,
            dropped_not_ready = stats.dropped_not_ready,
            dropped_unserializable = stats.dropped_unserializable,
            "Event publisher shut down"
        );

        flushed
    }
}

fn on_acknowledged(counters: &Counters, bytes: usize, result: BridgeResult<i64>) {
    match result {
        Ok(queue_len) => {
            counters.acknowledged.fetch_add(1, Ordering::Relaxed);
            counters.last_queue_len.store(queue_len, Ordering::Relaxed);
            debug!(bytes, queue_len, "Published message");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(bytes, error = %e, "Push was not acknowledged");
        }
    }
}

fn log_state_change(state: ConnectionState) {
    match state {
        ConnectionState::Connected => info!("Publisher ready"),
        ConnectionState::Connecting => debug!("Publisher connecting"),
        ConnectionState::Disconnected => warn!("Publisher not ready, events will be dropped"),
    }
}
