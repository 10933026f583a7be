//! Queue store seam and its Redis implementation.
//!
//! The connection manager only talks to [`QueueConnector`] and
//! [`QueueLink`]; the Redis wire format stays behind this module.

use crate::config::EndpointConfig;
use crate::error::BridgeResult;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use tracing::{debug, warn};

/// One queued `LPUSH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCommand {
    /// Target list
    pub queue: String,
    /// Serialized event
    pub payload: String,
}

/// Opens links to a queue store.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Open a new link. Timeouts are applied by the caller.
    async fn connect(&self, endpoint: &EndpointConfig) -> BridgeResult<Box<dyn QueueLink>>;
}

/// An open link to a queue store.
#[async_trait]
pub trait QueueLink: Send {
    /// Commit `batch` as one pipeline.
    ///
    /// On success returns the resulting list length for every command, in
    /// submission order.
    async fn push_batch(&mut self, batch: &[PushCommand]) -> BridgeResult<Vec<i64>>;

    /// Round-trip health check.
    async fn ping(&mut self) -> BridgeResult<()>;
}

/// Connector backed by the `redis` crate.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client_name: String,
}

impl RedisConnector {
    pub fn new() -> Self {
        Self {
            client_name: format!("event-redis-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Name announced with `CLIENT SETNAME` on every new link.
    pub fn client_name(&self) -> &str {
        &self.client_name
    }
}

impl Default for RedisConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueConnector for RedisConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> BridgeResult<Box<dyn QueueLink>> {
        let client = Client::open(endpoint.redis_url().as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        // Not every Redis-compatible store implements CLIENT SETNAME
        let named: RedisResult<()> = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(&self.client_name)
            .query_async(&mut conn)
            .await;
        match named {
            Ok(()) => debug!(client_name = %self.client_name, "Registered client name"),
            Err(e) if e.is_io_error() || e.is_connection_dropped() => return Err(e.into()),
            Err(e) => warn!(error = %e, "CLIENT SETNAME rejected, continuing unnamed"),
        }

        Ok(Box::new(RedisLink { conn }))
    }
}

/// Link over a multiplexed Redis connection.
pub struct RedisLink {
    conn: MultiplexedConnection,
}

#[async_trait]
impl QueueLink for RedisLink {
    async fn push_batch(&mut self, batch: &[PushCommand]) -> BridgeResult<Vec<i64>> {
        let mut pipe = redis::pipe();
        for command in batch {
            pipe.cmd("LPUSH").arg(&command.queue).arg(&command.payload);
        }

        let lengths: Vec<i64> = pipe.query_async(&mut self.conn).await?;
        Ok(lengths)
    }

    async fn ping(&mut self) -> BridgeResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }
}
