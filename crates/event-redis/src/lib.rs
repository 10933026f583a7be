//! event-redis: forwards structured host events into a Redis list.
//!
//! The host hands every event to [`EventPublisher::publish`]. If the link to
//! the store is up, the event is serialized to JSON and `LPUSH`ed onto the
//! configured queue; otherwise it is dropped and its payload logged.
//!
//! # Core Invariants
//!
//! 1. **Never blocks the host**: `publish` checks an atomic readiness flag
//!    and enqueues; all I/O happens on the connection worker
//! 2. **Never fails the host**: serialization, connection and store errors
//!    become log lines
//! 3. **Ordered**: pushes reach the store in submission order
//! 4. **Bounded shutdown**: the final flush gives up at its deadline
//!
//! # Architecture
//!
//! ```text
//! host -> EventPublisher -> ConnectionManager -> worker --LPUSH--> Redis
//!                                                  |
//!                               debug log <-- ack(queue_len)
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod logging;
pub mod publisher;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::{BridgeConfig, EndpointConfig, ReconnectPolicy};
pub use connection::{ConnectionManager, ConnectionState, PushRejected};
pub use error::{BridgeError, BridgeResult};
pub use event::Event;
pub use publisher::{EventPublisher, PublishOutcome, PublishStats};
pub use store::{PushCommand, QueueConnector, QueueLink, RedisConnector};
