//! Integration tests for the publishing pipeline.
//!
//! - `harness.rs`    - In-memory store, log capture, state recorder
//! - `publish.rs`    - Forwarding, dropping and serialization behavior
//! - `ordering.rs`   - Submission order and concurrent publishers
//! - `lifecycle.rs`  - Connect, disconnect detection, reconnect
//! - `flush.rs`      - Bounded flush, close and shutdown

mod ordering;
mod publish;
