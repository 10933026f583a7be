//! Connection lifecycle and pipelined pushes.
//!
//! One [`ConnectionManager`] owns one logical link to the queue store. All
//! I/O, state transitions and acknowledgement callbacks happen on a single
//! worker task; callers only touch atomics and an unbounded channel.
//!
//! ```text
//! push() -> mpsc -> Worker --pipeline--> store
//!                     |
//!                     +-- on_ack(len) -> outstanding -= 1 -> flush()
//! ```

use crate::config::{BridgeConfig, EndpointConfig, ReconnectPolicy};
use crate::error::{BridgeError, BridgeResult};
use crate::store::{PushCommand, QueueConnector, QueueLink};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Link state as seen by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Invoked from the worker on every state transition.
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Receives the resulting list length, or why the push was not confirmed.
pub type AckCallback = Box<dyn FnOnce(BridgeResult<i64>) + Send>;

/// A push the manager refused to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRejected {
    /// The payload that was not sent.
    pub payload: String,
}

/// One in-flight push, owned by the worker until resolved.
struct PendingPush {
    command: PushCommand,
    on_ack: AckCallback,
}

enum WorkerCommand {
    Connect(StateCallback),
    Push(PendingPush),
    Close,
}

/// State shared between callers and the worker.
struct Shared {
    state: AtomicU8,
    closed: AtomicBool,
    draining: AtomicBool,
    /// Submitted but not yet resolved.
    outstanding: watch::Sender<usize>,
    /// Pushes resolved with an error, ever.
    failed: AtomicU64,
    /// Value of `failed` as of the last flush.
    reported_failures: AtomicU64,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Owns the link to the queue store.
///
/// Cheap to query from any thread: [`ConnectionManager::is_ready`] is a pair
/// of atomic loads and [`ConnectionManager::push`] only enqueues.
pub struct ConnectionManager {
    config: BridgeConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl ConnectionManager {
    /// Create a manager and spawn its worker on `runtime`.
    ///
    /// No connection is attempted until [`ConnectionManager::connect`].
    pub fn new(
        config: BridgeConfig,
        connector: Arc<dyn QueueConnector>,
        runtime: &Handle,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0usize);

        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            closed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            outstanding,
            failed: AtomicU64::new(0),
            reported_failures: AtomicU64::new(0),
        });

        let worker = Worker {
            endpoint: config.endpoint.clone(),
            command_timeout: config.command_timeout,
            health_check_interval: config.health_check_interval,
            max_pipeline: config.max_pipeline.max(1),
            reconnect: config.reconnect,
            connector,
            shared: shared.clone(),
            commands: rx,
            deferred: None,
            link: None,
            on_state_change: None,
            reconnect_attempt: 0,
            reconnect_at: None,
        };
        runtime.spawn(worker.run());

        Self {
            config,
            shared,
            commands: tx,
        }
    }

    /// Endpoint this manager connects to.
    pub fn endpoint(&self) -> &EndpointConfig {
        &self.config.endpoint
    }

    /// Start a connection attempt and return immediately.
    ///
    /// Fails synchronously only when the configuration is malformed or the
    /// manager is closed. Everything else is reported through
    /// `on_state_change`, which replaces any previously registered callback.
    /// A no-op while a link is already up.
    pub fn connect(
        &self,
        on_state_change: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> BridgeResult<()> {
        self.config.validate()?;
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Closed);
        }

        self.commands
            .send(WorkerCommand::Connect(Arc::new(on_state_change)))
            .map_err(|_| BridgeError::Closed)
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// True iff the link is up and the manager is not closed.
    pub fn is_ready(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
            && self.shared.state() == ConnectionState::Connected
    }

    /// Pushes submitted but not yet resolved.
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Enqueue `payload` for `LPUSH` onto `queue`.
    ///
    /// Rejected pushes (not ready, draining, closed) hand the payload back
    /// and never invoke `on_ack`; accepted ones always invoke it exactly
    /// once, on the worker task.
    pub fn push(
        &self,
        queue: impl Into<String>,
        payload: String,
        on_ack: impl FnOnce(BridgeResult<i64>) + Send + 'static,
    ) -> Result<(), PushRejected> {
        if !self.is_ready() || self.shared.draining.load(Ordering::Acquire) {
            debug!("Push rejected, manager not accepting");
            return Err(PushRejected { payload });
        }

        let mut queued = 0;
        self.shared.outstanding.send_modify(|n| {
            *n += 1;
            queued = *n;
        });
        if queued == self.config.backlog_warning {
            warn!(
                outstanding = queued,
                host = %self.config.endpoint.host,
                port = self.config.endpoint.port,
                "Push backlog reached warning threshold, store is not keeping up"
            );
        }

        let push = PendingPush {
            command: PushCommand {
                queue: queue.into(),
                payload,
            },
            on_ack: Box::new(on_ack),
        };

        if let Err(mpsc::error::SendError(command)) = self.commands.send(WorkerCommand::Push(push)) {
            self.shared
                .outstanding
                .send_modify(|n| *n = n.saturating_sub(1));
            let payload = match command {
                WorkerCommand::Push(push) => push.command.payload,
                _ => String::new(),
            };
            return Err(PushRejected { payload });
        }

        Ok(())
    }

    /// Stop accepting pushes and wait for the in-flight ones.
    ///
    /// Returns true iff every push submitted before the call was acknowledged
    /// by the store before `deadline`. A push that failed counts against the
    /// first flush after it, whether it failed before or during that flush;
    /// later flushes do not report it again. Never waits past the deadline.
    pub async fn flush(&self, deadline: Duration) -> bool {
        self.shared.draining.store(true, Ordering::Release);

        let mut outstanding = self.shared.outstanding.subscribe();
        let drained = matches!(
            timeout(deadline, outstanding.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );

        let failed = self.shared.failed.load(Ordering::Acquire);
        let reported = self.shared.reported_failures.swap(failed, Ordering::AcqRel);
        if failed > reported {
            debug!(unconfirmed = failed - reported, "Flush found failed pushes");
        }

        drained && failed == reported
    }

    /// Release the link. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(WorkerCommand::Close);
        info!(
            host = %self.config.endpoint.host,
            port = self.config.endpoint.port,
            "Connection manager closed"
        );
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// What woke the worker up.
enum Wake {
    Command(Option<WorkerCommand>),
    Reconnect,
    HealthCheck,
}

/// Single task owning the link.
struct Worker {
    endpoint: EndpointConfig,
    command_timeout: Duration,
    health_check_interval: Duration,
    max_pipeline: usize,
    reconnect: ReconnectPolicy,
    connector: Arc<dyn QueueConnector>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    /// Non-push command pulled while batching, handled next.
    deferred: Option<WorkerCommand>,
    link: Option<Box<dyn QueueLink>>,
    on_state_change: Option<StateCallback>,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        let health_enabled = !self.health_check_interval.is_zero();
        let period = self.health_check_interval.max(Duration::from_millis(1));
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let command = match self.deferred.take() {
                Some(command) => Some(command),
                None => {
                    let reconnect_at = self.reconnect_at;
                    let wake = tokio::select! {
                        command = self.commands.recv() => Wake::Command(command),
                        _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)),
                            if reconnect_at.is_some() => Wake::Reconnect,
                        _ = health.tick(), if health_enabled && self.link.is_some() => {
                            Wake::HealthCheck
                        }
                    };

                    match wake {
                        Wake::Command(command) => command,
                        Wake::Reconnect => {
                            self.reconnect_at = None;
                            self.try_connect().await;
                            continue;
                        }
                        Wake::HealthCheck => {
                            self.check_health().await;
                            continue;
                        }
                    }
                }
            };

            match command {
                Some(WorkerCommand::Connect(callback)) => {
                    self.on_state_change = Some(callback);
                    self.reconnect_attempt = 0;
                    self.reconnect_at = None;
                    self.try_connect().await;
                }
                Some(WorkerCommand::Push(first)) => {
                    let batch = self.collect_batch(first);
                    self.commit(batch).await;
                }
                Some(WorkerCommand::Close) | None => break,
            }
        }

        self.finish();
    }

    /// Gather every push already queued behind `first`, up to `max_pipeline`.
    fn collect_batch(&mut self, first: PendingPush) -> Vec<PendingPush> {
        let mut batch = vec![first];
        while batch.len() < self.max_pipeline {
            match self.commands.try_recv() {
                Ok(WorkerCommand::Push(push)) => batch.push(push),
                Ok(other) => {
                    self.deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        batch
    }

    async fn commit(&mut self, batch: Vec<PendingPush>) {
        let (commands, acks): (Vec<PushCommand>, Vec<AckCallback>) = batch
            .into_iter()
            .map(|push| (push.command, push.on_ack))
            .unzip();

        if self.link.is_none() {
            for ack in acks {
                self.resolve(ack, Err(BridgeError::Connection("not connected".to_string())));
            }
            return;
        }

        let result = match self.link.as_mut() {
            Some(link) => match timeout(self.command_timeout, link.push_batch(&commands)).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::Connection(format!(
                    "no reply within {}ms",
                    self.command_timeout.as_millis()
                ))),
            },
            None => Err(BridgeError::Connection("not connected".to_string())),
        };

        match result {
            Ok(lengths) if lengths.len() == acks.len() => {
                debug!(pushes = acks.len(), "Pipeline committed");
                for (ack, len) in acks.into_iter().zip(lengths) {
                    self.resolve(ack, Ok(len));
                }
            }
            Ok(lengths) => {
                let reason = format!(
                    "store returned {} replies for {} pushes",
                    lengths.len(),
                    acks.len()
                );
                for ack in acks {
                    self.resolve(ack, Err(BridgeError::Acknowledgement(reason.clone())));
                }
            }
            Err(e) => {
                let link_lost = e.is_link_failure();
                let reason = e.to_string();
                for ack in acks {
                    let err = if link_lost {
                        BridgeError::Connection(reason.clone())
                    } else {
                        BridgeError::Acknowledgement(reason.clone())
                    };
                    self.resolve(ack, Err(err));
                }
                if link_lost && self.link.is_some() {
                    self.link_dropped(&reason);
                }
            }
        }
    }

    fn resolve(&self, ack: AckCallback, result: BridgeResult<i64>) {
        if result.is_err() {
            self.shared.failed.fetch_add(1, Ordering::AcqRel);
        }
        ack(result);
        self.shared
            .outstanding
            .send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn try_connect(&mut self) {
        if self.link.is_some() {
            debug!("Connect requested while already connected");
            return;
        }

        self.transition(ConnectionState::Connecting);

        let attempt = timeout(
            self.endpoint.connect_timeout,
            self.connector.connect(&self.endpoint),
        )
        .await;

        match attempt {
            Ok(Ok(link)) => {
                self.link = Some(link);
                self.reconnect_attempt = 0;
                info!(
                    host = %self.endpoint.host,
                    port = self.endpoint.port,
                    "Client connection ok"
                );
                self.transition(ConnectionState::Connected);
            }
            Ok(Err(e)) => {
                error!(
                    host = %self.endpoint.host,
                    port = self.endpoint.port,
                    error = %e,
                    "Connection attempt failed"
                );
                self.transition(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
            Err(_) => {
                error!(
                    host = %self.endpoint.host,
                    port = self.endpoint.port,
                    timeout_ms = self.endpoint.connect_timeout.as_millis() as u64,
                    "Connection attempt timed out"
                );
                self.transition(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    async fn check_health(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let result = match timeout(self.command_timeout, link.ping()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Connection("health check timed out".to_string())),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_link_failure() => self.link_dropped(&e.to_string()),
            Err(e) => warn!(error = %e, "Health check rejected by store"),
        }
    }

    fn link_dropped(&mut self, reason: &str) {
        self.link = None;
        error!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            reason = %reason,
            "Client disconnected"
        );
        self.transition(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.shared.closed.load(Ordering::Acquire) || self.on_state_change.is_none() {
            return;
        }

        self.reconnect_attempt += 1;
        match self.reconnect.delay_for(self.reconnect_attempt) {
            Some(delay) => {
                info!(
                    attempt = self.reconnect_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None if self.reconnect != ReconnectPolicy::Never => {
                warn!(
                    attempts = self.reconnect_attempt - 1,
                    "Reconnect attempts exhausted, staying disconnected"
                );
            }
            None => {}
        }
    }

    fn transition(&self, next: ConnectionState) {
        let prev = ConnectionState::from_u8(self.shared.state.swap(next as u8, Ordering::AcqRel));
        if prev == next {
            return;
        }

        debug!(from = ?prev, to = ?next, "Connection state changed");
        if let Some(callback) = &self.on_state_change {
            callback(next);
        }
    }

    /// Tear down after `close()` or after every sender is gone.
    fn finish(&mut self) {
        self.link = None;
        self.reconnect_at = None;
        self.transition(ConnectionState::Disconnected);

        self.commands.close();
        let mut abandoned = 0usize;
        while let Some(command) = self.deferred.take().or_else(|| self.commands.try_recv().ok()) {
            if let WorkerCommand::Push(push) = command {
                abandoned += 1;
                self.resolve(push.on_ack, Err(BridgeError::Closed));
            }
        }

        if abandoned > 0 {
            warn!(abandoned, "Pushes abandoned at close");
        }
        debug!("Connection worker stopped");
    }
}
