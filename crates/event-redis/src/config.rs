//! Configuration for event-redis.

use crate::error::{BridgeError, BridgeResult};
use redis::{ConnectionAddr, IntoConnectionInfo};
use std::net::IpAddr;
use std::time::Duration;

/// Default store hostname.
pub const DEFAULT_HOSTNAME: &str = "localhost";
/// Default store port.
pub const DEFAULT_PORT: u16 = 6379;
/// Default list the events are pushed onto.
pub const DEFAULT_QUEUE_NAME: &str = "fs";
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Deadline given to the final flush when the host unloads the bridge.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_millis(1000);

/// Where the events go. Never mutated once a manager owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Store hostname or IP address
    pub host: String,

    /// Store port
    pub port: u16,

    /// Name of the list events are pushed onto
    pub queue_name: String,

    /// Upper bound on a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl EndpointConfig {
    /// Reject endpoints a connection attempt could never be started for.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.host.is_empty() {
            return Err(BridgeError::Config("hostname must not be empty".to_string()));
        }
        if self.host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(BridgeError::Config(format!(
                "invalid hostname {:?}",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(BridgeError::Config("port must be non-zero".to_string()));
        }
        if self.queue_name.is_empty() {
            return Err(BridgeError::Config("queue name must not be empty".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(BridgeError::Config(
                "connect timeout must be non-zero".to_string(),
            ));
        }
        self.check_url()
    }

    /// The redis client must read back exactly this host and port, with no
    /// credentials smuggled in through the hostname.
    fn check_url(&self) -> BridgeResult<()> {
        let invalid = || BridgeError::Config(format!("invalid hostname {:?}", self.host));

        let info = self.redis_url().into_connection_info().map_err(|_| invalid())?;
        if info.redis.username.is_some() || info.redis.password.is_some() {
            return Err(invalid());
        }
        match &info.addr {
            ConnectionAddr::Tcp(host, port) if *port == self.port && self.same_host(host) => Ok(()),
            _ => Err(invalid()),
        }
    }

    fn same_host(&self, parsed: &str) -> bool {
        let unbracket = |h: &str| h.trim_start_matches('[').trim_end_matches(']').to_string();
        match (
            unbracket(&self.host).parse::<IpAddr>(),
            unbracket(parsed).parse::<IpAddr>(),
        ) {
            (Ok(ours), Ok(theirs)) => ours == theirs,
            _ => self.host.eq_ignore_ascii_case(parsed),
        }
    }

    /// Connection URL understood by the redis client.
    pub fn redis_url(&self) -> String {
        if self.host.contains(':') {
            format!("redis://[{}]:{}/", self.host, self.port)
        } else {
            format!("redis://{}:{}/", self.host, self.port)
        }
    }
}

/// What the worker does after the link drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Stay disconnected until `connect` is called again.
    #[default]
    Never,

    /// Retry with exponential backoff.
    Backoff {
        /// Delay before the first retry
        initial: Duration,
        /// Cap on the delay between retries
        max: Duration,
        /// Attempts before giving up
        max_attempts: u32,
    },
}

impl ReconnectPolicy {
    /// Backoff with the defaults used by `EVENT_REDIS_RECONNECT=backoff`.
    pub fn backoff() -> Self {
        ReconnectPolicy::Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Backoff {
                initial,
                max,
                max_attempts,
            } => {
                if attempt == 0 || attempt > max_attempts {
                    return None;
                }
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                Some(initial.saturating_mul(factor).min(max))
            }
        }
    }
}

/// Full bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Store endpoint and target queue
    pub endpoint: EndpointConfig,

    /// Upper bound on one pipelined round trip before the link counts as dropped
    pub command_timeout: Duration,

    /// PING interval while idle; zero disables the health check
    pub health_check_interval: Duration,

    /// Maximum pushes committed in one pipeline
    pub max_pipeline: usize,

    /// Deadline for the final flush on shutdown
    pub shutdown_deadline: Duration,

    /// Behavior after a dropped link
    pub reconnect: ReconnectPolicy,

    /// Outstanding pushes at which a backlog warning is logged; zero disables it
    pub backlog_warning: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            command_timeout: Duration::from_millis(5000),
            health_check_interval: Duration::from_millis(5000),
            max_pipeline: 64,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            reconnect: ReconnectPolicy::Never,
            backlog_warning: 10_000,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `EVENT_REDIS_*` environment variables.
    ///
    /// Values that fail to parse fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`BridgeConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let endpoint = EndpointConfig {
            host: lookup("EVENT_REDIS_HOSTNAME").unwrap_or(defaults.endpoint.host),
            port: lookup("EVENT_REDIS_PORT")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.endpoint.port),
            queue_name: lookup("EVENT_REDIS_QUEUE").unwrap_or(defaults.endpoint.queue_name),
            connect_timeout: millis(
                "EVENT_REDIS_CONNECT_TIMEOUT_MS",
                defaults.endpoint.connect_timeout,
            ),
        };

        let reconnect = match lookup("EVENT_REDIS_RECONNECT").as_deref().map(str::trim) {
            Some("backoff") => ReconnectPolicy::backoff(),
            _ => ReconnectPolicy::Never,
        };

        Self {
            endpoint,
            command_timeout: millis("EVENT_REDIS_COMMAND_TIMEOUT_MS", defaults.command_timeout),
            health_check_interval: millis(
                "EVENT_REDIS_HEALTH_CHECK_MS",
                defaults.health_check_interval,
            ),
            max_pipeline: lookup("EVENT_REDIS_MAX_PIPELINE")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.max_pipeline),
            shutdown_deadline: millis("EVENT_REDIS_SHUTDOWN_MS", defaults.shutdown_deadline),
            reconnect,
            backlog_warning: lookup("EVENT_REDIS_BACKLOG_WARN")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.backlog_warning),
        }
    }

    /// Validate the endpoint and the worker tuning knobs.
    pub fn validate(&self) -> BridgeResult<()> {
        self.endpoint.validate()?;
        if self.command_timeout.is_zero() {
            return Err(BridgeError::Config(
                "command timeout must be non-zero".to_string(),
            ));
        }
        if self.max_pipeline == 0 {
            return Err(BridgeError::Config(
                "max pipeline must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
