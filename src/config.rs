//! Network configuration shared by every stage of the chat pipeline.
//!
//! All participants on a network must agree on [`DEFAULT_TOPIC`] and
//! [`DEFAULT_NAMESPACE`] out of band. The environment overrides exist so
//! several isolated instances can run on one machine:
//!
//! ```bash
//! HUSH_TOPIC=test-a HUSH_NAMESPACE=_hush-test cargo run
//! ```

use std::time::Duration;

use tracing::warn;

/// Topic every session joins.
pub const DEFAULT_TOPIC: &str = "local-gc";

/// Service namespace advertised over local-network discovery.
pub const DEFAULT_NAMESPACE: &str = "_ghost-chat-wifi";

/// Capacity of the delivery buffer between the receive loop and the consumer.
pub const DEFAULT_DELIVERY_CAPACITY: usize = 32;

/// Upper bound on a single peer connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the peer count is refreshed for presentation.
pub const DEFAULT_PEER_POLL_INTERVAL: Duration = Duration::from_secs(1);

const ENV_TOPIC: &str = "HUSH_TOPIC";
const ENV_NAMESPACE: &str = "HUSH_NAMESPACE";
const ENV_PORT: &str = "HUSH_PORT";
const ENV_CONNECT_TIMEOUT_MS: &str = "HUSH_CONNECT_TIMEOUT_MS";

/// Configuration for the host, discovery and pub/sub stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// Name of the single shared topic
    pub topic: String,
    /// Local-network discovery namespace
    pub namespace: String,
    /// Preferred UDP port, 0 for an ephemeral port.
    ///
    /// Not a guarantee: if the port is taken the endpoint binds a random one
    /// instead. Read the actual port from `Host::bound_port`.
    pub port: u16,
    /// Delivery buffer capacity for `listen_for_messages`
    pub delivery_capacity: usize,
    /// Bound on each peer connect attempt made for discovered peers
    pub connect_timeout: Duration,
    /// Peer count refresh interval
    pub peer_poll_interval: Duration,
}

impl Default for NetConfig {
    #[inline]
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            port: 0,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            peer_poll_interval: DEFAULT_PEER_POLL_INTERVAL,
        }
    }
}

impl NetConfig {
    /// Builds a configuration from the defaults plus `HUSH_*` environment overrides.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`.
    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(topic) = lookup(ENV_TOPIC).filter(|t| !t.is_empty()) {
            self.topic = topic;
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE).filter(|n| !n.is_empty()) {
            self.namespace = namespace;
        }
        if let Some(raw) = lookup(ENV_PORT) {
            match raw.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!(value = %raw, "Ignoring invalid {ENV_PORT}"),
            }
        }
        if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => self.connect_timeout = Duration::from_millis(ms),
                _ => warn!(value = %raw, "Ignoring invalid {ENV_CONNECT_TIMEOUT_MS}"),
            }
        }
        self
    }
}
