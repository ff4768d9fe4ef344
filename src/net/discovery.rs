//! Local network discovery using Iroh's built-in mDNS.
//!
//! The host endpoint is created with `.discovery_local_network()`, so Iroh
//! already broadcasts our presence and browses for other nodes. This module
//! narrows that down to chat peers:
//! - our service namespace is published as the endpoint's discovery user data
//! - nodes advertising a different namespace (or none) are ignored
//! - our own announcements are ignored
//!
//! Every accepted peer is pushed onto a dial queue. The gossip layer drains
//! that queue and connects to each peer; a failed connect is logged and
//! never stops discovery.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use iroh::node_info::UserData;
use iroh::{NodeAddr, NodeId};
use smallvec::SmallVec;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::host::Host;
use crate::config::NetConfig;

/// Capacity of the queue between discovery and the dialler.
pub const DIAL_QUEUE_CAPACITY: usize = 128;

/// Maximum number of addresses to store inline (typical peers have 1-2 addresses).
const INLINE_ADDRS: usize = 4;

/// Errors that can occur when starting discovery
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// The service namespace could not be registered
    #[error("failed to register service namespace {namespace:?}: {reason}")]
    Namespace { namespace: Arc<str>, reason: Arc<str> },

    /// The host was already shut down
    #[error("host has been shut down")]
    HostShutdown,
}

impl DiscoveryError {
    fn namespace(namespace: &str, reason: impl Into<String>) -> Self {
        Self::Namespace {
            namespace: Arc::from(namespace),
            reason: Arc::from(reason.into()),
        }
    }
}

/// A chat peer found on the local network.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// The peer's node ID (public key).
    pub node_id: NodeId,
    /// Direct addresses announced by the peer.
    addresses: Arc<[SocketAddr]>,
    /// When the announcement was received.
    pub found_at: Instant,
}

impl DiscoveredPeer {
    /// Creates a new `DiscoveredPeer`.
    #[inline]
    pub fn new(node_id: NodeId, addresses: Arc<[SocketAddr]>) -> Self {
        Self {
            node_id,
            addresses,
            found_at: Instant::now(),
        }
    }

    /// Returns the peer's addresses as a slice.
    #[inline]
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// Convert to an Iroh NodeAddr for connecting.
    #[inline]
    pub fn to_node_addr(&self) -> NodeAddr {
        let addrs: SmallVec<[SocketAddr; INLINE_ADDRS]> =
            self.addresses.iter().copied().collect();
        NodeAddr::new(self.node_id).with_direct_addresses(addrs)
    }
}

/// Decides which discovered nodes are chat peers worth dialling.
#[derive(Debug, Clone)]
struct PeerFilter {
    local: NodeId,
    namespace: Arc<str>,
}

impl PeerFilter {
    fn admits(&self, node_id: NodeId, advertised: Option<&str>) -> bool {
        if node_id == self.local {
            return false;
        }
        advertised == Some(&*self.namespace)
    }
}

/// Validates the namespace and converts it to discovery user data.
fn namespace_user_data(namespace: &str) -> Result<UserData, DiscoveryError> {
    if namespace.is_empty() {
        return Err(DiscoveryError::namespace(namespace, "namespace is empty"));
    }
    UserData::try_from(namespace.to_string())
        .map_err(|e| DiscoveryError::namespace(namespace, e.to_string()))
}

/// Running local-network discovery for one host.
///
/// Stops when [`Discovery::stop`] is called, when the token passed to
/// [`Discovery::start`] is cancelled, or when this value is dropped.
#[derive(Debug)]
pub struct Discovery {
    namespace: Arc<str>,
    dial_queue: Option<mpsc::Receiver<DiscoveredPeer>>,
    found: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Discovery {
    /// Registers the host under the configured namespace and starts
    /// watching for peers.
    ///
    /// # Errors
    ///
    /// Only namespace registration can fail. Individual peers never abort
    /// discovery.
    #[instrument(skip_all, fields(namespace = %config.namespace))]
    pub fn start(
        host: &Host,
        config: &NetConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        if !host.is_running() {
            return Err(DiscoveryError::HostShutdown);
        }

        let user_data = namespace_user_data(&config.namespace)?;
        let endpoint = host.endpoint().clone();
        endpoint.set_user_data_for_discovery(Some(user_data));

        let namespace: Arc<str> = Arc::from(config.namespace.as_str());
        let filter = PeerFilter {
            local: host.node_id(),
            namespace: Arc::clone(&namespace),
        };
        let (tx, rx) = mpsc::channel(DIAL_QUEUE_CAPACITY);
        let found = Arc::new(AtomicUsize::new(0));
        let cancel = cancel.child_token();

        let task = {
            let found = Arc::clone(&found);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let items = endpoint.discovery_stream().map(|item| {
                    item.map(|item| {
                        let advertised = item.user_data().map(|data| data.to_string());
                        let addresses: Arc<[SocketAddr]> = item
                            .to_node_addr()
                            .direct_addresses
                            .into_iter()
                            .collect::<Vec<_>>()
                            .into();
                        (item.node_id(), advertised, addresses)
                    })
                });
                run_discovery(items, filter, tx, found, cancel).await;
            })
        };

        info!("Local network discovery started");

        Ok(Self {
            namespace,
            dial_queue: Some(rx),
            found,
            cancel,
            task,
        })
    }

    /// Takes the queue of peers to dial. Only the first call returns it.
    pub fn take_dial_queue(&mut self) -> Option<mpsc::Receiver<DiscoveredPeer>> {
        self.dial_queue.take()
    }

    /// Returns the namespace this host is registered under.
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the number of distinct chat peers seen so far.
    #[inline]
    pub fn peer_count(&self) -> usize {
        self.found.load(Ordering::Relaxed)
    }

    /// Returns true once the background task has exited.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the background task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Consumes discovery items and forwards admitted peers to the dial queue.
async fn run_discovery<S, E>(
    items: S,
    filter: PeerFilter,
    tx: mpsc::Sender<DiscoveredPeer>,
    found: Arc<AtomicUsize>,
    cancel: CancellationToken,
) where
    S: futures::Stream<Item = Result<(NodeId, Option<String>, Arc<[SocketAddr]>), E>>,
    E: std::fmt::Debug,
{
    futures::pin_mut!(items);
    let mut seen: HashSet<NodeId> = HashSet::new();

    loop {
        let item = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Discovery task shutting down");
                break;
            }

            item = items.next() => item,
        };

        let (node_id, advertised, addresses) = match item {
            Some(Ok(item)) => item,
            Some(Err(err)) => {
                warn!(error = ?err, "Discovery stream lagged, some announcements were missed");
                continue;
            }
            None => {
                debug!("Discovery stream ended");
                break;
            }
        };

        if !filter.admits(node_id, advertised.as_deref()) {
            debug!(node_id = %node_id, "Ignoring announcement");
            continue;
        }

        if seen.insert(node_id) {
            found.store(seen.len(), Ordering::Relaxed);
            info!(node_id = %node_id, addresses = ?addresses, "Found chat peer");
        }

        match tx.try_send(DiscoveredPeer::new(node_id, addresses)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(peer)) => {
                warn!(node_id = %peer.node_id, "Dial queue full, dropping peer");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Dial queue closed");
                break;
            }
        }
    }
}
