//! Host identity and the iroh network stack
//!
//! A [`Host`] owns everything the rest of the pipeline talks to on the
//! network:
//! - a fresh Ed25519 identity, generated per process and never persisted
//! - an iroh endpoint bound on all interfaces with an ephemeral port
//! - the gossip router and the protocol router that accepts gossip traffic
//!
//! Relays are disabled, so the host only ever reaches peers on the local
//! network. Dropping the host does not release the sockets; call
//! [`Host::shutdown`] when the process ends.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use iroh::protocol::Router;
use iroh::{Endpoint as IrohEndpoint, NodeId, RelayMode, SecretKey};
use iroh_gossip::net::Gossip;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::NetConfig;

/// Errors that can occur while creating the host
#[derive(Error, Debug, Clone)]
pub enum HostError {
    /// The OS random source could not produce key material
    #[error("failed to generate identity: {0}")]
    KeyGeneration(Arc<str>),

    /// The endpoint could not bind its sockets
    #[error("failed to bind endpoint: {0}")]
    Bind(Arc<str>),

    /// The gossip router could not be started
    #[error("failed to start gossip router: {0}")]
    Router(Arc<str>),
}

impl HostError {
    #[inline]
    fn key_generation(msg: impl Into<String>) -> Self {
        Self::KeyGeneration(Arc::from(msg.into()))
    }

    #[inline]
    fn bind(msg: impl Into<String>) -> Self {
        Self::Bind(Arc::from(msg.into()))
    }

    #[inline]
    fn router(msg: impl Into<String>) -> Self {
        Self::Router(Arc::from(msg.into()))
    }
}

/// Generates a new Ed25519 identity from the operating system's CSPRNG.
pub fn generate_identity() -> Result<SecretKey, HostError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| HostError::key_generation(e.to_string()))?;
    Ok(SecretKey::from_bytes(&bytes))
}

/// The local peer: identity, endpoint and routers.
///
/// Other components hold a reference to the host and only request
/// operations on it; they never rebuild or mutate the stack themselves.
#[derive(Debug)]
pub struct Host {
    node_id: NodeId,
    endpoint: IrohEndpoint,
    gossip: Gossip,
    router: Router,
    shut_down: AtomicBool,
}

impl Host {
    /// Creates a host with a freshly generated identity.
    ///
    /// # Errors
    ///
    /// Fails if key generation, binding or starting the gossip router fails.
    /// No partially built host is ever returned.
    #[instrument(name = "host_create", skip(config), fields(port = config.port))]
    pub async fn create(config: &NetConfig) -> Result<Self, HostError> {
        let secret_key = generate_identity()?;
        Self::with_secret_key(secret_key, config).await
    }

    /// Creates a host around an existing identity.
    pub async fn with_secret_key(
        secret_key: SecretKey,
        config: &NetConfig,
    ) -> Result<Self, HostError> {
        let node_id = secret_key.public();
        info!(node_id = %node_id, "Identity generated");

        let endpoint = IrohEndpoint::builder()
            .secret_key(secret_key)
            .relay_mode(RelayMode::Disabled)
            .discovery_local_network()
            .bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port))
            .bind()
            .await
            .map_err(|e| HostError::bind(e.to_string()))?;

        debug!("Endpoint bound");

        let gossip = match Gossip::builder().spawn(endpoint.clone()).await {
            Ok(gossip) => gossip,
            Err(e) => {
                endpoint.close().await;
                return Err(HostError::router(e.to_string()));
            }
        };
        let router = Router::builder(endpoint.clone())
            .accept(iroh_gossip::ALPN, gossip.clone())
            .spawn();

        info!(node_id = %node_id, "Host ready (relay disabled, local network only)");

        Ok(Self {
            node_id,
            endpoint,
            gossip,
            router,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Returns this peer's identifier.
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns the underlying iroh endpoint.
    #[inline]
    pub fn endpoint(&self) -> &IrohEndpoint {
        &self.endpoint
    }

    /// Returns the gossip router handle.
    #[inline]
    pub fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    /// Returns the local UDP port the endpoint is bound to.
    #[inline]
    pub fn bound_port(&self) -> u16 {
        let (ipv4_addr, _ipv6_addr) = self.endpoint.bound_sockets();
        ipv4_addr.port()
    }

    /// Checks if the host has not been shut down yet.
    #[inline]
    pub fn is_running(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire)
    }

    /// Closes the routers and the endpoint, releasing the sockets.
    ///
    /// Calling this more than once is a no-op.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            warn!("Attempted to shut down already shutdown host");
            return;
        }

        info!("Shutting down host");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = %e, "Protocol router did not shut down cleanly");
        }
        self.endpoint.close().await;
        info!("Host shut down");
    }
}
