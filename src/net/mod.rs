//! Networking layer for Hush
//!
//! Everything between the chat layer and the wire:
//!
//! - **Host**: per-process identity and the iroh endpoint plus gossip router
//! - **Discovery**: local-network peer discovery via mDNS, filtered by namespace
//! - **PubSub**: the shared gossip topic, with publish and a cancellable subscription
//! - **Wifi**: best-effort SSID lookup for the status line
//!
//! # Architecture
//!
//! The stack is built on [Iroh](https://iroh.computer/) with relays disabled,
//! so traffic never leaves the local network:
//! - mDNS announcements carry the chat namespace as discovery user data
//! - discovered peers are fed to the gossip layer through a bounded dial queue
//! - all chat traffic is end-to-end encrypted QUIC between peers
//!
//! # Example
//!
//! ```rust,ignore
//! use hush::config::NetConfig;
//! use hush::net::{pubsub, Discovery, Host};
//!
//! let config = NetConfig::default();
//! let cancel = CancellationToken::new();
//! let host = Host::create(&config).await?;
//! let mut discovery = Discovery::start(&host, &config, &cancel)?;
//! let (publisher, subscription) =
//!     pubsub::join(&cancel, &host, discovery.take_dial_queue(), &config)?;
//! ```

pub mod discovery;
pub mod host;
pub mod pubsub;
pub mod wifi;

pub use discovery::{DiscoveredPeer, Discovery, DiscoveryError};
pub use host::{Host, HostError};
pub use pubsub::{Broadcast, PubSubError, Subscription, SubscriptionError, TopicPublisher};
