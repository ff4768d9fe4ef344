//! Hush - serverless chat for the local network
//!
//! Peers on the same network find each other over mDNS and exchange short
//! JSON messages on a shared gossip topic. There is no server, no account
//! and no history: identities are generated per process and nothing is
//! stored on disk.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`]: network settings and environment overrides
//! - [`net`]: host identity, discovery and the gossip topic, built on Iroh
//! - [`chat`]: message codec, chat session, bootstrap and peer monitoring
//! - [`app`]: shared state for the terminal front end
//!
//! # Example
//!
//! ```rust,ignore
//! use hush::chat::bootstrap;
//! use hush::config::NetConfig;
//!
//! let mut session = bootstrap(NetConfig::from_env()).wait().await?;
//! let mut messages = session.listen_for_messages(cancel.clone())?;
//! session.publish("Ghost-42", "hello").await?;
//! while let Some(msg) = messages.recv().await {
//!     println!("{}: {}", msg.sender(), msg.content());
//! }
//! ```

pub mod app;
pub mod chat;
pub mod config;
pub mod net;

pub use app::ChatState;
pub use chat::{ChatMessage, ChatSession};
pub use config::NetConfig;
