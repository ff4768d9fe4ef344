//! Chat layer on top of the gossip topic
//!
//! - [`message`]: the JSON wire message
//! - [`session`]: publish, self-filter and the inbound message stream
//! - [`bootstrap`]: one-shot setup of the whole stack
//! - [`monitor`]: peer-count polling for status displays

pub mod bootstrap;
pub mod message;
pub mod monitor;
pub mod session;

pub use bootstrap::{bootstrap, Bootstrap, BootstrapError, Bootstrapper, ReadinessState};
pub use message::{ChatMessage, CodecError};
pub use monitor::{PeerCount, PeerCountMonitor};
pub use session::{ChatSession, SessionError};
