//! Core application state.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::chat::{BootstrapError, ChatMessage, ReadinessState};
use crate::chat::message::unix_now;
use crate::net::wifi::UNKNOWN_SSID;

/// Default number of messages kept in the scrollback.
const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Returns a throwaway display name such as `Ghost-417`.
#[must_use]
pub fn default_username() -> String {
    format!("Ghost-{}", unix_now().rem_euclid(1000))
}

/// Shared chat state read by the terminal front end.
#[derive(Clone)]
pub struct ChatState {
    inner: Arc<RwLock<ChatStateInner>>,
}

struct ChatStateInner {
    /// Display name attached to outgoing messages.
    username: Arc<str>,
    readiness: ReadinessState,
    /// Scrollback, oldest first.
    history: VecDeque<ChatMessage>,
    history_capacity: usize,
    peer_count: usize,
    ssid: Arc<str>,
}

impl ChatState {
    /// Creates state for `username` with the default scrollback size.
    #[inline]
    #[must_use]
    pub fn new(username: impl AsRef<str>) -> Self {
        Self::with_capacity(username, DEFAULT_HISTORY_CAPACITY)
    }

    /// Creates state keeping at most `history_capacity` messages.
    #[must_use]
    pub fn with_capacity(username: impl AsRef<str>, history_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(ChatStateInner {
                username: Arc::from(username.as_ref()),
                readiness: ReadinessState::Connecting,
                history: VecDeque::with_capacity(history_capacity.min(64)),
                history_capacity,
                peer_count: 0,
                ssid: Arc::from(UNKNOWN_SSID),
            })),
        }
    }

    #[inline]
    #[must_use]
    pub fn username(&self) -> Arc<str> {
        Arc::clone(&self.inner.read().username)
    }

    #[inline]
    #[must_use]
    pub fn readiness(&self) -> ReadinessState {
        self.inner.read().readiness.clone()
    }

    /// Marks the session ready. Ignored once readiness is settled.
    pub fn set_ready(&self) -> bool {
        self.inner.write().readiness.resolve(ReadinessState::Ready)
    }

    /// Records a setup failure. Ignored once readiness is settled.
    pub fn set_failed(&self, error: &BootstrapError) -> bool {
        self.inner
            .write()
            .readiness
            .resolve(ReadinessState::Failed(error.to_string()))
    }

    /// Appends a message to the scrollback, evicting the oldest when full.
    pub fn push_message(&self, message: ChatMessage) {
        let mut inner = self.inner.write();
        if inner.history.len() == inner.history_capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(message);
    }

    /// Records a line we sent. Our own broadcasts never come back from the
    /// topic, so this is the only place they show up.
    pub fn push_own(&self, content: impl Into<String>) -> ChatMessage {
        let message = ChatMessage::new(&*self.username(), content);
        self.push_message(message.clone());
        message
    }

    /// Returns the scrollback as a frozen slice, oldest first.
    #[must_use]
    pub fn history(&self) -> Box<[ChatMessage]> {
        self.inner.read().history.iter().cloned().collect()
    }

    #[inline]
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.inner.read().history.len()
    }

    #[inline]
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.read().peer_count
    }

    #[inline]
    pub fn set_peer_count(&self, count: usize) {
        self.inner.write().peer_count = count;
    }

    #[inline]
    #[must_use]
    pub fn ssid(&self) -> Arc<str> {
        Arc::clone(&self.inner.read().ssid)
    }

    #[inline]
    pub fn set_ssid(&self, ssid: impl AsRef<str>) {
        self.inner.write().ssid = Arc::from(ssid.as_ref());
    }

    /// One-line summary for the status bar.
    #[must_use]
    pub fn status_line(&self) -> String {
        let inner = self.inner.read();
        let status = match &inner.readiness {
            ReadinessState::Connecting => "connecting".to_string(),
            ReadinessState::Ready => match inner.peer_count {
                1 => "1 peer".to_string(),
                n => format!("{n} peers"),
            },
            ReadinessState::Failed(reason) => format!("offline ({reason})"),
        };
        format!("[{}] wifi: {} | {}", inner.username, inner.ssid, status)
    }
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new(default_username())
    }
}
