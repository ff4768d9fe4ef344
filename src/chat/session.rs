//! Chat session: codec and self-filter on top of a joined topic.
//!
//! A session publishes [`ChatMessage`]s and turns the raw topic subscription
//! into a stream of decoded messages from other peers.
//!
//! # Local echo
//!
//! The topic never hands a peer its own broadcasts back, and the receive
//! loop drops anything delivered by our own node id. Whoever calls
//! [`ChatSession::publish`] is responsible for showing the sent message
//! locally.

use std::sync::Arc;

use bytes::Bytes;
use iroh::NodeId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use super::message::{ChatMessage, CodecError};
use super::monitor::PeerCount;
use crate::config::DEFAULT_DELIVERY_CAPACITY;
use crate::net::discovery::Discovery;
use crate::net::host::Host;
use crate::net::pubsub::{Broadcast, InboundMessage, Subscription, TopicPublisher};

/// Errors returned by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Publish(#[from] crate::net::pubsub::PubSubError),

    /// The message stream was already handed out
    #[error("session is already listening for messages")]
    AlreadyListening,
}

/// Network resources a bootstrapped session keeps alive.
#[derive(Debug)]
pub(crate) struct SessionResources {
    pub(crate) host: Arc<Host>,
    pub(crate) discovery: Discovery,
    pub(crate) cancel: CancellationToken,
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A joined chat topic with a codec and self-filter.
#[derive(Debug)]
pub struct ChatSession<B: Broadcast = TopicPublisher> {
    node_id: NodeId,
    publisher: B,
    subscription: Option<Subscription>,
    delivery_capacity: usize,
    resources: Option<SessionResources>,
}

impl<B: Broadcast> ChatSession<B> {
    /// Wraps a publisher and subscription for the peer `node_id`.
    pub fn new(node_id: NodeId, publisher: B, subscription: Subscription) -> Self {
        Self {
            node_id,
            publisher,
            subscription: Some(subscription),
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
            resources: None,
        }
    }

    /// Sets the delivery buffer capacity used by [`Self::listen_for_messages`].
    pub fn with_delivery_capacity(mut self, capacity: usize) -> Self {
        self.delivery_capacity = capacity.max(1);
        self
    }

    pub(crate) fn with_resources(mut self, resources: SessionResources) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Returns the local peer id used for self-filtering.
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns the number of topic neighbours right now. Never blocks.
    #[inline]
    pub fn peer_count(&self) -> usize {
        self.publisher.peer_count()
    }

    /// Returns the number of chat peers discovery has seen, if this session
    /// owns a discovery service.
    pub fn discovered_peers(&self) -> Option<usize> {
        self.resources.as_ref().map(|r| r.discovery.peer_count())
    }

    /// Publishes a message stamped with the current time.
    ///
    /// The message is not delivered to this session's own stream.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the payload cannot be queued.
    /// Nothing is retried.
    #[instrument(skip(self, content), fields(len = content.len()))]
    pub async fn publish(&self, sender: &str, content: &str) -> Result<(), SessionError> {
        let msg = ChatMessage::new(sender, content);
        let bytes = msg.encode()?;
        self.publisher.publish(Bytes::from(bytes)).await?;
        debug!("Message published");
        Ok(())
    }

    /// Starts the receive loop and returns the stream of inbound messages.
    ///
    /// The stream closes when `cancel` fires or the subscription ends; it is
    /// never restarted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyListening`] on every call after the first.
    pub fn listen_for_messages(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatMessage>, SessionError> {
        let subscription = self
            .subscription
            .take()
            .ok_or(SessionError::AlreadyListening)?;

        let (tx, rx) = mpsc::channel(self.delivery_capacity);
        tokio::spawn(receive_loop(subscription, self.node_id, tx, cancel));

        info!(capacity = self.delivery_capacity, "Listening for messages");
        Ok(rx)
    }

    /// Stops background tasks and releases the host, if this session owns one.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(resources) = &self.resources {
            resources.cancel.cancel();
            resources.discovery.stop();
            resources.host.shutdown().await;
        }
    }
}

impl<B: Broadcast> PeerCount for ChatSession<B> {
    #[inline]
    fn peer_count(&self) -> usize {
        ChatSession::peer_count(self)
    }
}

/// Decodes an inbound payload unless it came from us or is malformed.
fn accept_inbound(local: NodeId, raw: &InboundMessage) -> Option<ChatMessage> {
    if raw.delivered_from == local {
        return None;
    }
    ChatMessage::decode(&raw.content)
}

/// Sole reader of the subscription and sole writer of the delivery buffer.
async fn receive_loop(
    mut subscription: Subscription,
    local: NodeId,
    tx: mpsc::Sender<ChatMessage>,
    cancel: CancellationToken,
) {
    loop {
        let raw = match subscription.next(&cancel).await {
            Ok(raw) => raw,
            Err(reason) => {
                debug!(%reason, "Receive loop stopping");
                break;
            }
        };

        let Some(msg) = accept_inbound(local, &raw) else {
            trace!(from = %raw.delivered_from, "Skipping own or malformed payload");
            continue;
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            sent = tx.send(msg) => {
                if sent.is_err() {
                    debug!("Message stream dropped, receive loop stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::chat::message::unix_now;
    use crate::net::host::generate_identity;
    use crate::net::pubsub::PubSubError;

    const WAIT: Duration = Duration::from_secs(5);

    /// In-memory topic: each publish is delivered to every other member.
    #[derive(Clone, Default)]
    struct Hub {
        members: Arc<Mutex<Vec<(NodeId, mpsc::Sender<InboundMessage>)>>>,
    }

    impl Hub {
        fn session(&self, node_id: NodeId) -> ChatSession<HubPublisher> {
            let (tx, rx) = mpsc::channel(64);
            self.members.lock().push((node_id, tx));
            let publisher = HubPublisher {
                node_id,
                hub: self.clone(),
                fail: false,
            };
            ChatSession::new(node_id, publisher, Subscription::new(rx))
        }

        /// Delivers raw bytes to every member, as if forwarded by `from`.
        async fn inject(&self, from: NodeId, content: Bytes) {
            let targets: Vec<_> = self.members.lock().iter().map(|(_, tx)| tx.clone()).collect();
            for tx in targets {
                let _ = tx
                    .send(InboundMessage {
                        delivered_from: from,
                        content: content.clone(),
                    })
                    .await;
            }
        }
    }

    struct HubPublisher {
        node_id: NodeId,
        hub: Hub,
        fail: bool,
    }

    #[async_trait]
    impl Broadcast for HubPublisher {
        async fn publish(&self, data: Bytes) -> Result<(), PubSubError> {
            if self.fail {
                return Err(PubSubError::Publish(Arc::from("queue closed")));
            }
            let targets: Vec<_> = self
                .hub
                .members
                .lock()
                .iter()
                .filter(|(id, _)| *id != self.node_id)
                .map(|(_, tx)| tx.clone())
                .collect();
            for tx in targets {
                let _ = tx
                    .send(InboundMessage {
                        delivered_from: self.node_id,
                        content: data.clone(),
                    })
                    .await;
            }
            Ok(())
        }

        fn peer_count(&self) -> usize {
            self.hub.members.lock().len().saturating_sub(1)
        }
    }

    /// Publisher that reports a fixed neighbour count.
    struct CountingPublisher(Arc<AtomicUsize>);

    #[async_trait]
    impl Broadcast for CountingPublisher {
        async fn publish(&self, _data: Bytes) -> Result<(), PubSubError> {
            Ok(())
        }

        fn peer_count(&self) -> usize {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn test_node_id() -> NodeId {
        generate_identity().unwrap().public()
    }

    #[tokio::test]
    async fn test_delivery_between_sessions() {
        let hub = Hub::default();
        let a = hub.session(test_node_id());
        let mut b = hub.session(test_node_id());
        let mut stream = b.listen_for_messages(CancellationToken::new()).unwrap();

        let published_at = unix_now();
        a.publish("alice", "hello there").await.unwrap();

        let msg = tokio::time::timeout(WAIT, stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender(), "alice");
        assert_eq!(msg.content(), "hello there");
        assert!((msg.timestamp() - published_at).abs() <= 1);
    }

    #[tokio::test]
    async fn test_own_messages_are_not_delivered() {
        let hub = Hub::default();
        let me = test_node_id();
        let mut session = hub.session(me);
        let mut stream = session.listen_for_messages(CancellationToken::new()).unwrap();

        session.publish("me", "echo?").await.unwrap();
        // even a payload explicitly delivered by our own node id is dropped
        let own = ChatMessage::new("me", "looped back").encode().unwrap();
        hub.inject(me, Bytes::from(own)).await;

        let result = tokio::time::timeout(Duration::from_millis(300), stream.recv()).await;
        assert!(result.is_err(), "no message should arrive");
    }

    #[tokio::test]
    async fn test_self_filter_uses_node_id_not_sender_name() {
        let hub = Hub::default();
        let me = test_node_id();
        let other = test_node_id();
        let mut session = hub.session(me);
        let mut stream = session.listen_for_messages(CancellationToken::new()).unwrap();

        let payload = ChatMessage::new("same-name", "from someone else").encode().unwrap();
        hub.inject(other, Bytes::from(payload)).await;

        let msg = tokio::time::timeout(WAIT, stream.recv()).await.unwrap().unwrap();
        assert_eq!(msg.sender(), "same-name");
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_skipped() {
        let hub = Hub::default();
        let other = test_node_id();
        let mut session = hub.session(test_node_id());
        let mut stream = session.listen_for_messages(CancellationToken::new()).unwrap();

        hub.inject(other, Bytes::from_static(b"\x00\x01garbage")).await;
        hub.inject(other, Bytes::from_static(b"{\"sender\":1}")).await;
        let good = ChatMessage::new("bob", "still alive").encode().unwrap();
        hub.inject(other, Bytes::from(good)).await;

        let msg = tokio::time::timeout(WAIT, stream.recv()).await.unwrap().unwrap();
        assert_eq!(msg.content(), "still alive");
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let hub = Hub::default();
        let a = hub.session(test_node_id());
        let mut b = hub.session(test_node_id());
        let mut stream = b.listen_for_messages(CancellationToken::new()).unwrap();

        for i in 0..20 {
            a.publish("alice", &i.to_string()).await.unwrap();
        }

        for i in 0..20 {
            let msg = tokio::time::timeout(WAIT, stream.recv()).await.unwrap().unwrap();
            assert_eq!(msg.content(), i.to_string());
        }
    }

    #[tokio::test]
    async fn test_second_listen_is_rejected() {
        let hub = Hub::default();
        let mut session = hub.session(test_node_id());
        let _stream = session.listen_for_messages(CancellationToken::new()).unwrap();

        let err = session
            .listen_for_messages(CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyListening));
    }

    #[tokio::test]
    async fn test_cancel_closes_stream_with_full_buffer() {
        let hub = Hub::default();
        let other = test_node_id();
        let mut session = hub.session(test_node_id()).with_delivery_capacity(2);
        let cancel = CancellationToken::new();
        let mut stream = session.listen_for_messages(cancel.clone()).unwrap();

        for i in 0..6 {
            let payload = ChatMessage::new("bob", i.to_string()).encode().unwrap();
            hub.inject(other, Bytes::from(payload)).await;
        }
        // let the loop fill the buffer and block on it
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(WAIT, async {
            while stream.recv().await.is_some() {}
        })
        .await
        .expect("stream should close after cancellation");
    }

    #[tokio::test]
    async fn test_stream_closes_when_subscription_ends() {
        let (tx, rx) = mpsc::channel(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut session = ChatSession::new(
            test_node_id(),
            CountingPublisher(counter),
            Subscription::new(rx),
        );
        let mut stream = session.listen_for_messages(CancellationToken::new()).unwrap();

        drop(tx);
        let next = tokio::time::timeout(WAIT, stream.recv()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_publish_error_is_returned() {
        let hub = Hub::default();
        let node_id = test_node_id();
        let (_tx, rx) = mpsc::channel(1);
        let session = ChatSession::new(
            node_id,
            HubPublisher {
                node_id,
                hub,
                fail: true,
            },
            Subscription::new(rx),
        );

        let err = session.publish("a", "b").await.unwrap_err();
        assert!(matches!(err, SessionError::Publish(_)));
        assert!(err.to_string().contains("queue closed"));
    }

    #[tokio::test]
    async fn test_peer_count_snapshot() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::channel(1);
        let session = ChatSession::new(
            test_node_id(),
            CountingPublisher(Arc::clone(&counter)),
            Subscription::new(rx),
        );

        assert_eq!(session.peer_count(), 0);
        counter.store(3, Ordering::Relaxed);
        assert_eq!(session.peer_count(), 3);
        assert_eq!(session.discovered_peers(), None);
    }

    #[tokio::test]
    async fn test_isolated_hub_session_has_no_peers() {
        let hub = Hub::default();
        let a = hub.session(test_node_id());
        assert_eq!(a.peer_count(), 0);

        let b = hub.session(test_node_id());
        assert!(a.peer_count() >= 1);
        assert!(b.peer_count() >= 1);
    }
}
