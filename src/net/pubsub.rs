//! Gossip publish/subscribe over the host's gossip router
//!
//! [`join`] subscribes to the shared topic and hands back two halves:
//! - a [`TopicPublisher`] used to broadcast payloads
//! - a [`Subscription`] with a blocking, cancellable [`Subscription::next`]
//!
//! Two background tasks keep the channel alive. The pump is the only reader
//! of the gossip event stream; it keeps the neighbour count current and
//! forwards received payloads into the subscription queue. The dialler
//! drains the discovery queue and joins each found peer into the topic,
//! bounding every attempt by the configured connect timeout.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use iroh::NodeId;
use iroh_gossip::net::{Event, GossipEvent, GossipSender};
use iroh_gossip::proto::TopicId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::discovery::DiscoveredPeer;
use super::host::Host;
use crate::config::NetConfig;

/// Capacity of the queue between the pump and the subscription reader.
pub const SUBSCRIPTION_CAPACITY: usize = 128;

/// Errors from joining or publishing to the topic
#[derive(Error, Debug, Clone)]
pub enum PubSubError {
    /// Subscribing to the topic failed
    #[error("failed to join topic {topic:?}: {reason}")]
    Join { topic: Arc<str>, reason: Arc<str> },

    /// The payload could not be handed to the gossip router
    #[error("failed to publish: {0}")]
    Publish(Arc<str>),

    /// The host was already shut down
    #[error("host has been shut down")]
    HostShutdown,
}

/// Why [`Subscription::next`] returned without a message
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription cancelled")]
    Cancelled,

    #[error("subscription closed")]
    Closed,
}

/// A raw payload received on the topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The neighbour that delivered the payload to us.
    pub delivered_from: NodeId,
    /// Undecoded payload bytes.
    pub content: Bytes,
}

/// Maps a topic name onto the 32-byte gossip topic id.
pub fn topic_id(name: &str) -> TopicId {
    TopicId::from_bytes(*blake3::hash(name.as_bytes()).as_bytes())
}

/// The sending half of a joined topic.
#[async_trait]
pub trait Broadcast: Send + Sync + 'static {
    /// Hands a payload to the overlay. Returns once it is queued locally.
    async fn publish(&self, data: Bytes) -> Result<(), PubSubError>;

    /// Returns the number of topic neighbours right now.
    fn peer_count(&self) -> usize;
}

/// Inbound side of a joined topic. Supports one reader at a time.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<InboundMessage>,
}

impl Subscription {
    /// Wraps a queue of inbound messages.
    pub fn new(rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self { rx }
    }

    /// Waits for the next inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Cancelled`] once `cancel` fires and
    /// [`SubscriptionError::Closed`] when the topic stream has ended.
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<InboundMessage, SubscriptionError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(SubscriptionError::Cancelled),
            msg = self.rx.recv() => msg.ok_or(SubscriptionError::Closed),
        }
    }
}

/// Publishes to the topic through the gossip router.
#[derive(Debug, Clone)]
pub struct TopicPublisher {
    sender: GossipSender,
    neighbors: Arc<AtomicUsize>,
}

#[async_trait]
impl Broadcast for TopicPublisher {
    async fn publish(&self, data: Bytes) -> Result<(), PubSubError> {
        self.sender
            .broadcast(data)
            .await
            .map_err(|e| PubSubError::Publish(Arc::from(e.to_string())))
    }

    #[inline]
    fn peer_count(&self) -> usize {
        self.neighbors.load(Ordering::Relaxed)
    }
}

/// Topic events the pump cares about.
#[derive(Debug)]
enum TopicEvent {
    NeighborUp(NodeId),
    NeighborDown(NodeId),
    Received(InboundMessage),
    Lagged,
}

impl TopicEvent {
    fn from_gossip(event: Event) -> Vec<Self> {
        match event {
            Event::Gossip(GossipEvent::Joined(peers)) => {
                peers.into_iter().map(TopicEvent::NeighborUp).collect()
            }
            Event::Gossip(GossipEvent::NeighborUp(peer)) => vec![TopicEvent::NeighborUp(peer)],
            Event::Gossip(GossipEvent::NeighborDown(peer)) => {
                vec![TopicEvent::NeighborDown(peer)]
            }
            Event::Gossip(GossipEvent::Received(msg)) => vec![TopicEvent::Received(InboundMessage {
                delivered_from: msg.delivered_from,
                content: msg.content,
            })],
            Event::Lagged => vec![TopicEvent::Lagged],
            #[allow(unreachable_patterns)]
            _ => Vec::new(),
        }
    }
}

/// Subscribes to the configured topic and starts the pump and dialler tasks.
///
/// Both tasks stop when `cancel` fires. `dial_queue` is the queue produced by
/// discovery; passing `None` joins the topic without dialling anyone.
#[instrument(skip_all, fields(topic = %config.topic))]
pub fn join(
    cancel: &CancellationToken,
    host: &Host,
    dial_queue: Option<mpsc::Receiver<DiscoveredPeer>>,
    config: &NetConfig,
) -> Result<(TopicPublisher, Subscription), PubSubError> {
    if !host.is_running() {
        return Err(PubSubError::HostShutdown);
    }

    let topic = host
        .gossip()
        .subscribe(topic_id(&config.topic), Vec::new())
        .map_err(|e| PubSubError::Join {
            topic: Arc::from(config.topic.as_str()),
            reason: Arc::from(e.to_string()),
        })?;
    let (sender, receiver) = topic.split();

    let neighbors = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

    let events = receiver.flat_map(|event| {
        let events = match event {
            Ok(event) => TopicEvent::from_gossip(event)
                .into_iter()
                .map(Ok)
                .collect::<Vec<_>>(),
            Err(e) => vec![Err(e.to_string())],
        };
        futures::stream::iter(events)
    });
    tokio::spawn(pump(events, Arc::clone(&neighbors), tx, cancel.clone()));

    if let Some(queue) = dial_queue {
        let endpoint = host.endpoint().clone();
        let dial_sender = sender.clone();
        tokio::spawn(dial_loop(
            queue,
            config.connect_timeout,
            cancel.clone(),
            move |peer: DiscoveredPeer| {
                let endpoint = endpoint.clone();
                let sender = dial_sender.clone();
                async move {
                    endpoint
                        .add_node_addr(peer.to_node_addr())
                        .context("failed to register peer address")?;
                    sender
                        .join_peers(vec![peer.node_id])
                        .await
                        .context("failed to join peer into topic")?;
                    Ok(())
                }
            },
        ));
    }

    info!("Joined topic");

    Ok((TopicPublisher { sender, neighbors }, Subscription::new(rx)))
}

/// Only reader of the topic event stream.
///
/// Ends on cancellation, on a stream error, or when the stream finishes;
/// dropping `tx` closes the subscription.
async fn pump<S>(
    events: S,
    neighbors: Arc<AtomicUsize>,
    tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<TopicEvent, String>>,
{
    futures::pin_mut!(events);
    let mut current: HashSet<NodeId> = HashSet::new();

    loop {
        let event = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Topic pump shutting down");
                break;
            }

            event = events.next() => event,
        };

        match event {
            Some(Ok(TopicEvent::NeighborUp(peer))) => {
                current.insert(peer);
                neighbors.store(current.len(), Ordering::Relaxed);
                debug!(peer = %peer, neighbors = current.len(), "Neighbor up");
            }
            Some(Ok(TopicEvent::NeighborDown(peer))) => {
                current.remove(&peer);
                neighbors.store(current.len(), Ordering::Relaxed);
                debug!(peer = %peer, neighbors = current.len(), "Neighbor down");
            }
            Some(Ok(TopicEvent::Received(msg))) => {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    sent = tx.send(msg) => {
                        if sent.is_err() {
                            debug!("Subscription dropped, stopping pump");
                            break;
                        }
                    }
                }
            }
            Some(Ok(TopicEvent::Lagged)) => {
                warn!("Topic subscriber lagged, some messages were dropped");
            }
            Some(Err(e)) => {
                warn!(error = %e, "Topic stream failed");
                break;
            }
            None => {
                info!("Topic stream ended");
                break;
            }
        }
    }

    neighbors.store(0, Ordering::Relaxed);
}

/// Connects to each discovered peer, one attempt per announcement.
///
/// Failures and timeouts are logged and otherwise ignored.
async fn dial_loop<F, Fut>(
    mut queue: mpsc::Receiver<DiscoveredPeer>,
    connect_timeout: Duration,
    cancel: CancellationToken,
    dial: F,
) where
    F: Fn(DiscoveredPeer) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        let peer = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            peer = queue.recv() => match peer {
                Some(peer) => peer,
                None => break,
            },
        };

        let node_id = peer.node_id;
        match tokio::time::timeout(connect_timeout, dial(peer)).await {
            Ok(Ok(())) => debug!(peer = %node_id, "Dialled peer"),
            Ok(Err(e)) => warn!(peer = %node_id, error = %e, "Failed to connect to peer"),
            Err(_) => warn!(
                peer = %node_id,
                timeout_ms = connect_timeout.as_millis() as u64,
                "Timed out connecting to peer"
            ),
        }
    }

    debug!("Dialler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use crate::net::host::generate_identity;

    fn test_node_id() -> NodeId {
        generate_identity().unwrap().public()
    }

    fn inbound(from: NodeId, body: &'static [u8]) -> InboundMessage {
        InboundMessage {
            delivered_from: from,
            content: Bytes::from_static(body),
        }
    }

    fn peer(node_id: NodeId) -> DiscoveredPeer {
        DiscoveredPeer::new(node_id, Arc::from(Vec::new()))
    }

    #[test]
    fn test_topic_id_is_deterministic() {
        assert_eq!(topic_id("local-gc"), topic_id("local-gc"));
        assert_ne!(topic_id("local-gc"), topic_id("local-gc2"));
        assert_eq!(
            topic_id("local-gc").as_bytes(),
            blake3::hash(b"local-gc").as_bytes()
        );
    }

    #[tokio::test]
    async fn test_subscription_next_returns_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);
        let from = test_node_id();
        let cancel = CancellationToken::new();

        tx.send(inbound(from, b"one")).await.unwrap();
        tx.send(inbound(from, b"two")).await.unwrap();

        assert_eq!(sub.next(&cancel).await.unwrap().content, "one");
        assert_eq!(sub.next(&cancel).await.unwrap().content, "two");
    }

    #[tokio::test]
    async fn test_subscription_next_cancelled() {
        let (_tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);
        let cancel = CancellationToken::new();

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { sub.next(&cancel).await })
        };
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), SubscriptionError::Cancelled);
    }

    #[tokio::test]
    async fn test_subscription_next_closed() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);
        drop(tx);

        let err = sub.next(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, SubscriptionError::Closed);
    }

    #[tokio::test]
    async fn test_pump_tracks_neighbors_and_forwards() {
        let a = test_node_id();
        let b = test_node_id();
        let events = vec![
            Ok(TopicEvent::NeighborUp(a)),
            Ok(TopicEvent::NeighborUp(b)),
            Ok(TopicEvent::Received(inbound(a, b"hello"))),
            Ok(TopicEvent::NeighborDown(b)),
            Ok(TopicEvent::Lagged),
        ];
        let neighbors = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        // keep the stream open after the scripted events so the count can be observed
        let stream = futures::stream::iter(events).chain(futures::stream::pending());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(stream, Arc::clone(&neighbors), tx, cancel.clone()));

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.delivered_from, a);
        assert_eq!(msg.content, "hello");

        tokio::time::timeout(Duration::from_secs(1), async {
            while neighbors.load(Ordering::Relaxed) != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(neighbors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_pump_closes_subscription_on_stream_end() {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut sub = Subscription::new(rx);
        pump(
            futures::stream::iter(Vec::<Result<TopicEvent, String>>::new()),
            Arc::new(AtomicUsize::new(0)),
            tx,
            CancellationToken::new(),
        )
        .await;

        let err = sub.next(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, SubscriptionError::Closed);
    }

    #[tokio::test]
    async fn test_pump_stops_on_stream_error() {
        let (tx, mut rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let from = test_node_id();
        let events = vec![
            Err("actor closed".to_string()),
            Ok(TopicEvent::Received(inbound(from, b"late"))),
        ];
        pump(
            futures::stream::iter(events),
            Arc::new(AtomicUsize::new(0)),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_unblocks_on_cancel_when_full() {
        let from = test_node_id();
        let (tx, _rx) = mpsc::channel(1);
        let events = futures::stream::iter(
            (0..4).map(move |_| Ok(TopicEvent::Received(inbound(from, b"x")))),
        )
        .chain(futures::stream::pending());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(events, Arc::new(AtomicUsize::new(0)), tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("pump should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dial_loop_survives_failures_and_timeouts() {
        let failing = test_node_id();
        let stalled = test_node_id();
        let good = test_node_id();

        let (tx, rx) = mpsc::channel(8);
        tx.send(peer(failing)).await.unwrap();
        tx.send(peer(stalled)).await.unwrap();
        tx.send(peer(good)).await.unwrap();
        drop(tx);

        let reached_good = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reached_good);
        dial_loop(
            rx,
            Duration::from_millis(50),
            CancellationToken::new(),
            move |p: DiscoveredPeer| {
                let flag = Arc::clone(&flag);
                async move {
                    if p.node_id == failing {
                        anyhow::bail!("connection refused");
                    }
                    if p.node_id == stalled {
                        futures::future::pending::<()>().await;
                    }
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert!(reached_good.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dial_loop_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel::<DiscoveredPeer>(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dial_loop(
            rx,
            Duration::from_secs(5),
            cancel.clone(),
            |_p: DiscoveredPeer| async { Ok(()) },
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dialler should stop")
            .unwrap();
    }

    #[test]
    fn test_error_display() {
        let err = PubSubError::Join {
            topic: Arc::from("local-gc"),
            reason: Arc::from("closed"),
        };
        assert_eq!(err.to_string(), "failed to join topic \"local-gc\": closed");
        assert_eq!(SubscriptionError::Closed.to_string(), "subscription closed");
    }
}
