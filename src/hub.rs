//! Topic-addressed pub/sub hub for log fan-out
//!
//! One owner task serializes all registry mutations and dispatches published
//! messages into bounded per-subscriber queues. Publishers never block on a
//! slow subscriber: a full queue drops that subscriber instead.
//!
//! The transport layer (websocket, SSE, whatever the HTTP edge speaks)
//! drains each [`SubscriberHandle`] and enforces the heartbeat constants
//! exported here.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// Time allowed to write a message to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next pong from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence; must be below `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum inbound message size accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Per-subscriber queue capacity.
const SUBSCRIBER_QUEUE_SIZE: usize = 256;

/// Hub command channel capacity.
const COMMAND_QUEUE_SIZE: usize = 256;

/// A message delivered to subscribers of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub payload: String,
}

/// The receiving side of one subscriber's bounded queue.
pub struct SubscriberHandle {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<LogMessage>,
}

enum Command {
    Register {
        reply: oneshot::Sender<SubscriberHandle>,
    },
    Unregister {
        id: Uuid,
    },
    Subscribe {
        id: Uuid,
        topic: String,
    },
    Unsubscribe {
        id: Uuid,
        topic: String,
    },
    Publish {
        topic: String,
        payload: String,
    },
    ClientCount {
        reply: oneshot::Sender<usize>,
    },
    TopicCount {
        topic: String,
        reply: oneshot::Sender<usize>,
    },
    Stop,
}

struct ClientEntry {
    sender: mpsc::Sender<LogMessage>,
    topics: HashSet<String>,
}

/// Handle to the hub. Cheap to clone; all operations funnel through the
/// owner loop. After [`LogHub::stop`] every operation becomes a no-op.
#[derive(Clone)]
pub struct LogHub {
    tx: mpsc::Sender<Command>,
}

impl LogHub {
    /// Create the hub and spawn its owner loop.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        tokio::spawn(run_loop(rx));
        Self { tx }
    }

    /// Register a new subscriber. Returns `None` once the hub is stopped.
    pub async fn register(&self) -> Option<SubscriberHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Register { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn unregister(&self, id: Uuid) {
        let _ = self.tx.send(Command::Unregister { id }).await;
    }

    pub async fn subscribe(&self, id: Uuid, topic: impl Into<String>) {
        let _ = self
            .tx
            .send(Command::Subscribe {
                id,
                topic: topic.into(),
            })
            .await;
    }

    pub async fn unsubscribe(&self, id: Uuid, topic: impl Into<String>) {
        let _ = self
            .tx
            .send(Command::Unsubscribe {
                id,
                topic: topic.into(),
            })
            .await;
    }

    /// Publish a message to everyone subscribed to `topic`. Publishing to a
    /// topic nobody watches is a no-op.
    pub async fn publish(&self, topic: impl Into<String>, payload: impl Into<String>) {
        let _ = self
            .tx
            .send(Command::Publish {
                topic: topic.into(),
                payload: payload.into(),
            })
            .await;
    }

    /// Non-async publish for synchronous callers (build log callbacks).
    /// Best-effort: drops the message when the command queue is full.
    pub fn try_publish(&self, topic: impl Into<String>, payload: impl Into<String>) -> bool {
        self.tx
            .try_send(Command::Publish {
                topic: topic.into(),
                payload: payload.into(),
            })
            .is_ok()
    }

    pub async fn client_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::ClientCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn topic_count(&self, topic: impl Into<String>) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::TopicCount {
                topic: topic.into(),
                reply,
            })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close every subscriber queue and deny future operations.
    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop(mut rx: mpsc::Receiver<Command>) {
    let mut clients: HashMap<Uuid, ClientEntry> = HashMap::new();
    let mut topics: HashMap<String, HashSet<Uuid>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Register { reply } => {
                let id = Uuid::new_v4();
                let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
                if reply.send(SubscriberHandle { id, receiver }).is_ok() {
                    clients.insert(
                        id,
                        ClientEntry {
                            sender,
                            topics: HashSet::new(),
                        },
                    );
                    debug!(client_id = %id, "Subscriber registered");
                }
            }
            Command::Unregister { id } => {
                remove_client(&mut clients, &mut topics, id);
                debug!(client_id = %id, "Subscriber unregistered");
            }
            Command::Subscribe { id, topic } => {
                if let Some(entry) = clients.get_mut(&id) {
                    entry.topics.insert(topic.clone());
                    topics.entry(topic.clone()).or_default().insert(id);
                    debug!(client_id = %id, topic = %topic, "Subscribed");
                }
            }
            Command::Unsubscribe { id, topic } => {
                if let Some(entry) = clients.get_mut(&id) {
                    entry.topics.remove(&topic);
                }
                if let Some(ids) = topics.get_mut(&topic) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        topics.remove(&topic);
                    }
                }
            }
            Command::Publish { topic, payload } => {
                let Some(ids) = topics.get(&topic) else {
                    continue;
                };
                let mut dropped: Vec<Uuid> = Vec::new();
                for id in ids {
                    let Some(entry) = clients.get(id) else {
                        continue;
                    };
                    let message = LogMessage {
                        topic: topic.clone(),
                        payload: payload.clone(),
                    };
                    if entry.sender.try_send(message).is_err() {
                        // Queue full or receiver gone: drop the subscriber
                        // rather than ever blocking the publisher.
                        dropped.push(*id);
                    }
                }
                for id in dropped {
                    debug!(client_id = %id, topic = %topic, "Subscriber queue full, dropping");
                    remove_client(&mut clients, &mut topics, id);
                }
            }
            Command::ClientCount { reply } => {
                let _ = reply.send(clients.len());
            }
            Command::TopicCount { topic, reply } => {
                let _ = reply.send(topics.get(&topic).map_or(0, |ids| ids.len()));
            }
            Command::Stop => {
                // Dropping the senders closes every subscriber queue;
                // dropping the receiver denies all future commands.
                clients.clear();
                topics.clear();
                break;
            }
        }
    }
}

fn remove_client(
    clients: &mut HashMap<Uuid, ClientEntry>,
    topics: &mut HashMap<String, HashSet<Uuid>>,
    id: Uuid,
) {
    if let Some(entry) = clients.remove(&id) {
        for topic in entry.topics {
            if let Some(ids) = topics.get_mut(&topic) {
                ids.remove(&id);
                if ids.is_empty() {
                    topics.remove(&topic);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_two_subscribers_receive_in_order() {
        let hub = LogHub::new();
        let mut a = hub.register().await.unwrap();
        let mut b = hub.register().await.unwrap();
        hub.subscribe(a.id, "build:1").await;
        hub.subscribe(b.id, "build:1").await;

        for i in 0..5 {
            hub.publish("build:1", format!("line {}", i)).await;
        }

        for sub in [&mut a, &mut b] {
            for i in 0..5 {
                let msg = sub.receiver.recv().await.unwrap();
                assert_eq!(msg.topic, "build:1");
                assert_eq!(msg.payload, format!("line {}", i));
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = LogHub::new();
        hub.publish("nobody-home", "hello").await;
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_others_survive() {
        let hub = LogHub::new();
        let slow = hub.register().await.unwrap();
        let mut fast = hub.register().await.unwrap();
        hub.subscribe(slow.id, "app:x").await;
        hub.subscribe(fast.id, "app:x").await;

        // The fast subscriber drains concurrently; the slow one never reads.
        let drain = tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(_msg) = fast.receiver.recv().await {
                count += 1;
            }
            count
        });

        let total = SUBSCRIBER_QUEUE_SIZE + 10;
        for i in 0..total {
            hub.publish("app:x", format!("line {}", i)).await;
            // Let the hub loop and the draining subscriber keep pace.
            tokio::task::yield_now().await;
        }

        // The slow subscriber overflowed its queue and was unregistered.
        assert_eq!(hub.client_count().await, 1);
        assert_eq!(hub.topic_count("app:x").await, 1);

        hub.stop().await;
        let received = drain.await.unwrap();
        assert_eq!(received, total);
        drop(slow);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = LogHub::new();
        let mut sub = hub.register().await.unwrap();
        hub.subscribe(sub.id, "t").await;
        hub.publish("t", "one").await;
        hub.unsubscribe(sub.id, "t").await;
        hub.publish("t", "two").await;
        hub.stop().await;

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.payload, "one");
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_counts() {
        let hub = LogHub::new();
        let a = hub.register().await.unwrap();
        let b = hub.register().await.unwrap();
        hub.subscribe(a.id, "t1").await;
        hub.subscribe(b.id, "t1").await;
        hub.subscribe(b.id, "t2").await;

        assert_eq!(hub.client_count().await, 2);
        assert_eq!(hub.topic_count("t1").await, 2);
        assert_eq!(hub.topic_count("t2").await, 1);
        assert_eq!(hub.topic_count("t3").await, 0);

        hub.unregister(b.id).await;
        assert_eq!(hub.client_count().await, 1);
        assert_eq!(hub.topic_count("t2").await, 0);
    }

    #[tokio::test]
    async fn test_stop_denies_future_operations() {
        let hub = LogHub::new();
        let mut sub = hub.register().await.unwrap();
        hub.subscribe(sub.id, "t").await;
        hub.stop().await;

        // Queue closed by stop.
        assert!(sub.receiver.recv().await.is_none());
        // Operations after stop are denied.
        assert!(hub.register().await.is_none());
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_constants() {
        assert!(PING_PERIOD < PONG_WAIT);
        assert_eq!(PING_PERIOD, Duration::from_secs(54));
        assert_eq!(PONG_WAIT, Duration::from_secs(60));
    }
}
