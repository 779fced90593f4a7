//! Topic based publish/subscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Topic carrying [`NodeStatus`](crate::protocol::NodeStatus) updates of the
/// local node.
pub const TOPIC_NODE_STATUS: &str = "node-status";

/// A live subscription. Dropping it is equivalent to unsubscribing.
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    topic: String,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Publish/subscribe by topic.
pub trait PubSub<T>: Send + Sync {
    fn sub(&self, topic: &str) -> Subscription<T>;

    fn unsub(&self, sub: &Subscription<T>) -> Result<()>;

    /// Deliver `msg` to every subscriber of `topic`, returning how many
    /// received it.
    fn publish(&self, msg: T, topic: &str) -> Result<usize>;
}

/// In-process [`PubSub`].
#[derive(Debug)]
pub struct LocalPubSub<T> {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<T>)>>>,
}

impl<T> LocalPubSub<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of subscribers on `topic`.
    pub fn subscribers(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }
}

impl<T> Default for LocalPubSub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> PubSub<T> for LocalPubSub<T> {
    fn sub(&self, topic: &str) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));

        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    fn unsub(&self, sub: &Subscription<T>) -> Result<()> {
        let mut topics = self.topics.lock();
        let subs = topics
            .get_mut(&sub.topic)
            .ok_or_else(|| Error::ChannelClosed(format!("no subscribers on {}", sub.topic)))?;

        let before = subs.len();
        subs.retain(|(id, _)| *id != sub.id);
        if subs.len() == before {
            return Err(Error::ChannelClosed(format!(
                "subscription {} not found on {}",
                sub.id, sub.topic
            )));
        }
        if subs.is_empty() {
            topics.remove(&sub.topic);
        }
        Ok(())
    }

    fn publish(&self, msg: T, topic: &str) -> Result<usize> {
        let mut topics = self.topics.lock();
        let Some(subs) = topics.get_mut(topic) else {
            return Ok(0);
        };

        subs.retain(|(_, tx)| tx.send(msg.clone()).is_ok());
        Ok(subs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let ps = LocalPubSub::<u32>::new();
        let mut a = ps.sub("t");
        let mut b = ps.sub("t");
        let _other = ps.sub("u");

        assert_eq!(ps.publish(7u32, "t").unwrap(), 2);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
        assert_eq!(ps.publish(1u32, "none").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsub_ends_subscription() {
        let ps = LocalPubSub::<u8>::new();
        let mut a = ps.sub(TOPIC_NODE_STATUS);
        assert_eq!(a.topic(), TOPIC_NODE_STATUS);

        ps.unsub(&a).unwrap();
        assert_eq!(ps.subscribers(TOPIC_NODE_STATUS), 0);
        assert_eq!(a.recv().await, None);
        assert!(ps.unsub(&a).is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let ps = LocalPubSub::<String>::new();
        let a = ps.sub("t");
        let _b = ps.sub("t");
        drop(a);

        assert_eq!(ps.publish("x".to_string(), "t").unwrap(), 1);
        assert_eq!(ps.subscribers("t"), 1);
    }
}
