//! Notification Hub — per-agent subscriber registry and fan-out
//!
//! `tokio::sync::broadcast` almost fits here, but it reports dropped-lag
//! to the *reader*, not a count the hub itself can observe and log. The
//! drop-oldest+skip-count contract in §4.5 needs the producer side to
//! know when it dropped something, so each subscriber gets its own small
//! bounded ring buffer instead of a shared broadcast channel.

use crate::store::InboxEntry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

/// One subscriber's mailbox: a bounded ring buffer plus a `Notify` to wake
/// whichever task is waiting on the next entry.
struct Subscriber {
    queue: Mutex<VecDeque<InboxEntry>>,
    capacity: usize,
    skipped: Mutex<u64>,
    notify: Notify,
}

impl Subscriber {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            skipped: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    fn push(&self, entry: InboxEntry) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
            *self.skipped.lock().unwrap() += 1;
        }
        queue.push_back(entry);
        drop(queue);
        self.notify.notify_waiters();
    }

    async fn recv(&self) -> InboxEntry {
        loop {
            if let Some(entry) = self.queue.lock().unwrap().pop_front() {
                return entry;
            }
            self.notify.notified().await;
        }
    }

    fn skipped(&self) -> u64 {
        *self.skipped.lock().unwrap()
    }
}

/// A handle a streaming/long-poll RPC holds onto. Unsubscribing is tied to
/// this value's lifetime rather than a separate explicit call: when the
/// owning SSE stream or long-poll loop is torn down (client disconnect,
/// cancellation), dropping the `Subscription` removes it from the hub
/// immediately — the detached-context cleanup the wire spec describes,
/// expressed as RAII instead of a manual timeout.
pub struct Subscription {
    agent_id: i64,
    subscriber_id: String,
    subscriber: Arc<Subscriber>,
    hub: NotificationHub,
}

impl Subscription {
    pub async fn recv(&self) -> InboxEntry {
        self.subscriber.recv().await
    }

    pub fn skipped(&self) -> u64 {
        self.subscriber.skipped()
    }

    pub fn agent_id(&self) -> i64 {
        self.agent_id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.agent_id, &self.subscriber_id);
    }
}

#[derive(Default, Clone)]
pub struct NotificationHub {
    subscribers: Arc<Mutex<HashMap<i64, HashMap<String, Arc<Subscriber>>>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, agent_id: i64, subscriber_id: &str, capacity: usize) -> Subscription {
        let subscriber = Arc::new(Subscriber::new(capacity));
        self.subscribers
            .lock()
            .unwrap()
            .entry(agent_id)
            .or_default()
            .insert(subscriber_id.to_string(), subscriber.clone());
        Subscription {
            agent_id,
            subscriber_id: subscriber_id.to_string(),
            subscriber,
            hub: self.clone(),
        }
    }

    pub fn unsubscribe(&self, agent_id: i64, subscriber_id: &str) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(by_agent) = subscribers.get_mut(&agent_id) {
            by_agent.remove(subscriber_id);
            if by_agent.is_empty() {
                subscribers.remove(&agent_id);
            }
        }
    }

    /// Fan out one delivery to every live subscriber of `agent_id`. Never
    /// blocks: a full subscriber queue silently drops its oldest entry.
    pub fn publish(&self, agent_id: i64, entry: &InboxEntry) {
        let subscribers = self.subscribers.lock().unwrap();
        let Some(by_agent) = subscribers.get(&agent_id) else {
            return;
        };
        for (subscriber_id, subscriber) in by_agent {
            subscriber.push(entry.clone());
            let skipped = subscriber.skipped();
            if skipped > 0 {
                warn!(agent_id, subscriber_id, skipped, "subscriber queue overflowed");
            }
        }
    }

    pub fn subscriber_count(&self, agent_id: i64) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(&agent_id)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Message, Priority, RecipientState};
    use chrono::Utc;

    fn dummy_entry(subject: &str) -> InboxEntry {
        InboxEntry {
            message: Message {
                id: 1,
                thread_id: "t1".to_string(),
                topic_id: None,
                sender_id: 1,
                subject: subject.to_string(),
                body: String::new(),
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                created_at: Utc::now(),
                sender_deleted: false,
            },
            state: RecipientState::Unread,
            snoozed_until: None,
            read_at: None,
            acked_at: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_in_publish_order() {
        let hub = NotificationHub::new();
        let sub = hub.subscribe(1, "sub-a", 10);
        hub.publish(1, &dummy_entry("first"));
        hub.publish(1, &dummy_entry("second"));

        assert_eq!(sub.recv().await.message.subject, "first");
        assert_eq!(sub.recv().await.message.subject, "second");
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_counts_skip() {
        let hub = NotificationHub::new();
        let sub = hub.subscribe(1, "sub-a", 2);
        hub.publish(1, &dummy_entry("one"));
        hub.publish(1, &dummy_entry("two"));
        hub.publish(1, &dummy_entry("three"));

        assert_eq!(sub.skipped(), 1);
        assert_eq!(sub.recv().await.message.subject, "two");
        assert_eq!(sub.recv().await.message.subject, "three");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = NotificationHub::new();
        let sub = hub.subscribe(1, "sub-a", 4);
        assert_eq!(hub.subscriber_count(1), 1);
        hub.unsubscribe(1, "sub-a");
        assert_eq!(hub.subscriber_count(1), 0);
        // publishing with no subscribers must not panic
        hub.publish(1, &dummy_entry("ignored"));
        drop(sub);
    }

    #[tokio::test]
    async fn dropping_the_subscription_unsubscribes() {
        let hub = NotificationHub::new();
        let sub = hub.subscribe(1, "sub-a", 4);
        assert_eq!(hub.subscriber_count(1), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn unrelated_agents_do_not_cross_deliver() {
        let hub = NotificationHub::new();
        let sub_a = hub.subscribe(1, "sub-a", 4);
        hub.publish(2, &dummy_entry("for agent 2"));
        hub.publish(1, &dummy_entry("for agent 1"));
        assert_eq!(sub_a.recv().await.message.subject, "for agent 1");
    }
}
