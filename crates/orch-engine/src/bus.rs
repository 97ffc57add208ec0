//! Message Bus - bounded point-to-point and broadcast delivery
//!
//! Every destination name owns a queue ordered by `(priority, publish sequence)`:
//! messages of equal priority come out in publish order, a higher-priority message
//! only overtakes others pending for the same destination.
//!
//! Capacity counts queued deliveries across all queues. A broadcast is copied into
//! every subscriber's queue and needs one slot per copy. When the bus is full,
//! `publish` waits up to `publish_timeout` for space and then fails with
//! [`Error::BusFull`]; nothing is dropped silently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use orch_core::{Destination, Error, Message, OrchestratorConfig, Priority, Result};

use crate::metrics::OrchestratorMetrics;

type Queue = BTreeMap<(Priority, u64), Message>;

#[derive(Default)]
struct BusState {
    queues: HashMap<String, Queue>,
    subscribers: HashSet<String>,
    depth: usize,
    sequence: u64,
}

impl BusState {
    fn targets_for(&self, message: &Message) -> Vec<String> {
        match &message.to_agent {
            Destination::Agent(name) => vec![name.clone()],
            Destination::Broadcast => {
                let mut targets: Vec<String> = self
                    .subscribers
                    .iter()
                    .filter(|name| **name != message.from_agent)
                    .cloned()
                    .collect();
                targets.sort();
                targets
            }
        }
    }

    fn enqueue(&mut self, targets: &[String], message: &Message) {
        for target in targets {
            self.sequence += 1;
            let key = (message.priority, self.sequence);
            self.queues
                .entry(target.clone())
                .or_default()
                .insert(key, message.clone());
        }
        self.depth += targets.len();
    }

    fn pop(&mut self, name: &str) -> Option<Message> {
        let queue = self.queues.get_mut(name)?;
        let (_, message) = queue.pop_first()?;
        if queue.is_empty() {
            self.queues.remove(name);
        }
        self.depth -= 1;
        Some(message)
    }
}

/// Bounded message bus shared by workers and the coordinator
pub struct MessageBus {
    state: Mutex<BusState>,
    capacity: usize,
    publish_timeout: Duration,
    /// Signalled when deliveries are consumed
    space: Notify,
    /// Signalled when deliveries are queued
    arrivals: Notify,
    metrics: Option<Arc<OrchestratorMetrics>>,
}

impl MessageBus {
    pub fn new(capacity: usize, publish_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            capacity,
            publish_timeout,
            space: Notify::new(),
            arrivals: Notify::new(),
            metrics: None,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.bus_capacity, config.publish_timeout)
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestratorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register `name` as a broadcast subscriber
    pub async fn subscribe(&self, name: &str) {
        let mut state = self.state.lock().await;
        if state.subscribers.insert(name.to_string()) {
            debug!(subscriber = %name, "Subscribed to bus");
        }
    }

    /// Remove a subscriber and discard anything still queued for it
    pub async fn unsubscribe(&self, name: &str) {
        let mut state = self.state.lock().await;
        state.subscribers.remove(name);
        if let Some(queue) = state.queues.remove(name) {
            state.depth -= queue.len();
            drop(state);
            debug!(subscriber = %name, dropped = queue.len(), "Unsubscribed from bus");
            self.space.notify_waiters();
        }
    }

    pub async fn is_subscribed(&self, name: &str) -> bool {
        self.state.lock().await.subscribers.contains(name)
    }

    /// Queued deliveries across all destinations
    pub async fn depth(&self) -> usize {
        self.state.lock().await.depth
    }

    /// Queued deliveries for one destination
    pub async fn pending_for(&self, name: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(name).map(|q| q.len()).unwrap_or(0)
    }

    /// Enqueue a message. Returns the number of deliveries queued (0 for a
    /// broadcast with no other subscribers).
    pub async fn publish(&self, message: Message) -> Result<usize> {
        let started = Instant::now();
        let deadline = started + self.publish_timeout;

        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            // Register interest before checking so a release between the check
            // and the await is not missed.
            space.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let targets = state.targets_for(&message);

                if targets.is_empty() {
                    debug!(message_id = %message.message_id, "Broadcast has no subscribers");
                    return Ok(0);
                }

                if targets.len() > self.capacity {
                    return Err(self.reject(&message, started));
                }

                if state.depth + targets.len() <= self.capacity {
                    state.enqueue(&targets, &message);
                    let depth = state.depth;
                    drop(state);

                    if let Some(metrics) = &self.metrics {
                        metrics.message_published(depth);
                    }
                    debug!(
                        message_id = %message.message_id,
                        from = %message.from_agent,
                        to = %message.to_agent,
                        message_type = ?message.message_type,
                        deliveries = targets.len(),
                        depth,
                        "Message published"
                    );
                    self.arrivals.notify_waiters();
                    return Ok(targets.len());
                }
            }

            if tokio::time::timeout_at(deadline, space).await.is_err() {
                return Err(self.reject(&message, started));
            }
        }
    }

    fn reject(&self, message: &Message, started: Instant) -> Error {
        let waited_ms = started.elapsed().as_millis() as u64;
        if let Some(metrics) = &self.metrics {
            metrics.publish_rejected();
        }
        warn!(
            message_id = %message.message_id,
            to = %message.to_agent,
            capacity = self.capacity,
            waited_ms,
            "Bus full, publish rejected"
        );
        Error::BusFull {
            capacity: self.capacity,
            waited_ms,
        }
    }

    /// Next message for `name` (addressed to it directly or broadcast), or `None`
    /// if nothing arrives within `timeout`. Receiving subscribes `name` to broadcasts.
    pub async fn receive(&self, name: &str, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;

        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                state.subscribers.insert(name.to_string());
                if let Some(message) = state.pop(name) {
                    let depth = state.depth;
                    drop(state);

                    if let Some(metrics) = &self.metrics {
                        metrics.set_bus_depth(depth);
                    }
                    self.space.notify_waiters();
                    return Some(message);
                }
            }

            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return None;
            }
        }
    }

    /// Drain everything currently queued for `name` without waiting
    pub async fn drain(&self, name: &str) -> Vec<Message> {
        let mut state = self.state.lock().await;
        let mut drained = Vec::new();
        while let Some(message) = state.pop(name) {
            drained.push(message);
        }
        let depth = state.depth;
        drop(state);

        if !drained.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.set_bus_depth(depth);
            }
            self.space.notify_waiters();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::MessageType;
    use serde_json::json;

    fn bus(capacity: usize) -> MessageBus {
        MessageBus::new(capacity, Duration::from_millis(50))
    }

    fn to(name: &str, n: i64) -> Message {
        Message::new("test", Destination::agent(name), MessageType::Request, json!(n))
    }

    #[tokio::test]
    async fn test_fifo_per_destination() {
        let bus = bus(10);
        for n in 1..=3 {
            bus.publish(to("worker", n)).await.unwrap();
        }

        for n in 1..=3 {
            let message = bus.receive("worker", Duration::from_millis(10)).await.unwrap();
            assert_eq!(message.payload, json!(n));
        }
        assert!(bus.receive("worker", Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_priority_within_destination() {
        let bus = bus(10);
        bus.publish(to("worker", 1)).await.unwrap();
        bus.publish(to("worker", 2).with_priority(Priority::CRITICAL))
            .await
            .unwrap();
        bus.publish(to("other", 3).with_priority(Priority::CRITICAL))
            .await
            .unwrap();

        let first = bus.receive("worker", Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.payload, json!(2));
        let second = bus.receive("worker", Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.payload, json!(1));
        assert_eq!(bus.pending_for("other").await, 1);
    }

    #[tokio::test]
    async fn test_receive_timeout_is_not_an_error() {
        let bus = bus(10);
        let started = Instant::now();
        assert!(bus.receive("idle", Duration::from_millis(20)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let bus = Arc::new(bus(10));
        let receiver = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.receive("worker", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish(to("worker", 7)).await.unwrap();

        let message = receiver.await.unwrap().unwrap();
        assert_eq!(message.payload, json!(7));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let bus = bus(10);
        bus.subscribe("a").await;
        bus.subscribe("b").await;
        bus.subscribe("test").await;

        let delivered = bus
            .publish(Message::broadcast("test", MessageType::StatusUpdate, json!("hi")))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(bus.depth().await, 2);

        assert!(bus.receive("a", Duration::from_millis(10)).await.is_some());
        assert!(bus.receive("b", Duration::from_millis(10)).await.is_some());
        assert_eq!(bus.pending_for("test").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_bus_rejects_after_wait() {
        let bus = MessageBus::new(2, Duration::from_secs(5));
        bus.publish(to("w", 1)).await.unwrap();
        bus.publish(to("w", 2)).await.unwrap();

        let started = Instant::now();
        let err = bus.publish(to("w", 3)).await.unwrap_err();
        assert!(matches!(err, Error::BusFull { capacity: 2, waited_ms } if waited_ms >= 5000));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(bus.depth().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_larger_than_capacity_fails_fast() {
        let bus = MessageBus::new(1, Duration::from_secs(60));
        bus.subscribe("a").await;
        bus.subscribe("b").await;

        let err = bus
            .publish(Message::broadcast("test", MessageType::StatusUpdate, json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BusFull { capacity: 1, .. }));
    }

    #[tokio::test]
    async fn test_blocked_publish_resumes_when_space_frees() {
        let bus = Arc::new(MessageBus::new(1, Duration::from_secs(5)));
        bus.publish(to("w", 1)).await.unwrap();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(to("w", 2)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            bus.receive("w", Duration::from_millis(10)).await.unwrap().payload,
            json!(1)
        );
        assert_eq!(publisher.await.unwrap().unwrap(), 1);
        assert_eq!(
            bus.receive("w", Duration::from_millis(100)).await.unwrap().payload,
            json!(2)
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_frees_space() {
        let bus = bus(5);
        bus.subscribe("gone").await;
        bus.publish(to("gone", 1)).await.unwrap();
        bus.unsubscribe("gone").await;

        assert_eq!(bus.depth().await, 0);
        assert!(!bus.is_subscribed("gone").await);
    }

    #[tokio::test]
    async fn test_request_reply_correlation() {
        let bus = bus(5);
        let request = Message::request("client", "server", json!({"q": 1}));
        bus.publish(request.clone()).await.unwrap();

        let received = bus.receive("server", Duration::from_millis(10)).await.unwrap();
        bus.publish(Message::reply_to(&received, "server", json!({"a": 2})))
            .await
            .unwrap();

        let reply = bus.receive("client", Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply.correlation_id, request.correlation_id);
    }
}
