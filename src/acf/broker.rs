//! C8 — Message Broker.
//!
//! Pub/sub with per-topic fan-out, per-agent bounded priority mailboxes, and
//! request/response correlation via a pending-future map. Grounded on
//! `examples/original_source/backend/agents/communication/protocol.py`'s
//! `CommunicationProtocol` (formerly `MessageBroker`), re-expressed with `tokio::sync`
//! primitives for the async mailbox/request paths instead of Python `asyncio.Queue` /
//! `asyncio.Future`.
//!
//! Per §9(ii): `request()` is the authoritative response path (a pending oneshot future);
//! `respond()` falls back to enqueueing into the mailbox only when no pending future is
//! found, to tolerate late or duplicate responses without crashing.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

use crate::clock::{short_id, Clock, SystemClock};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("mailbox full for agent {0}")]
    QueueFull(String),
    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Broadcast,
    Heartbeat,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub topic: String,
    pub payload: Value,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ttl_seconds: Option<i64>,
    pub metadata: HashMap<String, Value>,
}

impl Message {
    pub fn new(kind: MessageKind, sender_id: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: format!("msg_{}", short_id()),
            kind,
            sender_id: sender_id.into(),
            receiver_id: None,
            topic: topic.into(),
            payload,
            priority: Priority::Normal,
            correlation_id: None,
            timestamp: Utc::now(),
            ttl_seconds: None,
            metadata: HashMap::new(),
        }
    }

    pub fn to(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = Some(receiver_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => (now - self.timestamp).num_seconds() > ttl,
            None => false,
        }
    }

    /// Builds the response to this message: swaps sender/receiver and carries
    /// `correlation_id = self.id` per the data-model invariant.
    pub fn respond_with(&self, sender_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: format!("msg_{}", short_id()),
            kind: MessageKind::Response,
            sender_id: sender_id.into(),
            receiver_id: Some(self.sender_id.clone()),
            topic: self.topic.clone(),
            payload,
            priority: self.priority,
            correlation_id: Some(self.id.clone()),
            timestamp: Utc::now(),
            ttl_seconds: None,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: String,
}

impl AgentInfo {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            metadata: HashMap::new(),
            registered_at: now,
            last_seen: now,
            status: "active".to_string(),
        }
    }
}

/// Ordering key `(-priority, timestamp)`; `BinaryHeap` is a max-heap so we invert the
/// comparison to make the highest-priority, earliest-timestamp entry pop first.
struct QueuedMessage {
    message: Message,
    seq: u64,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message.priority == other.message.priority && self.seq == other.seq
    }
}
impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Mailbox {
    heap: BinaryHeap<QueuedMessage>,
    max_size: usize,
}

impl Mailbox {
    fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_size,
        }
    }

    fn push(&mut self, message: Message, seq: u64) -> Result<(), BrokerError> {
        if self.heap.len() >= self.max_size {
            return Err(BrokerError::QueueFull(message.receiver_id.clone().unwrap_or_default()));
        }
        self.heap.push(QueuedMessage { message, seq });
        Ok(())
    }

    fn pop(&mut self) -> Option<Message> {
        self.heap.pop().map(|q| q.message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_expired: u64,
    pub requests_sent: u64,
    pub requests_completed: u64,
}

type FilterFn = Box<dyn Fn(&Message) -> bool + Send + Sync>;

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_message(&self, message: &Message);
}

struct Subscription {
    id: String,
    topic: String,
    handler: std::sync::Arc<dyn Subscriber>,
    filter: Option<FilterFn>,
}

struct Inner {
    agents: HashMap<String, AgentInfo>,
    mailboxes: HashMap<String, Mailbox>,
    subscriptions: Vec<Subscription>,
    history: VecDeque<Message>,
    pending_requests: HashMap<String, oneshot::Sender<Value>>,
    stats: BrokerStats,
    seq: u64,
}

pub struct MessageBroker {
    inner: Mutex<Inner>,
    max_queue_size: usize,
    max_history_size: usize,
    clock: Box<dyn Clock>,
    next_sub_id: AtomicU64,
}

impl MessageBroker {
    pub fn new(max_queue_size: usize, max_history_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                agents: HashMap::new(),
                mailboxes: HashMap::new(),
                subscriptions: Vec::new(),
                history: VecDeque::new(),
                pending_requests: HashMap::new(),
                stats: BrokerStats::default(),
                seq: 0,
            }),
            max_queue_size,
            max_history_size,
            clock: Box::new(SystemClock),
            next_sub_id: AtomicU64::new(1),
        }
    }

    pub fn register_agent(&self, info: AgentInfo) {
        let mut inner = self.inner.lock();
        inner
            .mailboxes
            .insert(info.id.clone(), Mailbox::new(self.max_queue_size));
        inner.agents.insert(info.id.clone(), info);
    }

    pub fn deregister_agent(&self, agent_id: &str) {
        let mut inner = self.inner.lock();
        inner.agents.remove(agent_id);
        inner.mailboxes.remove(agent_id);
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: std::sync::Arc<dyn Subscriber>,
        filter: Option<FilterFn>,
    ) -> String {
        let id = format!("sub_{}", self.next_sub_id.fetch_add(1, AtomicOrdering::Relaxed));
        self.inner.lock().subscriptions.push(Subscription {
            id: id.clone(),
            topic: topic.into(),
            handler,
            filter,
        });
        id
    }

    /// Leaves the broker byte-identical to before the matching `subscribe` call, per the
    /// idempotence law in §8.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != subscription_id);
        inner.subscriptions.len() != before
    }

    /// Fans out to every matching subscriber; handler errors are impossible by
    /// construction here (the trait is infallible) but a panicking handler is still
    /// isolated per-subscriber by iterating rather than joining a single future.
    pub async fn publish(&self, message: Message) {
        let (matching, record): (Vec<std::sync::Arc<dyn Subscriber>>, Message) = {
            let mut inner = self.inner.lock();
            inner.stats.messages_sent += 1;
            if inner.history.len() >= self.max_history_size {
                inner.history.pop_front();
            }
            inner.history.push_back(message.clone());
            let handlers: Vec<_> = inner
                .subscriptions
                .iter()
                .filter(|s| s.topic == message.topic)
                .filter(|s| s.filter.as_ref().map(|f| f(&message)).unwrap_or(true))
                .map(|s| handler_clone(s))
                .collect();
            (handlers, message)
        };
        for handler in matching {
            handler.on_message(&record).await;
        }
    }

    pub fn send(&self, message: Message) -> Result<(), BrokerError> {
        let receiver = message
            .receiver_id
            .clone()
            .ok_or_else(|| BrokerError::UnknownAgent("<none>".to_string()))?;
        let mut inner = self.inner.lock();
        if !inner.mailboxes.contains_key(&receiver) {
            return Err(BrokerError::UnknownAgent(receiver));
        }
        inner.stats.messages_sent += 1;
        let seq = inner.seq;
        inner.seq += 1;
        inner
            .mailboxes
            .get_mut(&receiver)
            .unwrap()
            .push(message, seq)
    }

    pub fn broadcast(&self, template: Message) -> usize {
        let mut inner = self.inner.lock();
        let recipients: Vec<String> = inner.agents.keys().cloned().collect();
        let mut delivered = 0;
        for recipient in recipients {
            let mut copy = template.clone();
            copy.id = format!("msg_{}", short_id());
            copy.receiver_id = Some(recipient.clone());
            let seq = inner.seq;
            inner.seq += 1;
            if let Some(mailbox) = inner.mailboxes.get_mut(&recipient) {
                if mailbox.push(copy, seq).is_ok() {
                    delivered += 1;
                }
            }
        }
        inner.stats.messages_sent += delivered as u64;
        delivered
    }

    pub fn receive(&self, agent_id: &str) -> Option<Message> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mailbox = inner.mailboxes.get_mut(agent_id)?;
        loop {
            let message = mailbox.pop()?;
            if message.is_expired(now) {
                inner.stats.messages_expired += 1;
                continue;
            }
            inner.stats.messages_delivered += 1;
            if let Some(agent) = inner.agents.get_mut(agent_id) {
                agent.last_seen = now;
            }
            return Some(message);
        }
    }

    pub async fn receive_async(&self, agent_id: &str, timeout_ms: u64) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(message) = self.receive(agent_id) {
                return Some(message);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn request(
        &self,
        sender: &str,
        receiver: &str,
        topic: &str,
        payload: Value,
        timeout_seconds: f64,
    ) -> Result<Value, BrokerError> {
        if timeout_seconds <= 0.0 {
            return Err(BrokerError::Timeout);
        }
        let message = Message::new(MessageKind::Request, sender, topic, payload)
            .to(receiver)
            .with_priority(Priority::High);
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.pending_requests.insert(message.id.clone(), tx);
            inner.stats.requests_sent += 1;
        }
        self.send(message.clone())?;

        match timeout(Duration::from_secs_f64(timeout_seconds), rx).await {
            Ok(Ok(value)) => {
                self.inner.lock().stats.requests_completed += 1;
                Ok(value)
            }
            _ => {
                self.inner.lock().pending_requests.remove(&message.id);
                Err(BrokerError::Timeout)
            }
        }
    }

    /// Resolves the pending future for `original.id` when present; otherwise enqueues a
    /// response message into the sender's mailbox as a late/duplicate-response fallback
    /// (§9(ii)) — this path is never load-bearing for request/response correctness.
    pub fn respond(&self, original: &Message, payload: Value) -> Result<(), BrokerError> {
        let pending = self.inner.lock().pending_requests.remove(&original.id);
        match pending {
            Some(tx) => {
                let _ = tx.send(payload);
                Ok(())
            }
            None => {
                let response = original.respond_with(original.receiver_id.clone().unwrap_or_default(), payload);
                self.send(response)
            }
        }
    }

    /// Drops pending futures whose requester has given up — invoked by a background
    /// sweep; relies on the oneshot sender's drop to be a no-op if the receiver side was
    /// already dropped by `request`'s own timeout path.
    pub fn purge_pending(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.pending_requests.len();
        inner.pending_requests.retain(|_, tx| !tx.is_closed());
        before - inner.pending_requests.len()
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.lock().stats
    }

    pub fn mailbox_size(&self, agent_id: &str) -> Option<usize> {
        self.inner.lock().mailboxes.get(agent_id).map(|m| m.heap.len())
    }
}

fn handler_clone(sub: &Subscription) -> std::sync::Arc<dyn Subscriber> {
    sub.handler.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_orders_by_priority_then_timestamp() {
        let broker = MessageBroker::new(16, 16);
        broker.register_agent(AgentInfo::new("a", "worker"));

        let low = Message::new(MessageKind::Event, "x", "t", Value::Null)
            .to("a")
            .with_priority(Priority::Low);
        let urgent = Message::new(MessageKind::Event, "x", "t", Value::Null)
            .to("a")
            .with_priority(Priority::Urgent);
        broker.send(low).unwrap();
        broker.send(urgent.clone()).unwrap();

        let first = broker.receive("a").unwrap();
        assert_eq!(first.priority, Priority::Urgent);
    }

    #[test]
    fn send_to_unknown_agent_fails() {
        let broker = MessageBroker::new(16, 16);
        let msg = Message::new(MessageKind::Event, "x", "t", Value::Null).to("ghost");
        assert!(matches!(broker.send(msg), Err(BrokerError::UnknownAgent(_))));
    }

    #[test]
    fn ttl_zero_always_expired() {
        let broker = MessageBroker::new(16, 16);
        broker.register_agent(AgentInfo::new("a", "worker"));
        let msg = Message::new(MessageKind::Event, "x", "t", Value::Null)
            .to("a")
            .with_ttl(0);
        broker.send(msg).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(broker.receive("a").is_none());
        assert_eq!(broker.stats().messages_expired, 1);
    }

    #[tokio::test]
    async fn request_times_out_when_nobody_responds() {
        let broker = MessageBroker::new(16, 16);
        broker.register_agent(AgentInfo::new("a", "worker"));
        broker.register_agent(AgentInfo::new("b", "worker"));
        let result = broker.request("a", "b", "ping", Value::Null, 0.05).await;
        assert!(matches!(result, Err(BrokerError::Timeout)));
    }

    #[tokio::test]
    async fn request_resolves_via_respond() {
        let broker = std::sync::Arc::new(MessageBroker::new(16, 16));
        broker.register_agent(AgentInfo::new("a", "worker"));
        broker.register_agent(AgentInfo::new("b", "worker"));

        let broker2 = broker.clone();
        let responder = tokio::spawn(async move {
            loop {
                if let Some(msg) = broker2.receive("b") {
                    broker2.respond(&msg, serde_json::json!({"pong": true})).unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = broker.request("a", "b", "ping", Value::Null, 2.0).await.unwrap();
        assert_eq!(result, serde_json::json!({"pong": true}));
        responder.await.unwrap();
    }

    #[test]
    fn subscribe_unsubscribe_is_a_no_op_round_trip() {
        struct Noop;
        #[async_trait]
        impl Subscriber for Noop {
            async fn on_message(&self, _m: &Message) {}
        }
        let broker = MessageBroker::new(16, 16);
        let before = broker.inner.lock().subscriptions.len();
        let id = broker.subscribe("t", std::sync::Arc::new(Noop), None);
        assert!(broker.unsubscribe(&id));
        let after = broker.inner.lock().subscriptions.len();
        assert_eq!(before, after);
    }
}
