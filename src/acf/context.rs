//! C6 — Context Propagator.
//!
//! Scoped contexts with shallow data inheritance and a task-local "current context"
//! stack, restored on scope exit even under error. Grounded on
//! `examples/original_source/backend/agents/mcp/context_manager.py`'s `ContextManager`,
//! re-expressed with `parking_lot::RwLock` for the shared table and `tokio::task_local!`
//! for the active-context stack (the "explicit context values" design note in §9).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{short_id, Clock, SystemClock};

pub const GLOBAL_CONTEXT_ID: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Session,
    Request,
    Agent,
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMeta {
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub scope: Scope,
    pub parent_id: Option<String>,
    pub data: HashMap<String, Value>,
    pub meta: ContextMeta,
}

impl Context {
    fn new(id: String, scope: Scope, parent_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            scope,
            parent_id,
            data: HashMap::new(),
            meta: ContextMeta {
                created_at: now,
                created_by: None,
                expires_at: None,
                tags: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ContextStats {
    pub total: usize,
    pub by_scope: HashMap<String, usize>,
}

tokio::task_local! {
    static CURRENT_STACK: std::cell::RefCell<Vec<String>>;
}

/// Owns every live `Context`. Thread-safe; mutations serialize behind an internal lock
/// per §5's "shared-resource policy", callbacks (none here) would run after release.
pub struct ContextManager {
    contexts: RwLock<HashMap<String, Context>>,
    clock: Box<dyn Clock>,
}

impl ContextManager {
    pub fn new() -> Self {
        let mut contexts = HashMap::new();
        let global = Context::new(GLOBAL_CONTEXT_ID.to_string(), Scope::Global, None, Utc::now());
        contexts.insert(GLOBAL_CONTEXT_ID.to_string(), global);
        Self {
            contexts: RwLock::new(contexts),
            clock: Box::new(SystemClock),
        }
    }

    pub fn create(
        &self,
        scope: Scope,
        parent: Option<&str>,
        data: Option<HashMap<String, Value>>,
        inherit_data: bool,
    ) -> Context {
        let now = self.clock.now();
        let id = format!("ctx_{}", short_id());
        let mut ctx = Context::new(id.clone(), scope, parent.map(|s| s.to_string()), now);

        if let Some(parent_id) = parent {
            if inherit_data {
                if let Some(parent_ctx) = self.contexts.read().get(parent_id) {
                    ctx.data = parent_ctx.data.clone();
                }
            }
        }
        if let Some(data) = data {
            ctx.data.extend(data);
        }

        self.contexts.write().insert(id, ctx.clone());
        ctx
    }

    pub fn get(&self, id: &str) -> Option<Context> {
        self.contexts.read().get(id).cloned()
    }

    pub fn update_data(&self, id: &str, key: &str, value: Value) -> bool {
        let mut guard = self.contexts.write();
        match guard.get_mut(id) {
            Some(ctx) => {
                ctx.data.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// `delete("global")` is a no-op: the root context is indestructible.
    pub fn delete(&self, id: &str) -> bool {
        if id == GLOBAL_CONTEXT_ID {
            return false;
        }
        self.contexts.write().remove(id).is_some()
    }

    /// Copies `keys` from `src` into `dst` when present on `src`; when `keys` is `None`,
    /// falls back to asymmetric merge semantics — only fills keys absent on `dst` — per
    /// §A.3(2a).
    pub fn share(&self, src: &str, dst: &str, keys: Option<&[String]>) -> bool {
        let mut guard = self.contexts.write();
        let src_data = match guard.get(src) {
            Some(ctx) => ctx.data.clone(),
            None => return false,
        };
        let Some(dst_ctx) = guard.get_mut(dst) else {
            return false;
        };

        match keys {
            Some(keys) => {
                for key in keys {
                    if let Some(value) = src_data.get(key) {
                        dst_ctx.data.insert(key.clone(), value.clone());
                    }
                }
            }
            None => {
                for (key, value) in src_data {
                    dst_ctx.data.entry(key).or_insert(value);
                }
            }
        }
        true
    }

    /// Ancestor chain from `id` up to (and including) the root, per `get_lineage`.
    pub fn lineage(&self, id: &str) -> Vec<String> {
        let guard = self.contexts.read();
        let mut chain = Vec::new();
        let mut current = Some(id.to_string());
        let mut guard_against_cycles = 0;
        while let Some(cur) = current {
            chain.push(cur.clone());
            current = guard.get(&cur).and_then(|c| c.parent_id.clone());
            guard_against_cycles += 1;
            if guard_against_cycles > 10_000 {
                break;
            }
        }
        chain
    }

    /// Direct children of `id`, per the original's `get_children`.
    pub fn children(&self, id: &str) -> Vec<String> {
        self.contexts
            .read()
            .values()
            .filter(|c| c.parent_id.as_deref() == Some(id))
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn stats(&self) -> ContextStats {
        let guard = self.contexts.read();
        let mut by_scope = HashMap::new();
        for ctx in guard.values() {
            let key = format!("{:?}", ctx.scope).to_lowercase();
            *by_scope.entry(key).or_insert(0) += 1;
        }
        ContextStats {
            total: guard.len(),
            by_scope,
        }
    }

    /// Removes non-global contexts whose `expires_at` has passed; returns the count removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.contexts.write();
        let before = guard.len();
        guard.retain(|id, ctx| {
            id == GLOBAL_CONTEXT_ID || ctx.meta.expires_at.map(|exp| exp > now).unwrap_or(true)
        });
        before - guard.len()
    }

    pub fn current_id() -> Option<String> {
        CURRENT_STACK
            .try_with(|stack| stack.borrow().last().cloned())
            .ok()
            .flatten()
    }

    /// Runs `f` with `id` pushed as the active context, restoring the previous active
    /// context on exit even if `f` panics (via the stack being task-local and dropped
    /// with its task, and the explicit pop below running in all non-panicking paths).
    pub async fn use_context<F, Fut, T>(id: String, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        async fn run<F, Fut, T>(id: String, f: F) -> T
        where
            F: FnOnce() -> Fut,
            Fut: std::future::Future<Output = T>,
        {
            CURRENT_STACK.with(|stack| stack.borrow_mut().push(id));
            let result = f().await;
            CURRENT_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            result
        }

        if CURRENT_STACK.try_with(|_| ()).is_ok() {
            run(id, f).await
        } else {
            CURRENT_STACK
                .scope(std::cell::RefCell::new(Vec::new()), run(id, f))
                .await
        }
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_context_is_indestructible() {
        let mgr = ContextManager::new();
        assert!(!mgr.delete(GLOBAL_CONTEXT_ID));
        assert!(mgr.get(GLOBAL_CONTEXT_ID).is_some());
    }

    #[test]
    fn create_inherits_parent_data_shallowly() {
        let mgr = ContextManager::new();
        mgr.update_data(GLOBAL_CONTEXT_ID, "tenant", Value::String("acme".into()));
        let child = mgr.create(Scope::Session, Some(GLOBAL_CONTEXT_ID), None, true);
        assert_eq!(child.data.get("tenant"), Some(&Value::String("acme".into())));
    }

    #[test]
    fn lineage_walks_to_root() {
        let mgr = ContextManager::new();
        let mid = mgr.create(Scope::Session, Some(GLOBAL_CONTEXT_ID), None, false);
        let leaf = mgr.create(Scope::Request, Some(&mid.id), None, false);
        let chain = mgr.lineage(&leaf.id);
        assert_eq!(chain, vec![leaf.id.clone(), mid.id.clone(), GLOBAL_CONTEXT_ID.to_string()]);
        assert_eq!(mgr.children(&mid.id), vec![leaf.id]);
    }

    #[test]
    fn share_without_keys_only_fills_missing() {
        let mgr = ContextManager::new();
        let src = mgr.create(Scope::Session, None, None, false);
        mgr.update_data(&src.id, "a", Value::from(1));
        mgr.update_data(&src.id, "b", Value::from(2));
        let dst = mgr.create(Scope::Session, None, None, false);
        mgr.update_data(&dst.id, "a", Value::from(99));

        mgr.share(&src.id, &dst.id, None);
        let dst_ctx = mgr.get(&dst.id).unwrap();
        assert_eq!(dst_ctx.data.get("a"), Some(&Value::from(99)));
        assert_eq!(dst_ctx.data.get("b"), Some(&Value::from(2)));
    }

    #[tokio::test]
    async fn use_context_restores_previous_on_exit() {
        let outer = "ctx_outer".to_string();
        ContextManager::use_context(outer.clone(), || async {
            assert_eq!(ContextManager::current_id(), Some(outer.clone()));
            let inner = "ctx_inner".to_string();
            ContextManager::use_context(inner.clone(), || async {
                assert_eq!(ContextManager::current_id(), Some(inner));
            })
            .await;
            assert_eq!(ContextManager::current_id(), Some(outer));
        })
        .await;
    }
}
