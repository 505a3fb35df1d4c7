//! C9 — Agent Communicator.
//!
//! Wraps an agent's broker participation: registers with the broker, cooperatively polls
//! its mailbox, dispatches by topic to a handler map, and auto-responds to `request`
//! messages. Grounded on
//! `examples/original_source/backend/agents/communication/protocol.py`'s `Agent` base /
//! listener loop; `start`/`stop` are idempotent and the listener is spawned under a
//! cancellation token per §9's "structured concurrency" note rather than a detached loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::broker::{AgentInfo, Message, MessageBroker, MessageKind};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Value, String>;
}

pub struct AgentCommunicator {
    agent_id: String,
    broker: Arc<MessageBroker>,
    handlers: Arc<Mutex<HashMap<String, Arc<dyn MessageHandler>>>>,
    cancel: CancellationToken,
    running: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AgentCommunicator {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, broker: Arc<MessageBroker>) -> Self {
        let agent_id = agent_id.into();
        broker.register_agent(AgentInfo::new(agent_id.clone(), agent_type));
        Self {
            agent_id,
            broker,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    pub async fn on_topic(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.lock().await.insert(topic.into(), handler);
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let agent_id = self.agent_id.clone();
        let broker = self.broker.clone();
        let handlers = self.handlers.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = broker.receive_async(&agent_id, 1000) => {
                        if let Some(message) = message {
                            dispatch(&broker, &agent_id, &handlers, message).await;
                        }
                    }
                }
            }
        });
        *self.listener.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(handle) = self.listener.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Dispatches by topic; handler errors produce an error-kind response for `request`
/// messages and are otherwise swallowed (logged), never terminating the listener.
async fn dispatch(
    broker: &MessageBroker,
    agent_id: &str,
    handlers: &Arc<Mutex<HashMap<String, Arc<dyn MessageHandler>>>>,
    message: Message,
) {
    let handler = handlers.lock().await.get(&message.topic).cloned();
    let Some(handler) = handler else {
        tracing::debug!(agent_id, topic = %message.topic, "no handler registered for topic");
        return;
    };

    let result = handler.handle(&message).await;
    if message.kind != MessageKind::Request {
        if let Err(err) = result {
            tracing::warn!(agent_id, topic = %message.topic, %err, "handler error on non-request message");
        }
        return;
    }

    let response_payload = match result {
        Ok(payload) => payload,
        Err(err) => serde_json::json!({ "error": err }),
    };
    if let Err(err) = broker.respond(&message, response_payload) {
        tracing::warn!(agent_id, %err, "failed to respond to request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acf::broker::{MessageKind, Priority};

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, message: &Message) -> Result<Value, String> {
            Ok(message.payload.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(&self, _message: &Message) -> Result<Value, String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn request_auto_responds_via_handler() {
        let broker = Arc::new(MessageBroker::new(16, 16));
        let comm = AgentCommunicator::new("b", "worker", broker.clone());
        comm.on_topic("ping", Arc::new(Echo)).await;
        comm.start().await;

        broker.register_agent(super::super::broker::AgentInfo::new("a", "worker"));
        let result = broker
            .request("a", "b", "ping", serde_json::json!({"x": 1}), 2.0)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
        comm.stop().await;
    }

    #[tokio::test]
    async fn failing_handler_produces_error_response_not_crash() {
        let broker = Arc::new(MessageBroker::new(16, 16));
        let comm = AgentCommunicator::new("b", "worker", broker.clone());
        comm.on_topic("ping", Arc::new(Failing)).await;
        comm.start().await;

        broker.register_agent(super::super::broker::AgentInfo::new("a", "worker"));
        let result = broker
            .request("a", "b", "ping", serde_json::json!({}), 2.0)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"error": "boom"}));
        comm.stop().await;
    }

    #[test]
    fn message_kind_and_priority_are_comparable() {
        assert_eq!(MessageKind::Request, MessageKind::Request);
        assert!(Priority::Urgent > Priority::Low);
    }
}
