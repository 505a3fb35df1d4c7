//! Core A — Agent Coordination Fabric.
//!
//! One module per component (C2–C11); [`Runtime`] is the dependency-injected aggregate
//! that replaces the Python original's process-wide singletons, per §9's "global
//! singletons → dependency-injected handles" design note. Construct one `Runtime` per
//! process (or per test) and thread `Arc<Runtime>` into whatever needs it; `Runtime::new`
//! is the `default_runtime()` convenience constructor the note calls for.

pub mod alerts;
pub mod anomaly;
pub mod broker;
pub mod communicator;
pub mod context;
pub mod indicator_tools;
pub mod kv;
pub mod mcp;
pub mod metrics;
pub mod tool_registry;
pub mod tracer;

use std::sync::Arc;

use crate::config::Config;

pub struct Runtime {
    pub metrics: Arc<metrics::MetricsRegistry>,
    pub tracer: Arc<tracer::Tracer>,
    pub alerts: Arc<alerts::AlertManager>,
    pub anomaly: Arc<anomaly::MlAnomalyDetector>,
    pub context: Arc<context::ContextManager>,
    pub kv: Arc<kv::SharedKvStore>,
    pub broker: Arc<broker::MessageBroker>,
    pub tools: Arc<tool_registry::ToolRegistry>,
    pub config: Config,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let tools = tool_registry::ToolRegistry::new();
        indicator_tools::register_default_tools(&tools);
        Self {
            metrics: Arc::new(metrics::MetricsRegistry::new(config.metrics_retention_hours)),
            tracer: Arc::new(tracer::Tracer::new(config.tracer_sample_rate, config.tracer_max_traces)),
            alerts: Arc::new(alerts::AlertManager::new(config.alert_default_rules)),
            anomaly: Arc::new(anomaly::MlAnomalyDetector::new()),
            context: Arc::new(context::ContextManager::new()),
            kv: Arc::new(kv::SharedKvStore::new(kv::ConflictPolicy::LastWriteWins)),
            broker: Arc::new(broker::MessageBroker::new(
                config.broker_max_queue_size,
                config.broker_max_history_size,
            )),
            tools: Arc::new(tools),
            config,
        }
    }
}

/// Convenience constructor for tests and examples — mirrors a Python-side
/// `default_runtime()` factory.
pub fn default_runtime() -> Runtime {
    Runtime::new(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runtime_wires_every_component() {
        let rt = default_runtime();
        assert!(rt.alerts.active_alerts().is_empty());
        assert_eq!(rt.config.metrics_namespace, "ai_agent");
        rt.kv.set("init", "k", serde_json::Value::from(1), None);
        assert_eq!(rt.kv.get("k"), Some(serde_json::Value::from(1)));
        assert!(rt.tools.get("indicator_sma").is_some());
        assert!(rt.tools.get("indicator_rsi").is_some());
    }
}
