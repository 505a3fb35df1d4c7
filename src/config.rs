//! Process-wide ambient configuration, env-driven the way the teacher's `models::Config`
//! is: `dotenv().ok()` once, then `env::var(...).unwrap_or_else(...).parse().unwrap_or(...)`
//! for every field so a missing or malformed var degrades to a sane default instead of
//! aborting startup. Also supports an optional TOML file (`AGENT_LAB_CONFIG_PATH`), mirroring
//! the teacher's `performance::config::PerfConfig::load`/`from_env` layering.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_metrics_namespace")]
    pub metrics_namespace: String,
    #[serde(default = "default_metrics_retention_hours")]
    pub metrics_retention_hours: u64,
    #[serde(default = "default_broker_max_queue_size")]
    pub broker_max_queue_size: usize,
    #[serde(default = "default_broker_max_history_size")]
    pub broker_max_history_size: usize,
    #[serde(default = "default_kv_lock_timeout")]
    pub kv_default_lock_timeout_seconds: u64,
    #[serde(default = "default_tracer_sample_rate")]
    pub tracer_sample_rate: f64,
    #[serde(default = "default_tracer_max_traces")]
    pub tracer_max_traces: usize,
    #[serde(default = "default_alert_default_rules")]
    pub alert_default_rules: bool,
}

fn default_metrics_namespace() -> String {
    "ai_agent".to_string()
}
fn default_metrics_retention_hours() -> u64 {
    24
}
fn default_broker_max_queue_size() -> usize {
    10_000
}
fn default_broker_max_history_size() -> usize {
    1_000
}
fn default_kv_lock_timeout() -> u64 {
    30
}
fn default_tracer_sample_rate() -> f64 {
    1.0
}
fn default_tracer_max_traces() -> usize {
    100
}
fn default_alert_default_rules() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_namespace: "ai_agent".to_string(),
            metrics_retention_hours: 24,
            broker_max_queue_size: 10_000,
            broker_max_history_size: 1_000,
            kv_default_lock_timeout_seconds: 30,
            tracer_sample_rate: 1.0,
            tracer_max_traces: 100,
            alert_default_rules: true,
        }
    }
}

impl Config {
    /// Loads a TOML config file, falling back to field-level defaults for anything absent.
    pub fn load_toml(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Serializes the current config as pretty TOML, e.g. to seed a config file on disk.
    pub fn save_toml(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Loads from `AGENT_LAB_CONFIG_PATH` if set and readable, otherwise from individual
    /// env vars, otherwise defaults — the same layering order as the teacher's `PerfConfig`.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        if let Ok(path) = std::env::var("AGENT_LAB_CONFIG_PATH") {
            match Self::load_toml(&path) {
                Ok(config) => return config,
                Err(e) => tracing::debug!("ignoring AGENT_LAB_CONFIG_PATH ({}): {}", path, e),
            }
        }

        let metrics_namespace =
            std::env::var("METRICS_NAMESPACE").unwrap_or_else(|_| "ai_agent".to_string());

        let metrics_retention_hours = std::env::var("METRICS_RETENTION_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .unwrap_or(24);

        let broker_max_queue_size = std::env::var("BROKER_MAX_QUEUE_SIZE")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .unwrap_or(10_000);

        let broker_max_history_size = std::env::var("BROKER_MAX_HISTORY_SIZE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1_000);

        let kv_default_lock_timeout_seconds = std::env::var("KV_LOCK_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let tracer_sample_rate = std::env::var("TRACER_SAMPLE_RATE")
            .unwrap_or_else(|_| "1.0".to_string())
            .parse()
            .unwrap_or(1.0);

        let tracer_max_traces = std::env::var("TRACER_MAX_TRACES")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let alert_default_rules = std::env::var("ALERT_DEFAULT_RULES")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            metrics_namespace,
            metrics_retention_hours,
            broker_max_queue_size,
            broker_max_history_size,
            kv_default_lock_timeout_seconds,
            tracer_sample_rate,
            tracer_max_traces,
            alert_default_rules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_roundtrip_preserves_fields() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.metrics_namespace, config.metrics_namespace);
        assert_eq!(parsed.broker_max_queue_size, config.broker_max_queue_size);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed: Config = toml::from_str("metrics_namespace = \"custom\"\n").unwrap();
        assert_eq!(parsed.metrics_namespace, "custom");
        assert_eq!(parsed.broker_max_queue_size, default_broker_max_queue_size());
    }

    #[test]
    fn load_toml_roundtrips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.metrics_namespace = "from_file".to_string();
        config.save_toml(&path).unwrap();

        let loaded = Config::load_toml(&path).unwrap();
        assert_eq!(loaded.metrics_namespace, "from_file");
    }
}
