//! C4 — Alert Manager.
//!
//! Rule evaluation with duration gating, silences, and z-score anomaly alerts dispatched
//! through pluggable async notifiers. Grounded on
//! `examples/original_source/backend/agents/monitoring/alerting.py`'s `AlertManager`
//! and its `DEFAULT_RULES` seed (§A.3-3).

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::{short_id, Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
}

impl Comparison {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Lt => value < threshold,
            Comparison::Gte => value >= threshold,
            Comparison::Lte => value <= threshold,
            Comparison::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparison::Neq => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric_name: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    pub duration_seconds: i64,
    pub labels: HashMap<String, String>,
    pub enabled: bool,
    pub anomaly_detection: bool,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric_name: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.into(),
            metric_name: metric_name.into(),
            comparison,
            threshold,
            severity,
            duration_seconds: 0,
            labels: HashMap::new(),
            enabled: true,
            anomaly_detection: false,
        }
    }

    pub fn with_duration(mut self, seconds: i64) -> Self {
        self.duration_seconds = seconds;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Pending,
    Firing,
    Resolved,
    Silenced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_name: String,
    pub metric_name: String,
    pub value: f64,
    pub severity: Severity,
    pub state: AlertState,
    pub labels: HashMap<String, String>,
    pub firing_since: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> bool;
}

struct RollingHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingHistory {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
    fn push(&mut self, value: f64) {
        if self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
}

struct RuleState {
    rule: AlertRule,
    firing_since: Option<DateTime<Utc>>,
    active_alert: Option<Alert>,
    silence_until: Option<DateTime<Utc>>,
    history: RollingHistory,
}

struct Inner {
    rules: HashMap<String, RuleState>,
    resolved_history: Vec<Alert>,
    notifications_sent: u64,
}

pub struct AlertManager {
    inner: RwLock<Inner>,
    notifiers: RwLock<Vec<std::sync::Arc<dyn AlertNotifier>>>,
    clock: Box<dyn Clock>,
}

/// Small trading-domain default rule set (§A.3-3): latency, error-rate spike, and a
/// drawdown-adjacent metric, seeded on construction when `auto_add_defaults` is set.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "high_request_latency",
            "broker_request_latency_ms",
            Comparison::Gt,
            500.0,
            Severity::Warning,
        )
        .with_duration(30),
        AlertRule::new(
            "elevated_error_rate",
            "handler_errors_total",
            Comparison::Gt,
            5.0,
            Severity::Error,
        )
        .with_duration(60),
        AlertRule::new(
            "drawdown_approaching_limit",
            "backtest_max_drawdown_pct",
            Comparison::Gte,
            15.0,
            Severity::Critical,
        )
        .with_duration(0),
    ]
}

impl AlertManager {
    pub fn new(auto_add_defaults: bool) -> Self {
        let manager = Self {
            inner: RwLock::new(Inner {
                rules: HashMap::new(),
                resolved_history: Vec::new(),
                notifications_sent: 0,
            }),
            notifiers: RwLock::new(Vec::new()),
            clock: Box::new(SystemClock),
        };
        if auto_add_defaults {
            for rule in default_rules() {
                manager.add_rule(rule);
            }
        }
        manager
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.inner.write().rules.insert(
            rule.name.clone(),
            RuleState {
                rule,
                firing_since: None,
                active_alert: None,
                silence_until: None,
                history: RollingHistory::new(100),
            },
        );
    }

    pub fn add_notifier(&self, notifier: std::sync::Arc<dyn AlertNotifier>) {
        self.notifiers.write().push(notifier);
    }

    pub fn silence(&self, rule_name: &str, minutes: i64) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        if let Some(state) = inner.rules.get_mut(rule_name) {
            state.silence_until = Some(now + chrono::Duration::minutes(minutes));
            if let Some(alert) = state.active_alert.as_mut() {
                alert.state = AlertState::Silenced;
            }
        }
    }

    /// Iterates every enabled, non-silenced rule against `metrics`: compares the current
    /// value, gates `pending -> firing` on `duration_seconds`, dispatches notifiers
    /// exactly once on that transition, and demotes to `resolved` when the condition
    /// stops holding. Returns alerts that newly fired this evaluation.
    pub async fn evaluate(&self, metrics: &HashMap<String, f64>) -> Vec<Alert> {
        let now = self.clock.now();
        let mut newly_firing = Vec::new();
        let mut to_notify: Vec<Alert> = Vec::new();

        {
            let mut inner = self.inner.write();
            let rule_names: Vec<String> = inner.rules.keys().cloned().collect();
            for name in rule_names {
                let silence_expired;
                {
                    let state = inner.rules.get_mut(&name).unwrap();
                    if let Some(until) = state.silence_until {
                        if until <= now {
                            state.silence_until = None;
                        }
                    }
                    silence_expired = state.silence_until.is_none();
                }

                let state = inner.rules.get_mut(&name).unwrap();
                if !state.rule.enabled {
                    continue;
                }
                let Some(&value) = metrics.get(&state.rule.metric_name) else {
                    continue;
                };
                state.history.push(value);

                if !silence_expired {
                    continue;
                }

                let holds = state.rule.comparison.holds(value, state.rule.threshold);

                if holds {
                    if state.firing_since.is_none() {
                        state.firing_since = Some(now);
                    }
                    let held_long_enough = now - state.firing_since.unwrap()
                        >= chrono::Duration::seconds(state.rule.duration_seconds);

                    if held_long_enough && state.active_alert.is_none() {
                        let alert = Alert {
                            id: format!("alert_{}", short_id()),
                            rule_name: state.rule.name.clone(),
                            metric_name: state.rule.metric_name.clone(),
                            value,
                            severity: state.rule.severity,
                            state: AlertState::Firing,
                            labels: state.rule.labels.clone(),
                            firing_since: state.firing_since,
                            resolved_at: None,
                            created_at: now,
                        };
                        state.active_alert = Some(alert.clone());
                        newly_firing.push(alert.clone());
                        to_notify.push(alert);
                    }
                } else {
                    state.firing_since = None;
                    if let Some(mut alert) = state.active_alert.take() {
                        alert.state = AlertState::Resolved;
                        alert.resolved_at = Some(now);
                        inner.resolved_history.push(alert);
                    }
                }

                if state.rule.anomaly_detection {
                    if let Some(anomaly) = self.check_anomaly(&name, state, value, now) {
                        newly_firing.push(anomaly.clone());
                        to_notify.push(anomaly);
                    }
                }
            }
        }

        let notifiers = self.notifiers.read().clone();
        for alert in &to_notify {
            let mut any_sent = false;
            for notifier in notifiers.iter() {
                if notifier.send(alert).await {
                    any_sent = true;
                }
            }
            if any_sent {
                self.inner.write().notifications_sent += 1;
            }
        }

        newly_firing
    }

    fn check_anomaly(
        &self,
        _rule_name: &str,
        state: &RuleState,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let samples = &state.history.values;
        if samples.len() < 10 {
            return None;
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return None;
        }
        let z = (value - mean) / std_dev;
        if z.abs() <= 3.0 {
            return None;
        }
        let mut labels = HashMap::new();
        labels.insert("type".to_string(), "anomaly".to_string());
        labels.insert("metric".to_string(), state.rule.metric_name.clone());
        Some(Alert {
            id: format!("alert_{}", short_id()),
            rule_name: format!("{}_anomaly", state.rule.name),
            metric_name: state.rule.metric_name.clone(),
            value,
            severity: Severity::Warning,
            state: AlertState::Firing,
            labels,
            firing_since: Some(now),
            resolved_at: None,
            created_at: now,
        })
    }

    pub fn notifications_sent(&self) -> u64 {
        self.inner.read().notifications_sent
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.inner
            .read()
            .rules
            .values()
            .filter_map(|s| s.active_alert.clone())
            .collect()
    }

    pub fn resolved_history(&self) -> Vec<Alert> {
        self.inner.read().resolved_history.clone()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingNotifier(std::sync::atomic::AtomicU64);

    #[async_trait]
    impl AlertNotifier for CountingNotifier {
        async fn send(&self, _alert: &Alert) -> bool {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn duration_gate_delays_promotion_to_firing() {
        let manager = AlertManager::new(false);
        manager.add_rule(
            AlertRule::new("high_cpu", "cpu_pct", Comparison::Gt, 90.0, Severity::Warning)
                .with_duration(3600),
        );
        let mut metrics = HashMap::new();
        metrics.insert("cpu_pct".to_string(), 95.0);
        let fired = manager.evaluate(&metrics).await;
        assert!(fired.is_empty(), "duration not yet satisfied");
    }

    #[tokio::test]
    async fn immediate_duration_fires_and_notifies_once() {
        let manager = AlertManager::new(false);
        manager.add_rule(AlertRule::new(
            "high_cpu",
            "cpu_pct",
            Comparison::Gt,
            90.0,
            Severity::Warning,
        ));
        let notifier = std::sync::Arc::new(CountingNotifier(std::sync::atomic::AtomicU64::new(0)));
        manager.add_notifier(notifier.clone());

        let mut metrics = HashMap::new();
        metrics.insert("cpu_pct".to_string(), 95.0);
        let fired = manager.evaluate(&metrics).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(notifier.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Still firing: no duplicate notification.
        manager.evaluate(&metrics).await;
        assert_eq!(notifier.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        metrics.insert("cpu_pct".to_string(), 10.0);
        manager.evaluate(&metrics).await;
        assert!(manager.active_alerts().is_empty());
        assert_eq!(manager.resolved_history().len(), 1);
    }

    #[tokio::test]
    async fn silence_suppresses_firing() {
        let manager = AlertManager::new(false);
        manager.add_rule(AlertRule::new(
            "high_cpu",
            "cpu_pct",
            Comparison::Gt,
            90.0,
            Severity::Warning,
        ));
        manager.silence("high_cpu", 60);
        let mut metrics = HashMap::new();
        metrics.insert("cpu_pct".to_string(), 99.0);
        let fired = manager.evaluate(&metrics).await;
        assert!(fired.is_empty());
    }
}
