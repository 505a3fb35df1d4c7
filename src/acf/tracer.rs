//! C3 — Tracer.
//!
//! Span tree with parent/child linkage, a W3C-traceparent-style propagation header, and
//! pluggable exporters gated by a per-trace sampling decision. Grounded on
//! `examples/original_source/backend/agents/monitoring/tracing.py`'s `Tracer`/`Span`.
//!
//! Per §A.4's resolved open question: `sample_rate` gates *export only*, decided once at
//! trace creation; every span is always created and tracked regardless of the decision.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{long_id, Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Internal,
    Client,
    Server,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, Value>,
    pub events: Vec<SpanEvent>,
}

impl Span {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn add_event(&mut self, name: impl Into<String>, attributes: HashMap<String, Value>) {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: Utc::now(),
            attributes,
        });
    }

    pub fn record_error(&mut self, error_type: &str, message: &str) {
        self.status = SpanStatus::Error;
        self.attributes
            .insert("error.type".to_string(), Value::String(error_type.to_string()));
        self.attributes
            .insert("error.message".to_string(), Value::String(message.to_string()));
    }
}

/// A context identifying the active span for propagation — `(trace_id, span_id)`,
/// carried explicitly per §9's "explicit context values" design note instead of a
/// task-local `Span` object.
#[derive(Debug, Clone, Copy)]
pub struct SpanContext<'a> {
    pub trace_id: &'a str,
    pub span_id: &'a str,
}

/// Renders `00-<trace_id>-<span_id>-01`, the W3C-style propagation header from §4.2.
pub fn render_traceparent(trace_id: &str, span_id: &str) -> String {
    format!("00-{trace_id}-{span_id}-01")
}

/// Parses a `render_traceparent` header back into `(trace_id, span_id)`.
pub fn parse_traceparent(header: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = header.split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    Some((parts[1].to_string(), parts[2].to_string()))
}

#[async_trait]
pub trait TraceExporter: Send + Sync {
    async fn export(&self, span: &Span);
}

pub struct ConsoleExporter;

#[async_trait]
impl TraceExporter for ConsoleExporter {
    async fn export(&self, span: &Span) {
        tracing::debug!(trace_id = %span.trace_id, span_id = %span.span_id, name = %span.name, "span exported");
    }
}

pub struct FileExporter {
    path: std::path::PathBuf,
}

impl FileExporter {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TraceExporter for FileExporter {
    async fn export(&self, span: &Span) {
        use std::io::Write;
        let line = match serde_json::to_string(span) {
            Ok(json) => json,
            Err(_) => return,
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = result {
            tracing::warn!(%err, "trace exporter write failed");
        }
    }
}

struct TraceRecord {
    created_at: DateTime<Utc>,
    sampled: bool,
}

struct Inner {
    spans: HashMap<String, Span>,
    traces: HashMap<String, TraceRecord>,
    trace_order: Vec<String>,
}

pub struct Tracer {
    inner: RwLock<Inner>,
    exporters: RwLock<Vec<Arc<dyn TraceExporter>>>,
    sample_rate: f64,
    max_traces: usize,
    clock: Box<dyn Clock>,
}

impl Tracer {
    pub fn new(sample_rate: f64, max_traces: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                spans: HashMap::new(),
                traces: HashMap::new(),
                trace_order: Vec::new(),
            }),
            exporters: RwLock::new(vec![Arc::new(ConsoleExporter)]),
            sample_rate: sample_rate.clamp(0.0, 1.0),
            max_traces,
            clock: Box::new(SystemClock),
        }
    }

    pub fn add_exporter(&self, exporter: Arc<dyn TraceExporter>) {
        self.exporters.write().push(exporter);
    }

    fn decide_sampled(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.sample_rate
    }

    /// Starts a span. Parent resolution order per §4.2: explicit `parent` → (caller-
    /// supplied) current context → new trace. Since "current context" is an explicit
    /// value in this design (§9), callers thread it themselves; passing `None` always
    /// starts a new trace.
    pub fn start_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<SpanContext<'_>>,
        attributes: HashMap<String, Value>,
    ) -> Span {
        let now = self.clock.now();
        let (trace_id, parent_span_id, sampled) = match parent {
            Some(ctx) => {
                let sampled = self
                    .inner
                    .read()
                    .traces
                    .get(ctx.trace_id)
                    .map(|t| t.sampled)
                    .unwrap_or(true);
                (ctx.trace_id.to_string(), Some(ctx.span_id.to_string()), sampled)
            }
            None => (long_id(), None, self.decide_sampled()),
        };

        let span = Span {
            name: name.into(),
            trace_id: trace_id.clone(),
            span_id: long_id(),
            parent_span_id,
            kind,
            status: SpanStatus::Unset,
            start_time: now,
            end_time: None,
            attributes,
            events: Vec::new(),
        };

        let mut inner = self.inner.write();
        inner.spans.insert(span.span_id.clone(), span.clone());
        inner.traces.entry(trace_id.clone()).or_insert_with(|| {
            TraceRecord {
                created_at: now,
                sampled,
            }
        });
        if !inner.trace_order.contains(&trace_id) {
            inner.trace_order.push(trace_id.clone());
        }
        self.evict_oldest(&mut inner);
        span
    }

    fn evict_oldest(&self, inner: &mut Inner) {
        while inner.trace_order.len() > self.max_traces {
            let oldest = inner.trace_order.remove(0);
            inner.traces.remove(&oldest);
            inner.spans.retain(|_, s| s.trace_id != oldest);
        }
    }

    /// Ends `span`, stamping `end_time` and defaulting status to `Ok` if unset, then
    /// exports if the owning trace was sampled. Exporter errors are caught inside each
    /// exporter and never reach the caller.
    pub async fn end_span(&self, mut span: Span) {
        span.end_time = Some(self.clock.now());
        if span.status == SpanStatus::Unset {
            span.status = SpanStatus::Ok;
        }

        let sampled = {
            let mut inner = self.inner.write();
            inner.spans.insert(span.span_id.clone(), span.clone());
            inner
                .traces
                .get(&span.trace_id)
                .map(|t| t.sampled)
                .unwrap_or(true)
        };

        if sampled {
            let exporters = self.exporters.read().clone();
            for exporter in exporters.iter() {
                exporter.export(&span).await;
            }
        }
    }

    pub fn spans_for_trace(&self, trace_id: &str) -> Vec<Span> {
        self.inner
            .read()
            .spans
            .values()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect()
    }

    /// Drains exporters (a no-op for stateless exporters) and evicts everything tracked.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write();
        inner.spans.clear();
        inner.traces.clear();
        inner.trace_order.clear();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(1.0, 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceparent_round_trips() {
        let header = render_traceparent("abc123", "def456");
        let (trace_id, span_id) = parse_traceparent(&header).unwrap();
        assert_eq!(trace_id, "abc123");
        assert_eq!(span_id, "def456");
    }

    #[tokio::test]
    async fn child_span_inherits_trace_id() {
        let tracer = Tracer::new(1.0, 10);
        let root = tracer.start_span("root", SpanKind::Internal, None, HashMap::new());
        let ctx = SpanContext {
            trace_id: &root.trace_id,
            span_id: &root.span_id,
        };
        let child = tracer.start_span("child", SpanKind::Internal, Some(ctx), HashMap::new());
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        tracer.end_span(child).await;
        tracer.end_span(root).await;
    }

    #[tokio::test]
    async fn unsampled_trace_still_produces_spans() {
        let tracer = Tracer::new(0.0, 10);
        let span = tracer.start_span("root", SpanKind::Internal, None, HashMap::new());
        let trace_id = span.trace_id.clone();
        tracer.end_span(span).await;
        assert_eq!(tracer.spans_for_trace(&trace_id).len(), 1);
    }

    #[tokio::test]
    async fn end_span_defaults_status_to_ok() {
        let tracer = Tracer::new(1.0, 10);
        let span = tracer.start_span("root", SpanKind::Internal, None, HashMap::new());
        let trace_id = span.trace_id.clone();
        tracer.end_span(span).await;
        let stored = &tracer.spans_for_trace(&trace_id)[0];
        assert_eq!(stored.status, SpanStatus::Ok);
        assert!(stored.end_time.is_some());
    }
}
