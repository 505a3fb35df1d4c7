//! C10 — Tool Registry (MCP tools).
//!
//! Tool definitions with JSON-schema-shaped inputs, execution stats, categories and
//! permissions, built via a `ToolBuilder` per §9's "decorator-registered tools →
//! builder pattern" design note. Grounded on
//! `examples/original_source/backend/agents/mcp/tool_registry.py`'s `ToolRegistry`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn json_schema_name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Public,
    Authenticated,
    Admin,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub enum_values: Option<Vec<Value>>,
    pub item_type: Option<ParamType>,
    pub description: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            enum_values: None,
            item_type: None,
            description: String::new(),
        }
    }

    fn to_json_schema(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), Value::String(self.param_type.json_schema_name().to_string()));
        if !self.description.is_empty() {
            obj.insert("description".to_string(), Value::String(self.description.clone()));
        }
        if let Some(enum_values) = &self.enum_values {
            obj.insert("enum".to_string(), Value::Array(enum_values.clone()));
        }
        if self.param_type == ParamType::Array {
            if let Some(item_type) = self.item_type {
                let mut items = serde_json::Map::new();
                items.insert("type".to_string(), Value::String(item_type.json_schema_name().to_string()));
                obj.insert("items".to_string(), Value::Object(items));
            }
        }
        if let Some(default) = &self.default {
            obj.insert("default".to_string(), default.clone());
        }
        Value::Object(obj)
    }
}

/// Builder for a `Tool` definition, per §9's explicit-builder design note replacing
/// decorator-based introspection.
pub struct ToolBuilder {
    name: String,
    description: String,
    params: Vec<Parameter>,
    permission: Permission,
    category: String,
    tags: Vec<String>,
    version: String,
    deprecated: bool,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            permission: Permission::Public,
            category: "general".to_string(),
            tags: Vec::new(),
            version: "1.0.0".to_string(),
            deprecated: false,
        }
    }

    pub fn param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn build(self, handler: Arc<dyn ToolHandler>) -> Tool {
        Tool {
            name: self.name,
            description: self.description,
            params: self.params,
            permission: self.permission,
            category: self.category,
            tags: self.tags,
            version: self.version,
            deprecated: self.deprecated,
            handler,
            stats: RwLock::new(ToolStats::default()),
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value, String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub total_latency_ms: f64,
    pub last_call: Option<DateTime<Utc>>,
}

pub struct Tool {
    pub name: String,
    pub description: String,
    pub params: Vec<Parameter>,
    pub permission: Permission,
    pub category: String,
    pub tags: Vec<String>,
    pub version: String,
    pub deprecated: bool,
    handler: Arc<dyn ToolHandler>,
    stats: RwLock<ToolStats>,
}

impl Tool {
    /// Builds the JSON Schema object `{type: object, properties, required}` per §4.9's
    /// parameter-schema-generation rule (required iff no default).
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(param.name.clone(), param.to_json_schema());
            if param.required && param.default.is_none() {
                required.push(Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn stats(&self) -> ToolStats {
        self.stats.read().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, tool: Tool) {
        self.tools.write().insert(tool.name.clone(), Arc::new(tool));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn list(
        &self,
        category: Option<&str>,
        permission: Option<Permission>,
        include_deprecated: bool,
    ) -> Vec<Arc<Tool>> {
        self.tools
            .read()
            .values()
            .filter(|t| category.map(|c| t.category == c).unwrap_or(true))
            .filter(|t| permission.map(|p| t.permission == p).unwrap_or(true))
            .filter(|t| include_deprecated || !t.deprecated)
            .cloned()
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<ToolResult, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let started = std::time::Instant::now();
        let outcome = tool.handler.call(args).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut stats = tool.stats.write();
            stats.calls += 1;
            stats.total_latency_ms += elapsed_ms;
            stats.last_call = Some(Utc::now());
            if outcome.is_ok() {
                stats.successes += 1;
            }
        }

        Ok(match outcome {
            Ok(data) => ToolResult {
                success: true,
                data: Some(data),
                error: None,
                execution_time_ms: elapsed_ms,
            },
            Err(err) => ToolResult {
                success: false,
                data: None,
                error: Some(err),
                execution_time_ms: elapsed_ms,
            },
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AddTool;

    #[async_trait]
    impl ToolHandler for AddTool {
        async fn call(&self, args: Value) -> Result<Value, String> {
            let a = args.get("a").and_then(|v| v.as_f64()).ok_or("missing a")?;
            let b = args.get("b").and_then(|v| v.as_f64()).ok_or("missing b")?;
            Ok(Value::from(a + b))
        }
    }

    #[tokio::test]
    async fn execute_updates_stats_and_returns_result() {
        let registry = ToolRegistry::new();
        registry.add(
            ToolBuilder::new("add", "adds two numbers")
                .param(Parameter::new("a", ParamType::Number))
                .param(Parameter::new("b", ParamType::Number))
                .build(Arc::new(AddTool)),
        );

        let result = registry.execute("add", serde_json::json!({"a": 2, "b": 3})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(Value::from(5.0)));

        let stats = registry.get("add").unwrap().stats();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn execute_unknown_tool_errors() {
        let registry = ToolRegistry::new();
        assert!(matches!(registry.execute("ghost", Value::Null).await, Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn schema_marks_required_params_without_defaults() {
        let tool = ToolBuilder::new("t", "desc")
            .param(Parameter::new("required_param", ParamType::String))
            .param({
                let mut p = Parameter::new("optional_param", ParamType::Integer);
                p.default = Some(Value::from(5));
                p
            })
            .build(Arc::new(AddTool));
        let schema = tool.input_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&Value::String("required_param".to_string())));
        assert!(!required.contains(&Value::String("optional_param".to_string())));
    }
}
