//! C11 — MCP Protocol.
//!
//! JSON-RPC 2.0 request/response/error envelopes over the standard `tools/*`,
//! `resources/*`, `prompts/*` methods (§4.9/§6.1), plus an in-memory paired-queue
//! transport. Grounded on
//! `examples/original_source/backend/agents/mcp/protocol.py`'s `MCPServer` and
//! `examples/original_source/backend/agents/mcp/resource_manager.py`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::tool_registry::ToolRegistry;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContent {
    pub uri: String,
    pub mime_type: String,
    pub text: Option<String>,
    pub blob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPrompt {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<String>,
}

pub struct ResourceManager {
    resources: HashMap<String, (McpResource, ResourceContent)>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
        }
    }

    pub fn add(&mut self, resource: McpResource, content: ResourceContent) {
        self.resources.insert(resource.uri.clone(), (resource, content));
    }

    pub fn list(&self) -> Vec<McpResource> {
        self.resources.values().map(|(r, _)| r.clone()).collect()
    }

    pub fn read(&self, uri: &str) -> Option<ResourceContent> {
        self.resources.get(uri).map(|(_, c)| c.clone())
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PromptRegistry {
    prompts: HashMap<String, McpPrompt>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self {
            prompts: HashMap::new(),
        }
    }

    pub fn add(&mut self, prompt: McpPrompt) {
        self.prompts.insert(prompt.name.clone(), prompt);
    }

    pub fn list(&self) -> Vec<McpPrompt> {
        self.prompts.values().cloned().collect()
    }

    pub fn get(&self, name: &str, arguments: Option<&Value>) -> Option<Value> {
        let prompt = self.prompts.get(name)?;
        let rendered = arguments
            .map(|a| a.to_string())
            .unwrap_or_default();
        Some(serde_json::json!({
            "description": prompt.description,
            "messages": [{"role": "user", "content": format!("{}:{}", prompt.name, rendered)}],
        }))
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches JSON-RPC requests against the tool registry and resource/prompt tables.
pub struct McpServer {
    pub tools: Arc<ToolRegistry>,
    pub resources: ResourceManager,
    pub prompts: PromptRegistry,
    pub server_name: String,
    pub server_version: String,
}

impl McpServer {
    pub fn new(tools: Arc<ToolRegistry>, server_name: impl Into<String>, server_version: impl Into<String>) -> Self {
        Self {
            tools,
            resources: ResourceManager::new(),
            prompts: PromptRegistry::new(),
            server_name: server_name.into(),
            server_version: server_version.into(),
        }
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::ok(
                request.id,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
                    "serverInfo": {"name": self.server_name, "version": self.server_version},
                }),
            ),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .list(None, None, false)
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": t.input_schema(),
                        })
                    })
                    .collect();
                JsonRpcResponse::ok(request.id, serde_json::json!({"tools": tools}))
            }
            "tools/call" => {
                let Some(params) = request.params else {
                    return JsonRpcResponse::err(request.id, INTERNAL_ERROR, "missing params", None);
                };
                let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
                    return JsonRpcResponse::err(request.id, INTERNAL_ERROR, "missing tool name", None);
                };
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));
                match self.tools.execute(name, arguments).await {
                    Ok(result) if result.success => JsonRpcResponse::ok(
                        request.id,
                        serde_json::json!({"content": [{"type": "text", "text": result.data.unwrap_or(Value::Null).to_string()}]}),
                    ),
                    Ok(result) => JsonRpcResponse::err(
                        request.id,
                        INTERNAL_ERROR,
                        result.error.unwrap_or_default(),
                        None,
                    ),
                    Err(err) => JsonRpcResponse::err(request.id, METHOD_NOT_FOUND, err.to_string(), None),
                }
            }
            "resources/list" => {
                JsonRpcResponse::ok(request.id, serde_json::json!({"resources": self.resources.list()}))
            }
            "resources/read" => {
                let uri = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(|v| v.as_str());
                match uri.and_then(|u| self.resources.read(u)) {
                    Some(content) => JsonRpcResponse::ok(request.id, serde_json::json!({"contents": [content]})),
                    None => JsonRpcResponse::err(request.id, METHOD_NOT_FOUND, "unknown resource", None),
                }
            }
            "prompts/list" => JsonRpcResponse::ok(request.id, serde_json::json!({"prompts": self.prompts.list()})),
            "prompts/get" => {
                let name = request.params.as_ref().and_then(|p| p.get("name")).and_then(|v| v.as_str());
                let arguments = request.params.as_ref().and_then(|p| p.get("arguments"));
                match name.and_then(|n| self.prompts.get(n, arguments)) {
                    Some(result) => JsonRpcResponse::ok(request.id, result),
                    None => JsonRpcResponse::err(request.id, METHOD_NOT_FOUND, "unknown prompt", None),
                }
            }
            other => JsonRpcResponse::err(
                request.id,
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
                None,
            ),
        }
    }
}

/// In-memory paired-queue transport: a client and server each hold the other's sender.
pub struct InMemoryTransport {
    pub to_server: mpsc::Sender<JsonRpcRequest>,
    pub from_server: mpsc::Receiver<JsonRpcResponse>,
}

pub fn spawn_in_memory_server(server: Arc<McpServer>) -> InMemoryTransport {
    let (to_server_tx, mut to_server_rx) = mpsc::channel::<JsonRpcRequest>(64);
    let (from_server_tx, from_server_rx) = mpsc::channel::<JsonRpcResponse>(64);

    tokio::spawn(async move {
        while let Some(request) = to_server_rx.recv().await {
            let response = server.handle(request).await;
            if from_server_tx.send(response).await.is_err() {
                break;
            }
        }
    });

    InMemoryTransport {
        to_server: to_server_tx,
        from_server: from_server_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acf::tool_registry::{Parameter, ParamType, ToolBuilder, ToolHandler};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value) -> Result<Value, String> {
            Ok(args)
        }
    }

    fn build_server() -> McpServer {
        let registry = Arc::new(ToolRegistry::new());
        registry.add(
            ToolBuilder::new("echo", "echoes input")
                .param(Parameter::new("value", ParamType::String))
                .build(Arc::new(Echo)),
        );
        McpServer::new(registry, "test-server", "0.1.0")
    }

    #[tokio::test]
    async fn initialize_negotiates_protocol_version() {
        let server = build_server();
        let response = server
            .handle(JsonRpcRequest::new(Value::from(1), "initialize", None))
            .await;
        assert_eq!(
            response.result.unwrap()["protocolVersion"],
            Value::String(PROTOCOL_VERSION.to_string())
        );
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_not_found() {
        let server = build_server();
        let response = server
            .handle(JsonRpcRequest::new(Value::from(1), "bogus/method", None))
            .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_call_round_trips_through_registry() {
        let server = build_server();
        let response = server
            .handle(JsonRpcRequest::new(
                Value::from(2),
                "tools/call",
                Some(serde_json::json!({"name": "echo", "arguments": {"value": "hi"}})),
            ))
            .await;
        let result = response.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("hi"));
    }
}
