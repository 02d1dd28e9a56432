//! MCP server: JSON-RPC method dispatch over the two governed tools.

use std::sync::Arc;

use memlock_core::facade::MemoryFacade;
use serde_json::{Value, json};

use crate::protocol::messages::{
    CallToolRequest, CallToolResult, InitializeRequest, InitializeResult, ListToolsResult,
    ServerCapabilities, ServerInfo, ToolResultContent,
};
use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_VERSION};
use crate::tools;

pub struct McpServer {
    facade: Arc<MemoryFacade>,
    initialized: bool,
}

impl McpServer {
    pub fn new(facade: Arc<MemoryFacade>) -> Self {
        Self {
            facade,
            initialized: false,
        }
    }

    /// Dispatch one JSON-RPC request. Returns `None` for notifications,
    /// which have no response.
    pub async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if !self.initialized
            && request.method != "initialize"
            && request.method != "notifications/initialized"
        {
            return Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::server_not_initialized(),
            ));
        }

        match request.method.as_str() {
            "initialize" => {
                let result = self.handle_initialize(request.params);
                Some(JsonRpcResponse::success(
                    request.id,
                    serde_json::to_value(result).unwrap_or(Value::Null),
                ))
            }
            "notifications/initialized" => None,
            "tools/list" => {
                let result = self.handle_tools_list();
                Some(JsonRpcResponse::success(
                    request.id,
                    serde_json::to_value(result).unwrap_or(Value::Null),
                ))
            }
            "tools/call" => Some(self.handle_tools_call(request.id, request.params).await),
            "ping" => Some(JsonRpcResponse::success(request.id, json!({}))),
            _ => Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::method_not_found(),
            )),
        }
    }

    fn handle_initialize(&mut self, params: Option<Value>) -> InitializeResult {
        let request: InitializeRequest = params
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default();

        self.initialized = true;

        let protocol_version = if request.protocol_version < MCP_VERSION.to_string() {
            request.protocol_version
        } else {
            MCP_VERSION.to_string()
        };

        InitializeResult {
            protocol_version,
            server_info: ServerInfo {
                name: "memlock-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some(json!({"listChanged": false})),
            },
            instructions: Some(
                "Governed long-term memory store. Use store_memory to propose a fact and \
                 retrieve_memory to query the active facts known about a user."
                    .to_string(),
            ),
        }
    }

    fn handle_tools_list(&self) -> ListToolsResult {
        ListToolsResult {
            tools: vec![
                tools::store_memory::description(),
                tools::retrieve_memory::description(),
            ],
        }
    }

    async fn handle_tools_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let request: CallToolRequest = match params.and_then(|p| serde_json::from_value(p).ok()) {
            Some(r) => r,
            None => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("missing or invalid tools/call arguments"),
                );
            }
        };

        let result = match request.name.as_str() {
            "store_memory" => tools::store_memory::execute(&self.facade, request.arguments).await,
            "retrieve_memory" => {
                tools::retrieve_memory::execute(&self.facade, request.arguments).await
            }
            _ => {
                return JsonRpcResponse::error(id, JsonRpcError::method_not_found());
            }
        };

        let call_result = match result {
            Ok(value) => CallToolResult {
                content: vec![ToolResultContent {
                    content_type: "text".to_string(),
                    text: serde_json::to_string_pretty(&value).unwrap_or_default(),
                }],
                is_error: Some(false),
            },
            Err(message) => CallToolResult {
                content: vec![ToolResultContent {
                    content_type: "text".to_string(),
                    text: message,
                }],
                is_error: Some(true),
            },
        };

        JsonRpcResponse::success(id, serde_json::to_value(call_result).unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlock_core::Storage;

    fn test_server() -> (tempfile::TempDir, McpServer) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        let facade = Arc::new(MemoryFacade::new(storage, None));
        (dir, McpServer::new(facade))
    }

    fn make_request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn initialize_sets_flag_and_returns_server_info() {
        let (_dir, mut server) = test_server();
        let response = server
            .handle_request(make_request("initialize", None))
            .await
            .unwrap();
        assert!(server.initialized);
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "memlock-mcp");
    }

    #[tokio::test]
    async fn pre_init_calls_are_rejected() {
        let (_dir, mut server) = test_server();
        let response = server
            .handle_request(make_request("tools/list", None))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32003);
    }

    #[tokio::test]
    async fn notification_returns_none() {
        let (_dir, mut server) = test_server();
        server.handle_request(make_request("initialize", None)).await;
        let response = server
            .handle_request(make_request("notifications/initialized", None))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn tools_list_has_exactly_two_tools() {
        let (_dir, mut server) = test_server();
        server.handle_request(make_request("initialize", None)).await;
        let response = server
            .handle_request(make_request("tools/list", None))
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 2);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (_dir, mut server) = test_server();
        server.handle_request(make_request("initialize", None)).await;
        let response = server
            .handle_request(make_request("nonexistent", None))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let (_dir, mut server) = test_server();
        server.handle_request(make_request("initialize", None)).await;
        let response = server.handle_request(make_request("ping", None)).await.unwrap();
        assert_eq!(response.result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn tools_call_missing_arguments_is_invalid_params() {
        let (_dir, mut server) = test_server();
        server.handle_request(make_request("initialize", None)).await;
        let response = server
            .handle_request(make_request("tools/call", None))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn tools_call_unknown_tool_is_method_not_found() {
        let (_dir, mut server) = test_server();
        server.handle_request(make_request("initialize", None)).await;
        let response = server
            .handle_request(make_request(
                "tools/call",
                Some(json!({"name": "nonexistent_tool", "arguments": {}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn store_memory_roundtrip() {
        let (_dir, mut server) = test_server();
        server.handle_request(make_request("initialize", None)).await;

        let response = server
            .handle_request(make_request(
                "tools/call",
                Some(json!({
                    "name": "store_memory",
                    "arguments": {
                        "content": "User loves Rust",
                        "memoryDate": "2026-01-01",
                        "subject": "Preferences",
                        "importance": 5,
                        "userId": "u1"
                    }
                })),
            ))
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(false));
    }
}
