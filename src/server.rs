//! MCP server implementation.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::error::{codes, Result};
use crate::protocol::{
    Implementation, InitializeParams, InitializeResult, JsonRpcId, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, McpMessage, ServerCapabilities, ToolCallParams,
    ToolsCapability,
};
use crate::tools::ToolRegistry;

/// Newest MCP protocol version this server speaks.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions accepted during `initialize`.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2024-11-05", "2025-03-26", "2025-06-18"];

/// Server name.
pub const SERVER_NAME: &str = "autoscraper-mcp";

/// Server version.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const INSTRUCTIONS: &str = "Call init_scraper with a URL and a few example values visible on that page, \
then scrape_data on pages with the same layout. Results can be stored as sqlite, json or csv.";

/// MCP server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialization.
    Uninitialized,
    /// Server is initialized and ready.
    Ready,
    /// Server is shutting down.
    ShuttingDown,
}

/// MCP server for the scraper tools.
pub struct McpServer {
    state: Arc<RwLock<ServerState>>,
    tools: Arc<ToolRegistry>,
    client: Arc<RwLock<Option<Implementation>>>,
}

impl McpServer {
    /// Create a server for `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(ToolRegistry::new(config))
    }

    /// Create a server over a prepared tool registry.
    pub fn with_registry(tools: ToolRegistry) -> Self {
        Self {
            state: Arc::new(RwLock::new(ServerState::Uninitialized)),
            tools: Arc::new(tools),
            client: Arc::new(RwLock::new(None)),
        }
    }

    /// The tool registry.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Run the server on stdio.
    pub async fn run_stdio(&self) -> Result<()> {
        tracing::info!("MCP server starting on stdio");
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.serve(stdin, stdout).await?;
        tracing::info!("MCP server shutting down");
        Ok(())
    }

    /// Serve newline-delimited JSON-RPC until EOF or shutdown.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            tracing::debug!("Received: {}", line);

            if let Some(response) = self.handle_message(line).await {
                let json = serde_json::to_string(&response)?;
                tracing::debug!("Sending: {}", json);
                writer.write_all(json.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }

            if self.state().await == ServerState::ShuttingDown {
                break;
            }
        }
        Ok(())
    }

    /// Handle an incoming message.
    pub async fn handle_message(&self, json: &str) -> Option<JsonRpcResponse> {
        match McpMessage::parse(json) {
            Ok(McpMessage::Request(request)) => Some(self.handle_request(request).await),
            Ok(McpMessage::Notification(notification)) => {
                self.handle_notification(notification).await;
                None
            }
            Ok(McpMessage::Response(_)) => {
                tracing::debug!("ignoring unsolicited response");
                None
            }
            Err(crate::Error::JsonRpc { code, message }) => {
                Some(JsonRpcResponse::error(None, code, message))
            }
            Err(e) => Some(JsonRpcResponse::error(None, codes::PARSE_ERROR, e.to_string())),
        }
    }

    /// Handle a JSON-RPC request.
    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();

        match request.method.as_str() {
            "initialize" => self.handle_initialize(id, request.params).await,
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, request.params).await,
            "shutdown" => {
                *self.state.write().await = ServerState::ShuttingDown;
                JsonRpcResponse::success(id, json!({}))
            }
            _ => JsonRpcResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("method not found: {}", request.method),
            ),
        }
    }

    /// Handle a notification (no response expected).
    async fn handle_notification(&self, notification: JsonRpcRequest) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                tracing::info!("Client initialized");
            }
            "notifications/cancelled" => {
                tracing::debug!("Request cancelled by client");
            }
            "exit" => {
                *self.state.write().await = ServerState::ShuttingDown;
            }
            _ => {
                tracing::debug!("Unknown notification: {}", notification.method);
            }
        }
    }

    async fn handle_initialize(&self, id: Option<JsonRpcId>, params: Option<Value>) -> JsonRpcResponse {
        let params: InitializeParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid initialize params: {}", e),
                );
            }
            None => {
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "initialize params required");
            }
        };

        let protocol_version = negotiate_version(&params.protocol_version);
        tracing::info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol = protocol_version,
            "initializing"
        );
        *self.client.write().await = Some(params.client_info);
        *self.state.write().await = ServerState::Ready;

        let result = InitializeResult {
            protocol_version: protocol_version.into(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
                logging: None,
            },
            server_info: Implementation {
                name: SERVER_NAME.into(),
                version: SERVER_VERSION.into(),
            },
            instructions: Some(INSTRUCTIONS.into()),
        };

        JsonRpcResponse::success(id, result)
    }

    async fn handle_tools_list(&self, id: Option<JsonRpcId>) -> JsonRpcResponse {
        if self.state().await != ServerState::Ready {
            return JsonRpcResponse::error(id, codes::INTERNAL_ERROR, "server not initialized");
        }

        JsonRpcResponse::success(
            id,
            ListToolsResult {
                tools: self.tools.list_tools(),
            },
        )
    }

    async fn handle_tools_call(&self, id: Option<JsonRpcId>, params: Option<Value>) -> JsonRpcResponse {
        if self.state().await != ServerState::Ready {
            return JsonRpcResponse::error(id, codes::INTERNAL_ERROR, "server not initialized");
        }

        let params: ToolCallParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid tool call params: {}", e),
                );
            }
            None => {
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "tool call params required");
            }
        };

        tracing::info!(tool = %params.name, "tool call");
        match self.tools.execute(&params.name, params.arguments).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                tracing::error!("Tool {} failed: {}", params.name, e);
                JsonRpcResponse::from_error(id, &e)
            }
        }
    }
}

/// Echo a supported client version, otherwise offer the newest one.
fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|v| *v == requested)
        .unwrap_or(PROTOCOL_VERSION)
}

#[cfg(feature = "http")]
pub mod http {
    //! Streamable-HTTP style transport: one JSON-RPC message per POST.

    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use tower::ServiceBuilder;
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    use super::McpServer;
    use crate::error::Result;

    /// Router exposing `POST /mcp`.
    pub fn router(server: Arc<McpServer>) -> Router {
        Router::new()
            .route("/mcp", post(handle))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(server)
    }

    async fn handle(State(server): State<Arc<McpServer>>, body: String) -> Response {
        match server.handle_message(&body).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        }
    }

    /// Serve on `addr` until the process exits.
    pub async fn run(server: Arc<McpServer>, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("MCP server listening on http://{}/mcp", listener.local_addr()?);
        axum::serve(listener, router(server)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JSONRPC_VERSION;

    fn server() -> (McpServer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::with_data_dir(dir.path());
        config.loader = crate::config::LoaderKind::Http;
        (McpServer::new(config), dir)
    }

    fn init_line(version: &str) -> String {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": version,
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "0.1.0"}
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn tools_require_initialize() {
        let (server, _dir) = server();
        let resp = server
            .handle_message(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn initialize_negotiates_version() {
        let (server, _dir) = server();
        let resp = server.handle_message(&init_line("2024-11-05")).await.unwrap();
        assert_eq!(resp.result.unwrap()["protocolVersion"], "2024-11-05");
        assert_eq!(server.state().await, ServerState::Ready);

        let resp = server.handle_message(&init_line("1999-01-01")).await.unwrap();
        assert_eq!(resp.result.unwrap()["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn errors_map_to_json_rpc_codes() {
        let (server, _dir) = server();
        server.handle_message(&init_line(PROTOCOL_VERSION)).await;

        let parse = server.handle_message("{oops").await.unwrap();
        assert_eq!(parse.error.unwrap().code, codes::PARSE_ERROR);

        let envelope = server
            .handle_message(r#"{"id":5,"method":7}"#)
            .await
            .unwrap();
        assert_eq!(envelope.error.unwrap().code, codes::INVALID_REQUEST);

        let unknown = server
            .handle_message(r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#)
            .await
            .unwrap();
        assert_eq!(unknown.error.unwrap().code, codes::METHOD_NOT_FOUND);

        let bad_tool = server
            .handle_message(r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"nope"}}"#)
            .await
            .unwrap();
        assert_eq!(bad_tool.error.unwrap().code, codes::METHOD_NOT_FOUND);

        assert!(server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn serve_answers_each_request_line_and_stops_on_shutdown() {
        let (server, _dir) = server();
        let input = format!(
            "{}\n\n{}\n{}\n{}\n",
            init_line(PROTOCOL_VERSION),
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"shutdown"}"#,
            r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#,
        );
        let mut output = Vec::new();
        server
            .serve(BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        let ids: Vec<i64> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[cfg(feature = "http")]
    #[tokio::test]
    async fn http_transport_answers_requests_and_accepts_notifications() {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        let (server, _dir) = server();
        let app = http::router(Arc::new(server));
        let post = |body: String| {
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        };
        async fn json_body(response: axum::response::Response) -> Value {
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            serde_json::from_slice(&bytes).unwrap()
        }

        let response = app.clone().oneshot(post(init_line(PROTOCOL_VERSION))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["result"]["serverInfo"]["name"], SERVER_NAME);

        let response = app
            .clone()
            .oneshot(post(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.into()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .oneshot(post(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#.into()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = json_body(response).await;
        assert_eq!(listed["id"], 2);
        assert_eq!(listed["result"]["tools"].as_array().unwrap().len(), 6);
    }
}
