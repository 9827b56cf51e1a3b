//! MCP server validation tests.
//!
//! Drives the real binary over stdio: JSON-RPC 2.0 compliance, tool
//! execution against inline HTML, and error handling.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

const EVENTS: &str = r#"
<html><body>
  <table id="events">
    <tr class="event"><td class="name">Test Event 1</td><td class="date">2024-01-01</td></tr>
    <tr class="event"><td class="name">Test Event 2</td><td class="date">2024-01-02</td></tr>
  </table>
</body></html>"#;

// JSON-RPC 2.0 types
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl JsonRpcRequest {
    fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }

    fn tool(id: u64, name: &str, arguments: Value) -> Self {
        Self::new(id, "tools/call", Some(json!({"name": name, "arguments": arguments})))
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Parse the JSON payload a tool returns as its first text item.
    fn tool_payload(&self) -> Value {
        let text = self
            .result
            .as_ref()
            .and_then(|r| r.get("content"))
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or("null");
        serde_json::from_str(text).unwrap()
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    #[allow(dead_code)]
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    data: Option<Value>,
}

/// MCP test client for validating the server.
struct McpTestClient {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

impl McpTestClient {
    async fn spawn(data_dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let mut child = Command::new(env!("CARGO_BIN_EXE_autoscraper-mcp"))
            .arg("--loader")
            .arg("http")
            .arg("--data-dir")
            .arg(data_dir)
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take().ok_or("No stdout")?;

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
        })
    }

    async fn send_line(&mut self, line: &str) -> Result<(), Box<dyn std::error::Error>> {
        let stdin = self.child.stdin.as_mut().ok_or("No stdin")?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<JsonRpcResponse, Box<dyn std::error::Error>> {
        let mut line = String::new();
        let read = timeout(Duration::from_secs(5), self.stdout.read_line(&mut line)).await??;
        if read == 0 {
            return Err("Server closed connection".into());
        }
        Ok(serde_json::from_str(&line)?)
    }

    async fn send_request(
        &mut self,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, Box<dyn std::error::Error>> {
        self.send_line(&serde_json::to_string(&request)?).await?;
        self.read_response().await
    }

    async fn initialize(&mut self) -> Result<JsonRpcResponse, Box<dyn std::error::Error>> {
        let response = self
            .send_request(JsonRpcRequest::new(
                1,
                "initialize",
                Some(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "0.1.0"}
                })),
            ))
            .await?;
        self.send_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await?;
        Ok(response)
    }

    async fn close(mut self) {
        let _ = self.child.kill().await;
    }
}

async fn client(data_dir: &Path) -> Option<McpTestClient> {
    match McpTestClient::spawn(data_dir).await {
        Ok(c) => Some(c),
        Err(e) => {
            eprintln!("Skipping test, MCP server not available: {}", e);
            None
        }
    }
}

// ============================================================================
// Protocol Compliance Tests
// ============================================================================

#[tokio::test]
async fn test_initialize_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let Some(mut client) = client(dir.path()).await else { return };

    let response = client.initialize().await.unwrap();
    assert_eq!(response.jsonrpc, "2.0");
    assert_eq!(response.id, Some(1));
    assert!(response.error.is_none(), "Should not have error");

    let result = response.result.unwrap();
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "autoscraper-mcp");
    assert!(result["capabilities"].get("tools").is_some());

    client.close().await;
}

#[tokio::test]
async fn test_list_tools() {
    let dir = tempfile::tempdir().unwrap();
    let Some(mut client) = client(dir.path()).await else { return };
    client.initialize().await.unwrap();

    let response = client
        .send_request(JsonRpcRequest::new(2, "tools/list", None))
        .await
        .unwrap();
    assert!(response.error.is_none(), "Should not have error");

    let result = response.result.unwrap();
    let tool_names: Vec<&str> = result["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
        .collect();
    for expected in ["init_scraper", "scrape_data", "save_scraper", "load_scraper", "load_data"] {
        assert!(tool_names.contains(&expected), "missing tool {}", expected);
    }

    client.close().await;
}

#[tokio::test]
async fn test_errors_before_and_after_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let Some(mut client) = client(dir.path()).await else { return };

    let early = client
        .send_request(JsonRpcRequest::new(1, "tools/list", None))
        .await
        .unwrap();
    assert_eq!(early.error.unwrap().code, -32603);

    client.initialize().await.unwrap();

    let unknown = client
        .send_request(JsonRpcRequest::new(2, "prompts/list", None))
        .await
        .unwrap();
    assert_eq!(unknown.error.unwrap().code, -32601);

    client.send_line("{not json").await.unwrap();
    let parse = client.read_response().await.unwrap();
    assert_eq!(parse.id, None);
    assert_eq!(parse.error.unwrap().code, -32700);

    client.send_line(r#"{"id":9,"method":"ping"}"#).await.unwrap();
    let envelope = client.read_response().await.unwrap();
    assert_eq!(envelope.error.unwrap().code, -32600);

    let untrained = client
        .send_request(JsonRpcRequest::tool(
            3,
            "scrape_data",
            json!({"url": "https://example.com/events", "html": EVENTS}),
        ))
        .await
        .unwrap();
    assert_eq!(untrained.error.unwrap().code, -32000);

    let bad_url = client
        .send_request(JsonRpcRequest::tool(
            4,
            "init_scraper",
            json!({"url": "ftp://example.com", "wanted_data": ["x"]}),
        ))
        .await
        .unwrap();
    assert_eq!(bad_url.error.unwrap().code, -32602);

    client.close().await;
}

// ============================================================================
// Tool Execution Tests
// ============================================================================

#[tokio::test]
async fn test_train_scrape_and_store() {
    let dir = tempfile::tempdir().unwrap();
    let Some(mut client) = client(dir.path()).await else { return };
    client.initialize().await.unwrap();

    let trained = client
        .send_request(JsonRpcRequest::tool(
            2,
            "init_scraper",
            json!({
                "url": "https://example.com/events",
                "html": EVENTS,
                "wanted_data": {"name": ["Test Event 1"], "date": ["2024-01-01"]}
            }),
        ))
        .await
        .unwrap();
    assert!(trained.error.is_none(), "{:?}", trained.error);
    let payload = trained.tool_payload();
    assert_eq!(payload["rules_learned"], 2);
    assert_eq!(
        payload["training_result"]["name"],
        json!(["Test Event 1", "Test Event 2"])
    );

    let scraped = client
        .send_request(JsonRpcRequest::tool(
            3,
            "scrape_data",
            json!({
                "url": "https://example.com/events?page=2",
                "html": EVENTS,
                "storage_type": "json",
                "storage_path": "out/events.json"
            }),
        ))
        .await
        .unwrap();
    assert!(scraped.error.is_none(), "{:?}", scraped.error);
    let payload = scraped.tool_payload();
    assert_eq!(payload["record_count"], 2);
    assert_eq!(payload["storage"]["type"], "json");

    let stored: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("out/events.json")).unwrap())
            .unwrap();
    assert_eq!(stored[1]["name"], "Test Event 2");
    assert_eq!(stored[1]["date"], "2024-01-02");

    let shutdown = client
        .send_request(JsonRpcRequest::new(4, "shutdown", None))
        .await
        .unwrap();
    assert!(shutdown.error.is_none());

    let status = timeout(Duration::from_secs(5), client.child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}
