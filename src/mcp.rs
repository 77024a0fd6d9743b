//! Tool-server client
//!
//! Each server is a long-lived child process speaking line-delimited
//! JSON-RPC 2.0 over stdio. A connection owns the process pipes, a
//! monotonically increasing request id, and serializes request/response
//! exchanges so at most one request is in flight per connection. Lifecycle:
//! start → initialize handshake → tools/list discovery → N × tools/call →
//! stop. Connections are created lazily, cached per server name, and live
//! until `close_all`.

use crate::engine::CapabilityInvoker;
use crate::ir::{CompiledSpec, ResolvedServer};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "agentflow";

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Server '{0}' is not configured")]
    NotConfigured(String),

    #[error("Server '{name}' has an empty command")]
    EmptyCommand { name: String },

    #[error("Failed to start server '{name}': {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("Server '{name}' closed its pipe")]
    Closed { name: String },

    #[error("Server '{name}' protocol error: {detail}")]
    Protocol { name: String, detail: String },

    #[error("Method '{method}' on server '{server}' failed: {detail}")]
    MethodFailed {
        server: String,
        method: String,
        detail: String,
    },

    #[error("I/O error talking to server '{name}': {source}")]
    Io {
        name: String,
        source: std::io::Error,
    },
}

/// A method the server advertises via tools/list
#[derive(Debug, Clone, Deserialize)]
pub struct McpMethod {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

struct ConnectionIo {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// One live server connection
struct McpConnection {
    name: String,
    /// Request/response exchanges serialize on this lock: the request-id
    /// correlation assumes at most one in-flight request per connection.
    io: Mutex<ConnectionIo>,
    next_id: AtomicU64,
}

impl McpConnection {
    async fn spawn(server: &ResolvedServer) -> Result<Self, McpError> {
        let program = server.command.first().ok_or_else(|| McpError::EmptyCommand {
            name: server.name.clone(),
        })?;

        let mut command = Command::new(program);
        command
            .args(&server.command[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        // Resolved auth tokens are handed to the child via its environment
        if let Some(token) = server.auth_token.as_ref().and_then(|t| t.value.clone()) {
            command.env("API_TOKEN", &token);
            command.env("AUTH_TOKEN", &token);
        }

        let mut child = command.spawn().map_err(|source| McpError::Spawn {
            name: server.name.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Protocol {
            name: server.name.clone(),
            detail: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Protocol {
            name: server.name.clone(),
            detail: "child stdout unavailable".to_string(),
        })?;

        tracing::info!(server = %server.name, command = %program, "tool server started");

        Ok(Self {
            name: server.name.clone(),
            io: Mutex::new(ConnectionIo {
                child,
                stdin,
                reader: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(0),
        })
    }

    /// Send one request and wait for its matching response. Notifications
    /// arriving in between are skipped.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = build_request(id, method, &params);

        let mut io = self.io.lock().await;

        io.stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|source| McpError::Io {
                name: self.name.clone(),
                source,
            })?;
        io.stdin.flush().await.map_err(|source| McpError::Io {
            name: self.name.clone(),
            source,
        })?;

        loop {
            let mut line = String::new();
            let read = io
                .reader
                .read_line(&mut line)
                .await
                .map_err(|source| McpError::Io {
                    name: self.name.clone(),
                    source,
                })?;
            if read == 0 {
                return Err(McpError::Closed {
                    name: self.name.clone(),
                });
            }
            if line.trim().is_empty() {
                continue;
            }

            let message: Value =
                serde_json::from_str(line.trim()).map_err(|e| McpError::Protocol {
                    name: self.name.clone(),
                    detail: format!("invalid JSON frame: {}", e),
                })?;

            // Server-initiated notifications carry no id; skip them
            match message.get("id").and_then(Value::as_u64) {
                Some(message_id) if message_id == id => {
                    if let Some(error) = message.get("error") {
                        return Err(McpError::MethodFailed {
                            server: self.name.clone(),
                            method: method.to_string(),
                            detail: error.to_string(),
                        });
                    }
                    return Ok(message.get("result").cloned().unwrap_or(Value::Null));
                }
                _ => {
                    tracing::debug!(server = %self.name, "skipping unmatched frame");
                    continue;
                }
            }
        }
    }

    /// Fire-and-forget notification
    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let frame = format!(
            "{}\n",
            json!({"jsonrpc": "2.0", "method": method, "params": params})
        );
        let mut io = self.io.lock().await;
        io.stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|source| McpError::Io {
                name: self.name.clone(),
                source,
            })?;
        io.stdin.flush().await.map_err(|source| McpError::Io {
            name: self.name.clone(),
            source,
        })
    }

    async fn initialize(&self) -> Result<(), McpError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": CLIENT_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn list_tools(&self) -> Result<Vec<McpMethod>, McpError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools).map_err(|e| McpError::Protocol {
            name: self.name.clone(),
            detail: format!("malformed tools/list result: {}", e),
        })
    }

    async fn call_tool(&self, method: &str, args: Value) -> Result<Value, McpError> {
        let result = self
            .request("tools/call", json!({"name": method, "arguments": args}))
            .await?;
        parse_tool_result(&self.name, method, result)
    }

    async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        if let Err(error) = io.child.kill().await {
            tracing::warn!(server = %self.name, %error, "failed to kill tool server");
        }
    }
}

/// Build a JSON-RPC 2.0 request frame (newline-delimited)
fn build_request(id: u64, method: &str, params: &Value) -> String {
    format!(
        "{}\n",
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    )
}

/// Unwrap a tools/call result: error flags become errors, single text
/// blocks collapse to their content (parsed as JSON when possible).
fn parse_tool_result(server: &str, method: &str, result: Value) -> Result<Value, McpError> {
    if result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Err(McpError::MethodFailed {
            server: server.to_string(),
            method: method.to_string(),
            detail: result
                .get("content")
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    let content = match result.get("content") {
        Some(Value::Array(blocks)) => blocks.clone(),
        _ => return Ok(result),
    };

    let texts: Vec<&str> = content
        .iter()
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();

    match texts.as_slice() {
        [] => Ok(Value::Array(content)),
        [single] => Ok(serde_json::from_str(single)
            .unwrap_or_else(|_| Value::String(single.to_string()))),
        many => Ok(Value::String(many.join("\n"))),
    }
}

/// Client over all configured tool servers. Connections are shared and
/// long-lived; capability calls against the same server serialize on that
/// server's connection.
pub struct McpClient {
    servers: BTreeMap<String, ResolvedServer>,
    connections: RwLock<HashMap<String, Arc<McpConnection>>>,
}

impl McpClient {
    pub fn new(servers: BTreeMap<String, ResolvedServer>) -> Self {
        Self {
            servers,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_spec(spec: &CompiledSpec) -> Self {
        Self::new(spec.servers.clone())
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    /// Discover the methods a server advertises (starting it if needed)
    pub async fn discover_methods(&self, server: &str) -> Result<Vec<McpMethod>, McpError> {
        let connection = self.get_or_connect(server).await?;
        connection.list_tools().await
    }

    /// Call a method on a server
    pub async fn call_method(
        &self,
        server: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, McpError> {
        let connection = self.get_or_connect(server).await?;
        tracing::debug!(server, method, "calling tool server method");
        connection.call_tool(method, args).await
    }

    async fn get_or_connect(&self, server: &str) -> Result<Arc<McpConnection>, McpError> {
        {
            let connections = self.connections.read().await;
            if let Some(connection) = connections.get(server) {
                return Ok(Arc::clone(connection));
            }
        }

        let config = self
            .servers
            .get(server)
            .ok_or_else(|| McpError::NotConfigured(server.to_string()))?;

        let connection = Arc::new(McpConnection::spawn(config).await?);
        connection.initialize().await?;

        let mut connections = self.connections.write().await;
        let entry = connections
            .entry(server.to_string())
            .or_insert_with(|| Arc::clone(&connection));
        Ok(Arc::clone(entry))
    }

    /// Stop every running server
    pub async fn close_all(&self) {
        let mut connections = self.connections.write().await;
        for (name, connection) in connections.drain() {
            tracing::info!(server = %name, "stopping tool server");
            connection.shutdown().await;
        }
    }
}

#[async_trait]
impl CapabilityInvoker for McpClient {
    async fn call(&self, server: &str, method: &str, args: Value) -> anyhow::Result<Value> {
        Ok(self.call_method(server, method, args).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_frame() {
        let frame = build_request(7, "tools/call", &json!({"name": "read"}));
        assert!(frame.ends_with('\n'));

        let parsed: Value = serde_json::from_str(frame.trim()).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["method"], "tools/call");
        assert_eq!(parsed["params"]["name"], "read");
    }

    #[test]
    fn test_parse_tool_result_error_flag() {
        let result = json!({"isError": true, "content": [{"type": "text", "text": "boom"}]});
        let err = parse_tool_result("fs", "read", result).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_parse_tool_result_single_text_block() {
        let result = json!({"content": [{"type": "text", "text": "plain text"}]});
        let value = parse_tool_result("fs", "read", result).unwrap();
        assert_eq!(value, "plain text");
    }

    #[test]
    fn test_parse_tool_result_json_text_block() {
        let result = json!({"content": [{"type": "text", "text": "{\"ok\": true}"}]});
        let value = parse_tool_result("fs", "read", result).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_parse_tool_result_without_content() {
        let result = json!({"something": "else"});
        let value = parse_tool_result("fs", "read", result.clone()).unwrap();
        assert_eq!(value, result);
    }

    #[test]
    fn test_unconfigured_server() {
        let client = McpClient::empty();
        assert!(!client.has_server("fs"));
        assert!(client.server_names().is_empty());
    }

    #[tokio::test]
    async fn test_call_unconfigured_server_fails() {
        let client = McpClient::empty();
        let err = client
            .call_method("ghost", "read", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotConfigured(_)));
    }

    /// End-to-end against a shell loop that answers every request with a
    /// fixed JSON-RPC result. Exercises spawn, the initialize handshake,
    /// request-id matching, and shutdown.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_roundtrip_against_stub_server() {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
  fi
done
"#;
        let mut servers = BTreeMap::new();
        servers.insert(
            "stub".to_string(),
            ResolvedServer {
                name: "stub".to_string(),
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                auth_token: None,
            },
        );

        let client = McpClient::new(servers);
        let value = client
            .call_method("stub", "ping", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(value, "pong");

        client.close_all().await;
    }
}
