//! In-process fake MCP server over TCP for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the fake server behaves.
#[derive(Clone, Default)]
pub struct FakeBehavior {
    /// Tool definitions returned from `tools/list`.
    pub tools: Vec<Value>,
    /// Delay before answering `initialize`.
    pub handshake_delay: Duration,
    /// Delay before answering each `tools/list` page.
    pub list_delay: Duration,
    /// Split `tools/list` into pages of this size.
    pub page_size: Option<usize>,
    /// Replace the `tools/list` result verbatim.
    pub list_result: Option<Value>,
    /// Drop the connection when a tool is called.
    pub hang_up_on_call: bool,
}

impl FakeBehavior {
    /// Tools taking one optional string `q`.
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| fake_tool(n)).collect(),
            ..Self::default()
        }
    }
}

/// A tool definition as a server would send it.
pub fn fake_tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": {
            "type": "object",
            "properties": {"q": {"type": "string"}}
        }
    })
}

pub struct FakeServer {
    pub address: String,
    calls: Arc<AtomicUsize>,
    initialize_params: Arc<Mutex<Option<Value>>>,
    accept_loop: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(behavior: FakeBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let calls = Arc::new(AtomicUsize::new(0));
        let initialize_params = Arc::new(Mutex::new(None));

        let accept_loop = {
            let calls = Arc::clone(&calls);
            let initialize_params = Arc::clone(&initialize_params);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_connection(
                        stream,
                        behavior.clone(),
                        Arc::clone(&calls),
                        Arc::clone(&initialize_params),
                    ));
                }
            })
        };

        Self {
            address,
            calls,
            initialize_params,
            accept_loop,
        }
    }

    /// Number of `tools/call` requests received.
    pub fn tool_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Params of the most recent `initialize` request.
    pub fn initialize_params(&self) -> Option<Value> {
        self.initialize_params.lock().unwrap().clone()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    behavior: FakeBehavior,
    calls: Arc<AtomicUsize>,
    initialize_params: Arc<Mutex<Option<Value>>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(id) = msg.get("id").cloned() else {
            continue;
        };
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        let reply = match msg["method"].as_str().unwrap_or_default() {
            "initialize" => {
                *initialize_params.lock().unwrap() = Some(params);
                tokio::time::sleep(behavior.handshake_delay).await;
                json!({"jsonrpc": "2.0", "id": id, "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-server", "version": "0.0.1"}
                }})
            }
            "tools/list" => {
                tokio::time::sleep(behavior.list_delay).await;
                let result = match &behavior.list_result {
                    Some(raw) => raw.clone(),
                    None => list_page(&behavior, &params),
                };
                json!({"jsonrpc": "2.0", "id": id, "result": result})
            }
            "tools/call" => {
                calls.fetch_add(1, Ordering::SeqCst);
                if behavior.hang_up_on_call {
                    return;
                }
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let is_error = name == "explode";
                json!({"jsonrpc": "2.0", "id": id, "result": {
                    "content": [{"type": "text", "text": format!("{name}:{}", params["arguments"])}],
                    "isError": is_error
                }})
            }
            other => json!({"jsonrpc": "2.0", "id": id, "error": {
                "code": -32601,
                "message": format!("method not found: {other}")
            }}),
        };

        let mut out = reply.to_string();
        out.push('\n');
        if write_half.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn list_page(behavior: &FakeBehavior, params: &Value) -> Value {
    let Some(size) = behavior.page_size else {
        return json!({"tools": behavior.tools});
    };
    let offset: usize = params["cursor"]
        .as_str()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let end = (offset + size).min(behavior.tools.len());
    let page = &behavior.tools[offset..end];

    if end < behavior.tools.len() {
        json!({"tools": page, "nextCursor": end.to_string()})
    } else {
        json!({"tools": page})
    }
}
