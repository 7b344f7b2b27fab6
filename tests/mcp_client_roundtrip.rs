//! End-to-end test of `hatchling_mcp`'s stdio transport against a real
//! subprocess: a tiny Python fixture that speaks just enough of the MCP
//! JSON-RPC surface (`initialize`, `tools/list`, `tools/call`) for
//! `McpClient` to drive through its full lifecycle.
//!
//! The fixture is written to a temp file per test rather than checked into
//! the tree, so nothing here depends on the host having an `mcp` package
//! installed — only a `python3` interpreter on `PATH`.

use std::io::Write;
use std::path::Path;

use mcp::client::McpClient;
use tempfile::NamedTempFile;

const FIXTURE: &str = r#"
import json
import sys

def write(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    method = msg.get("method")
    has_id = "id" in msg

    if method == "initialize":
        write({"jsonrpc": "2.0", "id": msg["id"], "result": {"protocolVersion": "2024-11-05"}})
    elif method == "notifications/initialized":
        pass
    elif method == "tools/list":
        write({
            "jsonrpc": "2.0",
            "id": msg["id"],
            "result": {
                "tools": [
                    {
                        "name": "echo",
                        "description": "Echoes its arguments back as text",
                        "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}},
                    }
                ]
            },
        })
    elif method == "tools/call":
        params = msg.get("params", {})
        name = params.get("name")
        if name == "echo":
            text = json.dumps(params.get("arguments", {}), separators=(",", ":"))
            write({
                "jsonrpc": "2.0",
                "id": msg["id"],
                "result": {"content": [{"type": "text", "text": text}], "isError": False},
            })
        else:
            write({
                "jsonrpc": "2.0",
                "id": msg["id"],
                "result": {"content": [{"type": "text", "text": "unknown tool"}], "isError": True},
            })
    elif has_id:
        write({"jsonrpc": "2.0", "id": msg["id"], "error": {"code": -32601, "message": "method not found"}})
"#;

fn write_fixture() -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp fixture file");
    file.write_all(FIXTURE.as_bytes()).expect("write fixture");
    file.flush().expect("flush fixture");
    file
}

#[tokio::test]
async fn initialize_list_and_call_round_trip_over_real_subprocess() {
    let fixture = write_fixture();
    let client = McpClient::spawn(Path::new("python3"), fixture.path())
        .await
        .expect("spawn python3 fixture server");

    let tools = client.initialize().await.expect("initialize + tools/list");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let result = client
        .call_tool("echo", serde_json::json!({"text": "hi"}))
        .await
        .expect("tools/call");
    assert!(!result.is_error);
    assert_eq!(result.content[0].text, r#"{"text":"hi"}"#);

    let missing = client
        .call_tool("does_not_exist", serde_json::json!({}))
        .await
        .expect("tools/call for unknown tool still returns a result, not a transport error");
    assert!(missing.is_error);

    client.disconnect().await;
    assert!(client.has_exited().await);
}

#[tokio::test]
async fn spawning_a_nonexistent_interpreter_fails() {
    let fixture = write_fixture();
    let err = McpClient::spawn(Path::new("this-interpreter-does-not-exist"), fixture.path()).await;
    assert!(err.is_err());
}
