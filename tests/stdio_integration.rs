//! End-to-end integration tests for the stdio transport.
//!
//! These tests spawn the actual gantry binary and communicate with it
//! via stdin/stdout using line-delimited JSON-RPC, the way an MCP
//! client launching the bridge as a subprocess would.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for brevity"
)]

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde_json::{Value, json};

/// Reserves a port with nothing listening on it, so MAAS requests fail
/// fast with a connection error instead of hanging on a timeout.
fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/MAAS")
}

/// Helper to spawn the bridge and communicate with it.
struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BridgeProcess {
    fn spawn() -> Self {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_gantry"));
        cmd.args(["serve", "--stdio"]);
        cmd.env("GANTRY_MAAS__ENDPOINT", dead_endpoint());
        cmd.env("GANTRY_MAAS__API_KEY", "consumer:token:secret");
        // Keep a developer's real config file out of the picture.
        cmd.env("XDG_CONFIG_HOME", "/nonexistent");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().expect("Failed to spawn gantry");
        let stdin = child.stdin.take().expect("Failed to get stdin");
        let stdout = BufReader::new(child.stdout.take().expect("Failed to get stdout"));

        Self {
            child,
            stdin,
            stdout,
        }
    }

    fn send(&mut self, message: &Value) {
        self.send_raw(&serde_json::to_string(message).unwrap());
    }

    fn send_raw(&mut self, line: &str) {
        writeln!(self.stdin, "{}", line).expect("Failed to write to stdin");
        self.stdin.flush().expect("Failed to flush stdin");
    }

    fn recv(&mut self) -> Value {
        let mut line = String::new();
        self.stdout
            .read_line(&mut line)
            .expect("Failed to read from stdout");
        serde_json::from_str(&line).expect("Failed to parse JSON response")
    }

    fn initialize(&mut self) {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {
                    "name": "integration-test",
                    "version": "1.0.0"
                }
            }
        }));

        let response = self.recv();
        assert!(
            response.get("result").is_some(),
            "Initialize failed: {:?}",
            response
        );

        self.send(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }));
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[test]
fn test_initialize_handshake() {
    let mut bridge = BridgeProcess::spawn();

    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "test-client",
                "version": "1.0.0"
            }
        }
    }));

    let response = bridge.recv();

    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 1);
    assert!(response.get("result").is_some());

    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "gantry");
    assert_eq!(result["serverInfo"]["version"], env!("CARGO_PKG_VERSION"));
    assert!(result["capabilities"]["tools"].is_object());
}

#[test]
fn test_tools_list_advertises_machine_tools() {
    let mut bridge = BridgeProcess::spawn();
    bridge.initialize();

    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/list"
    }));

    let response = bridge.recv();

    assert!(response.get("result").is_some());
    let tools = response["result"]["tools"].as_array().unwrap();

    let tool_names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();

    let expected_tools = [
        "list_machines",
        "get_machine",
        "deploy_machine",
        "commission_machine",
        "release_machine",
        "get_operation",
        "list_operations",
        "cancel_operation",
    ];

    for expected in &expected_tools {
        assert!(tool_names.contains(expected), "Missing {} tool", expected);
    }
    assert_eq!(tools.len(), expected_tools.len());

    for tool in tools {
        let name = tool["name"].as_str().unwrap();
        assert!(
            tool.get("inputSchema").is_some(),
            "Tool {} missing inputSchema",
            name
        );
        let schema = &tool["inputSchema"];
        assert_eq!(
            schema["type"], "object",
            "Tool {} schema type is not object",
            name
        );
        assert!(
            schema["properties"].is_object(),
            "Tool {} has no properties",
            name
        );
    }
}

#[test]
fn test_ping_round_trip() {
    let mut bridge = BridgeProcess::spawn();
    bridge.initialize();

    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 3,
        "method": "ping"
    }));

    let response = bridge.recv();

    assert!(response.get("result").is_some());
    assert!(response.get("error").is_none());
}

#[test]
fn test_notification_produces_no_response() {
    let mut bridge = BridgeProcess::spawn();
    bridge.initialize();

    // A notification must not be answered; the next line out of the
    // bridge has to be the response to the ping that follows it.
    bridge.send(&json!({
        "jsonrpc": "2.0",
        "method": "notifications/cancelled"
    }));
    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 4,
        "method": "ping"
    }));

    let response = bridge.recv();
    assert_eq!(response["id"], 4);
}

#[test]
fn test_maas_failure_maps_to_operation_failed() {
    let mut bridge = BridgeProcess::spawn();
    bridge.initialize();

    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 5,
        "method": "tools/call",
        "params": {
            "name": "get_machine",
            "arguments": {"system_id": "abc123"}
        }
    }));

    let response = bridge.recv();

    assert!(response.get("result").is_none());
    let error = &response["error"];
    assert_eq!(error["code"], -32004);
    assert!(
        error["message"].as_str().unwrap().contains("upstream error"),
        "Unexpected error message: {}",
        error["message"]
    );
}

#[test]
fn test_missing_arguments_is_tool_error() {
    let mut bridge = BridgeProcess::spawn();
    bridge.initialize();

    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 6,
        "method": "tools/call",
        "params": {
            "name": "get_machine"
        }
    }));

    let response = bridge.recv();

    assert!(
        response.get("error").is_none(),
        "Shape problems stay in-band: {:?}",
        response
    );
    let result = &response["result"];
    assert_eq!(result["isError"], true);
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(
        text.contains("Missing arguments"),
        "Unexpected tool error text: {}",
        text
    );
}

#[test]
fn test_unknown_tool_is_rejected() {
    let mut bridge = BridgeProcess::spawn();
    bridge.initialize();

    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "tools/call",
        "params": {
            "name": "unknown_tool",
            "arguments": {}
        }
    }));

    let response = bridge.recv();

    let error = &response["error"];
    assert_eq!(error["code"], -32602);
    assert!(
        error["message"].as_str().unwrap().contains("Unknown tool"),
        "Unexpected error message: {}",
        error["message"]
    );
}

#[test]
fn test_unknown_method_is_method_not_found() {
    let mut bridge = BridgeProcess::spawn();
    bridge.initialize();

    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 8,
        "method": "machines/teleport"
    }));

    let response = bridge.recv();
    assert_eq!(response["error"]["code"], -32601);
}

#[test]
fn test_garbage_line_gets_parse_error() {
    let mut bridge = BridgeProcess::spawn();
    bridge.initialize();

    bridge.send_raw("{this is not json");

    let response = bridge.recv();
    assert!(response["id"].is_null());
    assert_eq!(response["error"]["code"], -32700);
    assert_eq!(response["error"]["message"], "Invalid JSON-RPC message");
}
