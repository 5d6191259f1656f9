//! Minimal MCP stdio server used to exercise the gateway.
//!
//! Tools named `env` return the value of the environment variable given in
//! `arguments.name`; every other tool echoes `arguments.message` back.
//!
//! Environment knobs:
//! - `ECHO_TOOL_TOOLS`: comma-separated tool names (default `echo`)
//! - `ECHO_TOOL_MAX_CALLS`: exit with status 1 after answering N tool calls
//! - `ECHO_TOOL_LINGER`: keep running after stdin closes
//! - `ECHO_TOOL_FAIL_INIT`: answer `initialize` with an error
//! - `ECHO_TOOL_DELAY_MS`: delay every tool reply
//! - `ECHO_TOOL_INIT_DELAY_MS`: delay the `initialize` reply

use std::env;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct Settings {
    tools: Vec<String>,
    max_calls: Option<u64>,
    linger: bool,
    fail_init: bool,
    delay: Duration,
    init_delay: Duration,
}

impl Settings {
    fn from_env() -> Self {
        let flag = |name: &str| {
            env::var(name)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };

        Self {
            tools: env::var("ECHO_TOOL_TOOLS")
                .unwrap_or_else(|_| "echo".to_string())
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            max_calls: env::var("ECHO_TOOL_MAX_CALLS").ok().and_then(|v| v.parse().ok()),
            linger: flag("ECHO_TOOL_LINGER"),
            fail_init: flag("ECHO_TOOL_FAIL_INIT"),
            delay: millis("ECHO_TOOL_DELAY_MS"),
            init_delay: millis("ECHO_TOOL_INIT_DELAY_MS"),
        }
    }
}

fn millis(name: &str) -> Duration {
    Duration::from_millis(env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn reply(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn reply_error(id: &Value, code: i32, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn call_tool(settings: &Settings, params: &Value) -> Result<Value, String> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    if !settings.tools.iter().any(|t| t == name) {
        return Err(format!("Unknown tool: {}", name));
    }
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let text = if name == "env" {
        let var = arguments.get("name").and_then(Value::as_str).unwrap_or_default();
        env::var(var).unwrap_or_default()
    } else {
        match arguments.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => arguments.to_string(),
        }
    };

    Ok(json!({ "content": [{ "type": "text", "text": text }] }))
}

fn tool_list(settings: &Settings) -> Value {
    let tools: Vec<Value> = settings
        .tools
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "description": format!("Echo tool '{}'", name),
                "inputSchema": {
                    "type": "object",
                    "properties": { "message": { "type": "string" } }
                }
            })
        })
        .collect();
    json!({ "tools": tools })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let settings = Settings::from_env();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut calls: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        let message: Value = match serde_json::from_str(line.trim()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed line");
                continue;
            }
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        // Notifications and replies need no answer
        let Some(id) = message.get("id").cloned() else {
            tracing::debug!(method = %method, "Notification");
            continue;
        };
        if method.is_empty() {
            continue;
        }

        if method == "initialize" && !settings.init_delay.is_zero() {
            tokio::time::sleep(settings.init_delay).await;
        }

        let mut tool_called = false;
        let response = match method {
            "initialize" if settings.fail_init => reply_error(&id, -32603, "initialization refused"),
            "initialize" => reply(
                &id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "echo-tool", "version": env!("CARGO_PKG_VERSION") }
                }),
            ),
            "ping" => reply(&id, json!({})),
            "tools/list" => reply(&id, tool_list(&settings)),
            "tools/call" => {
                tool_called = true;
                if !settings.delay.is_zero() {
                    tokio::time::sleep(settings.delay).await;
                }
                let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
                match call_tool(&settings, &params) {
                    Ok(result) => reply(&id, result),
                    Err(e) => reply_error(&id, -32602, &e),
                }
            }
            other => reply_error(&id, -32601, &format!("Method not found: {}", other)),
        };

        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;

        if tool_called {
            calls += 1;
            if settings.max_calls.is_some_and(|max| calls >= max) {
                tracing::warn!(calls, "Call limit reached, exiting");
                std::process::exit(1);
            }
        }
    }

    if settings.linger {
        tracing::info!("stdin closed, lingering");
        std::future::pending::<()>().await;
    }
    Ok(())
}
