#![allow(dead_code)]

use std::error::Error;
use std::path::PathBuf;

use rmcp::ServiceExt;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParam, CallToolResult, RawContent};
use rmcp::service::ServiceError;
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::Value;
use tokio::process::Command;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

pub struct GameTestSession {
    service: rmcp::service::RunningService<rmcp::service::RoleClient, TestClient>,
    server_pid: Option<u32>,
}

impl GameTestSession {
    pub async fn call_tool(
        &self,
        tool: impl Into<String>,
        arguments: Value,
    ) -> Result<CallToolResult, ServiceError> {
        let arguments = match arguments {
            Value::Null => None,
            Value::Object(map) => Some(map.into_iter().collect()),
            other => panic!("tool arguments must be a JSON object, got: {other}"),
        };
        self.service
            .call_tool(CallToolRequestParam {
                name: tool.into().into(),
                arguments,
            })
            .await
    }

    pub async fn list_tool_names(&self) -> TestResult<Vec<String>> {
        let tools = self.service.list_all_tools().await?;
        Ok(tools.into_iter().map(|tool| tool.name.to_string()).collect())
    }

    pub async fn cancel(self) -> TestResult<()> {
        self.service.cancel().await?;
        if let Some(pid) = self.server_pid {
            terminate_process_tree(pid);
        }
        Ok(())
    }
}

pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|item| match &item.raw {
            RawContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// Tool results carry their payload as a JSON text block.
pub fn result_json(result: &CallToolResult) -> Value {
    serde_json::from_str(&result_text(result)).expect("tool result should be JSON")
}

pub fn is_error(result: &CallToolResult) -> bool {
    matches!(result.is_error, Some(true))
}

pub async fn spawn_server(args: Vec<String>) -> TestResult<GameTestSession> {
    let exe = resolve_server_path()?;
    let transport = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
        cmd.env_remove("MCP_GAMECTL_STATE_FILE");
        cmd.env_remove("MCP_GAMECTL_SOCKET");
        cmd.args(&args);
    }))?;

    let server_pid = transport.id();
    let service = TestClient.serve(transport).await?;
    Ok(GameTestSession {
        service,
        server_pid,
    })
}

fn resolve_server_path() -> TestResult<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_mcp-gamectl") {
        return Ok(PathBuf::from(path));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("mcp-gamectl");

    if path.exists() {
        Ok(path)
    } else {
        Err("unable to locate mcp-gamectl test binary".into())
    }
}

fn terminate_process_tree(pid: u32) {
    let pid_str = pid.to_string();
    let _ = std::process::Command::new("pkill")
        .args(["-TERM", "-P", &pid_str])
        .status();
    unsafe {
        let _ = libc::kill(pid as i32, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_millis(200));
    let alive = unsafe { libc::kill(pid as i32, 0) == 0 };
    if alive {
        unsafe {
            let _ = libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}
