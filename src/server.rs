use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, ErrorData as McpError, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::controller::{Controller, ControllerConfig, DEFAULT_STOP_WAIT, LaunchOptions};
use crate::game_process::{ControlError, StartMenu};
use crate::protocol::KeyAction;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_KEY_TIMEOUT: Duration = Duration::from_secs(10);
/// Frame waits and screenshots block the game loop; give them more room.
const FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(20);
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
struct SharedController {
    controller: Arc<Mutex<Controller>>,
}

impl SharedController {
    fn new(config: ControllerConfig) -> Self {
        Self {
            controller: Arc::new(Mutex::new(Controller::new(config))),
        }
    }

    async fn run_controller<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce(&mut Controller) -> T + Send + 'static,
        T: Send + 'static,
    {
        let controller = self.controller.clone();
        tokio::task::spawn_blocking(move || {
            let mut controller = controller.lock().unwrap();
            f(&mut controller)
        })
        .await
        .map_err(|err| McpError::internal_error(err.to_string(), None))
    }

    async fn run_tool<F>(&self, tool: &'static str, f: F) -> Result<CallToolResult, McpError>
    where
        F: FnOnce(&mut Controller) -> Result<Value, ControlError> + Send + 'static,
    {
        crate::event_log::log_lazy("tool_call_begin", || json!({"tool": tool}));
        let result = self.run_controller(f).await?;
        match result {
            Ok(value) => {
                crate::event_log::log_lazy("tool_call_end", || {
                    json!({"tool": tool, "result": value.clone()})
                });
                let text =
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(err) => {
                eprintln!("{tool} error: {err}");
                crate::event_log::log_lazy("tool_call_error", || {
                    json!({"tool": tool, "error": err.to_string()})
                });
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "error: {err}"
                ))]))
            }
        }
    }
}

#[derive(Clone)]
pub struct GameToolServer {
    shared: SharedController,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl GameToolServer {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            shared: SharedController::new(config),
            tool_router: Self::tool_router(),
        }
    }

    /// Launch the game with remote control enabled and wait for it to answer
    /// its first ping.
    #[tool(name = "game_launch")]
    async fn game_launch(
        &self,
        params: Parameters<GameLaunchArgs>,
    ) -> Result<CallToolResult, McpError> {
        let options = params.0.into_launch_options()?;
        self.shared.run_tool("game_launch", move |controller| {
            controller
                .launch(options)
                .and_then(|state| serde_json::to_value(state).map_err(launch_encode_error))
        })
        .await
    }

    /// Stop the supervised game: ask it to quit, escalate to signals if
    /// needed, and clear the persisted launch state.
    #[tool(name = "game_stop")]
    async fn game_stop(
        &self,
        _params: Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.shared.run_tool("game_stop", move |controller| {
            controller
                .stop(None, DEFAULT_STOP_WAIT)
                .map(|()| json!({"ok": true}))
        })
        .await
    }

    /// Ping the game's remote-control endpoint.
    #[tool(name = "game_ping")]
    async fn game_ping(&self, _params: Parameters<NoArgs>) -> Result<CallToolResult, McpError> {
        self.shared.run_tool("game_ping", move |controller| {
            controller.ping(None, COMMAND_TIMEOUT)
        })
        .await
    }

    /// Fetch the game's current state snapshot.
    #[tool(name = "game_state")]
    async fn game_state(&self, _params: Parameters<NoArgs>) -> Result<CallToolResult, McpError> {
        self.shared.run_tool("game_state", move |controller| {
            controller.game_state(None, COMMAND_TIMEOUT)
        })
        .await
    }

    /// Block until the game has rendered the given number of frames.
    #[tool(name = "game_wait")]
    async fn game_wait(
        &self,
        params: Parameters<GameWaitArgs>,
    ) -> Result<CallToolResult, McpError> {
        let frames = params.0.frames;
        if frames == 0 {
            return Err(McpError::invalid_params(
                "frames must be a positive integer",
                None,
            ));
        }
        self.shared.run_tool("game_wait", move |controller| {
            controller.wait_frames(frames, None, FRAME_WAIT_TIMEOUT)
        })
        .await
    }

    /// Send one key to the game, optionally repeated with a frame wait
    /// between presses.
    #[tool(name = "game_send_key")]
    async fn game_send_key(
        &self,
        params: Parameters<GameSendKeyArgs>,
    ) -> Result<CallToolResult, McpError> {
        let GameSendKeyArgs {
            key,
            action,
            repeat,
            wait_between,
        } = params.0;
        let action = match action {
            Some(raw) => KeyAction::parse(&raw)
                .map_err(|err| McpError::invalid_params(err, None))?,
            None => KeyAction::Tap,
        };
        let repeat = repeat.unwrap_or(1).max(1);
        let wait_between = wait_between.unwrap_or(0);
        self.shared.run_tool("game_send_key", move |controller| {
            controller.send_key(&key, action, repeat, wait_between, None, SEND_KEY_TIMEOUT)
        })
        .await
    }

    /// Send an ordered sequence of key taps to the game.
    #[tool(name = "game_send_keys")]
    async fn game_send_keys(
        &self,
        params: Parameters<GameSendKeysArgs>,
    ) -> Result<CallToolResult, McpError> {
        let GameSendKeysArgs { keys, wait_between } = params.0;
        if keys.is_empty() {
            return Err(McpError::invalid_params("keys must not be empty", None));
        }
        let wait_between = wait_between.unwrap_or(0);
        self.shared.run_tool("game_send_keys", move |controller| {
            controller.send_keys(&keys, wait_between, None, SEND_KEY_TIMEOUT)
        })
        .await
    }

    /// Send text input to the game.
    #[tool(name = "game_send_text")]
    async fn game_send_text(
        &self,
        params: Parameters<GameSendTextArgs>,
    ) -> Result<CallToolResult, McpError> {
        let text = params.0.text;
        self.shared.run_tool("game_send_text", move |controller| {
            controller.send_text(&text, None, COMMAND_TIMEOUT)
        })
        .await
    }

    /// Run a debug-console command inside the game.
    #[tool(name = "game_console")]
    async fn game_console(
        &self,
        params: Parameters<GameConsoleArgs>,
    ) -> Result<CallToolResult, McpError> {
        let command = params.0.command;
        self.shared.run_tool("game_console", move |controller| {
            controller.console_exec(&command, None, COMMAND_TIMEOUT)
        })
        .await
    }

    /// Capture a screenshot to the given path (relative paths resolve against
    /// the server's working directory).
    #[tool(name = "game_screenshot")]
    async fn game_screenshot(
        &self,
        params: Parameters<GameScreenshotArgs>,
    ) -> Result<CallToolResult, McpError> {
        let path = PathBuf::from(params.0.path);
        self.shared.run_tool("game_screenshot", move |controller| {
            controller.screenshot(&path, None, SCREENSHOT_TIMEOUT)
        })
        .await
    }

    /// Print the locally persisted launch state without contacting the game.
    #[tool(name = "game_local_state")]
    async fn game_local_state(
        &self,
        _params: Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.shared.run_tool("game_local_state", move |controller| {
            Ok(controller.local_state())
        })
        .await
    }
}

#[tool_handler]
impl ServerHandler for GameToolServer {
    fn get_info(&self) -> ServerInfo {
        server_info()
    }
}

fn server_info() -> ServerInfo {
    ServerInfo {
        protocol_version: ProtocolVersion::V_2025_06_18,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        ..ServerInfo::default()
    }
}

fn launch_encode_error(err: serde_json::Error) -> ControlError {
    ControlError::Io(std::io::Error::other(err))
}

#[derive(Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GameLaunchArgs {
    /// Path to the game binary; defaults to the server's configured binary.
    #[serde(default)]
    binary: Option<String>,
    /// Game data directory passed through to the binary.
    #[serde(default)]
    data: Option<String>,
    /// Remote-control socket path override.
    #[serde(default)]
    socket: Option<String>,
    /// Log file the game's output is appended to.
    #[serde(default)]
    log: Option<String>,
    /// Seconds to wait for the game to answer its first ping.
    #[serde(default)]
    wait_start: Option<f64>,
    /// Startup menu to land in: title, setup, or graphics.
    #[serde(default)]
    start_menu: Option<String>,
    #[serde(default)]
    start_menu_option: Option<String>,
    #[serde(default)]
    start_menu_enter: Option<bool>,
    /// Extra arguments appended verbatim to the game command line.
    #[serde(default)]
    extra_args: Option<Vec<String>>,
}

impl GameLaunchArgs {
    fn into_launch_options(self) -> Result<LaunchOptions, McpError> {
        let wait_start = match self.wait_start {
            Some(value) if !value.is_finite() || value <= 0.0 => {
                return Err(McpError::invalid_params(
                    "wait_start must be a positive number of seconds",
                    None,
                ));
            }
            Some(value) => Some(Duration::from_secs_f64(value)),
            None => None,
        };
        let start_menu = match self.start_menu {
            Some(raw) => {
                Some(StartMenu::parse(&raw).map_err(|err| McpError::invalid_params(err, None))?)
            }
            None => None,
        };
        Ok(LaunchOptions {
            binary: self.binary.map(PathBuf::from),
            data_dir: self.data,
            socket: self.socket.map(PathBuf::from),
            log: self.log.map(PathBuf::from),
            wait_start,
            start_menu,
            start_menu_option: self.start_menu_option,
            start_menu_enter: self.start_menu_enter.unwrap_or(false),
            extra_args: self.extra_args.unwrap_or_default(),
        })
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GameWaitArgs {
    /// Number of rendered frames to wait for.
    frames: u32,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GameSendKeyArgs {
    /// Key name, e.g. "return", "escape", "up".
    key: String,
    /// tap (default), down, or up.
    #[serde(default)]
    action: Option<String>,
    /// How many times to press the key.
    #[serde(default)]
    repeat: Option<u32>,
    /// Frames to wait between repeats.
    #[serde(default)]
    wait_between: Option<u32>,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GameSendKeysArgs {
    /// Ordered key names, each sent as a tap.
    keys: Vec<String>,
    /// Frames to wait between keys.
    #[serde(default)]
    wait_between: Option<u32>,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GameSendTextArgs {
    text: String,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GameConsoleArgs {
    command: String,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GameScreenshotArgs {
    /// Output path; relative paths resolve against the server's working
    /// directory before the command is sent.
    path: String,
}

pub async fn run(config: ControllerConfig) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("starting mcp-gamectl server");
    crate::event_log::log(
        "server_run_begin",
        json!({
            "state_file": config.state_file.display().to_string(),
            "socket": config.socket.as_ref().map(|path| path.display().to_string()),
        }),
    );
    let service = GameToolServer::new(config);

    crate::event_log::log("server_listen_begin", json!({}));
    let result: Result<(), Box<dyn std::error::Error>> = async {
        let running = rmcp::serve_server(service, rmcp::transport::stdio()).await?;
        running
            .waiting()
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }
    .await;

    // The game deliberately outlives the gateway: the persisted launch state
    // lets the next invocation re-attach or stop it.
    match &result {
        Ok(()) => crate::event_log::log("server_listen_end", json!({"status": "ok"})),
        Err(err) => crate::event_log::log(
            "server_listen_end",
            json!({
                "status": "error",
                "error": err.to_string(),
            }),
        ),
    }
    result
}
