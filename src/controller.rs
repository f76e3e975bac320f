use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};

use crate::channel;
use crate::game_process::{
    self, ControlError, GameHandle, LaunchSpec, StartMenu, escalate_shutdown,
};
use crate::launch_state::{LaunchState, StateStore};
use crate::protocol::{KeyAction, RemoteCommand, RemoteResponse};

pub const DEFAULT_STATE_FILE: &str = "/tmp/gamectl-state.json";
pub const DEFAULT_SOCKET: &str = "/tmp/game-remote.sock";
pub const DEFAULT_LOG: &str = "/tmp/game-session.log";
pub const DEFAULT_DATA_DIR: &str = "data";

pub const DEFAULT_WAIT_START: Duration = Duration::from_secs(60);
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(2);
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Invocation-wide configuration, assembled once from flags and environment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub state_file: PathBuf,
    /// Endpoint override applied to every command; normally the endpoint is
    /// resolved from the persisted launch state instead.
    pub socket: Option<PathBuf>,
    /// Default game binary for launch when the call does not name one.
    pub binary: Option<PathBuf>,
    pub data_dir: String,
    pub log: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            socket: None,
            binary: None,
            data_dir: DEFAULT_DATA_DIR.to_string(),
            log: PathBuf::from(DEFAULT_LOG),
        }
    }
}

/// Per-launch options; unset fields fall back to the controller config.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub binary: Option<PathBuf>,
    pub data_dir: Option<String>,
    pub socket: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub wait_start: Option<Duration>,
    pub start_menu: Option<StartMenu>,
    pub start_menu_option: Option<String>,
    pub start_menu_enter: bool,
    pub extra_args: Vec<String>,
}

/// The synchronous hub every entry point drives: resolves the endpoint,
/// supervises at most one game process, and issues one channel round-trip per
/// catalog command.
pub struct Controller {
    config: ControllerConfig,
    store: StateStore,
    game: Option<GameHandle>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let store = StateStore::new(config.state_file.clone());
        Self {
            config,
            store,
            game: None,
        }
    }

    /// Explicit override → invocation-wide override → persisted state →
    /// well-known default.
    fn resolve_socket(&self, socket: Option<&Path>) -> PathBuf {
        if let Some(path) = socket {
            return path.to_path_buf();
        }
        if let Some(path) = &self.config.socket {
            return path.clone();
        }
        if let Some(state) = self.store.load()
            && !state.socket.is_empty()
        {
            return PathBuf::from(state.socket);
        }
        PathBuf::from(DEFAULT_SOCKET)
    }

    fn call(
        &self,
        command: RemoteCommand,
        socket: Option<&Path>,
        timeout: Duration,
    ) -> Result<RemoteResponse, ControlError> {
        let socket = self.resolve_socket(socket);
        let name = command.name();
        channel::send_command(&command, &socket, timeout).map_err(|source| {
            ControlError::Channel {
                command: name,
                socket,
                source,
            }
        })
    }

    pub fn launch(&mut self, options: LaunchOptions) -> Result<LaunchState, ControlError> {
        let binary = options
            .binary
            .or_else(|| self.config.binary.clone())
            .ok_or_else(|| {
                ControlError::State("no game binary configured (use --binary)".to_string())
            })?;
        let spec = LaunchSpec {
            binary,
            data_dir: options
                .data_dir
                .unwrap_or_else(|| self.config.data_dir.clone()),
            socket: self.resolve_socket(options.socket.as_deref()),
            log: options.log.unwrap_or_else(|| self.config.log.clone()),
            start_menu: options.start_menu.unwrap_or(StartMenu::Title),
            start_menu_option: options.start_menu_option,
            start_menu_enter: options.start_menu_enter,
            extra_args: options.extra_args,
        };

        let (mut handle, state) = game_process::launch(&spec, &self.store)?;
        let wait = options.wait_start.unwrap_or(DEFAULT_WAIT_START);
        let ready = game_process::await_ready(&mut handle, &spec.socket, wait);
        // Keep the handle even when readiness failed: the state file points at
        // the pid, and a follow-up stop should reap it.
        self.game = Some(handle);
        ready?;
        Ok(state)
    }

    /// Graceful quit, then liveness wait, then signal escalation, then state
    /// deletion. Later steps run regardless of earlier outcomes; calling this
    /// with nothing supervised is a silent success.
    pub fn stop(
        &mut self,
        socket: Option<&Path>,
        graceful_wait: Duration,
    ) -> Result<(), ControlError> {
        let state = self.store.load();
        let socket = self.resolve_socket(socket);
        // Best effort; an already-dead game or refusing endpoint must not
        // derail the escalation below.
        let _ = channel::send_command(&RemoteCommand::Quit, &socket, QUIT_TIMEOUT);

        let state_pid = state.as_ref().map(|state| state.pid).filter(|pid| *pid > 0);
        match (state_pid, self.game.take()) {
            (Some(pid), Some(handle)) if handle.pid() == pid => {
                let mut handle = handle;
                escalate_shutdown(&mut handle, graceful_wait);
            }
            (Some(pid), other) => {
                // State points at a process this invocation did not spawn.
                if let Some(mut handle) = other {
                    escalate_shutdown(&mut handle, graceful_wait);
                }
                let mut handle = GameHandle::from_pid(pid);
                escalate_shutdown(&mut handle, graceful_wait);
            }
            (None, Some(mut handle)) => {
                escalate_shutdown(&mut handle, graceful_wait);
            }
            (None, None) => {}
        }

        self.store.clear()?;
        Ok(())
    }

    pub fn ping(&self, socket: Option<&Path>, timeout: Duration) -> Result<Value, ControlError> {
        self.call(RemoteCommand::Ping, socket, timeout)
            .map(RemoteResponse::into_value)
    }

    pub fn game_state(
        &self,
        socket: Option<&Path>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        self.call(RemoteCommand::GetState, socket, timeout)
            .map(RemoteResponse::into_value)
    }

    pub fn wait_frames(
        &self,
        frames: u32,
        socket: Option<&Path>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        self.call(RemoteCommand::WaitFrames { frames }, socket, timeout)
            .map(RemoteResponse::into_value)
    }

    /// The game wants an absolute path; relative paths are resolved here, on
    /// the caller's side of the channel.
    pub fn screenshot(
        &self,
        path: &Path,
        socket: Option<&Path>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        self.call(
            RemoteCommand::Screenshot {
                path: resolved.display().to_string(),
            },
            socket,
            timeout,
        )
        .map(RemoteResponse::into_value)
    }

    /// Repeat and the inter-repeat frame wait are a caller-side loop; the wire
    /// command carries a single key press.
    pub fn send_key(
        &self,
        key: &str,
        action: KeyAction,
        repeat: u32,
        wait_between: u32,
        socket: Option<&Path>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        for _ in 0..repeat {
            self.call(
                RemoteCommand::SendKey {
                    key: key.to_string(),
                    action,
                },
                socket,
                timeout,
            )?;
            if wait_between > 0 {
                self.call(
                    RemoteCommand::WaitFrames {
                        frames: wait_between,
                    },
                    socket,
                    timeout,
                )?;
            }
        }
        Ok(json!({"ok": true}))
    }

    pub fn send_keys(
        &self,
        keys: &[String],
        wait_between: u32,
        socket: Option<&Path>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        for key in keys {
            self.call(
                RemoteCommand::SendKey {
                    key: key.clone(),
                    action: KeyAction::Tap,
                },
                socket,
                timeout,
            )?;
            if wait_between > 0 {
                self.call(
                    RemoteCommand::WaitFrames {
                        frames: wait_between,
                    },
                    socket,
                    timeout,
                )?;
            }
        }
        Ok(json!({"ok": true}))
    }

    pub fn send_text(
        &self,
        text: &str,
        socket: Option<&Path>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        self.call(
            RemoteCommand::SendText {
                text: text.to_string(),
            },
            socket,
            timeout,
        )
        .map(RemoteResponse::into_value)
    }

    pub fn console_exec(
        &self,
        command: &str,
        socket: Option<&Path>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        self.call(
            RemoteCommand::ConsoleExec {
                command: command.to_string(),
            },
            socket,
            timeout,
        )
        .map(RemoteResponse::into_value)
    }

    /// The persisted launch record, without touching the game.
    pub fn local_state(&self) -> Value {
        match self.store.load() {
            Some(state) => serde_json::to_value(state).unwrap_or_else(|_| json!({})),
            None => json!({}),
        }
    }
}
