use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::channel::{self, ChannelError};
use crate::launch_state::{LaunchState, StateStore};
use crate::protocol::RemoteCommand;

const READY_PING_TIMEOUT: Duration = Duration::from_secs(1);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long a terminated game gets to exit before the kill signal.
const TERM_GRACE: Duration = Duration::from_secs(2);
/// Bound on the post-kill wait; SIGKILL cannot be ignored, this only covers
/// scheduler latency.
const KILL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum ControlError {
    /// The game binary does not exist. Fatal, never retried.
    BinaryNotFound(PathBuf),
    /// The game exited early or never became ready by the deadline.
    LaunchFailed(String),
    /// A channel exchange failed, with the command and endpoint for context.
    Channel {
        command: &'static str,
        socket: PathBuf,
        source: ChannelError,
    },
    /// An operation needed a known endpoint but no usable state exists.
    State(String),
    Io(io::Error),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::BinaryNotFound(path) => {
                write!(f, "binary not found: {}", path.display())
            }
            ControlError::LaunchFailed(message) => write!(f, "{message}"),
            ControlError::Channel {
                command,
                socket,
                source,
            } => write!(f, "{command} failed ({}): {source}", socket.display()),
            ControlError::State(message) => write!(f, "{message}"),
            ControlError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Channel { source, .. } => Some(source),
            ControlError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ControlError {
    fn from(err: io::Error) -> Self {
        ControlError::Io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMenu {
    Title,
    Setup,
    Graphics,
}

impl StartMenu {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "title" => Ok(StartMenu::Title),
            "setup" => Ok(StartMenu::Setup),
            "graphics" => Ok(StartMenu::Graphics),
            other => Err(format!(
                "invalid start menu: {other} (expected title|setup|graphics)"
            )),
        }
    }
}

/// Everything the supervisor needs to spawn the game.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub data_dir: String,
    pub socket: PathBuf,
    pub log: PathBuf,
    pub start_menu: StartMenu,
    pub start_menu_option: Option<String>,
    pub start_menu_enter: bool,
    pub extra_args: Vec<String>,
}

/// Owned handle to the supervised game process. When this controller spawned
/// the game itself the underlying `Child` is kept so liveness checks reap the
/// exit status; a handle re-attached from the state file falls back to
/// signal-0 probing.
#[derive(Debug)]
pub struct GameHandle {
    pid: i32,
    child: Option<Child>,
}

impl GameHandle {
    pub fn from_child(child: Child) -> Self {
        let pid = child.id() as i32;
        Self {
            pid,
            child: Some(child),
        }
    }

    pub fn from_pid(pid: i32) -> Self {
        Self { pid, child: None }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn alive(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            return matches!(child.try_wait(), Ok(None));
        }
        let result = unsafe { libc::kill(self.pid, 0) };
        if result == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    /// Polls until the process exits or `timeout` elapses. Returns true once
    /// the process is gone.
    pub fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    pub fn terminate(&self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    pub fn kill(&self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }

    fn signal(&self, signal: i32) -> io::Result<()> {
        let result = unsafe { libc::kill(self.pid, signal) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // Already gone between checks; that is what the signal was for.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.wait();
        }
    }
}

/// Spawns the game detached into its own session, output appended to the log,
/// and persists the launch record before readiness is confirmed, so a caller
/// can always find the pid even if readiness later times out.
pub fn launch(spec: &LaunchSpec, store: &StateStore) -> Result<(GameHandle, LaunchState), ControlError> {
    let binary = resolve_binary(&spec.binary)?;
    remove_stale_socket(&spec.socket)?;

    let log_out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log)?;
    let log_err = log_out.try_clone()?;

    let mut command = Command::new(&binary);
    command
        .arg("--remote-control")
        .arg(format!("--remote-socket={}", spec.socket.display()))
        .arg(format!("--data={}", spec.data_dir));
    match spec.start_menu {
        StartMenu::Title => {}
        StartMenu::Setup => {
            command.arg("--start-setup-menu");
        }
        StartMenu::Graphics => {
            command.arg("--start-graphics-menu");
        }
    }
    if let Some(option) = &spec.start_menu_option {
        command.arg(format!("--start-menu-option={option}"));
    }
    if spec.start_menu_enter {
        command.arg("--start-menu-enter");
    }
    command.args(&spec.extra_args);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_out))
        .stderr(Stdio::from(log_err));
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    let handle = GameHandle::from_child(child);
    let state = LaunchState {
        pid: handle.pid(),
        socket: spec.socket.display().to_string(),
        binary: binary.display().to_string(),
        data: spec.data_dir.clone(),
        log: spec.log.display().to_string(),
        launched_at: unix_now(),
    };
    store.save(&state)?;
    Ok((handle, state))
}

/// Polls until the game answers a ping or `wait` elapses. A game that exits
/// before answering fails immediately rather than waiting out the deadline.
pub fn await_ready(
    handle: &mut GameHandle,
    socket: &Path,
    wait: Duration,
) -> Result<(), ControlError> {
    let deadline = Instant::now() + wait;
    let mut last_err: Option<ChannelError> = None;
    loop {
        if !handle.alive() {
            handle.reap();
            return Err(ControlError::LaunchFailed(match &last_err {
                Some(err) => format!("game exited before becoming ready (last error: {err})"),
                None => "game exited before becoming ready".to_string(),
            }));
        }
        if Instant::now() >= deadline {
            break;
        }
        match channel::send_command(&RemoteCommand::Ping, socket, READY_PING_TIMEOUT) {
            Ok(_) => return Ok(()),
            Err(err) => {
                last_err = Some(err);
                thread::sleep(READY_POLL_INTERVAL);
            }
        }
    }
    Err(ControlError::LaunchFailed(match &last_err {
        Some(err) => format!(
            "game did not become ready within {} ms (last error: {err})",
            wait.as_millis()
        ),
        None => format!("game did not become ready within {} ms", wait.as_millis()),
    }))
}

/// Signal escalation after the graceful-quit attempt: wait for a voluntary
/// exit, then SIGTERM, then SIGKILL. Never fails; a process that vanishes
/// between steps is success, and later steps are skipped once the exit is
/// confirmed.
pub fn escalate_shutdown(handle: &mut GameHandle, graceful_wait: Duration) {
    if handle.wait_exit(graceful_wait) {
        handle.reap();
        return;
    }
    let _ = handle.terminate();
    if handle.wait_exit(TERM_GRACE) {
        handle.reap();
        return;
    }
    let _ = handle.kill();
    let _ = handle.wait_exit(KILL_WAIT);
    handle.reap();
}

fn resolve_binary(binary: &Path) -> Result<PathBuf, ControlError> {
    let resolved = if binary.is_absolute() {
        binary.to_path_buf()
    } else {
        std::env::current_dir()?.join(binary)
    };
    if !resolved.exists() {
        return Err(ControlError::BinaryNotFound(resolved));
    }
    Ok(resolved)
}

/// A crashed prior run can leave its socket file behind, which would block the
/// new game from binding the same address.
fn remove_stale_socket(socket: &Path) -> Result<(), ControlError> {
    match std::fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ControlError::Io(err)),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
