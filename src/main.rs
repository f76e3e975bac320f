mod channel;
mod controller;
mod diagnostics;
mod event_log;
mod game_process;
mod launch_state;
mod protocol;
mod server;

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::controller::{
    Controller, ControllerConfig, DEFAULT_STOP_WAIT, DEFAULT_WAIT_START, LaunchOptions,
};
use crate::game_process::StartMenu;
use crate::protocol::KeyAction;

const STATE_FILE_ENV: &str = "MCP_GAMECTL_STATE_FILE";
const SOCKET_ENV: &str = "MCP_GAMECTL_SOCKET";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SEND_KEY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug)]
enum CliCommand {
    Serve(ServeOptions),
    Launch(Box<LaunchOptions>),
    Stop {
        socket: Option<PathBuf>,
        wait: Duration,
    },
    Ping(RemoteOpts),
    GameState(RemoteOpts),
    Wait {
        frames: u32,
        opts: RemoteOpts,
    },
    Screenshot {
        path: PathBuf,
        opts: RemoteOpts,
    },
    SendKey {
        key: String,
        action: KeyAction,
        repeat: u32,
        wait_between: u32,
        opts: RemoteOpts,
    },
    SendKeys {
        keys: Vec<String>,
        wait_between: u32,
        opts: RemoteOpts,
    },
    SendText {
        text: String,
        opts: RemoteOpts,
    },
    Console {
        command: String,
        opts: RemoteOpts,
    },
    LocalState,
}

#[derive(Debug)]
struct ServeOptions {
    config: ControllerConfig,
    debug_events_dir: Option<PathBuf>,
}

/// Flags shared by every command that talks to the running game.
#[derive(Debug)]
struct RemoteOpts {
    socket: Option<PathBuf>,
    timeout: Duration,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A downstream reader closing its end of stdout would otherwise raise
    // SIGPIPE and terminate the process; surface broken-pipe errors normally
    // instead.
    ignore_sigpipe();
    diagnostics::startup_log("main: entry");

    match parse_cli_args()? {
        CliCommand::Serve(options) => {
            event_log::initialize(
                options.debug_events_dir.clone(),
                event_log::StartupContext {
                    mode: "server".to_string(),
                    state_file: options.config.state_file.display().to_string(),
                    socket: options
                        .config
                        .socket
                        .as_ref()
                        .map(|path| path.display().to_string()),
                },
            )?;
            diagnostics::startup_log("main: server mode");
            server::run(options.config).await
        }
        command => {
            diagnostics::startup_log("main: cli mode");
            if let Err(err) = run_cli_command(command) {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn run_cli_command(command: CliCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        CliCommand::Serve(_) => unreachable!("serve handled in main"),
        CliCommand::Launch(options) => {
            let mut controller = Controller::new(cli_config(None));
            let state = controller.launch(*options)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        CliCommand::Stop { socket, wait } => {
            let mut controller = Controller::new(cli_config(socket));
            controller.stop(None, wait)?;
        }
        CliCommand::Ping(opts) => {
            let controller = Controller::new(cli_config(opts.socket));
            print_compact(&controller.ping(None, opts.timeout)?)?;
        }
        CliCommand::GameState(opts) => {
            let controller = Controller::new(cli_config(opts.socket));
            print_pretty(&controller.game_state(None, opts.timeout)?)?;
        }
        CliCommand::Wait { frames, opts } => {
            let controller = Controller::new(cli_config(opts.socket));
            print_compact(&controller.wait_frames(frames, None, opts.timeout)?)?;
        }
        CliCommand::Screenshot { path, opts } => {
            let controller = Controller::new(cli_config(opts.socket));
            print_compact(&controller.screenshot(&path, None, opts.timeout)?)?;
        }
        CliCommand::SendKey {
            key,
            action,
            repeat,
            wait_between,
            opts,
        } => {
            let controller = Controller::new(cli_config(opts.socket));
            print_compact(&controller.send_key(
                &key,
                action,
                repeat,
                wait_between,
                None,
                opts.timeout,
            )?)?;
        }
        CliCommand::SendKeys {
            keys,
            wait_between,
            opts,
        } => {
            let controller = Controller::new(cli_config(opts.socket));
            print_compact(&controller.send_keys(&keys, wait_between, None, opts.timeout)?)?;
        }
        CliCommand::SendText { text, opts } => {
            let controller = Controller::new(cli_config(opts.socket));
            print_compact(&controller.send_text(&text, None, opts.timeout)?)?;
        }
        CliCommand::Console { command, opts } => {
            let controller = Controller::new(cli_config(opts.socket));
            print_pretty(&controller.console_exec(&command, None, opts.timeout)?)?;
        }
        CliCommand::LocalState => {
            let controller = Controller::new(cli_config(None));
            print_pretty(&controller.local_state())?;
        }
    }
    Ok(())
}

fn print_compact(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_pretty(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cli_config(socket: Option<PathBuf>) -> ControllerConfig {
    ControllerConfig {
        state_file: state_file_from_env(),
        socket: socket.or_else(socket_from_env),
        ..ControllerConfig::default()
    }
}

fn state_file_from_env() -> PathBuf {
    std::env::var(STATE_FILE_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(controller::DEFAULT_STATE_FILE))
}

fn socket_from_env() -> Option<PathBuf> {
    std::env::var(SOCKET_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_cli_args() -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    let Some(first) = parser.peek().map(str::to_string) else {
        return parse_serve_args(&mut parser);
    };

    match first.as_str() {
        "-h" | "--help" => {
            print_usage();
            std::process::exit(0);
        }
        "launch" | "stop" | "ping" | "game-state" | "wait" | "screenshot" | "send-key"
        | "send-keys" | "send-text" | "console" | "local-state" => {
            parser.next();
        }
        _ => return parse_serve_args(&mut parser),
    }

    match first.as_str() {
        "launch" => parse_launch_args(&mut parser),
        "stop" => parse_stop_args(&mut parser),
        "ping" => Ok(CliCommand::Ping(parse_remote_opts(
            &mut parser,
            "ping",
            DEFAULT_COMMAND_TIMEOUT,
        )?)),
        "game-state" => Ok(CliCommand::GameState(parse_remote_opts(
            &mut parser,
            "game-state",
            DEFAULT_COMMAND_TIMEOUT,
        )?)),
        "wait" => parse_wait_args(&mut parser),
        "screenshot" => parse_screenshot_args(&mut parser),
        "send-key" => parse_send_key_args(&mut parser),
        "send-keys" => parse_send_keys_args(&mut parser),
        "send-text" => parse_send_text_args(&mut parser),
        "console" => parse_console_args(&mut parser),
        "local-state" => {
            if let Some(arg) = parser.next() {
                return Err(format!("unknown argument for local-state: {arg}").into());
            }
            Ok(CliCommand::LocalState)
        }
        _ => unreachable!("subcommand list checked above"),
    }
}

fn parse_serve_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut config = ControllerConfig {
        state_file: state_file_from_env(),
        socket: socket_from_env(),
        ..ControllerConfig::default()
    };
    let mut debug_events_dir = None;

    while let Some(arg) = parser.next() {
        if arg == "-h" || arg == "--help" {
            print_usage();
            std::process::exit(0);
        }
        if let Some(value) = flag_value(&arg, "--state-file", parser)? {
            config.state_file = PathBuf::from(value);
        } else if let Some(value) = flag_value(&arg, "--socket", parser)? {
            config.socket = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--binary", parser)? {
            config.binary = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--data", parser)? {
            config.data_dir = value;
        } else if let Some(value) = flag_value(&arg, "--log", parser)? {
            config.log = PathBuf::from(value);
        } else if let Some(value) = flag_value(&arg, "--debug-events-dir", parser)? {
            debug_events_dir = Some(PathBuf::from(value));
        } else {
            return Err(format!("unknown argument: {arg}").into());
        }
    }

    Ok(CliCommand::Serve(ServeOptions {
        config,
        debug_events_dir,
    }))
}

fn parse_launch_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut options = LaunchOptions {
        wait_start: Some(DEFAULT_WAIT_START),
        ..LaunchOptions::default()
    };

    while let Some(arg) = parser.next() {
        if arg == "-h" || arg == "--help" {
            print_usage();
            std::process::exit(0);
        }
        if arg == "--" {
            options.extra_args.extend(parser.rest());
            break;
        }
        if arg == "--start-menu-enter" {
            options.start_menu_enter = true;
            continue;
        }
        if let Some(value) = flag_value(&arg, "--binary", parser)? {
            options.binary = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--data", parser)? {
            options.data_dir = Some(value);
        } else if let Some(value) = flag_value(&arg, "--socket", parser)? {
            options.socket = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--log", parser)? {
            options.log = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--wait-start", parser)? {
            options.wait_start = Some(parse_seconds(&value, "--wait-start", false)?);
        } else if let Some(value) = flag_value(&arg, "--start-menu", parser)? {
            options.start_menu = Some(StartMenu::parse(&value)?);
        } else if let Some(value) = flag_value(&arg, "--start-menu-option", parser)? {
            options.start_menu_option = Some(value);
        } else {
            return Err(format!("unknown argument for launch: {arg} (game args go after --)").into());
        }
    }

    Ok(CliCommand::Launch(Box::new(options)))
}

fn parse_stop_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut socket = None;
    let mut wait = DEFAULT_STOP_WAIT;
    while let Some(arg) = parser.next() {
        if let Some(value) = flag_value(&arg, "--socket", parser)? {
            socket = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--wait", parser)? {
            wait = parse_seconds(&value, "--wait", true)?;
        } else {
            return Err(format!("unknown argument for stop: {arg}").into());
        }
    }
    Ok(CliCommand::Stop { socket, wait })
}

fn parse_remote_opts(
    parser: &mut ArgParser,
    subcommand: &str,
    default_timeout: Duration,
) -> Result<RemoteOpts, Box<dyn std::error::Error>> {
    let mut socket = None;
    let mut timeout = default_timeout;
    while let Some(arg) = parser.next() {
        if let Some(value) = flag_value(&arg, "--socket", parser)? {
            socket = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--timeout", parser)? {
            timeout = parse_seconds(&value, "--timeout", false)?;
        } else {
            return Err(format!("unknown argument for {subcommand}: {arg}").into());
        }
    }
    Ok(RemoteOpts { socket, timeout })
}

fn parse_wait_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let (positional, opts) =
        split_positional(parser, "wait", DEFAULT_FRAME_WAIT_TIMEOUT, &mut Vec::new())?;
    let [frames] = positional.as_slice() else {
        return Err("usage: wait FRAMES [--socket PATH] [--timeout SECS]".into());
    };
    let frames = parse_count(frames, "FRAMES", 1)?;
    Ok(CliCommand::Wait { frames, opts })
}

fn parse_screenshot_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let (positional, opts) =
        split_positional(parser, "screenshot", DEFAULT_SCREENSHOT_TIMEOUT, &mut Vec::new())?;
    let [path] = positional.as_slice() else {
        return Err("usage: screenshot PATH [--socket PATH] [--timeout SECS]".into());
    };
    Ok(CliCommand::Screenshot {
        path: PathBuf::from(path),
        opts,
    })
}

fn parse_send_key_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut extra_flags: Vec<(String, String)> = Vec::new();
    let (positional, opts) = split_positional_with(
        parser,
        "send-key",
        DEFAULT_SEND_KEY_TIMEOUT,
        &["--action", "--repeat", "--wait-between"],
        &mut extra_flags,
    )?;
    let [key] = positional.as_slice() else {
        return Err(
            "usage: send-key KEY [--action tap|down|up] [--repeat N] [--wait-between FRAMES]".into(),
        );
    };

    let mut action = KeyAction::Tap;
    let mut repeat = 1u32;
    let mut wait_between = 0u32;
    for (flag, value) in extra_flags {
        match flag.as_str() {
            "--action" => action = KeyAction::parse(&value)?,
            "--repeat" => repeat = parse_count(&value, "--repeat", 1)?,
            "--wait-between" => wait_between = parse_count(&value, "--wait-between", 0)?,
            _ => unreachable!("flag list passed to split_positional_with"),
        }
    }

    Ok(CliCommand::SendKey {
        key: key.clone(),
        action,
        repeat,
        wait_between,
        opts,
    })
}

fn parse_send_keys_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut extra_flags: Vec<(String, String)> = Vec::new();
    let (positional, opts) = split_positional_with(
        parser,
        "send-keys",
        DEFAULT_SEND_KEY_TIMEOUT,
        &["--wait-between"],
        &mut extra_flags,
    )?;
    if positional.is_empty() {
        return Err("usage: send-keys KEY... [--wait-between FRAMES]".into());
    }

    let mut wait_between = 0u32;
    for (flag, value) in extra_flags {
        match flag.as_str() {
            "--wait-between" => wait_between = parse_count(&value, "--wait-between", 0)?,
            _ => unreachable!("flag list passed to split_positional_with"),
        }
    }

    Ok(CliCommand::SendKeys {
        keys: positional,
        wait_between,
        opts,
    })
}

fn parse_send_text_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let (positional, opts) =
        split_positional(parser, "send-text", DEFAULT_COMMAND_TIMEOUT, &mut Vec::new())?;
    let [text] = positional.as_slice() else {
        return Err("usage: send-text TEXT [--socket PATH] [--timeout SECS]".into());
    };
    Ok(CliCommand::SendText {
        text: text.clone(),
        opts,
    })
}

fn parse_console_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let (positional, opts) =
        split_positional(parser, "console", DEFAULT_COMMAND_TIMEOUT, &mut Vec::new())?;
    let [command] = positional.as_slice() else {
        return Err("usage: console COMMAND [--socket PATH] [--timeout SECS]".into());
    };
    Ok(CliCommand::Console {
        command: command.clone(),
        opts,
    })
}

fn split_positional(
    parser: &mut ArgParser,
    subcommand: &str,
    default_timeout: Duration,
    extra_flags: &mut Vec<(String, String)>,
) -> Result<(Vec<String>, RemoteOpts), Box<dyn std::error::Error>> {
    split_positional_with(parser, subcommand, default_timeout, &[], extra_flags)
}

/// Separates positional arguments from the shared remote flags plus any
/// subcommand-specific value flags named in `known_flags`.
fn split_positional_with(
    parser: &mut ArgParser,
    subcommand: &str,
    default_timeout: Duration,
    known_flags: &[&str],
    extra_flags: &mut Vec<(String, String)>,
) -> Result<(Vec<String>, RemoteOpts), Box<dyn std::error::Error>> {
    let mut positional = Vec::new();
    let mut socket = None;
    let mut timeout = default_timeout;

    'args: while let Some(arg) = parser.next() {
        if let Some(value) = flag_value(&arg, "--socket", parser)? {
            socket = Some(PathBuf::from(value));
            continue;
        }
        if let Some(value) = flag_value(&arg, "--timeout", parser)? {
            timeout = parse_seconds(&value, "--timeout", false)?;
            continue;
        }
        for flag in known_flags {
            if let Some(value) = flag_value(&arg, flag, parser)? {
                extra_flags.push((flag.to_string(), value));
                continue 'args;
            }
        }
        if arg.starts_with('-') && arg != "-" {
            return Err(format!("unknown argument for {subcommand}: {arg}").into());
        }
        positional.push(arg);
    }

    Ok((positional, RemoteOpts { socket, timeout }))
}

/// Accepts both `--flag value` and `--flag=value`.
fn flag_value(
    arg: &str,
    name: &str,
    parser: &mut ArgParser,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    if arg == name {
        return parser.next_value(name).map(Some);
    }
    if let Some(rest) = arg.strip_prefix(name)
        && let Some(value) = rest.strip_prefix('=')
    {
        if value.is_empty() {
            return Err(format!("missing value for {name}").into());
        }
        return Ok(Some(value.to_string()));
    }
    Ok(None)
}

fn parse_seconds(
    raw: &str,
    flag: &str,
    allow_zero: bool,
) -> Result<Duration, Box<dyn std::error::Error>> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("invalid value for {flag}: {raw}"))?;
    let invalid = if allow_zero {
        !value.is_finite() || value < 0.0
    } else {
        !value.is_finite() || value <= 0.0
    };
    if invalid {
        return Err(format!("{flag} must be a positive number of seconds").into());
    }
    Ok(Duration::from_secs_f64(value))
}

fn parse_count(raw: &str, what: &str, min: u32) -> Result<u32, Box<dyn std::error::Error>> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value for {what}: {raw}"))?;
    if value < min {
        return Err(format!("{what} must be at least {min}").into());
    }
    Ok(value)
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn peek(&self) -> Option<&str> {
        self.args.get(self.index).map(String::as_str)
    }

    fn rest(&mut self) -> Vec<String> {
        let rest = self.args[self.index..].to_vec();
        self.index = self.args.len();
        rest
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
mcp-gamectl [--state-file PATH] [--socket PATH] [--binary PATH] [--data DIR] [--log PATH] [--debug-events-dir DIR]\n\
mcp-gamectl launch [--binary PATH] [--data DIR] [--socket PATH] [--log PATH] [--wait-start SECS] [--start-menu title|setup|graphics] [--start-menu-option NAME] [--start-menu-enter] [-- GAME_ARGS...]\n\
mcp-gamectl stop [--socket PATH] [--wait SECS]\n\
mcp-gamectl ping|game-state [--socket PATH] [--timeout SECS]\n\
mcp-gamectl wait FRAMES [--socket PATH] [--timeout SECS]\n\
mcp-gamectl screenshot PATH [--socket PATH] [--timeout SECS]\n\
mcp-gamectl send-key KEY [--action tap|down|up] [--repeat N] [--wait-between FRAMES] [--socket PATH] [--timeout SECS]\n\
mcp-gamectl send-keys KEY... [--wait-between FRAMES] [--socket PATH] [--timeout SECS]\n\
mcp-gamectl send-text TEXT [--socket PATH] [--timeout SECS]\n\
mcp-gamectl console COMMAND [--socket PATH] [--timeout SECS]\n\
mcp-gamectl local-state\n\n\
With no subcommand the process serves MCP over stdio.\n\
--state-file: launch-state slot (env: {STATE_FILE_ENV}; default {})\n\
--socket: remote-control endpoint override (env: {SOCKET_ENV}; normally resolved from the launch state)\n\
--debug-events-dir: optional directory for per-startup JSONL debug event logs (env: {})",
        controller::DEFAULT_STATE_FILE,
        event_log::DEBUG_EVENTS_DIR_ENV,
    );
}
