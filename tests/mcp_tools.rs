mod common;

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use common::{GameTestSession, TestResult, is_error, result_json, result_text, spawn_server};
use serde_json::{Value, json};

async fn spawn_with_state_file(dir: &Path) -> TestResult<GameTestSession> {
    spawn_server(vec![
        "--state-file".to_string(),
        dir.join("state.json").display().to_string(),
    ])
    .await
}

fn write_stub(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, script).expect("write stub");
    let mut perms = std::fs::metadata(&path).expect("stat stub").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod stub");
    path
}

/// Plays the game's side of the channel: accepts connections and answers every
/// request line with a pong, starting `delay` after the call.
fn serve_ping_after(socket: PathBuf, delay: Duration) {
    thread::spawn(move || {
        thread::sleep(delay);
        let listener = UnixListener::bind(&socket).expect("bind mock endpoint");
        while let Ok((stream, _)) = listener.accept() {
            let mut reader = BufReader::new(match stream.try_clone() {
                Ok(clone) => clone,
                Err(_) => continue,
            });
            let mut line = String::new();
            if reader.read_line(&mut line).is_err() {
                continue;
            }
            let mut stream = stream;
            let _ = stream.write_all(b"{\"ok\":true,\"pong\":true}\n");
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn lists_the_full_tool_catalog() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = spawn_with_state_file(dir.path()).await?;

    let mut names = session.list_tool_names().await?;
    names.sort();
    assert_eq!(
        names,
        vec![
            "game_console",
            "game_launch",
            "game_local_state",
            "game_ping",
            "game_screenshot",
            "game_send_key",
            "game_send_keys",
            "game_send_text",
            "game_state",
            "game_stop",
            "game_wait",
        ]
    );

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn local_state_is_empty_without_a_launch() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = spawn_with_state_file(dir.path()).await?;

    let result = session.call_tool("game_local_state", Value::Null).await?;
    assert!(!is_error(&result), "unexpected error: {}", result_text(&result));
    assert_eq!(result_json(&result), json!({}));

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_without_a_game_is_a_tool_error() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = spawn_server(vec![
        "--state-file".to_string(),
        dir.path().join("state.json").display().to_string(),
        "--socket".to_string(),
        dir.path().join("missing.sock").display().to_string(),
    ])
    .await?;

    let result = session.call_tool("game_ping", Value::Null).await?;
    assert!(is_error(&result), "expected a tool error");
    let text = result_text(&result);
    assert!(text.contains("ping"), "missing command context: {text}");
    assert!(
        text.contains("missing.sock"),
        "missing endpoint context: {text}"
    );

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_rejects_a_zero_frame_count() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = spawn_with_state_file(dir.path()).await?;

    let err = session
        .call_tool("game_wait", json!({"frames": 0}))
        .await
        .expect_err("zero frames should be rejected");
    assert!(
        err.to_string().contains("positive"),
        "unexpected error: {err}"
    );

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn send_key_rejects_an_unknown_action() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = spawn_with_state_file(dir.path()).await?;

    let err = session
        .call_tool("game_send_key", json!({"key": "return", "action": "smash"}))
        .await
        .expect_err("unknown action should be rejected");
    assert!(
        err.to_string().contains("invalid key action"),
        "unexpected error: {err}"
    );

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn launch_reports_a_missing_binary() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = spawn_with_state_file(dir.path()).await?;

    let result = session
        .call_tool(
            "game_launch",
            json!({
                "binary": dir.path().join("no-such-game").display().to_string(),
                "socket": dir.path().join("game.sock").display().to_string(),
            }),
        )
        .await?;
    assert!(is_error(&result), "expected a tool error");
    assert!(
        result_text(&result).contains("binary not found"),
        "unexpected message: {}",
        result_text(&result)
    );

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn launch_ping_stop_round_trip_with_a_mock_game() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let stub = write_stub(dir.path(), "game.sh", "#!/bin/sh\nexec sleep 60\n");
    let socket = dir.path().join("game.sock");
    let session = spawn_with_state_file(dir.path()).await?;

    // The mock endpoint only starts answering pings 200 ms in, after the
    // supervisor has cleared the socket path and spawned the stub.
    serve_ping_after(socket.clone(), Duration::from_millis(200));

    let result = session
        .call_tool(
            "game_launch",
            json!({
                "binary": stub.display().to_string(),
                "socket": socket.display().to_string(),
                "log": dir.path().join("game.log").display().to_string(),
                "wait_start": 10.0,
            }),
        )
        .await?;
    assert!(!is_error(&result), "launch failed: {}", result_text(&result));
    let state = result_json(&result);
    let pid = state.get("pid").and_then(Value::as_i64).expect("pid");
    assert!(pid > 0);
    assert_eq!(
        state.get("socket").and_then(Value::as_str),
        Some(socket.display().to_string().as_str())
    );

    // The endpoint now resolves from the persisted state, no override needed.
    let result = session.call_tool("game_ping", Value::Null).await?;
    assert!(!is_error(&result), "ping failed: {}", result_text(&result));
    assert_eq!(
        result_json(&result).get("pong"),
        Some(&json!(true))
    );

    let result = session.call_tool("game_stop", Value::Null).await?;
    assert!(!is_error(&result), "stop failed: {}", result_text(&result));

    let result = session.call_tool("game_local_state", Value::Null).await?;
    assert_eq!(result_json(&result), json!({}));

    let alive = unsafe { libc::kill(pid as i32, 0) == 0 };
    assert!(!alive, "stub game still alive after game_stop");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_idempotent_through_the_gateway() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = spawn_with_state_file(dir.path()).await?;

    for _ in 0..2 {
        let result = session.call_tool("game_stop", Value::Null).await?;
        assert!(!is_error(&result), "stop failed: {}", result_text(&result));
    }

    session.cancel().await?;
    Ok(())
}
