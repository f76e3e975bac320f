use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use memchr::memchr;
use serde_json::Value;

use crate::protocol::{RemoteCommand, RemoteResponse};

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug)]
pub enum ChannelError {
    /// The whole-call deadline expired during connect, send, or receive.
    Timeout(Duration),
    /// The game closed the connection without sending any bytes.
    EmptyResponse,
    /// The response line was not a JSON object.
    MalformedResponse(String),
    /// The game answered with `ok: false` (or no `ok` at all). Protocol-level
    /// failure, not a transport failure.
    Refused(String),
    Io(io::Error),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Timeout(duration) => write!(
                f,
                "timed out after {} ms waiting for response",
                duration.as_millis()
            ),
            ChannelError::EmptyResponse => write!(f, "empty response from game"),
            ChannelError::MalformedResponse(message) => {
                write!(f, "malformed response: {message}")
            }
            ChannelError::Refused(message) => write!(f, "{message}"),
            ChannelError::Io(err) => write!(f, "channel io error: {err}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        ChannelError::Io(err)
    }
}

/// One request/response exchange with the game's remote-control socket.
///
/// Opens a fresh connection, writes the command as a single JSON line, and
/// reads until the first newline (or EOF). The connection is dropped on every
/// exit path, so there is never protocol state to desynchronize across calls.
/// `timeout` bounds the whole exchange.
pub fn send_command(
    command: &RemoteCommand,
    socket_path: &Path,
    timeout: Duration,
) -> Result<RemoteResponse, ChannelError> {
    let deadline = Instant::now() + timeout;
    let mut stream = UnixStream::connect(socket_path)?;

    let mut payload = serde_json::to_vec(command)
        .map_err(|err| ChannelError::Io(io::Error::other(err)))?;
    payload.push(b'\n');

    stream.set_write_timeout(Some(remaining(deadline, timeout)?))?;
    match stream.write_all(&payload) {
        Ok(()) => {}
        Err(err) if is_timeout(&err) => return Err(ChannelError::Timeout(timeout)),
        Err(err) => return Err(ChannelError::Io(err)),
    }

    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        stream.set_read_timeout(Some(remaining(deadline, timeout)?))?;
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if memchr(b'\n', &chunk[..n]).is_some() {
                    break;
                }
            }
            Err(err) if is_timeout(&err) => return Err(ChannelError::Timeout(timeout)),
            Err(err) => return Err(ChannelError::Io(err)),
        }
    }

    decode_response(&buf)
}

/// First newline-delimited segment wins; anything the game wrote after it in
/// the same read is discarded.
fn decode_response(buf: &[u8]) -> Result<RemoteResponse, ChannelError> {
    let line = match memchr(b'\n', buf) {
        Some(pos) => &buf[..pos],
        None => buf,
    };
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Err(ChannelError::EmptyResponse);
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|err| ChannelError::MalformedResponse(err.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(ChannelError::MalformedResponse(
            "expected a JSON object".to_string(),
        ));
    };

    let response = RemoteResponse::from_fields(fields);
    if !response.ok() {
        let message = response
            .error_message()
            .unwrap_or("command failed")
            .to_string();
        return Err(ChannelError::Refused(message));
    }
    Ok(response)
}

fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration, ChannelError> {
    let left = deadline.saturating_duration_since(Instant::now());
    // A zero socket timeout means "block forever"; treat it as already expired.
    if left.is_zero() {
        return Err(ChannelError::Timeout(timeout));
    }
    Ok(left)
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
