use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

const ENABLE_ENV: &str = "MCP_GAMECTL_DEBUG_STARTUP";
const FILE_ENV: &str = "MCP_GAMECTL_DEBUG_STARTUP_FILE";
const DEFAULT_FILE: &str = "mcp-gamectl-startup.log";

struct Sink {
    file: Mutex<File>,
    epoch: Instant,
}

static SINK: OnceLock<Option<Sink>> = OnceLock::new();

fn sink() -> Option<&'static Sink> {
    SINK.get_or_init(|| {
        let path = match std::env::var(FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => path,
            _ => {
                let enabled = std::env::var(ENABLE_ENV)
                    .map(|value| !value.trim().is_empty())
                    .unwrap_or(false);
                if !enabled {
                    return None;
                }
                DEFAULT_FILE.to_string()
            }
        };
        let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
        Some(Sink {
            file: Mutex::new(file),
            epoch: Instant::now(),
        })
    })
    .as_ref()
}

/// Append one line to the opt-in startup trace. A no-op unless
/// `MCP_GAMECTL_DEBUG_STARTUP` (or an explicit trace file) is set, for
/// debugging server boot order without a connected client.
pub fn startup_log(message: impl AsRef<str>) {
    let Some(sink) = sink() else {
        return;
    };
    let uptime_ms = sink.epoch.elapsed().as_millis();
    if let Ok(mut file) = sink.file.lock() {
        let _ = writeln!(
            *file,
            "[mcp-gamectl][startup +{uptime_ms:>6}ms] {}",
            message.as_ref()
        );
        let _ = file.flush();
    }
}
