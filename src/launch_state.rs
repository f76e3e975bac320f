use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The single persisted record identifying the supervised game process.
/// At most one exists at a time; it is the source of truth for "is a game
/// currently supervised" across controller invocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchState {
    pub pid: i32,
    pub socket: String,
    pub binary: String,
    pub data: String,
    pub log: String,
    pub launched_at: u64,
}

/// Whole-record store for the launch state slot. Reads treat a missing or
/// unreadable file as "nothing supervised"; writes replace the record
/// atomically (temp file + rename in the same directory) so a torn record is
/// never observable.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Option<LaunchState> {
        let bytes = fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn save(&self, state: &LaunchState) -> io::Result<()> {
        let payload = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;
        let temp = self.temp_path();
        fs::write(&temp, payload)?;
        match fs::rename(&temp, &self.path) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp);
                Err(err)
            }
        }
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string());
        self.path
            .with_file_name(format!(".{name}.{}.tmp", std::process::id()))
    }
}
