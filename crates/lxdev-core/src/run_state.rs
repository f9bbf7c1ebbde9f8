use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const STATE_FILE: &str = "state.json";

/// What lxdev remembers between invocations.
///
/// The file exists from a completed `up` until the matching `halt` or
/// `destroy`. The pids are informational; forwarders are always found
/// again through the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub status: String,
    #[serde(default)]
    pub redir_pids: Vec<u32>,
}

impl RunState {
    pub fn running(redir_pids: Vec<u32>) -> Self {
        RunState {
            status: "running".to_string(),
            redir_pids,
        }
    }

    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(STATE_FILE)
    }

    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(Self::path(state_dir)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(state_dir)?;
        std::fs::write(Self::path(state_dir), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn remove(state_dir: &Path) -> Result<()> {
        match std::fs::remove_file(Self::path(state_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
