//! Persisted training progress used to resume interrupted runs.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{NmtError, Result};
use crate::persist::write_json_atomic;

/// File name of the state inside a training working directory.
pub const STATE_FILE: &str = "state.json";

/// One saved checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Training step at which the checkpoint was written.
    pub step: u64,
    /// Checkpoint path prefix; the checkpoint files are `<file>.<ext>`.
    pub file: PathBuf,
}

/// Training step plus checkpoint history, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last step reached.
    pub step: u64,
    history: Vec<CheckpointEntry>,
}

impl TrainingState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no checkpoint has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Most recent checkpoint.
    #[must_use]
    pub fn latest(&self) -> Option<&CheckpointEntry> {
        self.history.first()
    }

    /// All checkpoints, most recent first.
    #[must_use]
    pub fn history(&self) -> &[CheckpointEntry] {
        &self.history
    }

    /// Records a new checkpoint as the most recent one.
    pub fn record_checkpoint(&mut self, step: u64, file: impl Into<PathBuf>) {
        self.step = self.step.max(step);
        self.history.insert(
            0,
            CheckpointEntry {
                step,
                file: file.into(),
            },
        );
    }

    /// Writes the state atomically.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Reads a state file. A missing, unreadable or malformed file yields `None`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                warn!("ignoring unreadable training state {}: {err}", path.display());
                return Ok(None);
            }
            Err(err) => return Err(NmtError::io_at(err, path)),
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                warn!("ignoring corrupt training state {}: {err}", path.display());
                Ok(None)
            }
        }
    }
}

/// Handed to the trainer backend: records checkpoints and persists the state after each one.
#[derive(Debug)]
pub struct CheckpointLog {
    state: TrainingState,
    path: PathBuf,
}

impl CheckpointLog {
    /// Wraps `state`, persisting to `working_dir/state.json`.
    pub fn new(state: TrainingState, working_dir: &Path) -> Self {
        Self {
            state,
            path: working_dir.join(STATE_FILE),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Suggested path prefix for a checkpoint written at `step`.
    #[must_use]
    pub fn checkpoint_prefix(&self, step: u64) -> PathBuf {
        self.path.with_file_name(format!("checkpoint_{step}"))
    }

    /// Records a checkpoint and rewrites the state file.
    pub fn record(&mut self, step: u64, file: impl Into<PathBuf>) -> Result<()> {
        let file = file.into();
        debug!("checkpoint at step {step}: {}", file.display());
        self.state.record_checkpoint(step, file);
        self.state.save_to_file(&self.path)
    }

    /// Consumes the log, returning the final state.
    #[must_use]
    pub fn into_state(self) -> TrainingState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn latest_checkpoint_is_first_and_history_only_grows() {
        let mut state = TrainingState::new();
        assert!(state.is_empty());
        state.record_checkpoint(100, "ckpt_100");
        state.record_checkpoint(200, "ckpt_200");
        assert_eq!(state.latest().map(|c| c.step), Some(200));
        assert_eq!(state.history().len(), 2);
        assert_eq!(state.step, 200);
    }

    #[test]
    fn state_survives_save_and_load() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(STATE_FILE);
        let mut state = TrainingState::new();
        state.record_checkpoint(10, dir.path().join("checkpoint_10"));
        state.save_to_file(&path).expect("save");
        let loaded = TrainingState::load_from_file(&path).expect("load");
        assert_eq!(loaded, Some(state));
    }

    #[test]
    fn missing_or_corrupt_state_is_absent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(STATE_FILE);
        assert_eq!(TrainingState::load_from_file(&path).expect("missing"), None);
        fs::write(&path, r#"{"step": 3, "history": [{"step""#).expect("write");
        assert_eq!(TrainingState::load_from_file(&path).expect("corrupt"), None);
    }

    #[test]
    fn checkpoint_log_persists_every_record() {
        let dir = tempdir().expect("tempdir");
        let mut log = CheckpointLog::new(TrainingState::new(), dir.path());
        let prefix = log.checkpoint_prefix(5);
        assert_eq!(prefix, dir.path().join("checkpoint_5"));
        log.record(5, &prefix).expect("record");
        let on_disk = TrainingState::load_from_file(dir.path().join(STATE_FILE))
            .expect("load")
            .expect("present");
        assert_eq!(on_disk.latest().map(|c| c.file.clone()), Some(prefix));
    }
}
