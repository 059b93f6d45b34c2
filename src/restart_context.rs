//! Detection of a just-completed restart.
//!
//! A session that suspends for a forced restart writes its checkpoint into a
//! per-context directory under the scope path. When the replacement process
//! starts, the presence of that directory is the only signal that it is
//! resuming rather than starting fresh. The directory is a hand-off: the new
//! process consumes it and then deletes it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::session_state;

const CONTEXTS_DIR: &str = "ctx";
const CONTEXT_PREFIX: &str = "ctx-";

#[derive(Default)]
pub struct RestartContext {
    session_state_path: Option<PathBuf>,
}

impl RestartContext {
    pub fn new() -> RestartContext {
        RestartContext::default()
    }

    /// Look for a restart checkpoint scoped to `context_id`. Absence is the
    /// normal fresh-start case, not an error.
    pub fn initialize(&mut self, scope_path: &Path, context_id: &str) {
        let path = context_state_path(scope_path, context_id);
        if path.is_dir() {
            self.session_state_path = Some(path);
        }
    }

    pub fn has_session_state(&self) -> bool {
        self.session_state_path.is_some()
    }

    pub fn session_state_path(&self) -> Option<&Path> {
        self.session_state_path.as_deref()
    }

    /// Whether the startup profile script should be re-run on restore.
    /// Delegates to the flag persisted with the checkpoint; without a
    /// checkpoint there is nothing to replay.
    pub fn r_profile_on_restore(&self) -> bool {
        match &self.session_state_path {
            Some(path) => session_state::saved_r_profile_on_restore(path),
            None => false,
        }
    }

    /// Delete the consumed checkpoint. Idempotent: a missing directory is
    /// success.
    pub fn remove_session_state(&mut self) -> io::Result<()> {
        let Some(path) = self.session_state_path.take() else {
            return Ok(());
        };
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Ensure and return the checkpoint directory for `context_id`, used when
    /// writing a new restart checkpoint before a forced restart.
    pub fn create_session_state_path(
        scope_path: &Path,
        context_id: &str,
    ) -> io::Result<PathBuf> {
        let path = context_state_path(scope_path, context_id);
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}

fn context_state_path(scope_path: &Path, context_id: &str) -> PathBuf {
    scope_path
        .join(CONTEXTS_DIR)
        .join(format!("{CONTEXT_PREFIX}{context_id}"))
}
