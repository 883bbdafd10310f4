//! Cached browser sessions and the external refresh helper
//!
//! Each worker may have a saved browser storage state at
//! `<session_dir>/auth_<id>.json`, written by an operator-driven login. A
//! worker without one cannot be refreshed automatically and is reported as
//! needing login.
//!
//! Refreshing runs a helper program (typically a headless-browser script)
//! with the session file path as its last argument. The helper prints the new
//! refresh credential on stdout and exits 0. The child is killed if the
//! returned future is dropped, so a caller-side timeout abandons it cleanly.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};
use upstream::{BoxFuture, SessionRefresher, SessionStatus};

use crate::constants::SESSION_FILE_PREFIX;
use crate::error::{Error, Result};

/// Directory of cached browser sessions, one file per worker.
#[derive(Debug, Clone)]
pub struct SessionDirectory {
    dir: PathBuf,
}

impl SessionDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the directory if it does not exist.
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Io(format!("creating session dir {}: {e}", self.dir.display())))
    }

    pub fn session_path(&self, worker_id: u64) -> PathBuf {
        self.dir
            .join(format!("{SESSION_FILE_PREFIX}{worker_id}.json"))
    }

    pub fn has_session(&self, worker_id: u64) -> bool {
        self.session_path(worker_id).is_file()
    }

    pub fn status(&self, worker_id: u64) -> SessionStatus {
        let path = self.session_path(worker_id);
        let last_modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        let has_session = path.is_file();
        SessionStatus {
            has_session,
            needs_login: !has_session,
            last_modified,
        }
    }

    /// Remove a worker's session file. Missing files are not an error.
    pub async fn delete(&self, worker_id: u64) -> Result<()> {
        let path = self.session_path(worker_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(worker_id, "deleted browser session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("deleting {}: {e}", path.display()))),
        }
    }
}

/// Session refresher backed by an external helper program.
#[derive(Debug, Clone)]
pub struct CommandSessionRefresher {
    sessions: SessionDirectory,
    program: String,
    args: Vec<String>,
}

impl CommandSessionRefresher {
    pub fn new(sessions: SessionDirectory, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            sessions,
            program: program.into(),
            args,
        }
    }

    /// Run the helper for one worker and return the credential it printed.
    pub async fn run_helper(&self, worker_id: u64) -> Result<String> {
        let session_path = self.sessions.session_path(worker_id);
        if !session_path.is_file() {
            return Err(Error::NoSession(worker_id));
        }

        debug!(worker_id, program = %self.program, "starting session helper");
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&session_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Helper(format!("spawning {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(worker_id, status = %output.status, "session helper failed");
            return Err(Error::Helper(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let credential = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if credential.is_empty() {
            return Err(Error::Helper(format!(
                "{} produced no credential",
                self.program
            )));
        }
        Ok(credential)
    }
}

impl SessionRefresher for CommandSessionRefresher {
    fn has_cached_session(&self, worker_id: u64) -> bool {
        self.sessions.has_session(worker_id)
    }

    fn refresh_via_session(&self, worker_id: u64) -> BoxFuture<'_, upstream::Result<String>> {
        Box::pin(async move { self.run_helper(worker_id).await.map_err(Into::into) })
    }

    fn session_status(&self, worker_id: u64) -> SessionStatus {
        self.sessions.status(worker_id)
    }

    fn discard_session(&self, worker_id: u64) -> BoxFuture<'_, upstream::Result<()>> {
        Box::pin(async move { self.sessions.delete(worker_id).await.map_err(Into::into) })
    }
}
