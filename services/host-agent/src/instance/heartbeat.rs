//! PID heartbeat file.
//!
//! The heartbeat is the only state shared between processes. It is advisory:
//! nothing locks it, so two agents started for the same instance both write it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::is_process_alive;
use super::InstanceError;
use crate::fsutil::write_file_mode;

/// How often a running agent rewrites its heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Contents of the PID file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidHeartbeat {
    pub name: String,
    #[serde(with = "pid_string")]
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
}

impl PidHeartbeat {
    /// Heartbeat for the current process.
    pub fn current(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pid: std::process::id(),
            timestamp: Utc::now(),
        }
    }
}

// The pid is stored as a decimal string; bare numbers are accepted on read.
mod pid_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pid: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&pid.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u32),
        }
        match Raw::deserialize(d)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(t) => t.trim().parse().map_err(de::Error::custom),
        }
    }
}

/// Write `heartbeat` to `path`, replacing any previous file atomically.
pub fn write_heartbeat(path: &Path, heartbeat: &PidHeartbeat) -> Result<(), InstanceError> {
    let body = serde_json::to_vec_pretty(heartbeat).map_err(|e| InstanceError::CorruptPid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let tmp = path.with_extension("pid.tmp");
    write_file_mode(&tmp, &body, 0o644).map_err(|e| InstanceError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| InstanceError::io(path, e))
}

/// Load the heartbeat at `path`.
///
/// Returns `None` when the file is absent or the recorded process is gone; in
/// the latter case the stale file is removed.
pub fn load_heartbeat(path: &Path) -> Result<Option<PidHeartbeat>, InstanceError> {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(InstanceError::io(path, e)),
    };

    let heartbeat: PidHeartbeat =
        serde_json::from_slice(&body).map_err(|e| InstanceError::CorruptPid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if is_process_alive(heartbeat.pid) {
        return Ok(Some(heartbeat));
    }

    debug!(path = %path.display(), pid = heartbeat.pid, "Removing stale pid file");
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove stale pid file");
        }
    }
    Ok(None)
}

/// Periodic heartbeat writer for one instance.
#[derive(Debug, Clone)]
pub struct HeartbeatWriter {
    name: String,
    path: PathBuf,
}

impl HeartbeatWriter {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Write one heartbeat for the current process.
    pub fn beat(&self) -> Result<(), InstanceError> {
        write_heartbeat(&self.path, &PidHeartbeat::current(&self.name))
    }

    /// Rewrite the heartbeat every `interval` until `cancel` fires.
    ///
    /// The first beat is written immediately.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        info!(
            instance = %self.name,
            interval_secs = interval.as_secs(),
            "Starting heartbeat"
        );

        let mut interval_timer = tokio::time::interval(interval);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    match self.beat() {
                        Ok(()) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(error = %e, consecutive_failures, "Heartbeat write failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!(instance = %self.name, "Heartbeat shutting down");
                    break;
                }
            }
        }
    }
}
