use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the supervisor core.
#[derive(Error, Debug)]
pub enum GuardianError {
    /// Another supervisor instance holds the lock and is alive.
    #[error("guardian already running (pid: {pid}, started: {since})")]
    StartupBlocked { pid: u32, since: String },

    /// A managed process could not be spawned.
    #[error("failed to spawn '{id}': {source}")]
    Spawn {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("process '{0}' is not in the registry")]
    UnknownProcess(String),

    /// Lifecycle action requested on a process the supervisor does not own.
    #[error("process '{0}' is observed, not managed")]
    NotManaged(String),

    /// The process is still in the process table after SIGKILL.
    #[error("process '{id}' (pid {pid}) did not exit after SIGKILL")]
    StopTimeout { id: String, pid: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("lock file {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid match rule pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, GuardianError>;
