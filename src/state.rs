use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::models::{HealthClass, Lifecycle};

/// `status` 输出的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRow {
    pub id: String,
    pub kind: String,
    pub lifecycle: Lifecycle,
    pub pid: Option<u32>,
    pub health: Option<HealthClass>,
    pub restart_count: u32,
    pub last_exit_reason: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub processes: Vec<StatusRow>,
}

/// Requests from the HTTP surface to the control loop.
#[derive(Debug)]
pub enum ControlRequest {
    Restart {
        id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Every managed process: stop in reverse order, start in declared order
    RestartAll {
        reply: oneshot::Sender<Result<(), String>>,
    },
}

pub struct BoardInner {
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub rows: Vec<StatusRow>,
    pub control: Option<mpsc::Sender<ControlRequest>>,
}

/// Snapshot published by the control loop once per cycle.
///
/// HTTP handlers only ever read this; the live state table stays with the loop.
pub type StatusBoard = Arc<Mutex<BoardInner>>;

impl BoardInner {
    pub fn response(&self) -> StatusResponse {
        StatusResponse {
            mode: self.mode.clone(),
            started_at: self.started_at,
            processes: self.rows.clone(),
        }
    }
}

pub fn new_board(mode: &str) -> StatusBoard {
    Arc::new(Mutex::new(BoardInner {
        mode: mode.to_string(),
        started_at: Utc::now(),
        rows: Vec::new(),
        control: None,
    }))
}
