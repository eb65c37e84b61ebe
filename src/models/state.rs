use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// 进程生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    /// 重启次数耗尽，需要手动 start
    GaveUp,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Unknown => "unknown",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Crashed => "crashed",
            Lifecycle::GaveUp => "gave_up",
        };
        write!(f, "{}", s)
    }
}

/// 健康分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthClass {
    Healthy,
    Degraded,
    Failed,
}

impl HealthClass {
    pub fn as_gauge(&self) -> f64 {
        match self {
            HealthClass::Healthy => 0.0,
            HealthClass::Degraded => 1.0,
            HealthClass::Failed => 2.0,
        }
    }
}

impl std::fmt::Display for HealthClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthClass::Healthy => "healthy",
            HealthClass::Degraded => "degraded",
            HealthClass::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// 进程运行状态，只由控制器写入
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub lifecycle: Lifecycle,
    /// 仅在确认运行时存在
    pub pid: Option<u32>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// 当前 PID 的启动时间，用于计算 uptime
    pub running_since: Option<DateTime<Utc>>,
    pub consecutive_restart_count: u32,
    pub last_exit_reason: Option<String>,
    pub last_health: Option<HealthClass>,

    /// 已 spawn 但尚未通过校验的 PID
    pub(crate) candidate_pid: Option<u32>,
    pub(crate) spawned_at: Option<Instant>,
    /// 启动时的进程表快照代数，只有之后的快照才能用于校验
    pub(crate) spawn_generation: u64,
    /// 计划中的重启时间（退避期内）
    pub(crate) pending_spawn_at: Option<Instant>,
    /// 滑动窗口内的重启时间戳
    pub(crate) restart_attempts: VecDeque<Instant>,
    /// observed 进程是否仍在发现循环中
    pub(crate) watching: bool,
}

impl ProcessState {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Unknown,
            pid: None,
            last_seen_at: None,
            running_since: None,
            consecutive_restart_count: 0,
            last_exit_reason: None,
            last_health: None,
            candidate_pid: None,
            spawned_at: None,
            spawn_generation: 0,
            pending_spawn_at: None,
            restart_attempts: VecDeque::new(),
            watching: false,
        }
    }

    /// PID the supervisor currently tracks, verified or not.
    pub fn tracked_pid(&self) -> Option<u32> {
        self.pid.or(self.candidate_pid)
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    pub fn restart_pending(&self) -> bool {
        self.pending_spawn_at.is_some()
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        self.running_since
            .map(|since| now.signed_duration_since(since).num_seconds().max(0) as u64)
    }

    pub(crate) fn clear_runtime(&mut self) {
        self.pid = None;
        self.running_since = None;
        self.candidate_pid = None;
        self.spawned_at = None;
        self.pending_spawn_at = None;
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}
