//! Lifecycle state machine for every registry entry.
//!
//! Managed processes go `Unknown → Starting → Running`, then either
//! `Stopping → Stopped` on request or `Crashed → Starting` (bounded by the
//! restart policy, ending in `GaveUp`). Observed processes only ever move
//! between `Unknown` and `Running` as discovery finds or loses them.
//!
//! The controller is the only writer of [`ProcessState`]; everything else gets
//! a shared reference to the [`ProcessTable`].

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{GuardianError, Result};
use crate::metrics::METRICS;
use crate::models::{
    EventType, HealthClass, Lifecycle, NotificationEvent, ProcessConfig, ProcessKind, ProcessState,
};
use crate::policy::RestartDecision;
use crate::services::launcher::{Launcher, StopSignal};
use crate::services::process_table::{ProcessSource, Snapshot};
use crate::state::StatusRow;

#[derive(Debug, Clone, Copy)]
pub struct ControllerTiming {
    /// SIGTERM 到 SIGKILL 之间的等待
    pub grace_period: Duration,
    /// 新进程必须在此时间内出现在进程表并满足匹配规则
    pub startup_timeout: Duration,
    pub stop_poll: Duration,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(10),
            stop_poll: Duration::from_millis(100),
        }
    }
}

/// Exactly one `ProcessState` per registry id.
pub struct ProcessTable {
    states: HashMap<String, ProcessState>,
}

impl ProcessTable {
    fn new(registry: &[ProcessConfig]) -> Self {
        Self {
            states: registry
                .iter()
                .map(|c| (c.id.clone(), ProcessState::new()))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ProcessState> {
        self.states.get(id)
    }
}

pub struct ProcessController {
    registry: Vec<ProcessConfig>,
    table: ProcessTable,
    source: Box<dyn ProcessSource>,
    launcher: Box<dyn Launcher>,
    timing: ControllerTiming,
    snapshot: Snapshot,
    generation: u64,
    events: Vec<NotificationEvent>,
}

impl ProcessController {
    pub fn new(
        registry: Vec<ProcessConfig>,
        source: Box<dyn ProcessSource>,
        launcher: Box<dyn Launcher>,
        timing: ControllerTiming,
    ) -> Self {
        let table = ProcessTable::new(&registry);
        Self {
            registry,
            table,
            source,
            launcher,
            timing,
            snapshot: Snapshot::default(),
            generation: 0,
            events: Vec::new(),
        }
    }

    pub fn registry(&self) -> &[ProcessConfig] {
        &self.registry
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn state(&self, id: &str) -> Option<&ProcessState> {
        self.table.get(id)
    }

    /// Ids of managed (`true`) or observed (`false`) processes in declared order.
    pub fn ids(&self, managed: bool) -> Vec<String> {
        self.registry
            .iter()
            .filter(|c| c.is_managed() == managed)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<NotificationEvent> {
        std::mem::take(&mut self.events)
    }

    /// Rescan the OS process table.
    pub fn refresh(&mut self) {
        self.snapshot = self.source.snapshot();
        self.generation += 1;
    }

    fn lookup(&self, id: &str) -> Result<&ProcessConfig> {
        self.registry
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| GuardianError::UnknownProcess(id.to_string()))
    }

    /// Explicit start of a managed process. Clears the restart window, so this
    /// is also how a process leaves `GaveUp`.
    pub fn start(&mut self, id: &str, now: Instant) -> Result<()> {
        if !self.lookup(id)?.is_managed() {
            return Err(GuardianError::NotManaged(id.to_string()));
        }

        let Self {
            registry,
            table,
            launcher,
            events,
            generation,
            ..
        } = self;
        let cfg = registry.iter().find(|c| c.id == id).ok_or_else(|| GuardianError::UnknownProcess(id.to_string()))?;
        let state = table
            .states
            .get_mut(id)
            .ok_or_else(|| GuardianError::UnknownProcess(id.to_string()))?;

        match state.lifecycle {
            Lifecycle::Running | Lifecycle::Stopping => {
                log::info!("Process '{}' is already {}", id, state.lifecycle);
                return Ok(());
            }
            Lifecycle::Starting if state.candidate_pid.is_some() => {
                log::info!("Process '{}' is already starting", id);
                return Ok(());
            }
            _ => {}
        }

        state.restart_attempts.clear();
        state.consecutive_restart_count = 0;
        spawn_into(launcher.as_mut(), cfg, state, events, *generation, now);
        Ok(())
    }

    /// Put an observed process into the discovery loop.
    pub fn watch(&mut self, id: &str) -> Result<()> {
        let managed = self.lookup(id)?.is_managed();
        if let Some(state) = self.table.states.get_mut(id) {
            if !managed {
                state.watching = true;
            }
        }
        Ok(())
    }

    /// Stop waiting for an observed process. No signal is sent to it.
    pub fn unwatch(&mut self, id: &str) -> Result<()> {
        let managed = self.lookup(id)?.is_managed();
        if let Some(state) = self.table.states.get_mut(id) {
            if !managed {
                state.watching = false;
                state.lifecycle = Lifecycle::Unknown;
                state.pid = None;
                state.running_since = None;
                log::info!("No longer watching external process '{}'", id);
            }
        }
        Ok(())
    }

    pub fn has_been_discovered(&self, id: &str) -> bool {
        self.table
            .get(id)
            .map_or(false, |s| s.last_seen_at.is_some())
    }

    pub fn set_health(&mut self, id: &str, health: HealthClass) {
        if let Some(state) = self.table.states.get_mut(id) {
            state.last_health = Some(health);
        }
    }

    /// Advance every state machine against the current snapshot.
    ///
    /// Order per managed entry: a crash recorded last cycle is turned into a
    /// restart decision, a due restart is spawned, then a pending spawn is
    /// verified against the snapshot.
    pub fn reconcile(&mut self, now: Instant) {
        let Self {
            registry,
            table,
            launcher,
            timing,
            snapshot,
            generation,
            events,
            ..
        } = self;

        for cfg in registry.iter() {
            let Some(state) = table.states.get_mut(&cfg.id) else {
                continue;
            };

            if matches!(cfg.kind, ProcessKind::Observed) {
                if state.watching {
                    discover_into(cfg, state, snapshot);
                }
                continue;
            }

            if state.lifecycle == Lifecycle::Crashed {
                match cfg.restart_policy.next(&mut state.restart_attempts, now) {
                    RestartDecision::Restart { delay, attempt } => {
                        state.lifecycle = Lifecycle::Starting;
                        state.pending_spawn_at = Some(now + delay);
                        state.consecutive_restart_count = attempt;
                        METRICS.process_restarts.with_label_values(&[cfg.id.as_str()]).inc();
                        log::info!(
                            "Restarting '{}' in {:?} (attempt {}/{})",
                            cfg.id, delay, attempt, cfg.restart_policy.max_attempts
                        );
                    }
                    RestartDecision::GiveUp { attempts } => {
                        state.lifecycle = Lifecycle::GaveUp;
                        state.consecutive_restart_count = attempts;
                        log::error!(
                            "Process '{}' crashed {} times within {}s, giving up until a manual start",
                            cfg.id, attempts, cfg.restart_policy.window_secs
                        );
                        events.push(NotificationEvent::new(
                            EventType::ProcessCrash,
                            &cfg.id,
                            format!("gave up after {} restart attempts; manual start required", attempts),
                        ));
                    }
                }
            }

            if state.lifecycle == Lifecycle::Starting {
                if let Some(due) = state.pending_spawn_at {
                    if now >= due {
                        spawn_into(launcher.as_mut(), cfg, state, events, *generation, now);
                    }
                }
            }

            match state.lifecycle {
                Lifecycle::Starting => {
                    verify_candidate(launcher.as_mut(), timing, cfg, state, snapshot, *generation, events, now);
                }
                Lifecycle::Running => {
                    if state.pid.map_or(false, |pid| snapshot.contains(pid)) {
                        state.last_seen_at = Some(Utc::now());
                    }
                }
                Lifecycle::Stopping => {
                    if let Some(pid) = state.tracked_pid() {
                        let exit = launcher.reap(pid);
                        if exit.is_some() || !snapshot.contains(pid) {
                            state.lifecycle = Lifecycle::Stopped;
                            state.clear_runtime();
                            state.last_exit_reason = exit.or(state.last_exit_reason.take());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Crash path for a running managed process whose liveness check failed.
    pub fn record_crash(&mut self, id: &str, reason: &str) {
        let Self {
            registry,
            table,
            launcher,
            events,
            ..
        } = self;
        let Some(cfg) = registry.iter().find(|c| c.id == id) else {
            return;
        };
        if !cfg.is_managed() {
            return;
        }
        let Some(state) = table.states.get_mut(id) else {
            return;
        };
        if state.lifecycle != Lifecycle::Running {
            return;
        }

        let reason = match state.pid.and_then(|pid| launcher.reap(pid)) {
            Some(exit) => format!("{} ({})", reason, exit),
            None => reason.to_string(),
        };
        mark_crashed(state, events, id, reason);
    }

    /// Graceful stop of a managed process: SIGTERM, grace period, SIGKILL.
    ///
    /// A pending restart is cancelled without spawning. The state only becomes
    /// `Stopped` once the PID is gone from the process table.
    pub async fn stop(&mut self, id: &str) -> Result<()> {
        if !self.lookup(id)?.is_managed() {
            return Err(GuardianError::NotManaged(id.to_string()));
        }

        let pid = {
            let state = self
                .table
                .states
                .get_mut(id)
                .ok_or_else(|| GuardianError::UnknownProcess(id.to_string()))?;

            if state.pending_spawn_at.take().is_some() {
                log::info!("Cancelled pending restart of '{}'", id);
            }

            match state.tracked_pid() {
                Some(pid) => {
                    state.lifecycle = Lifecycle::Stopping;
                    pid
                }
                None => {
                    if state.lifecycle != Lifecycle::Unknown {
                        state.lifecycle = Lifecycle::Stopped;
                    }
                    state.clear_runtime();
                    log::info!("Process '{}' is not running", id);
                    return Ok(());
                }
            }
        };

        let grace = self.timing.grace_period;
        log::info!("Stopping process '{}' (PID: {})", id, pid);
        if let Err(e) = self.launcher.signal(pid, StopSignal::Terminate) {
            log::warn!("SIGTERM to '{}' failed: {}", id, e);
        }

        let exit = match self.wait_gone(pid, grace).await {
            Some(exit) => exit,
            None => {
                log::warn!(
                    "Process '{}' did not stop within {}s grace period, force killing",
                    id,
                    grace.as_secs()
                );
                self.launcher.signal(pid, StopSignal::Kill)?;
                match self.wait_gone(pid, grace).await {
                    Some(exit) => exit,
                    None => {
                        return Err(GuardianError::StopTimeout {
                            id: id.to_string(),
                            pid,
                        })
                    }
                }
            }
        };

        if let Some(state) = self.table.states.get_mut(id) {
            state.lifecycle = Lifecycle::Stopped;
            state.clear_runtime();
            log::info!("Process '{}' stopped ({})", id, exit);
            state.last_exit_reason = Some(exit);
        }
        Ok(())
    }

    async fn wait_gone(&mut self, pid: u32, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.launcher.reap(pid) {
                return Some(exit);
            }
            if !self.source.is_alive(pid) {
                return Some("stopped".to_string());
            }
            if Instant::now() >= deadline {
                // kill(0) 对僵尸进程也成功，最后用完整快照确认
                return (!self.source.snapshot().contains(pid)).then(|| "stopped".to_string());
            }
            tokio::time::sleep(self.timing.stop_poll).await;
        }
    }

    pub fn status_rows(&self) -> Vec<StatusRow> {
        let now = Utc::now();
        self.registry
            .iter()
            .filter_map(|cfg| {
                self.table.get(&cfg.id).map(|state| StatusRow {
                    id: cfg.id.clone(),
                    kind: cfg.kind_label().to_string(),
                    lifecycle: state.lifecycle,
                    pid: state.pid,
                    health: state.last_health,
                    restart_count: state.consecutive_restart_count,
                    last_exit_reason: state.last_exit_reason.clone(),
                    last_seen_at: state.last_seen_at,
                    uptime_secs: state.uptime_secs(now),
                })
            })
            .collect()
    }
}

fn mark_crashed(state: &mut ProcessState, events: &mut Vec<NotificationEvent>, id: &str, reason: String) {
    log::warn!("Process '{}' crashed: {}", id, reason);
    state.lifecycle = Lifecycle::Crashed;
    state.clear_runtime();
    events.push(NotificationEvent::new(
        EventType::ProcessCrash,
        id,
        format!("process crashed: {}", reason),
    ));
    state.last_exit_reason = Some(reason);
}

/// Spawn a managed process. Nothing but the candidate PID is recorded until
/// verification passes; a spawn error is a crash.
fn spawn_into(
    launcher: &mut dyn Launcher,
    cfg: &ProcessConfig,
    state: &mut ProcessState,
    events: &mut Vec<NotificationEvent>,
    generation: u64,
    now: Instant,
) {
    let ProcessKind::Managed {
        start_command,
        env_overrides,
        working_dir,
        log_file,
        ..
    } = &cfg.kind
    else {
        return;
    };

    state.lifecycle = Lifecycle::Starting;
    state.pending_spawn_at = None;

    match launcher.spawn(
        &cfg.id,
        start_command,
        env_overrides,
        working_dir.as_deref(),
        log_file.as_deref(),
    ) {
        Ok(pid) => {
            log::info!("Process '{}' spawned (PID: {}), awaiting verification", cfg.id, pid);
            state.candidate_pid = Some(pid);
            state.spawned_at = Some(now);
            state.spawn_generation = generation;
        }
        Err(e) => mark_crashed(state, events, &cfg.id, e.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn verify_candidate(
    launcher: &mut dyn Launcher,
    timing: &ControllerTiming,
    cfg: &ProcessConfig,
    state: &mut ProcessState,
    snapshot: &Snapshot,
    generation: u64,
    events: &mut Vec<NotificationEvent>,
    now: Instant,
) {
    let Some(pid) = state.candidate_pid else {
        return;
    };
    // 快照早于 spawn，无法判断
    if generation <= state.spawn_generation {
        return;
    }

    if let Some(exit) = launcher.reap(pid) {
        mark_crashed(state, events, &cfg.id, format!("exited during startup ({})", exit));
    } else if snapshot.verify(pid, &cfg.match_rule) {
        state.lifecycle = Lifecycle::Running;
        state.pid = Some(pid);
        state.candidate_pid = None;
        state.last_seen_at = Some(Utc::now());
        state.running_since = Some(started_at(snapshot, pid));
        log::info!("Process '{}' is running (PID: {})", cfg.id, pid);
    } else if !snapshot.contains(pid) {
        mark_crashed(state, events, &cfg.id, "exited during startup".to_string());
    } else if state
        .spawned_at
        .map_or(false, |at| now.saturating_duration_since(at) >= timing.startup_timeout)
    {
        if let Err(e) = launcher.signal(pid, StopSignal::Kill) {
            log::warn!("Failed to kill unverified '{}' (PID {}): {}", cfg.id, pid, e);
        }
        mark_crashed(
            state,
            events,
            &cfg.id,
            format!("PID {} did not match {} within {:?}", pid, cfg.match_rule, timing.startup_timeout),
        );
    }
}

/// Discovery for observed processes. Keeps the tracked PID while it still matches.
fn discover_into(cfg: &ProcessConfig, state: &mut ProcessState, snapshot: &Snapshot) {
    match snapshot.find_main(&cfg.match_rule, state.pid) {
        Some(pid) => {
            if state.pid != Some(pid) {
                log::info!("Discovered external process '{}' (PID: {})", cfg.id, pid);
                state.running_since = Some(started_at(snapshot, pid));
            }
            state.pid = Some(pid);
            state.lifecycle = Lifecycle::Running;
            state.last_seen_at = Some(Utc::now());
        }
        None => {
            if state.lifecycle == Lifecycle::Running {
                log::warn!("External process '{}' ({}) not found running", cfg.id, cfg.match_rule);
            }
            state.pid = None;
            state.running_since = None;
            state.lifecycle = Lifecycle::Unknown;
        }
    }
}

/// Start time reported by the OS, or now when the table does not carry one.
pub fn started_at(snapshot: &Snapshot, pid: u32) -> DateTime<Utc> {
    snapshot
        .get(pid)
        .and_then(|p| p.start_time)
        .and_then(|secs| Utc.timestamp_opt(i64::try_from(secs).ok()?, 0).single())
        .unwrap_or_else(Utc::now)
}
