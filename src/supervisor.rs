//! Orchestration over the controller, health monitor and notifier.
//!
//! `run` is the whole life of a supervising instance: take the singleton
//! lock, announce startup, bring processes up, loop until a shutdown signal,
//! bring them down, announce shutdown, release the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{GuardianConfig, Settings};
use crate::error::Result;
use crate::metrics::METRICS;
use crate::models::{
    EventType, HealthClass, Lifecycle, NotificationEvent, ProcessConfig,
};
use crate::services::controller::{started_at, ControllerTiming, ProcessController};
use crate::services::health::HealthMonitor;
use crate::services::launcher::Launcher;
use crate::services::lock::SingletonLock;
use crate::services::notifier::{DispatchOutcome, Dispatcher};
use crate::services::process_table::{ProcessSource, Snapshot};
use crate::services::readiness::{self, ReadyOutcome};
use crate::state::{ControlRequest, StatusBoard, StatusRow};

const START_POLL: Duration = Duration::from_millis(200);
const GUARDIAN_ID: &str = "guardian";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 观察进程全部就绪后再启动托管进程
    Up,
    /// 只启动托管进程
    Start,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Up => "up",
            Mode::Start => "start",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Supervisor {
    settings: Settings,
    controller: ProcessController,
    monitor: HealthMonitor,
    notifier: Arc<Dispatcher>,
    board: StatusBoard,
    deliveries: Vec<JoinHandle<DispatchOutcome>>,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        processes: Vec<ProcessConfig>,
        source: Box<dyn ProcessSource>,
        launcher: Box<dyn Launcher>,
        notifier: Arc<Dispatcher>,
        board: StatusBoard,
    ) -> Self {
        let timing = ControllerTiming {
            grace_period: settings.grace_period,
            startup_timeout: settings.startup_timeout,
            ..ControllerTiming::default()
        };
        Self {
            controller: ProcessController::new(processes, source, launcher, timing),
            settings,
            monitor: HealthMonitor::new(),
            notifier,
            board,
            deliveries: Vec::new(),
        }
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    pub fn notify(&mut self, event: NotificationEvent) {
        self.deliveries.retain(|handle| !handle.is_finished());
        if let Some(handle) = self.notifier.dispatch(event) {
            self.deliveries.push(handle);
        }
    }

    fn flush_events(&mut self) {
        for event in self.controller.drain_events() {
            self.notify(event);
        }
    }

    fn publish(&self) {
        let rows = self.controller.status_rows();
        METRICS.observe(&rows);
        if let Ok(mut board) = self.board.lock() {
            board.rows = rows;
        }
    }

    fn tick(&mut self, now: Instant) {
        self.controller.refresh();
        self.controller.reconcile(now);
        self.flush_events();
        self.publish();
    }

    /// One supervision cycle: reconcile, probe health, react, publish.
    pub fn run_cycle(&mut self, now: Instant) {
        self.controller.refresh();
        self.controller.reconcile(now);

        for record in self.monitor.probe_all(&self.controller) {
            let previous = self
                .controller
                .state(&record.id)
                .and_then(|s| s.last_health);
            self.controller.set_health(&record.id, record.class);

            if record.liveness_failed {
                let reason = if record.issues.is_empty() {
                    "process disappeared".to_string()
                } else {
                    record.issues.join("; ")
                };
                self.controller.record_crash(&record.id, &reason);
                continue;
            }

            if record.issues.is_empty() || previous == Some(record.class) {
                continue;
            }
            let managed = self
                .controller
                .registry()
                .iter()
                .any(|c| c.id == record.id && c.is_managed());
            // 未曾发现过的观察进程仍在等待中，不算失败
            if !managed && !self.controller.has_been_discovered(&record.id) {
                continue;
            }

            log::warn!("Health check for '{}' is {}: {}", record.id, record.class, record.issues.join("; "));
            self.notify(NotificationEvent::new(
                EventType::HealthCheckFailed,
                &record.id,
                format!("{}: {}", record.class, record.issues.join("; ")),
            ));
        }

        self.flush_events();
        self.publish();
    }

    /// Wait for every observed process to be seen once, then start managed ones.
    ///
    /// Returns `false` when cancelled by shutdown before completion.
    pub async fn up(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let observed = self.controller.ids(false);
        for id in &observed {
            self.controller.watch(id)?;
        }

        loop {
            self.tick(Instant::now());
            let waiting: Vec<&String> = observed
                .iter()
                .filter(|id| !self.controller.has_been_discovered(id))
                .collect();
            if waiting.is_empty() {
                break;
            }
            log::info!("Waiting for external process(es): {:?}", waiting);

            tokio::select! {
                _ = tokio::time::sleep(self.settings.discovery_poll) => {}
                _ = shutdown.changed() => {
                    log::info!("Shutdown requested while waiting for external processes");
                    return Ok(false);
                }
            }
        }

        self.start_managed(shutdown).await
    }

    /// Start managed processes in declared order, awaiting each verification
    /// and readiness check before moving on.
    pub async fn start_managed(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        for id in self.controller.ids(true) {
            if !self.bring_up(&id, shutdown).await? {
                return Ok(false);
            }
        }
        self.publish();
        Ok(true)
    }

    /// Start one managed process and wait until it is verified and ready.
    ///
    /// Returns `false` when cancelled by shutdown.
    async fn bring_up(&mut self, id: &str, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let readiness = self
            .controller
            .registry()
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.readiness().cloned());
        let log_offset = readiness.as_ref().map_or(0, |r| readiness::baseline(&r.probe));

        self.controller.start(id, Instant::now())?;
        self.flush_events();

        loop {
            let settled = self.controller.state(id).map_or(true, |s| {
                !(s.lifecycle == Lifecycle::Starting && !s.restart_pending())
            });
            if settled {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(START_POLL) => {}
                _ = shutdown.changed() => return Ok(false),
            }
            self.tick(Instant::now());
        }

        match self.controller.state(id).map(|s| s.lifecycle) {
            Some(Lifecycle::Running) => {}
            Some(other) => {
                log::warn!("Process '{}' did not come up ({}), continuing", id, other);
                return Ok(true);
            }
            None => return Ok(true),
        }

        let Some(readiness) = readiness else {
            return Ok(true);
        };
        log::info!("Waiting for '{}' to become ready ({})", id, readiness.probe);
        match readiness::wait_ready(&readiness, log_offset, shutdown).await {
            ReadyOutcome::Ready => log::info!("Process '{}' is ready", id),
            ReadyOutcome::TimedOut => {
                let detail = format!(
                    "not ready within {}s ({})",
                    readiness.timeout.as_secs(),
                    readiness.probe
                );
                log::warn!("Process '{}' {}, continuing", id, detail);
                self.controller.set_health(id, HealthClass::Degraded);
                self.notify(NotificationEvent::new(EventType::HealthCheckFailed, id, detail));
            }
            ReadyOutcome::Cancelled => return Ok(false),
        }
        Ok(true)
    }

    /// Stop managed processes in reverse declared order.
    pub async fn stop_managed(&mut self) {
        for id in self.controller.ids(true).into_iter().rev() {
            if let Err(e) = self.controller.stop(&id).await {
                log::error!("Failed to stop '{}': {}", id, e);
            }
        }
        self.flush_events();
        self.publish();
    }

    /// `stop_managed`, then release observed processes from the watch loop.
    pub async fn down(&mut self) {
        self.stop_managed().await;
        for id in self.controller.ids(false) {
            if let Err(e) = self.controller.unwatch(&id) {
                log::warn!("Failed to unwatch '{}': {}", id, e);
            }
        }
        self.publish();
    }

    /// Stop then start one managed process. Resets its restart window.
    pub async fn restart(&mut self, id: &str, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.controller.stop(id).await?;
        self.bring_up(id, shutdown).await?;
        self.publish();
        Ok(())
    }

    /// Restart every managed process, keeping the declared start order.
    pub async fn restart_all(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.stop_managed().await;
        self.start_managed(shutdown).await?;
        Ok(())
    }

    async fn handle(&mut self, request: ControlRequest, shutdown: &mut watch::Receiver<bool>) {
        match request {
            ControlRequest::Restart { id, reply } => {
                log::info!("Restart of '{}' requested", id);
                let result = self.restart(&id, shutdown).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            ControlRequest::RestartAll { reply } => {
                log::info!("Restart of all managed processes requested");
                let result = self.restart_all(shutdown).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
        }
    }

    /// Control loop until shutdown, then the mode's teardown.
    pub async fn supervise(
        &mut self,
        mode: Mode,
        shutdown: &mut watch::Receiver<bool>,
        control: &mut mpsc::Receiver<ControlRequest>,
    ) {
        let mut interval = tokio::time::interval(self.settings.cycle_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        if !*shutdown.borrow() {
            loop {
                let request = tokio::select! {
                    _ = interval.tick() => {
                        self.run_cycle(Instant::now());
                        continue;
                    }
                    Some(request) = control.recv() => request,
                    _ = shutdown.changed() => break,
                };
                self.handle(request, shutdown).await;
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        self.teardown(mode).await;
    }

    pub async fn teardown(&mut self, mode: Mode) {
        log::info!("Shutting down ({} mode)", mode);
        match mode {
            Mode::Up => self.down().await,
            Mode::Start => self.stop_managed().await,
        }
    }

    /// Wait for outstanding notification deliveries.
    pub async fn finish(&mut self) {
        for handle in self.deliveries.drain(..) {
            if let Err(e) = handle.await {
                log::warn!("Notification task failed: {}", e);
            }
        }
    }
}

/// Full supervisor lifetime. Nothing is spawned if another instance holds the lock.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: GuardianConfig,
    mode: Mode,
    source: Box<dyn ProcessSource>,
    launcher: Box<dyn Launcher>,
    notifier: Arc<Dispatcher>,
    board: StatusBoard,
    mut shutdown: watch::Receiver<bool>,
    mut control: mpsc::Receiver<ControlRequest>,
) -> Result<()> {
    let lock = SingletonLock::acquire(&config.settings.lock_file)?;
    log::info!("Acquired lock {}", lock.path().display());

    let mut supervisor = Supervisor::new(
        config.settings,
        config.processes,
        source,
        launcher,
        notifier,
        board,
    );
    supervisor.notify(NotificationEvent::new(
        EventType::GuardianStartup,
        GUARDIAN_ID,
        format!("supervisor started in {} mode (pid {})", mode, std::process::id()),
    ));

    let started = match mode {
        Mode::Up => supervisor.up(&mut shutdown).await,
        Mode::Start => supervisor.start_managed(&mut shutdown).await,
    };

    let outcome = match started {
        Ok(_) => {
            supervisor.supervise(mode, &mut shutdown, &mut control).await;
            Ok(())
        }
        Err(e) => {
            log::error!("Startup failed: {}", e);
            supervisor.teardown(mode).await;
            Err(e)
        }
    };

    supervisor.notify(NotificationEvent::new(
        EventType::GuardianShutdown,
        GUARDIAN_ID,
        format!("supervisor stopped (pid {})", std::process::id()),
    ));
    supervisor.finish().await;

    lock.release();
    outcome
}

/// One-shot discovery for `status` when no supervisor is running.
pub fn inspect(processes: &[ProcessConfig], snapshot: &Snapshot) -> Vec<StatusRow> {
    processes
        .iter()
        .map(|cfg| {
            let pid = snapshot.find_main(&cfg.match_rule, None);
            let now = chrono::Utc::now();
            StatusRow {
                id: cfg.id.clone(),
                kind: cfg.kind_label().to_string(),
                lifecycle: if pid.is_some() { Lifecycle::Running } else { Lifecycle::Unknown },
                pid,
                health: pid.map(|_| HealthClass::Healthy),
                restart_count: 0,
                last_exit_reason: None,
                last_seen_at: pid.map(|_| now),
                uptime_secs: pid
                    .filter(|&pid| snapshot.get(pid).map_or(false, |p| p.start_time.is_some()))
                    .map(|pid| {
                        let since = started_at(snapshot, pid);
                        now.signed_duration_since(since).num_seconds().max(0) as u64
                    }),
            }
        })
        .collect()
}

/// Managed processes still running without a supervisor, by id.
///
/// Observed processes are never included.
pub fn orphaned_pids(processes: &[ProcessConfig], snapshot: &Snapshot) -> HashMap<String, Vec<u32>> {
    processes
        .iter()
        .filter(|cfg| cfg.is_managed())
        .filter_map(|cfg| {
            let pids = snapshot.matching_pids(&cfg.match_rule);
            (!pids.is_empty()).then(|| (cfg.id.clone(), pids))
        })
        .collect()
}
