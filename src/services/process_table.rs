use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid as NixPid;
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

use crate::models::{MatchRule, ProcessInfo};

/// 进程表来源（真实系统或测试桩）
pub trait ProcessSource: Send {
    fn snapshot(&mut self) -> Snapshot;

    /// Cheap existence check for a single PID, without a full scan.
    fn is_alive(&mut self, pid: u32) -> bool {
        self.snapshot().contains(pid)
    }
}

/// One scan of the OS process table.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    processes: Vec<ProcessInfo>,
}

impl Snapshot {
    pub fn new(mut processes: Vec<ProcessInfo>) -> Self {
        processes.sort_by_key(|p| p.pid);
        Self { processes }
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessInfo> {
        self.processes
            .binary_search_by_key(&pid, |p| p.pid)
            .ok()
            .map(|idx| &self.processes[idx])
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.get(pid).is_some()
    }

    /// PID 存在且仍满足匹配规则（防止 PID 被无关进程复用）
    pub fn verify(&self, pid: u32, rule: &MatchRule) -> bool {
        self.get(pid).map_or(false, |p| rule.matches(p))
    }

    pub fn matching<'a>(&'a self, rule: &'a MatchRule) -> impl Iterator<Item = &'a ProcessInfo> + 'a {
        self.processes.iter().filter(move |p| rule.matches(p))
    }

    pub fn matching_pids(&self, rule: &MatchRule) -> Vec<u32> {
        self.matching(rule).map(|p| p.pid).collect()
    }

    /// 获取匹配进程的主 PID
    ///
    /// 策略优先级：
    /// 0. 当前跟踪的 PID 仍然匹配则保持不变
    /// 1. PPID = 1 的进程（由 init/launchd/systemd 直接启动）
    /// 2. 父进程不在匹配列表中的进程
    /// 3. 最小 PID
    pub fn find_main(&self, rule: &MatchRule, current: Option<u32>) -> Option<u32> {
        let matching: Vec<&ProcessInfo> = self.matching(rule).collect();

        if matching.is_empty() {
            return None;
        }

        if let Some(pid) = current {
            if matching.iter().any(|p| p.pid == pid) {
                return Some(pid);
            }
        }

        if matching.len() == 1 {
            return Some(matching[0].pid);
        }

        if let Some(p) = matching.iter().find(|p| p.parent == Some(1)) {
            log::debug!("Found main process (PPID=1): PID {}", p.pid);
            return Some(p.pid);
        }

        let pids: Vec<u32> = matching.iter().map(|p| p.pid).collect();
        for p in &matching {
            if let Some(parent) = p.parent {
                if !pids.contains(&parent) {
                    log::debug!("Found main process (parent not in group): PID {} (PPID={})", p.pid, parent);
                    return Some(p.pid);
                }
            }
        }

        let min_pid = pids.iter().copied().min();
        log::debug!("Found main process (min PID fallback): {:?} from {} matches", min_pid, pids.len());
        min_pid
    }
}

/// sysinfo 实现，排除僵尸进程和 guardian 自身
pub struct SysinfoSource {
    system: System,
    own_pid: u32,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            own_pid: std::process::id(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoSource {
    fn snapshot(&mut self) -> Snapshot {
        // 命令行默认不加载；exec 后同一 PID 的命令行会变化，每次都刷新
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .with_exe(UpdateKind::Always),
        );

        let processes = self
            .system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != self.own_pid && !matches!(process.status(), ProcessStatus::Zombie)
            })
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent: process.parent().map(|p| p.as_u32()),
                name: process.name().to_string_lossy().into_owned(),
                exe: process.exe().map(|p| p.to_path_buf()),
                cmd: process
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy().into_owned())
                    .collect(),
                start_time: Some(process.start_time()).filter(|t| *t > 0),
            })
            .collect();

        Snapshot::new(processes)
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

/// Check whether a PID exists with `kill(pid, 0)`.
///
/// `EPERM` means the process exists but belongs to someone else.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(NixPid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
