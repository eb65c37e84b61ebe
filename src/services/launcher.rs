use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::error::{GuardianError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// Spawns and signals managed processes.
pub trait Launcher: Send {
    fn spawn(
        &mut self,
        id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
        working_dir: Option<&Path>,
        log_file: Option<&Path>,
    ) -> Result<u32>;

    /// A PID that already exited is not an error.
    fn signal(&mut self, pid: u32, signal: StopSignal) -> Result<()>;

    /// Collect the exit status of a child that has exited, without blocking.
    fn reap(&mut self, pid: u32) -> Option<String>;
}

pub fn describe_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => format!("killed by signal {}", sig),
        _ => "exited".to_string(),
    }
}

/// 真实实现：std::process 启动子进程，nix 发送信号
#[derive(Default)]
pub struct OsLauncher {
    children: HashMap<u32, Child>,
}

impl OsLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Launcher for OsLauncher {
    fn spawn(
        &mut self,
        id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
        working_dir: Option<&Path>,
        log_file: Option<&Path>,
    ) -> Result<u32> {
        let spawn_err = |source: std::io::Error| GuardianError::Spawn {
            id: id.to_string(),
            source,
        };
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GuardianError::Config(format!("process '{}' has an empty start_command", id)))?;

        let mut cmd = Command::new(program);
        cmd.args(args).envs(env).stdin(Stdio::null());

        // 不接管输出时直接丢弃，避免管道写满阻塞子进程
        match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(spawn_err)?;
                }
                let out = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(spawn_err)?;
                let err = out.try_clone().map_err(spawn_err)?;
                cmd.stdout(out).stderr(err);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn signal(&mut self, pid: u32, signal: StopSignal) -> Result<()> {
        let raw = i32::try_from(pid).map_err(|_| GuardianError::Signal(Errno::EINVAL))?;
        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        match kill(NixPid::from_raw(raw), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(GuardianError::Signal(e)),
        }
    }

    fn reap(&mut self, pid: u32) -> Option<String> {
        let child = self.children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.children.remove(&pid);
                Some(describe_exit(status))
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to poll child {}: {}", pid, e);
                None
            }
        }
    }
}
