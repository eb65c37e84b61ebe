//! In-memory process table, launcher and notification transport for tests.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{GuardianError, Result};
use crate::models::ProcessInfo;
use crate::services::launcher::{Launcher, StopSignal};
use crate::services::notifier::Transport;
use crate::services::process_table::{ProcessSource, Snapshot};

#[derive(Default)]
pub struct World {
    pub processes: BTreeMap<u32, ProcessInfo>,
    pub exits: BTreeMap<u32, String>,
    /// PIDs that ignore SIGTERM
    pub stubborn: HashSet<u32>,
    pub spawns: Vec<(String, Vec<String>, BTreeMap<String, String>)>,
    pub signals: Vec<(u32, StopSignal)>,
    /// Full process-table scans taken through `FakeSource`
    pub scans: usize,
    /// Output files handed to spawned processes
    pub log_files: Vec<std::path::PathBuf>,
    /// Program names whose spawn fails
    pub broken: HashSet<String>,
    next_pid: u32,
}

impl World {
    pub fn add_external(&mut self, pid: u32, parent: u32, cmd: &[&str]) {
        self.processes.insert(
            pid,
            ProcessInfo {
                pid,
                parent: Some(parent),
                name: cmd.first().copied().unwrap_or_default().to_string(),
                exe: None,
                cmd: cmd.iter().map(|s| s.to_string()).collect(),
                start_time: None,
            },
        );
    }

    /// Simulate an external kill of a process.
    pub fn kill(&mut self, pid: u32) {
        if self.processes.remove(&pid).is_some() {
            self.exits.insert(pid, "killed by signal 9".to_string());
        }
    }

    pub fn pid_of(&self, program: &str) -> Option<u32> {
        self.processes
            .values()
            .find(|p| p.cmd.first().map(String::as_str) == Some(program))
            .map(|p| p.pid)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.len()
    }
}

pub type SharedWorld = Arc<Mutex<World>>;

pub fn world() -> SharedWorld {
    let world = World {
        next_pid: 1000,
        ..World::default()
    };
    Arc::new(Mutex::new(world))
}

pub struct FakeSource(pub SharedWorld);

impl ProcessSource for FakeSource {
    fn snapshot(&mut self) -> Snapshot {
        let mut world = self.0.lock().unwrap();
        world.scans += 1;
        Snapshot::new(world.processes.values().cloned().collect())
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.0.lock().unwrap().processes.contains_key(&pid)
    }
}

pub struct FakeLauncher(pub SharedWorld);

impl Launcher for FakeLauncher {
    fn spawn(
        &mut self,
        id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
        _working_dir: Option<&Path>,
        log_file: Option<&Path>,
    ) -> Result<u32> {
        let mut world = self.0.lock().unwrap();
        world.spawns.push((id.to_string(), command.to_vec(), env.clone()));
        if let Some(path) = log_file {
            world.log_files.push(path.to_path_buf());
        }

        let program = command.first().cloned().unwrap_or_default();
        if world.broken.contains(&program) {
            return Err(GuardianError::Spawn {
                id: id.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        world.next_pid += 1;
        let pid = world.next_pid;
        world.processes.insert(
            pid,
            ProcessInfo {
                pid,
                parent: Some(std::process::id()),
                name: program,
                exe: None,
                cmd: command.to_vec(),
                start_time: None,
            },
        );
        Ok(pid)
    }

    fn signal(&mut self, pid: u32, signal: StopSignal) -> Result<()> {
        let mut world = self.0.lock().unwrap();
        world.signals.push((pid, signal));
        let exits = match signal {
            StopSignal::Terminate => !world.stubborn.contains(&pid),
            StopSignal::Kill => true,
        };
        if exits && world.processes.remove(&pid).is_some() {
            let reason = match signal {
                StopSignal::Terminate => "killed by signal 15",
                StopSignal::Kill => "killed by signal 9",
            };
            world.exits.insert(pid, reason.to_string());
        }
        Ok(())
    }

    fn reap(&mut self, pid: u32) -> Option<String> {
        self.0.lock().unwrap().exits.remove(&pid)
    }
}

/// Records every transport invocation; commands listed in `failing` fail.
#[derive(Default)]
pub struct RecordingTransport {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub envs: Mutex<Vec<BTreeMap<String, String>>>,
    pub failing: HashSet<String>,
}

impl RecordingTransport {
    pub fn failing(programs: &[&str]) -> Self {
        Self {
            failing: programs.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|argv| argv.last().cloned())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(
        &self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> std::result::Result<(), String> {
        self.calls.lock().unwrap().push(argv.to_vec());
        self.envs.lock().unwrap().push(env.clone());
        match argv.first() {
            Some(program) if self.failing.contains(program) => {
                Err(format!("{}: command not found", program))
            }
            _ => Ok(()),
        }
    }
}
