use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GuardianError, Result};
use crate::policy::RestartPolicy;

/// 进程表中的一条记录（与 sysinfo 解耦，便于测试）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    /// 内核报告的进程名
    pub name: String,
    /// 可执行文件路径
    pub exe: Option<PathBuf>,
    /// 完整命令行参数（含 argv[0]）
    pub cmd: Vec<String>,
    /// 进程启动时间（Unix 秒）
    pub start_time: Option<u64>,
}

impl ProcessInfo {
    pub fn cmdline(&self) -> String {
        self.cmd.join(" ")
    }
}

fn base_name(arg: &str) -> &str {
    Path::new(arg)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(arg)
}

/// Predicate over process name, executable path and argument list.
///
/// Every configured constraint must hold. Matching on the name alone is not
/// enough to tell `python3 observer.py` from any other interpreter, so `args`
/// and `cmdline` narrow the candidates further.
#[derive(Debug, Clone)]
pub struct MatchRule {
    name: Option<String>,
    args: Vec<String>,
    cmdline: Option<Regex>,
}

impl MatchRule {
    pub fn new(name: Option<String>, args: Vec<String>, cmdline: Option<&str>) -> Result<Self> {
        let name = name
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty());
        let cmdline = cmdline.map(Regex::new).transpose()?;
        if name.is_none() && args.is_empty() && cmdline.is_none() {
            return Err(GuardianError::Config(
                "match rule needs at least one of name, args or cmdline".to_string(),
            ));
        }
        Ok(Self { name, args, cmdline })
    }

    /// Shorthand for a rule constrained only by name.
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_lowercase()),
            args: Vec::new(),
            cmdline: None,
        }
    }

    /// Derive a rule from a start command: binary name plus its non-flag arguments.
    pub fn from_command(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        let args = rest
            .iter()
            .filter(|a| !a.starts_with('-'))
            .map(|a| base_name(a).to_string())
            .collect();
        Some(Self {
            name: Some(base_name(program).to_lowercase()),
            args,
            cmdline: None,
        })
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        if let Some(name) = &self.name {
            let in_name = process.name.to_lowercase().contains(name);
            let in_exe = process
                .exe
                .as_deref()
                .and_then(|exe| exe.file_name())
                .and_then(|f| f.to_str())
                .map_or(false, |f| f.to_lowercase().contains(name));
            let in_args = process
                .cmd
                .iter()
                .any(|arg| base_name(arg).to_lowercase().contains(name));
            if !(in_name || in_exe || in_args) {
                return false;
            }
        }

        let args_present = self.args.iter().all(|expected| {
            let expected = base_name(expected);
            process.cmd.iter().any(|actual| base_name(actual) == expected)
        });
        if !args_present {
            return false;
        }

        match &self.cmdline {
            Some(re) => re.is_match(&process.cmdline()),
            None => true,
        }
    }
}

impl std::fmt::Display for MatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(name) = &self.name {
            parts.push(format!("name~{}", name));
        }
        if !self.args.is_empty() {
            parts.push(format!("args={:?}", self.args));
        }
        if let Some(re) = &self.cmdline {
            parts.push(format!("cmdline=/{}/", re.as_str()));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// 健康检查方式
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthCheck {
    /// 仅检查进程存活
    #[default]
    Liveness,
    /// 存活 + 配置/产物文件完整性（变更时备份）
    Artifacts {
        files: Vec<PathBuf>,
        backup_dir: PathBuf,
    },
}

/// 启动后的就绪探测方式
#[derive(Debug, Clone)]
pub enum ReadyProbe {
    /// 固定等待
    Time(Duration),
    /// TCP 端口可以连接
    Port { address: String },
    /// 日志中出现匹配行（只看本次启动之后写入的内容）
    Log { file: PathBuf, pattern: Regex },
}

impl std::fmt::Display for ReadyProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadyProbe::Time(wait) => write!(f, "wait {}s", wait.as_secs_f64()),
            ReadyProbe::Port { address } => write!(f, "port {}", address),
            ReadyProbe::Log { file, pattern } => {
                write!(f, "log {} matching /{}/", file.display(), pattern.as_str())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Readiness {
    pub probe: ReadyProbe,
    pub timeout: Duration,
}

/// Who owns the lifecycle of a process.
#[derive(Debug, Clone)]
pub enum ProcessKind {
    Managed {
        start_command: Vec<String>,
        env_overrides: BTreeMap<String, String>,
        working_dir: Option<PathBuf>,
        /// stdout/stderr 追加写入此文件；未配置时丢弃
        log_file: Option<PathBuf>,
        ready: Option<Readiness>,
    },
    Observed,
}

/// 进程配置信息（加载后不可变）
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// 进程名称（唯一标识符）
    pub id: String,
    pub kind: ProcessKind,
    pub match_rule: MatchRule,
    pub health_check: HealthCheck,
    pub restart_policy: RestartPolicy,
}

impl ProcessConfig {
    pub fn managed(id: &str, start_command: &[&str]) -> Self {
        let argv: Vec<String> = start_command.iter().map(|s| s.to_string()).collect();
        let match_rule = MatchRule::from_command(&argv).unwrap_or_else(|| MatchRule::named(id));
        Self {
            id: id.to_string(),
            kind: ProcessKind::Managed {
                start_command: argv,
                env_overrides: BTreeMap::new(),
                working_dir: None,
                log_file: None,
                ready: None,
            },
            match_rule,
            health_check: HealthCheck::Liveness,
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn observed(id: &str, match_rule: MatchRule) -> Self {
        Self {
            id: id.to_string(),
            kind: ProcessKind::Observed,
            match_rule,
            health_check: HealthCheck::Liveness,
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn with_match_rule(mut self, match_rule: MatchRule) -> Self {
        self.match_rule = match_rule;
        self
    }

    pub fn with_restart_policy(mut self, restart_policy: RestartPolicy) -> Self {
        self.restart_policy = restart_policy;
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = health_check;
        self
    }

    /// Capture output of a managed process. No effect on observed ones.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        if let ProcessKind::Managed { log_file, .. } = &mut self.kind {
            *log_file = Some(path.into());
        }
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        if let ProcessKind::Managed { ready, .. } = &mut self.kind {
            *ready = Some(readiness);
        }
        self
    }

    pub fn log_file(&self) -> Option<&Path> {
        match &self.kind {
            ProcessKind::Managed { log_file, .. } => log_file.as_deref(),
            ProcessKind::Observed => None,
        }
    }

    pub fn readiness(&self) -> Option<&Readiness> {
        match &self.kind {
            ProcessKind::Managed { ready, .. } => ready.as_ref(),
            ProcessKind::Observed => None,
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.kind, ProcessKind::Managed { .. })
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            ProcessKind::Managed { .. } => "managed",
            ProcessKind::Observed => "observed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pid: u32, name: &str, exe: Option<&str>, cmd: &[&str]) -> ProcessInfo {
        ProcessInfo {
            pid,
            parent: Some(1),
            name: name.to_string(),
            exe: exe.map(PathBuf::from),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            start_time: None,
        }
    }

    #[test]
    fn name_matches_wrapper_launched_script() {
        // Node reports "node" as the name; the real command only shows up in argv
        let p = info(10, "node", Some("/usr/bin/node"), &["node", "/opt/bin/openclaw", "gateway"]);
        assert!(MatchRule::named("openclaw").matches(&p));
        assert!(!MatchRule::named("oc-memory").matches(&p));
    }

    #[test]
    fn name_matches_executable_file_name() {
        let p = info(11, "Python", Some("/usr/local/bin/procA"), &[]);
        assert!(MatchRule::named("PROCA").matches(&p));
    }

    #[test]
    fn args_disambiguate_shared_interpreter() {
        let rule = MatchRule::new(
            Some("python".to_string()),
            vec!["memory_observer.py".to_string()],
            None,
        )
        .unwrap();

        let observer = info(20, "Python", None, &["/venv/bin/python3", "/srv/oc/memory_observer.py"]);
        let other = info(21, "Python", None, &["/venv/bin/python3", "-m", "http.server"]);

        assert!(rule.matches(&observer));
        assert!(!rule.matches(&other));
    }

    #[test]
    fn cmdline_regex_is_applied() {
        let rule = MatchRule::new(None, Vec::new(), Some(r"java .*-jar app\.jar")).unwrap();
        assert!(rule.matches(&info(30, "java", None, &["java", "-Xmx1g", "-jar", "app.jar"])));
        assert!(!rule.matches(&info(31, "java", None, &["java", "-jar", "other.jar"])));
    }

    #[test]
    fn empty_rule_is_rejected() {
        assert!(MatchRule::new(Some("  ".to_string()), Vec::new(), None).is_err());
    }

    #[test]
    fn rule_derived_from_start_command_skips_flags() {
        let argv = vec![
            "/usr/bin/python3".to_string(),
            "-u".to_string(),
            "memory_observer.py".to_string(),
        ];
        let rule = MatchRule::from_command(&argv).unwrap();
        assert!(rule.matches(&info(40, "python3", None, &["python3", "-u", "./memory_observer.py"])));
        assert!(!rule.matches(&info(41, "python3", None, &["python3", "other.py"])));
        assert!(MatchRule::from_command(&[]).is_none());
    }
}
