//! TOML configuration.
//!
//! ```toml
//! [supervisor]
//! cycle_interval = 5
//! lock_file = "/tmp/stack-guardian.lock"
//!
//! [notifications]
//! enabled = true
//! events = ["process_crash", "health_check_failed"]
//! primary = ["openclaw", "message", "send", "{message}"]
//! forward_env = ["OPENCLAW_TOKEN"]
//!
//! [[process]]
//! id = "procA"
//! managed = false
//! match_rule = "procA"
//!
//! [[process]]
//! id = "procB"
//! start_command = ["/usr/local/bin/procB", "serve"]
//! log_file = "/var/log/procB.log"
//! ready = { kind = "log", pattern = "listening on", timeout = 20 }
//! ```

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GuardianError, Result};
use crate::models::{
    EventType, HealthCheck, MatchRule, ProcessConfig, ProcessKind, ReadyProbe, Readiness,
};
use crate::policy::RestartPolicy;

pub const DEFAULT_LOCK_FILE: &str = "/tmp/stack-guardian.lock";
pub const DEFAULT_API_ADDRESS: &str = "127.0.0.1:9797";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READY_WAIT: Duration = Duration::from_secs(5);

/// Loaded and validated configuration.
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub settings: Settings,
    pub notifications: NotificationSettings,
    pub processes: Vec<ProcessConfig>,
}

/// Supervisor tunables
#[derive(Debug, Clone)]
pub struct Settings {
    pub cycle_interval: Duration,
    pub grace_period: Duration,
    pub startup_timeout: Duration,
    pub discovery_poll: Duration,
    pub shutdown_timeout: Duration,
    pub lock_file: PathBuf,
    pub api_address: String,
    /// up/start 模式下 guardian 自身日志的输出文件，缺省写 stderr
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(10),
            discovery_poll: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(15),
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            api_address: DEFAULT_API_ADDRESS.to_string(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub events: BTreeSet<EventType>,
    pub send_timeout: Duration,
    /// argv 模板，`{message}` 会被替换
    pub primary: Vec<String>,
    pub fallback: Option<Vec<String>>,
    /// 从 guardian 自身环境转发给通知命令的变量名
    pub forward_env: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            events: EventType::ALL.into_iter().collect(),
            send_timeout: Duration::from_secs(10),
            primary: Vec::new(),
            fallback: None,
            forward_env: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    supervisor: RawSupervisor,
    #[serde(default)]
    notifications: RawNotifications,
    #[serde(default, rename = "process")]
    processes: Vec<RawProcess>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSupervisor {
    cycle_interval: Option<f64>,
    grace_period: Option<f64>,
    startup_timeout: Option<f64>,
    discovery_poll: Option<f64>,
    shutdown_timeout: Option<f64>,
    lock_file: Option<PathBuf>,
    api_address: Option<String>,
    log_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNotifications {
    #[serde(default)]
    enabled: bool,
    events: Option<Vec<EventType>>,
    send_timeout: Option<f64>,
    #[serde(default)]
    primary: Vec<String>,
    fallback: Option<Vec<String>>,
    #[serde(default)]
    forward_env: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMatchRule {
    Name(String),
    Detailed {
        name: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        cmdline: Option<String>,
    },
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum RawReady {
    Time {
        secs: Option<f64>,
        timeout: Option<f64>,
    },
    Port {
        port: u16,
        #[serde(default = "default_host")]
        host: String,
        timeout: Option<f64>,
    },
    Log {
        /// 缺省为进程的 log_file
        file: Option<PathBuf>,
        pattern: String,
        timeout: Option<f64>,
    },
}

fn default_managed() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProcess {
    id: String,
    #[serde(default = "default_managed")]
    managed: bool,
    #[serde(default)]
    start_command: Vec<String>,
    match_rule: Option<RawMatchRule>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    #[serde(default)]
    health: HealthCheck,
    #[serde(default)]
    restart: RestartPolicy,
    log_file: Option<PathBuf>,
    ready: Option<RawReady>,
}

fn seconds(field: &str, value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(v) if v.is_finite() && v > 0.0 => Ok(Duration::from_secs_f64(v)),
        Some(v) => Err(GuardianError::Config(format!(
            "{} must be a positive number of seconds, got {}",
            field, v
        ))),
    }
}

impl RawMatchRule {
    fn into_rule(self) -> Result<MatchRule> {
        match self {
            RawMatchRule::Name(name) => MatchRule::new(Some(name), Vec::new(), None),
            RawMatchRule::Detailed { name, args, cmdline } => {
                MatchRule::new(name, args, cmdline.as_deref())
            }
        }
    }
}

impl RawReady {
    fn into_readiness(self, id: &str, log_file: Option<&Path>) -> Result<Readiness> {
        let field = format!("process '{}' ready.timeout", id);
        let (probe, timeout) = match self {
            RawReady::Time { secs, timeout } => {
                let wait = seconds(&format!("process '{}' ready.secs", id), secs, DEFAULT_READY_WAIT)?;
                (ReadyProbe::Time(wait), timeout)
            }
            RawReady::Port { port, host, timeout } => (
                ReadyProbe::Port {
                    address: format!("{}:{}", host, port),
                },
                timeout,
            ),
            RawReady::Log { file, pattern, timeout } => {
                let file = file.or_else(|| log_file.map(Path::to_path_buf)).ok_or_else(|| {
                    GuardianError::Config(format!(
                        "process '{}' ready.kind = \"log\" needs a file or log_file",
                        id
                    ))
                })?;
                let pattern = Regex::new(&pattern)?;
                (ReadyProbe::Log { file, pattern }, timeout)
            }
        };
        Ok(Readiness {
            probe,
            timeout: seconds(&field, timeout, DEFAULT_READY_TIMEOUT)?,
        })
    }
}

impl RawSupervisor {
    fn into_settings(self) -> Result<Settings> {
        let d = Settings::default();
        Ok(Settings {
            cycle_interval: seconds("supervisor.cycle_interval", self.cycle_interval, d.cycle_interval)?,
            grace_period: seconds("supervisor.grace_period", self.grace_period, d.grace_period)?,
            startup_timeout: seconds("supervisor.startup_timeout", self.startup_timeout, d.startup_timeout)?,
            discovery_poll: seconds("supervisor.discovery_poll", self.discovery_poll, d.discovery_poll)?,
            shutdown_timeout: seconds("supervisor.shutdown_timeout", self.shutdown_timeout, d.shutdown_timeout)?,
            lock_file: self.lock_file.unwrap_or(d.lock_file),
            api_address: self.api_address.unwrap_or(d.api_address),
            log_file: self.log_file,
        })
    }
}

impl RawNotifications {
    fn into_settings(self) -> Result<NotificationSettings> {
        let d = NotificationSettings::default();
        if self.enabled && self.primary.is_empty() {
            return Err(GuardianError::Config(
                "notifications.primary is required when notifications are enabled".to_string(),
            ));
        }
        if matches!(&self.fallback, Some(argv) if argv.is_empty()) {
            return Err(GuardianError::Config("notifications.fallback must not be empty".to_string()));
        }
        Ok(NotificationSettings {
            enabled: self.enabled,
            events: self
                .events
                .map(|events| events.into_iter().collect())
                .unwrap_or(d.events),
            send_timeout: seconds("notifications.send_timeout", self.send_timeout, d.send_timeout)?,
            primary: self.primary,
            fallback: self.fallback,
            forward_env: self.forward_env,
            env: self.env,
        })
    }
}

impl RawProcess {
    fn into_config(self) -> Result<ProcessConfig> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(GuardianError::Config("process id must not be empty".to_string()));
        }

        let explicit_rule = self.match_rule.map(RawMatchRule::into_rule).transpose()?;

        let (kind, match_rule) = if self.managed {
            if self.start_command.is_empty() {
                return Err(GuardianError::Config(format!(
                    "managed process '{}' needs a start_command",
                    id
                )));
            }
            let rule = match explicit_rule {
                Some(rule) => rule,
                None => MatchRule::from_command(&self.start_command).ok_or_else(|| {
                    GuardianError::Config(format!("cannot derive a match rule for '{}'", id))
                })?,
            };
            let ready = self
                .ready
                .map(|r| r.into_readiness(&id, self.log_file.as_deref()))
                .transpose()?;
            let kind = ProcessKind::Managed {
                start_command: self.start_command,
                env_overrides: self.env,
                working_dir: self.working_dir,
                log_file: self.log_file,
                ready,
            };
            (kind, rule)
        } else {
            if !self.start_command.is_empty()
                || !self.env.is_empty()
                || self.working_dir.is_some()
                || self.log_file.is_some()
                || self.ready.is_some()
            {
                return Err(GuardianError::Config(format!(
                    "observed process '{}' must not set start_command, env, working_dir, log_file or ready",
                    id
                )));
            }
            let rule = explicit_rule.ok_or_else(|| {
                GuardianError::Config(format!("observed process '{}' needs a match_rule", id))
            })?;
            (ProcessKind::Observed, rule)
        };

        if self.restart.max_attempts == 0 {
            log::warn!("Process '{}' has max_attempts = 0 and will never be restarted", id);
        }

        Ok(ProcessConfig {
            id,
            kind,
            match_rule,
            health_check: self.health,
            restart_policy: self.restart,
        })
    }
}

pub fn parse_config(text: &str) -> Result<GuardianConfig> {
    let raw: RawConfig = toml::from_str(text)?;

    let settings = raw.supervisor.into_settings()?;
    let notifications = raw.notifications.into_settings()?;

    let mut seen = HashSet::new();
    let mut processes = Vec::with_capacity(raw.processes.len());
    for raw_process in raw.processes {
        let cfg = raw_process.into_config()?;
        if !seen.insert(cfg.id.clone()) {
            return Err(GuardianError::Config(format!("duplicate process id '{}'", cfg.id)));
        }
        processes.push(cfg);
    }

    if processes.is_empty() {
        return Err(GuardianError::Config("no [[process]] entries configured".to_string()));
    }

    Ok(GuardianConfig {
        settings,
        notifications,
        processes,
    })
}

pub fn load_config(path: &Path) -> Result<GuardianConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        GuardianError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_config(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Backoff;

    const SAMPLE: &str = r#"
        [supervisor]
        cycle_interval = 1
        grace_period = 2.5

        [notifications]
        enabled = true
        events = ["process_crash"]
        primary = ["openclaw", "message", "send", "--text", "{message}"]
        fallback = ["logger", "-t", "guardian"]
        forward_env = ["OPENCLAW_TOKEN"]
        env = { OPENCLAW_PROFILE = "ops" }

        [[process]]
        id = "procA"
        managed = false
        match_rule = { name = "python", args = ["observer.py"] }

        [[process]]
        id = "procB"
        start_command = ["/opt/bin/procB", "--port", "8080", "serve"]
        env = { RUST_LOG = "debug" }
        health = { kind = "artifacts", files = ["/etc/procB.json"], backup_dir = "/var/backups/procB" }
        restart = { max_attempts = 3, backoff = { kind = "fixed", delay_secs = 5 } }
        log_file = "/var/log/procB.log"
        ready = { kind = "log", pattern = 'listening on :\d+' }
    "#;

    #[test]
    fn parses_full_sample() {
        let config = parse_config(SAMPLE).unwrap();

        assert_eq!(config.settings.cycle_interval, Duration::from_secs(1));
        assert_eq!(config.settings.grace_period, Duration::from_millis(2500));
        assert_eq!(config.settings.startup_timeout, Duration::from_secs(10));
        assert_eq!(config.settings.lock_file, PathBuf::from(DEFAULT_LOCK_FILE));

        let n = &config.notifications;
        assert!(n.enabled);
        assert_eq!(n.events.iter().copied().collect::<Vec<_>>(), vec![EventType::ProcessCrash]);
        assert_eq!(n.fallback.as_ref().unwrap()[0], "logger");
        assert_eq!(n.env.get("OPENCLAW_PROFILE").map(String::as_str), Some("ops"));

        let a = &config.processes[0];
        assert!(!a.is_managed());
        assert_eq!(a.match_rule.to_string(), r#"name~python args=["observer.py"]"#);

        let b = &config.processes[1];
        assert!(b.is_managed());
        assert_eq!(b.restart_policy.max_attempts, 3);
        assert_eq!(b.restart_policy.backoff, Backoff::Fixed { delay_secs: 5.0 });
        // Flags are skipped, their values are not
        assert_eq!(b.match_rule.to_string(), r#"name~procb args=["8080", "serve"]"#);
        assert!(matches!(b.health_check, HealthCheck::Artifacts { .. }));
        match &b.kind {
            ProcessKind::Managed { env_overrides, .. } => {
                assert_eq!(env_overrides.get("RUST_LOG").map(String::as_str), Some("debug"));
            }
            ProcessKind::Observed => panic!("procB should be managed"),
        }
        assert_eq!(b.log_file(), Some(Path::new("/var/log/procB.log")));
        let ready = b.readiness().unwrap();
        assert_eq!(ready.timeout, Duration::from_secs(30));
        match &ready.probe {
            ReadyProbe::Log { file, pattern } => {
                // Log readiness follows the process's own output by default
                assert_eq!(file, Path::new("/var/log/procB.log"));
                assert!(pattern.is_match("listening on :8080"));
            }
            other => panic!("unexpected readiness {:?}", other),
        }
    }

    #[test]
    fn parses_time_and_port_readiness() {
        let config = parse_config(
            r#"
            [supervisor]
            log_file = "/var/log/guardian.log"

            [[process]]
            id = "slow"
            start_command = ["slow"]
            ready = { kind = "time" }

            [[process]]
            id = "web"
            start_command = ["web"]
            ready = { kind = "port", port = 8080, timeout = 5 }
            "#,
        )
        .unwrap();
        assert_eq!(config.settings.log_file, Some(PathBuf::from("/var/log/guardian.log")));

        let slow = config.processes[0].readiness().unwrap();
        assert!(matches!(slow.probe, ReadyProbe::Time(wait) if wait == Duration::from_secs(5)));
        let web = config.processes[1].readiness().unwrap();
        assert_eq!(web.timeout, Duration::from_secs(5));
        assert!(matches!(&web.probe, ReadyProbe::Port { address } if address == "127.0.0.1:8080"));
        assert_eq!(config.processes[1].log_file(), None);
    }

    #[test]
    fn log_readiness_needs_a_file_and_valid_pattern() {
        let err = parse_config(
            r#"
            [[process]]
            id = "x"
            start_command = ["x"]
            ready = { kind = "log", pattern = "up" }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("needs a file or log_file"), "{err}");

        let err = parse_config(
            r#"
            [[process]]
            id = "x"
            start_command = ["x"]
            log_file = "/tmp/x.log"
            ready = { kind = "log", pattern = "(" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, GuardianError::Pattern(_)));
    }

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let config = parse_config(
            r#"
            [[process]]
            id = "procB"
            start_command = ["procB"]
            "#,
        )
        .unwrap();
        assert_eq!(config.settings.cycle_interval, Duration::from_secs(5));
        assert_eq!(config.settings.shutdown_timeout, Duration::from_secs(15));
        assert!(!config.notifications.enabled);
        assert_eq!(config.notifications.events.len(), EventType::ALL.len());
        assert_eq!(config.processes[0].restart_policy, RestartPolicy::default());
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let err = parse_config(
            r#"
            [notifications]
            events = ["process_crashed"]

            [[process]]
            id = "procB"
            start_command = ["procB"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, GuardianError::Toml(_)), "{err}");
    }

    #[test]
    fn rejects_invalid_registries() {
        let cases = [
            (
                "duplicate",
                r#"
                [[process]]
                id = "x"
                start_command = ["a"]
                [[process]]
                id = "x"
                start_command = ["b"]
                "#,
            ),
            (
                "start_command",
                r#"
                [[process]]
                id = "x"
                "#,
            ),
            (
                "match_rule",
                r#"
                [[process]]
                id = "x"
                managed = false
                "#,
            ),
            (
                "must not set",
                r#"
                [[process]]
                id = "x"
                managed = false
                match_rule = "x"
                start_command = ["x"]
                "#,
            ),
            (
                "must not set",
                r#"
                [[process]]
                id = "x"
                managed = false
                match_rule = "x"
                ready = { kind = "time", secs = 1 }
                "#,
            ),
            (
                "ready.timeout",
                r#"
                [[process]]
                id = "x"
                start_command = ["x"]
                ready = { kind = "port", port = 80, timeout = -1 }
                "#,
            ),
            (
                "primary",
                r#"
                [notifications]
                enabled = true
                [[process]]
                id = "x"
                start_command = ["x"]
                "#,
            ),
            (
                "positive",
                r#"
                [supervisor]
                grace_period = 0
                [[process]]
                id = "x"
                start_command = ["x"]
                "#,
            ),
            ("no [[process]]", ""),
        ];

        for (needle, text) in cases {
            let err = parse_config(text).unwrap_err().to_string();
            assert!(err.contains(needle), "expected '{}' in '{}'", needle, err);
        }
    }

    #[test]
    fn bad_cmdline_regex_is_reported() {
        let err = parse_config(
            r#"
            [[process]]
            id = "x"
            managed = false
            match_rule = { cmdline = "(" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, GuardianError::Pattern(_)));
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../guardian.example.toml")).unwrap();
        assert_eq!(config.processes.len(), 2);
        assert!(!config.processes[0].is_managed());
        assert_eq!(config.notifications.events.len(), EventType::ALL.len());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardian.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(load_config(&path).unwrap().processes.len(), 2);
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
