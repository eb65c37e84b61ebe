//! Client-side subcommands that talk to a running supervisor.

use anyhow::{bail, Context};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::GuardianConfig;
use crate::services::launcher::{Launcher, OsLauncher, StopSignal};
use crate::services::lock::running_instance;
use crate::services::process_table::{is_pid_alive, ProcessSource, SysinfoSource};
use crate::state::{StatusResponse, StatusRow};
use crate::supervisor::{inspect, orphaned_pids};

const POLL: Duration = Duration::from_millis(200);
const FOLLOW_POLL: Duration = Duration::from_millis(500);

fn api_url(config: &GuardianConfig, path: &str) -> String {
    format!("http://{}{}", config.settings.api_address, path)
}

fn client() -> anyhow::Result<reqwest::Client> {
    client_with_timeout(Duration::from_secs(10))
}

fn client_with_timeout(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// `status`: ask the running supervisor, or fall back to a one-shot scan.
pub async fn status(config: &GuardianConfig, json: bool) -> anyhow::Result<()> {
    let (source, rows) = match running_instance(&config.settings.lock_file) {
        Some(record) => {
            let response: StatusResponse = client()?
                .get(api_url(config, "/status"))
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("querying guardian (pid {})", record.pid))?
                .json()
                .await?;
            (
                format!("guardian pid {}, {} mode since {}", record.pid, response.mode, response.started_at),
                response.processes,
            )
        }
        None => {
            let snapshot = SysinfoSource::new().snapshot();
            (
                "guardian not running, one-shot discovery".to_string(),
                inspect(&config.processes, &snapshot),
            )
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{}", source);
        print!("{}", format_rows(&rows));
    }
    Ok(())
}

pub fn format_rows(rows: &[StatusRow]) -> String {
    let mut out = format!(
        "{:<20} {:<9} {:<9} {:>8} {:<9} {:>11} {:>8}  {}\n",
        "ID", "KIND", "STATE", "PID", "HEALTH", "UPTIME", "RESTARTS", "LAST EXIT"
    );
    for row in rows {
        out.push_str(&format!(
            "{:<20} {:<9} {:<9} {:>8} {:<9} {:>11} {:>8}  {}\n",
            row.id,
            row.kind,
            row.lifecycle.to_string(),
            row.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            row.health.map_or_else(|| "-".to_string(), |h| h.to_string()),
            format_uptime(row.uptime_secs),
            row.restart_count,
            row.last_exit_reason.as_deref().unwrap_or("-"),
        ));
    }
    out
}

pub fn format_uptime(secs: Option<u64>) -> String {
    let Some(secs) = secs else {
        return "-".to_string();
    };
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

async fn wait_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while is_pid_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL).await;
    }
    true
}

/// `down` / `stop`: SIGTERM the running supervisor, escalate after the
/// shutdown timeout, then clean up managed processes it left behind.
pub async fn shutdown(config: &GuardianConfig, verb: &str) -> anyhow::Result<()> {
    let timeout = config.settings.shutdown_timeout;
    let graceful = match running_instance(&config.settings.lock_file) {
        Some(record) => {
            let pid = NixPid::from_raw(i32::try_from(record.pid)?);
            log::info!("{}: sending SIGTERM to guardian (pid {})", verb, record.pid);
            kill(pid, Signal::SIGTERM)?;

            if wait_exit(record.pid, timeout).await {
                log::info!("Guardian stopped");
                true
            } else {
                log::warn!(
                    "Guardian did not exit within {}s, sending SIGKILL",
                    timeout.as_secs()
                );
                kill(pid, Signal::SIGKILL)?;
                wait_exit(record.pid, Duration::from_secs(2)).await;
                false
            }
        }
        None => {
            log::info!("No guardian running");
            false
        }
    };

    if !graceful {
        sweep_orphans(config, timeout).await;
    }
    Ok(())
}

async fn sweep_orphans(config: &GuardianConfig, timeout: Duration) {
    let snapshot = SysinfoSource::new().snapshot();
    let orphans = orphaned_pids(&config.processes, &snapshot);
    if orphans.is_empty() {
        return;
    }

    let mut launcher = OsLauncher::new();
    for (id, pids) in &orphans {
        for &pid in pids {
            log::warn!("Stopping orphaned managed process '{}' (PID {})", id, pid);
            if let Err(e) = launcher.signal(pid, StopSignal::Terminate) {
                log::error!("Failed to signal '{}' (PID {}): {}", id, pid, e);
            }
        }
    }

    for (id, pids) in orphans {
        for pid in pids {
            if !wait_exit(pid, timeout).await {
                log::warn!("'{}' (PID {}) ignored SIGTERM, sending SIGKILL", id, pid);
                if let Err(e) = launcher.signal(pid, StopSignal::Kill) {
                    log::error!("Failed to kill '{}' (PID {}): {}", id, pid, e);
                }
            }
        }
    }
}

/// Upper bound for a restart request: every managed process may need a full
/// stop, verification and readiness wait.
fn restart_timeout(config: &GuardianConfig, id: Option<&str>) -> Duration {
    let settings = &config.settings;
    config
        .processes
        .iter()
        .filter(|p| p.is_managed() && id.map_or(true, |id| p.id == id))
        .map(|p| {
            settings.grace_period
                + settings.startup_timeout
                + p.readiness().map_or(Duration::ZERO, |r| r.timeout)
        })
        .sum::<Duration>()
        + Duration::from_secs(10)
}

/// `restart [id]` through the running supervisor's control endpoint.
pub async fn restart(config: &GuardianConfig, id: Option<&str>) -> anyhow::Result<()> {
    if running_instance(&config.settings.lock_file).is_none() {
        bail!("guardian is not running; use `start` instead");
    }
    if let Some(id) = id {
        if !config.processes.iter().any(|p| p.id == id) {
            bail!("process '{}' is not in the registry", id);
        }
    }

    let path = match id {
        Some(id) => format!("/restart/{}", id),
        None => "/restart".to_string(),
    };
    let target = id.map_or_else(|| "all managed processes".to_string(), |id| format!("'{}'", id));

    let response = client_with_timeout(restart_timeout(config, id))?
        .post(api_url(config, &path))
        .send()
        .await
        .context("contacting guardian")?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    if !status.is_success() {
        bail!(
            "restart of {} failed: {}",
            target,
            body.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error")
        );
    }
    println!("Restarted {}", target);
    Ok(())
}

/// Output file of `id`, or of the only process that has one.
fn log_path(config: &GuardianConfig, id: Option<&str>) -> anyhow::Result<PathBuf> {
    if let Some(id) = id {
        let Some(cfg) = config.processes.iter().find(|p| p.id == id) else {
            bail!("process '{}' is not in the registry", id);
        };
        return cfg
            .log_file()
            .map(Path::to_path_buf)
            .with_context(|| format!("process '{}' has no log_file configured", id));
    }

    let mut logged = config
        .processes
        .iter()
        .filter_map(|p| p.log_file().map(|f| (p.id.as_str(), f)));
    match (logged.next(), logged.next()) {
        (Some((_, file)), None) => Ok(file.to_path_buf()),
        (None, _) => bail!("no process has a log_file configured"),
        (Some(_), Some(_)) => bail!("several processes have a log_file; pass a process id"),
    }
}

/// Last `n` lines of `path` and the offset to follow from.
fn tail(path: &Path, n: usize) -> std::io::Result<(Vec<String>, u64)> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    Ok((
        lines[skip..].iter().map(|l| l.to_string()).collect(),
        bytes.len() as u64,
    ))
}

/// Text appended after `offset`; a shorter file was truncated and is read from the start.
fn read_from(path: &Path, offset: u64) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = if len < offset { 0 } else { offset };
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok((String::from_utf8_lossy(&buf).into_owned(), start + buf.len() as u64))
}

/// `logs [id] [-f] [-n N]`
pub async fn logs(
    config: &GuardianConfig,
    id: Option<&str>,
    follow: bool,
    lines: usize,
) -> anyhow::Result<()> {
    let path = log_path(config, id)?;
    let mut offset = match tail(&path, lines) {
        Ok((last, offset)) => {
            for line in last {
                println!("{}", line);
            }
            offset
        }
        Err(e) if follow && e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    if !follow {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(FOLLOW_POLL) => {}
        }
        match read_from(&path, offset) {
            Ok((text, next)) => {
                print!("{}", text);
                offset = next;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => offset = 0,
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::models::{HealthClass, Lifecycle};
    use std::io::Write;

    #[test]
    fn formats_rows_with_placeholders() {
        let rows = vec![
            StatusRow {
                id: "procA".to_string(),
                kind: "observed".to_string(),
                lifecycle: Lifecycle::Running,
                pid: Some(200),
                health: Some(HealthClass::Healthy),
                restart_count: 0,
                last_exit_reason: None,
                last_seen_at: None,
                uptime_secs: Some(3723),
            },
            StatusRow {
                id: "procB".to_string(),
                kind: "managed".to_string(),
                lifecycle: Lifecycle::GaveUp,
                pid: None,
                health: Some(HealthClass::Failed),
                restart_count: 5,
                last_exit_reason: Some("exited with code 1".to_string()),
                last_seen_at: None,
                uptime_secs: None,
            },
        ];

        let text = format_rows(&rows);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[0].contains("UPTIME"));
        assert!(lines[1].contains("running") && lines[1].contains("200") && lines[1].contains("1h 2m 3s"));
        assert!(lines[2].contains("gave_up") && lines[2].contains("exited with code 1"));
    }

    #[test]
    fn uptime_is_human_readable() {
        assert_eq!(format_uptime(None), "-");
        assert_eq!(format_uptime(Some(7)), "7s");
        assert_eq!(format_uptime(Some(125)), "2m 5s");
        assert_eq!(format_uptime(Some(3600)), "1h 0m 0s");
    }

    fn logged_config(extra: &str) -> GuardianConfig {
        parse_config(&format!(
            r#"
            [[process]]
            id = "procA"
            managed = false
            match_rule = "procA"

            [[process]]
            id = "procB"
            start_command = ["procB"]
            log_file = "/var/log/procB.log"
            ready = {{ kind = "port", port = 8080, timeout = 20 }}
            {}
            "#,
            extra
        ))
        .unwrap()
    }

    #[test]
    fn log_path_picks_the_only_logged_process() {
        let config = logged_config("");
        assert_eq!(log_path(&config, None).unwrap(), PathBuf::from("/var/log/procB.log"));
        assert_eq!(log_path(&config, Some("procB")).unwrap(), PathBuf::from("/var/log/procB.log"));

        let err = log_path(&config, Some("procA")).unwrap_err().to_string();
        assert!(err.contains("no log_file"), "{}", err);
        assert!(log_path(&config, Some("nope")).is_err());

        let config = logged_config(
            r#"
            [[process]]
            id = "procC"
            start_command = ["procC"]
            log_file = "/var/log/procC.log"
            "#,
        );
        let err = log_path(&config, None).unwrap_err().to_string();
        assert!(err.contains("pass a process id"), "{}", err);
    }

    #[test]
    fn tail_returns_last_lines_and_follow_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procB.log");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let (last, offset) = tail(&path, 2).unwrap();
        assert_eq!(last, vec!["two", "three"]);
        assert_eq!(offset, 14);
        assert_eq!(tail(&path, 10).unwrap().0.len(), 3);

        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"four\n")
            .unwrap();
        let (text, next) = read_from(&path, offset).unwrap();
        assert_eq!(text, "four\n");
        assert_eq!(next, 19);
        assert_eq!(read_from(&path, next).unwrap().0, "");
    }

    #[test]
    fn follow_restarts_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procB.log");
        std::fs::write(&path, "a much longer line from before rotation\n").unwrap();
        let offset = std::fs::metadata(&path).unwrap().len();

        std::fs::write(&path, "fresh\n").unwrap();
        let (text, next) = read_from(&path, offset).unwrap();
        assert_eq!(text, "fresh\n");
        assert_eq!(next, 6);
    }

    #[test]
    fn restart_timeout_covers_readiness() {
        let config = logged_config("");
        let s = &config.settings;
        let one = s.grace_period + s.startup_timeout + Duration::from_secs(20) + Duration::from_secs(10);
        assert_eq!(restart_timeout(&config, Some("procB")), one);
        // Observed processes are never restarted
        assert_eq!(restart_timeout(&config, None), one);
        assert_eq!(restart_timeout(&config, Some("procA")), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn wait_exit_times_out_for_live_pid() {
        assert!(!wait_exit(std::process::id(), Duration::from_millis(50)).await);
    }
}
