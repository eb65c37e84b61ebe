//! Post-start readiness checks.
//!
//! Verification only proves the process exists; readiness waits until it can
//! serve: a fixed delay, an accepting TCP port, or a log line written after
//! the spawn.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::models::{ReadyProbe, Readiness};

const READY_POLL: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    TimedOut,
    /// 等待期间收到关闭信号
    Cancelled,
}

/// Log offset to scan from, taken before the spawn so older lines never count.
pub fn baseline(probe: &ReadyProbe) -> u64 {
    match probe {
        ReadyProbe::Log { file, .. } => std::fs::metadata(file).map(|m| m.len()).unwrap_or(0),
        _ => 0,
    }
}

pub async fn wait_ready(
    readiness: &Readiness,
    baseline: u64,
    shutdown: &mut watch::Receiver<bool>,
) -> ReadyOutcome {
    if let ReadyProbe::Time(wait) = &readiness.probe {
        let wait = (*wait).min(readiness.timeout);
        return tokio::select! {
            _ = tokio::time::sleep(wait) => ReadyOutcome::Ready,
            _ = shutdown.changed() => ReadyOutcome::Cancelled,
        };
    }

    let deadline = Instant::now() + readiness.timeout;
    loop {
        if probe_once(&readiness.probe, baseline).await {
            return ReadyOutcome::Ready;
        }
        if Instant::now() >= deadline {
            return ReadyOutcome::TimedOut;
        }
        tokio::select! {
            _ = tokio::time::sleep(READY_POLL) => {}
            _ = shutdown.changed() => return ReadyOutcome::Cancelled,
        }
    }
}

async fn probe_once(probe: &ReadyProbe, baseline: u64) -> bool {
    match probe {
        ReadyProbe::Time(_) => true,
        ReadyProbe::Port { address } => matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address.as_str())).await,
            Ok(Ok(_))
        ),
        ReadyProbe::Log { file, pattern } => log_contains(file, pattern, baseline).await,
    }
}

async fn log_contains(file: &Path, pattern: &Regex, baseline: u64) -> bool {
    let Ok(bytes) = tokio::fs::read(file).await else {
        return false;
    };
    // 文件比基线短说明被截断或轮转过，从头开始
    let start = usize::try_from(baseline)
        .ok()
        .filter(|&b| b <= bytes.len())
        .unwrap_or(0);
    String::from_utf8_lossy(&bytes[start..])
        .lines()
        .any(|line| pattern.is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn readiness(probe: ReadyProbe, timeout_ms: u64) -> Readiness {
        Readiness {
            probe,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn append(path: &Path, line: &str) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        writeln!(f, "{}", line).unwrap();
    }

    #[tokio::test]
    async fn port_check_waits_for_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (_tx, mut rx) = watch::channel(false);

        let ready = readiness(ReadyProbe::Port { address: address.clone() }, 2000);
        assert_eq!(wait_ready(&ready, 0, &mut rx).await, ReadyOutcome::Ready);

        drop(listener);
        let closed = readiness(ReadyProbe::Port { address }, 300);
        assert_eq!(wait_ready(&closed, 0, &mut rx).await, ReadyOutcome::TimedOut);
    }

    #[tokio::test]
    async fn log_check_ignores_lines_before_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("procB.log");
        append(&log, "listening on :8080");

        let probe = ReadyProbe::Log {
            file: log.clone(),
            pattern: Regex::new("listening on").unwrap(),
        };
        let start = baseline(&probe);
        assert!(start > 0);
        let (_tx, mut rx) = watch::channel(false);

        let ready = readiness(probe, 300);
        assert_eq!(wait_ready(&ready, start, &mut rx).await, ReadyOutcome::TimedOut);

        let writer = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            append(&log, "booting");
            append(&log, "listening on :8080");
        };
        let longer = Readiness {
            timeout: Duration::from_secs(3),
            ..ready
        };
        let (outcome, ()) = tokio::join!(wait_ready(&longer, start, &mut rx), writer);
        assert_eq!(outcome, ReadyOutcome::Ready);
    }

    #[tokio::test]
    async fn truncated_log_is_read_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("procB.log");
        append(&log, "a long line from the previous run that is gone now");
        let pattern = Regex::new("ready").unwrap();
        let start = std::fs::metadata(&log).unwrap().len();

        std::fs::write(&log, "ready\n").unwrap();
        assert!(log_contains(&log, &pattern, start).await);
    }

    #[tokio::test]
    async fn time_wait_is_cancelled_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let ready = readiness(ReadyProbe::Time(Duration::from_secs(30)), 60_000);

        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        let (outcome, ()) = tokio::join!(wait_ready(&ready, 0, &mut rx), driver);
        assert_eq!(outcome, ReadyOutcome::Cancelled);
    }
}
