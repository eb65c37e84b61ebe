//! Restart policy for managed processes.
//!
//! A process may be restarted at most `max_attempts` times inside a sliding
//! `window`. Attempts older than the window no longer count, so a process that
//! crashes once a day is restarted forever while a crash loop ends in `GaveUp`.
//!
//! The delay before attempt `n` (0-indexed inside the window) is either fixed
//! or `first × factor^n`, clamped to `max`.

use serde::Deserialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

fn default_max_attempts() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    300
}

/// 重启间隔策略
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        delay_secs: f64,
    },
    Exponential {
        first_secs: f64,
        max_secs: f64,
        factor: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_secs: 30.0 }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_secs } => secs(delay_secs),
            Backoff::Exponential {
                first_secs,
                max_secs,
                factor,
            } => {
                let exp = attempt.min(i32::MAX as u32) as i32;
                let unclamped = first_secs * factor.powi(exp);
                if !unclamped.is_finite() || unclamped > max_secs {
                    secs(max_secs)
                } else {
                    secs(unclamped)
                }
            }
        }
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            backoff: Backoff::default(),
        }
    }
}

/// Outcome of asking the policy for another restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`; `attempt` is the number of attempts in the window including this one.
    Restart { delay: Duration, attempt: u32 },
    GiveUp { attempts: u32 },
}

impl RestartPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Drop attempts that slid out of the window and return how many remain.
    pub fn prune(&self, attempts: &mut VecDeque<Instant>, now: Instant) -> u32 {
        let window = self.window();
        while let Some(front) = attempts.front() {
            if now.saturating_duration_since(*front) >= window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        attempts.len() as u32
    }

    /// Decide on a restart and record the attempt when one is granted.
    pub fn next(&self, attempts: &mut VecDeque<Instant>, now: Instant) -> RestartDecision {
        let used = self.prune(attempts, now);
        if used >= self.max_attempts {
            return RestartDecision::GiveUp { attempts: used };
        }
        attempts.push_back(now);
        RestartDecision::Restart {
            delay: self.backoff.delay(used),
            attempt: used + 1,
        }
    }
}
