//! Event notifications through an external command.
//!
//! Delivery is best-effort: an event passes the allow-list, goes to the
//! primary command and, if that fails, once to the fallback. Failures are
//! logged and counted, never propagated to the control loop.

use std::collections::{BTreeMap, BTreeSet};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use wait_timeout::ChildExt;

use crate::config::NotificationSettings;
use crate::metrics::METRICS;
use crate::models::{EventType, NotificationEvent};

const MESSAGE_PLACEHOLDER: &str = "{message}";

/// 通知发送通道
pub trait Transport: Send + Sync {
    fn send(
        &self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<(), String>;
}

/// Runs the argv as a child process; non-zero exit or timeout is a failure.
pub struct CommandTransport;

impl Transport for CommandTransport {
    fn send(
        &self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<(), String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "empty notification command".to_string())?;

        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("{} failed to start: {}", program, e))?;

        match child.wait_timeout(timeout) {
            Ok(Some(status)) if status.success() => Ok(()),
            Ok(Some(status)) => Err(format!("{} exited with: {}", program, status)),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(format!("{} timed out after {:?}", program, timeout))
            }
            Err(e) => Err(format!("{} could not be waited on: {}", program, e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Disabled,
    Filtered,
    Delivered(Route),
    Failed(String),
}

pub struct Dispatcher {
    enabled: bool,
    allow: BTreeSet<EventType>,
    primary: Vec<String>,
    fallback: Option<Vec<String>>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    transport: Arc<dyn Transport>,
}

/// Build the transport environment: forwarded variables first, explicit values on top.
pub fn resolve_env<F>(
    forward: &[String],
    explicit: &BTreeMap<String, String>,
    lookup: F,
) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = BTreeMap::new();
    for name in forward {
        match lookup(name) {
            Some(value) => {
                env.insert(name.clone(), value);
            }
            None if explicit.contains_key(name) => {}
            None => log::warn!(
                "Notification variable {} is not set in the guardian environment; the transport may fail to authenticate",
                name
            ),
        }
    }
    env.extend(explicit.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn substitute(template: &[String], message: &str) -> Vec<String> {
    if template.iter().any(|arg| arg.contains(MESSAGE_PLACEHOLDER)) {
        template
            .iter()
            .map(|arg| arg.replace(MESSAGE_PLACEHOLDER, message))
            .collect()
    } else {
        let mut argv = template.to_vec();
        argv.push(message.to_string());
        argv
    }
}

impl Dispatcher {
    pub fn new(settings: &NotificationSettings, transport: Arc<dyn Transport>) -> Self {
        let env = if settings.enabled {
            resolve_env(&settings.forward_env, &settings.env, |name| std::env::var(name).ok())
        } else {
            BTreeMap::new()
        };
        Self::with_env(settings, env, transport)
    }

    pub fn with_env(
        settings: &NotificationSettings,
        env: BTreeMap<String, String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            enabled: settings.enabled,
            allow: settings.events.clone(),
            primary: settings.primary.clone(),
            fallback: settings.fallback.clone(),
            env,
            timeout: settings.send_timeout,
            transport,
        }
    }

    pub fn disabled() -> Self {
        Self::with_env(
            &NotificationSettings::default(),
            BTreeMap::new(),
            Arc::new(CommandTransport),
        )
    }

    /// Deliver synchronously. Blocks for up to two send timeouts.
    pub fn deliver(&self, event: &NotificationEvent) -> DispatchOutcome {
        if !self.enabled {
            return DispatchOutcome::Disabled;
        }
        let kind = event.event_type.as_str();
        if !self.allow.contains(&event.event_type) {
            log::debug!("Event {} for '{}' not in allow-list, dropped", kind, event.process_id);
            METRICS.notifications.with_label_values(&[kind, "filtered"]).inc();
            return DispatchOutcome::Filtered;
        }

        let message = event.render();
        let primary_err = match self
            .transport
            .send(&substitute(&self.primary, &message), &self.env, self.timeout)
        {
            Ok(()) => {
                METRICS.notifications.with_label_values(&[kind, "delivered"]).inc();
                return DispatchOutcome::Delivered(Route::Primary);
            }
            Err(e) => e,
        };
        log::warn!("Primary notification channel failed: {}", primary_err);

        let outcome = match &self.fallback {
            Some(fallback) => {
                match self
                    .transport
                    .send(&substitute(fallback, &message), &self.env, self.timeout)
                {
                    Ok(()) => DispatchOutcome::Delivered(Route::Fallback),
                    Err(e) => DispatchOutcome::Failed(format!("{}; fallback: {}", primary_err, e)),
                }
            }
            None => DispatchOutcome::Failed(primary_err),
        };

        match &outcome {
            DispatchOutcome::Delivered(_) => {
                METRICS.notifications.with_label_values(&[kind, "fallback"]).inc();
            }
            _ => {
                log::error!("Notification not delivered, message was: {}", message);
                METRICS.notifications.with_label_values(&[kind, "failed"]).inc();
            }
        }
        outcome
    }

    /// Deliver on a blocking task. Returns `None` when nothing would be sent.
    pub fn dispatch(self: &Arc<Self>, event: NotificationEvent) -> Option<JoinHandle<DispatchOutcome>> {
        if !self.enabled {
            return None;
        }
        if !self.allow.contains(&event.event_type) {
            self.deliver(&event);
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::task::spawn_blocking(move || this.deliver(&event)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    fn settings(events: &[EventType]) -> NotificationSettings {
        NotificationSettings {
            enabled: true,
            events: events.iter().copied().collect(),
            primary: vec!["openclaw".into(), "send".into(), "--text".into(), "{message}".into()],
            fallback: Some(vec!["logger".into(), "-t".into(), "guardian".into()]),
            ..NotificationSettings::default()
        }
    }

    fn crash_event() -> NotificationEvent {
        NotificationEvent::new(EventType::ProcessCrash, "procB", "killed by signal 9")
    }

    #[test]
    fn filtered_event_never_reaches_transport() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::with_env(
            &settings(&[EventType::GuardianStartup]),
            BTreeMap::new(),
            transport.clone(),
        );

        assert_eq!(dispatcher.deliver(&crash_event()), DispatchOutcome::Filtered);
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn disabled_dispatcher_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let mut s = settings(&EventType::ALL);
        s.enabled = false;
        let dispatcher = Dispatcher::with_env(&s, BTreeMap::new(), transport.clone());

        assert_eq!(dispatcher.deliver(&crash_event()), DispatchOutcome::Disabled);
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn placeholder_is_substituted() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::with_env(
            &settings(&[EventType::ProcessCrash]),
            BTreeMap::new(),
            transport.clone(),
        );

        let event = crash_event();
        assert_eq!(dispatcher.deliver(&event), DispatchOutcome::Delivered(Route::Primary));

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls[0][..3], ["openclaw", "send", "--text"]);
        assert_eq!(calls[0][3], event.render());
        assert!(calls[0][3].starts_with("[guardian] process_crash procB: killed by signal 9 ("));
    }

    #[test]
    fn primary_failure_falls_back_once() {
        let transport = Arc::new(RecordingTransport::failing(&["openclaw"]));
        let dispatcher = Dispatcher::with_env(
            &settings(&[EventType::ProcessCrash]),
            BTreeMap::new(),
            transport.clone(),
        );

        assert_eq!(dispatcher.deliver(&crash_event()), DispatchOutcome::Delivered(Route::Fallback));
        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        // No placeholder in the fallback: message appended
        assert_eq!(calls[1][..3], ["logger", "-t", "guardian"]);
        assert_eq!(calls[1].len(), 4);
    }

    #[test]
    fn both_channels_failing_is_reported_not_retried() {
        let transport = Arc::new(RecordingTransport::failing(&["openclaw", "logger"]));
        let dispatcher = Dispatcher::with_env(
            &settings(&[EventType::ProcessCrash]),
            BTreeMap::new(),
            transport.clone(),
        );

        assert!(matches!(dispatcher.deliver(&crash_event()), DispatchOutcome::Failed(_)));
        assert_eq!(transport.call_count(), 2);
    }

    #[test]
    fn forwarded_credentials_reach_the_transport() {
        let mut explicit = BTreeMap::new();
        explicit.insert("OPENCLAW_PROFILE".to_string(), "ops".to_string());
        let forward = vec!["OPENCLAW_TOKEN".to_string(), "UNSET_VAR".to_string()];

        let env = resolve_env(&forward, &explicit, |name| {
            (name == "OPENCLAW_TOKEN").then(|| "secret".to_string())
        });
        assert_eq!(env.get("OPENCLAW_TOKEN").map(String::as_str), Some("secret"));
        assert_eq!(env.get("OPENCLAW_PROFILE").map(String::as_str), Some("ops"));
        assert!(!env.contains_key("UNSET_VAR"));

        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::with_env(&settings(&EventType::ALL), env, transport.clone());
        dispatcher.deliver(&crash_event());
        assert_eq!(
            transport.envs.lock().unwrap()[0].get("OPENCLAW_TOKEN").map(String::as_str),
            Some("secret")
        );
    }

    #[tokio::test]
    async fn dispatch_runs_off_the_caller() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Arc::new(Dispatcher::with_env(
            &settings(&[EventType::ProcessCrash]),
            BTreeMap::new(),
            transport.clone(),
        ));

        let handle = dispatcher.dispatch(crash_event()).unwrap();
        assert_eq!(handle.await.unwrap(), DispatchOutcome::Delivered(Route::Primary));
        assert!(dispatcher
            .dispatch(NotificationEvent::new(EventType::GuardianStartup, "guardian", "up"))
            .is_none());
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn command_transport_reports_exit_status() {
        let env = BTreeMap::new();
        let timeout = Duration::from_secs(5);
        assert!(CommandTransport.send(&["true".to_string()], &env, timeout).is_ok());
        assert!(CommandTransport.send(&["false".to_string()], &env, timeout).is_err());
        assert!(CommandTransport
            .send(&["/nonexistent/notify".to_string()], &env, timeout)
            .is_err());
    }

    #[test]
    fn command_transport_times_out() {
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let err = CommandTransport
            .send(&argv, &BTreeMap::new(), Duration::from_millis(100))
            .unwrap_err();
        assert!(err.contains("timed out"));
    }
}
