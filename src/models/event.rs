use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Closed taxonomy of notification events.
///
/// These strings are what the `notifications.events` allow-list must contain;
/// anything else is rejected when the configuration loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProcessCrash,
    HealthCheckFailed,
    GuardianStartup,
    GuardianShutdown,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::ProcessCrash,
        EventType::HealthCheckFailed,
        EventType::GuardianStartup,
        EventType::GuardianShutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProcessCrash => "process_crash",
            EventType::HealthCheckFailed => "health_check_failed",
            EventType::GuardianStartup => "guardian_startup",
            EventType::GuardianShutdown => "guardian_shutdown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub event_type: EventType,
    pub process_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(event_type: EventType, process_id: &str, message: impl Into<String>) -> Self {
        Self {
            event_type,
            process_id: process_id.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// 渲染为传输层使用的消息文本
    pub fn render(&self) -> String {
        format!(
            "[guardian] {} {}: {} ({})",
            self.event_type,
            self.process_id,
            self.message,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}
