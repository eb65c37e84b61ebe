use prometheus::{
    Encoder, GaugeVec, CounterVec, Opts, Registry, TextEncoder,
    register_gauge_vec_with_registry, register_counter_vec_with_registry,
};
use lazy_static::lazy_static;
use std::sync::Arc;

use crate::state::StatusRow;
use crate::models::Lifecycle;

pub struct MetricsRegistry {
    registry: Registry,

    // Gauge metrics
    pub process_up: GaugeVec,
    pub process_health: GaugeVec,
    pub process_pid_info: GaugeVec,
    pub process_uptime: GaugeVec,

    // Counter metrics
    pub process_restarts: CounterVec,
    pub notifications: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let process_up = register_gauge_vec_with_registry!(
            Opts::new("guardian_process_up", "Process is running (1) or not (0)"),
            &["id", "kind"],
            registry
        ).expect("register guardian_process_up");

        let process_health = register_gauge_vec_with_registry!(
            Opts::new("guardian_process_health", "Last health classification (0 healthy, 1 degraded, 2 failed)"),
            &["id"],
            registry
        ).expect("register guardian_process_health");

        let process_pid_info = register_gauge_vec_with_registry!(
            Opts::new("guardian_process_pid_info", "Process PID information"),
            &["id", "pid"],
            registry
        ).expect("register guardian_process_pid_info");

        let process_uptime = register_gauge_vec_with_registry!(
            Opts::new("guardian_process_uptime_seconds", "Seconds since the tracked PID started"),
            &["id"],
            registry
        ).expect("register guardian_process_uptime_seconds");

        let process_restarts = register_counter_vec_with_registry!(
            Opts::new("guardian_process_restarts_total", "Automatic restarts scheduled"),
            &["id"],
            registry
        ).expect("register guardian_process_restarts_total");

        let notifications = register_counter_vec_with_registry!(
            Opts::new("guardian_notifications_total", "Notification dispatch outcomes"),
            &["event_type", "outcome"],
            registry
        ).expect("register guardian_notifications_total");

        Self {
            registry,
            process_up,
            process_health,
            process_pid_info,
            process_uptime,
            process_restarts,
            notifications,
        }
    }

    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// 用最新的状态行刷新 gauge
    pub fn observe(&self, rows: &[StatusRow]) {
        // PID 会变化，先清空旧标签
        self.process_pid_info.reset();

        for row in rows {
            let up = row.lifecycle == Lifecycle::Running;
            self.process_up
                .with_label_values(&[row.id.as_str(), row.kind.as_str()])
                .set(if up { 1.0 } else { 0.0 });

            if let Some(health) = row.health {
                self.process_health
                    .with_label_values(&[row.id.as_str()])
                    .set(health.as_gauge());
            }

            self.process_uptime
                .with_label_values(&[row.id.as_str()])
                .set(row.uptime_secs.unwrap_or(0) as f64);

            if let Some(pid) = row.pid {
                self.process_pid_info
                    .with_label_values(&[row.id.as_str(), &pid.to_string()])
                    .set(1.0);
            }
        }
    }
}

lazy_static! {
    pub static ref METRICS: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HealthClass;

    #[test]
    fn observe_renders_up_and_health() {
        let metrics = MetricsRegistry::new();
        metrics.observe(&[StatusRow {
            id: "oc-memory".to_string(),
            kind: "managed".to_string(),
            lifecycle: Lifecycle::Running,
            pid: Some(4242),
            health: Some(HealthClass::Degraded),
            restart_count: 0,
            last_exit_reason: None,
            last_seen_at: None,
            uptime_secs: Some(90),
        }]);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"guardian_process_up{id="oc-memory",kind="managed"} 1"#));
        assert!(text.contains(r#"guardian_process_health{id="oc-memory"} 1"#));
        assert!(text.contains(r#"pid="4242""#));
        assert!(text.contains(r#"guardian_process_uptime_seconds{id="oc-memory"} 90"#));
    }
}
