pub mod event;
pub mod process;
pub mod state;

pub use event::{EventType, NotificationEvent};
pub use process::{
    HealthCheck, MatchRule, ProcessConfig, ProcessInfo, ProcessKind, ReadyProbe, Readiness,
};
pub use state::{HealthClass, Lifecycle, ProcessState};
