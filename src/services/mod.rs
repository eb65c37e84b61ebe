pub mod controller;
pub mod health;
pub mod launcher;
pub mod lock;
pub mod notifier;
pub mod process_table;
pub mod readiness;

pub use launcher::OsLauncher;
pub use notifier::{CommandTransport, Dispatcher};
pub use process_table::SysinfoSource;
