#[allow(clippy::module_inception)]
mod cli;
pub mod commands;

pub use cli::{Command, CommandArgs};
