/// Shared helpers for external commands and polling
pub mod command;
pub mod polling;

pub use command::{check_tool_installed, CommandBuilder, CommandOutput};
pub use polling::PollingConfig;
