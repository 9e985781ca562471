//! Side-effecting boundaries of the agent: oracle, browser, filesystem, processes.

pub mod artifacts;
pub mod bridge;
pub mod config;
pub mod driver;
pub mod oracle;
pub mod process;
pub mod prompt;
