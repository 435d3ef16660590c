//! Binaries-side wiring for the bot supervisor: logging, app errors, paths,
//! CLI arguments and the commands every worker ships with.
//!
//! `bot-manager` (control process) and `bot-worker` (worker process) both
//! build on this library.

pub mod cli;
pub mod commands;
pub mod error;
pub mod logger;
pub mod paths;

#[cfg(test)]
mod tests;
