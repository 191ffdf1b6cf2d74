//! I/O helpers for the contract loop.

pub mod attempt_log;
pub mod checkpoint;
pub mod config;
pub mod process;
pub mod tool;
pub mod workspace;
