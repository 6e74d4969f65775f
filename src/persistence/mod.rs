//! # Persistence Module
//!
//! ## Why This Module Exists
//! The control-link core treats storage as two opaque collaborator services:
//! a key/value settings store the shell uses to restore the last endpoint
//! across sessions, and a command log fed with every transmitted line for
//! audit and history. This module provides both behind the exact interfaces
//! the core is written against, so neither the link nor the dispatcher knows
//! where the data lives.
//!
//! ## Error Handling Strategy
//! File operations use `color_eyre` for rich context. A missing or corrupt
//! settings file degrades to an empty store instead of failing startup, and
//! the log sink never blocks or fails the send path: a busy log drops the
//! entry and says so in the logs.

pub mod command_log;
pub mod settings_store;

pub use command_log::{CommandLog, LogEntry};
pub use settings_store::SettingsStore;
