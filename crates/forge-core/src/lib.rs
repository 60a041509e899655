//! # forge-core
//!
//! Core types for the Forge agent execution orchestrator.
//!
//! Forge drives autonomous coding-agent sessions against tickets. Each
//! session is a bounded conversation with an LLM that can read and write
//! files, run allow-listed commands, and finish by pushing a branch and
//! opening a pull request.
//!
//! This crate holds what every other crate shares:
//! - The unified error type
//! - Execution, ticket and tool-context records
//! - Repository-level configuration (`.forge/config.toml`)
//! - Fail-open helpers for infrastructure side effects

mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::*;
pub use error::{ForgeError, Result};
pub use types::*;
