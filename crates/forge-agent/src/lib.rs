//! # forge-agent
//!
//! LLM client and tool execution for Forge agent sessions.
//!
//! This crate provides:
//! - Anthropic Messages API wire types and client (with retry/backoff)
//! - The protocol registry mapping protocol names to model + tool sets
//! - A context window manager that keeps outbound conversations under budget
//! - A sandbox for agent-issued file and shell operations
//! - Tool definitions and the tool-use loop driving a session
//!
//! ## Key Pattern
//!
//! The full conversation is always kept for checkpointing. Only the copy
//! sent to the model is compressed, so a resumed session sees exactly what
//! the original one did.

mod auth;
mod client;
mod context_window;
mod protocol;
mod sandbox;
pub mod summary;
mod tool_loop;
mod tools;
mod types;

pub use auth::api_key_from_env;
pub use client::{AnthropicClient, LlmClient};
pub use context_window::{
    estimate_message_tokens, estimate_tokens, ContextWindowManager, PreparedContext,
};
pub use protocol::{ProtocolConfig, ProtocolRegistry, ToolSet, DEFAULT_PROTOCOL};
pub use sandbox::{CommandOutput, Sandbox};
pub use tool_loop::{
    LoopControl, LoopObserver, LoopOutcome, LoopStop, NoopObserver, ToolHandler, ToolLoop,
    DEFAULT_MAX_ITERATIONS,
};
pub use tools::{tool_definitions, ToolExecutor, ToolOutcome};
pub use types::*;
