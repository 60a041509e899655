//! # forge-orchestrator
//!
//! Drives agent executions from `pending` to a terminal state.
//!
//! The orchestrator owns the lifecycle: it admits executions through the
//! token rate limiter, seeds each session's tool context from the ticket,
//! builds the initial prompt, runs the tool-use loop with periodic
//! checkpoints, and records the outcome on both the execution and the
//! ticket.
//!
//! ## Key Pattern
//!
//! Status changes are computed by the pure [`transition`] function and then
//! persisted through the [`Store`] trait. Nothing else writes `status`.

mod orchestrator;
mod pricing;
mod prompt;
mod rate_limiter;
mod state_machine;
mod store;

pub use orchestrator::Orchestrator;
pub use pricing::{cost_usd, ModelPricing};
pub use prompt::build_initial_prompt;
pub use rate_limiter::{RateLimiterStatus, TokenRateLimiter, TokenWindow, WINDOW};
pub use state_machine::{transition, ExecutionEvent};
pub use store::{
    Decision, DecisionMatcher, DecisionQuery, KeywordDecisionMatcher, MemoryStore, NoDecisions,
    Store,
};
