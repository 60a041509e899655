//! # forge-vcs
//!
//! Version control layer for Forge agent sessions.
//!
//! This crate provides:
//! - Git command execution abstraction (real and scripted)
//! - The per-execution branch -> commit -> pull request workflow
//! - A code-hosting client for pushing work up for review

mod command;
mod hosting;
mod workflow;

pub use command::{GitCommand, GitExecutor, GitOutput, MockGitExecutor};
pub use hosting::{
    CodeHost, GitHubHost, MockCodeHost, NewPullRequest, PullRequest, PullRequestState,
    PullRequestStatus,
};
pub use workflow::{branch_name, slugify, BranchOutcome, CommitOutcome, VcsWorkflow};
