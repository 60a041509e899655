//! Core type definitions for Forge orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an execution
///
/// `pending -> running -> {completed | failed}`, with `paused` reachable
/// only from `running`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl ExecutionStatus {
    /// Completed and failed executions never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Workflow status of a ticket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Backlog,
    #[default]
    Todo,
    InProgress,
    InReview,
    Done,
    Cancelled,
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backlog => write!(f, "backlog"),
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in_progress"),
            Self::InReview => write!(f, "in_review"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backlog" => Ok(Self::Backlog),
            "todo" => Ok(Self::Todo),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "in_review" | "inreview" | "review" => Ok(Self::InReview),
            "done" => Ok(Self::Done),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid ticket status: {}", s)),
        }
    }
}

/// One run of an agent against a ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub ticket_id: String,
    /// Protocol name; resolved through the protocol registry
    pub protocol: String,
    /// Free-text instructions supplied alongside the ticket
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Iteration count at the last checkpoint
    #[serde(default)]
    pub checkpoint_step: Option<usize>,
    /// Opaque conversation snapshot written with the checkpoint
    #[serde(default)]
    pub checkpoint_data: Option<serde_json::Value>,
    /// Append-only progress log; replaced by the error text on failure
    #[serde(default)]
    pub execution_log: String,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        ticket_id: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ticket_id: ticket_id.into(),
            protocol: protocol.into(),
            prompt: None,
            status: ExecutionStatus::Pending,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            started_at: None,
            completed_at: None,
            checkpoint_step: None,
            checkpoint_data: None,
            execution_log: String::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A work item an agent executes against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    /// Human-facing identifier such as `T-1`; used in branch names
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ticket_type: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub status: TicketStatus,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionHistoryEntry>,
}

impl Ticket {
    pub fn new(
        id: impl Into<String>,
        identifier: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            identifier: identifier.into(),
            title: title.into(),
            description: String::new(),
            ticket_type: None,
            labels: Vec::new(),
            status: TicketStatus::Todo,
            assigned_agent: None,
            branch_name: None,
            pr_url: None,
            pr_number: None,
            execution_history: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }
}

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    Failed,
}

/// Summary of one execution appended to the ticket's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistoryEntry {
    pub execution_id: String,
    pub protocol: String,
    pub outcome: ExecutionOutcome,
    pub summary: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Change to an execution's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogUpdate {
    /// Append a line (a newline is inserted between entries)
    Append(String),
    /// Replace the whole log; used for the final failure message
    Replace(String),
}

impl LogUpdate {
    /// Apply the update to a log buffer
    pub fn apply(&self, log: &mut String) {
        match self {
            Self::Append(line) => {
                if !log.is_empty() {
                    log.push('\n');
                }
                log.push_str(line);
            }
            Self::Replace(text) => *log = text.clone(),
        }
    }
}

/// Partial update of an execution record; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checkpoint_step: Option<usize>,
    pub checkpoint_data: Option<serde_json::Value>,
    pub log: Option<LogUpdate>,
}

impl ExecutionPatch {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn log(update: LogUpdate) -> Self {
        Self {
            log: Some(update),
            ..Default::default()
        }
    }

    pub fn with_log(mut self, update: LogUpdate) -> Self {
        self.log = Some(update);
        self
    }

    /// Apply the patch to an execution record
    pub fn apply(&self, execution: &mut Execution) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some(tokens) = self.input_tokens {
            execution.input_tokens = tokens;
        }
        if let Some(tokens) = self.output_tokens {
            execution.output_tokens = tokens;
        }
        if let Some(cost) = self.cost_usd {
            execution.cost_usd = cost;
        }
        if let Some(at) = self.started_at {
            execution.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            execution.completed_at = Some(at);
        }
        if let Some(step) = self.checkpoint_step {
            execution.checkpoint_step = Some(step);
        }
        if let Some(data) = &self.checkpoint_data {
            execution.checkpoint_data = Some(data.clone());
        }
        if let Some(update) = &self.log {
            update.apply(&mut execution.execution_log);
        }
    }
}

/// Partial update of a ticket record; `None` fields are left untouched
///
/// `assigned_agent: Some(None)` clears the assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketPatch {
    pub status: Option<TicketStatus>,
    pub assigned_agent: Option<Option<String>>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
}

impl TicketPatch {
    pub fn clear_agent() -> Self {
        Self {
            assigned_agent: Some(None),
            ..Default::default()
        }
    }

    /// Apply the patch to a ticket record
    pub fn apply(&self, ticket: &mut Ticket) {
        if let Some(status) = self.status {
            ticket.status = status;
        }
        if let Some(agent) = &self.assigned_agent {
            ticket.assigned_agent = agent.clone();
        }
        if let Some(branch) = &self.branch_name {
            ticket.branch_name = Some(branch.clone());
        }
        if let Some(url) = &self.pr_url {
            ticket.pr_url = Some(url.clone());
        }
        if let Some(number) = self.pr_number {
            ticket.pr_number = Some(number);
        }
    }
}

/// Per-execution scratch state for the VCS workflow
///
/// Owned by exactly one running tool-use loop. Seeded from the ticket so a
/// retried session reuses the branch and pull request it already has.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub execution_id: String,
    pub ticket_id: String,
    pub ticket_identifier: String,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
}

impl ToolContext {
    pub fn new(
        execution_id: impl Into<String>,
        ticket_id: impl Into<String>,
        ticket_identifier: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            ticket_id: ticket_id.into(),
            ticket_identifier: ticket_identifier.into(),
            branch_name: None,
            pr_url: None,
            pr_number: None,
        }
    }

    /// Build a context for an execution, carrying over existing branch/PR state
    pub fn seeded(execution: &Execution, ticket: &Ticket) -> Self {
        Self {
            execution_id: execution.id.clone(),
            ticket_id: ticket.id.clone(),
            ticket_identifier: ticket.identifier.clone(),
            branch_name: ticket.branch_name.clone(),
            pr_url: ticket.pr_url.clone(),
            pr_number: ticket.pr_number,
        }
    }

    /// Whether a previous session already produced a branch or pull request
    pub fn has_existing_work(&self) -> bool {
        self.branch_name.is_some() || self.pr_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_round_trip_names() {
        assert_eq!("running".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Running);
        assert_eq!(ExecutionStatus::Paused.to_string(), "paused");
        assert!("exploded".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_ticket_status_aliases() {
        assert_eq!("review".parse::<TicketStatus>().unwrap(), TicketStatus::InReview);
        assert_eq!("canceled".parse::<TicketStatus>().unwrap(), TicketStatus::Cancelled);
    }

    #[test]
    fn test_log_update_append_and_replace() {
        let mut log = String::new();
        LogUpdate::Append("started".into()).apply(&mut log);
        LogUpdate::Append("iteration 1".into()).apply(&mut log);
        assert_eq!(log, "started\niteration 1");

        LogUpdate::Replace("boom".into()).apply(&mut log);
        assert_eq!(log, "boom");
    }

    #[test]
    fn test_execution_patch_leaves_unset_fields() {
        let mut execution = Execution::new("e-1", "t-1", "standard").with_prompt("do it");
        execution.input_tokens = 10;

        ExecutionPatch::status(ExecutionStatus::Running).apply(&mut execution);

        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.input_tokens, 10);
        assert_eq!(execution.prompt.as_deref(), Some("do it"));
    }

    #[test]
    fn test_ticket_patch_clears_agent() {
        let mut ticket = Ticket::new("t-1", "T-1", "Fix login");
        ticket.assigned_agent = Some("agent-7".into());

        TicketPatch::clear_agent().apply(&mut ticket);
        assert!(ticket.assigned_agent.is_none());

        // Default patch does not touch the assignment
        ticket.assigned_agent = Some("agent-8".into());
        TicketPatch::default().apply(&mut ticket);
        assert_eq!(ticket.assigned_agent.as_deref(), Some("agent-8"));
    }

    #[test]
    fn test_tool_context_seeded_from_ticket() {
        let execution = Execution::new("e-1", "t-1", "standard");
        let mut ticket = Ticket::new("t-1", "T-1", "Fix login").with_branch("forge/t-1/x");
        ticket.pr_number = Some(12);

        let ctx = ToolContext::seeded(&execution, &ticket);
        assert_eq!(ctx.branch_name.as_deref(), Some("forge/t-1/x"));
        assert_eq!(ctx.pr_number, Some(12));
        assert!(ctx.has_existing_work());

        let fresh = ToolContext::new("e-2", "t-2", "T-2");
        assert!(!fresh.has_existing_work());
    }

    #[test]
    fn test_ticket_deserializes_with_defaults() {
        let json = r#"{"id":"t-9","identifier":"T-9","title":"Add cache"}"#;
        let ticket: Ticket = serde_json::from_str(json).unwrap();
        assert_eq!(ticket.status, TicketStatus::Todo);
        assert!(ticket.labels.is_empty());
        assert!(ticket.execution_history.is_empty());
    }
}
