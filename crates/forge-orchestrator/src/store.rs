//! Persistence and decision lookup seams
//!
//! The orchestrator only needs point reads and partial updates by id, so the
//! `Store` trait is deliberately small. `MemoryStore` backs tests and the
//! CLI.

use async_trait::async_trait;
use forge_core::{
    Execution, ExecutionHistoryEntry, ExecutionPatch, ForgeError, Result, Ticket, TicketPatch,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;

/// Ticket and execution persistence
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_execution(&self, id: &str) -> Result<Execution>;

    /// Apply a patch and return the updated record
    async fn update_execution(&self, id: &str, patch: ExecutionPatch) -> Result<Execution>;

    async fn get_ticket(&self, id: &str) -> Result<Ticket>;

    /// Apply a patch and return the updated record
    async fn update_ticket(&self, id: &str, patch: TicketPatch) -> Result<Ticket>;

    async fn append_history(&self, ticket_id: &str, entry: ExecutionHistoryEntry) -> Result<()>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    executions: RwLock<HashMap<String, Execution>>,
    tickets: RwLock<HashMap<String, Ticket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_execution(&self, execution: Execution) {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution);
    }

    pub async fn insert_ticket(&self, ticket: Ticket) {
        self.tickets.write().await.insert(ticket.id.clone(), ticket);
    }

    pub async fn executions(&self) -> Vec<Execution> {
        self.executions.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_execution(&self, id: &str) -> Result<Execution> {
        self.executions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ForgeError::ExecutionNotFound(id.to_string()))
    }

    async fn update_execution(&self, id: &str, patch: ExecutionPatch) -> Result<Execution> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| ForgeError::ExecutionNotFound(id.to_string()))?;
        patch.apply(execution);
        Ok(execution.clone())
    }

    async fn get_ticket(&self, id: &str) -> Result<Ticket> {
        self.tickets
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ForgeError::TicketNotFound(id.to_string()))
    }

    async fn update_ticket(&self, id: &str, patch: TicketPatch) -> Result<Ticket> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets
            .get_mut(id)
            .ok_or_else(|| ForgeError::TicketNotFound(id.to_string()))?;
        patch.apply(ticket);
        Ok(ticket.clone())
    }

    async fn append_history(&self, ticket_id: &str, entry: ExecutionHistoryEntry) -> Result<()> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets
            .get_mut(ticket_id)
            .ok_or_else(|| ForgeError::TicketNotFound(ticket_id.to_string()))?;
        ticket.execution_history.push(entry);
        Ok(())
    }
}

/// A recorded architectural or product decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What the matcher sees of a ticket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionQuery {
    pub title: String,
    pub description: String,
    pub ticket_type: Option<String>,
    pub labels: Vec<String>,
}

impl DecisionQuery {
    pub fn from_ticket(ticket: &Ticket) -> Self {
        Self {
            title: ticket.title.clone(),
            description: ticket.description.clone(),
            ticket_type: ticket.ticket_type.clone(),
            labels: ticket.labels.clone(),
        }
    }
}

/// Finds prior decisions relevant to a ticket
#[async_trait]
pub trait DecisionMatcher: Send + Sync {
    async fn find_relevant(&self, query: &DecisionQuery, limit: usize) -> Result<Vec<Decision>>;
}

/// Matcher that never returns anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDecisions;

#[async_trait]
impl DecisionMatcher for NoDecisions {
    async fn find_relevant(&self, _query: &DecisionQuery, _limit: usize) -> Result<Vec<Decision>> {
        Ok(Vec::new())
    }
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "when", "should", "have", "are",
    "not", "all", "can", "will", "its", "our", "use",
];

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Word-overlap matcher over a fixed list of decisions
///
/// Each shared keyword scores one point; a ticket label or type matching a
/// decision tag scores three.
#[derive(Debug, Clone, Default)]
pub struct KeywordDecisionMatcher {
    decisions: Vec<Decision>,
}

impl KeywordDecisionMatcher {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self { decisions }
    }

    /// Load decisions from a JSON array file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let decisions: Vec<Decision> = serde_json::from_str(&content)?;
        Ok(Self::new(decisions))
    }

    fn score(
        &self,
        query_words: &HashSet<String>,
        query_tags: &HashSet<String>,
        decision: &Decision,
    ) -> usize {
        let decision_words = keywords(&format!("{} {}", decision.title, decision.summary));
        let word_score = decision_words.intersection(query_words).count();
        let tag_score = decision
            .tags
            .iter()
            .filter(|tag| query_tags.contains(&tag.to_lowercase()))
            .count()
            * 3;
        word_score + tag_score
    }
}

#[async_trait]
impl DecisionMatcher for KeywordDecisionMatcher {
    async fn find_relevant(&self, query: &DecisionQuery, limit: usize) -> Result<Vec<Decision>> {
        let query_words = keywords(&format!("{} {}", query.title, query.description));
        let query_tags: HashSet<String> = query
            .labels
            .iter()
            .chain(query.ticket_type.iter())
            .map(|tag| tag.to_lowercase())
            .collect();

        let mut scored: Vec<(usize, &Decision)> = self
            .decisions
            .iter()
            .map(|decision| (self.score(&query_words, &query_tags, decision), decision))
            .filter(|(score, _)| *score > 0)
            .collect();
        // Stable sort keeps file order among equal scores
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, decision)| decision.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::{ExecutionStatus, LogUpdate, TicketStatus};

    fn decisions() -> Vec<Decision> {
        vec![
            Decision {
                id: "d1".to_string(),
                title: "Use JWT for session tokens".to_string(),
                summary: "Authentication uses short-lived JWT access tokens".to_string(),
                tags: vec!["auth".to_string()],
            },
            Decision {
                id: "d2".to_string(),
                title: "Postgres for persistence".to_string(),
                summary: "All services store data in Postgres".to_string(),
                tags: vec!["database".to_string()],
            },
            Decision {
                id: "d3".to_string(),
                title: "Login page redirects".to_string(),
                summary: "After login, redirect to the dashboard".to_string(),
                tags: Vec::new(),
            },
        ]
    }

    #[tokio::test]
    async fn test_memory_store_patches() {
        let store = MemoryStore::new();
        store.insert_execution(Execution::new("e1", "t1", "standard")).await;
        store.insert_ticket(Ticket::new("t1", "T-1", "Fix login")).await;

        let updated = store
            .update_execution(
                "e1",
                ExecutionPatch::status(ExecutionStatus::Running)
                    .with_log(LogUpdate::Append("started".to_string())),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ExecutionStatus::Running);
        assert_eq!(updated.execution_log, "started");

        let ticket = store
            .update_ticket(
                "t1",
                TicketPatch {
                    status: Some(TicketStatus::InReview),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::InReview);
    }

    #[tokio::test]
    async fn test_memory_store_missing_records() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_execution("nope").await,
            Err(ForgeError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            store.update_ticket("nope", TicketPatch::clear_agent()).await,
            Err(ForgeError::TicketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_keyword_matcher_ranks_by_overlap() {
        let matcher = KeywordDecisionMatcher::new(decisions());
        let query = DecisionQuery {
            title: "Login fails after token refresh".to_string(),
            description: "Users are logged out when the JWT expires".to_string(),
            ticket_type: Some("bug".to_string()),
            labels: vec!["auth".to_string()],
        };

        let found = matcher.find_relevant(&query, 5).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d3"]);

        let found = matcher.find_relevant(&query, 1).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_no_decisions() {
        let found = NoDecisions
            .find_relevant(&DecisionQuery::default(), 5)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_matcher_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("decisions.json");
        std::fs::write(&path, serde_json::to_string(&decisions()).unwrap()).unwrap();

        let matcher = KeywordDecisionMatcher::from_json_file(&path).unwrap();
        assert_eq!(matcher.decisions.len(), 3);
    }
}
