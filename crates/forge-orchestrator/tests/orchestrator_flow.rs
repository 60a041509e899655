//! End-to-end lifecycle tests with a scripted model, an in-memory store and
//! mock git/hosting backends.

use async_trait::async_trait;
use forge_agent::{
    ContentBlock, LlmClient, Message, MessageRequest, MessageResponse, Sandbox, StopReason, Usage,
};
use forge_core::{
    Execution, ExecutionOutcome, ExecutionStatus, ForgeConfig, ForgeError, Result, SandboxConfig,
    Ticket, TicketStatus,
};
use forge_orchestrator::{
    Decision, KeywordDecisionMatcher, MemoryStore, Orchestrator, Store,
};
use forge_vcs::{GitOutput, MockCodeHost, MockGitExecutor, VcsWorkflow};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct ScriptedClient {
    responses: Mutex<VecDeque<MessageResponse>>,
    requests: Mutex<Vec<MessageRequest>>,
    configured: bool,
}

impl ScriptedClient {
    fn new(responses: Vec<MessageResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            configured: true,
        })
    }

    fn unconfigured() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            configured: false,
        })
    }

    fn requests(&self) -> Vec<MessageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn send(&self, request: &MessageRequest) -> Result<MessageResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ForgeError::Api("script exhausted".to_string()))
    }

    fn is_configured(&self) -> bool {
        self.configured
    }
}

fn usage() -> Usage {
    Usage {
        input_tokens: 100,
        output_tokens: 50,
    }
}

fn tool_call(calls: &[(&str, Value)]) -> MessageResponse {
    let content = calls
        .iter()
        .enumerate()
        .map(|(i, (name, input))| ContentBlock::ToolUse {
            id: format!("toolu_{}_{}", name, i),
            name: name.to_string(),
            input: input.clone(),
        })
        .collect();
    MessageResponse {
        id: "msg".to_string(),
        content,
        stop_reason: Some(StopReason::ToolUse),
        usage: usage(),
    }
}

fn finish(text: &str) -> MessageResponse {
    MessageResponse {
        id: "msg_done".to_string(),
        content: vec![ContentBlock::text(text)],
        stop_reason: Some(StopReason::EndTurn),
        usage: usage(),
    }
}

struct Harness {
    _dir: TempDir,
    root: std::path::PathBuf,
    store: Arc<MemoryStore>,
    client: Arc<ScriptedClient>,
    git: MockGitExecutor,
    host: MockCodeHost,
    orchestrator: Orchestrator,
}

async fn harness(
    client: Arc<ScriptedClient>,
    ticket: Ticket,
    tune: impl FnOnce(&mut ForgeConfig),
) -> Harness {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();

    let mut config = ForgeConfig::default();
    config.sandbox = SandboxConfig {
        repo_root: dir.path().to_path_buf(),
        ..SandboxConfig::default()
    };
    config.rate_limit.min_gap_ms = 0;
    config.rate_limit.release_gap_ms = 0;
    tune(&mut config);

    let sandbox = Arc::new(Sandbox::new(&config.sandbox).unwrap());
    let root = sandbox.root().to_path_buf();
    let git = MockGitExecutor::new()
        .with_response("diff --cached --name-only", GitOutput::ok("src/login.rs\n"))
        .with_response("rev-parse HEAD", GitOutput::ok("abc1234\n"));
    let host = MockCodeHost::new();
    let vcs = VcsWorkflow::new(Arc::new(git.clone()), Arc::new(host.clone()));

    let store = Arc::new(MemoryStore::new());
    store.insert_ticket(ticket).await;
    store
        .insert_execution(Execution::new("e1", "t1", "standard").with_prompt("Fix the login bug"))
        .await;

    let orchestrator = Orchestrator::new(config, store.clone(), client.clone(), sandbox, vcs);

    Harness {
        _dir: dir,
        root,
        store,
        client,
        git,
        host,
        orchestrator,
    }
}

fn ticket() -> Ticket {
    Ticket::new("t1", "T-1", "Fix login").with_description("Login fails after a token refresh")
}

#[tokio::test]
async fn test_successful_execution_opens_pr_and_moves_ticket_to_review() {
    let client = ScriptedClient::new(vec![
        tool_call(&[
            ("create_branch", json!({"slug": "fix-login"})),
            ("write_file", json!({"path": "src/login.rs", "content": "pub fn login() {}\n"})),
        ]),
        tool_call(&[("commit_changes", json!({"message": "Fix login"}))]),
        tool_call(&[("create_pull_request", json!({"title": "Fix login", "body": "Fixes T-1"}))]),
        finish("Fixed the login refresh bug and opened a pull request."),
    ]);
    let h = harness(client, ticket(), |_| {}).await;

    let handle = h.orchestrator.start_execution("e1").unwrap();
    handle.await.unwrap().unwrap();

    let execution = h.store.get_execution("e1").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.input_tokens, 400);
    assert_eq!(execution.output_tokens, 200);
    assert!(execution.cost_usd > 0.0);
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());
    assert!(execution.execution_log.contains("Completed after 4 iteration(s)"));
    assert!(execution.execution_log.contains("create_branch ok"));

    let ticket = h.store.get_ticket("t1").await.unwrap();
    assert_eq!(ticket.status, TicketStatus::InReview);
    assert_eq!(ticket.assigned_agent, None);
    assert_eq!(ticket.branch_name.as_deref(), Some("forge/t-1/fix-login"));
    assert_eq!(ticket.pr_url.as_deref(), Some("https://example.test/pulls/1"));
    assert_eq!(ticket.pr_number, Some(1));

    assert_eq!(ticket.execution_history.len(), 1);
    let entry = &ticket.execution_history[0];
    assert_eq!(entry.outcome, ExecutionOutcome::Completed);
    assert_eq!(entry.total_tokens, 600);
    assert_eq!(entry.pr_url.as_deref(), Some("https://example.test/pulls/1"));
    assert!(entry.summary.starts_with("Fixed the login refresh bug"));

    assert!(h.root.join("src/login.rs").exists());
    assert_eq!(h.host.created().len(), 1);
    assert_eq!(h.host.created()[0].head, "forge/t-1/fix-login");
    // The commit happened on the session branch and the repo is back on main
    assert!(h.git.calls().contains(&"checkout forge/t-1/fix-login".to_string()));
    assert_eq!(h.git.current_branch(), "main");
    assert!(h.git.calls().contains(&"push -u origin forge/t-1/fix-login".to_string()));

    let status = h.orchestrator.rate_limiter().status();
    assert_eq!(status.window_tokens, 600);
    assert_eq!(status.queue_depth, 0);
}

#[tokio::test]
async fn test_failed_execution_keeps_ticket_status() {
    let client = ScriptedClient::new(vec![tool_call(&[(
        "create_branch",
        json!({"slug": "fix-login"}),
    )])]);
    let h = harness(client, ticket(), |_| {}).await;

    let result = h.orchestrator.run_execution("e1").await;
    assert!(matches!(result, Err(ForgeError::Api(_))));

    let execution = h.store.get_execution("e1").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.execution_log.contains("script exhausted"));
    assert!(!execution.execution_log.contains("create_branch"));
    assert_eq!(execution.input_tokens, 100);

    let ticket = h.store.get_ticket("t1").await.unwrap();
    assert_eq!(ticket.status, TicketStatus::Todo);
    assert_eq!(ticket.assigned_agent, None);
    // The branch was recorded as soon as it was created
    assert_eq!(ticket.branch_name.as_deref(), Some("forge/t-1/fix-login"));
    assert_eq!(ticket.execution_history.len(), 1);
    assert_eq!(ticket.execution_history[0].outcome, ExecutionOutcome::Failed);
    assert_eq!(
        ticket.execution_history[0].branch_name.as_deref(),
        Some("forge/t-1/fix-login")
    );

    // Actual usage replaced the admission reservation
    assert_eq!(h.orchestrator.rate_limiter().status().window_tokens, 150);
}

#[tokio::test]
async fn test_unconfigured_client_fails_fast() {
    let h = harness(ScriptedClient::unconfigured(), ticket(), |_| {}).await;

    assert!(!h.orchestrator.check_health());
    let result = h.orchestrator.start_execution("e1");
    assert!(matches!(result, Err(ForgeError::Config(_))));

    let execution = h.store.get_execution("e1").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert!(h.client.requests().is_empty());
}

#[tokio::test]
async fn test_retried_session_reuses_existing_branch() {
    let client = ScriptedClient::new(vec![
        tool_call(&[("create_branch", json!({"slug": "another-name"}))]),
        finish("Continued on the existing branch."),
    ]);
    let h = harness(client, ticket().with_branch("forge/t-1/x"), |_| {}).await;

    h.orchestrator.run_execution("e1").await.unwrap();

    assert!(!h.git.calls().iter().any(|call| call.starts_with("branch ")));

    let requests = h.client.requests();
    let first = requests[0].messages[0].text();
    assert!(first.contains("Existing work (do not duplicate)"));
    assert!(first.contains("forge/t-1/x"));
    assert!(first.contains("Fix the login bug"));

    let second = &requests[1].messages;
    let result = second.last().unwrap();
    assert!(matches!(
        &result.content[0],
        ContentBlock::ToolResult { content, is_error: false, .. }
            if content.contains("earlier session")
    ));

    let ticket = h.store.get_ticket("t1").await.unwrap();
    assert_eq!(ticket.branch_name.as_deref(), Some("forge/t-1/x"));
    // No pull request, so the workflow status is unchanged
    assert_eq!(ticket.status, TicketStatus::Todo);
}

#[tokio::test]
async fn test_checkpoints_are_written_every_interval() {
    let client = ScriptedClient::new(vec![
        tool_call(&[("list_directory", json!({}))]),
        tool_call(&[("list_directory", json!({"path": "src"}))]),
        tool_call(&[("read_file", json!({"path": "missing.rs"}))]),
        finish("Done."),
    ]);
    let h = harness(client, ticket(), |config| {
        config.orchestrator.checkpoint_interval = 2;
    })
    .await;

    h.orchestrator.run_execution("e1").await.unwrap();

    let execution = h.store.get_execution("e1").await.unwrap();
    assert_eq!(execution.checkpoint_step, Some(4));
    let messages: Vec<Message> =
        serde_json::from_value(execution.checkpoint_data.unwrap()).unwrap();
    // Prompt, three tool rounds, final answer
    assert_eq!(messages.len(), 8);
    assert!(execution.execution_log.contains("read_file failed"));
}

#[tokio::test]
async fn test_resume_without_live_loop_restarts_from_checkpoint() {
    let client = ScriptedClient::new(vec![finish("Picked up where I left off.")]);
    let h = harness(client, ticket(), |_| {}).await;

    let checkpoint = vec![
        Message::user("Original prompt"),
        Message::assistant(vec![ContentBlock::ToolUse {
            id: "toolu_1".to_string(),
            name: "list_directory".to_string(),
            input: json!({}),
        }]),
        Message::tool_results(vec![ContentBlock::tool_result("toolu_1", "src/", false)]),
    ];
    let mut execution = Execution::new("e2", "t1", "standard");
    execution.status = ExecutionStatus::Paused;
    execution.input_tokens = 1_000;
    execution.output_tokens = 100;
    execution.checkpoint_step = Some(5);
    execution.checkpoint_data = Some(serde_json::to_value(&checkpoint).unwrap());
    h.store.insert_execution(execution).await;

    let handle = h.orchestrator.resume("e2").await.unwrap().unwrap();
    handle.await.unwrap().unwrap();

    let requests = h.client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].messages, checkpoint);

    let execution = h.store.get_execution("e2").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.input_tokens, 1_100);
    assert_eq!(execution.output_tokens, 150);
    assert!(execution
        .execution_log
        .contains("Resumed from checkpoint at iteration 5"));
    assert!(execution.execution_log.contains("Completed after 6 iteration(s)"));
}

#[tokio::test]
async fn test_cancel_without_live_loop_records_failure() {
    let h = harness(ScriptedClient::new(Vec::new()), ticket(), |_| {}).await;

    h.orchestrator.cancel("e1").await.unwrap();

    let execution = h.store.get_execution("e1").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.execution_log.contains("cancelled"));

    let ticket = h.store.get_ticket("t1").await.unwrap();
    assert_eq!(ticket.execution_history.len(), 1);
    assert_eq!(ticket.execution_history[0].outcome, ExecutionOutcome::Failed);

    // Terminal executions cannot be cancelled or paused again
    assert!(matches!(
        h.orchestrator.cancel("e1").await,
        Err(ForgeError::InvalidTransition(_))
    ));
    assert!(h.orchestrator.pause("e1").await.is_err());
}

#[tokio::test]
async fn test_pause_and_resume_live_loop() {
    let client = ScriptedClient::new(vec![
        tool_call(&[("list_directory", json!({}))]),
        finish("Done after the pause."),
    ]);
    let h = harness(client, ticket(), |_| {}).await;

    // Pausing requires a running execution
    assert!(matches!(
        h.orchestrator.pause("e1").await,
        Err(ForgeError::InvalidTransition(_))
    ));

    let handle = h.orchestrator.start_execution("e1").unwrap();
    let orchestrator = h.orchestrator.clone();
    let store = h.store.clone();

    // Pause as soon as the execution is running, then resume it
    let controller = tokio::spawn(async move {
        loop {
            let execution = store.get_execution("e1").await.unwrap();
            if execution.status == ExecutionStatus::Running {
                break;
            }
            if execution.status.is_terminal() {
                return false;
            }
            tokio::task::yield_now().await;
        }
        orchestrator.pause("e1").await.unwrap();
        assert_eq!(
            store.get_execution("e1").await.unwrap().status,
            ExecutionStatus::Paused
        );
        assert!(orchestrator.resume("e1").await.unwrap().is_none());
        true
    });

    let paused_while_running = controller.await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(paused_while_running);

    let execution = h.store.get_execution("e1").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.execution_log.contains("Paused"));
    assert!(execution.execution_log.contains("Resumed"));
}

#[tokio::test]
async fn test_queue_full_returns_execution_to_pending() {
    let h = harness(ScriptedClient::new(Vec::new()), ticket(), |config| {
        config.rate_limit.max_queue_size = 0;
    })
    .await;

    let result = h.orchestrator.run_execution("e1").await;
    let error = result.unwrap_err();
    assert!(matches!(error, ForgeError::QueueFull { .. }));
    assert!(error.is_retryable());

    let execution = h.store.get_execution("e1").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert!(execution.execution_log.contains("queue full"));
    assert!(h.client.requests().is_empty());

    let ticket = h.store.get_ticket("t1").await.unwrap();
    assert!(ticket.execution_history.is_empty());
    assert_eq!(ticket.assigned_agent, None);
}

#[tokio::test]
async fn test_relevant_decisions_reach_the_prompt() {
    let client = ScriptedClient::new(vec![finish("Nothing to change.")]);
    let h = harness(client, ticket().with_labels(vec!["auth".to_string()]), |_| {}).await;
    let orchestrator = h.orchestrator.clone().with_decisions(Arc::new(
        KeywordDecisionMatcher::new(vec![Decision {
            id: "d1".to_string(),
            title: "Token refresh happens client-side".to_string(),
            summary: "The SPA refreshes tokens before expiry".to_string(),
            tags: vec!["auth".to_string()],
        }]),
    ));

    orchestrator.run_execution("e1").await.unwrap();

    let first = h.client.requests()[0].messages[0].text();
    assert!(first.contains("## Relevant prior decisions"));
    assert!(first.contains("Token refresh happens client-side"));

    let request = &h.client.requests()[0];
    assert_eq!(request.model, "claude-sonnet-4-5-20250929");
    assert!(request.system.is_some());
    assert_eq!(request.tools.len(), 8);
}
