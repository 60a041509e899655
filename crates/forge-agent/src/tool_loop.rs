//! Tool-use loop
//!
//! Drives one session: send the conversation, execute any requested tools,
//! append their results, and repeat until the model stops asking for tools
//! or the iteration bound is reached.
//!
//! Observers see every tool call and every iteration but cannot change the
//! loop's control flow. Pause and cancel arrive on a watch channel and are
//! honoured between iterations.

use crate::client::LlmClient;
use crate::context_window::ContextWindowManager;
use crate::tools::ToolOutcome;
use crate::types::{ContentBlock, Message, MessageRequest, StopReason, ToolDefinition, Usage};
use async_trait::async_trait;
use forge_core::{ContextConfig, ForgeError, Result, ToolContext};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Iteration bound for generic use
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

const DEFAULT_MAX_TOKENS: usize = 8192;

/// Cooperative control signal for a running loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Run,
    Pause,
    Cancel,
}

/// Executes one tool call
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, ctx: &mut ToolContext, name: &str, input: &Value) -> ToolOutcome;
}

/// Callbacks on loop progress
///
/// Implementations handle their own errors; nothing they do reaches the loop.
#[async_trait]
pub trait LoopObserver: Send + Sync {
    /// Called after each tool call
    async fn on_tool_use(
        &self,
        _ctx: &ToolContext,
        _name: &str,
        _input: &Value,
        _outcome: &ToolOutcome,
    ) {
    }

    /// Called after each completed iteration with the usage so far and the full history
    async fn on_iteration(&self, _iteration: usize, _usage: &Usage, _messages: &[Message]) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl LoopObserver for NoopObserver {}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The model finished its turn
    EndTurn,
    /// The model hit its output token limit
    MaxTokens,
    /// The iteration bound was reached
    MaxIterations,
}

/// Result of a loop run
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Text of the last assistant message
    pub final_text: String,
    /// Full, uncompressed history
    pub messages: Vec<Message>,
    /// Iterations completed, including any before a resume
    pub iterations: usize,
    /// Usage accumulated during this run
    pub usage: Usage,
    pub stop: LoopStop,
}

/// Request/response/tool cycle against an LLM client
pub struct ToolLoop {
    client: Arc<dyn LlmClient>,
    context: ContextWindowManager,
    model: String,
    max_tokens: usize,
    system: Option<String>,
    tools: Vec<ToolDefinition>,
    max_iterations: usize,
    control: Option<watch::Receiver<LoopControl>>,
}

impl ToolLoop {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            context: ContextWindowManager::new(ContextConfig::default()),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            system: None,
            tools: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            control: None,
        }
    }

    pub fn with_context_manager(mut self, context: ContextWindowManager) -> Self {
        self.context = context;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        self.system = (!system.is_empty()).then_some(system);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_control(mut self, control: watch::Receiver<LoopControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Run a fresh session from `history`
    pub async fn run(
        &self,
        history: Vec<Message>,
        ctx: &mut ToolContext,
        handler: &dyn ToolHandler,
        observer: &dyn LoopObserver,
    ) -> Result<LoopOutcome> {
        self.resume(history, 0, ctx, handler, observer).await
    }

    /// Continue a session whose first `completed` iterations are already in `history`
    pub async fn resume(
        &self,
        history: Vec<Message>,
        completed: usize,
        ctx: &mut ToolContext,
        handler: &dyn ToolHandler,
        observer: &dyn LoopObserver,
    ) -> Result<LoopOutcome> {
        let mut messages = history;
        let mut usage = Usage::default();
        let mut iteration = completed;
        let mut final_text = String::new();
        let mut control = self.control.clone();

        let stop = loop {
            if iteration >= self.max_iterations {
                info!(
                    "[{}] reached iteration limit ({})",
                    ctx.execution_id, self.max_iterations
                );
                break LoopStop::MaxIterations;
            }

            if let Some(control) = control.as_mut() {
                wait_until_running(control, &ctx.execution_id).await?;
            }

            let prepared = self.context.prepare(&messages);
            let request = MessageRequest {
                model: self.model.clone(),
                max_tokens: self.max_tokens,
                system: self.system.clone(),
                messages: prepared.messages,
                tools: self.tools.clone(),
            };

            let response = self.client.send(&request).await?;
            iteration += 1;
            usage.add(response.usage);

            let assistant = Message::assistant(response.content);
            final_text = assistant.text();
            let tool_calls: Vec<(String, String, Value)> = assistant
                .tool_uses()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            messages.push(assistant);

            debug!(
                "[{}] iteration {}: {:?}, {} tool call(s)",
                ctx.execution_id,
                iteration,
                response.stop_reason,
                tool_calls.len()
            );

            if response.stop_reason == Some(StopReason::ToolUse) && !tool_calls.is_empty() {
                let mut results = Vec::with_capacity(tool_calls.len());
                for (id, name, input) in tool_calls {
                    let outcome = handler.handle(ctx, &name, &input).await;
                    observer.on_tool_use(ctx, &name, &input, &outcome).await;
                    results.push(ContentBlock::tool_result(id, outcome.content, outcome.is_error));
                }
                messages.push(Message::tool_results(results));
                observer.on_iteration(iteration, &usage, &messages).await;
                continue;
            }

            observer.on_iteration(iteration, &usage, &messages).await;
            break match response.stop_reason {
                Some(StopReason::MaxTokens) => LoopStop::MaxTokens,
                _ => LoopStop::EndTurn,
            };
        };

        info!(
            "[{}] loop finished after {} iteration(s): {:?} ({} input, {} output tokens)",
            ctx.execution_id, iteration, stop, usage.input_tokens, usage.output_tokens
        );

        Ok(LoopOutcome {
            final_text,
            messages,
            iterations: iteration,
            usage,
            stop,
        })
    }
}

/// Block while paused; fail on cancel
async fn wait_until_running(
    control: &mut watch::Receiver<LoopControl>,
    execution_id: &str,
) -> Result<()> {
    loop {
        let state = *control.borrow_and_update();
        match state {
            LoopControl::Run => return Ok(()),
            LoopControl::Cancel => {
                return Err(ForgeError::Cancelled(format!(
                    "execution {} was cancelled",
                    execution_id
                )))
            }
            LoopControl::Pause => {
                info!("[{}] paused", execution_id);
                if control.changed().await.is_err() {
                    return Err(ForgeError::Cancelled(format!(
                        "control for execution {} closed while paused",
                        execution_id
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageResponse;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<MessageResponse>>,
        requests: Mutex<Vec<MessageRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<MessageResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
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
            true
        }
    }

    fn tool_response(id: &str, name: &str) -> MessageResponse {
        MessageResponse {
            id: format!("msg_{}", id),
            content: vec![
                ContentBlock::text("Checking"),
                ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: json!({"path": "src/lib.rs"}),
                },
            ],
            stop_reason: Some(StopReason::ToolUse),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 10,
            },
        }
    }

    fn final_response(text: &str) -> MessageResponse {
        MessageResponse {
            id: "msg_final".to_string(),
            content: vec![ContentBlock::text(text)],
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage {
                input_tokens: 200,
                output_tokens: 20,
            },
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn handle(&self, _ctx: &mut ToolContext, name: &str, _input: &Value) -> ToolOutcome {
            if name == "broken" {
                ToolOutcome::error("boom")
            } else {
                ToolOutcome::ok(format!("ran {}", name))
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        tools: Mutex<Vec<String>>,
        iterations: Mutex<Vec<(usize, u64)>>,
    }

    #[async_trait]
    impl LoopObserver for RecordingObserver {
        async fn on_tool_use(
            &self,
            _ctx: &ToolContext,
            name: &str,
            _input: &Value,
            _outcome: &ToolOutcome,
        ) {
            self.tools.lock().unwrap().push(name.to_string());
        }

        async fn on_iteration(&self, iteration: usize, usage: &Usage, _messages: &[Message]) {
            self.iterations.lock().unwrap().push((iteration, usage.total()));
        }
    }

    fn context() -> ToolContext {
        ToolContext::new("exec-1", "ticket-1", "T-1")
    }

    #[tokio::test]
    async fn test_runs_tools_until_end_turn() {
        let client = ScriptedClient::new(vec![
            tool_response("tu_1", "read_file"),
            tool_response("tu_2", "broken"),
            final_response("All done"),
        ]);
        let tool_loop = ToolLoop::new(client.clone(), "model");
        let observer = RecordingObserver::default();

        let outcome = tool_loop
            .run(vec![Message::user("Fix it")], &mut context(), &EchoHandler, &observer)
            .await
            .unwrap();

        assert_eq!(outcome.stop, LoopStop::EndTurn);
        assert_eq!(outcome.final_text, "All done");
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.usage.input_tokens, 400);
        assert_eq!(outcome.usage.output_tokens, 40);
        // user, (assistant, results) x2, assistant
        assert_eq!(outcome.messages.len(), 6);

        match &outcome.messages[4].content[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "tu_2");
                assert_eq!(content, "boom");
                assert!(*is_error);
            }
            other => panic!("unexpected block: {:?}", other),
        }

        assert_eq!(*observer.tools.lock().unwrap(), vec!["read_file", "broken"]);
        assert_eq!(
            *observer.iterations.lock().unwrap(),
            vec![(1, 110), (2, 220), (3, 440)]
        );
        assert_eq!(client.request_count(), 3);
    }

    #[tokio::test]
    async fn test_stops_at_iteration_limit() {
        let client = ScriptedClient::new(vec![
            tool_response("tu_1", "read_file"),
            tool_response("tu_2", "read_file"),
            tool_response("tu_3", "read_file"),
        ]);
        let tool_loop = ToolLoop::new(client.clone(), "model").with_max_iterations(2);

        let outcome = tool_loop
            .run(vec![Message::user("Loop")], &mut context(), &EchoHandler, &NoopObserver)
            .await
            .unwrap();

        assert_eq!(outcome.stop, LoopStop::MaxIterations);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn test_resume_counts_prior_iterations() {
        let client = ScriptedClient::new(vec![final_response("Finished")]);
        let tool_loop = ToolLoop::new(client.clone(), "model").with_max_iterations(5);

        let history = vec![
            Message::user("Task"),
            Message::assistant(vec![ContentBlock::text("Working")]),
            Message::user("Continue"),
        ];
        let outcome = tool_loop
            .resume(history, 4, &mut context(), &EchoHandler, &NoopObserver)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.messages.len(), 4);

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[0].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_client_error_propagates() {
        let client = ScriptedClient::new(Vec::new());
        let tool_loop = ToolLoop::new(client, "model");

        let result = tool_loop
            .run(vec![Message::user("Task")], &mut context(), &EchoHandler, &NoopObserver)
            .await;
        assert!(matches!(result, Err(ForgeError::Api(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_next_iteration() {
        let client = ScriptedClient::new(vec![final_response("never")]);
        let (_tx, rx) = watch::channel(LoopControl::Cancel);
        let tool_loop = ToolLoop::new(client.clone(), "model").with_control(rx);

        let result = tool_loop
            .run(vec![Message::user("Task")], &mut context(), &EchoHandler, &NoopObserver)
            .await;

        assert!(matches!(result, Err(ForgeError::Cancelled(_))));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let client = ScriptedClient::new(vec![final_response("Resumed")]);
        let (tx, rx) = watch::channel(LoopControl::Pause);
        let tool_loop = ToolLoop::new(client.clone(), "model").with_control(rx);
        let mut ctx = context();

        let run = tool_loop.run(vec![Message::user("Task")], &mut ctx, &EchoHandler, &NoopObserver);
        let unpause = async {
            tokio::task::yield_now().await;
            assert_eq!(client.request_count(), 0);
            tx.send(LoopControl::Run).unwrap();
        };

        let (result, _) = tokio::join!(run, unpause);
        let outcome = result.unwrap();
        assert_eq!(outcome.final_text, "Resumed");
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn test_request_carries_system_and_tools() {
        let client = ScriptedClient::new(vec![final_response("ok")]);
        let tool_loop = ToolLoop::new(client.clone(), "claude-test")
            .with_system("Be careful")
            .with_tools(crate::tools::tool_definitions())
            .with_max_tokens(1234);

        tool_loop
            .run(vec![Message::user("Task")], &mut context(), &EchoHandler, &NoopObserver)
            .await
            .unwrap();

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[0].model, "claude-test");
        assert_eq!(requests[0].max_tokens, 1234);
        assert_eq!(requests[0].system.as_deref(), Some("Be careful"));
        assert_eq!(requests[0].tools.len(), 8);
    }
}
