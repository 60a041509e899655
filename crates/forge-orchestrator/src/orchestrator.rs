//! Execution lifecycle
//!
//! The orchestrator wires the long-lived services together for each
//! execution:
//!
//! 1. Load the execution and its ticket, move to `running`
//! 2. Wait for rate-limiter admission
//! 3. Seed the tool context from the ticket and build the first message
//! 4. Run the tool-use loop, checkpointing every few iterations
//! 5. Record usage and cost, then update the execution and the ticket
//!
//! Each running session registers a control channel so `pause`, `resume`
//! and `cancel` reach the loop between iterations.

use crate::pricing::cost_usd;
use crate::prompt::build_initial_prompt;
use crate::rate_limiter::TokenRateLimiter;
use crate::state_machine::{transition, ExecutionEvent};
use crate::store::{DecisionMatcher, DecisionQuery, NoDecisions, Store};
use async_trait::async_trait;
use chrono::Utc;
use forge_agent::{
    summary, ContextWindowManager, LlmClient, LoopControl, LoopObserver, LoopOutcome, LoopStop,
    Message, ProtocolConfig, ProtocolRegistry, Sandbox, ToolExecutor, ToolLoop, ToolOutcome, Usage,
};
use forge_core::fail_open::{fail_open, fail_open_or};
use forge_core::{
    Execution, ExecutionHistoryEntry, ExecutionOutcome, ExecutionPatch, ExecutionStatus,
    ForgeConfig, ForgeError, LogUpdate, Result, Ticket, TicketPatch, TicketStatus, ToolContext,
};
use forge_vcs::VcsWorkflow;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const HISTORY_SUMMARY_CHARS: usize = 500;
const LOG_PREVIEW_CHARS: usize = 120;

type Controls = HashMap<String, watch::Sender<LoopControl>>;

/// Runs agent executions end to end
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<ForgeConfig>,
    store: Arc<dyn Store>,
    client: Arc<dyn LlmClient>,
    limiter: TokenRateLimiter,
    decisions: Arc<dyn DecisionMatcher>,
    protocols: Arc<ProtocolRegistry>,
    sandbox: Arc<Sandbox>,
    vcs: VcsWorkflow,
    controls: Arc<Mutex<Controls>>,
}

impl Orchestrator {
    /// Create an orchestrator with its own rate limiter.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ForgeConfig,
        store: Arc<dyn Store>,
        client: Arc<dyn LlmClient>,
        sandbox: Arc<Sandbox>,
        vcs: VcsWorkflow,
    ) -> Self {
        let limiter = TokenRateLimiter::spawn(&config.rate_limit);
        Self {
            config: Arc::new(config),
            store,
            client,
            limiter,
            decisions: Arc::new(NoDecisions),
            protocols: Arc::new(ProtocolRegistry::new()),
            sandbox,
            vcs,
            controls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_decisions(mut self, decisions: Arc<dyn DecisionMatcher>) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn with_protocols(mut self, protocols: ProtocolRegistry) -> Self {
        self.protocols = Arc::new(protocols);
        self
    }

    /// Share a limiter with other orchestrators in the same process
    pub fn with_rate_limiter(mut self, limiter: TokenRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn rate_limiter(&self) -> &TokenRateLimiter {
        &self.limiter
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    /// Whether the LLM client has credentials
    pub fn check_health(&self) -> bool {
        self.client.is_configured()
    }

    /// Start an execution in the background
    ///
    /// Fails immediately if the LLM client is not configured. The returned
    /// handle may be dropped; the outcome is recorded in the store either way.
    pub fn start_execution(&self, execution_id: &str) -> Result<JoinHandle<Result<()>>> {
        self.ensure_configured()?;
        let this = self.clone();
        let execution_id = execution_id.to_string();
        Ok(tokio::spawn(async move { this.run_execution(&execution_id).await }))
    }

    /// Run an execution to completion on the current task
    pub async fn run_execution(&self, execution_id: &str) -> Result<()> {
        self.ensure_configured()?;

        let execution = self.store.get_execution(execution_id).await?;
        let status = transition(execution.status, ExecutionEvent::Start)?;
        let ticket = self.store.get_ticket(&execution.ticket_id).await?;
        let protocol = self.protocols.resolve(&execution.protocol).clone();

        // Registered before the status change so pause/resume always find the session
        let control = self.register(execution_id);
        let started = self
            .store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(status),
                    started_at: Some(Utc::now()),
                    log: Some(LogUpdate::Append(format!(
                        "Started with protocol '{}' ({})",
                        protocol.name,
                        protocol.model.api_name()
                    ))),
                    ..Default::default()
                },
            )
            .await;
        let execution = match started {
            Ok(execution) => execution,
            Err(e) => {
                self.unregister(execution_id);
                return Err(e);
            }
        };

        info!(
            "Starting execution {} for ticket {} with protocol '{}'",
            execution.id, ticket.identifier, protocol.name
        );

        let agent = format!("forge:{}", execution.id);
        fail_open("assign agent", || {
            self.store.update_ticket(
                &ticket.id,
                TicketPatch {
                    assigned_agent: Some(Some(agent)),
                    ..Default::default()
                },
            )
        })
        .await;

        self.run_session(execution, ticket, protocol, control).await
    }

    /// Pause a running execution at its next iteration boundary
    pub async fn pause(&self, execution_id: &str) -> Result<()> {
        let execution = self.store.get_execution(execution_id).await?;
        let status = transition(execution.status, ExecutionEvent::Pause)?;
        self.store
            .update_execution(
                execution_id,
                ExecutionPatch::status(status).with_log(LogUpdate::Append("Paused".to_string())),
            )
            .await?;

        if !self.signal(execution_id, LoopControl::Pause) {
            debug!("Execution {} has no live loop to pause", execution_id);
        }
        info!("Paused execution {}", execution_id);
        Ok(())
    }

    /// Resume a paused execution
    ///
    /// A live loop is simply released. Otherwise a new session is started
    /// from the last checkpoint and its handle returned.
    pub async fn resume(&self, execution_id: &str) -> Result<Option<JoinHandle<Result<()>>>> {
        let execution = self.store.get_execution(execution_id).await?;
        let status = transition(execution.status, ExecutionEvent::Resume)?;

        if self.has_live_loop(execution_id) {
            self.store
                .update_execution(
                    execution_id,
                    ExecutionPatch::status(status)
                        .with_log(LogUpdate::Append("Resumed".to_string())),
                )
                .await?;
            self.signal(execution_id, LoopControl::Run);
            info!("Resumed execution {}", execution_id);
            return Ok(None);
        }

        self.ensure_configured()?;
        let ticket = self.store.get_ticket(&execution.ticket_id).await?;
        let protocol = self.protocols.resolve(&execution.protocol).clone();
        let step = execution.checkpoint_step.unwrap_or(0);
        let control = self.register(execution_id);
        let resumed = self
            .store
            .update_execution(
                execution_id,
                ExecutionPatch::status(status).with_log(LogUpdate::Append(format!(
                    "Resumed from checkpoint at iteration {}",
                    step
                ))),
            )
            .await;
        let execution = match resumed {
            Ok(execution) => execution,
            Err(e) => {
                self.unregister(execution_id);
                return Err(e);
            }
        };

        info!(
            "Restarting execution {} from checkpoint at iteration {}",
            execution_id, step
        );

        let this = self.clone();
        Ok(Some(tokio::spawn(async move {
            this.run_session(execution, ticket, protocol, control).await
        })))
    }

    /// Cancel an execution
    ///
    /// A live loop stops at its next iteration boundary and records the
    /// failure itself. Without one the failure is recorded here.
    pub async fn cancel(&self, execution_id: &str) -> Result<()> {
        let execution = self.store.get_execution(execution_id).await?;
        transition(execution.status, ExecutionEvent::Cancel)?;

        if self.signal(execution_id, LoopControl::Cancel) {
            fail_open("execution log", || {
                self.store.update_execution(
                    execution_id,
                    ExecutionPatch::log(LogUpdate::Append("Cancellation requested".to_string())),
                )
            })
            .await;
            info!("Cancellation requested for execution {}", execution_id);
            return Ok(());
        }

        let protocol = self.protocols.resolve(&execution.protocol).clone();
        let usage = Usage {
            input_tokens: execution.input_tokens,
            output_tokens: execution.output_tokens,
        };
        let reason = ForgeError::Cancelled(format!("execution {} was cancelled", execution_id));
        self.record_failure(execution_id, &execution.ticket_id, &protocol, &reason, usage)
            .await?;
        info!("Cancelled execution {}", execution_id);
        Ok(())
    }

    /// Admission, loop and bookkeeping for an execution already in `running`
    async fn run_session(
        &self,
        execution: Execution,
        ticket: Ticket,
        protocol: ProtocolConfig,
        control: watch::Receiver<LoopControl>,
    ) -> Result<()> {
        let execution_id = execution.id.clone();

        if let Err(e) = self
            .limiter
            .wait_for_capacity(&execution_id, protocol.estimated_tokens)
            .await
        {
            self.unregister(&execution_id);
            if let ForgeError::QueueFull { depth, max } = &e {
                warn!("Execution {} not admitted: {}", execution_id, e);
                self.requeue(&execution_id, *depth, *max).await?;
            } else {
                let base = usage_of(&execution);
                self.record_failure(&execution_id, &ticket.id, &protocol, &e, base)
                    .await?;
            }
            return Err(e);
        }

        let observer = SessionObserver::new(
            self.store.clone(),
            &execution,
            self.config.orchestrator.checkpoint_interval,
        );
        let mut result = self
            .drive(&execution, &ticket, &protocol, control.clone(), &observer)
            .await;

        self.unregister(&execution_id);
        let run_usage = observer.run_usage();
        self.limiter.record_usage(&execution_id, run_usage.total());

        if result.is_ok() && *control.borrow() == LoopControl::Cancel {
            result = Err(ForgeError::Cancelled(format!(
                "execution {} was cancelled",
                execution_id
            )));
        }

        match result {
            Ok((outcome, ctx)) => {
                self.record_completion(
                    &execution_id,
                    &ticket.id,
                    &protocol,
                    outcome,
                    ctx,
                    observer.base,
                )
                .await
            }
            Err(e) => {
                error!("Execution {} failed: {}", execution_id, e);
                self.record_failure(&execution_id, &ticket.id, &protocol, &e, observer.total())
                    .await?;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        execution: &Execution,
        ticket: &Ticket,
        protocol: &ProtocolConfig,
        control: watch::Receiver<LoopControl>,
        observer: &SessionObserver,
    ) -> Result<(LoopOutcome, ToolContext)> {
        let settings = &self.config.orchestrator;
        let mut ctx = ToolContext::seeded(execution, ticket);

        let (history, completed) = match restore_checkpoint(execution)? {
            Some(restored) => restored,
            None => {
                let query = DecisionQuery::from_ticket(ticket);
                let decisions = fail_open_or("decision matching", Vec::new(), || {
                    self.decisions.find_relevant(&query, settings.max_decisions)
                })
                .await;
                let prompt = build_initial_prompt(
                    ticket,
                    execution.prompt.as_deref(),
                    &ctx,
                    &decisions,
                    settings,
                );
                (vec![Message::user(prompt)], 0)
            }
        };

        let executor = ToolExecutor::new(self.sandbox.clone(), self.vcs.clone())
            .with_tool_set(protocol.tools);
        let tool_loop = ToolLoop::new(self.client.clone(), protocol.model.api_name())
            .with_context_manager(ContextWindowManager::new(self.config.context.clone()))
            .with_max_tokens(protocol.max_output_tokens)
            .with_system(protocol.system_prompt.clone())
            .with_tools(executor.definitions())
            .with_max_iterations(protocol.max_iterations.min(settings.max_iterations))
            .with_control(control);

        let outcome = tool_loop
            .resume(history, completed, &mut ctx, &executor, observer)
            .await?;
        Ok((outcome, ctx))
    }

    async fn requeue(&self, execution_id: &str, depth: usize, max: usize) -> Result<()> {
        let current = self.store.get_execution(execution_id).await?;
        let status = transition(current.status, ExecutionEvent::Requeue)?;
        self.store
            .update_execution(
                execution_id,
                ExecutionPatch::status(status).with_log(LogUpdate::Append(format!(
                    "Rate limiter queue full ({}/{}); returned to pending",
                    depth, max
                ))),
            )
            .await?;
        fail_open("clear agent", || {
            self.store.update_ticket(&current.ticket_id, TicketPatch::clear_agent())
        })
        .await;
        Ok(())
    }

    async fn record_completion(
        &self,
        execution_id: &str,
        ticket_id: &str,
        protocol: &ProtocolConfig,
        outcome: LoopOutcome,
        ctx: ToolContext,
        base: Usage,
    ) -> Result<()> {
        let current = self.store.get_execution(execution_id).await?;
        let status = finishing_status(current.status, ExecutionEvent::Complete)?;

        let mut total = base;
        total.add(outcome.usage);
        let cost = cost_usd(protocol.model.api_name(), &total);

        let note = match outcome.stop {
            LoopStop::EndTurn => format!("Completed after {} iteration(s)", outcome.iterations),
            LoopStop::MaxTokens => format!(
                "Completed after {} iteration(s); the last response hit the output token limit",
                outcome.iterations
            ),
            LoopStop::MaxIterations => format!(
                "Stopped at the iteration limit ({}) and marked completed",
                outcome.iterations
            ),
        };

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(status),
                    input_tokens: Some(total.input_tokens),
                    output_tokens: Some(total.output_tokens),
                    cost_usd: Some(cost),
                    completed_at: Some(Utc::now()),
                    log: Some(LogUpdate::Append(note)),
                    ..Default::default()
                },
            )
            .await?;

        let mut ticket_patch = TicketPatch {
            assigned_agent: Some(None),
            branch_name: ctx.branch_name.clone(),
            pr_url: ctx.pr_url.clone(),
            pr_number: ctx.pr_number,
            ..Default::default()
        };
        if ctx.pr_url.is_some() {
            ticket_patch.status = Some(TicketStatus::InReview);
        }
        self.store.update_ticket(ticket_id, ticket_patch).await?;

        self.store
            .append_history(
                ticket_id,
                ExecutionHistoryEntry {
                    execution_id: execution_id.to_string(),
                    protocol: protocol.name.clone(),
                    outcome: ExecutionOutcome::Completed,
                    summary: summary::preview(outcome.final_text.trim(), HISTORY_SUMMARY_CHARS),
                    branch_name: ctx.branch_name,
                    pr_url: ctx.pr_url,
                    total_tokens: total.total(),
                    cost_usd: cost,
                    recorded_at: Utc::now(),
                },
            )
            .await?;

        info!(
            "Execution {} completed: {} tokens, ${:.4}",
            execution_id,
            total.total(),
            cost
        );
        Ok(())
    }

    /// Mark failed, keep the error text as the log, and leave the ticket status alone
    async fn record_failure(
        &self,
        execution_id: &str,
        ticket_id: &str,
        protocol: &ProtocolConfig,
        reason: &ForgeError,
        total: Usage,
    ) -> Result<()> {
        let current = self.store.get_execution(execution_id).await?;
        if current.status.is_terminal() {
            warn!(
                "Execution {} is already {}; not recording failure",
                execution_id, current.status
            );
            return Ok(());
        }
        let event = match reason {
            ForgeError::Cancelled(_) => ExecutionEvent::Cancel,
            _ => ExecutionEvent::Fail,
        };
        let status = finishing_status(current.status, event)?;
        let cost = cost_usd(protocol.model.api_name(), &total);

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(status),
                    input_tokens: Some(total.input_tokens),
                    output_tokens: Some(total.output_tokens),
                    cost_usd: Some(cost),
                    completed_at: Some(Utc::now()),
                    log: Some(LogUpdate::Replace(reason.to_string())),
                    ..Default::default()
                },
            )
            .await?;

        // Branch and PR were written to the ticket as they were created
        let ticket = self.store.get_ticket(ticket_id).await?;
        self.store
            .append_history(
                ticket_id,
                ExecutionHistoryEntry {
                    execution_id: execution_id.to_string(),
                    protocol: protocol.name.clone(),
                    outcome: ExecutionOutcome::Failed,
                    summary: summary::preview(&reason.to_string(), HISTORY_SUMMARY_CHARS),
                    branch_name: ticket.branch_name,
                    pr_url: ticket.pr_url,
                    total_tokens: total.total(),
                    cost_usd: cost,
                    recorded_at: Utc::now(),
                },
            )
            .await?;
        self.store
            .update_ticket(ticket_id, TicketPatch::clear_agent())
            .await?;
        Ok(())
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.client.is_configured() {
            Ok(())
        } else {
            Err(ForgeError::Config(
                "LLM client is not configured (missing API key)".to_string(),
            ))
        }
    }

    fn controls(&self) -> MutexGuard<'_, Controls> {
        self.controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, execution_id: &str) -> watch::Receiver<LoopControl> {
        let (sender, receiver) = watch::channel(LoopControl::Run);
        self.controls().insert(execution_id.to_string(), sender);
        receiver
    }

    fn unregister(&self, execution_id: &str) {
        self.controls().remove(execution_id);
    }

    fn has_live_loop(&self, execution_id: &str) -> bool {
        self.controls().contains_key(execution_id)
    }

    /// Send a control signal to a live loop; false if there is none
    fn signal(&self, execution_id: &str, control: LoopControl) -> bool {
        self.controls()
            .get(execution_id)
            .map(|sender| sender.send(control).is_ok())
            .unwrap_or(false)
    }
}

/// Like `transition`, but a session that finished while paused is resumed first
fn finishing_status(current: ExecutionStatus, event: ExecutionEvent) -> Result<ExecutionStatus> {
    if current == ExecutionStatus::Paused && event != ExecutionEvent::Cancel {
        let resumed = transition(current, ExecutionEvent::Resume)?;
        return transition(resumed, event);
    }
    transition(current, event)
}

fn usage_of(execution: &Execution) -> Usage {
    Usage {
        input_tokens: execution.input_tokens,
        output_tokens: execution.output_tokens,
    }
}

fn restore_checkpoint(execution: &Execution) -> Result<Option<(Vec<Message>, usize)>> {
    match (&execution.checkpoint_data, execution.checkpoint_step) {
        (Some(data), Some(step)) => {
            let messages: Vec<Message> = serde_json::from_value(data.clone())?;
            info!(
                "Restored {} message(s) for execution {} at iteration {}",
                messages.len(),
                execution.id,
                step
            );
            Ok(Some((messages, step)))
        }
        _ => Ok(None),
    }
}

/// Persists progress while the loop runs
struct SessionObserver {
    store: Arc<dyn Store>,
    execution_id: String,
    ticket_id: String,
    checkpoint_interval: usize,
    /// Usage recorded on the execution before this session
    base: Usage,
    run_usage: Mutex<Usage>,
}

impl SessionObserver {
    fn new(store: Arc<dyn Store>, execution: &Execution, checkpoint_interval: usize) -> Self {
        Self {
            store,
            execution_id: execution.id.clone(),
            ticket_id: execution.ticket_id.clone(),
            checkpoint_interval,
            base: usage_of(execution),
            run_usage: Mutex::new(Usage::default()),
        }
    }

    fn run_usage(&self) -> Usage {
        *self
            .run_usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn total(&self) -> Usage {
        let mut total = self.base;
        total.add(self.run_usage());
        total
    }
}

#[async_trait]
impl LoopObserver for SessionObserver {
    async fn on_tool_use(
        &self,
        ctx: &ToolContext,
        name: &str,
        _input: &Value,
        outcome: &ToolOutcome,
    ) {
        let first_line = outcome.content.lines().next().unwrap_or_default();
        let line = format!(
            "{} {}: {}",
            name,
            if outcome.is_error { "failed" } else { "ok" },
            summary::preview(first_line, LOG_PREVIEW_CHARS)
        );
        fail_open("execution log", || {
            self.store
                .update_execution(&self.execution_id, ExecutionPatch::log(LogUpdate::Append(line)))
        })
        .await;

        if !outcome.is_error && matches!(name, "create_branch" | "create_pull_request") {
            let patch = TicketPatch {
                branch_name: ctx.branch_name.clone(),
                pr_url: ctx.pr_url.clone(),
                pr_number: ctx.pr_number,
                ..Default::default()
            };
            fail_open("ticket branch/PR update", || {
                self.store.update_ticket(&self.ticket_id, patch)
            })
            .await;
        }
    }

    async fn on_iteration(&self, iteration: usize, usage: &Usage, messages: &[Message]) {
        *self
            .run_usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = *usage;

        if self.checkpoint_interval == 0 || iteration % self.checkpoint_interval != 0 {
            return;
        }

        let data = match serde_json::to_value(messages) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to serialize checkpoint for {}: {}", self.execution_id, e);
                return;
            }
        };
        let total = self.total();
        let patch = ExecutionPatch {
            input_tokens: Some(total.input_tokens),
            output_tokens: Some(total.output_tokens),
            checkpoint_step: Some(iteration),
            checkpoint_data: Some(data),
            ..Default::default()
        };
        if fail_open("checkpoint", || {
            self.store.update_execution(&self.execution_id, patch)
        })
        .await
        .is_some()
        {
            debug!(
                "Checkpointed execution {} at iteration {}",
                self.execution_id, iteration
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finishing_status_from_paused() {
        assert_eq!(
            finishing_status(ExecutionStatus::Paused, ExecutionEvent::Complete).unwrap(),
            ExecutionStatus::Completed
        );
        assert_eq!(
            finishing_status(ExecutionStatus::Paused, ExecutionEvent::Cancel).unwrap(),
            ExecutionStatus::Failed
        );
        assert!(finishing_status(ExecutionStatus::Completed, ExecutionEvent::Fail).is_err());
    }

    #[test]
    fn test_restore_checkpoint() {
        let mut execution = Execution::new("e1", "t1", "standard");
        assert!(restore_checkpoint(&execution).unwrap().is_none());

        let messages = vec![Message::user("hello")];
        execution.checkpoint_step = Some(5);
        execution.checkpoint_data = Some(serde_json::to_value(&messages).unwrap());

        let (restored, step) = restore_checkpoint(&execution).unwrap().unwrap();
        assert_eq!(step, 5);
        assert_eq!(restored, messages);
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let mut execution = Execution::new("e1", "t1", "standard");
        execution.checkpoint_step = Some(5);
        execution.checkpoint_data = Some(serde_json::json!({"not": "messages"}));
        assert!(matches!(
            restore_checkpoint(&execution),
            Err(ForgeError::Serialization(_))
        ));
    }
}
