//! Token rate limiter
//!
//! Admission control in front of LLM sessions. Token consumption is tracked
//! in a trailing 60-second window against an effective limit (quota reduced
//! by a safety buffer). Waiters are queued and released strictly in arrival
//! order by a single scheduler task; each release re-checks capacity and is
//! rescheduled if the window filled up in the meantime.
//!
//! Admission reserves the caller's estimate in the window. The caller's
//! later [`TokenRateLimiter::record_usage`] replaces that reservation with
//! the real figure.

use forge_core::{ForgeError, RateLimitConfig, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Length of the accounting window
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct TokenRecord {
    at: Instant,
    tokens: u64,
    execution_id: String,
    /// Reservation made at admission, replaced by the actual usage
    reserved: bool,
}

/// Token records within the trailing window
///
/// Pure bookkeeping: every method takes the current time explicitly.
#[derive(Debug, Clone)]
pub struct TokenWindow {
    records: VecDeque<TokenRecord>,
    limit: u64,
}

impl TokenWindow {
    pub fn new(limit: u64) -> Self {
        Self {
            records: VecDeque::new(),
            limit,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn trim(&mut self, now: Instant) {
        while let Some(front) = self.records.front() {
            if front.at + WINDOW <= now {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }

    /// Tokens consumed in the window ending at `now`
    pub fn total(&mut self, now: Instant) -> u64 {
        self.trim(now);
        self.records.iter().map(|r| r.tokens).sum()
    }

    /// Estimates above the limit are treated as the whole limit
    fn clamp(&self, estimate: u64) -> u64 {
        estimate.min(self.limit)
    }

    /// Whether `total + estimate` stays within the limit
    pub fn has_capacity(&mut self, estimate: u64, now: Instant) -> bool {
        self.total(now) + estimate <= self.limit
    }

    /// Admission check; an oversized estimate is admitted into an empty window
    pub fn can_admit(&mut self, estimate: u64, now: Instant) -> bool {
        self.total(now) + self.clamp(estimate) <= self.limit
    }

    /// How long until enough tokens age out to admit `estimate`
    pub fn time_until_capacity(&mut self, estimate: u64, now: Instant) -> Duration {
        let total = self.total(now);
        let needed = total + self.clamp(estimate);
        if needed <= self.limit {
            return Duration::ZERO;
        }

        let excess = needed - self.limit;
        let mut freed = 0;
        for record in &self.records {
            freed += record.tokens;
            if freed >= excess {
                return (record.at + WINDOW).saturating_duration_since(now);
            }
        }

        // Only reachable if excess exceeds everything in the window
        self.records
            .back()
            .map(|r| (r.at + WINDOW).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Hold `tokens` for an admitted execution until it reports usage
    pub fn reserve(&mut self, execution_id: &str, tokens: u64, now: Instant) {
        self.push(execution_id, tokens, now, true);
    }

    /// Record actual usage, replacing any outstanding reservation for the execution
    pub fn record(&mut self, execution_id: &str, tokens: u64, now: Instant) {
        self.records
            .retain(|r| !(r.reserved && r.execution_id == execution_id));
        self.push(execution_id, tokens, now, false);
    }

    fn push(&mut self, execution_id: &str, tokens: u64, now: Instant, reserved: bool) {
        self.trim(now);
        if tokens == 0 {
            return;
        }
        // Keep records ordered by time so trimming from the front stays correct
        let index = self.records.partition_point(|r| r.at <= now);
        self.records.insert(
            index,
            TokenRecord {
                at: now,
                tokens,
                execution_id: execution_id.to_string(),
                reserved,
            },
        );
    }
}

/// Limiter telemetry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStatus {
    pub window_tokens: u64,
    pub effective_limit: u64,
    pub percent_used: f64,
    pub queue_depth: usize,
    /// Cooldown a request of the nominal size would get right now
    pub nominal_cooldown_ms: u64,
}

struct Shared {
    window: TokenWindow,
    last_release: Option<Instant>,
    queue_depth: usize,
}

impl Shared {
    fn gap_remaining(&self, min_gap: Duration, now: Instant) -> Duration {
        self.last_release
            .map(|at| (at + min_gap).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn cooldown(&mut self, estimate: u64, min_gap: Duration, now: Instant) -> Duration {
        if self.window.can_admit(estimate, now) {
            self.gap_remaining(min_gap, now)
        } else {
            self.window
                .time_until_capacity(estimate, now)
                .max(min_gap)
        }
    }
}

struct Slot {
    execution_id: String,
    estimate: u64,
    scheduled_for: Instant,
    respond: oneshot::Sender<Result<()>>,
}

enum Command {
    Wait {
        execution_id: String,
        estimate: u64,
        respond: oneshot::Sender<Result<()>>,
    },
    /// Usage changed; the head of the queue may be admissible sooner
    Recheck,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    min_gap: Duration,
    release_gap: Duration,
    max_queue: usize,
    nominal_estimate: u64,
}

/// Handle to the shared limiter; cheap to clone
#[derive(Clone)]
pub struct TokenRateLimiter {
    shared: Arc<Mutex<Shared>>,
    commands: mpsc::UnboundedSender<Command>,
    timing: Timing,
}

impl TokenRateLimiter {
    /// Start the scheduler task. Must be called from within a tokio runtime.
    pub fn spawn(config: &RateLimitConfig) -> Self {
        let timing = Timing {
            min_gap: Duration::from_millis(config.min_gap_ms),
            release_gap: Duration::from_millis(config.release_gap_ms),
            max_queue: config.max_queue_size,
            nominal_estimate: config.nominal_estimate,
        };
        let shared = Arc::new(Mutex::new(Shared {
            window: TokenWindow::new(config.effective_limit()),
            last_release: None,
            queue_depth: 0,
        }));
        let (commands, receiver) = mpsc::unbounded_channel();

        tokio::spawn(run_scheduler(shared.clone(), receiver, timing));

        info!(
            "Rate limiter started: {} tokens/min effective, queue of {}",
            config.effective_limit(),
            config.max_queue_size
        );

        Self {
            shared,
            commands,
            timing,
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    /// Record tokens consumed by an execution
    pub fn record_usage(&self, execution_id: &str, tokens: u64) {
        self.shared()
            .window
            .record(execution_id, tokens, Instant::now());
        debug!("Recorded {} tokens for {}", tokens, execution_id);
        // The scheduler is gone only when every handle is dropped
        let _ = self.commands.send(Command::Recheck);
    }

    /// Whether `estimate` more tokens fit in the window right now
    pub fn has_capacity(&self, estimate: u64) -> bool {
        self.shared().window.has_capacity(estimate, Instant::now())
    }

    /// How long a request of `estimate` tokens would wait right now
    pub fn calculate_cooldown(&self, estimate: u64) -> Duration {
        self.shared()
            .cooldown(estimate, self.timing.min_gap, Instant::now())
    }

    /// Wait in the FIFO queue until `estimate` tokens can be admitted
    ///
    /// Fails immediately with [`ForgeError::QueueFull`] when the queue is at
    /// capacity.
    pub async fn wait_for_capacity(&self, execution_id: &str, estimate: u64) -> Result<()> {
        let (respond, response) = oneshot::channel();
        self.commands
            .send(Command::Wait {
                execution_id: execution_id.to_string(),
                estimate,
                respond,
            })
            .map_err(|_| ForgeError::Other("Rate limiter has stopped".to_string()))?;

        response
            .await
            .map_err(|_| ForgeError::Other("Rate limiter dropped the request".to_string()))?
    }

    pub fn status(&self) -> RateLimiterStatus {
        let now = Instant::now();
        let mut shared = self.shared();
        let window_tokens = shared.window.total(now);
        let effective_limit = shared.window.limit();
        let nominal = shared.cooldown(self.timing.nominal_estimate, self.timing.min_gap, now);

        RateLimiterStatus {
            window_tokens,
            effective_limit,
            percent_used: if effective_limit == 0 {
                100.0
            } else {
                window_tokens as f64 * 100.0 / effective_limit as f64
            },
            queue_depth: shared.queue_depth,
            nominal_cooldown_ms: nominal.as_millis() as u64,
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_scheduler(
    shared: Arc<Mutex<Shared>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    timing: Timing,
) {
    let mut queue: VecDeque<Slot> = VecDeque::new();

    loop {
        let deadline = queue.front().map(|slot| slot.scheduled_for);

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Wait { execution_id, estimate, respond }) => {
                    if queue.len() >= timing.max_queue {
                        warn!(
                            "Rate limiter queue full ({}), rejecting {}",
                            queue.len(),
                            execution_id
                        );
                        let _ = respond.send(Err(ForgeError::QueueFull {
                            depth: queue.len(),
                            max: timing.max_queue,
                        }));
                        continue;
                    }

                    let now = Instant::now();
                    let cooldown = lock(&shared).cooldown(estimate, timing.min_gap, now);
                    debug!(
                        "Queued {} ({} tokens) with cooldown {:?}",
                        execution_id, estimate, cooldown
                    );
                    queue.push_back(Slot {
                        execution_id,
                        estimate,
                        scheduled_for: now + cooldown,
                        respond,
                    });
                    lock(&shared).queue_depth = queue.len();
                }
                Some(Command::Recheck) => {
                    if let Some(head) = queue.front_mut() {
                        let now = Instant::now();
                        let cooldown = lock(&shared).cooldown(head.estimate, timing.min_gap, now);
                        head.scheduled_for = head.scheduled_for.min(now + cooldown);
                    }
                }
                None => break,
            },
            _ = wait_for(deadline) => {
                release_head(&shared, &mut queue, timing);
                lock(&shared).queue_depth = queue.len();
            }
        }
    }

    debug!("Rate limiter scheduler stopped");
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Release the head slot if it still fits, otherwise push its schedule back
fn release_head(shared: &Mutex<Shared>, queue: &mut VecDeque<Slot>, timing: Timing) {
    let now = Instant::now();

    // Waiters that gave up are dropped without reserving anything
    while queue.front().is_some_and(|slot| slot.respond.is_closed()) {
        if let Some(slot) = queue.pop_front() {
            debug!("Dropping abandoned slot for {}", slot.execution_id);
        }
    }

    let Some(head) = queue.front_mut() else {
        return;
    };

    let mut state = lock(shared);
    let fits = state.window.can_admit(head.estimate, now);
    let gap = state.gap_remaining(timing.min_gap, now);

    if !fits || !gap.is_zero() {
        let cooldown = state.cooldown(head.estimate, timing.min_gap, now);
        head.scheduled_for = now + cooldown.max(Duration::from_millis(1));
        debug!(
            "Capacity changed before releasing {}; rescheduled in {:?}",
            head.execution_id, cooldown
        );
        return;
    }

    if let Some(slot) = queue.pop_front() {
        let reserved = state.window.clamp(slot.estimate);
        state.window.reserve(&slot.execution_id, reserved, now);
        state.last_release = Some(now);
        drop(state);

        info!("Admitted {} ({} tokens)", slot.execution_id, slot.estimate);
        if slot.respond.send(Ok(())).is_err() {
            // Receiver went away between the check and the send
            lock(shared).window.record(&slot.execution_id, 0, now);
        }

        if let Some(next) = queue.front_mut() {
            next.scheduled_for = next.scheduled_for.max(now + timing.release_gap);
        }
    }
}
