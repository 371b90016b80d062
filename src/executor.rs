use crate::connector::Connectors;
use crate::context::RunContext;
use crate::error::TaskError;
use crate::graph::Graph;
use crate::retry::{RetryExecutor, RetryOutcome};
use crate::state::{RunResult, RunStatus, TaskState, TaskStatus};
use crate::task::Task;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Runs a [`Graph`] for one window: independent tasks run concurrently, a task
/// starts only after all of its upstreams succeeded.
pub struct Executor {
    graph: Arc<Graph>,
    connectors: Connectors,
    max_concurrency: usize,
}

struct Completion {
    task_id: String,
    outcome: RetryOutcome<(), TaskError>,
}

/// Bookkeeping owned by the coordinator loop for the duration of one run.
struct RunState {
    states: BTreeMap<String, TaskState>,
    remaining_upstreams: BTreeMap<String, usize>,
    ready: VecDeque<String>,
}

impl Executor {
    pub fn new(graph: impl Into<Arc<Graph>>, connectors: Connectors) -> Self {
        Self {
            graph: graph.into(),
            connectors,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Upper bound on concurrently running task attempts (at least one).
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub async fn run(&self, ctx: &RunContext) -> RunResult {
        self.run_with_cancellation(ctx, CancellationToken::new())
            .await
    }

    /// Like [`Executor::run`], but stops dispatching once `cancel` fires.
    /// Attempts already running finish and are recorded; everything that never
    /// started, or whose retry was abandoned, ends up `Skipped`.
    pub async fn run_with_cancellation(
        &self,
        ctx: &RunContext,
        cancel: CancellationToken,
    ) -> RunResult {
        let span = info_span!(
            "run",
            window_start = %ctx.window_start(),
            window_end = %ctx.window_end()
        );
        self.coordinate(ctx, cancel).instrument(span).await
    }

    async fn coordinate(&self, ctx: &RunContext, cancel: CancellationToken) -> RunResult {
        let started_at = Utc::now();
        let ctx = Arc::new(ctx.clone());
        let mut run = RunState::new(&self.graph);

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();
        let mut in_flight = 0usize;
        let mut cancelled = false;

        info!(
            tasks = self.graph.len(),
            max_concurrency = self.max_concurrency,
            "run started"
        );

        loop {
            if !cancelled && cancel.is_cancelled() {
                warn!("run cancelled, no further tasks will be dispatched");
                cancelled = true;
            }

            if !cancelled {
                while !run.ready.is_empty() {
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };
                    let Some(task_id) = run.ready.pop_front() else {
                        break;
                    };
                    let Some(task) = self.graph.task(&task_id) else {
                        continue;
                    };
                    if let Some(state) = run.states.get_mut(&task_id) {
                        state.mark_running(Utc::now());
                    }
                    debug!(task = %task_id, kind = task.kind().name(), "dispatching task");
                    self.spawn_task(
                        task.clone(),
                        Arc::clone(&ctx),
                        cancel.clone(),
                        permit,
                        completion_tx.clone(),
                    );
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some(completion) = completion_rx.recv() => {
                    in_flight -= 1;
                    run.settle(&self.graph, completion);
                }
                _ = cancel.cancelled(), if !cancelled => {
                    warn!(in_flight, "run cancelled, waiting for running attempts");
                    cancelled = true;
                }
                else => break,
            }
        }

        run.finish(started_at, &ctx, cancelled)
    }

    fn spawn_task(
        &self,
        task: Task,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) {
        let connectors = self.connectors.clone();

        tokio::spawn(async move {
            let outcome = execute_task(&task, &ctx, &connectors, &cancel).await;

            // Free the slot before the coordinator hears about it so the
            // next dispatch round can use it.
            drop(permit);
            let completion = Completion {
                task_id: task.id().to_string(),
                outcome,
            };
            if completion_tx.send(completion).is_err() {
                error!(task = %task.id(), "coordinator gone, dropping task result");
            }
        });
    }
}

async fn execute_task(
    task: &Task,
    ctx: &RunContext,
    connectors: &Connectors,
    cancel: &CancellationToken,
) -> RetryOutcome<(), TaskError> {
    let retry_executor = RetryExecutor::new(*task.policy());

    retry_executor
        .execute_with_retry(cancel, task.id(), |attempt| {
            let span = info_span!(
                "attempt",
                task = %task.id(),
                kind = task.kind().name(),
                attempt
            );
            async move {
                match AssertUnwindSafe(task.execute(ctx, connectors))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
                }
            }
            .instrument(span)
        })
        .await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

impl RunState {
    fn new(graph: &Graph) -> Self {
        let states = graph
            .tasks()
            .map(|task| (task.id().to_string(), TaskState::default()))
            .collect();
        let remaining_upstreams = graph
            .tasks()
            .map(|task| (task.id().to_string(), task.upstream_ids().len()))
            .collect();
        let ready = graph
            .roots()
            .into_iter()
            .map(str::to_string)
            .collect();

        Self {
            states,
            remaining_upstreams,
            ready,
        }
    }

    fn settle(&mut self, graph: &Graph, completion: Completion) {
        let Completion { task_id, outcome } = completion;

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                info!(task = %task_id, attempts, "task succeeded");
                self.transition(&task_id, TaskStatus::Succeeded, attempts, None);

                for child in graph.downstreams(&task_id) {
                    let unblocked = match self.remaining_upstreams.get_mut(child) {
                        Some(remaining) => {
                            *remaining = remaining.saturating_sub(1);
                            *remaining == 0
                        }
                        None => false,
                    };
                    if unblocked && self.status(child) == Some(TaskStatus::Pending) {
                        debug!(task = %child, "all upstreams succeeded, task is ready");
                        self.ready.push_back(child.to_string());
                    }
                }
            }
            RetryOutcome::Exhausted { error, attempts } => {
                error!(task = %task_id, attempts, error = %error, "task failed");
                self.transition(
                    &task_id,
                    TaskStatus::Failed,
                    attempts,
                    Some(error.to_string()),
                );

                let reason = format!("upstream task {task_id} failed");
                for descendant in graph.descendants(&task_id) {
                    if self.status(&descendant) == Some(TaskStatus::Pending) {
                        warn!(task = %descendant, upstream = %task_id, "marking task upstream failed");
                        self.transition(
                            &descendant,
                            TaskStatus::UpstreamFailed,
                            0,
                            Some(reason.clone()),
                        );
                    }
                }
            }
            RetryOutcome::Cancelled {
                last_error,
                attempts,
            } => {
                warn!(task = %task_id, attempts, "retry abandoned after cancellation");
                self.transition(
                    &task_id,
                    TaskStatus::Skipped,
                    attempts,
                    last_error.map(|e| e.to_string()),
                );
            }
        }
    }

    fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.states.get(task_id).map(|state| state.status)
    }

    fn transition(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        attempts: u32,
        last_error: Option<String>,
    ) {
        if let Some(state) = self.states.get_mut(task_id) {
            state.finish(status, attempts, last_error, Utc::now());
        }
    }

    fn finish(
        mut self,
        started_at: chrono::DateTime<Utc>,
        ctx: &RunContext,
        cancelled: bool,
    ) -> RunResult {
        let finished_at = Utc::now();
        for (task_id, state) in &mut self.states {
            if !state.status.is_terminal() {
                debug!(task = %task_id, "task never dispatched, skipping");
                state.finish(TaskStatus::Skipped, state.attempt_count, None, finished_at);
            }
        }

        let status = if self
            .states
            .values()
            .all(|state| state.status == TaskStatus::Succeeded)
        {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        let count = |wanted: TaskStatus| {
            self.states
                .values()
                .filter(|state| state.status == wanted)
                .count()
        };
        info!(
            status = ?status,
            succeeded = count(TaskStatus::Succeeded),
            failed = count(TaskStatus::Failed),
            upstream_failed = count(TaskStatus::UpstreamFailed),
            skipped = count(TaskStatus::Skipped),
            cancelled,
            "run finished"
        );

        RunResult {
            status,
            window_start: ctx.window_start(),
            window_end: ctx.window_end(),
            started_at,
            finished_at,
            cancelled,
            task_states: self.states,
        }
    }
}
