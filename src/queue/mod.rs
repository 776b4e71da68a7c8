//! Per-agent task queues.
//!
//! `enqueue` records the task and returns its id immediately. Each agent has
//! exactly one background worker, fed by an unbounded channel, that owns the
//! agent's [`FileAgent`] and runs its tasks strictly in enqueue order. Different
//! agents run in parallel; tasks of one agent never overlap.
//!
//! Finished tasks stay queryable until the retention policy evicts them:
//! fetched tasks after the fetch grace period, any finished task after
//! `max_age`, and the oldest beyond `max_per_agent`. Nothing is evicted sooner
//! than the grace period after it finished.

mod types;

pub use types::{TaskError, TaskId, TaskRecord, TaskStatus, TaskType, TaskView};

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRuntime, FileAgent, TaskOutcome};
use crate::config::RetentionConfig;
use crate::error::{ErrorKind, FleetError, FleetResult};
use crate::registry::{AgentId, AgentRegistry};

/// Upper bound on a caller-supplied inference timeout.
pub const MAX_TASK_TIMEOUT_SECS: u64 = 3600;

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelEffect {
    /// Was queued; now cancelled without side effects
    Cancelled,
    /// Is running; the cycle was asked to stop
    Signalled,
    /// Already finished; nothing changed
    AlreadyFinished,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReport {
    pub effect: CancelEffect,
    pub task: TaskView,
}

/// Handle to one agent's worker.
struct Worker {
    sender: mpsc::UnboundedSender<TaskId>,
    /// Cancelled when the agent is deleted; running tasks get a child token
    shutdown: CancellationToken,
    running: Option<(TaskId, CancellationToken)>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskRecord>,
    /// Task ids per agent, enqueue order
    order: HashMap<AgentId, Vec<TaskId>>,
    workers: HashMap<AgentId, Worker>,
    /// Deleted agents and when they were stopped; enqueue is refused.
    /// Dropped by the sweep once the agent's tasks are all evicted.
    retired: HashMap<AgentId, DateTime<Utc>>,
}

struct Inner {
    state: Mutex<State>,
    registry: AgentRegistry,
    runtime: Arc<AgentRuntime>,
    retention: RetentionConfig,
    default_timeout: Duration,
}

/// All task queues of the fleet.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(
        registry: AgentRegistry,
        runtime: Arc<AgentRuntime>,
        retention: RetentionConfig,
        default_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                registry,
                runtime,
                retention,
                default_timeout,
            }),
        }
    }

    /// Queue a task and return its id without waiting for it to run.
    pub async fn enqueue(
        &self,
        agent_id: AgentId,
        task_type: TaskType,
        message: &str,
        timeout: Option<Duration>,
    ) -> FleetResult<TaskId> {
        if message.trim().is_empty() {
            return Err(FleetError::validation("message", "must not be empty"));
        }
        let timeout = match timeout {
            Some(t) if t.is_zero() || t.as_secs() > MAX_TASK_TIMEOUT_SECS => {
                return Err(FleetError::validation(
                    "timeout_secs",
                    format!("must be between 1 and {}", MAX_TASK_TIMEOUT_SECS),
                ))
            }
            Some(t) => t,
            None => self.inner.default_timeout,
        };

        let record = self.inner.registry.get(agent_id).await?;

        let mut state = self.inner.state.lock().await;
        if state.retired.contains_key(&agent_id) {
            return Err(FleetError::agent_not_found(agent_id));
        }
        sweep_agent(&mut state, agent_id, &self.inner.retention, Utc::now());

        let task = TaskRecord::new(agent_id, task_type, message.to_string(), timeout);
        let task_id = task.id;
        state.tasks.insert(task_id, task);
        state.order.entry(agent_id).or_default().push(task_id);

        if !state.workers.contains_key(&agent_id) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let shutdown = CancellationToken::new();
            let agent = FileAgent::new(record, Arc::clone(&self.inner.runtime));
            tokio::spawn(worker_loop(
                Arc::clone(&self.inner),
                agent,
                receiver,
                shutdown.clone(),
            ));
            tracing::debug!("Started queue worker for agent {}", agent_id);
            state.workers.insert(
                agent_id,
                Worker {
                    sender,
                    shutdown,
                    running: None,
                },
            );
        }

        let sent = state
            .workers
            .get(&agent_id)
            .map(|w| w.sender.send(task_id).is_ok())
            .unwrap_or(false);
        if !sent {
            // Worker is gone; fail the task rather than leave it queued forever
            if let Some(task) = state.tasks.get_mut(&task_id) {
                finish(
                    task,
                    TaskStatus::Failed,
                    None,
                    Some(TaskError {
                        kind: ErrorKind::Internal,
                        message: "agent worker is not running".to_string(),
                    }),
                );
            }
            state.workers.remove(&agent_id);
        }

        tracing::info!(
            "Enqueued {} task {} for agent {}",
            task_type,
            task_id,
            agent_id
        );
        Ok(task_id)
    }

    /// Status and timestamps of one task.
    pub async fn status(&self, agent_id: AgentId, task_id: TaskId) -> FleetResult<TaskView> {
        let state = self.inner.state.lock().await;
        let task = find(&state, agent_id, task_id)?;
        let position = (task.status == TaskStatus::Queued).then(|| queue_position(&state, task));
        Ok(task.status_view(position))
    }

    /// Full result of one task. Marks a finished task as fetched.
    pub async fn result(&self, agent_id: AgentId, task_id: TaskId) -> FleetResult<TaskView> {
        let mut state = self.inner.state.lock().await;
        find(&state, agent_id, task_id)?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| FleetError::task_not_found(task_id))?;
        if task.status.is_terminal() && task.fetched_at.is_none() {
            task.fetched_at = Some(Utc::now());
        }
        Ok(task.result_view())
    }

    /// Cancel a task: queued tasks are dropped, running ones are signalled.
    pub async fn cancel(&self, agent_id: AgentId, task_id: TaskId) -> FleetResult<CancelReport> {
        let mut state = self.inner.state.lock().await;
        let status = find(&state, agent_id, task_id)?.status;

        let effect = match status {
            TaskStatus::Queued => {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    finish(
                        task,
                        TaskStatus::Cancelled,
                        None,
                        Some(TaskError {
                            kind: ErrorKind::Cancelled,
                            message: "cancelled before it started".to_string(),
                        }),
                    );
                }
                CancelEffect::Cancelled
            }
            TaskStatus::Running => {
                if let Some((running_id, token)) = state
                    .workers
                    .get(&agent_id)
                    .and_then(|w| w.running.as_ref())
                {
                    if *running_id == task_id {
                        token.cancel();
                    }
                }
                CancelEffect::Signalled
            }
            _ => CancelEffect::AlreadyFinished,
        };

        tracing::info!("Cancel task {} for agent {}: {:?}", task_id, agent_id, effect);
        let task = find(&state, agent_id, task_id)?;
        Ok(CancelReport {
            effect,
            task: task.status_view(None),
        })
    }

    /// Every retained task of one agent, enqueue order.
    pub async fn list(&self, agent_id: AgentId) -> FleetResult<Vec<TaskView>> {
        {
            let state = self.inner.state.lock().await;
            if let Some(ids) = state.order.get(&agent_id) {
                return Ok(ids
                    .iter()
                    .filter_map(|id| state.tasks.get(id))
                    .map(|t| {
                        let position =
                            (t.status == TaskStatus::Queued).then(|| queue_position(&state, t));
                        t.status_view(position)
                    })
                    .collect());
            }
        }
        // No tasks yet: only known agents get an empty list
        self.inner.registry.get(agent_id).await?;
        Ok(Vec::new())
    }

    /// Stop an agent's queue after deletion: queued tasks are cancelled and a
    /// running task is signalled. Finished tasks stay retrievable.
    pub async fn stop_agent(&self, agent_id: AgentId) {
        let mut state = self.inner.state.lock().await;
        state.retired.insert(agent_id, Utc::now());

        if let Some(worker) = state.workers.remove(&agent_id) {
            worker.shutdown.cancel();
        }

        let queued: Vec<TaskId> = state
            .order
            .get(&agent_id)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| {
                        state
                            .tasks
                            .get(id)
                            .is_some_and(|t| t.status == TaskStatus::Queued)
                    })
                    .collect()
            })
            .unwrap_or_default();
        for id in &queued {
            if let Some(task) = state.tasks.get_mut(id) {
                finish(
                    task,
                    TaskStatus::Cancelled,
                    None,
                    Some(TaskError {
                        kind: ErrorKind::Cancelled,
                        message: "agent was deleted".to_string(),
                    }),
                );
            }
        }
        tracing::info!(
            "Stopped queue for agent {} ({} queued tasks cancelled)",
            agent_id,
            queued.len()
        );
    }

    /// Apply the retention policy to every agent as of `now`. Returns evicted count.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let agents: Vec<AgentId> = state.order.keys().copied().collect();
        let evicted = agents
            .into_iter()
            .map(|agent_id| sweep_agent(state, agent_id, &self.inner.retention, now))
            .sum();

        // A stopped agent is forgotten once its tasks are gone and any
        // enqueue that raced the deletion has long since been refused.
        let grace = self.inner.retention.fetch_grace;
        let order = &state.order;
        state
            .retired
            .retain(|id, stopped| order.contains_key(id) || to_std(now - *stopped) < grace);
        if evicted > 0 {
            tracing::debug!("Retention sweep evicted {} tasks", evicted);
        }
        evicted
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Spawn the periodic retention sweep.
    pub fn spawn_retention_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "Task retention sweeper started: every {}s, max age {}s, max {} per agent",
                interval.as_secs(),
                queue.inner.retention.max_age.as_secs(),
                queue.inner.retention.max_per_agent
            );
            loop {
                tokio::time::sleep(interval).await;
                queue.sweep().await;
            }
        })
    }
}

fn find(state: &State, agent_id: AgentId, task_id: TaskId) -> FleetResult<&TaskRecord> {
    state
        .tasks
        .get(&task_id)
        .filter(|t| t.agent_id == agent_id)
        .ok_or_else(|| FleetError::task_not_found(task_id))
}

fn queue_position(state: &State, task: &TaskRecord) -> usize {
    state
        .order
        .get(&task.agent_id)
        .map(|ids| {
            ids.iter()
                .take_while(|id| **id != task.id)
                .filter(|id| {
                    state
                        .tasks
                        .get(id)
                        .is_some_and(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
                })
                .count()
        })
        .unwrap_or(0)
}

fn finish(
    task: &mut TaskRecord,
    status: TaskStatus,
    outcome: Option<TaskOutcome>,
    error: Option<TaskError>,
) {
    task.status = status;
    task.outcome = outcome;
    task.error = error;
    task.finished_at = Some(Utc::now());
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

/// Evict one agent's finished tasks that the retention policy no longer keeps.
fn sweep_agent(
    state: &mut State,
    agent_id: AgentId,
    retention: &RetentionConfig,
    now: DateTime<Utc>,
) -> usize {
    let Some(ids) = state.order.get(&agent_id) else {
        return 0;
    };

    // Finished tasks past the grace period, oldest first
    let mut evictable: Vec<(TaskId, DateTime<Utc>, Option<DateTime<Utc>>)> = ids
        .iter()
        .filter_map(|id| state.tasks.get(id))
        .filter(|t| t.status.is_terminal())
        .filter_map(|t| t.finished_at.map(|f| (t.id, f, t.fetched_at)))
        .filter(|(_, finished, _)| to_std(now - *finished) >= retention.fetch_grace)
        .collect();
    evictable.sort_by_key(|(_, finished, _)| *finished);

    let terminal_count = ids
        .iter()
        .filter_map(|id| state.tasks.get(id))
        .filter(|t| t.status.is_terminal())
        .count();
    let mut over_limit = terminal_count.saturating_sub(retention.max_per_agent);

    let mut evict: HashSet<TaskId> = HashSet::new();
    for (id, finished, fetched) in evictable {
        let fetched_long_ago =
            fetched.is_some_and(|f| to_std(now - f) >= retention.fetch_grace);
        let expired = to_std(now - finished) >= retention.max_age;
        if fetched_long_ago || expired || over_limit > 0 {
            evict.insert(id);
            over_limit = over_limit.saturating_sub(1);
        }
    }

    if evict.is_empty() {
        return 0;
    }
    for id in &evict {
        state.tasks.remove(id);
    }
    let retired = state.retired.contains_key(&agent_id);
    if let Some(ids) = state.order.get_mut(&agent_id) {
        ids.retain(|id| !evict.contains(id));
        if ids.is_empty() && retired {
            state.order.remove(&agent_id);
        }
    }
    evict.len()
}

/// Consumer loop for one agent. Runs until the agent is deleted.
async fn worker_loop(
    inner: Arc<Inner>,
    mut agent: FileAgent,
    mut receiver: mpsc::UnboundedReceiver<TaskId>,
    shutdown: CancellationToken,
) {
    let agent_id = agent.id();

    loop {
        let task_id = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = receiver.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        // Claim the task; it may have been cancelled while queued
        let claimed = {
            let mut state = inner.state.lock().await;
            let cancel = shutdown.child_token();
            let claimed = match state.tasks.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Queued => {
                    task.status = TaskStatus::Running;
                    task.started_at = Some(Utc::now());
                    Some((task.task_type, task.message.clone(), task.timeout))
                }
                _ => None,
            };
            if claimed.is_some() {
                if let Some(worker) = state.workers.get_mut(&agent_id) {
                    worker.running = Some((task_id, cancel.clone()));
                }
            }
            claimed.map(|c| (c, cancel))
        };
        let Some(((task_type, message, timeout), cancel)) = claimed else {
            continue;
        };

        tracing::info!("Agent {} running task {} ({})", agent_id, task_id, task_type);

        let result = AssertUnwindSafe(agent.run_cycle(task_type, &message, timeout, &cancel))
            .catch_unwind()
            .await;

        let (status, outcome, error) = match result {
            Ok(Ok(outcome)) if outcome.all_calls_succeeded() => {
                (TaskStatus::Succeeded, Some(outcome), None)
            }
            Ok(Ok(outcome)) => {
                let error = TaskError {
                    kind: ErrorKind::Handler,
                    message: format!(
                        "{} of {} tool calls failed",
                        outcome.failed_calls(),
                        outcome.calls.len()
                    ),
                };
                (TaskStatus::Failed, Some(outcome), Some(error))
            }
            Ok(Err(e)) if e.kind() == ErrorKind::Cancelled => {
                (TaskStatus::Cancelled, None, Some(TaskError::from(&e)))
            }
            Ok(Err(e)) => (TaskStatus::Failed, None, Some(TaskError::from(&e))),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Agent {} cycle panicked on task {}: {}", agent_id, task_id, detail);
                let error = TaskError {
                    kind: ErrorKind::Internal,
                    message: format!("agent cycle panicked: {}", detail),
                };
                (TaskStatus::Failed, None, Some(error))
            }
        };

        if let Err(e) = inner
            .registry
            .record_interaction(agent_id, agent.context(), status == TaskStatus::Succeeded)
            .await
        {
            tracing::warn!("Failed to record interaction for agent {}: {}", agent_id, e);
        }

        let mut state = inner.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            finish(task, status, outcome, error);
        }
        if let Some(worker) = state.workers.get_mut(&agent_id) {
            worker.running = None;
        }
        tracing::info!("Agent {} finished task {}: {:?}", agent_id, task_id, status);
    }

    tracing::debug!("Queue worker for agent {} stopped", agent_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{Script, ScriptedEngine};
    use crate::llm::GenerateOptions;
    use crate::registry::NewAgent;
    use crate::tools::ToolRegistry;

    struct Fixture {
        queue: TaskQueue,
        registry: AgentRegistry,
        engine: Arc<ScriptedEngine>,
        _dir: tempfile::TempDir,
    }

    fn fixture(scripts: Vec<Script>, retention: RetentionConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::new(scripts));
        let runtime = Arc::new(AgentRuntime {
            engine: engine.clone(),
            tools: Arc::new(ToolRegistry::for_agents(false, Duration::from_secs(5))),
            workspace: dir.path().to_path_buf(),
            context_max_chars: 8000,
            generate_options: GenerateOptions::default(),
        });
        let registry = AgentRegistry::in_memory();
        let queue = TaskQueue::new(
            registry.clone(),
            runtime,
            retention,
            Duration::from_secs(5),
        );
        Fixture {
            queue,
            registry,
            engine,
            _dir: dir,
        }
    }

    async fn create_agent(registry: &AgentRegistry, file: &str) -> AgentId {
        registry
            .create(NewAgent {
                name: "agent".to_string(),
                managed_file: file.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    async fn wait_terminal(queue: &TaskQueue, agent_id: AgentId, task_id: TaskId) -> TaskView {
        for _ in 0..200 {
            let view = queue.status(agent_id, task_id).await.unwrap();
            if view.status.is_terminal() {
                return queue.result(agent_id, task_id).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not finish", task_id);
    }

    fn write_call(content: &str) -> String {
        format!(
            "```json\n{}\n```",
            serde_json::json!({"tool": "write_file", "arguments": {"content": content}})
        )
    }

    #[tokio::test]
    async fn test_enqueue_returns_before_task_runs() {
        let f = fixture(
            vec![Script::Slow(Duration::from_millis(300), "done".to_string())],
            RetentionConfig::default(),
        );
        let agent_id = create_agent(&f.registry, "a.py").await;

        let task_id = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "hello", None)
            .await
            .unwrap();
        let view = f.queue.status(agent_id, task_id).await.unwrap();
        assert!(!view.status.is_terminal());

        let view = wait_terminal(&f.queue, agent_id, task_id).await;
        assert_eq!(view.status, TaskStatus::Succeeded);
        assert_eq!(view.outcome.unwrap().reply, "done");
    }

    #[tokio::test]
    async fn test_code_generation_reply_without_calls_succeeds() {
        let f = fixture(
            vec![Script::Reply(
                "The file already does what you asked; no change needed.".to_string(),
            )],
            RetentionConfig::default(),
        );
        let agent_id = create_agent(&f.registry, "a.py").await;

        let task_id = f
            .queue
            .enqueue(agent_id, TaskType::CodeGeneration, "add a docstring", None)
            .await
            .unwrap();
        let view = wait_terminal(&f.queue, agent_id, task_id).await;
        assert_eq!(view.status, TaskStatus::Succeeded);
        assert!(view.error.is_none());
        let outcome = view.outcome.unwrap();
        assert!(outcome.calls.is_empty());
        assert!(outcome.diagnostics.is_empty());
        assert!(outcome.reply.starts_with("The file already"));
        assert!(!f._dir.path().join("a.py").exists());
    }

    #[tokio::test]
    async fn test_tasks_run_in_fifo_order() {
        let f = fixture(
            vec![
                Script::Slow(Duration::from_millis(50), write_call("first\n")),
                Script::Reply(write_call("second\n")),
                Script::Reply(write_call("third\n")),
            ],
            RetentionConfig::default(),
        );
        let agent_id = create_agent(&f.registry, "a.py").await;

        let mut ids = Vec::new();
        for msg in ["one", "two", "three"] {
            ids.push(
                f.queue
                    .enqueue(agent_id, TaskType::CodeGeneration, msg, None)
                    .await
                    .unwrap(),
            );
        }
        let views: Vec<TaskView> = {
            let mut out = Vec::new();
            for id in &ids {
                out.push(wait_terminal(&f.queue, agent_id, *id).await);
            }
            out
        };

        for pair in views.windows(2) {
            assert!(pair[0].finished_at.unwrap() <= pair[1].started_at.unwrap());
        }
        let prompts = f.engine.prompts.lock().unwrap();
        assert!(prompts[0].ends_with("one"));
        assert!(prompts[1].ends_with("two"));
        assert!(prompts[2].ends_with("three"));
        drop(prompts);

        let agent = f.registry.get(agent_id).await.unwrap();
        assert_eq!(agent.interactions, 3);
    }

    #[tokio::test]
    async fn test_timeout_then_next_task_starts_promptly() {
        let f = fixture(
            vec![
                Script::Slow(Duration::from_secs(10), "never".to_string()),
                Script::Reply("quick".to_string()),
            ],
            RetentionConfig::default(),
        );
        let agent_id = create_agent(&f.registry, "a.py").await;

        let slow = f
            .queue
            .enqueue(
                agent_id,
                TaskType::Conversational,
                "slow",
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let fast = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "fast", None)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let slow_view = wait_terminal(&f.queue, agent_id, slow).await;
        assert_eq!(slow_view.status, TaskStatus::Failed);
        assert_eq!(slow_view.error.unwrap().kind, ErrorKind::Timeout);

        let fast_view = wait_terminal(&f.queue, agent_id, fast).await;
        assert_eq!(fast_view.status, TaskStatus::Succeeded);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_failure_isolated_to_one_task() {
        let f = fixture(
            vec![
                Script::Fail("engine exploded".to_string()),
                Script::Reply("fine".to_string()),
            ],
            RetentionConfig::default(),
        );
        let agent_id = create_agent(&f.registry, "a.py").await;
        let bad = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "one", None)
            .await
            .unwrap();
        let good = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "two", None)
            .await
            .unwrap();

        let bad_view = wait_terminal(&f.queue, agent_id, bad).await;
        assert_eq!(bad_view.status, TaskStatus::Failed);
        assert!(bad_view.error.unwrap().message.contains("engine exploded"));
        assert_eq!(
            wait_terminal(&f.queue, agent_id, good).await.status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_failed_tool_call_fails_task_but_keeps_outcome() {
        let reply = format!(
            "{}\n<tool_call>{{\"tool\": \"read_file\", \"arguments\": {{\"start_line\": \"first\"}}}}</tool_call>",
            write_call("x = 1\n")
        );
        let f = fixture(vec![Script::Reply(reply)], RetentionConfig::default());
        let agent_id = create_agent(&f.registry, "a.py").await;
        let task_id = f
            .queue
            .enqueue(agent_id, TaskType::CodeGeneration, "go", None)
            .await
            .unwrap();

        let view = wait_terminal(&f.queue, agent_id, task_id).await;
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error.unwrap().kind, ErrorKind::Handler);
        let outcome = view.outcome.unwrap();
        assert_eq!(outcome.calls.len(), 2);
        assert!(outcome.calls[0].result.success);
    }

    #[tokio::test]
    async fn test_agents_run_in_parallel() {
        let f = fixture(
            vec![
                Script::Slow(Duration::from_millis(400), "a".to_string()),
                Script::Slow(Duration::from_millis(400), "b".to_string()),
            ],
            RetentionConfig::default(),
        );
        let a = create_agent(&f.registry, "a.py").await;
        let b = create_agent(&f.registry, "b.py").await;

        let started = std::time::Instant::now();
        let ta = f.queue.enqueue(a, TaskType::Conversational, "x", None).await.unwrap();
        let tb = f.queue.enqueue(b, TaskType::Conversational, "y", None).await.unwrap();
        wait_terminal(&f.queue, a, ta).await;
        wait_terminal(&f.queue, b, tb).await;
        assert!(started.elapsed() < Duration::from_millis(750));
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let f = fixture(
            vec![
                Script::Slow(Duration::from_millis(200), "first".to_string()),
                Script::Reply(write_call("should not be written\n")),
            ],
            RetentionConfig::default(),
        );
        let agent_id = create_agent(&f.registry, "a.py").await;
        let first = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "one", None)
            .await
            .unwrap();
        let second = f
            .queue
            .enqueue(agent_id, TaskType::CodeGeneration, "two", None)
            .await
            .unwrap();

        let report = f.queue.cancel(agent_id, second).await.unwrap();
        assert_eq!(report.effect, CancelEffect::Cancelled);
        assert_eq!(report.task.status, TaskStatus::Cancelled);

        wait_terminal(&f.queue, agent_id, first).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.engine.prompt_count(), 1);
        assert!(!f._dir.path().join("a.py").exists());

        let again = f.queue.cancel(agent_id, first).await.unwrap();
        assert_eq!(again.effect, CancelEffect::AlreadyFinished);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let f = fixture(
            vec![Script::Slow(Duration::from_secs(10), "late".to_string())],
            RetentionConfig::default(),
        );
        let agent_id = create_agent(&f.registry, "a.py").await;
        let task_id = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "one", None)
            .await
            .unwrap();
        for _ in 0..100 {
            if f.queue.status(agent_id, task_id).await.unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = f.queue.cancel(agent_id, task_id).await.unwrap();
        assert_eq!(report.effect, CancelEffect::Signalled);
        let view = wait_terminal(&f.queue, agent_id, task_id).await;
        assert_eq!(view.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_task_of_other_agent_not_found() {
        let f = fixture(vec![], RetentionConfig::default());
        let a = create_agent(&f.registry, "a.py").await;
        let b = create_agent(&f.registry, "b.py").await;
        let task_id = f
            .queue
            .enqueue(a, TaskType::Conversational, "hi", None)
            .await
            .unwrap();
        let err = f.queue.status(b, task_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let f = fixture(vec![], RetentionConfig::default());
        let agent_id = create_agent(&f.registry, "a.py").await;
        let err = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "  ", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = f
            .queue
            .enqueue(
                agent_id,
                TaskType::Conversational,
                "hi",
                Some(Duration::ZERO),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = f
            .queue
            .enqueue(uuid::Uuid::new_v4(), TaskType::Conversational, "hi", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_stop_agent_cancels_queued_and_refuses_enqueue() {
        let f = fixture(
            vec![Script::Slow(Duration::from_millis(300), "first".to_string())],
            RetentionConfig::default(),
        );
        let agent_id = create_agent(&f.registry, "a.py").await;
        let first = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "one", None)
            .await
            .unwrap();
        let second = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "two", None)
            .await
            .unwrap();

        f.queue.stop_agent(agent_id).await;
        assert_eq!(
            f.queue.status(agent_id, second).await.unwrap().status,
            TaskStatus::Cancelled
        );
        let first_view = wait_terminal(&f.queue, agent_id, first).await;
        assert_eq!(first_view.status, TaskStatus::Cancelled);

        let err = f
            .queue
            .enqueue(agent_id, TaskType::Conversational, "three", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_stopped_agent_is_forgotten_once_drained() {
        let retention = RetentionConfig {
            max_age: Duration::from_secs(600),
            max_per_agent: 10,
            fetch_grace: Duration::from_secs(60),
        };
        let f = fixture(vec![], retention);
        let busy = create_agent(&f.registry, "a.py").await;
        let idle = create_agent(&f.registry, "b.py").await;

        let task_id = f
            .queue
            .enqueue(busy, TaskType::Conversational, "hi", None)
            .await
            .unwrap();
        wait_terminal(&f.queue, busy, task_id).await;
        f.queue.stop_agent(busy).await;
        f.queue.stop_agent(idle).await;

        // Within the grace period both stay retired
        assert_eq!(f.queue.sweep().await, 0);
        assert_eq!(f.queue.inner.state.lock().await.retired.len(), 2);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(f.queue.sweep_at(later).await, 1);
        let state = f.queue.inner.state.lock().await;
        assert!(state.retired.is_empty());
        assert!(state.order.is_empty());
        assert!(state.tasks.is_empty());
        assert!(state.workers.is_empty());
    }

    #[tokio::test]
    async fn test_retention_policy() {
        let retention = RetentionConfig {
            max_age: Duration::from_secs(600),
            max_per_agent: 2,
            fetch_grace: Duration::from_secs(60),
        };
        let f = fixture(vec![], retention);
        let agent_id = create_agent(&f.registry, "a.py").await;

        let mut ids = Vec::new();
        for i in 0..4 {
            let id = f
                .queue
                .enqueue(agent_id, TaskType::Conversational, &format!("q{}", i), None)
                .await
                .unwrap();
            wait_terminal(&f.queue, agent_id, id).await;
            ids.push(id);
        }

        // Everything is within the grace period: nothing goes
        assert_eq!(f.queue.sweep().await, 0);
        assert_eq!(f.queue.list(agent_id).await.unwrap().len(), 4);

        // Past the grace period: all four were fetched by wait_terminal
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(f.queue.sweep_at(later).await, 4);
        assert!(f.queue.list(agent_id).await.unwrap().is_empty());
        let err = f.queue.result(agent_id, ids[0]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_retention_keeps_unfetched_until_limits() {
        let retention = RetentionConfig {
            max_age: Duration::from_secs(600),
            max_per_agent: 2,
            fetch_grace: Duration::from_secs(60),
        };
        let f = fixture(vec![], retention);
        let agent_id = create_agent(&f.registry, "a.py").await;

        for i in 0..3 {
            let id = f
                .queue
                .enqueue(agent_id, TaskType::Conversational, &format!("q{}", i), None)
                .await
                .unwrap();
            for _ in 0..200 {
                if f.queue.status(agent_id, id).await.unwrap().status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        // Unfetched, past grace, under max age: only the overflow goes
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(f.queue.sweep_at(later).await, 1);
        assert_eq!(f.queue.list(agent_id).await.unwrap().len(), 2);

        // Past max age: the rest go
        let much_later = Utc::now() + chrono::Duration::seconds(700);
        assert_eq!(f.queue.sweep_at(much_later).await, 2);
    }
}
