use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::models::{
    CoreError, CoreResult, Task, TaskGroupResult, TaskId, TaskOutput, TaskPayload,
};
use crate::orchestration::{RetryPolicy, TaskCancellationToken, TaskGroup};

pub type CapabilityFuture = Pin<Box<dyn Future<Output = CoreResult<TaskOutput>> + Send>>;

#[derive(Clone, Debug)]
pub struct CapabilityRequest {
    pub task_id: TaskId,
    pub attempt: u32,
    pub payload: TaskPayload,
    pub token: TaskCancellationToken,
}

/// Turns one task payload into an output. Implementations may block on I/O; the agent
/// around them only bounds how many calls are in flight.
pub trait Capability: Send + Sync {
    fn execute(&self, request: CapabilityRequest) -> CapabilityFuture;
}

impl<F> Capability for F
where
    F: Fn(CapabilityRequest) -> CapabilityFuture + Send + Sync,
{
    fn execute(&self, request: CapabilityRequest) -> CapabilityFuture {
        self(request)
    }
}

#[derive(Clone)]
pub struct Agent {
    name: String,
    max_concurrency: usize,
    capability: Arc<dyn Capability>,
    gate: Arc<Semaphore>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        max_concurrency: usize,
        capability: Arc<dyn Capability>,
    ) -> CoreResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::validation("agent name must not be empty"));
        }
        if max_concurrency == 0 {
            return Err(CoreError::validation(format!(
                "agent '{name}' must allow at least one concurrent task"
            )));
        }

        Ok(Self {
            name,
            max_concurrency,
            capability,
            gate: Arc::new(Semaphore::new(max_concurrency)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    pub async fn run(&self, task: Task) -> Task {
        self.run_with(task, &RetryPolicy::default(), &TaskCancellationToken::new())
            .await
    }

    pub async fn run_batch(&self, tasks: Vec<Task>) -> CoreResult<TaskGroupResult> {
        TaskGroup::new(self.clone()).run(tasks).await
    }

    /// Drives one task to a terminal state, retrying retryable failures with backoff.
    ///
    /// The gate permit is held only around the capability call, never across a backoff
    /// sleep, and is released on every exit path by drop.
    pub async fn run_with(
        &self,
        mut task: Task,
        retry: &RetryPolicy,
        token: &TaskCancellationToken,
    ) -> Task {
        loop {
            if token.is_cancelled() {
                self.cancel_task(&mut task, token);
                return task;
            }

            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.cancel_task(&mut task, token);
                    return task;
                }
                permit = self.gate.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                task.fail(
                    CoreError::internal("agent concurrency gate was closed")
                        .attribute(Some(&self.name), Some(&task.id), None),
                );
                return task;
            };

            task.begin_attempt();
            tracing::debug!(
                agent = %self.name,
                task_id = %task.id,
                payload = task.payload.kind(),
                attempt = task.attempt_count,
                "task attempt started"
            );

            let request = CapabilityRequest {
                task_id: task.id.clone(),
                attempt: task.attempt_count,
                payload: task.payload.clone(),
                token: token.clone(),
            };
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                outcome = self.capability.execute(request) => Some(outcome),
            };
            drop(permit);

            let error = match outcome {
                None => {
                    self.cancel_task(&mut task, token);
                    return task;
                }
                Some(Ok(output)) => {
                    task.complete(output);
                    tracing::info!(
                        agent = %self.name,
                        task_id = %task.id,
                        attempts = task.attempt_count,
                        "task completed"
                    );
                    return task;
                }
                Some(Err(error)) => error.attribute(Some(&self.name), Some(&task.id), None),
            };

            if error.kind == crate::models::CoreErrorKind::Cancelled {
                task.cancel(Some(error));
                return task;
            }

            if !retry.should_retry(&error, task.attempt_count) {
                tracing::warn!(
                    agent = %self.name,
                    task_id = %task.id,
                    attempts = task.attempt_count,
                    kind = ?error.kind,
                    message = %error.message,
                    "task failed"
                );
                task.fail(error);
                return task;
            }

            let delay = retry.backoff(task.attempt_count);
            tracing::warn!(
                agent = %self.name,
                task_id = %task.id,
                attempt = task.attempt_count,
                max_attempts = retry.max_attempts,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                message = %error.message,
                "retrying task after transient error"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.cancel_task(&mut task, token);
                    return task;
                }
                _ = sleep(delay) => {}
            }
        }
    }

    fn cancel_task(&self, task: &mut Task, token: &TaskCancellationToken) {
        let reason = token
            .reason()
            .unwrap_or_else(|| "task cancelled before completion".to_string());
        tracing::debug!(
            agent = %self.name,
            task_id = %task.id,
            reason = %reason,
            "task cancelled"
        );
        task.cancel(Some(CoreError::cancelled(reason).attribute(
            Some(&self.name),
            Some(&task.id),
            None,
        )));
    }
}
