use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::models::{CoreError, CoreResult, Task, TaskGroupResult, TaskStatus};
use crate::orchestration::{Agent, RetryPolicy, TaskCancellationToken};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Concurrent,
    Sequential,
}

/// Runs a batch of tasks under one agent with structured, fail-fast semantics.
///
/// `run` returns only after every task is terminal. The first task that fails after its
/// retry budget cancels its siblings through the group token; tasks that already completed
/// keep their results.
#[derive(Clone, Debug)]
pub struct TaskGroup {
    agent: Agent,
    mode: ExecutionMode,
    retry: RetryPolicy,
    parent: TaskCancellationToken,
}

impl TaskGroup {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            mode: ExecutionMode::Concurrent,
            retry: RetryPolicy::default(),
            parent: TaskCancellationToken::new(),
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ties the group to an outer scope; cancelling `parent` cancels every task in the group.
    pub fn cancellation(mut self, parent: TaskCancellationToken) -> Self {
        self.parent = parent;
        self
    }

    pub async fn run(&self, tasks: Vec<Task>) -> CoreResult<TaskGroupResult> {
        validate_batch(&tasks, self.agent.name())?;

        let group_token = self.parent.child();
        tracing::debug!(
            agent = %self.agent.name(),
            tasks = tasks.len(),
            mode = ?self.mode,
            "task group started"
        );

        let results = match self.mode {
            ExecutionMode::Concurrent => self.run_concurrent(tasks, &group_token).await,
            ExecutionMode::Sequential => self.run_sequential(tasks, &group_token).await,
        };

        let group = TaskGroupResult::from_terminal(results);
        tracing::debug!(
            agent = %self.agent.name(),
            aggregate = ?group.aggregate_status,
            "task group finished"
        );
        Ok(group)
    }

    async fn run_concurrent(
        &self,
        tasks: Vec<Task>,
        group_token: &TaskCancellationToken,
    ) -> Vec<Task> {
        let originals = tasks.clone();
        let mut slots: Vec<Option<Task>> = vec![None; tasks.len()];
        let mut join_set = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let agent = self.agent.clone();
            let retry = self.retry;
            let token = group_token.clone();
            join_set.spawn(async move {
                let task = agent.run_with(task, &retry, &token).await;
                if task.status == TaskStatus::Failed {
                    trigger_fail_fast(&agent, &task, &token);
                }
                (index, task)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, task)) => slots[index] = Some(task),
                Err(join_error) => {
                    tracing::error!(
                        agent = %self.agent.name(),
                        error = %join_error,
                        "task group member terminated abnormally"
                    );
                    group_token.cancel();
                }
            }
        }

        slots
            .into_iter()
            .zip(originals)
            .map(|(slot, mut original)| {
                slot.unwrap_or_else(|| {
                    original.fail(
                        CoreError::internal("task terminated without reporting an outcome")
                            .attribute(Some(self.agent.name()), Some(&original.id), None),
                    );
                    original
                })
            })
            .collect()
    }

    async fn run_sequential(
        &self,
        tasks: Vec<Task>,
        group_token: &TaskCancellationToken,
    ) -> Vec<Task> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            let task = self.agent.run_with(task, &self.retry, group_token).await;
            if task.status == TaskStatus::Failed {
                trigger_fail_fast(&self.agent, &task, group_token);
            }
            results.push(task);
        }
        results
    }
}

fn trigger_fail_fast(agent: &Agent, task: &Task, token: &TaskCancellationToken) {
    if token.is_cancelled() {
        return;
    }
    tracing::warn!(
        agent = %agent.name(),
        task_id = %task.id,
        "task failed; cancelling remaining tasks in group"
    );
    token.cancel_with_reason(format!("cancelled after sibling task '{}' failed", task.id));
}

fn validate_batch(tasks: &[Task], agent: &str) -> CoreResult<()> {
    let mut seen = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if task.status != TaskStatus::Pending {
            return Err(CoreError::validation(format!(
                "task '{}' was submitted in state '{:?}'",
                task.id, task.status
            ))
            .attribute(Some(agent), Some(&task.id), None));
        }
        if !seen.insert(&task.id) {
            return Err(CoreError::validation(format!(
                "duplicate task id '{}' in group",
                task.id
            ))
            .attribute(Some(agent), Some(&task.id), None));
        }
    }
    Ok(())
}
