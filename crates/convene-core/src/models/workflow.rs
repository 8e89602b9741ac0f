use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{Task, TaskOutput, TaskStatus};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for StepId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    AllSucceeded,
    PartialFailure,
    Aborted,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupResult {
    /// Terminal tasks in input order.
    pub results: Vec<Task>,
    pub aggregate_status: AggregateStatus,
}

impl TaskGroupResult {
    pub(crate) fn from_terminal(results: Vec<Task>) -> Self {
        let completed = results
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .count();
        let aggregate_status = if completed == results.len() {
            AggregateStatus::AllSucceeded
        } else if completed > 0 {
            AggregateStatus::PartialFailure
        } else {
            AggregateStatus::Aborted
        };

        Self {
            results,
            aggregate_status,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.aggregate_status == AggregateStatus::AllSucceeded
    }

    pub fn outputs(&self) -> impl Iterator<Item = &TaskOutput> {
        self.results.iter().filter_map(|task| task.result.as_ref())
    }

    /// The failure that triggered fail-fast, if any task failed outright.
    pub fn first_failure(&self) -> Option<&Task> {
        self.results
            .iter()
            .find(|task| task.status == TaskStatus::Failed)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    PartiallyCompleted,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: StepId,
    pub agent_name: String,
    pub operation: String,
    pub status: StepStatus,
    pub group: Option<TaskGroupResult>,
    /// Why the step did not complete: failure message, skipped dependency or cancellation.
    pub reason: Option<String>,
    pub reselections: u32,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub steps: BTreeMap<StepId, StepReport>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

impl WorkflowResult {
    pub(crate) fn status_for(steps: &BTreeMap<StepId, StepReport>) -> WorkflowStatus {
        let completed = steps
            .values()
            .filter(|report| report.status == StepStatus::Completed)
            .count();
        if completed == steps.len() {
            WorkflowStatus::Completed
        } else if completed == 0 {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::PartiallyCompleted
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepReport> {
        self.steps.get(&StepId::from(step_id))
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step(step_id).map(|report| report.status)
    }
}
