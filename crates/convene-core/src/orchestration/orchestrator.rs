use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};

use crate::models::{
    CoreErrorKind, CoreResult, StepId, StepReport, StepStatus, TaskGroupResult,
    WorkflowResult, WorkflowStatus,
};
use crate::orchestration::{
    AgentRegistry, RetryPolicy, StepInputs, TaskCancellationToken, TaskGroup, Workflow,
};

pub const DEFAULT_MAX_CONCURRENT_STEPS: usize = 4;

type StepFuture = BoxFuture<'static, (StepId, CoreResult<TaskGroupResult>)>;

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Deadline for the whole workflow, measured from the start of `run_with`.
    pub deadline: Option<Duration>,
    /// Cancelling this token from outside cancels every running step.
    pub cancellation: TaskCancellationToken,
}

impl RunOptions {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub total_workflows: u64,
    pub completed_workflows: u64,
    pub partially_completed_workflows: u64,
    pub failed_workflows: u64,
}

impl OrchestratorStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_workflows == 0 {
            return 0.0;
        }
        self.completed_workflows as f64 / self.total_workflows as f64
    }

    fn record(&mut self, status: WorkflowStatus) {
        self.total_workflows = self.total_workflows.saturating_add(1);
        let counter = match status {
            WorkflowStatus::Completed => &mut self.completed_workflows,
            WorkflowStatus::PartiallyCompleted => &mut self.partially_completed_workflows,
            WorkflowStatus::Failed => &mut self.failed_workflows,
        };
        *counter = counter.saturating_add(1);
    }
}

/// Executes validated workflows: runnable steps launch as soon as every dependency has
/// completed, failed steps skip their transitive dependents, independent branches continue.
#[derive(Clone, Debug)]
pub struct WorkflowOrchestrator {
    registry: Arc<AgentRegistry>,
    retry: RetryPolicy,
    max_concurrent_steps: usize,
    max_reselections: u32,
    stats: Arc<Mutex<OrchestratorStats>>,
}

impl WorkflowOrchestrator {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
            max_concurrent_steps: DEFAULT_MAX_CONCURRENT_STEPS,
            max_reselections: 1,
            stats: Arc::new(Mutex::new(OrchestratorStats::default())),
        }
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_concurrent_steps(mut self, max_concurrent_steps: usize) -> Self {
        self.max_concurrent_steps = max_concurrent_steps.max(1);
        self
    }

    /// Zero surfaces booking conflicts immediately instead of re-running slot selection.
    pub fn max_reselections(mut self, max_reselections: u32) -> Self {
        self.max_reselections = max_reselections;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().map(|stats| *stats).unwrap_or_default()
    }

    pub async fn run(&self, workflow: &Workflow) -> CoreResult<WorkflowResult> {
        self.run_with(workflow, RunOptions::default()).await
    }

    /// Fails only when the workflow names an unregistered agent; every runtime failure is
    /// reported inside the returned `WorkflowResult`.
    pub async fn run_with(
        &self,
        workflow: &Workflow,
        options: RunOptions,
    ) -> CoreResult<WorkflowResult> {
        for step in workflow.steps() {
            self.registry
                .get(&step.agent_name)
                .map_err(|error| error.attribute(None, None, Some(&step.step_id)))?;
        }

        let started_at = SystemTime::now();
        let root = options.cancellation.child();
        let mut run = WorkflowRun::new(workflow);
        let mut in_flight: FuturesUnordered<StepFuture> = FuturesUnordered::new();
        let mut deadline_at = options.deadline.map(|deadline| Instant::now() + deadline);
        let mut timed_out = false;

        tracing::info!(
            workflow_id = %workflow.id(),
            steps = workflow.len(),
            "workflow started"
        );

        loop {
            if !root.is_cancelled() {
                self.launch_runnable(workflow, &mut run, &mut in_flight, &root);
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = wait_until(deadline_at), if deadline_at.is_some() => {
                    deadline_at = None;
                    timed_out = true;
                    tracing::warn!(workflow_id = %workflow.id(), "workflow deadline exceeded; cancelling");
                    root.cancel_with_reason("workflow deadline exceeded");
                }
                Some((step_id, outcome)) = in_flight.next() => {
                    self.settle(workflow, &mut run, step_id, outcome, &root);
                }
            }
        }

        let leftover_reason = if timed_out {
            "workflow deadline exceeded before the step could start"
        } else if root.is_cancelled() {
            "workflow cancelled before the step could start"
        } else {
            "step was never runnable"
        };
        for report in run.reports.values_mut() {
            if report.status == StepStatus::Pending {
                report.status = if root.is_cancelled() {
                    StepStatus::Cancelled
                } else {
                    StepStatus::Skipped
                };
                report.reason = Some(leftover_reason.to_string());
                report.finished_at = Some(SystemTime::now());
            }
        }

        let status = WorkflowResult::status_for(&run.reports);
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(status);
        }
        tracing::info!(workflow_id = %workflow.id(), status = ?status, "workflow finished");

        Ok(WorkflowResult {
            workflow_id: workflow.id().to_string(),
            status,
            steps: run.reports,
            started_at,
            finished_at: SystemTime::now(),
        })
    }

    fn launch_runnable(
        &self,
        workflow: &Workflow,
        run: &mut WorkflowRun,
        in_flight: &mut FuturesUnordered<StepFuture>,
        root: &TaskCancellationToken,
    ) {
        for step_id in workflow.topological_order() {
            if in_flight.len() >= self.max_concurrent_steps {
                return;
            }
            let Some(step) = workflow.step(step_id) else {
                continue;
            };
            if run.status(step_id) != StepStatus::Pending
                || !step
                    .depends_on
                    .iter()
                    .all(|dependency| run.status(dependency) == StepStatus::Completed)
            {
                continue;
            }

            let reselection = run.reselections.get(step_id).copied().unwrap_or(0);
            let inputs = StepInputs {
                completed: &run.completed,
                reselection,
            };
            let tasks = match step.build_tasks(&inputs) {
                Ok(tasks) => tasks,
                Err(error) => {
                    let error = error.attribute(Some(&step.agent_name), None, Some(step_id));
                    tracing::warn!(
                        workflow_id = %workflow.id(),
                        step_id = %step_id,
                        message = %error.message,
                        "step could not build its tasks"
                    );
                    run.fail(workflow, step_id, None, error.to_string());
                    continue;
                }
            };

            let Ok(agent) = self.registry.get(&step.agent_name) else {
                continue;
            };
            let group = TaskGroup::new(agent.clone())
                .mode(step.execution_mode())
                .retry_policy(self.retry)
                .cancellation(root.clone());

            run.start(step_id);
            tracing::info!(
                workflow_id = %workflow.id(),
                step_id = %step_id,
                agent = %step.agent_name,
                tasks = tasks.len(),
                parallel = step.parallel,
                "step started"
            );

            let step_id = step_id.clone();
            in_flight.push(
                async move {
                    let outcome = group.run(tasks).await;
                    (step_id, outcome)
                }
                .boxed(),
            );
        }
    }

    fn settle(
        &self,
        workflow: &Workflow,
        run: &mut WorkflowRun,
        step_id: StepId,
        outcome: CoreResult<TaskGroupResult>,
        root: &TaskCancellationToken,
    ) {
        let group = match outcome {
            Ok(group) => group,
            Err(error) => {
                tracing::warn!(
                    workflow_id = %workflow.id(),
                    step_id = %step_id,
                    message = %error.message,
                    "step rejected its task batch"
                );
                run.fail(workflow, &step_id, None, error.to_string());
                return;
            }
        };

        if group.succeeded() {
            tracing::info!(workflow_id = %workflow.id(), step_id = %step_id, "step completed");
            run.complete(&step_id, group);
            return;
        }

        let failure = group.first_failure().and_then(|task| task.error.clone());
        if failure.is_none() && root.is_cancelled() {
            run.cancel(&step_id, group, "workflow cancelled while the step was running");
            return;
        }

        if let Some(error) = &failure
            && error.kind == CoreErrorKind::Conflict
            && self.try_reselect(workflow, run, &step_id, &group)
        {
            return;
        }

        let reason = failure
            .map(|error| error.to_string())
            .unwrap_or_else(|| format!("task group ended {:?}", group.aggregate_status));
        tracing::warn!(
            workflow_id = %workflow.id(),
            step_id = %step_id,
            aggregate = ?group.aggregate_status,
            reason = %reason,
            "step failed"
        );
        run.fail(workflow, &step_id, Some(group), reason);
    }

    fn try_reselect(
        &self,
        workflow: &Workflow,
        run: &mut WorkflowRun,
        step_id: &StepId,
        group: &TaskGroupResult,
    ) -> bool {
        let Some(target) = workflow
            .step(step_id)
            .and_then(|step| step.reselect_on_conflict.clone())
        else {
            return false;
        };

        let used = run.reselections.get(&target).copied().unwrap_or(0);
        if used >= self.max_reselections {
            return false;
        }
        let siblings_untouched = workflow
            .dependents(&target)
            .filter(|dependent| *dependent != step_id)
            .all(|dependent| run.status(dependent) == StepStatus::Pending);
        if !siblings_untouched {
            return false;
        }

        tracing::warn!(
            workflow_id = %workflow.id(),
            step_id = %step_id,
            reselect = %target,
            reselection = used + 1,
            "booking conflict; re-running slot selection"
        );
        run.reselections.insert(target.clone(), used + 1);
        run.reset(&target);
        run.reset(step_id);
        if let Some(report) = run.reports.get_mut(step_id) {
            report.reselections = used + 1;
            report.group = Some(group.clone());
            report.reason = group
                .first_failure()
                .and_then(|task| task.error.as_ref())
                .map(|error| error.to_string());
        }
        true
    }
}

struct WorkflowRun {
    reports: BTreeMap<StepId, StepReport>,
    completed: BTreeMap<StepId, TaskGroupResult>,
    reselections: BTreeMap<StepId, u32>,
}

impl WorkflowRun {
    fn new(workflow: &Workflow) -> Self {
        let reports = workflow
            .steps()
            .map(|step| {
                (
                    step.step_id.clone(),
                    StepReport {
                        step_id: step.step_id.clone(),
                        agent_name: step.agent_name.clone(),
                        operation: step.operation.clone(),
                        status: StepStatus::Pending,
                        group: None,
                        reason: None,
                        reselections: 0,
                        started_at: None,
                        finished_at: None,
                    },
                )
            })
            .collect();

        Self {
            reports,
            completed: BTreeMap::new(),
            reselections: BTreeMap::new(),
        }
    }

    fn status(&self, step_id: &StepId) -> StepStatus {
        self.reports
            .get(step_id)
            .map(|report| report.status)
            .unwrap_or(StepStatus::Skipped)
    }

    fn start(&mut self, step_id: &StepId) {
        if let Some(report) = self.reports.get_mut(step_id) {
            report.status = StepStatus::Running;
            report.started_at = Some(SystemTime::now());
            report.finished_at = None;
        }
    }

    fn complete(&mut self, step_id: &StepId, group: TaskGroupResult) {
        if let Some(report) = self.reports.get_mut(step_id) {
            report.status = StepStatus::Completed;
            report.group = Some(group.clone());
            report.reason = None;
            report.finished_at = Some(SystemTime::now());
        }
        self.completed.insert(step_id.clone(), group);
    }

    fn cancel(&mut self, step_id: &StepId, group: TaskGroupResult, reason: &str) {
        if let Some(report) = self.reports.get_mut(step_id) {
            report.status = StepStatus::Cancelled;
            report.group = Some(group);
            report.reason = Some(reason.to_string());
            report.finished_at = Some(SystemTime::now());
        }
    }

    fn reset(&mut self, step_id: &StepId) {
        self.completed.remove(step_id);
        if let Some(report) = self.reports.get_mut(step_id) {
            report.status = StepStatus::Pending;
            report.finished_at = None;
        }
    }

    /// Marks the step failed and every pending transitive dependent skipped.
    fn fail(
        &mut self,
        workflow: &Workflow,
        step_id: &StepId,
        group: Option<TaskGroupResult>,
        reason: String,
    ) {
        let now = SystemTime::now();
        if let Some(report) = self.reports.get_mut(step_id) {
            report.status = StepStatus::Failed;
            report.group = group.or(report.group.take());
            report.reason = Some(reason);
            report.finished_at = Some(now);
        }

        for dependent in workflow.descendants(step_id) {
            if let Some(report) = self.reports.get_mut(&dependent)
                && report.status == StepStatus::Pending
            {
                tracing::info!(
                    workflow_id = %workflow.id(),
                    step_id = %dependent,
                    failed_dependency = %step_id,
                    "step skipped"
                );
                report.status = StepStatus::Skipped;
                report.reason = Some(format!("dependency '{step_id}' did not complete"));
                report.finished_at = Some(now);
            }
        }
    }
}

async fn wait_until(deadline_at: Option<Instant>) {
    match deadline_at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
