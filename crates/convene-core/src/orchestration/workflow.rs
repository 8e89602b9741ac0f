use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::models::{CoreError, CoreResult, StepId, Task, TaskGroupResult, TaskOutput};
use crate::orchestration::ExecutionMode;

/// What a deferred step sees when it becomes runnable.
#[derive(Clone, Copy, Debug)]
pub struct StepInputs<'a> {
    pub completed: &'a BTreeMap<StepId, TaskGroupResult>,
    /// How many times this step has been re-run after a downstream booking conflict.
    pub reselection: u32,
}

impl<'a> StepInputs<'a> {
    pub fn group(&self, step_id: &str) -> Option<&'a TaskGroupResult> {
        self.completed.get(&StepId::from(step_id))
    }

    pub fn outputs(&self, step_id: &str) -> impl Iterator<Item = &'a TaskOutput> + 'a {
        self.group(step_id).into_iter().flat_map(TaskGroupResult::outputs)
    }
}

pub type TaskBuilder = Arc<dyn Fn(&StepInputs<'_>) -> CoreResult<Vec<Task>> + Send + Sync>;

#[derive(Clone)]
pub enum StepTasks {
    Static(Vec<Task>),
    Deferred(TaskBuilder),
}

#[derive(Clone)]
pub struct WorkflowStep {
    pub step_id: StepId,
    pub agent_name: String,
    pub operation: String,
    pub depends_on: BTreeSet<StepId>,
    /// Whether this step's own tasks run concurrently; ordering between steps comes from
    /// `depends_on` alone.
    pub parallel: bool,
    pub reselect_on_conflict: Option<StepId>,
    tasks: StepTasks,
}

impl std::fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("step_id", &self.step_id)
            .field("agent_name", &self.agent_name)
            .field("operation", &self.operation)
            .field("depends_on", &self.depends_on)
            .field("parallel", &self.parallel)
            .field("reselect_on_conflict", &self.reselect_on_conflict)
            .finish_non_exhaustive()
    }
}

impl WorkflowStep {
    pub fn new(
        step_id: impl Into<StepId>,
        agent_name: impl Into<String>,
        operation: impl Into<String>,
        tasks: Vec<Task>,
    ) -> Self {
        Self::with_tasks(step_id, agent_name, operation, StepTasks::Static(tasks))
    }

    pub fn deferred<F>(
        step_id: impl Into<StepId>,
        agent_name: impl Into<String>,
        operation: impl Into<String>,
        builder: F,
    ) -> Self
    where
        F: Fn(&StepInputs<'_>) -> CoreResult<Vec<Task>> + Send + Sync + 'static,
    {
        Self::with_tasks(
            step_id,
            agent_name,
            operation,
            StepTasks::Deferred(Arc::new(builder)),
        )
    }

    fn with_tasks(
        step_id: impl Into<StepId>,
        agent_name: impl Into<String>,
        operation: impl Into<String>,
        tasks: StepTasks,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            agent_name: agent_name.into(),
            operation: operation.into(),
            depends_on: BTreeSet::new(),
            parallel: true,
            reselect_on_conflict: None,
            tasks,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<StepId>) -> Self {
        self.depends_on.insert(step_id.into());
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// On a booking conflict, re-run `step_id` (a direct dependency) and then this step.
    pub fn reselect_on_conflict(mut self, step_id: impl Into<StepId>) -> Self {
        self.reselect_on_conflict = Some(step_id.into());
        self
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.parallel {
            ExecutionMode::Concurrent
        } else {
            ExecutionMode::Sequential
        }
    }

    pub(crate) fn build_tasks(&self, inputs: &StepInputs<'_>) -> CoreResult<Vec<Task>> {
        match &self.tasks {
            StepTasks::Static(tasks) => Ok(tasks.clone()),
            StepTasks::Deferred(builder) => builder(inputs),
        }
    }
}

/// A validated, acyclic step graph. Construction is the only place graph errors surface.
#[derive(Clone, Debug)]
pub struct Workflow {
    id: String,
    steps: BTreeMap<StepId, WorkflowStep>,
    order: Vec<StepId>,
    dependents: BTreeMap<StepId, BTreeSet<StepId>>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> CoreResult<Self> {
        let id = id.into();
        let declared: Vec<StepId> = steps.iter().map(|step| step.step_id.clone()).collect();
        let mut mapped = BTreeMap::new();

        for step in steps {
            if step.step_id.as_str().trim().is_empty() {
                return Err(CoreError::graph("step id must not be empty"));
            }
            if step.depends_on.contains(&step.step_id) {
                return Err(CoreError::graph(format!(
                    "step '{}' depends on itself",
                    step.step_id
                ))
                .attribute(None, None, Some(&step.step_id)));
            }
            let step_id = step.step_id.clone();
            if mapped.insert(step_id.clone(), step).is_some() {
                return Err(CoreError::graph(format!("duplicate step id '{step_id}'"))
                    .attribute(None, None, Some(&step_id)));
            }
        }

        let mut dependents: BTreeMap<StepId, BTreeSet<StepId>> = mapped
            .keys()
            .map(|step_id| (step_id.clone(), BTreeSet::new()))
            .collect();
        for step in mapped.values() {
            for dependency in &step.depends_on {
                let Some(children) = dependents.get_mut(dependency) else {
                    return Err(CoreError::graph(format!(
                        "step '{}' depends on undefined step '{dependency}'",
                        step.step_id
                    ))
                    .attribute(None, None, Some(&step.step_id)));
                };
                children.insert(step.step_id.clone());
            }
            if let Some(target) = &step.reselect_on_conflict
                && !step.depends_on.contains(target)
            {
                return Err(CoreError::graph(format!(
                    "step '{}' can only reselect through a direct dependency, not '{target}'",
                    step.step_id
                ))
                .attribute(None, None, Some(&step.step_id)));
            }
        }

        let order = topological_order(&declared, &mapped, &dependents)?;

        Ok(Self {
            id,
            steps: mapped,
            order,
            dependents,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, step_id: &StepId) -> Option<&WorkflowStep> {
        self.steps.get(step_id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.order.iter().filter_map(|step_id| self.steps.get(step_id))
    }

    /// Dependencies before dependents; ties keep declaration order.
    pub fn topological_order(&self) -> &[StepId] {
        &self.order
    }

    pub fn dependents(&self, step_id: &StepId) -> impl Iterator<Item = &StepId> {
        self.dependents.get(step_id).into_iter().flatten()
    }

    /// Every step that transitively depends on `step_id`.
    pub fn descendants(&self, step_id: &StepId) -> BTreeSet<StepId> {
        let mut found = BTreeSet::new();
        let mut frontier: Vec<&StepId> = self.dependents(step_id).collect();
        while let Some(next) = frontier.pop() {
            if found.insert(next.clone()) {
                frontier.extend(self.dependents(next));
            }
        }
        found
    }
}

fn topological_order(
    declared: &[StepId],
    steps: &BTreeMap<StepId, WorkflowStep>,
    dependents: &BTreeMap<StepId, BTreeSet<StepId>>,
) -> CoreResult<Vec<StepId>> {
    let position: BTreeMap<&StepId, usize> = declared
        .iter()
        .enumerate()
        .map(|(index, step_id)| (step_id, index))
        .collect();
    let mut remaining: BTreeMap<&StepId, usize> = steps
        .iter()
        .map(|(step_id, step)| (step_id, step.depends_on.len()))
        .collect();

    let mut ready: VecDeque<&StepId> = declared
        .iter()
        .filter(|step_id| remaining.get(step_id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(step_id) = ready.pop_front() {
        order.push(step_id.clone());
        let mut unblocked = Vec::new();
        for child in dependents.get(step_id).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    unblocked.push(child);
                }
            }
        }
        unblocked.sort_by_key(|child| position.get(child).copied().unwrap_or(usize::MAX));
        ready.extend(unblocked);
    }

    if order.len() != steps.len() {
        let cyclic: Vec<&str> = remaining
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(step_id, _)| step_id.as_str())
            .collect();
        return Err(CoreError::graph(format!(
            "workflow contains a dependency cycle through steps [{}]",
            cyclic.join(", ")
        )));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::{Workflow, WorkflowStep};
    use crate::models::{CoreErrorKind, StepId};

    fn step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, "calendar-agent", "noop", Vec::new())
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let workflow = Workflow::new(
            "wf",
            vec![
                step("notify").depends_on("book"),
                step("book").depends_on("select"),
                step("fetch"),
                step("select").depends_on("fetch"),
            ],
        )
        .unwrap();

        let order: Vec<&str> = workflow
            .topological_order()
            .iter()
            .map(StepId::as_str)
            .collect();
        assert_eq!(order, vec!["fetch", "select", "book", "notify"]);
    }

    #[test]
    fn cycles_fail_construction() {
        let error = Workflow::new(
            "wf",
            vec![
                step("a").depends_on("c"),
                step("b").depends_on("a"),
                step("c").depends_on("b"),
                step("d"),
            ],
        )
        .unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::Graph);
        assert!(error.message.contains("a, b, c"));
    }

    #[test]
    fn missing_and_self_dependencies_fail_construction() {
        let missing = Workflow::new("wf", vec![step("a").depends_on("ghost")]).unwrap_err();
        assert_eq!(missing.kind, CoreErrorKind::Graph);

        let looped = Workflow::new("wf", vec![step("a").depends_on("a")]).unwrap_err();
        assert_eq!(looped.kind, CoreErrorKind::Graph);

        let duplicate = Workflow::new("wf", vec![step("a"), step("a")]).unwrap_err();
        assert_eq!(duplicate.kind, CoreErrorKind::Graph);
    }

    #[test]
    fn reselection_target_must_be_a_direct_dependency() {
        let error = Workflow::new(
            "wf",
            vec![
                step("fetch"),
                step("select").depends_on("fetch"),
                step("book")
                    .depends_on("select")
                    .reselect_on_conflict("fetch"),
            ],
        )
        .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Graph);
    }

    #[test]
    fn descendants_are_transitive() {
        let workflow = Workflow::new(
            "wf",
            vec![
                step("a"),
                step("b").depends_on("a"),
                step("c").depends_on("b"),
                step("d"),
            ],
        )
        .unwrap();

        let descendants = workflow.descendants(&StepId::from("a"));
        assert!(descendants.contains(&StepId::from("b")));
        assert!(descendants.contains(&StepId::from("c")));
        assert!(!descendants.contains(&StepId::from("d")));
    }
}
