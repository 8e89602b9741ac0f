pub mod agent;
pub mod cancellation;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod task_group;
pub mod workflow;

pub use agent::{Agent, Capability, CapabilityFuture, CapabilityRequest};
pub use cancellation::TaskCancellationToken;
pub use orchestrator::{
    DEFAULT_MAX_CONCURRENT_STEPS, OrchestratorStats, RunOptions, WorkflowOrchestrator,
};
pub use registry::AgentRegistry;
pub use retry::RetryPolicy;
pub use task_group::{ExecutionMode, TaskGroup};
pub use workflow::{StepInputs, StepTasks, TaskBuilder, Workflow, WorkflowStep};
