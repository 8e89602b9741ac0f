pub mod availability;
pub mod config;
pub mod models;
pub mod orchestration;
pub mod providers;
pub mod scheduling;
pub mod telemetry;

pub use config::SchedulerConfig;
pub use scheduling::{InterviewOutcome, InterviewRequest, InterviewScheduler, InterviewStatus};
