pub mod calendar;
pub mod error;
pub mod task;
pub mod workflow;

pub use calendar::{
    AvailabilityQuery, BusinessHours, BusyInterval, DeliveryReceipt, LookaheadWindow,
    MeetingHandle, ParticipantId, TimeSlot, TimeWindow,
};
pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use task::{
    BookRequest, NotifyRequest, SelectSlotRequest, Task, TaskId, TaskOutput, TaskPayload,
    TaskStatus,
};
pub use workflow::{
    AggregateStatus, StepId, StepReport, StepStatus, TaskGroupResult, WorkflowResult,
    WorkflowStatus,
};
