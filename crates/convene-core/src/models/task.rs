use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{
    AvailabilityQuery, BusyInterval, CoreError, CoreResult, DeliveryReceipt, MeetingHandle,
    ParticipantId, TimeSlot, TimeWindow,
};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SelectSlotRequest {
    pub busy: BTreeMap<ParticipantId, Vec<BusyInterval>>,
    pub query: AvailabilityQuery,
    /// When false the task only proposes candidates and never picks one.
    pub auto_select: bool,
    /// Number of leading candidates already rejected by a booking conflict.
    pub skip: usize,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BookRequest {
    pub slot: TimeSlot,
    pub attendees: Vec<ParticipantId>,
    pub subject: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub recipients: Vec<ParticipantId>,
    pub template_id: String,
    pub context: serde_json::Value,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    FetchBusy {
        participant: ParticipantId,
        window: TimeWindow,
    },
    SelectSlot(SelectSlotRequest),
    Book(BookRequest),
    CancelBooking {
        event_id: String,
    },
    Notify(NotifyRequest),
    Custom {
        value: serde_json::Value,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchBusy { .. } => "fetch_busy",
            Self::SelectSlot(_) => "select_slot",
            Self::Book(_) => "book",
            Self::CancelBooking { .. } => "cancel_booking",
            Self::Notify(_) => "notify",
            Self::Custom { .. } => "custom",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    BusyIntervals {
        participant: ParticipantId,
        intervals: Vec<BusyInterval>,
    },
    SlotSelection {
        selected: Option<TimeSlot>,
        candidates: Vec<TimeSlot>,
    },
    Booked(MeetingHandle),
    BookingCancelled {
        event_id: String,
    },
    Delivered(DeliveryReceipt),
    Value {
        value: serde_json::Value,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub payload: TaskPayload,
    pub attempt_count: u32,
    pub status: TaskStatus,
    pub result: Option<TaskOutput>,
    pub error: Option<CoreError>,
    pub created_at: SystemTime,
    pub completed_at: Option<SystemTime>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        payload: TaskPayload,
    ) -> CoreResult<Self> {
        let id = id.into();
        let name = name.into();

        if id.0.trim().is_empty() {
            return Err(CoreError::validation("task id must not be empty"));
        }
        if name.trim().is_empty() {
            return Err(CoreError::validation(format!(
                "task '{id}' must have a non-empty name"
            )));
        }

        Ok(Self {
            id,
            name,
            payload,
            attempt_count: 0,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: SystemTime::now(),
            completed_at: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn begin_attempt(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Running;
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    pub(crate) fn complete(&mut self, output: TaskOutput) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(output);
        self.error = None;
        self.completed_at = Some(SystemTime::now());
    }

    pub(crate) fn fail(&mut self, error: CoreError) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(SystemTime::now());
    }

    /// Cancelling a task that already reached a terminal state is a no-op.
    pub(crate) fn cancel(&mut self, error: Option<CoreError>) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Cancelled;
        self.error = error;
        self.completed_at = Some(SystemTime::now());
    }
}

#[cfg(test)]
mod tests {
    use super::{Task, TaskOutput, TaskPayload, TaskStatus};
    use crate::models::{CoreError, CoreErrorKind};

    fn custom() -> TaskPayload {
        TaskPayload::Custom {
            value: serde_json::json!({ "n": 1 }),
        }
    }

    #[test]
    fn construction_requires_id_and_name() {
        let error = Task::new("", "fetch", custom()).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Validation);

        let error = Task::new("t-1", "  ", custom()).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Validation);

        let task = Task::new("t-1", "fetch", custom()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn terminal_tasks_are_immutable() {
        let mut task = Task::new("t-1", "fetch", custom()).unwrap();
        task.begin_attempt();
        task.complete(TaskOutput::Value {
            value: serde_json::Value::Null,
        });

        task.fail(CoreError::permanent("late failure"));
        task.cancel(None);
        task.begin_attempt();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 1);
        assert!(task.error.is_none());
    }
}
