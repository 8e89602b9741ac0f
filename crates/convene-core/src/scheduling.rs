use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::availability;
use crate::config::SchedulerConfig;
use crate::models::{
    AvailabilityQuery, BookRequest, BusinessHours, CoreError, CoreResult, DeliveryReceipt,
    LookaheadWindow, MeetingHandle, NotifyRequest, ParticipantId, SelectSlotRequest,
    StepStatus, Task, TaskOutput, TaskPayload, TimeSlot, WorkflowResult,
};
use crate::orchestration::{
    Agent, AgentRegistry, OrchestratorStats, RunOptions, StepInputs, TaskCancellationToken,
    Workflow, WorkflowOrchestrator, WorkflowStep,
};
use crate::providers::{
    BOOKING_AGENT, BookingCapability, CALENDAR_AGENT, CalendarCapability, CalendarProvider,
    MeetingBooker, NOTIFICATION_AGENT, NotificationCapability, Notifier, SLOT_SELECTOR_AGENT,
    SlotSelectionCapability,
};

pub const FETCH_AVAILABILITY_STEP: &str = "fetch-availability";
pub const SELECT_SLOT_STEP: &str = "select-slot";
pub const BOOK_MEETING_STEP: &str = "book-meeting";
pub const NOTIFY_STEP: &str = "notify";
pub const CANCEL_BOOKING_STEP: &str = "cancel-booking";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InterviewRequest {
    pub request_id: String,
    pub candidate: ParticipantId,
    pub interviewers: Vec<ParticipantId>,
    pub duration_minutes: u32,
    /// When false the workflow stops after proposing candidate slots.
    pub auto_select: bool,
    /// First local date of the lookahead window.
    pub start_date: NaiveDate,
    pub subject: Option<String>,
}

impl InterviewRequest {
    pub fn new(
        request_id: impl Into<String>,
        candidate: impl Into<ParticipantId>,
        interviewers: impl IntoIterator<Item = impl Into<ParticipantId>>,
        duration_minutes: u32,
        start_date: NaiveDate,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            candidate: candidate.into(),
            interviewers: interviewers.into_iter().map(Into::into).collect(),
            duration_minutes,
            auto_select: true,
            start_date,
            subject: None,
        }
    }

    pub fn proposal_only(mut self) -> Self {
        self.auto_select = false;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Candidate first, then interviewers in request order.
    pub fn participants(&self) -> Vec<ParticipantId> {
        std::iter::once(self.candidate.clone())
            .chain(self.interviewers.iter().cloned())
            .collect()
    }

    pub fn subject(&self) -> String {
        self.subject
            .clone()
            .unwrap_or_else(|| format!("Interview: {}", self.candidate))
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.request_id.trim().is_empty() {
            return Err(CoreError::validation("interview request id must not be empty"));
        }
        if self.candidate.as_str().trim().is_empty() {
            return Err(self.invalid("candidate must not be empty"));
        }
        if self.interviewers.is_empty() {
            return Err(self.invalid("at least one interviewer is required"));
        }
        if self.duration_minutes == 0 {
            return Err(self.invalid("interview duration must be positive"));
        }

        let mut seen = BTreeSet::new();
        for participant in self.participants() {
            if participant.as_str().trim().is_empty() {
                return Err(self.invalid("interviewer ids must not be empty"));
            }
            if !seen.insert(participant.clone()) {
                return Err(self.invalid(&format!("participant '{participant}' is listed twice")));
            }
        }
        Ok(())
    }

    /// A slot handed back by a caller must be a resolved slot for exactly this request.
    fn check_slot(&self, slot: &TimeSlot) -> CoreResult<()> {
        if slot.start() >= slot.end() {
            return Err(self.invalid(&format!("slot {slot} ends before it starts")));
        }
        let minutes = (slot.end() - slot.start()).num_minutes();
        if minutes != i64::from(self.duration_minutes) {
            return Err(self.invalid(&format!(
                "slot {slot} lasts {minutes} minutes, expected {}",
                self.duration_minutes
            )));
        }
        let missing: Vec<String> = self
            .participants()
            .into_iter()
            .filter(|participant| !slot.attendees().contains(participant))
            .map(|participant| participant.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(self.invalid(&format!(
                "slot {slot} was not resolved for [{}]",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> CoreError {
        CoreError::validation(format!("interview request '{}': {reason}", self.request_id))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewStatus {
    Scheduled,
    Pending,
    Cancelled,
    Failed,
}

/// Caller-facing digest of a scheduling, confirmation, rescheduling or cancellation workflow.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InterviewOutcome {
    pub workflow_id: String,
    pub status: InterviewStatus,
    pub scheduled_slot: Option<TimeSlot>,
    pub meeting: Option<MeetingHandle>,
    pub receipts: Vec<DeliveryReceipt>,
    pub candidates: Vec<TimeSlot>,
    pub error: Option<String>,
}

impl InterviewOutcome {
    pub fn from_workflow(result: &WorkflowResult) -> Self {
        let candidates = step_outputs(result, SELECT_SLOT_STEP)
            .find_map(|output| match output {
                TaskOutput::SlotSelection { candidates, .. } => Some(candidates.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let meeting = step_outputs(result, BOOK_MEETING_STEP).find_map(|output| match output {
            TaskOutput::Booked(meeting) => Some(meeting.clone()),
            _ => None,
        });
        let scheduled_slot = meeting.as_ref().and(
            result
                .step(BOOK_MEETING_STEP)
                .and_then(|report| report.group.as_ref())
                .and_then(|group| {
                    group.results.iter().find_map(|task| match &task.payload {
                        TaskPayload::Book(book) => Some(book.slot.clone()),
                        _ => None,
                    })
                }),
        );
        let receipts = step_outputs(result, NOTIFY_STEP)
            .filter_map(|output| match output {
                TaskOutput::Delivered(receipt) => Some(receipt.clone()),
                _ => None,
            })
            .collect();

        let completed = |step_id: &str| result.step_status(step_id) == Some(StepStatus::Completed);
        let status = if completed(BOOK_MEETING_STEP) {
            InterviewStatus::Scheduled
        } else if completed(CANCEL_BOOKING_STEP) && result.step(BOOK_MEETING_STEP).is_none() {
            InterviewStatus::Cancelled
        } else if completed(SELECT_SLOT_STEP) && result.step(BOOK_MEETING_STEP).is_none() {
            InterviewStatus::Pending
        } else {
            InterviewStatus::Failed
        };

        let error = result
            .steps
            .values()
            .filter(|report| report.status != StepStatus::Completed)
            .min_by_key(|report| match report.status {
                StepStatus::Failed => 0,
                StepStatus::Cancelled => 1,
                _ => 2,
            })
            .and_then(|report| {
                report
                    .reason
                    .as_ref()
                    .map(|reason| format!("{}: {reason}", report.step_id))
            });

        Self {
            workflow_id: result.workflow_id.clone(),
            status,
            scheduled_slot,
            meeting,
            receipts,
            candidates,
            error,
        }
    }
}

fn step_outputs<'a>(
    result: &'a WorkflowResult,
    step_id: &str,
) -> impl Iterator<Item = &'a TaskOutput> + 'a {
    result
        .step(step_id)
        .and_then(|report| report.group.as_ref())
        .into_iter()
        .flat_map(|group| group.outputs())
}

/// Builds the agents for one set of ports and runs interview workflows against them.
///
/// Sibling workflows started from the same scheduler share agent concurrency gates.
#[derive(Clone, Debug)]
pub struct InterviewScheduler {
    config: SchedulerConfig,
    business_hours: BusinessHours,
    orchestrator: WorkflowOrchestrator,
}

impl InterviewScheduler {
    pub fn new(
        config: SchedulerConfig,
        calendar: Arc<dyn CalendarProvider>,
        booker: Arc<dyn MeetingBooker>,
        notifier: Arc<dyn Notifier>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let business_hours = config.business_hours()?;
        let limits = config.agents;

        let registry = AgentRegistry::new([
            Agent::new(
                CALENDAR_AGENT,
                limits.calendar,
                Arc::new(CalendarCapability::new(calendar)),
            )?,
            Agent::new(
                SLOT_SELECTOR_AGENT,
                limits.slot_selection,
                Arc::new(SlotSelectionCapability),
            )?,
            Agent::new(
                BOOKING_AGENT,
                limits.booking,
                Arc::new(BookingCapability::new(booker)),
            )?,
            Agent::new(
                NOTIFICATION_AGENT,
                limits.notification,
                Arc::new(NotificationCapability::new(notifier)),
            )?,
        ])?;

        let orchestrator = WorkflowOrchestrator::new(Arc::new(registry))
            .retry_policy(config.retry_policy()?)
            .max_concurrent_steps(config.max_concurrent_steps)
            .max_reselections(config.max_reselections());

        Ok(Self {
            config,
            business_hours,
            orchestrator,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.orchestrator
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.orchestrator.stats()
    }

    pub fn availability_query(&self, request: &InterviewRequest) -> AvailabilityQuery {
        AvailabilityQuery {
            duration_minutes: request.duration_minutes,
            granularity_minutes: self.config.granularity_minutes,
            window: LookaheadWindow {
                start_date: request.start_date,
                days: self.config.lookahead_days,
            },
            business_hours: self.business_hours,
            weekdays_only: self.config.weekdays_only,
            max_slots: Some(self.config.max_candidates).filter(|limit| *limit > 0),
        }
    }

    pub async fn schedule_interview(
        &self,
        request: &InterviewRequest,
    ) -> CoreResult<WorkflowResult> {
        self.schedule_interview_with(request, TaskCancellationToken::new())
            .await
    }

    /// As `schedule_interview`, cancelled as a whole when `cancellation` fires.
    pub async fn schedule_interview_with(
        &self,
        request: &InterviewRequest,
        cancellation: TaskCancellationToken,
    ) -> CoreResult<WorkflowResult> {
        let workflow = self.scheduling_workflow(request)?;
        tracing::info!(
            request_id = %request.request_id,
            participants = request.interviewers.len() + 1,
            auto_select = request.auto_select,
            "scheduling interview"
        );
        self.orchestrator
            .run_with(&workflow, self.run_options(cancellation))
            .await
    }

    /// Runs every request as an independent sibling workflow; results keep request order.
    pub async fn process_batch(
        &self,
        requests: &[InterviewRequest],
    ) -> Vec<CoreResult<WorkflowResult>> {
        tracing::info!(requests = requests.len(), "processing interview batch");
        join_all(
            requests
                .iter()
                .map(|request| self.schedule_interview(request)),
        )
        .await
    }

    /// Books a slot the caller picked from proposed candidates, then sends invitations.
    pub async fn confirm_slot(
        &self,
        request: &InterviewRequest,
        slot: TimeSlot,
    ) -> CoreResult<WorkflowResult> {
        request.validate()?;
        request.check_slot(&slot)?;

        let book = WorkflowStep::new(
            BOOK_MEETING_STEP,
            BOOKING_AGENT,
            "book",
            vec![book_task(request, slot)?],
        );
        let workflow = Workflow::new(
            format!("{}:confirm", request.request_id),
            vec![book, self.invitation_step(request)],
        )?;
        self.orchestrator
            .run_with(&workflow, self.run_options(TaskCancellationToken::new()))
            .await
    }

    /// Releases `old_event_id`, books `new_slot` and sends fresh invitations.
    ///
    /// The new slot is only booked once the old event is gone; a failed release leaves the
    /// existing booking untouched.
    pub async fn reschedule_interview(
        &self,
        request: &InterviewRequest,
        old_event_id: &str,
        new_slot: TimeSlot,
    ) -> CoreResult<WorkflowResult> {
        request.validate()?;
        request.check_slot(&new_slot)?;

        let release = cancel_step(request, old_event_id)?;
        let book = WorkflowStep::new(
            BOOK_MEETING_STEP,
            BOOKING_AGENT,
            "book",
            vec![book_task(request, new_slot)?],
        )
        .depends_on(CANCEL_BOOKING_STEP);
        let workflow = Workflow::new(
            format!("{}:reschedule", request.request_id),
            vec![release, book, self.invitation_step(request)],
        )?;
        tracing::info!(
            request_id = %request.request_id,
            old_event_id,
            "rescheduling interview"
        );
        self.orchestrator
            .run_with(&workflow, self.run_options(TaskCancellationToken::new()))
            .await
    }

    pub async fn cancel_interview(
        &self,
        request: &InterviewRequest,
        event_id: &str,
        reason: &str,
    ) -> CoreResult<WorkflowResult> {
        request.validate()?;
        let cancel = cancel_step(request, event_id)?;
        let context = json!({
            "request_id": request.request_id,
            "candidate": request.candidate,
            "event_id": event_id,
            "reason": reason,
        });
        let notices = notification_tasks(
            request,
            &self.config.cancellation_template,
            &context,
        )?;
        let notify = WorkflowStep::new(NOTIFY_STEP, NOTIFICATION_AGENT, "notify", notices)
            .depends_on(CANCEL_BOOKING_STEP);

        let workflow = Workflow::new(
            format!("{}:cancel", request.request_id),
            vec![cancel, notify],
        )?;
        tracing::info!(
            request_id = %request.request_id,
            event_id,
            "cancelling interview"
        );
        self.orchestrator
            .run_with(&workflow, self.run_options(TaskCancellationToken::new()))
            .await
    }

    /// fetch-availability -> select-slot, then book-meeting -> notify unless proposal-only.
    pub fn scheduling_workflow(&self, request: &InterviewRequest) -> CoreResult<Workflow> {
        request.validate()?;
        let query = self.availability_query(request);
        let window = availability::search_window(&query)?;

        let fetches = request
            .participants()
            .into_iter()
            .map(|participant| {
                Task::new(
                    format!("fetch:{participant}"),
                    "fetch busy intervals",
                    TaskPayload::FetchBusy {
                        participant,
                        window,
                    },
                )
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let fetch = WorkflowStep::new(
            FETCH_AVAILABILITY_STEP,
            CALENDAR_AGENT,
            "fetch_busy",
            fetches,
        );

        let participants = request.participants();
        let auto_select = request.auto_select;
        let select_task_id = format!("select:{}", request.request_id);
        let select = WorkflowStep::deferred(
            SELECT_SLOT_STEP,
            SLOT_SELECTOR_AGENT,
            "select_slot",
            move |inputs: &StepInputs<'_>| {
                let mut busy: BTreeMap<ParticipantId, Vec<_>> = participants
                    .iter()
                    .map(|participant| (participant.clone(), Vec::new()))
                    .collect();
                for output in inputs.outputs(FETCH_AVAILABILITY_STEP) {
                    if let TaskOutput::BusyIntervals {
                        participant,
                        intervals,
                    } = output
                    {
                        busy.entry(participant.clone())
                            .or_default()
                            .extend(intervals.iter().cloned());
                    }
                }

                Ok(vec![Task::new(
                    select_task_id.clone(),
                    "select interview slot",
                    TaskPayload::SelectSlot(SelectSlotRequest {
                        busy,
                        query: query.clone(),
                        auto_select,
                        skip: inputs.reselection as usize,
                    }),
                )?])
            },
        )
        .depends_on(FETCH_AVAILABILITY_STEP);

        let mut steps = vec![fetch, select];
        if request.auto_select {
            let booking_request = request.clone();
            let book = WorkflowStep::deferred(
                BOOK_MEETING_STEP,
                BOOKING_AGENT,
                "book",
                move |inputs: &StepInputs<'_>| {
                    let slot = inputs
                        .outputs(SELECT_SLOT_STEP)
                        .find_map(|output| match output {
                            TaskOutput::SlotSelection {
                                selected: Some(slot),
                                ..
                            } => Some(slot.clone()),
                            _ => None,
                        })
                        .ok_or_else(|| {
                            CoreError::internal("slot selection completed without a slot")
                        })?;
                    Ok(vec![book_task(&booking_request, slot)?])
                },
            )
            .depends_on(SELECT_SLOT_STEP)
            .reselect_on_conflict(SELECT_SLOT_STEP)
            .sequential();
            steps.push(book);
            steps.push(self.invitation_step(request));
        }

        Workflow::new(format!("{}:schedule", request.request_id), steps)
    }

    /// Per-recipient invitations built from the booked meeting.
    fn invitation_step(&self, request: &InterviewRequest) -> WorkflowStep {
        let request = request.clone();
        let template_id = self.config.notification_template.clone();
        WorkflowStep::deferred(
            NOTIFY_STEP,
            NOTIFICATION_AGENT,
            "notify",
            move |inputs: &StepInputs<'_>| {
                let booked = inputs.group(BOOK_MEETING_STEP).and_then(|group| {
                    group.results.iter().find_map(|task| {
                        match (&task.payload, &task.result) {
                            (TaskPayload::Book(book), Some(TaskOutput::Booked(meeting))) => {
                                Some((book.slot.clone(), meeting.clone()))
                            }
                            _ => None,
                        }
                    })
                });
                let Some((slot, meeting)) = booked else {
                    return Err(CoreError::internal(
                        "booking completed without a meeting handle",
                    ));
                };

                let context = json!({
                    "request_id": request.request_id,
                    "candidate": request.candidate,
                    "interviewers": request.interviewers,
                    "subject": request.subject(),
                    "start": slot.start(),
                    "end": slot.end(),
                    "duration_minutes": request.duration_minutes,
                    "event_id": meeting.event_id,
                    "location": meeting.location,
                    "join_url": meeting.join_url,
                });
                notification_tasks(&request, &template_id, &context)
            },
        )
        .depends_on(BOOK_MEETING_STEP)
    }

    fn run_options(&self, cancellation: TaskCancellationToken) -> RunOptions {
        RunOptions {
            deadline: self.config.workflow_deadline(),
            cancellation,
        }
    }
}

fn book_task(request: &InterviewRequest, slot: TimeSlot) -> CoreResult<Task> {
    Task::new(
        format!("book:{}", request.request_id),
        "book interview",
        TaskPayload::Book(BookRequest {
            slot,
            attendees: request.participants(),
            subject: request.subject(),
        }),
    )
}

fn cancel_step(request: &InterviewRequest, event_id: &str) -> CoreResult<WorkflowStep> {
    if event_id.trim().is_empty() {
        return Err(request.invalid("event id to cancel must not be empty"));
    }
    Ok(WorkflowStep::new(
        CANCEL_BOOKING_STEP,
        BOOKING_AGENT,
        "cancel_booking",
        vec![Task::new(
            format!("cancel:{}", request.request_id),
            "cancel booking",
            TaskPayload::CancelBooking {
                event_id: event_id.to_string(),
            },
        )?],
    ))
}

fn notification_tasks(
    request: &InterviewRequest,
    template_id: &str,
    context: &serde_json::Value,
) -> CoreResult<Vec<Task>> {
    request
        .participants()
        .into_iter()
        .map(|recipient| {
            Task::new(
                format!("notify:{recipient}"),
                "send notification",
                TaskPayload::Notify(NotifyRequest {
                    recipients: vec![recipient],
                    template_id: template_id.to_string(),
                    context: context.clone(),
                }),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::InterviewRequest;
    use crate::models::CoreErrorKind;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()
    }

    #[test]
    fn participants_put_the_candidate_first() {
        let request = InterviewRequest::new("req-1", "cand", ["ivy", "ian"], 60, monday());
        let ids: Vec<String> = request
            .participants()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(ids, vec!["cand", "ivy", "ian"]);
        assert_eq!(request.subject(), "Interview: cand");
    }

    #[test]
    fn requests_without_interviewers_or_with_duplicates_are_rejected() {
        let empty: [&str; 0] = [];
        let lonely = InterviewRequest::new("req-1", "cand", empty, 60, monday());
        assert_eq!(lonely.validate().unwrap_err().kind, CoreErrorKind::Validation);

        let twice = InterviewRequest::new("req-2", "cand", ["ivy", "cand"], 60, monday());
        assert_eq!(twice.validate().unwrap_err().kind, CoreErrorKind::Validation);

        let zero = InterviewRequest::new("req-3", "cand", ["ivy"], 0, monday());
        assert!(zero.validate().is_err());
    }
}
