use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::availability;
use crate::models::{
    BookRequest, BusyInterval, CoreError, CoreResult, DeliveryReceipt, MeetingHandle,
    NotifyRequest, ParticipantId, SelectSlotRequest, TaskOutput, TaskPayload, TimeSlot,
    TimeWindow,
};
use crate::orchestration::{Capability, CapabilityFuture, CapabilityRequest};

pub const CALENDAR_AGENT: &str = "calendar-agent";
pub const SLOT_SELECTOR_AGENT: &str = "slot-selector";
pub const BOOKING_AGENT: &str = "booking-agent";
pub const NOTIFICATION_AGENT: &str = "notification-agent";

pub type ProviderFuture<T> = Pin<Box<dyn Future<Output = CoreResult<T>> + Send>>;

/// Free/busy lookup for a single participant.
///
/// Failures use `ProviderTransient` for rate limits and outages worth retrying and
/// `ProviderPermanent` for everything else.
pub trait CalendarProvider: Send + Sync {
    fn fetch_busy(
        &self,
        participant: ParticipantId,
        window: TimeWindow,
    ) -> ProviderFuture<Vec<BusyInterval>>;
}

pub trait MeetingBooker: Send + Sync {
    /// Fails with `Conflict` when the slot was taken after it was selected.
    fn book(
        &self,
        slot: TimeSlot,
        attendees: Vec<ParticipantId>,
        subject: String,
    ) -> ProviderFuture<MeetingHandle>;

    fn cancel(&self, event_id: String) -> ProviderFuture<()>;
}

pub trait Notifier: Send + Sync {
    fn send(
        &self,
        recipients: Vec<ParticipantId>,
        template_id: String,
        context: serde_json::Value,
    ) -> ProviderFuture<DeliveryReceipt>;
}

fn unsupported(agent: &str, payload: &TaskPayload) -> CapabilityFuture {
    let outcome: CoreResult<TaskOutput> = Err(CoreError::validation(format!(
        "{agent} cannot handle '{}' payloads",
        payload.kind()
    ))
    .attribute(Some(agent), None, None));
    Box::pin(async move { outcome })
}

pub struct CalendarCapability {
    provider: Arc<dyn CalendarProvider>,
}

impl CalendarCapability {
    pub fn new(provider: Arc<dyn CalendarProvider>) -> Self {
        Self { provider }
    }
}

impl Capability for CalendarCapability {
    fn execute(&self, request: CapabilityRequest) -> CapabilityFuture {
        match request.payload {
            TaskPayload::FetchBusy {
                participant,
                window,
            } => Box::pin(fetch_busy(
                Arc::clone(&self.provider),
                participant,
                window,
            )),
            other => unsupported(CALENDAR_AGENT, &other),
        }
    }
}

async fn fetch_busy(
    provider: Arc<dyn CalendarProvider>,
    participant: ParticipantId,
    window: TimeWindow,
) -> CoreResult<TaskOutput> {
    let fetched = provider.fetch_busy(participant.clone(), window).await?;
    let intervals = fetched
        .into_iter()
        .filter(|interval| interval.start < interval.end)
        .map(|interval| BusyInterval {
            participant_id: participant.clone(),
            ..interval
        })
        .collect();
    Ok(TaskOutput::BusyIntervals {
        participant,
        intervals,
    })
}

/// Runs the availability resolver. No I/O, so it never produces a retryable error.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlotSelectionCapability;

impl SlotSelectionCapability {
    pub fn select(request: &SelectSlotRequest) -> CoreResult<TaskOutput> {
        // Rejected candidates must not count against the cap.
        let mut query = request.query.clone();
        query.max_slots = query
            .max_slots
            .map(|limit| limit.saturating_add(request.skip));
        let resolved = availability::resolve(&request.busy, &query)?;
        let candidates: Vec<TimeSlot> = resolved.into_iter().skip(request.skip).collect();

        if !request.auto_select {
            return Ok(TaskOutput::SlotSelection {
                selected: None,
                candidates,
            });
        }

        let Some(selected) = candidates.first().cloned() else {
            return Err(CoreError::no_availability(if request.skip == 0 {
                "no common free slot in the lookahead window".to_string()
            } else {
                format!(
                    "no candidate slot left after {} rejected by booking conflicts",
                    request.skip
                )
            }));
        };
        Ok(TaskOutput::SlotSelection {
            selected: Some(selected),
            candidates,
        })
    }
}

impl Capability for SlotSelectionCapability {
    fn execute(&self, request: CapabilityRequest) -> CapabilityFuture {
        match &request.payload {
            TaskPayload::SelectSlot(select) => {
                let outcome = Self::select(select);
                Box::pin(async move { outcome })
            }
            other => unsupported(SLOT_SELECTOR_AGENT, other),
        }
    }
}

pub struct BookingCapability {
    booker: Arc<dyn MeetingBooker>,
}

impl BookingCapability {
    pub fn new(booker: Arc<dyn MeetingBooker>) -> Self {
        Self { booker }
    }
}

impl Capability for BookingCapability {
    fn execute(&self, request: CapabilityRequest) -> CapabilityFuture {
        match request.payload {
            TaskPayload::Book(book) => Box::pin(book_meeting(Arc::clone(&self.booker), book)),
            TaskPayload::CancelBooking { event_id } => {
                Box::pin(cancel_booking(Arc::clone(&self.booker), event_id))
            }
            other => unsupported(BOOKING_AGENT, &other),
        }
    }
}

async fn book_meeting(
    booker: Arc<dyn MeetingBooker>,
    book: BookRequest,
) -> CoreResult<TaskOutput> {
    let BookRequest {
        slot,
        attendees,
        subject,
    } = book;
    let meeting = booker.book(slot, attendees, subject).await?;
    Ok(TaskOutput::Booked(meeting))
}

async fn cancel_booking(
    booker: Arc<dyn MeetingBooker>,
    event_id: String,
) -> CoreResult<TaskOutput> {
    booker.cancel(event_id.clone()).await?;
    Ok(TaskOutput::BookingCancelled { event_id })
}

pub struct NotificationCapability {
    notifier: Arc<dyn Notifier>,
}

impl NotificationCapability {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl Capability for NotificationCapability {
    fn execute(&self, request: CapabilityRequest) -> CapabilityFuture {
        match request.payload {
            TaskPayload::Notify(notify) => Box::pin(notify_recipients(
                Arc::clone(&self.notifier),
                notify,
            )),
            other => unsupported(NOTIFICATION_AGENT, &other),
        }
    }
}

async fn notify_recipients(
    notifier: Arc<dyn Notifier>,
    notify: NotifyRequest,
) -> CoreResult<TaskOutput> {
    let receipt = notifier
        .send(notify.recipients, notify.template_id, notify.context)
        .await?;
    Ok(TaskOutput::Delivered(receipt))
}
