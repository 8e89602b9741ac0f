use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreResult};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open `[start, end)` range in UTC.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> CoreResult<Self> {
        if start >= end {
            return Err(CoreError::validation(format!(
                "time window start '{start}' must be before end '{end}'"
            )));
        }
        Ok(Self { start, end })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BusyInterval {
    pub participant_id: ParticipantId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BusyInterval {
    pub fn new(
        participant_id: impl Into<ParticipantId>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<Self> {
        let participant_id = participant_id.into();
        if start >= end {
            return Err(CoreError::validation(format!(
                "busy interval for '{participant_id}' must end after it starts"
            )));
        }
        Ok(Self {
            participant_id,
            start,
            end,
        })
    }
}

/// A conflict-free meeting window built by the availability resolver.
///
/// Slots deserialized from a caller are only trusted after `InterviewRequest` re-checks
/// them on the confirm and reschedule paths.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    attendees: BTreeSet<ParticipantId>,
}

impl TimeSlot {
    pub(crate) fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attendees: BTreeSet<ParticipantId>,
    ) -> Self {
        Self {
            start,
            end,
            attendees,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn attendees(&self) -> &BTreeSet<ParticipantId> {
        &self.attendees
    }

    pub fn overlaps(&self, interval: &BusyInterval) -> bool {
        self.start < interval.end && interval.start < self.end
    }
}

impl Display for TimeSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} - {}",
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%H:%M")
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub utc_offset_minutes: i32,
}

impl BusinessHours {
    pub fn new(start: NaiveTime, end: NaiveTime, utc_offset_minutes: i32) -> CoreResult<Self> {
        let hours = Self {
            start,
            end,
            utc_offset_minutes,
        };
        hours.validate()?;
        Ok(hours)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.start >= self.end {
            return Err(CoreError::validation(format!(
                "business hours start '{}' must be before end '{}'",
                self.start, self.end
            )));
        }
        self.offset().map(|_| ())
    }

    pub fn offset(&self) -> CoreResult<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                CoreError::validation(format!(
                    "utc offset of {} minutes is out of range",
                    self.utc_offset_minutes
                ))
            })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LookaheadWindow {
    pub start_date: NaiveDate,
    pub days: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityQuery {
    pub duration_minutes: u32,
    pub granularity_minutes: u32,
    pub window: LookaheadWindow,
    pub business_hours: BusinessHours,
    pub weekdays_only: bool,
    pub max_slots: Option<usize>,
}

impl AvailabilityQuery {
    pub fn validate(&self) -> CoreResult<()> {
        if self.duration_minutes == 0 {
            return Err(CoreError::validation("meeting duration must be positive"));
        }
        if self.granularity_minutes == 0 {
            return Err(CoreError::validation("slot granularity must be positive"));
        }
        self.business_hours.validate()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MeetingHandle {
    pub event_id: String,
    pub location: String,
    pub join_url: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub recipients: Vec<ParticipantId>,
    pub template_id: String,
}
