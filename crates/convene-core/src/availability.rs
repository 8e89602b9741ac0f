use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};

use crate::models::{
    AvailabilityQuery, BusinessHours, BusyInterval, CoreError, CoreResult, ParticipantId,
    TimeSlot, TimeWindow,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Span {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Computes every quantized slot in which all participants are free.
///
/// Attendees are the keys of `busy`; a participant with no intervals still attends but never
/// constrains the result. Output is chronological and deterministic for identical inputs.
pub fn resolve(
    busy: &BTreeMap<ParticipantId, Vec<BusyInterval>>,
    query: &AvailabilityQuery,
) -> CoreResult<Vec<TimeSlot>> {
    query.validate()?;

    let per_participant: Vec<Span> = busy
        .values()
        .flat_map(|intervals| {
            merge(
                intervals
                    .iter()
                    .filter(|interval| interval.start < interval.end)
                    .map(|interval| Span {
                        start: interval.start,
                        end: interval.end,
                    })
                    .collect(),
            )
        })
        .collect();
    let combined = merge(per_participant);

    let attendees: BTreeSet<ParticipantId> = busy.keys().cloned().collect();
    let duration = Duration::minutes(i64::from(query.duration_minutes));
    let step = Duration::minutes(i64::from(query.granularity_minutes));
    let limit = query.max_slots.filter(|limit| *limit > 0);
    let mut slots = Vec::new();

    for date in business_days(query) {
        let (open, close) = business_bounds(&query.business_hours, date)?;
        if close - open < duration {
            continue;
        }

        for gap in free_gaps(&combined, open, close) {
            if gap.end - gap.start < duration {
                continue;
            }

            let mut start = first_aligned(open, gap.start, step);
            while start + duration <= gap.end {
                slots.push(TimeSlot::new(start, start + duration, attendees.clone()));
                if limit.is_some_and(|limit| slots.len() >= limit) {
                    return Ok(slots);
                }
                start += step;
            }
        }
    }

    tracing::debug!(
        participants = attendees.len(),
        busy_spans = combined.len(),
        slots = slots.len(),
        "availability resolved"
    );
    Ok(slots)
}

/// The UTC range calendars must be queried for: first business open to last business close.
pub fn search_window(query: &AvailabilityQuery) -> CoreResult<TimeWindow> {
    query.validate()?;
    let days: Vec<NaiveDate> = business_days(query).collect();
    let (Some(first), Some(last)) = (days.first(), days.last()) else {
        return Err(CoreError::no_availability(format!(
            "lookahead of {} day(s) from {} contains no schedulable day",
            query.window.days, query.window.start_date
        )));
    };
    let (start, _) = business_bounds(&query.business_hours, *first)?;
    let (_, end) = business_bounds(&query.business_hours, *last)?;
    TimeWindow::new(start, end)
}

fn business_days(query: &AvailabilityQuery) -> impl Iterator<Item = NaiveDate> + '_ {
    query
        .window
        .start_date
        .iter_days()
        .take(query.window.days as usize)
        .filter(|date| {
            !query.weekdays_only || !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
        })
}

fn business_bounds(
    hours: &BusinessHours,
    date: NaiveDate,
) -> CoreResult<(DateTime<Utc>, DateTime<Utc>)> {
    Ok((
        local_to_utc(hours, date, hours.start)?,
        local_to_utc(hours, date, hours.end)?,
    ))
}

fn local_to_utc(
    hours: &BusinessHours,
    date: NaiveDate,
    time: NaiveTime,
) -> CoreResult<DateTime<Utc>> {
    date.and_time(time)
        .and_local_timezone(hours.offset()?)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            CoreError::validation(format!("{date} {time} is not a valid local time"))
        })
}

/// Sort-and-sweep merge; touching spans (`next.start == current.end`) are merged too.
fn merge(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort();
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(current) if span.start <= current.end => {
                current.end = current.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Complement of the merged busy timeline inside `[open, close)`.
fn free_gaps(busy: &[Span], open: DateTime<Utc>, close: DateTime<Utc>) -> Vec<Span> {
    let mut gaps = Vec::new();
    let mut cursor = open;
    for span in busy
        .iter()
        .filter(|span| span.end > open && span.start < close)
    {
        if span.start > cursor {
            gaps.push(Span {
                start: cursor,
                end: span.start.min(close),
            });
        }
        cursor = cursor.max(span.end);
        if cursor >= close {
            return gaps;
        }
    }
    if cursor < close {
        gaps.push(Span {
            start: cursor,
            end: close,
        });
    }
    gaps
}

/// First grid point at or after `at` on the grid anchored at `anchor`.
fn first_aligned(anchor: DateTime<Utc>, at: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let elapsed = (at - anchor).num_seconds().max(0);
    let step_seconds = step.num_seconds().max(1);
    let steps = (elapsed + step_seconds - 1) / step_seconds;
    anchor + Duration::seconds(steps * step_seconds)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Span, first_aligned, free_gaps, merge};

    fn at(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, hour, minute, 0).unwrap()
    }

    fn span(from: (u32, u32), to: (u32, u32)) -> Span {
        Span {
            start: at(from.0, from.1),
            end: at(to.0, to.1),
        }
    }

    #[test]
    fn merge_joins_overlapping_and_touching_spans() {
        let merged = merge(vec![
            span((13, 0), (14, 0)),
            span((9, 0), (10, 0)),
            span((10, 0), (10, 30)),
            span((9, 30), (9, 45)),
        ]);
        assert_eq!(merged, vec![span((9, 0), (10, 30)), span((13, 0), (14, 0))]);
    }

    #[test]
    fn gaps_are_clipped_to_business_bounds() {
        let busy = vec![span((8, 0), (9, 30)), span((11, 0), (19, 0))];
        let gaps = free_gaps(&busy, at(9, 0), at(18, 0));
        assert_eq!(gaps, vec![span((9, 30), (11, 0))]);
    }

    #[test]
    fn alignment_rounds_up_to_the_grid() {
        let step = Duration::minutes(30);
        assert_eq!(first_aligned(at(9, 0), at(9, 0), step), at(9, 0));
        assert_eq!(first_aligned(at(9, 0), at(10, 10), step), at(10, 30));
        assert_eq!(first_aligned(at(9, 0), at(8, 0), step), at(9, 0));
    }
}
