use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use convene_core::availability::{resolve, search_window};
use convene_core::models::{
    AvailabilityQuery, BusinessHours, BusyInterval, CoreErrorKind, LookaheadWindow,
    ParticipantId, TimeSlot,
};

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()
}

fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).unwrap()
}

fn hours(start: u32, end: u32, utc_offset_minutes: i32) -> BusinessHours {
    BusinessHours::new(
        NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
        utc_offset_minutes,
    )
    .unwrap()
}

fn query(duration_minutes: u32, business_hours: BusinessHours, days: u32) -> AvailabilityQuery {
    AvailabilityQuery {
        duration_minutes,
        granularity_minutes: 30,
        window: LookaheadWindow {
            start_date: monday(),
            days,
        },
        business_hours,
        weekdays_only: true,
        max_slots: None,
    }
}

type Clock = (u32, u32, u32);

fn busy(entries: &[(&str, Clock, Clock)]) -> BTreeMap<ParticipantId, Vec<BusyInterval>> {
    let mut map: BTreeMap<ParticipantId, Vec<BusyInterval>> = BTreeMap::new();
    for (participant, from, to) in entries {
        map.entry(ParticipantId::from(*participant))
            .or_default()
            .push(
                BusyInterval::new(
                    *participant,
                    utc(from.0, from.1, from.2),
                    utc(to.0, to.1, to.2),
                )
                .unwrap(),
            );
    }
    map
}

fn starts(slots: &[TimeSlot]) -> Vec<(u32, u32)> {
    slots
        .iter()
        .map(|slot| (slot.start().hour(), slot.start().minute()))
        .collect()
}

#[test]
fn single_busy_hour_leaves_the_surrounding_half_hours() {
    let busy = busy(&[("alice", (3, 10, 0), (3, 11, 0))]);
    let slots = resolve(&busy, &query(30, hours(9, 12, 0), 1)).unwrap();

    assert_eq!(starts(&slots), vec![(9, 0), (9, 30), (11, 0), (11, 30)]);
    for slot in &slots {
        assert_eq!(slot.end() - slot.start(), chrono::Duration::minutes(30));
        assert!(slot.attendees().contains(&ParticipantId::from("alice")));
    }
}

#[test]
fn back_to_back_busy_windows_of_two_participants_leave_nothing() {
    let busy = busy(&[
        ("alice", (3, 9, 0), (3, 10, 0)),
        ("bob", (3, 10, 0), (3, 11, 0)),
    ]);
    let slots = resolve(&busy, &query(60, hours(9, 11, 0), 1)).unwrap();
    assert!(slots.is_empty());
}

#[test]
fn participants_without_busy_time_still_attend() {
    let mut busy = busy(&[("alice", (3, 9, 0), (3, 11, 30))]);
    busy.insert(ParticipantId::from("carol"), Vec::new());

    let slots = resolve(&busy, &query(60, hours(9, 12, 0), 1)).unwrap();

    assert!(slots.is_empty());
    let slots = resolve(&busy, &query(30, hours(9, 12, 0), 1)).unwrap();
    assert_eq!(starts(&slots), vec![(11, 30)]);
    assert_eq!(slots[0].attendees().len(), 2);
}

#[test]
fn duration_longer_than_business_day_yields_no_slots() {
    let slots = resolve(&BTreeMap::new(), &query(240, hours(9, 12, 0), 3)).unwrap();
    assert!(slots.is_empty());
}

#[test]
fn unaligned_gaps_snap_to_the_business_grid() {
    let busy = busy(&[
        ("alice", (3, 9, 0), (3, 9, 40)),
        ("bob", (3, 10, 50), (3, 12, 0)),
    ]);
    let slots = resolve(&busy, &query(30, hours(9, 12, 0), 1)).unwrap();
    assert_eq!(starts(&slots), vec![(10, 0)]);
}

#[test]
fn weekends_are_skipped_unless_requested() {
    // Friday 2025-03-07 through Monday 2025-03-10.
    let mut weekly = query(180, hours(9, 12, 0), 4);
    weekly.window.start_date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();

    let weekdays = resolve(&BTreeMap::new(), &weekly).unwrap();
    let days: Vec<u32> = weekdays
        .iter()
        .map(|slot| slot.start().day())
        .collect();
    assert_eq!(days, vec![7, 10]);

    weekly.weekdays_only = false;
    assert_eq!(resolve(&BTreeMap::new(), &weekly).unwrap().len(), 4);
}

#[test]
fn business_hours_follow_the_configured_offset() {
    // 09:00-18:00 at UTC+09:00 is 00:00-09:00 UTC.
    let busy = busy(&[("alice", (3, 0, 0), (3, 8, 0))]);
    let slots = resolve(&busy, &query(60, hours(9, 18, 540), 1)).unwrap();

    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].start(), utc(3, 8, 0));
    assert_eq!(slots[0].end(), utc(3, 9, 0));

    let window = search_window(&query(60, hours(9, 18, 540), 1)).unwrap();
    assert_eq!(window.start, utc(3, 0, 0));
    assert_eq!(window.end, utc(3, 9, 0));
}

#[test]
fn candidate_cap_truncates_chronologically() {
    let mut capped = query(30, hours(9, 18, 0), 5);
    capped.max_slots = Some(10);

    let slots = resolve(&BTreeMap::new(), &capped).unwrap();

    assert_eq!(slots.len(), 10);
    assert_eq!(slots[0].start(), utc(3, 9, 0));
    assert!(slots.windows(2).all(|pair| pair[0].start() < pair[1].start()));
}

#[test]
fn slots_never_overlap_any_attendee_busy_interval() {
    let busy = busy(&[
        ("alice", (3, 9, 15), (3, 10, 0)),
        ("alice", (3, 9, 45), (3, 11, 5)),
        ("alice", (4, 13, 0), (4, 14, 0)),
        ("bob", (3, 12, 0), (3, 12, 30)),
        ("bob", (4, 8, 0), (4, 10, 0)),
        ("bob", (5, 15, 30), (5, 17, 0)),
        ("carol", (3, 16, 0), (3, 16, 1)),
        ("carol", (4, 11, 0), (4, 11, 30)),
    ]);
    let slots = resolve(&busy, &query(45, hours(9, 18, 0), 3)).unwrap();

    assert!(!slots.is_empty());
    for slot in &slots {
        for participant in slot.attendees() {
            for interval in &busy[participant] {
                assert!(
                    !slot.overlaps(interval),
                    "{slot} overlaps busy time of {participant}"
                );
            }
        }
    }
}

#[test]
fn resolving_twice_is_idempotent() {
    let busy = busy(&[
        ("alice", (3, 10, 0), (3, 11, 0)),
        ("bob", (4, 9, 0), (4, 17, 0)),
    ]);
    let query = query(60, hours(9, 18, 0), 5);

    let first = resolve(&busy, &query).unwrap();
    let second = resolve(&busy, &query).unwrap();
    assert_eq!(first, second);
}

#[test]
fn invalid_queries_are_rejected() {
    let mut zero = query(30, hours(9, 12, 0), 1);
    zero.granularity_minutes = 0;
    assert_eq!(
        resolve(&BTreeMap::new(), &zero).unwrap_err().kind,
        CoreErrorKind::Validation
    );

    assert!(BusyInterval::new("alice", utc(3, 11, 0), utc(3, 10, 0)).is_err());
}

#[test]
fn search_window_needs_a_schedulable_day() {
    let mut weekend = query(30, hours(9, 12, 0), 2);
    weekend.window.start_date = NaiveDate::from_ymd_opt(2025, 3, 8).unwrap();
    assert_eq!(
        search_window(&weekend).unwrap_err().kind,
        CoreErrorKind::NoAvailability
    );
}
