//! Recurrence math for daily / weekly / monthly report schedules.
//!
//! All functions work on naive local times; the engine converts from UTC with
//! the configured offset before calling in.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use milo_core::types::{Frequency, ScheduleConfig};

/// How far to search for an occurrence. Two months covers every monthly day.
const SEARCH_DAYS: i64 = 62;

/// The occurrence on `date`, if the schedule fires that day.
pub fn occurrence_on(schedule: &ScheduleConfig, date: NaiveDate) -> Option<NaiveDateTime> {
    let fires = match schedule.frequency {
        Frequency::Manual => false,
        Frequency::Daily => true,
        Frequency::Weekly => {
            let weekday = schedule.weekday?;
            date.weekday().num_days_from_sunday() == weekday
        }
        Frequency::Monthly => {
            let wanted = schedule.month_day?;
            date.day() == clamp_month_day(date.year(), date.month(), wanted)
        }
    };
    fires.then(|| date.and_time(schedule.time_of_day))
}

/// The most recent occurrence at or before `now`.
pub fn current_occurrence(schedule: &ScheduleConfig, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let today = now.date();
    (0..=SEARCH_DAYS)
        .filter_map(|back| today.checked_sub_signed(Duration::days(back)))
        .filter_map(|date| occurrence_on(schedule, date))
        .find(|occ| *occ <= now)
}

/// The first occurrence strictly after `after`.
pub fn next_occurrence(schedule: &ScheduleConfig, after: NaiveDateTime) -> Option<NaiveDateTime> {
    let today = after.date();
    (0..=SEARCH_DAYS)
        .filter_map(|ahead| today.checked_add_signed(Duration::days(ahead)))
        .filter_map(|date| occurrence_on(schedule, date))
        .find(|occ| *occ > after)
}

/// Whether the schedule should fire at `now`: inside `[occurrence, occurrence + window)`
/// and not already fired for that occurrence according to `last_run_at`.
pub fn is_due(
    schedule: &ScheduleConfig,
    now: DateTime<Utc>,
    offset: FixedOffset,
    window: Duration,
) -> bool {
    if !schedule.is_schedulable() {
        return false;
    }
    let local_now = to_local(now, offset);
    let Some(occurrence) = current_occurrence(schedule, local_now) else {
        return false;
    };
    if local_now >= occurrence + window {
        return false;
    }
    !fired_in_period_of(schedule, occurrence, offset)
}

/// Whether `last_run_at` already covers the period `occurrence` belongs to.
fn fired_in_period_of(schedule: &ScheduleConfig, occurrence: NaiveDateTime, offset: FixedOffset) -> bool {
    let Some(last) = schedule.last_run_at.map(|at| to_local(at, offset)) else {
        return false;
    };
    last >= occurrence || period_of(schedule.frequency, last.date()) == period_of(schedule.frequency, occurrence.date())
}

/// Calendar period a date falls in: the day, ISO week, or month.
fn period_of(frequency: Frequency, date: NaiveDate) -> (i32, u32, u32) {
    match frequency {
        Frequency::Weekly => {
            let week = date.iso_week();
            (week.year(), week.week(), 0)
        }
        Frequency::Monthly => (date.year(), date.month(), 0),
        Frequency::Daily | Frequency::Manual => (date.year(), date.month(), date.day()),
    }
}

/// Next time the schedule will actually fire after `now`, converted back to
/// UTC. Occurrences in a period that already fired are skipped.
pub fn next_fire_after(
    schedule: &ScheduleConfig,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let mut after = to_local(now, offset);
    let local_next = loop {
        let candidate = next_occurrence(schedule, after)?;
        if !fired_in_period_of(schedule, candidate, offset) {
            break candidate;
        }
        after = candidate;
    };
    local_next
        .and_local_timezone(offset)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn to_local(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDateTime {
    at.with_timezone(&offset).naive_local()
}

/// Clamp a 1-31 month day to the last day of the given month.
fn clamp_month_day(year: i32, month: u32, wanted: u32) -> u32 {
    let last = last_day_of_month(year, month);
    wanted.clamp(1, last)
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
