//! Missed-session rescheduling.
//!
//! A missed session stays missed. A fresh copy is booked into the first gap
//! of the coming days that fits its planned duration.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

use crate::config::SchedulingSection;
use crate::planner::{day_load, first_gap};
use crate::session::StudySession;

/// First `(date, start)` after `today` with room for `duration` minutes.
pub fn find_slot(
    existing: &[StudySession],
    duration: u32,
    today: NaiveDate,
    section: &SchedulingSection,
) -> Option<(NaiveDate, NaiveTime)> {
    (1..=section.reschedule_horizon_days).find_map(|offset| {
        let date = today + Duration::days(offset);
        let (busy, booked) = day_load(existing, date);
        if booked + duration > section.max_daily_minutes {
            return None;
        }
        let start = first_gap(&busy, duration, section)?;
        NaiveTime::from_hms_opt(start / 60, start % 60, 0).map(|t| (date, t))
    })
}

/// Build the replacement for `missed`, or `None` when nothing fits.
///
/// `existing` are the user's sessions over the horizon. The returned session
/// has no id yet.
pub fn reschedule(
    missed: &StudySession,
    existing: &[StudySession],
    today: NaiveDate,
    now: DateTime<Utc>,
    section: &SchedulingSection,
) -> Option<StudySession> {
    let (date, start) = find_slot(existing, missed.planned_duration_minutes, today, section)?;

    let mut copy = StudySession::new(
        0,
        missed.user_id,
        missed.subject_id,
        date,
        start,
        missed.planned_duration_minutes,
    )
    .with_type(missed.session_type)
    .with_created_at(now);
    copy.schedule_id = missed.schedule_id;
    copy.rescheduled_from = Some(missed.id);
    Some(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionStatus, SessionType};
    use chrono::TimeZone;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 22, 0, 0).unwrap()
    }

    fn missed() -> StudySession {
        StudySession::new(40, 1, 3, day(4), t(17, 0), 60)
            .with_type(SessionType::Practice)
            .with_schedule(2)
            .with_status(SessionStatus::Missed)
    }

    #[test]
    fn books_first_gap_from_tomorrow() {
        let existing = vec![
            StudySession::new(41, 1, 5, day(5), t(16, 0), 90),
            // Skipped sessions free their slot.
            StudySession::new(42, 1, 5, day(5), t(17, 40), 60).with_status(SessionStatus::Skipped),
        ];
        let copy = reschedule(&missed(), &existing, day(4), now(), &SchedulingSection::default()).unwrap();

        assert_eq!(copy.scheduled_date, day(5));
        assert_eq!(copy.scheduled_start_time, t(17, 40));
        assert_eq!(copy.rescheduled_from, Some(40));
        assert_eq!(copy.schedule_id, Some(2));
        assert_eq!(copy.session_type, SessionType::Practice);
        assert_eq!(copy.status, SessionStatus::Scheduled);
        assert!(!copy.reminder_sent);
    }

    #[test]
    fn full_day_pushes_to_next_one() {
        let section = SchedulingSection::default();
        let existing = vec![
            StudySession::new(41, 1, 5, day(5), t(16, 0), 120),
            StudySession::new(42, 1, 5, day(5), t(18, 10), 120),
        ];
        let (date, start) = find_slot(&existing, 60, day(4), &section).unwrap();
        assert_eq!((date, start), (day(6), t(16, 0)));
    }

    #[test]
    fn no_room_within_horizon() {
        let section = SchedulingSection {
            reschedule_horizon_days: 2,
            ..SchedulingSection::default()
        };
        let existing: Vec<StudySession> = (5..=6)
            .map(|d| StudySession::new(u64::from(d), 1, 5, day(d), t(16, 0), 240))
            .collect();
        assert!(reschedule(&missed(), &existing, day(4), now(), &section).is_none());
    }
}
