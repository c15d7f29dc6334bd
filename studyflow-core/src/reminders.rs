//! Reminder policy + candidate selection for upcoming study sessions.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::session::{SessionId, SessionStatus, StudySession};
use crate::subject::UserId;
use crate::time::local_today;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderPolicy {
    /// Remind this many minutes before the session starts.
    pub lead_minutes: i64,
    /// Width of the reminder window; matches the sweep cadence.
    pub window_minutes: i64,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            lead_minutes: 15,
            window_minutes: 15,
        }
    }
}

/// What the dispatcher receives for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub subject_name: String,
    pub session_type: String,
    /// Local start, `HH:MM`.
    pub start_time: String,
    pub duration_minutes: u32,
    pub minutes_until_start: i64,
    pub title: String,
    pub body: String,
    pub dedupe_key: String,
}

/// Seconds from `now` to the session's scheduled start; negative once started.
fn seconds_until_start(session: &StudySession, now: DateTime<Utc>, tz: Tz) -> Option<i64> {
    session.start_utc(tz).map(|start| (start - now).num_seconds())
}

/// Whether `session` should be reminded by a sweep running at `now`.
///
/// The window is `[lead, lead + window)` minutes before the start, measured
/// in seconds so a sweep that fires a little late still lands in exactly one
/// window.
pub fn is_candidate(
    session: &StudySession,
    now: DateTime<Utc>,
    tz: Tz,
    policy: ReminderPolicy,
) -> bool {
    if session.status != SessionStatus::Scheduled || session.reminder_sent {
        return false;
    }
    if session.scheduled_date != local_today(now, tz) {
        return false;
    }
    let Some(secs) = seconds_until_start(session, now, tz) else {
        return false;
    };
    let from = policy.lead_minutes * 60;
    let to = (policy.lead_minutes + policy.window_minutes) * 60;
    secs >= from && secs < to
}

pub fn select_candidates<'a>(
    sessions: &'a [StudySession],
    now: DateTime<Utc>,
    tz: Tz,
    policy: ReminderPolicy,
) -> Vec<&'a StudySession> {
    sessions
        .iter()
        .filter(|s| is_candidate(s, now, tz, policy))
        .collect()
}

/// Build the notification for `session`. `None` if its local start does not exist.
pub fn build_payload(
    session: &StudySession,
    subject_name: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> Option<ReminderPayload> {
    let secs = seconds_until_start(session, now, tz)?;
    // Round up so a session 14m30s away reads "15 minutes".
    let minutes_until_start = (secs + 59).div_euclid(60);
    let start_time = session.scheduled_start_time.format("%H:%M").to_string();
    let label = session.session_type.label();

    Some(ReminderPayload {
        session_id: session.id,
        user_id: session.user_id,
        subject_name: subject_name.to_string(),
        session_type: label.to_string(),
        title: format!("{label}: {subject_name} at {start_time}"),
        body: format!(
            "Your {} min {} session for {subject_name} starts in {minutes_until_start} minutes.",
            session.planned_duration_minutes,
            label.to_lowercase(),
        ),
        dedupe_key: format!("session:{}:{}", session.id, session.scheduled_date),
        start_time,
        duration_minutes: session.planned_duration_minutes,
        minutes_until_start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionType;
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    fn algiers() -> Tz {
        "Africa/Algiers".parse().unwrap()
    }

    /// 17:00 local (16:00 UTC) on 2026-02-21.
    fn session() -> StudySession {
        StudySession::new(
            9,
            3,
            4,
            NaiveDate::from_ymd_opt(2026, 2, 21).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            45,
        )
        .with_type(SessionType::Revision)
    }

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 21, h, m, s).unwrap()
    }

    #[test]
    fn window_is_half_open() {
        let p = ReminderPolicy::default();
        let s = session();
        assert!(!is_candidate(&s, utc(15, 30, 0), algiers(), p), "30 min out");
        assert!(is_candidate(&s, utc(15, 30, 1), algiers(), p));
        assert!(is_candidate(&s, utc(15, 45, 0), algiers(), p), "exactly 15 min out");
        assert!(!is_candidate(&s, utc(15, 45, 1), algiers(), p));
    }

    #[test]
    fn quarter_hour_sweeps_hit_every_start_once() {
        let p = ReminderPolicy::default();
        for minute in 0..60 {
            let s = StudySession::new(
                1,
                1,
                1,
                NaiveDate::from_ymd_opt(2026, 2, 21).unwrap(),
                NaiveTime::from_hms_opt(18, minute, 0).unwrap(),
                30,
            );
            let hits = (0..16)
                .map(|i| utc(14, 0, 0) + chrono::Duration::minutes(15 * i))
                .filter(|now| is_candidate(&s, *now, algiers(), p))
                .count();
            assert_eq!(hits, 1, "start minute {minute}");
        }
    }

    #[test]
    fn sent_or_started_sessions_are_not_candidates() {
        let p = ReminderPolicy::default();
        let mut sent = session();
        sent.reminder_sent = true;
        assert!(!is_candidate(&sent, utc(15, 40, 0), algiers(), p));

        let started = session().with_status(SessionStatus::InProgress);
        assert!(!is_candidate(&started, utc(15, 40, 0), algiers(), p));

        let sessions = vec![session(), sent];
        assert_eq!(select_candidates(&sessions, utc(15, 40, 0), algiers(), p).len(), 1);
    }

    #[test]
    fn payload_carries_local_start_and_countdown() {
        let payload = build_payload(&session(), "Physics", utc(15, 40, 30), algiers()).unwrap();
        assert_eq!(payload.start_time, "17:00");
        assert_eq!(payload.session_type, "Revision");
        assert_eq!(payload.minutes_until_start, 20);
        assert_eq!(payload.duration_minutes, 45);
        assert_eq!(payload.title, "Revision: Physics at 17:00");
        assert!(payload.body.contains("starts in 20 minutes"));
        assert_eq!(payload.dedupe_key, "session:9:2026-02-21");
    }
}
