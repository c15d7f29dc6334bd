//! Weekly planner: turns per-subject weekly minutes into concrete sessions.
//!
//! Subjects are visited by priority, each subject's minutes are cut into
//! coefficient-sized chunks, and the chunks are interleaved round-robin so a
//! single heavy subject cannot fill the first days. Each chunk goes to the
//! least-loaded day of the week that still has a gap for it.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulingSection;
use crate::error::StoreError;
use crate::schedule::{Schedule, ScheduleId};
use crate::session::{SessionStatus, SessionType, StudySession};
use crate::store::PlannerStore;
use crate::subject::{SubjectForUser, SubjectId, User};

pub const DAYS_PER_WEEK: i64 = 7;

/// Leftover chunks shorter than this are folded into the previous chunk.
const MIN_CHUNK_MINUTES: u32 = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedWeek {
    /// Not yet persisted; `id` is assigned by the store.
    pub schedule: Schedule,
    /// Not yet persisted; ids are assigned by the store.
    pub sessions: Vec<StudySession>,
    /// Minutes per subject that did not fit in the week.
    pub unplaced_minutes: BTreeMap<SubjectId, u32>,
}

impl GeneratedWeek {
    pub fn planned_minutes(&self) -> u32 {
        self.sessions.iter().map(|s| s.planned_duration_minutes).sum()
    }

    pub fn total_unplaced(&self) -> u32 {
        self.unplaced_minutes.values().sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    subject_id: SubjectId,
    minutes: u32,
    session_type: SessionType,
}

pub(crate) fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn time_of(minute: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(minute / 60, minute % 60, 0)
}

/// Earliest start (minute of day) for a `duration` block between the busy
/// intervals, keeping `break_minutes` around every existing block.
pub(crate) fn first_gap(
    busy: &[(u32, u32)],
    duration: u32,
    section: &SchedulingSection,
) -> Option<u32> {
    let window_end = minute_of_day(section.study_end);
    let mut sorted = busy.to_vec();
    sorted.sort_unstable();

    let mut cursor = minute_of_day(section.study_start);
    for (start, end) in sorted {
        if cursor + duration + section.break_minutes <= start {
            break;
        }
        cursor = cursor.max(end + section.break_minutes);
    }
    (cursor + duration <= window_end).then_some(cursor)
}

/// Busy intervals and booked minutes of one day, ignoring dropped sessions.
pub(crate) fn day_load(sessions: &[StudySession], date: NaiveDate) -> (Vec<(u32, u32)>, u32) {
    let mut busy = Vec::new();
    let mut booked = 0;
    for s in sessions.iter().filter(|s| {
        s.scheduled_date == date
            && !matches!(s.status, SessionStatus::Missed | SessionStatus::Skipped)
    }) {
        let start = minute_of_day(s.scheduled_start_time);
        busy.push((start, start + s.planned_duration_minutes));
        booked += s.planned_duration_minutes;
    }
    (busy, booked)
}

fn chunk_type(index: usize, count: usize) -> SessionType {
    match index {
        0 => SessionType::Study,
        i if count >= 3 && i == count - 1 => SessionType::Revision,
        i if i % 2 == 1 => SessionType::Practice,
        _ => SessionType::Study,
    }
}

fn chunks_for(subject: &SubjectForUser) -> Vec<Chunk> {
    let size = subject.session_minutes();
    let mut sizes = vec![size; (subject.weekly_minutes / size) as usize];
    let rest = subject.weekly_minutes % size;
    match sizes.last_mut() {
        Some(last) if rest < MIN_CHUNK_MINUTES => *last += rest,
        _ if rest > 0 => sizes.push(rest),
        _ => {}
    }

    let count = sizes.len();
    sizes
        .into_iter()
        .enumerate()
        .map(|(i, minutes)| Chunk {
            subject_id: subject.subject_id,
            minutes,
            session_type: chunk_type(i, count),
        })
        .collect()
}

/// Round-robin over subjects in priority order.
fn interleave(mut subjects: Vec<&SubjectForUser>) -> Vec<Chunk> {
    subjects.sort_by(|a, b| {
        b.computed_priority
            .total_cmp(&a.computed_priority)
            .then(a.subject_id.cmp(&b.subject_id))
    });
    let mut queues: Vec<std::vec::IntoIter<Chunk>> =
        subjects.into_iter().map(|s| chunks_for(s).into_iter()).collect();

    let mut out = Vec::new();
    loop {
        let before = out.len();
        for q in queues.iter_mut() {
            if let Some(c) = q.next() {
                out.push(c);
            }
        }
        if out.len() == before {
            return out;
        }
    }
}

/// Plan the seven days starting at `start_date` for `user`.
pub fn generate_week(
    user: &User,
    subjects: &[SubjectForUser],
    start_date: NaiveDate,
    now: DateTime<Utc>,
    section: &SchedulingSection,
) -> GeneratedWeek {
    let end_date = start_date + Duration::days(DAYS_PER_WEEK - 1);
    let schedule = Schedule::new(0, user.id, start_date, end_date, now);

    let owned: Vec<&SubjectForUser> = subjects.iter().filter(|s| s.user_id == user.id).collect();
    let chunks = interleave(owned);

    let mut days: Vec<(NaiveDate, Vec<(u32, u32)>, u32)> = (0..DAYS_PER_WEEK)
        .map(|d| (start_date + Duration::days(d), Vec::new(), 0))
        .collect();
    let mut sessions = Vec::new();
    let mut unplaced: BTreeMap<SubjectId, u32> = BTreeMap::new();

    for chunk in chunks {
        let mut order: Vec<usize> = (0..days.len()).collect();
        order.sort_by_key(|&i| (days[i].2, i));

        let slot = order.into_iter().find_map(|i| {
            let (_, busy, booked) = &days[i];
            if booked + chunk.minutes > section.max_daily_minutes {
                return None;
            }
            first_gap(busy, chunk.minutes, section).map(|start| (i, start))
        });

        let Some((day, start)) = slot else {
            *unplaced.entry(chunk.subject_id).or_default() += chunk.minutes;
            continue;
        };
        let Some(start_time) = time_of(start) else {
            *unplaced.entry(chunk.subject_id).or_default() += chunk.minutes;
            continue;
        };

        let (date, busy, booked) = &mut days[day];
        busy.push((start, start + chunk.minutes));
        *booked += chunk.minutes;

        sessions.push(
            StudySession::new(0, user.id, chunk.subject_id, *date, start_time, chunk.minutes)
                .with_type(chunk.session_type)
                .with_created_at(now),
        );
    }

    sessions.sort_by_key(|s| (s.scheduled_date, s.scheduled_start_time));

    if !unplaced.is_empty() {
        tracing::warn!(
            user_id = user.id,
            unplaced_minutes = unplaced.values().sum::<u32>(),
            "weekly minutes exceed the study window"
        );
    }

    GeneratedWeek {
        schedule,
        sessions,
        unplaced_minutes: unplaced,
    }
}

/// Persist `week` and make its schedule the user's only active one.
pub fn persist_week<S: PlannerStore + ?Sized>(
    store: &S,
    week: GeneratedWeek,
) -> Result<ScheduleId, StoreError> {
    let sessions = week.sessions.len();
    let (schedule_id, deactivated) = store.insert_week(week.schedule, week.sessions)?;
    tracing::info!(schedule_id, sessions, deactivated = ?deactivated, "schedule activated");
    Ok(schedule_id)
}
