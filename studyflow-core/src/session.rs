//! Study session model.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleId;
use crate::subject::{SubjectId, UserId};
use crate::time::local_to_utc;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    InProgress,
    Paused,
    Completed,
    Missed,
    Skipped,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Missed | SessionStatus::Skipped
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::InProgress => "in progress",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Missed => "missed",
            SessionStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Something that can be done to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Start,
    Pause,
    Resume,
    Complete,
    Skip,
    AutoMiss,
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionAction::Start => "start",
            SessionAction::Pause => "pause",
            SessionAction::Resume => "resume",
            SessionAction::Complete => "complete",
            SessionAction::Skip => "skip",
            SessionAction::AutoMiss => "auto-miss",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Study,
    Revision,
    Practice,
    LongRevision,
    Test,
}

impl SessionType {
    pub fn label(&self) -> &'static str {
        match self {
            SessionType::Study => "Study",
            SessionType::Revision => "Revision",
            SessionType::Practice => "Practice",
            SessionType::LongRevision => "General revision",
            SessionType::Test => "Test",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySession {
    pub id: SessionId,
    pub user_id: UserId,
    pub subject_id: SubjectId,
    pub schedule_id: Option<ScheduleId>,
    pub session_type: SessionType,

    /// Local date in the planner timezone.
    pub scheduled_date: NaiveDate,
    /// Local wall-clock start.
    pub scheduled_start_time: NaiveTime,
    pub planned_duration_minutes: u32,

    pub status: SessionStatus,
    pub reminder_sent: bool,

    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    /// Set while the session is paused.
    pub paused_at: Option<DateTime<Utc>>,
    /// Total minutes spent paused so far.
    pub paused_minutes: i64,
    pub actual_duration_minutes: Option<i64>,
    /// 0-100, set on completion.
    pub completion_percentage: Option<u8>,
    /// 0-10 self-reported focus, set on completion.
    pub focus_score: Option<u8>,

    pub rescheduled_from: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

impl StudySession {
    pub fn new(
        id: SessionId,
        user_id: UserId,
        subject_id: SubjectId,
        scheduled_date: NaiveDate,
        scheduled_start_time: NaiveTime,
        planned_duration_minutes: u32,
    ) -> Self {
        Self {
            id,
            user_id,
            subject_id,
            schedule_id: None,
            session_type: SessionType::Study,
            scheduled_date,
            scheduled_start_time,
            planned_duration_minutes,
            status: SessionStatus::Scheduled,
            reminder_sent: false,
            actual_start: None,
            actual_end: None,
            paused_at: None,
            paused_minutes: 0,
            actual_duration_minutes: None,
            completion_percentage: None,
            focus_score: None,
            rescheduled_from: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_type(mut self, session_type: SessionType) -> Self {
        self.session_type = session_type;
        self
    }

    pub fn with_schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Completed session with the given outcome, for fixtures and imports.
    pub fn completed_with(mut self, completion_percentage: u8, focus_score: Option<u8>) -> Self {
        self.status = SessionStatus::Completed;
        self.completion_percentage = Some(completion_percentage.min(100));
        self.focus_score = focus_score;
        self
    }

    /// Scheduled start in UTC, `None` if the local time does not exist.
    pub fn start_utc(&self, tz: Tz) -> Option<DateTime<Utc>> {
        local_to_utc(self.scheduled_date, self.scheduled_start_time, tz)
    }

    /// Scheduled end in UTC.
    pub fn end_utc(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.start_utc(tz)
            .map(|start| start + Duration::minutes(i64::from(self.planned_duration_minutes)))
    }

    /// Whether the scheduled start falls inside `[from, to]`.
    pub fn starts_within(&self, tz: Tz, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start_utc(tz)
            .is_some_and(|start| start >= from && start <= to)
    }
}
