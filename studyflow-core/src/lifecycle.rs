//! Session lifecycle state machine.
//!
//! ```text
//! scheduled -> in_progress <-> paused -> completed
//! scheduled -> missed      (engine, after window end + grace)
//! scheduled -> skipped     (user)
//! ```
//!
//! Terminal sessions (completed, missed, skipped) are never mutated: every
//! action on them returns [`TransitionOutcome::AlreadyTerminal`] so a batch
//! sweep racing a user action does not abort.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::LifecycleSection;
use crate::error::LifecycleError;
use crate::session::{SessionAction, SessionStatus, StudySession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionOutcome {
    Applied {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// No-op: the session had already reached a terminal state.
    AlreadyTerminal(SessionStatus),
    /// No-op: the auto-miss deadline has not passed yet.
    NotDue,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Outcome reported by the user when finishing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub completion_percentage: u8,
    pub focus_score: Option<u8>,
}

impl Default for CompletionReport {
    fn default() -> Self {
        Self {
            completion_percentage: 100,
            focus_score: None,
        }
    }
}

fn invalid(session: &StudySession, action: SessionAction) -> LifecycleError {
    LifecycleError::InvalidTransition {
        from: session.status,
        action,
    }
}

fn applied(session: &mut StudySession, to: SessionStatus) -> TransitionOutcome {
    let from = session.status;
    session.status = to;
    TransitionOutcome::Applied { from, to }
}

/// Close an open pause, adding its length to `paused_minutes`.
fn close_pause(session: &mut StudySession, now: DateTime<Utc>) {
    if let Some(paused_at) = session.paused_at.take() {
        session.paused_minutes += (now - paused_at).num_minutes().max(0);
    }
}

pub fn start(
    session: &mut StudySession,
    now: DateTime<Utc>,
    tz: Tz,
    policy: &LifecycleSection,
) -> Result<TransitionOutcome, LifecycleError> {
    if session.status.is_terminal() {
        return Ok(TransitionOutcome::AlreadyTerminal(session.status));
    }
    if !matches!(session.status, SessionStatus::Scheduled | SessionStatus::Paused) {
        return Err(invalid(session, SessionAction::Start));
    }

    let (start, end) = match (session.start_utc(tz), session.end_utc(tz)) {
        (Some(start), Some(end)) => (start, end),
        _ => {
            return Err(LifecycleError::InvalidLocalTime {
                session_id: session.id,
            });
        }
    };
    let opens = start - Duration::minutes(policy.early_start_minutes);
    let closes = end + Duration::minutes(policy.grace_minutes);
    if now < opens {
        return Err(LifecycleError::OutsideWindow {
            session_id: session.id,
            reason: format!("opens at {}", opens.to_rfc3339()),
        });
    }
    if now > closes {
        return Err(LifecycleError::OutsideWindow {
            session_id: session.id,
            reason: format!("grace period ended at {}", closes.to_rfc3339()),
        });
    }

    if session.status == SessionStatus::Paused {
        close_pause(session, now);
    } else {
        session.actual_start = Some(now);
    }
    Ok(applied(session, SessionStatus::InProgress))
}

pub fn pause(
    session: &mut StudySession,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, LifecycleError> {
    if session.status.is_terminal() {
        return Ok(TransitionOutcome::AlreadyTerminal(session.status));
    }
    if session.status != SessionStatus::InProgress {
        return Err(invalid(session, SessionAction::Pause));
    }
    session.paused_at = Some(now);
    Ok(applied(session, SessionStatus::Paused))
}

pub fn resume(
    session: &mut StudySession,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, LifecycleError> {
    if session.status.is_terminal() {
        return Ok(TransitionOutcome::AlreadyTerminal(session.status));
    }
    if session.status != SessionStatus::Paused {
        return Err(invalid(session, SessionAction::Resume));
    }
    close_pause(session, now);
    Ok(applied(session, SessionStatus::InProgress))
}

pub fn complete(
    session: &mut StudySession,
    now: DateTime<Utc>,
    report: CompletionReport,
) -> Result<TransitionOutcome, LifecycleError> {
    if session.status.is_terminal() {
        return Ok(TransitionOutcome::AlreadyTerminal(session.status));
    }
    if !matches!(session.status, SessionStatus::InProgress | SessionStatus::Paused) {
        return Err(invalid(session, SessionAction::Complete));
    }

    close_pause(session, now);
    let worked = session
        .actual_start
        .map(|started| (now - started).num_minutes() - session.paused_minutes)
        .unwrap_or(0);

    session.actual_end = Some(now);
    session.actual_duration_minutes = Some(worked.max(0));
    session.completion_percentage = Some(report.completion_percentage.min(100));
    session.focus_score = report.focus_score.map(|f| f.min(10));
    Ok(applied(session, SessionStatus::Completed))
}

pub fn skip(session: &mut StudySession) -> Result<TransitionOutcome, LifecycleError> {
    if session.status.is_terminal() {
        return Ok(TransitionOutcome::AlreadyTerminal(session.status));
    }
    if session.status != SessionStatus::Scheduled {
        return Err(invalid(session, SessionAction::Skip));
    }
    Ok(applied(session, SessionStatus::Skipped))
}

/// Engine-initiated: flip a still-scheduled session to missed once its
/// window and grace period have elapsed.
pub fn auto_miss(
    session: &mut StudySession,
    now: DateTime<Utc>,
    tz: Tz,
    policy: &LifecycleSection,
) -> Result<TransitionOutcome, LifecycleError> {
    if session.status.is_terminal() {
        return Ok(TransitionOutcome::AlreadyTerminal(session.status));
    }
    if session.status != SessionStatus::Scheduled {
        return Err(invalid(session, SessionAction::AutoMiss));
    }
    let end = session.end_utc(tz).ok_or(LifecycleError::InvalidLocalTime {
        session_id: session.id,
    })?;
    if now <= end + Duration::minutes(policy.grace_minutes) {
        return Ok(TransitionOutcome::NotDue);
    }
    Ok(applied(session, SessionStatus::Missed))
}

/// Apply `action` with default completion values. Used by callers that only
/// know the action name (CLI, store adapters).
pub fn apply(
    session: &mut StudySession,
    action: SessionAction,
    now: DateTime<Utc>,
    tz: Tz,
    policy: &LifecycleSection,
) -> Result<TransitionOutcome, LifecycleError> {
    match action {
        SessionAction::Start => start(session, now, tz, policy),
        SessionAction::Pause => pause(session, now),
        SessionAction::Resume => resume(session, now),
        SessionAction::Complete => complete(session, now, CompletionReport::default()),
        SessionAction::Skip => skip(session),
        SessionAction::AutoMiss => auto_miss(session, now, tz, policy),
    }
}
