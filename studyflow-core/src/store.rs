//! Collaborator seams: persistence, notification delivery and job locks.
//!
//! Every method takes `&self`; implementations use interior mutability so a
//! single store can be shared by the orchestrator and a CLI command.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::adaptation::AllocationDelta;
use crate::error::{DispatchError, StoreError};
use crate::reminders::ReminderPayload;
use crate::schedule::{Schedule, ScheduleId};
use crate::session::{SessionId, SessionStatus, StudySession};
use crate::subject::{SubjectForUser, SubjectId, User, UserId};

pub trait PlannerStore: Send + Sync {
    fn active_users(&self) -> Result<Vec<User>, StoreError>;

    fn user(&self, id: UserId) -> Result<User, StoreError>;

    fn subjects_for_user(&self, user_id: UserId) -> Result<Vec<SubjectForUser>, StoreError>;

    fn update_priority(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        priority: f64,
    ) -> Result<(), StoreError>;

    /// Apply every delta of one adaptation or none of them. A delta whose
    /// `before` no longer matches the stored minutes fails the whole batch
    /// with [`StoreError::Conflict`].
    fn apply_allocation(
        &self,
        user_id: UserId,
        deltas: &[AllocationDelta],
    ) -> Result<(), StoreError>;

    /// Sessions of `user_id` whose scheduled date lies in `[from, to]`.
    fn sessions_for_user(
        &self,
        user_id: UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<StudySession>, StoreError>;

    /// Sessions of `user_id` still `scheduled` on or before `through`, with no
    /// lower bound on the date.
    fn overdue_scheduled_sessions(
        &self,
        user_id: UserId,
        through: NaiveDate,
    ) -> Result<Vec<StudySession>, StoreError>;

    fn session(&self, id: SessionId) -> Result<StudySession, StoreError>;

    /// Store a new session and return its assigned id.
    fn insert_session(&self, session: StudySession) -> Result<SessionId, StoreError>;

    /// Persist `session` only if the stored row still has status `expected`.
    /// Returns `false` when another writer got there first.
    fn save_transition(
        &self,
        session: &StudySession,
        expected: SessionStatus,
    ) -> Result<bool, StoreError>;

    /// Atomically flip `reminder_sent` from false to true. Returns `false` if
    /// it was already set.
    fn claim_reminder(&self, id: SessionId) -> Result<bool, StoreError>;

    fn schedules_for_user(&self, user_id: UserId) -> Result<Vec<Schedule>, StoreError>;

    /// Store `schedule` with `sessions` tagged with its new id and make it the
    /// user's only active schedule, all in one step. Returns the new id and
    /// the ids that were deactivated.
    fn insert_week(
        &self,
        schedule: Schedule,
        sessions: Vec<StudySession>,
    ) -> Result<(ScheduleId, Vec<ScheduleId>), StoreError>;
}

/// Delivery channel for reminders. Returns a handle identifying the notification.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, user: &User, payload: &ReminderPayload) -> Result<String, DispatchError>;
}

/// Mutual exclusion per job name. A lock left behind by a crashed run expires
/// after its TTL.
pub trait JobLock: Send + Sync {
    fn try_acquire(&self, job: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool, StoreError>;

    fn release(&self, job: &str) -> Result<(), StoreError>;
}

impl<T: NotificationDispatcher + ?Sized> NotificationDispatcher for Arc<T> {
    fn dispatch(&self, user: &User, payload: &ReminderPayload) -> Result<String, DispatchError> {
        (**self).dispatch(user, payload)
    }
}

impl<T: JobLock + ?Sized> JobLock for Arc<T> {
    fn try_acquire(&self, job: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool, StoreError> {
        (**self).try_acquire(job, now, ttl)
    }

    fn release(&self, job: &str) -> Result<(), StoreError> {
        (**self).release(job)
    }
}
