//! In-memory store and job lock.
//!
//! Backs the integration tests and, through [`StoreSnapshot`], the CLI's
//! JSON state file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::adaptation::AllocationDelta;
use crate::error::StoreError;
use crate::schedule::{Schedule, ScheduleId, activate_exclusive};
use crate::session::{SessionId, SessionStatus, StudySession};
use crate::store::{JobLock, PlannerStore};
use crate::subject::{SubjectForUser, SubjectId, User, UserId};

/// Serializable contents of an [`InMemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub users: BTreeMap<UserId, User>,
    pub subjects: Vec<SubjectForUser>,
    pub sessions: BTreeMap<SessionId, StudySession>,
    pub schedules: Vec<Schedule>,
    pub next_session_id: SessionId,
    pub next_schedule_id: ScheduleId,
}

#[derive(Debug, Default)]
struct Faults {
    users: BTreeSet<UserId>,
    writes: BTreeSet<UserId>,
    listing_failures: u32,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: Mutex<StoreSnapshot>,
    faults: Mutex<Faults>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock()
        .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            data: Mutex::new(snapshot),
            faults: Mutex::default(),
        }
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(lock(&self.data)?.clone())
    }

    /// Replace the whole contents with `snapshot`.
    pub fn restore(&self, snapshot: StoreSnapshot) -> Result<(), StoreError> {
        *lock(&self.data)? = snapshot;
        Ok(())
    }

    pub fn add_user(&self, user: User) -> Result<(), StoreError> {
        lock(&self.data)?.users.insert(user.id, user);
        Ok(())
    }

    /// Insert or replace the `(user, subject)` row.
    pub fn upsert_subject(&self, subject: SubjectForUser) -> Result<(), StoreError> {
        let mut data = lock(&self.data)?;
        match data
            .subjects
            .iter_mut()
            .find(|s| s.user_id == subject.user_id && s.subject_id == subject.subject_id)
        {
            Some(existing) => *existing = subject,
            None => data.subjects.push(subject),
        }
        Ok(())
    }

    /// Make every per-user read for `user_id` fail with `Unavailable`.
    pub fn fail_user(&self, user_id: UserId) -> Result<(), StoreError> {
        lock(&self.faults)?.users.insert(user_id);
        Ok(())
    }

    /// Make multi-row writes for `user_id` (allocations, weeks) fail with
    /// `Unavailable` before anything is changed.
    pub fn fail_writes(&self, user_id: UserId) -> Result<(), StoreError> {
        lock(&self.faults)?.writes.insert(user_id);
        Ok(())
    }

    /// Make the next `n` calls to `active_users` fail with `Unavailable`.
    pub fn fail_listing(&self, n: u32) -> Result<(), StoreError> {
        lock(&self.faults)?.listing_failures = n;
        Ok(())
    }

    fn check_user(&self, user_id: UserId) -> Result<(), StoreError> {
        if lock(&self.faults)?.users.contains(&user_id) {
            return Err(StoreError::Unavailable(format!("user {user_id} unreadable")));
        }
        Ok(())
    }

    fn check_write(&self, user_id: UserId) -> Result<(), StoreError> {
        if lock(&self.faults)?.writes.contains(&user_id) {
            return Err(StoreError::Unavailable(format!("writes for user {user_id} rejected")));
        }
        Ok(())
    }
}

impl PlannerStore for InMemoryStore {
    fn active_users(&self) -> Result<Vec<User>, StoreError> {
        {
            let mut faults = lock(&self.faults)?;
            if faults.listing_failures > 0 {
                faults.listing_failures -= 1;
                return Err(StoreError::Unavailable("user listing failed".into()));
            }
        }
        Ok(lock(&self.data)?
            .users
            .values()
            .filter(|u| u.is_active)
            .cloned()
            .collect())
    }

    fn user(&self, id: UserId) -> Result<User, StoreError> {
        lock(&self.data)?
            .users
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "user", id })
    }

    fn subjects_for_user(&self, user_id: UserId) -> Result<Vec<SubjectForUser>, StoreError> {
        self.check_user(user_id)?;
        Ok(lock(&self.data)?
            .subjects
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    fn update_priority(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        priority: f64,
    ) -> Result<(), StoreError> {
        let mut data = lock(&self.data)?;
        let subject = data
            .subjects
            .iter_mut()
            .find(|s| s.user_id == user_id && s.subject_id == subject_id)
            .ok_or(StoreError::NotFound {
                entity: "subject",
                id: subject_id,
            })?;
        subject.computed_priority = priority;
        Ok(())
    }

    fn apply_allocation(
        &self,
        user_id: UserId,
        deltas: &[AllocationDelta],
    ) -> Result<(), StoreError> {
        self.check_write(user_id)?;
        let mut data = lock(&self.data)?;

        let mut targets = Vec::with_capacity(deltas.len());
        for delta in deltas {
            let idx = data
                .subjects
                .iter()
                .position(|s| s.user_id == user_id && s.subject_id == delta.subject_id)
                .ok_or(StoreError::NotFound {
                    entity: "subject",
                    id: delta.subject_id,
                })?;
            let current = data.subjects[idx].weekly_minutes;
            if current != delta.before {
                return Err(StoreError::Conflict(format!(
                    "subject {} has {current} weekly minutes, expected {}",
                    delta.subject_id, delta.before
                )));
            }
            targets.push((idx, delta.after));
        }
        for (idx, after) in targets {
            data.subjects[idx].weekly_minutes = after;
        }
        Ok(())
    }

    fn sessions_for_user(
        &self,
        user_id: UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<StudySession>, StoreError> {
        self.check_user(user_id)?;
        Ok(lock(&self.data)?
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.scheduled_date >= from && s.scheduled_date <= to)
            .cloned()
            .collect())
    }

    fn overdue_scheduled_sessions(
        &self,
        user_id: UserId,
        through: NaiveDate,
    ) -> Result<Vec<StudySession>, StoreError> {
        self.check_user(user_id)?;
        Ok(lock(&self.data)?
            .sessions
            .values()
            .filter(|s| {
                s.user_id == user_id
                    && s.status == SessionStatus::Scheduled
                    && s.scheduled_date <= through
            })
            .cloned()
            .collect())
    }

    fn session(&self, id: SessionId) -> Result<StudySession, StoreError> {
        lock(&self.data)?
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "session",
                id,
            })
    }

    fn insert_session(&self, mut session: StudySession) -> Result<SessionId, StoreError> {
        let mut data = lock(&self.data)?;
        data.next_session_id += 1;
        session.id = data.next_session_id;
        let id = session.id;
        data.sessions.insert(id, session);
        Ok(id)
    }

    fn save_transition(
        &self,
        session: &StudySession,
        expected: SessionStatus,
    ) -> Result<bool, StoreError> {
        let mut data = lock(&self.data)?;
        let stored = data.sessions.get_mut(&session.id).ok_or(StoreError::NotFound {
            entity: "session",
            id: session.id,
        })?;
        if stored.status != expected {
            return Ok(false);
        }
        *stored = session.clone();
        Ok(true)
    }

    fn claim_reminder(&self, id: SessionId) -> Result<bool, StoreError> {
        let mut data = lock(&self.data)?;
        let stored = data.sessions.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "session",
            id,
        })?;
        if stored.reminder_sent {
            return Ok(false);
        }
        stored.reminder_sent = true;
        Ok(true)
    }

    fn schedules_for_user(&self, user_id: UserId) -> Result<Vec<Schedule>, StoreError> {
        self.check_user(user_id)?;
        Ok(lock(&self.data)?
            .schedules
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    fn insert_week(
        &self,
        mut schedule: Schedule,
        sessions: Vec<StudySession>,
    ) -> Result<(ScheduleId, Vec<ScheduleId>), StoreError> {
        self.check_write(schedule.user_id)?;
        let mut data = lock(&self.data)?;

        let id = data.next_schedule_id + 1;
        schedule.id = id;
        schedule.is_active = false;
        let mut schedules = data.schedules.clone();
        schedules.push(schedule);
        let deactivated = activate_exclusive(&mut schedules, id)?;

        data.next_schedule_id = id;
        data.schedules = schedules;
        for mut session in sessions {
            data.next_session_id += 1;
            session.id = data.next_session_id;
            session.schedule_id = Some(id);
            data.sessions.insert(session.id, session);
        }
        Ok((id, deactivated))
    }
}

/// Process-local job lock keyed by job name.
#[derive(Debug, Default)]
pub struct InMemoryJobLock {
    held: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobLock for InMemoryJobLock {
    fn try_acquire(&self, job: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool, StoreError> {
        let mut held = lock(&self.held)?;
        if let Some(expires) = held.get(job) {
            if *expires > now {
                return Ok(false);
            }
        }
        held.insert(job.to_string(), now + ttl);
        Ok(true)
    }

    fn release(&self, job: &str) -> Result<(), StoreError> {
        lock(&self.held)?.remove(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn session(date: NaiveDate) -> StudySession {
        StudySession::new(0, 1, 1, date, NaiveTime::from_hms_opt(17, 0, 0).unwrap(), 30)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn compare_and_set_rejects_stale_writer() {
        let store = InMemoryStore::new();
        let id = store.insert_session(session(day(2))).unwrap();

        let mut a = store.session(id).unwrap();
        let mut b = a.clone();
        a.status = SessionStatus::Skipped;
        b.status = SessionStatus::Missed;

        assert!(store.save_transition(&a, SessionStatus::Scheduled).unwrap());
        assert!(!store.save_transition(&b, SessionStatus::Scheduled).unwrap());
        assert_eq!(store.session(id).unwrap().status, SessionStatus::Skipped);
    }

    #[test]
    fn reminder_claim_is_once() {
        let store = InMemoryStore::new();
        let id = store.insert_session(session(day(2))).unwrap();
        assert!(store.claim_reminder(id).unwrap());
        assert!(!store.claim_reminder(id).unwrap());
    }

    #[test]
    fn session_range_is_inclusive() {
        let store = InMemoryStore::new();
        for d in 1..=5 {
            store.insert_session(session(day(d))).unwrap();
        }
        let got = store.sessions_for_user(1, day(2), day(4)).unwrap();
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn inserted_week_is_the_only_active_one() {
        let store = InMemoryStore::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let (first, off) = store
            .insert_week(Schedule::new(0, 1, day(2), day(8), at), vec![session(day(2))])
            .unwrap();
        assert!(off.is_empty());
        let (second, off) = store
            .insert_week(Schedule::new(0, 1, day(9), day(15), at), vec![session(day(9))])
            .unwrap();

        assert_eq!(off, vec![first]);
        let active: Vec<_> = store
            .schedules_for_user(1)
            .unwrap()
            .into_iter()
            .filter(|s| s.is_active)
            .map(|s| s.id)
            .collect();
        assert_eq!(active, vec![second]);
        let tagged: Vec<_> = store
            .sessions_for_user(1, day(1), day(15))
            .unwrap()
            .into_iter()
            .map(|s| s.schedule_id)
            .collect();
        assert_eq!(tagged, vec![Some(first), Some(second)]);
    }

    #[test]
    fn rejected_week_leaves_nothing_behind() {
        let store = InMemoryStore::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        store.fail_writes(1).unwrap();

        let err = store
            .insert_week(Schedule::new(0, 1, day(2), day(8), at), vec![session(day(2))])
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.schedules_for_user(1).unwrap().is_empty());
        assert!(store.sessions_for_user(1, day(1), day(8)).unwrap().is_empty());
    }

    #[test]
    fn allocation_is_all_or_nothing() {
        let store = InMemoryStore::new();
        store
            .upsert_subject(SubjectForUser::new(1, 1, "Math").with_weekly_minutes(300))
            .unwrap();
        store
            .upsert_subject(SubjectForUser::new(2, 1, "History").with_weekly_minutes(200))
            .unwrap();
        let minutes = |store: &InMemoryStore| -> Vec<u32> {
            store
                .subjects_for_user(1)
                .unwrap()
                .iter()
                .map(|s| s.weekly_minutes)
                .collect()
        };

        let stale = [
            AllocationDelta { subject_id: 1, before: 300, after: 340 },
            AllocationDelta { subject_id: 2, before: 180, after: 160 },
        ];
        assert!(matches!(
            store.apply_allocation(1, &stale),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(minutes(&store), vec![300, 200]);

        let unknown = [
            AllocationDelta { subject_id: 1, before: 300, after: 340 },
            AllocationDelta { subject_id: 9, before: 200, after: 160 },
        ];
        assert!(matches!(
            store.apply_allocation(1, &unknown),
            Err(StoreError::NotFound { entity: "subject", id: 9 })
        ));
        assert_eq!(minutes(&store), vec![300, 200]);

        let good = [
            AllocationDelta { subject_id: 1, before: 300, after: 340 },
            AllocationDelta { subject_id: 2, before: 200, after: 160 },
        ];
        store.apply_allocation(1, &good).unwrap();
        assert_eq!(minutes(&store), vec![340, 160]);
    }

    #[test]
    fn overdue_sessions_have_no_lower_bound() {
        let store = InMemoryStore::new();
        let last_autumn = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        let old = store.insert_session(session(last_autumn)).unwrap();
        let recent = store.insert_session(session(day(9))).unwrap();
        store.insert_session(session(day(11))).unwrap();
        let mut done = store.session(recent).unwrap();
        done.status = SessionStatus::Completed;
        store.save_transition(&done, SessionStatus::Scheduled).unwrap();
        let open = store.insert_session(session(day(10))).unwrap();

        let ids: Vec<_> = store
            .overdue_scheduled_sessions(1, day(10))
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![old, open]);
    }

    #[test]
    fn restore_replaces_contents() {
        let store = InMemoryStore::new();
        store.add_user(User::new(1, "a")).unwrap();
        let saved = store.snapshot().unwrap();
        store.add_user(User::new(2, "b")).unwrap();

        store.restore(saved).unwrap();
        assert_eq!(store.active_users().unwrap().len(), 1);
    }

    #[test]
    fn faults_are_scoped() {
        let store = InMemoryStore::new();
        store.add_user(User::new(1, "a")).unwrap();
        store.fail_user(1).unwrap();
        assert!(store.subjects_for_user(1).unwrap_err().is_transient());
        assert!(store.subjects_for_user(2).unwrap().is_empty());

        store.fail_listing(1).unwrap();
        assert!(store.active_users().is_err());
        assert_eq!(store.active_users().unwrap().len(), 1);
    }

    #[test]
    fn job_lock_expires_after_ttl() {
        let locks = InMemoryJobLock::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let ttl = Duration::minutes(5);

        assert!(locks.try_acquire("job", now, ttl).unwrap());
        assert!(!locks.try_acquire("job", now + Duration::minutes(1), ttl).unwrap());
        assert!(locks.try_acquire("job", now + Duration::minutes(6), ttl).unwrap());

        locks.release("job").unwrap();
        assert!(locks.try_acquire("job", now, ttl).unwrap());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let store = InMemoryStore::new();
        store.add_user(User::new(1, "a")).unwrap();
        store.insert_session(session(day(2))).unwrap();

        let json = serde_json::to_string(&store.snapshot().unwrap()).unwrap();
        let back: StoreSnapshot = serde_json::from_str(&json).unwrap();
        let restored = InMemoryStore::from_snapshot(back);
        assert_eq!(restored.insert_session(session(day(3))).unwrap(), 2);
    }
}
