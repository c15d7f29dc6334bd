//! Batch orchestrator: runs the periodic jobs over every eligible user.
//!
//! Each run holds the job's lock for at most its timeout, visits users one at
//! a time and isolates per-user failures. Only failures that prevent the sweep
//! itself (listing users, acquiring the lock) fail an attempt; those are
//! retried up to the job's budget and then surfaced as
//! [`PlannerError::JobFailed`].

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::adaptation::{self, AdaptationOutcome, AdaptationTrigger};
use crate::config::PlannerConfig;
use crate::error::{PlannerError, StoreError};
use crate::jobs::{BatchReport, JobKind, JobRun, JobSpec};
use crate::lifecycle::{self, CompletionReport, TransitionOutcome};
use crate::patterns::{BehaviorPatterns, detect_patterns};
use crate::planner::{self, DAYS_PER_WEEK, GeneratedWeek};
use crate::priority;
use crate::reminders;
use crate::rescheduling;
use crate::schedule::{ScheduleId, active_schedule};
use crate::session::{SessionAction, SessionId, SessionStatus, StudySession};
use crate::store::{JobLock, NotificationDispatcher, PlannerStore};
use crate::subject::{SubjectForUser, User};
use crate::time::{Clock, local_today};

/// Sessions missed longer ago than this are marked but not rescheduled.
const RESCHEDULE_LOOKBACK_DAYS: i64 = 7;

enum UserOutcome {
    Done {
        affected: usize,
        dispatch_failures: usize,
    },
    Skipped(String),
}

impl UserOutcome {
    fn done(affected: usize) -> Self {
        UserOutcome::Done {
            affected,
            dispatch_failures: 0,
        }
    }
}

pub struct Orchestrator<S, N, L, C> {
    store: S,
    notifier: N,
    locks: L,
    clock: C,
    config: PlannerConfig,
    tz: Tz,
}

impl<S, N, L, C> Orchestrator<S, N, L, C>
where
    S: PlannerStore,
    N: NotificationDispatcher,
    L: JobLock,
    C: Clock,
{
    pub fn new(
        store: S,
        notifier: N,
        locks: L,
        clock: C,
        config: PlannerConfig,
    ) -> Result<Self, PlannerError> {
        config.validate()?;
        let tz = config.tz()?;
        Ok(Self {
            store,
            notifier,
            locks,
            clock,
            config,
            tz,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        local_today(now, self.tz)
    }

    /// Run `job` once: lock, sweep with retries, unlock.
    pub fn run(&self, job: JobKind) -> Result<JobRun, PlannerError> {
        let spec = job.spec();
        let now = self.clock.now();

        if !self.locks.try_acquire(job.name(), now, spec.timeout)? {
            tracing::info!(job = job.name(), "job already running; skipping trigger");
            return Ok(JobRun::AlreadyRunning);
        }

        let result = self.run_with_retry(job, spec);

        if let Err(err) = self.locks.release(job.name()) {
            tracing::warn!(job = job.name(), error = %err, "failed to release job lock");
        }
        result.map(JobRun::Completed)
    }

    fn run_with_retry(&self, job: JobKind, spec: JobSpec) -> Result<BatchReport, PlannerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_once(job, attempt, spec) {
                Ok(report) => return Ok(report),
                Err(err) if attempt < spec.tries => {
                    tracing::warn!(
                        job = job.name(),
                        attempt,
                        tries = spec.tries,
                        transient = err.is_transient(),
                        error = %err,
                        "job attempt failed; retrying"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        job = job.name(),
                        attempts = attempt,
                        error = %err,
                        "job failed permanently"
                    );
                    return Err(PlannerError::JobFailed {
                        job: job.name(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
            }
        }
    }

    fn run_once(&self, job: JobKind, attempt: u32, spec: JobSpec) -> Result<BatchReport, PlannerError> {
        let started = self.clock.now();
        let deadline = started + spec.timeout;
        let mut report = BatchReport::new(job, attempt);

        let candidates = self.store.active_users()?;
        let mut eligible = Vec::with_capacity(candidates.len());
        for user in candidates {
            match self.is_eligible(job, &user, started) {
                Ok(true) => eligible.push(user),
                Ok(false) => {}
                Err(err) => {
                    report.total_users += 1;
                    report.failed += 1;
                    tracing::error!(job = job.name(), user_id = user.id, error = %err, "eligibility check failed");
                }
            }
        }
        report.total_users += eligible.len();

        for user in &eligible {
            let now = self.clock.now();
            if now >= deadline {
                report.timed_out = true;
                tracing::warn!(
                    job = job.name(),
                    remaining = report.not_started(),
                    "job timed out; remaining users left for the next run"
                );
                break;
            }

            match self.process_user(job, user, now) {
                Ok(UserOutcome::Done {
                    affected,
                    dispatch_failures,
                }) => {
                    report.succeeded += 1;
                    report.affected += affected;
                    report.dispatch_failures += dispatch_failures;
                }
                Ok(UserOutcome::Skipped(reason)) => {
                    report.skipped += 1;
                    tracing::info!(job = job.name(), user_id = user.id, %reason, "user skipped");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(job = job.name(), user_id = user.id, error = %err, "user processing failed");
                }
            }
        }

        tracing::info!(
            job = job.name(),
            attempt,
            total = report.total_users,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            affected = report.affected,
            timed_out = report.timed_out,
            "job finished"
        );
        Ok(report)
    }

    fn is_eligible(&self, job: JobKind, user: &User, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match job {
            JobKind::RecalculatePriorities => {
                Ok(!self.store.subjects_for_user(user.id)?.is_empty())
            }
            JobKind::CheckMissedSessions => Ok(true),
            JobKind::AdaptSchedules => {
                let schedules = self.store.schedules_for_user(user.id)?;
                Ok(active_schedule(&schedules, user.id).is_some())
            }
            JobKind::SendReminders => {
                let today = self.today(now);
                Ok(self
                    .store
                    .sessions_for_user(user.id, today, today)?
                    .iter()
                    .any(|s| s.status == SessionStatus::Scheduled && !s.reminder_sent))
            }
        }
    }

    fn process_user(
        &self,
        job: JobKind,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<UserOutcome, PlannerError> {
        match job {
            JobKind::RecalculatePriorities => self.recalculate_priorities(user, now),
            JobKind::CheckMissedSessions => self.check_missed_sessions(user, now),
            JobKind::AdaptSchedules => {
                match self.adapt_and_apply(user, AdaptationTrigger::WeeklyOptimization, now)? {
                    AdaptationOutcome::Skipped(reason) => Ok(UserOutcome::Skipped(reason.to_string())),
                    AdaptationOutcome::Adapted(result) => Ok(UserOutcome::done(result.changes_count)),
                }
            }
            JobKind::SendReminders => self.send_reminders(user, now),
        }
    }

    fn recalculate_priorities(
        &self,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<UserOutcome, PlannerError> {
        let section = &self.config.priority;
        let today = self.today(now);
        let lookback = section.recency_cap_days.max(section.performance_window_days) + 1;

        let subjects = self.store.subjects_for_user(user.id)?;
        let sessions = self
            .store
            .sessions_for_user(user.id, today - Duration::days(lookback), today)?;

        let scored = priority::score_subjects(&subjects, &sessions, now, self.tz, section);
        for (subject_id, breakdown) in &scored {
            self.store
                .update_priority(user.id, *subject_id, breakdown.total)?;
            tracing::debug!(
                user_id = user.id,
                subject_id,
                priority = breakdown.total,
                proximity = breakdown.proximity,
                recency = breakdown.recency,
                "subject rescored"
            );
        }
        Ok(UserOutcome::done(scored.len()))
    }

    fn check_missed_sessions(
        &self,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<UserOutcome, PlannerError> {
        let today = self.today(now);
        let scheduling = &self.config.scheduling;

        let candidates = self.store.overdue_scheduled_sessions(user.id, today)?;
        let reschedule_from = today - Duration::days(RESCHEDULE_LOOKBACK_DAYS);

        let mut upcoming = if scheduling.auto_reschedule_missed {
            self.store.sessions_for_user(
                user.id,
                today + Duration::days(1),
                today + Duration::days(scheduling.reschedule_horizon_days),
            )?
        } else {
            Vec::new()
        };

        let mut missed = 0;
        for mut session in candidates {
            match lifecycle::auto_miss(&mut session, now, self.tz, &self.config.lifecycle) {
                Ok(TransitionOutcome::Applied { .. }) => {}
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(user_id = user.id, session_id = session.id, error = %err, "cannot evaluate session window");
                    continue;
                }
            }

            if !self.store.save_transition(&session, SessionStatus::Scheduled)? {
                tracing::debug!(user_id = user.id, session_id = session.id, "session changed concurrently; not marked missed");
                continue;
            }
            missed += 1;
            tracing::info!(user_id = user.id, session_id = session.id, "session marked missed");

            if scheduling.auto_reschedule_missed && session.scheduled_date >= reschedule_from {
                match rescheduling::reschedule(&session, &upcoming, today, now, scheduling) {
                    Some(copy) => {
                        let new_id = self.store.insert_session(copy.clone())?;
                        tracing::info!(
                            user_id = user.id,
                            session_id = session.id,
                            new_session_id = new_id,
                            date = %copy.scheduled_date,
                            "missed session rescheduled"
                        );
                        upcoming.push(StudySession { id: new_id, ..copy });
                    }
                    None => {
                        tracing::warn!(user_id = user.id, session_id = session.id, "no free slot to reschedule missed session");
                    }
                }
            }
        }

        if missed > 0 {
            self.adapt_after_streak(user, now);
        }
        Ok(UserOutcome::done(missed))
    }

    /// Adapt right away when the user's latest sessions are all missed or
    /// skipped. Failures are logged and never fail the sweep.
    fn adapt_after_streak(&self, user: &User, now: DateTime<Utc>) {
        let threshold = self.config.adaptation.missed_streak;
        if threshold == 0 {
            return;
        }
        let today = self.today(now);
        let window = self.config.adaptation.window_days + 1;
        let streak = match self
            .store
            .sessions_for_user(user.id, today - Duration::days(window), today)
        {
            Ok(sessions) => adaptation::missed_streak(&sessions),
            Err(err) => {
                tracing::warn!(user_id = user.id, error = %err, "cannot read sessions for missed streak");
                return;
            }
        };
        if streak < threshold {
            return;
        }

        tracing::info!(user_id = user.id, streak, "missed streak; adapting schedule");
        match self.adapt_and_apply(user, AdaptationTrigger::MissedStreak, now) {
            Ok(AdaptationOutcome::Skipped(reason)) => {
                tracing::info!(user_id = user.id, %reason, "missed-streak adaptation skipped")
            }
            Ok(AdaptationOutcome::Adapted(_)) => {}
            Err(err) => {
                tracing::warn!(user_id = user.id, error = %err, "missed-streak adaptation failed")
            }
        }
    }

    fn adapt_and_apply(
        &self,
        user: &User,
        trigger: AdaptationTrigger,
        now: DateTime<Utc>,
    ) -> Result<AdaptationOutcome, PlannerError> {
        let today = self.today(now);
        let lookback = self
            .config
            .adaptation
            .pattern_window_days
            .max(trigger.analysis_days(self.config.adaptation.window_days))
            + 1;

        let subjects = self.store.subjects_for_user(user.id)?;
        let sessions = self
            .store
            .sessions_for_user(user.id, today - Duration::days(lookback), today)?;

        let outcome = adaptation::adapt(user, &subjects, &sessions, trigger, now, self.tz, &self.config);
        if let AdaptationOutcome::Adapted(result) = &outcome {
            if !result.deltas.is_empty() {
                self.store.apply_allocation(user.id, &result.deltas)?;
            }
            tracing::info!(
                user_id = user.id,
                %trigger,
                changes = result.changes_count,
                improvements = ?result.improvements,
                "schedule adapted"
            );
        }
        Ok(outcome)
    }

    fn send_reminders(&self, user: &User, now: DateTime<Utc>) -> Result<UserOutcome, PlannerError> {
        let today = self.today(now);
        let sessions = self.store.sessions_for_user(user.id, today, today)?;
        let candidates = reminders::select_candidates(&sessions, now, self.tz, self.config.reminders);
        if candidates.is_empty() {
            return Ok(UserOutcome::done(0));
        }
        let subjects = self.store.subjects_for_user(user.id)?;

        let mut sent = 0;
        let mut dispatch_failures = 0;
        for session in candidates {
            if !self.store.claim_reminder(session.id)? {
                continue;
            }
            let name = subject_name(&subjects, session);
            let Some(payload) = reminders::build_payload(session, &name, now, self.tz) else {
                tracing::warn!(user_id = user.id, session_id = session.id, "session start does not resolve; reminder dropped");
                continue;
            };
            match self.notifier.dispatch(user, &payload) {
                Ok(handle) => {
                    sent += 1;
                    tracing::info!(user_id = user.id, session_id = session.id, %handle, "reminder sent");
                }
                Err(err) => {
                    dispatch_failures += 1;
                    tracing::warn!(user_id = user.id, session_id = session.id, error = %err, "reminder dispatch failed");
                }
            }
        }
        Ok(UserOutcome::Done {
            affected: sent,
            dispatch_failures,
        })
    }

    /// Run the adaptation engine for one user outside the weekly job.
    pub fn adapt(&self, user_id: u64, trigger: AdaptationTrigger) -> Result<AdaptationOutcome, PlannerError> {
        let user = self.store.user(user_id)?;
        self.adapt_and_apply(&user, trigger, self.clock.now())
    }

    /// Apply a user-initiated action to a session and persist it.
    ///
    /// A concurrent writer that changed the session first turns this call into
    /// a no-op when the session ended up terminal, and a conflict otherwise.
    pub fn transition_session(
        &self,
        id: SessionId,
        action: SessionAction,
        report: Option<CompletionReport>,
    ) -> Result<TransitionOutcome, PlannerError> {
        let mut session = self.store.session(id)?;
        let expected = session.status;
        let now = self.clock.now();

        let outcome = match (action, report) {
            (SessionAction::Complete, Some(report)) => lifecycle::complete(&mut session, now, report)?,
            _ => lifecycle::apply(&mut session, action, now, self.tz, &self.config.lifecycle)?,
        };
        if !outcome.is_applied() {
            return Ok(outcome);
        }

        if self.store.save_transition(&session, expected)? {
            tracing::info!(session_id = id, %action, status = %session.status, "session updated");
            return Ok(outcome);
        }
        let current = self.store.session(id)?;
        if current.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(current.status));
        }
        Err(StoreError::Conflict(format!("session {id} changed to {} during {action}", current.status)).into())
    }

    /// Generate and activate the week starting at `start_date` for `user_id`.
    pub fn generate_week(
        &self,
        user_id: u64,
        start_date: NaiveDate,
    ) -> Result<(ScheduleId, GeneratedWeek), PlannerError> {
        let user = self.store.user(user_id)?;
        let subjects = self.store.subjects_for_user(user.id)?;
        let week = planner::generate_week(&user, &subjects, start_date, self.clock.now(), &self.config.scheduling);
        let schedule_id = planner::persist_week(&self.store, week.clone())?;
        tracing::info!(
            user_id,
            schedule_id,
            sessions = week.sessions.len(),
            days = DAYS_PER_WEEK,
            "week generated"
        );
        Ok((schedule_id, week))
    }

    /// Behaviour patterns over the configured lookback.
    pub fn patterns(&self, user_id: u64) -> Result<Option<BehaviorPatterns>, PlannerError> {
        let user = self.store.user(user_id)?;
        let now = self.clock.now();
        let today = self.today(now);
        let days = self.config.adaptation.pattern_window_days;
        let sessions = self
            .store
            .sessions_for_user(user.id, today - Duration::days(days), today)?;
        let window: Vec<StudySession> = adaptation::sessions_in_window(&sessions, now, self.tz, days)
            .into_iter()
            .cloned()
            .collect();
        Ok(detect_patterns(&window))
    }
}

fn subject_name(subjects: &[SubjectForUser], session: &StudySession) -> String {
    subjects
        .iter()
        .find(|s| s.subject_id == session.subject_id)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| format!("subject {}", session.subject_id))
}
