//! The periodic batch jobs and their run reports.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, Weekday};
use serde::{Deserialize, Serialize};

use crate::cadence::Cadence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    RecalculatePriorities,
    CheckMissedSessions,
    AdaptSchedules,
    SendReminders,
}

/// Retry budget, timeout and cadence of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSpec {
    pub tries: u32,
    pub timeout: Duration,
    pub cadence: Cadence,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::RecalculatePriorities,
        JobKind::CheckMissedSessions,
        JobKind::AdaptSchedules,
        JobKind::SendReminders,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::RecalculatePriorities => "recalculate-priorities",
            JobKind::CheckMissedSessions => "check-missed-sessions",
            JobKind::AdaptSchedules => "adapt-schedules",
            JobKind::SendReminders => "send-reminders",
        }
    }

    pub fn spec(&self) -> JobSpec {
        match self {
            JobKind::RecalculatePriorities => JobSpec {
                tries: 3,
                timeout: Duration::seconds(300),
                cadence: Cadence::Daily { hour: 0, minute: 0 },
            },
            JobKind::CheckMissedSessions => JobSpec {
                tries: 2,
                timeout: Duration::seconds(180),
                cadence: Cadence::Hourly { minute: 0 },
            },
            JobKind::AdaptSchedules => JobSpec {
                tries: 2,
                timeout: Duration::seconds(600),
                cadence: Cadence::Weekly {
                    weekday: Weekday::Sun,
                    hour: 2,
                    minute: 0,
                },
            },
            JobKind::SendReminders => JobSpec {
                tries: 2,
                timeout: Duration::seconds(120),
                cadence: Cadence::EveryMinutes(15),
            },
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|j| j.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = JobKind::ALL.iter().map(|j| j.name()).collect();
                format!("unknown job '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// Counters for one job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub job: JobKind,
    pub total_users: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Sessions missed, reminders sent, subjects rescored or reallocated.
    pub affected: usize,
    /// Reminders claimed but not accepted by the dispatcher.
    pub dispatch_failures: usize,
    pub timed_out: bool,
    /// Attempt that produced this report, starting at 1.
    pub attempt: u32,
}

impl BatchReport {
    pub fn new(job: JobKind, attempt: u32) -> Self {
        Self {
            job,
            total_users: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            affected: 0,
            dispatch_failures: 0,
            timed_out: false,
            attempt,
        }
    }

    /// Users that were eligible but never visited because of the timeout.
    pub fn not_started(&self) -> usize {
        self.total_users
            .saturating_sub(self.succeeded + self.failed + self.skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobRun {
    Completed(BatchReport),
    /// Another run holds the job lock.
    AlreadyRunning,
}
