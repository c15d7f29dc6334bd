//! Adaptation engine: moves weekly study minutes between a user's subjects
//! based on how the trailing window went.
//!
//! Receivers are subjects the user keeps missing or not finishing. Donors are
//! subjects the user reliably completes whose exam is not close. Donors give a
//! fixed fraction of their minutes (never below a floor) and the pool is split
//! across receivers by miss rate, so the weekly total never changes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::PlannerConfig;
use crate::patterns::detect_patterns;
use crate::priority::proximity_score;
use crate::session::{SessionStatus, StudySession};
use crate::subject::{SubjectForUser, SubjectId, User};
use crate::time::{days_between, local_today};

/// Completion percentage at or above which a session counts as finished.
const FINISHED_PERCENTAGE: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationTrigger {
    WeeklyOptimization,
    MissedStreak,
    Manual { analysis_days: i64 },
}

impl AdaptationTrigger {
    pub fn analysis_days(&self, default_days: i64) -> i64 {
        match self {
            AdaptationTrigger::Manual { analysis_days } => (*analysis_days).max(1),
            _ => default_days,
        }
    }
}

impl fmt::Display for AdaptationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdaptationTrigger::WeeklyOptimization => f.write_str("weekly_optimization"),
            AdaptationTrigger::MissedStreak => f.write_str("missed_streak"),
            AdaptationTrigger::Manual { .. } => f.write_str("manual"),
        }
    }
}

/// Outcomes of one subject's sessions inside the analysis window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub subject_id: SubjectId,
    pub total: usize,
    pub completed: usize,
    /// Completed with at least 80% of the planned work done.
    pub finished: usize,
    pub missed: usize,
    pub skipped: usize,
    pub avg_completion: Option<f64>,
    pub planned_minutes: u64,
}

impl PerformanceSample {
    fn resolved(&self) -> usize {
        self.completed + self.missed + self.skipped
    }

    /// Share of resolved sessions that were finished; `None` without data.
    pub fn completion_rate(&self) -> Option<f64> {
        let resolved = self.resolved();
        (resolved > 0).then(|| self.finished as f64 / resolved as f64)
    }

    /// Share of resolved sessions that were missed or skipped.
    pub fn miss_rate(&self) -> Option<f64> {
        let resolved = self.resolved();
        (resolved > 0).then(|| (self.missed + self.skipped) as f64 / resolved as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientData { found: usize, required: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InsufficientData { found, required } => {
                write!(f, "insufficient data ({found} of {required} sessions)")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDelta {
    pub subject_id: SubjectId,
    pub before: u32,
    pub after: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationResult {
    pub changes_count: usize,
    pub improvements: Vec<String>,
    pub deltas: Vec<AllocationDelta>,
    pub samples: Vec<PerformanceSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdaptationOutcome {
    Adapted(AdaptationResult),
    Skipped(SkipReason),
}

/// Sessions whose scheduled start lies in `[now - days, now]`.
pub fn sessions_in_window<'a>(
    sessions: &'a [StudySession],
    now: DateTime<Utc>,
    tz: Tz,
    days: i64,
) -> Vec<&'a StudySession> {
    let from = now - Duration::days(days);
    sessions
        .iter()
        .filter(|s| s.starts_within(tz, from, now))
        .collect()
}

pub fn aggregate(sessions: &[&StudySession]) -> BTreeMap<SubjectId, PerformanceSample> {
    let mut samples: BTreeMap<SubjectId, PerformanceSample> = BTreeMap::new();
    let mut completion_sums: BTreeMap<SubjectId, (f64, usize)> = BTreeMap::new();

    for s in sessions {
        let sample = samples.entry(s.subject_id).or_insert_with(|| PerformanceSample {
            subject_id: s.subject_id,
            ..PerformanceSample::default()
        });
        sample.total += 1;
        sample.planned_minutes += u64::from(s.planned_duration_minutes);
        match s.status {
            SessionStatus::Completed => {
                sample.completed += 1;
                let pct = s.completion_percentage.unwrap_or(100);
                if pct >= FINISHED_PERCENTAGE {
                    sample.finished += 1;
                }
                let acc = completion_sums.entry(s.subject_id).or_insert((0.0, 0));
                acc.0 += f64::from(pct);
                acc.1 += 1;
            }
            SessionStatus::Missed => sample.missed += 1,
            SessionStatus::Skipped => sample.skipped += 1,
            _ => {}
        }
    }

    for (id, (sum, n)) in completion_sums {
        if let Some(sample) = samples.get_mut(&id) {
            sample.avg_completion = Some(sum / n as f64);
        }
    }
    samples
}

/// Number of most recent resolved sessions, in start order, that were missed
/// or skipped without a completion in between.
pub fn missed_streak(sessions: &[StudySession]) -> usize {
    let mut resolved: Vec<&StudySession> = sessions
        .iter()
        .filter(|s| {
            matches!(
                s.status,
                SessionStatus::Completed | SessionStatus::Missed | SessionStatus::Skipped
            )
        })
        .collect();
    resolved.sort_by_key(|s| (s.scheduled_date, s.scheduled_start_time, s.id));
    resolved
        .iter()
        .rev()
        .take_while(|s| s.status != SessionStatus::Completed)
        .count()
}

/// Zero-sum redistribution of `weekly_minutes`.
///
/// `proximity` maps subject ids to their exam-proximity sub-score.
pub fn reallocate(
    subjects: &[SubjectForUser],
    samples: &BTreeMap<SubjectId, PerformanceSample>,
    proximity: &BTreeMap<SubjectId, f64>,
    config: &PlannerConfig,
) -> Vec<AllocationDelta> {
    let policy = &config.adaptation;

    let mut receivers: Vec<(usize, f64)> = Vec::new();
    let mut gives: Vec<(usize, u32)> = Vec::new();

    for (idx, subject) in subjects.iter().enumerate() {
        let Some(sample) = samples.get(&subject.subject_id) else {
            continue;
        };
        let (Some(completion), Some(miss)) = (sample.completion_rate(), sample.miss_rate()) else {
            continue;
        };

        if miss >= policy.high_miss_rate || completion < policy.low_completion_rate {
            receivers.push((idx, miss));
            continue;
        }

        let near_exam = proximity
            .get(&subject.subject_id)
            .copied()
            .unwrap_or(0.0);
        if completion >= policy.high_completion_rate && near_exam < policy.donor_max_proximity {
            let share = (f64::from(subject.weekly_minutes) * policy.reallocation_fraction).floor() as u32;
            let headroom = subject.weekly_minutes.saturating_sub(policy.min_weekly_minutes);
            let give = share.min(headroom);
            if give > 0 {
                gives.push((idx, give));
            }
        }
    }

    let pool: u32 = gives.iter().map(|(_, g)| g).sum();
    if receivers.is_empty() || pool == 0 {
        return Vec::new();
    }

    let mut after: Vec<u32> = subjects.iter().map(|s| s.weekly_minutes).collect();
    for (idx, give) in &gives {
        after[*idx] -= give;
    }

    let weight_sum: f64 = receivers.iter().map(|(_, w)| w).sum();
    let weight_of = |w: f64| {
        if weight_sum > 0.0 {
            w / weight_sum
        } else {
            1.0 / receivers.len() as f64
        }
    };

    let mut distributed = 0u32;
    for (idx, w) in &receivers {
        let gain = (f64::from(pool) * weight_of(*w)).floor() as u32;
        after[*idx] += gain;
        distributed += gain;
    }
    // Rounding remainder goes to the neediest receiver (first on ties).
    let neediest = receivers
        .iter()
        .fold(None::<(usize, f64)>, |best, &(idx, w)| match best {
            Some((_, bw)) if bw >= w => best,
            _ => Some((idx, w)),
        })
        .map(|(idx, _)| idx);
    if let Some(idx) = neediest {
        after[idx] += pool - distributed;
    }

    subjects
        .iter()
        .zip(after)
        .filter(|(s, a)| s.weekly_minutes != *a)
        .map(|(s, a)| AllocationDelta {
            subject_id: s.subject_id,
            before: s.weekly_minutes,
            after: a,
        })
        .collect()
}

/// Analyse `sessions` for `user` and propose new weekly allocations.
pub fn adapt(
    user: &User,
    subjects: &[SubjectForUser],
    sessions: &[StudySession],
    trigger: AdaptationTrigger,
    now: DateTime<Utc>,
    tz: Tz,
    config: &PlannerConfig,
) -> AdaptationOutcome {
    let policy = &config.adaptation;
    let window_days = trigger.analysis_days(policy.window_days);
    let window = sessions_in_window(sessions, now, tz, window_days);

    if window.len() < policy.min_sessions {
        tracing::debug!(
            user_id = user.id,
            found = window.len(),
            required = policy.min_sessions,
            "not enough sessions to adapt"
        );
        return AdaptationOutcome::Skipped(SkipReason::InsufficientData {
            found: window.len(),
            required: policy.min_sessions,
        });
    }

    let samples = aggregate(&window);
    let today = local_today(now, tz);
    let proximity: BTreeMap<SubjectId, f64> = subjects
        .iter()
        .map(|s| {
            let days = s.exam_date.map(|exam| days_between(today, exam));
            (
                s.subject_id,
                proximity_score(days, config.priority.exam_horizon_days),
            )
        })
        .collect();

    let deltas = reallocate(subjects, &samples, &proximity, config);

    let name_of = |id: SubjectId| {
        subjects
            .iter()
            .find(|s| s.subject_id == id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("subject {id}"))
    };

    let mut improvements: Vec<String> = deltas
        .iter()
        .map(|d| {
            let name = name_of(d.subject_id);
            if d.after > d.before {
                format!("+{} min/week for {name}", d.after - d.before)
            } else {
                format!("-{} min/week from {name}", d.before - d.after)
            }
        })
        .collect();

    let history: Vec<StudySession> =
        sessions_in_window(sessions, now, tz, policy.pattern_window_days)
            .into_iter()
            .cloned()
            .collect();
    if let Some(patterns) = detect_patterns(&history) {
        for (id, rate) in &patterns.subject_completion_rates {
            if *rate < policy.low_completion_rate * 100.0 {
                improvements.push(format!(
                    "{} has low completion rate: {rate}%",
                    name_of(*id)
                ));
            }
        }
        if let Some(period) = patterns.most_productive_period {
            improvements.push(format!("most productive period: {period:?}").to_lowercase());
        }
    }

    AdaptationOutcome::Adapted(AdaptationResult {
        changes_count: deltas.len(),
        improvements,
        deltas,
        samples: samples.into_values().collect(),
    })
}
