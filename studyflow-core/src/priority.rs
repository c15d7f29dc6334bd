//! Priority scorer: ranks a user's subjects by what they should study next.
//!
//! The score is a weighted sum of five sub-scores, each normalised to [0, 1]:
//!
//! - exam proximity: 1 when the exam is at most a day away, `1 - sqrt((d-1)/H)`
//!   up to the horizon `H` (default 90 days), 0 beyond it or once it has passed
//! - coefficient: the subject's coefficient over the user's largest one
//! - difficulty: fixed mapping, see [`Difficulty::weight`]
//! - recency: days since last studied over a cap (default 30), 1 if never
//! - performance: `1 - recent_score`, 0.5 when there is no recent data
//!
//! Scoring is pure; the priority job is the only writer of the result.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::{PrioritySection, PriorityWeights};
use crate::session::{SessionStatus, StudySession};
use crate::subject::{Difficulty, SubjectForUser, SubjectId};
use crate::time::{days_between, local_today};

/// Neutral performance when a subject has no completed sessions in the window.
const NEUTRAL_PERFORMANCE: f64 = 0.5;

/// Everything the scorer needs to know about one subject.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubjectContext {
    /// Days from today to the exam; negative once it has passed.
    pub days_until_exam: Option<i64>,
    pub coefficient: u32,
    /// Largest coefficient among the user's subjects.
    pub max_coefficient: u32,
    pub difficulty: Difficulty,
    /// Whole days since the subject was last studied; `None` if never.
    pub days_since_studied: Option<i64>,
    /// Recent performance in [0, 1].
    pub recent_score: Option<f64>,
}

/// Sub-scores and the weighted total, kept for logging and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityBreakdown {
    pub proximity: f64,
    pub coefficient: f64,
    pub difficulty: f64,
    pub recency: f64,
    pub performance: f64,
    pub total: f64,
}

pub fn proximity_score(days_until_exam: Option<i64>, horizon_days: i64) -> f64 {
    let Some(days) = days_until_exam else {
        return 0.0;
    };
    if days < 0 || days > horizon_days {
        return 0.0;
    }
    if days <= 1 {
        return 1.0;
    }
    let ratio = (days - 1) as f64 / horizon_days as f64;
    (1.0 - ratio.sqrt()).clamp(0.0, 1.0)
}

pub fn coefficient_score(coefficient: u32, max_coefficient: u32) -> f64 {
    if max_coefficient == 0 {
        return 0.0;
    }
    (f64::from(coefficient) / f64::from(max_coefficient)).clamp(0.0, 1.0)
}

pub fn recency_score(days_since_studied: Option<i64>, cap_days: i64) -> f64 {
    match days_since_studied {
        None => 1.0,
        Some(days) => (days.max(0) as f64 / cap_days.max(1) as f64).min(1.0),
    }
}

pub fn performance_score(recent_score: Option<f64>) -> f64 {
    match recent_score {
        None => NEUTRAL_PERFORMANCE,
        Some(score) if score.is_nan() => NEUTRAL_PERFORMANCE,
        Some(score) => 1.0 - score.clamp(0.0, 1.0),
    }
}

/// Weighted priority of one subject, clamped to [0, 1].
pub fn score(ctx: &SubjectContext, section: &PrioritySection) -> PriorityBreakdown {
    let weights: &PriorityWeights = &section.weights;

    let proximity = proximity_score(ctx.days_until_exam, section.exam_horizon_days);
    let coefficient = coefficient_score(ctx.coefficient, ctx.max_coefficient);
    let difficulty = ctx.difficulty.weight();
    let recency = recency_score(ctx.days_since_studied, section.recency_cap_days);
    let performance = performance_score(ctx.recent_score);

    let total = weights.proximity * proximity
        + weights.coefficient * coefficient
        + weights.difficulty * difficulty
        + weights.recency * recency
        + weights.performance * performance;

    PriorityBreakdown {
        proximity,
        coefficient,
        difficulty,
        recency,
        performance,
        total: total.clamp(0.0, 1.0),
    }
}

/// Build the scorer input for `subject` from stored data.
///
/// `sessions` are the user's sessions; only completed ones of this subject are
/// read. Recent score averages completion over the performance window.
pub fn context_for(
    subject: &SubjectForUser,
    max_coefficient: u32,
    sessions: &[StudySession],
    now: DateTime<Utc>,
    tz: Tz,
    section: &PrioritySection,
) -> SubjectContext {
    let today: NaiveDate = local_today(now, tz);
    let window_start = now - Duration::days(section.performance_window_days);

    let completed = sessions
        .iter()
        .filter(|s| s.subject_id == subject.subject_id && s.status == SessionStatus::Completed);

    let mut last_studied = subject.last_studied_at;
    let mut recent_total = 0.0;
    let mut recent_count = 0usize;

    for s in completed {
        let finished = s.actual_end.or_else(|| s.end_utc(tz));
        if let Some(end) = finished {
            if last_studied.is_none_or(|prev| end > prev) {
                last_studied = Some(end);
            }
            if end >= window_start && end <= now {
                if let Some(pct) = s.completion_percentage {
                    recent_total += f64::from(pct) / 100.0;
                    recent_count += 1;
                }
            }
        }
    }

    SubjectContext {
        days_until_exam: subject.exam_date.map(|exam| days_between(today, exam)),
        coefficient: subject.coefficient,
        max_coefficient,
        difficulty: subject.difficulty,
        days_since_studied: last_studied.map(|at| (now - at).num_days()),
        recent_score: (recent_count > 0).then(|| recent_total / recent_count as f64),
    }
}

/// Score every subject of one user. Output order follows `subjects`.
pub fn score_subjects(
    subjects: &[SubjectForUser],
    sessions: &[StudySession],
    now: DateTime<Utc>,
    tz: Tz,
    section: &PrioritySection,
) -> Vec<(SubjectId, PriorityBreakdown)> {
    let max_coefficient = subjects.iter().map(|s| s.coefficient).max().unwrap_or(0);
    subjects
        .iter()
        .map(|subject| {
            let ctx = context_for(subject, max_coefficient, sessions, now, tz, section);
            (subject.subject_id, score(&ctx, section))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn section() -> PrioritySection {
        PrioritySection::default()
    }

    fn example_ctx() -> SubjectContext {
        SubjectContext {
            days_until_exam: Some(2),
            coefficient: 4,
            max_coefficient: 4,
            difficulty: Difficulty::Hard,
            days_since_studied: Some(10),
            recent_score: Some(0.5),
        }
    }

    #[test]
    fn worked_example_scores_about_082() {
        let b = score(&example_ctx(), &section());
        assert!((b.proximity - 0.895).abs() < 0.01, "proximity {}", b.proximity);
        assert_eq!(b.coefficient, 1.0);
        assert_eq!(b.difficulty, 1.0);
        assert!((b.recency - 0.333).abs() < 0.01);
        assert_eq!(b.performance, 0.5);
        assert!((b.total - 0.82).abs() < 0.01, "total {}", b.total);
    }

    #[test]
    fn proximity_saturates_and_vanishes() {
        assert_eq!(proximity_score(None, 90), 0.0);
        assert_eq!(proximity_score(Some(0), 90), 1.0);
        assert_eq!(proximity_score(Some(1), 90), 1.0);
        assert_eq!(proximity_score(Some(91), 90), 0.0);
        assert_eq!(proximity_score(Some(-1), 90), 0.0);
    }

    #[test]
    fn proximity_stays_positive_until_horizon() {
        for days in 0..=90 {
            assert!(proximity_score(Some(days), 90) > 0.0, "day {days}");
        }
    }

    #[test]
    fn score_is_non_decreasing_as_exam_approaches() {
        let mut ctx = example_ctx();
        let mut previous = -1.0;
        for days in (0..=120).rev() {
            ctx.days_until_exam = Some(days);
            let total = score(&ctx, &section()).total;
            assert!(total >= previous, "score dropped at {days} days");
            previous = total;
        }
    }

    #[test]
    fn score_is_always_in_unit_interval() {
        for difficulty in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            for days in [None, Some(-5), Some(0), Some(30), Some(400)] {
                for studied in [None, Some(0), Some(100)] {
                    for perf in [None, Some(0.0), Some(1.0), Some(7.0)] {
                        let ctx = SubjectContext {
                            days_until_exam: days,
                            coefficient: 9,
                            max_coefficient: 3,
                            difficulty,
                            days_since_studied: studied,
                            recent_score: perf,
                        };
                        let total = score(&ctx, &section()).total;
                        assert!((0.0..=1.0).contains(&total));
                    }
                }
            }
        }
    }

    #[test]
    fn scoring_is_idempotent() {
        let a = score(&example_ctx(), &section());
        let b = score(&example_ctx(), &section());
        assert_eq!(a, b);
    }

    #[test]
    fn context_uses_latest_completion_and_window_average() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let subject = SubjectForUser::new(7, 1, "Physics")
            .with_coefficient(5)
            .with_exam(NaiveDate::from_ymd_opt(2026, 3, 20).unwrap())
            .with_last_studied(now - Duration::days(20));

        let day = |d: u32| NaiveDate::from_ymd_opt(2026, 3, d).unwrap();
        let at = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let sessions = vec![
            StudySession::new(1, 1, 7, day(8), at, 60).completed_with(60, None),
            StudySession::new(2, 1, 7, day(9), at, 60).completed_with(100, None),
            // Outside the 7-day window: ignored for the average.
            StudySession::new(3, 1, 7, day(1), at, 60).completed_with(0, None),
            // Other subject.
            StudySession::new(4, 1, 8, day(9), at, 60).completed_with(10, None),
        ];

        let ctx = context_for(&subject, 7, &sessions, now, tz, &section());
        assert_eq!(ctx.days_until_exam, Some(10));
        // Latest completion ended 2026-03-09 10:00, 26 hours before `now`.
        assert_eq!(ctx.days_since_studied, Some(1));
        assert!((ctx.recent_score.unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(ctx.max_coefficient, 7);
    }

    #[test]
    fn score_subjects_normalises_against_users_max_coefficient() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let subjects = vec![
            SubjectForUser::new(1, 1, "Math").with_coefficient(7),
            SubjectForUser::new(2, 1, "Sport").with_coefficient(1),
        ];
        let scored = score_subjects(&subjects, &[], now, tz, &section());
        assert_eq!(scored[0].1.coefficient, 1.0);
        assert!((scored[1].1.coefficient - 1.0 / 7.0).abs() < 1e-9);
        assert!(scored[0].1.total > scored[1].1.total);
    }
}
