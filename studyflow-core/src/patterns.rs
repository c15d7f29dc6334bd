//! Behaviour pattern detection over a user's session history.

use std::collections::BTreeMap;

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::session::{SessionStatus, StudySession};
use crate::subject::SubjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayPeriod {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl DayPeriod {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => DayPeriod::Morning,
            12..=16 => DayPeriod::Afternoon,
            17..=21 => DayPeriod::Evening,
            _ => DayPeriod::Night,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorPatterns {
    pub total_sessions: usize,
    /// Completed over total, as a percentage rounded to 2 decimals.
    pub consistency_score: f64,
    /// Period with the highest mean focus score among completed sessions.
    pub most_productive_period: Option<DayPeriod>,
    /// Mean actual duration of completed sessions, in minutes.
    pub preferred_duration_minutes: i64,
    /// Completion percentage per subject.
    pub subject_completion_rates: BTreeMap<SubjectId, f64>,
}

/// Summarise `sessions`; `None` when there is nothing to learn from.
pub fn detect_patterns(sessions: &[StudySession]) -> Option<BehaviorPatterns> {
    if sessions.is_empty() {
        return None;
    }

    let completed: Vec<&StudySession> = sessions
        .iter()
        .filter(|s| s.status == SessionStatus::Completed)
        .collect();

    let consistency = completed.len() as f64 / sessions.len() as f64 * 100.0;

    let mut focus_by_period: BTreeMap<DayPeriod, (f64, usize)> = BTreeMap::new();
    for s in &completed {
        if let Some(focus) = s.focus_score {
            let entry = focus_by_period
                .entry(DayPeriod::from_hour(s.scheduled_start_time.hour()))
                .or_insert((0.0, 0));
            entry.0 += f64::from(focus);
            entry.1 += 1;
        }
    }
    let most_productive_period = focus_by_period
        .into_iter()
        .map(|(period, (sum, n))| (period, sum / n as f64))
        .fold(None::<(DayPeriod, f64)>, |best, (period, mean)| match best {
            Some((_, best_mean)) if best_mean >= mean => best,
            _ => Some((period, mean)),
        })
        .map(|(period, _)| period);

    let durations: Vec<i64> = completed
        .iter()
        .filter_map(|s| s.actual_duration_minutes)
        .collect();
    let preferred_duration_minutes = if durations.is_empty() {
        0
    } else {
        (durations.iter().sum::<i64>() as f64 / durations.len() as f64).round() as i64
    };

    let mut per_subject: BTreeMap<SubjectId, (usize, usize)> = BTreeMap::new();
    for s in sessions {
        let entry = per_subject.entry(s.subject_id).or_insert((0, 0));
        entry.1 += 1;
        if s.status == SessionStatus::Completed {
            entry.0 += 1;
        }
    }
    let subject_completion_rates = per_subject
        .into_iter()
        .map(|(id, (done, total))| (id, round2(done as f64 / total as f64 * 100.0)))
        .collect();

    Some(BehaviorPatterns {
        total_sessions: sessions.len(),
        consistency_score: round2(consistency),
        most_productive_period,
        preferred_duration_minutes,
        subject_completion_rates,
    })
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn session(id: u64, subject: SubjectId, hour: u32) -> StudySession {
        StudySession::new(
            id,
            1,
            subject,
            NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            60,
        )
    }

    #[test]
    fn empty_history_has_no_patterns() {
        assert!(detect_patterns(&[]).is_none());
    }

    #[test]
    fn detects_consistency_and_best_period() {
        let mut morning = session(1, 1, 8).completed_with(100, Some(9));
        morning.actual_duration_minutes = Some(50);
        let mut evening = session(2, 1, 19).completed_with(100, Some(4));
        evening.actual_duration_minutes = Some(30);
        let missed = session(3, 2, 19).with_status(SessionStatus::Missed);

        let p = detect_patterns(&[morning, evening, missed]).unwrap();
        assert_eq!(p.total_sessions, 3);
        assert_eq!(p.consistency_score, 66.67);
        assert_eq!(p.most_productive_period, Some(DayPeriod::Morning));
        assert_eq!(p.preferred_duration_minutes, 40);
        assert_eq!(p.subject_completion_rates.get(&1), Some(&100.0));
        assert_eq!(p.subject_completion_rates.get(&2), Some(&0.0));
    }

    #[test]
    fn period_boundaries() {
        assert_eq!(DayPeriod::from_hour(5), DayPeriod::Morning);
        assert_eq!(DayPeriod::from_hour(12), DayPeriod::Afternoon);
        assert_eq!(DayPeriod::from_hour(17), DayPeriod::Evening);
        assert_eq!(DayPeriod::from_hour(22), DayPeriod::Night);
        assert_eq!(DayPeriod::from_hour(3), DayPeriod::Night);
    }
}
