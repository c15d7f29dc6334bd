//! Planner configuration.
//!
//! Every tunable of the heuristics lives here so that the scoring and
//! adaptation code stays parameterised and testable. All sections default to
//! the production values, so a config file only needs the keys it overrides.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reminders::ReminderPolicy;

/// Weights of the five priority sub-scores. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub proximity: f64,
    pub coefficient: f64,
    pub difficulty: f64,
    pub recency: f64,
    pub performance: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            proximity: 0.30,
            coefficient: 0.25,
            difficulty: 0.20,
            recency: 0.15,
            performance: 0.10,
        }
    }
}

impl PriorityWeights {
    const TOLERANCE: f64 = 1e-6;

    pub fn sum(&self) -> f64 {
        self.proximity + self.coefficient + self.difficulty + self.recency + self.performance
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("proximity", self.proximity),
            ("coefficient", self.coefficient),
            ("difficulty", self.difficulty),
            ("recency", self.recency),
            ("performance", self.performance),
        ] {
            if !(value >= 0.0) {
                return Err(ConfigError::NegativeWeight { name, value });
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > Self::TOLERANCE {
            return Err(ConfigError::WeightsSum { sum });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritySection {
    pub weights: PriorityWeights,
    /// Exams further away than this contribute nothing.
    pub exam_horizon_days: i64,
    /// Days without study after which recency saturates.
    pub recency_cap_days: i64,
    /// Trailing window for the recent-performance sub-score.
    pub performance_window_days: i64,
}

impl Default for PrioritySection {
    fn default() -> Self {
        Self {
            weights: PriorityWeights::default(),
            exam_horizon_days: 90,
            recency_cap_days: 30,
            performance_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    /// Minutes after the scheduled end during which a session can still be started.
    pub grace_minutes: i64,
    /// Minutes before the scheduled start from which a session can be started.
    pub early_start_minutes: i64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            grace_minutes: 15,
            early_start_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationSection {
    pub window_days: i64,
    pub min_sessions: usize,
    /// Share of a donor subject's weekly minutes moved per adaptation.
    pub reallocation_fraction: f64,
    /// Donors never drop below this many weekly minutes.
    pub min_weekly_minutes: u32,
    pub high_miss_rate: f64,
    pub low_completion_rate: f64,
    pub high_completion_rate: f64,
    /// Donors must have an exam-proximity sub-score below this.
    pub donor_max_proximity: f64,
    /// Lookback for behaviour pattern detection.
    pub pattern_window_days: i64,
    /// Consecutive missed or skipped sessions that trigger an adaptation
    /// during the missed-session sweep. Zero disables it.
    pub missed_streak: usize,
}

impl Default for AdaptationSection {
    fn default() -> Self {
        Self {
            window_days: 7,
            min_sessions: 5,
            reallocation_fraction: 0.2,
            min_weekly_minutes: 30,
            high_miss_rate: 0.5,
            low_completion_rate: 0.5,
            high_completion_rate: 0.8,
            donor_max_proximity: 0.5,
            pattern_window_days: 60,
            missed_streak: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingSection {
    #[serde(with = "hhmm")]
    pub study_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub study_end: NaiveTime,
    pub max_daily_minutes: u32,
    pub break_minutes: u32,
    pub auto_reschedule_missed: bool,
    pub reschedule_horizon_days: i64,
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            study_start: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            study_end: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN),
            max_daily_minutes: 240,
            break_minutes: 10,
            auto_reschedule_missed: true,
            reschedule_horizon_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// IANA timezone in which session dates and job cadences are evaluated.
    pub timezone: String,
    pub priority: PrioritySection,
    pub lifecycle: LifecycleSection,
    pub adaptation: AdaptationSection,
    pub reminders: ReminderPolicy,
    pub scheduling: SchedulingSection,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            timezone: "Africa/Algiers".to_string(),
            priority: PrioritySection::default(),
            lifecycle: LifecycleSection::default(),
            adaptation: AdaptationSection::default(),
            reminders: ReminderPolicy::default(),
            scheduling: SchedulingSection::default(),
        }
    }
}

impl PlannerConfig {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::Timezone(self.timezone.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;
        self.priority.weights.validate()?;

        if self.priority.exam_horizon_days < 2 {
            return Err(invalid("priority.exam_horizon_days", "must be at least 2"));
        }
        if self.priority.recency_cap_days < 1 {
            return Err(invalid("priority.recency_cap_days", "must be positive"));
        }
        if self.lifecycle.grace_minutes < 0 || self.lifecycle.early_start_minutes < 0 {
            return Err(invalid("lifecycle", "minutes must be non-negative"));
        }
        if self.adaptation.window_days < 1 {
            return Err(invalid("adaptation.window_days", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.adaptation.reallocation_fraction) {
            return Err(invalid(
                "adaptation.reallocation_fraction",
                "must be within [0, 1]",
            ));
        }
        if self.reminders.window_minutes < 1 {
            return Err(invalid("reminders.window_minutes", "must be positive"));
        }
        if self.scheduling.study_end <= self.scheduling.study_start {
            return Err(invalid(
                "scheduling.study_end",
                "must be after scheduling.study_start",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// `HH:MM` (de)serialisation for study-window bounds.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PlannerConfig::default().validate().unwrap();
    }

    #[test]
    fn weights_must_sum_to_one() {
        let weights = PriorityWeights {
            proximity: 0.5,
            ..PriorityWeights::default()
        };
        assert!(matches!(weights.validate(), Err(ConfigError::WeightsSum { .. })));
    }

    #[test]
    fn negative_weight_is_rejected() {
        let weights = PriorityWeights {
            proximity: -0.1,
            coefficient: 0.65,
            ..PriorityWeights::default()
        };
        assert!(matches!(
            weights.validate(),
            Err(ConfigError::NegativeWeight { name: "proximity", .. })
        ));
    }

    #[test]
    fn study_window_round_trips_as_hhmm() {
        let cfg = PlannerConfig::default();
        let json = serde_json::to_string(&cfg.scheduling).unwrap();
        assert!(json.contains("\"study_start\":\"16:00\""));

        let back: SchedulingSection =
            serde_json::from_str(r#"{"study_start":"08:30","study_end":"12:00"}"#).unwrap();
        assert_eq!(back.study_start, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(back.max_daily_minutes, 240);
    }

    #[test]
    fn inverted_study_window_is_invalid() {
        let mut cfg = PlannerConfig::default();
        cfg.scheduling.study_end = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        assert!(cfg.validate().is_err());
    }
}
