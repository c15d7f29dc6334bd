//! Users and their per-user subject records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type SubjectId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub is_active: bool,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// Normalised difficulty sub-score.
    pub fn weight(&self) -> f64 {
        match self {
            Difficulty::Easy => 0.33,
            Difficulty::Medium => 0.66,
            Difficulty::Hard => 1.0,
        }
    }
}

/// A subject as seen by one user: the inputs of the scorer plus its outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectForUser {
    pub subject_id: SubjectId,
    pub user_id: UserId,
    pub name: String,
    /// Exam coefficient (importance), typically 1-7.
    pub coefficient: u32,
    pub difficulty: Difficulty,
    pub exam_date: Option<NaiveDate>,
    pub last_studied_at: Option<DateTime<Utc>>,
    /// Last score written by the priority job, in [0, 1].
    pub computed_priority: f64,
    /// Share of the user's weekly study budget, in minutes.
    pub weekly_minutes: u32,
}

impl SubjectForUser {
    pub fn new(subject_id: SubjectId, user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            subject_id,
            user_id,
            name: name.into(),
            coefficient: 1,
            difficulty: Difficulty::Medium,
            exam_date: None,
            last_studied_at: None,
            computed_priority: 0.0,
            weekly_minutes: 120,
        }
    }

    pub fn with_coefficient(mut self, coefficient: u32) -> Self {
        self.coefficient = coefficient;
        self
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_exam(mut self, exam_date: NaiveDate) -> Self {
        self.exam_date = Some(exam_date);
        self
    }

    pub fn with_last_studied(mut self, at: DateTime<Utc>) -> Self {
        self.last_studied_at = Some(at);
        self
    }

    pub fn with_weekly_minutes(mut self, minutes: u32) -> Self {
        self.weekly_minutes = minutes;
        self
    }

    /// Planned session length for this subject, by coefficient.
    pub fn session_minutes(&self) -> u32 {
        match self.coefficient {
            0 | 1 => 30,
            2 => 40,
            3 => 50,
            4 => 60,
            5 => 75,
            6 => 80,
            _ => 90,
        }
    }
}
