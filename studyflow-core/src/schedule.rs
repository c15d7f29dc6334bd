//! Study schedules and the one-active-schedule-per-user invariant.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::subject::UserId;

pub type ScheduleId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub user_id: UserId,
    pub is_active: bool,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        id: ScheduleId,
        user_id: UserId,
        start_date: NaiveDate,
        end_date: NaiveDate,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            is_active: false,
            start_date,
            end_date,
            created_at,
        }
    }
}

/// Activate `id` and deactivate every other schedule of the same user.
///
/// Operates on the full schedule table so the caller can apply it under a
/// single write lock. Returns the ids that were switched off.
pub fn activate_exclusive(
    schedules: &mut [Schedule],
    id: ScheduleId,
) -> Result<Vec<ScheduleId>, StoreError> {
    let user_id = schedules
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.user_id)
        .ok_or(StoreError::NotFound {
            entity: "schedule",
            id,
        })?;

    let mut deactivated = Vec::new();
    for schedule in schedules.iter_mut().filter(|s| s.user_id == user_id) {
        if schedule.id == id {
            schedule.is_active = true;
        } else if schedule.is_active {
            schedule.is_active = false;
            deactivated.push(schedule.id);
        }
    }
    Ok(deactivated)
}

/// The user's active schedule, if any.
pub fn active_schedule(schedules: &[Schedule], user_id: UserId) -> Option<&Schedule> {
    schedules
        .iter()
        .find(|s| s.user_id == user_id && s.is_active)
}
