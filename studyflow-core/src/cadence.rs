//! Wall-clock cadences for the periodic jobs, evaluated in the planner timezone.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Every day at `hour:minute`.
    Daily { hour: u32, minute: u32 },
    /// Every hour at `minute`.
    Hourly { minute: u32 },
    /// Once a week on `weekday` at `hour:minute`.
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// Every `n` minutes, aligned to midnight.
    EveryMinutes(u32),
}

impl Cadence {
    /// Local fire times on a day with weekday `weekday`, in order.
    fn times_on(&self, weekday: Weekday) -> Vec<NaiveTime> {
        let at = |h: u32, m: u32| NaiveTime::from_hms_opt(h, m, 0);
        match *self {
            Cadence::Daily { hour, minute } => at(hour, minute).into_iter().collect(),
            Cadence::Hourly { minute } => (0..24).filter_map(|h| at(h, minute)).collect(),
            Cadence::Weekly {
                weekday: wd,
                hour,
                minute,
            } if wd == weekday => at(hour, minute).into_iter().collect(),
            Cadence::Weekly { .. } => Vec::new(),
            Cadence::EveryMinutes(n) => (0..24 * 60)
                .step_by(n.max(1) as usize)
                .filter_map(|m| at(m / 60, m % 60))
                .collect(),
        }
    }

    /// First fire instant strictly after `after`.
    ///
    /// Local times skipped by a DST jump are skipped; repeated ones fire once,
    /// at the earlier instant.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let first_day = local.date();
        for offset in 0..=8 {
            let day = first_day + Duration::days(offset);
            for time in self.times_on(day.weekday()) {
                let candidate = day.and_time(time);
                let Some(at) = tz.from_local_datetime(&candidate).earliest() else {
                    continue;
                };
                let at = at.with_timezone(&Utc);
                if at > after {
                    return Some(at);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn algiers() -> Tz {
        "Africa/Algiers".parse().unwrap()
    }

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn weekly_fires_sunday_two_am_local() {
        let c = Cadence::Weekly {
            weekday: Weekday::Sun,
            hour: 2,
            minute: 0,
        };
        // 2026-03-04 is a Wednesday; Algiers is UTC+1.
        let next = c.next_after(utc(4, 12, 0), algiers()).unwrap();
        assert_eq!(next, utc(8, 1, 0));
        assert_eq!(c.next_after(utc(8, 1, 0), algiers()), Some(utc(15, 1, 0)));
    }

    #[test]
    fn every_fifteen_minutes() {
        let c = Cadence::EveryMinutes(15);
        assert_eq!(c.next_after(utc(4, 10, 0), algiers()), Some(utc(4, 10, 15)));
        assert_eq!(c.next_after(utc(4, 10, 7), algiers()), Some(utc(4, 10, 15)));
        assert_eq!(c.next_after(utc(4, 10, 45), algiers()), Some(utc(4, 11, 0)));
    }

    #[test]
    fn hourly_and_daily() {
        let hourly = Cadence::Hourly { minute: 0 };
        assert_eq!(hourly.next_after(utc(4, 10, 30), algiers()), Some(utc(4, 11, 0)));

        let daily = Cadence::Daily { hour: 0, minute: 0 };
        // Local midnight is 23:00 UTC the day before.
        assert_eq!(daily.next_after(utc(4, 10, 30), algiers()), Some(utc(4, 23, 0)));
    }

    #[test]
    fn dst_gap_is_skipped() {
        let paris: Tz = "Europe/Paris".parse().unwrap();
        // 2026-03-29 02:30 does not exist in Paris.
        let c = Cadence::Daily { hour: 2, minute: 30 };
        let next = c.next_after(utc(28, 12, 0), paris).unwrap();
        assert_eq!(next, utc(30, 0, 30));
    }
}
