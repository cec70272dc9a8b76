//! Which week attendance has to be confirmed for.
//!
//! Until the cutover (default Thursday 12:00 London time) it is the current
//! week; from the cutover onwards it is next week.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::CutoverConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekCutover {
    pub weekday: Weekday,
    pub time: NaiveTime,
    pub timezone: Tz,
}

impl WeekCutover {
    pub fn from_config(config: &CutoverConfig) -> Self {
        let time = NaiveTime::from_hms_opt(config.hour, config.minute, 0).unwrap_or_else(|| {
            log::warn!(
                "Config: invalid cutover time {:02}:{:02}, using 12:00",
                config.hour,
                config.minute
            );
            NaiveTime::MIN + Duration::hours(12)
        });
        Self {
            weekday: config.weekday(),
            time,
            timezone: config.timezone(),
        }
    }

    /// Monday of the week that needs confirming at `now`.
    pub fn relevant_week_start(&self, now: DateTime<Utc>) -> NaiveDate {
        let local = now.with_timezone(&self.timezone).naive_local();
        let monday = monday_of(local.date());
        let cutover = NaiveDateTime::new(
            monday + Duration::days(i64::from(self.weekday.num_days_from_monday())),
            self.time,
        );
        if local >= cutover {
            monday + Duration::days(7)
        } else {
            monday
        }
    }
}

impl Default for WeekCutover {
    fn default() -> Self {
        Self::from_config(&CutoverConfig::default())
    }
}

pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}
