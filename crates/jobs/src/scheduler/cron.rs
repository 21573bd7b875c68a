//! Recurrence rules: the recognised cron vocabulary and interval tags.
//!
//! All arithmetic is in UTC; a schedule's timezone is a stored tag only.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::SchedulerError;

/// Next-run offset for schedules with neither a recognised cron nor an interval.
pub const FALLBACK_INTERVAL: Duration = Duration::hours(4);

/// One of the recognised cron expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronPattern {
    /// `0 * * * *`
    Hourly,
    /// `0 */4 * * *`
    EveryFourHours,
    /// `0 6 * * *`, `0 7 * * *`, `0 8 * * *`
    DailyAt(u32),
    /// `0 0 * * 0`
    WeeklySunday,
}

impl CronPattern {
    /// Parse a cron string, ignoring surrounding and repeated whitespace.
    ///
    /// Returns `None` for anything outside the recognised vocabulary.
    pub fn parse(expr: &str) -> Option<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        match fields.as_slice() {
            ["0", "*", "*", "*", "*"] => Some(CronPattern::Hourly),
            ["0", "*/4", "*", "*", "*"] => Some(CronPattern::EveryFourHours),
            ["0", "6", "*", "*", "*"] => Some(CronPattern::DailyAt(6)),
            ["0", "7", "*", "*", "*"] => Some(CronPattern::DailyAt(7)),
            ["0", "8", "*", "*", "*"] => Some(CronPattern::DailyAt(8)),
            ["0", "0", "*", "*", "0"] => Some(CronPattern::WeeklySunday),
            _ => None,
        }
    }

    /// First firing instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            CronPattern::Hourly => start_of_hour(now) + Duration::hours(1),
            CronPattern::EveryFourHours => {
                let hour = start_of_hour(now);
                hour + Duration::hours(i64::from(4 - hour.hour() % 4))
            }
            CronPattern::DailyAt(h) => {
                let today = start_of_day(now) + Duration::hours(i64::from(h));
                if today > now {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
            CronPattern::WeeklySunday => {
                let day = start_of_day(now);
                let last_sunday =
                    day - Duration::days(i64::from(day.weekday().num_days_from_sunday()));
                last_sunday + Duration::weeks(1)
            }
        }
    }
}

fn start_of_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate(t, 3_600)
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate(t, 86_400)
}

fn truncate(t: DateTime<Utc>, period_secs: i64) -> DateTime<Utc> {
    let secs = t.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(period_secs), 0).unwrap_or(t)
}

/// Fixed-period recurrence tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleInterval {
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "4hourly")]
    FourHourly,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
}

impl ScheduleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleInterval::Hourly => "hourly",
            ScheduleInterval::FourHourly => "4hourly",
            ScheduleInterval::Daily => "daily",
            ScheduleInterval::Weekly => "weekly",
        }
    }

    pub fn period(&self) -> Duration {
        match self {
            ScheduleInterval::Hourly => Duration::hours(1),
            ScheduleInterval::FourHourly => Duration::hours(4),
            ScheduleInterval::Daily => Duration::days(1),
            ScheduleInterval::Weekly => Duration::weeks(1),
        }
    }
}

impl std::fmt::Display for ScheduleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleInterval {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(ScheduleInterval::Hourly),
            "4hourly" => Ok(ScheduleInterval::FourHourly),
            "daily" => Ok(ScheduleInterval::Daily),
            "weekly" => Ok(ScheduleInterval::Weekly),
            other => Err(SchedulerError::Validation(format!(
                "unknown interval '{other}' (expected hourly, 4hourly, daily or weekly)"
            ))),
        }
    }
}

/// Next run after `now`: recognised cron first, then the interval, then [`FALLBACK_INTERVAL`].
pub fn next_run(
    cron_expression: Option<&str>,
    interval: Option<ScheduleInterval>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if let Some(pattern) = cron_expression.and_then(CronPattern::parse) {
        return pattern.next_after(now);
    }
    now + interval.map_or(FALLBACK_INTERVAL, |i| i.period())
}
