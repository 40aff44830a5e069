use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    #[default]
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Schedule::Once => "once",
            Schedule::Daily => "daily",
            Schedule::Weekly => "weekly",
            Schedule::Monthly => "monthly",
        };
        f.pad(s)
    }
}

/// Days on which recurring weekly/monthly paths may run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedDays {
    pub weekly: Vec<Weekday>,
    pub monthly: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Due(&'static str),
    NotDue(&'static str),
}

impl Decision {
    pub fn is_due(self) -> bool {
        matches!(self, Decision::Due(_))
    }

    pub fn reason(self) -> &'static str {
        match self {
            Decision::Due(r) | Decision::NotDue(r) => r,
        }
    }
}

/// Decides whether a path is due, given the local date of its last
/// successful backup (`None` if it never ran) and today's local date.
///
/// Weekly/monthly paths never become due again after the first run when
/// their allowed-day list is empty.
pub fn decide(
    schedule: Schedule,
    last: Option<NaiveDate>,
    today: NaiveDate,
    days: &AllowedDays,
) -> Decision {
    let Some(last) = last else {
        return Decision::Due("never_backed_up");
    };
    match schedule {
        Schedule::Once => Decision::NotDue("already_backed_up_once"),
        Schedule::Daily => {
            if today.ordinal() != last.ordinal() {
                Decision::Due("new_day")
            } else {
                Decision::NotDue("backed_up_today")
            }
        }
        Schedule::Weekly => {
            if today == last {
                Decision::NotDue("backed_up_today")
            } else if days.weekly.contains(&today.weekday()) {
                Decision::Due("allowed_weekday")
            } else {
                Decision::NotDue("weekday_not_allowed")
            }
        }
        Schedule::Monthly => {
            if today == last {
                Decision::NotDue("backed_up_today")
            } else if days.monthly.contains(&today.day()) {
                Decision::Due("allowed_day_of_month")
            } else {
                Decision::NotDue("day_of_month_not_allowed")
            }
        }
    }
}

pub fn is_due(
    schedule: Schedule,
    last: Option<NaiveDate>,
    today: NaiveDate,
    days: &AllowedDays,
) -> bool {
    decide(schedule, last, today, days).is_due()
}

const WEEKDAYS: [(Weekday, &str); 7] = [
    (Weekday::Sun, "sunday"),
    (Weekday::Mon, "monday"),
    (Weekday::Tue, "tuesday"),
    (Weekday::Wed, "wednesday"),
    (Weekday::Thu, "thursday"),
    (Weekday::Fri, "friday"),
    (Weekday::Sat, "saturday"),
];

/// Parses a day name; any unambiguous prefix ("mon", "th", "sat") is accepted.
pub fn parse_weekday(raw: &str) -> Result<Weekday> {
    let needle = raw.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return Err(Error::config("empty weekday name"));
    }
    let hits = WEEKDAYS
        .iter()
        .filter(|(_, name)| name.starts_with(&needle))
        .collect::<Vec<_>>();
    match hits.as_slice() {
        [(day, _)] => Ok(*day),
        [] => Err(Error::config(format!("unknown weekday '{}'", raw.trim()))),
        _ => Err(Error::config(format!(
            "ambiguous weekday '{}' (matches {})",
            raw.trim(),
            hits.iter().map(|(_, n)| *n).collect::<Vec<_>>().join(", ")
        ))),
    }
}

pub fn validate_month_day(day: u32) -> Result<u32> {
    if (1..=31).contains(&day) {
        Ok(day)
    } else {
        Err(Error::config(format!(
            "monthly day {day} is out of range (1-31)"
        )))
    }
}
