//! Recurrence rules and month arithmetic
//!
//! Occurrence `k` of a recurring deadline is always computed from its seed
//! date, so a day-of-month clamped in a short month is restored afterwards
//! (Jan 31 -> Feb 28 -> Mar 31).

use crate::error::OrchestrationError;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceRule {
    None,
    Monthly,
    Quarterly,
    Annual,
}

impl RecurrenceRule {
    /// Months between occurrences; `None` for one-off deadlines.
    pub fn step_months(&self) -> Option<u32> {
        match self {
            RecurrenceRule::None => None,
            RecurrenceRule::Monthly => Some(1),
            RecurrenceRule::Quarterly => Some(3),
            RecurrenceRule::Annual => Some(12),
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.step_months().is_some()
    }
}

impl FromStr for RecurrenceRule {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "once" | "one_off" => Ok(RecurrenceRule::None),
            "monthly" => Ok(RecurrenceRule::Monthly),
            "quarterly" => Ok(RecurrenceRule::Quarterly),
            "annual" | "yearly" => Ok(RecurrenceRule::Annual),
            other => Err(OrchestrationError::ConfigurationError(format!(
                "unknown recurrence rule '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecurrenceRule::None => "none",
            RecurrenceRule::Monthly => "monthly",
            RecurrenceRule::Quarterly => "quarterly",
            RecurrenceRule::Annual => "annual",
        };
        write!(f, "{}", s)
    }
}

pub fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Add calendar months, clamping the day to the end of the target month.
pub fn add_months_clamped(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    let zero_based = date.month0() as i64 + months as i64;
    let year = date.year() as i64 + zero_based.div_euclid(12);
    let month = zero_based.rem_euclid(12) as u32 + 1;
    let year = i32::try_from(year).ok()?;
    let day = date.day().min(last_day_of_month(year, month));

    NaiveDate::from_ymd_opt(year, month, day)
}

/// The `k`-th occurrence after `seed` (occurrence 0 is the seed itself).
pub fn occurrence(seed: NaiveDate, rule: RecurrenceRule, k: u32) -> Option<NaiveDate> {
    match rule.step_months() {
        None if k == 0 => Some(seed),
        None => None,
        Some(step) => add_months_clamped(seed, step.checked_mul(k)?),
    }
}

/// Every occurrence in `[from, to]`, ascending.
pub fn occurrences_between(
    seed: NaiveDate,
    rule: RecurrenceRule,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    if from > to {
        return dates;
    }

    let Some(step) = rule.step_months() else {
        if from <= seed && seed <= to {
            dates.push(seed);
        }
        return dates;
    };

    let mut k = first_index_on_or_after(seed, step, from);
    while let Some(date) = occurrence(seed, rule, k) {
        if date > to {
            break;
        }
        if date >= from {
            dates.push(date);
        }
        k += 1;
    }

    dates
}

/// First occurrence on or after `reference`, if any.
pub fn next_on_or_after(seed: NaiveDate, rule: RecurrenceRule, reference: NaiveDate) -> Option<NaiveDate> {
    let Some(step) = rule.step_months() else {
        return (seed >= reference).then_some(seed);
    };

    let mut k = first_index_on_or_after(seed, step, reference);
    loop {
        let date = occurrence(seed, rule, k)?;
        if date >= reference {
            return Some(date);
        }
        k += 1;
    }
}

// Lower bound on the occurrence index; never skips past the answer.
fn first_index_on_or_after(seed: NaiveDate, step: u32, reference: NaiveDate) -> u32 {
    if reference <= seed {
        return 0;
    }
    let months = (reference.year() - seed.year()) as i64 * 12
        + reference.month() as i64
        - seed.month() as i64;
    let k = months / step as i64;
    u32::try_from(k.saturating_sub(1).max(0)).unwrap_or(0)
}
