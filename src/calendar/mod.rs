//! Fiscal calendar
//!
//! Holds the obligation table loaded at startup and answers "what's due,
//! when". Every query is a pure function of the seed table and a reference
//! date; the plain forms read the injected clock.

pub mod recurrence;

pub use recurrence::{add_months_clamped, last_day_of_month, RecurrenceRule};

use crate::error::OrchestrationError;
use crate::Result;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Jurisdiction code for obligations shared by every jurisdiction.
pub const ALL_JURISDICTIONS: &str = "ALL";

/// Widest look-ahead window, in days (ten years).
pub const MAX_WINDOW_DAYS: u32 = 3660;

//
// ================= Clock =================
//

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant.
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    /// Midnight UTC on `date`.
    pub fn on(date: NaiveDate) -> Self {
        Self(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

//
// ================= Deadlines =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeadlinePriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObligationDeadline {
    pub name: String,
    pub due_date: NaiveDate,
    pub recurrence: RecurrenceRule,
    pub description: String,
    pub jurisdiction: String,
    pub priority: DeadlinePriority,
}

impl ObligationDeadline {
    pub fn applies_to(&self, jurisdiction: &str) -> bool {
        self.jurisdiction.eq_ignore_ascii_case(jurisdiction)
            || self.jurisdiction == ALL_JURISDICTIONS
    }

    fn with_due_date(&self, due_date: NaiveDate) -> Self {
        Self {
            due_date,
            ..self.clone()
        }
    }
}

/// One row of the calendar rule table, as supplied by configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineSeed {
    pub jurisdiction: String,
    pub name: String,
    pub recurrence: String,
    pub base_due_date: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: DeadlinePriority,
}

impl DeadlineSeed {
    fn into_deadline(self) -> Result<ObligationDeadline> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(OrchestrationError::ConfigurationError(
                "deadline name must not be empty".to_string(),
            ));
        }

        let recurrence: RecurrenceRule = self.recurrence.parse().map_err(|e| {
            OrchestrationError::ConfigurationError(format!("deadline '{}': {}", name, e))
        })?;

        let due_date = NaiveDate::parse_from_str(self.base_due_date.trim(), "%Y-%m-%d").map_err(|e| {
            OrchestrationError::ConfigurationError(format!(
                "deadline '{}' has invalid base date '{}': {}",
                name, self.base_due_date, e
            ))
        })?;

        Ok(ObligationDeadline {
            name,
            due_date,
            recurrence,
            description: self.description,
            jurisdiction: self.jurisdiction.trim().to_uppercase(),
            priority: self.priority,
        })
    }
}

//
// ================= Calendar =================
//

pub struct FiscalCalendar {
    deadlines: Vec<ObligationDeadline>,
    clock: Arc<dyn Clock>,
}

impl FiscalCalendar {
    /// Validate the whole table up front; nothing is rejected at query time.
    pub fn from_seeds(seeds: Vec<DeadlineSeed>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut names = HashSet::with_capacity(seeds.len());
        let mut deadlines = Vec::with_capacity(seeds.len());

        for seed in seeds {
            let deadline = seed.into_deadline()?;
            if !names.insert(deadline.name.to_lowercase()) {
                return Err(OrchestrationError::ConfigurationError(format!(
                    "duplicate deadline name '{}'",
                    deadline.name
                )));
            }
            deadlines.push(deadline);
        }

        info!(deadline_count = deadlines.len(), "Fiscal calendar loaded");

        Ok(Self { deadlines, clock })
    }

    pub fn from_json_str(json: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let seeds: Vec<DeadlineSeed> = serde_json::from_str(json).map_err(|e| {
            OrchestrationError::ConfigurationError(format!("invalid calendar seed table: {}", e))
        })?;
        Self::from_seeds(seeds, clock)
    }

    pub fn from_path(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            OrchestrationError::ConfigurationError(format!(
                "cannot read calendar seed table {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json, clock)
    }

    /// Quebec and federal obligations of a small business.
    pub fn with_default_seeds(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_json_str(DEFAULT_SEED_TABLE, clock)
    }

    /// The seed table as loaded.
    pub fn deadlines(&self) -> &[ObligationDeadline] {
        &self.deadlines
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn deadline_by_name(&self, name: &str) -> Option<&ObligationDeadline> {
        self.deadlines
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn for_jurisdiction(&self, jurisdiction: &str) -> Vec<&ObligationDeadline> {
        self.deadlines
            .iter()
            .filter(|d| d.applies_to(jurisdiction))
            .collect()
    }

    /// Every occurrence due in `[from, to]`, by date then name.
    pub fn occurrences_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<ObligationDeadline> {
        let mut due: Vec<ObligationDeadline> = self
            .deadlines
            .iter()
            .flat_map(|d| {
                recurrence::occurrences_between(d.due_date, d.recurrence, from, to)
                    .into_iter()
                    .map(move |date| d.with_due_date(date))
            })
            .collect();

        sort_deadlines(&mut due);
        due
    }

    /// Occurrences due in `[reference, reference + within_days]`.
    pub fn upcoming_at(&self, reference: NaiveDate, within_days: u32) -> Result<Vec<ObligationDeadline>> {
        if within_days > MAX_WINDOW_DAYS {
            return Err(OrchestrationError::ValidationError(format!(
                "window of {} days exceeds the {} day maximum",
                within_days, MAX_WINDOW_DAYS
            )));
        }

        let until = reference
            .checked_add_days(Days::new(within_days.into()))
            .ok_or_else(|| {
                OrchestrationError::ValidationError(format!(
                    "window of {} days from {} is past the last representable date",
                    within_days, reference
                ))
            })?;

        Ok(self.occurrences_between(reference, until))
    }

    pub fn upcoming(&self, within_days: u32) -> Result<Vec<ObligationDeadline>> {
        self.upcoming_at(self.today(), within_days)
    }

    pub fn next_deadline_at(&self, reference: NaiveDate) -> Option<ObligationDeadline> {
        let mut next: Vec<ObligationDeadline> = self
            .deadlines
            .iter()
            .filter_map(|d| {
                recurrence::next_on_or_after(d.due_date, d.recurrence, reference)
                    .map(|date| d.with_due_date(date))
            })
            .collect();

        sort_deadlines(&mut next);
        next.into_iter().next()
    }

    pub fn next_deadline(&self) -> Option<ObligationDeadline> {
        self.next_deadline_at(self.today())
    }

    pub fn is_approaching_at(&self, name: &str, within_days: u32, reference: NaiveDate) -> bool {
        let Some(deadline) = self.deadline_by_name(name) else {
            return false;
        };

        recurrence::next_on_or_after(deadline.due_date, deadline.recurrence, reference)
            .map(|date| days_between(reference, date) <= within_days as i64)
            .unwrap_or(false)
    }

    pub fn is_approaching(&self, name: &str, within_days: u32) -> bool {
        self.is_approaching_at(name, within_days, self.today())
    }

    /// One-off deadlines already past. A recurring deadline never goes
    /// overdue here: its next occurrence takes its place.
    pub fn overdue_at(&self, reference: NaiveDate) -> Vec<ObligationDeadline> {
        let mut overdue: Vec<ObligationDeadline> = self
            .deadlines
            .iter()
            .filter(|d| !d.recurrence.is_recurring() && d.due_date < reference)
            .cloned()
            .collect();

        sort_deadlines(&mut overdue);
        overdue
    }

    pub fn overdue(&self) -> Vec<ObligationDeadline> {
        self.overdue_at(self.today())
    }

    /// Negative once the deadline has passed.
    pub fn days_until(&self, deadline: &ObligationDeadline, reference: NaiveDate) -> i64 {
        days_between(reference, deadline.due_date)
    }
}

pub fn days_between(reference: NaiveDate, due_date: NaiveDate) -> i64 {
    (due_date - reference).num_days()
}

fn sort_deadlines(deadlines: &mut [ObligationDeadline]) {
    deadlines.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.name.cmp(&b.name)));
}

const DEFAULT_SEED_TABLE: &str = r#"[
  {"jurisdiction": "ALL", "name": "GST/QST quarterly return", "recurrence": "quarterly",
   "base_due_date": "2025-01-31", "description": "Quarterly GST/HST and QST return and payment", "priority": "high"},
  {"jurisdiction": "ALL", "name": "GST/QST monthly return", "recurrence": "monthly",
   "base_due_date": "2025-01-31", "description": "Monthly GST/HST and QST return for monthly filers"},
  {"jurisdiction": "ALL", "name": "Source deductions remittance", "recurrence": "monthly",
   "base_due_date": "2025-01-15", "description": "Payroll source deductions remittance"},
  {"jurisdiction": "ALL", "name": "Tax instalments", "recurrence": "annual",
   "base_due_date": "2025-03-31", "description": "GST/QST and income tax instalment payment", "priority": "high"},
  {"jurisdiction": "CA", "name": "T1 income tax return", "recurrence": "annual",
   "base_due_date": "2025-04-30", "description": "Federal income tax return for the calendar year", "priority": "high"},
  {"jurisdiction": "QC", "name": "TP-1 income tax return", "recurrence": "annual",
   "base_due_date": "2025-04-30", "description": "Quebec income tax return for the calendar year", "priority": "high"},
  {"jurisdiction": "ALL", "name": "GST/QST annual return", "recurrence": "annual",
   "base_due_date": "2025-06-15", "description": "Annual GST/HST and QST return for annual filers"},
  {"jurisdiction": "CA", "name": "T2 corporate return", "recurrence": "annual",
   "base_due_date": "2025-06-15", "description": "Federal corporate income tax return"}
]"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn clock(y: i32, m: u32, d: u32) -> Arc<dyn Clock> {
        Arc::new(FixedClock::on(date(y, m, d)))
    }

    fn quarterly_table() -> &'static str {
        r#"[{"jurisdiction": "QC", "name": "QST quarterly return", "recurrence": "quarterly",
             "base_due_date": "2025-08-15", "description": "Quarterly QST return"}]"#
    }

    #[test]
    fn test_quarterly_deadline_nine_days_out() {
        let calendar = FiscalCalendar::from_json_str(quarterly_table(), clock(2025, 8, 6)).unwrap();

        let upcoming = calendar.upcoming(9).unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].due_date, date(2025, 8, 15));
        assert_eq!(days_between(calendar.today(), upcoming[0].due_date), 9);
        assert!(calendar.is_approaching("qst QUARTERLY return", 9));
        assert!(!calendar.is_approaching("QST quarterly return", 8));
    }

    #[test]
    fn test_elapsed_quarterly_deadline_rolls_forward() {
        let calendar = FiscalCalendar::from_json_str(quarterly_table(), clock(2025, 8, 16)).unwrap();

        assert!(calendar.upcoming(9).unwrap().is_empty());

        let next = calendar.next_deadline().unwrap();
        assert_eq!(next.due_date, date(2025, 11, 15));
        assert!(next.due_date > date(2025, 8, 15));
        assert!(next.due_date >= calendar.today());
        assert_eq!(calendar.upcoming(91).unwrap()[0].due_date, date(2025, 11, 15));
    }

    #[test]
    fn test_upcoming_sorted_and_idempotent() {
        let calendar = FiscalCalendar::with_default_seeds(clock(2025, 3, 20)).unwrap();

        let first = calendar.upcoming(90).unwrap();
        let second = calendar.upcoming(90).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());

        for pair in first.windows(2) {
            assert!(
                (pair[0].due_date, &pair[0].name) <= (pair[1].due_date, &pair[1].name),
                "out of order: {} then {}",
                pair[0].name,
                pair[1].name
            );
        }

        // Seed table is untouched by queries.
        assert_eq!(calendar.deadlines()[0].due_date, date(2025, 1, 31));
    }

    #[test]
    fn test_ties_broken_by_name() {
        let calendar = FiscalCalendar::with_default_seeds(clock(2025, 4, 1)).unwrap();
        let april_30: Vec<String> = calendar
            .upcoming_at(date(2025, 4, 30), 0)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();

        assert_eq!(
            april_30,
            vec![
                "GST/QST monthly return".to_string(),
                "GST/QST quarterly return".to_string(),
                "T1 income tax return".to_string(),
                "TP-1 income tax return".to_string(),
            ]
        );
    }

    #[test]
    fn test_monthly_occurrences_within_window() {
        let calendar = FiscalCalendar::with_default_seeds(clock(2025, 3, 1)).unwrap();
        let source: Vec<NaiveDate> = calendar
            .upcoming(90)
            .unwrap()
            .into_iter()
            .filter(|d| d.name == "Source deductions remittance")
            .map(|d| d.due_date)
            .collect();

        assert_eq!(source, vec![date(2025, 3, 15), date(2025, 4, 15), date(2025, 5, 15)]);
    }

    #[test]
    fn test_malformed_recurrence_fails_at_load() {
        let json = r#"[{"jurisdiction": "QC", "name": "Bad", "recurrence": "biweekly",
                        "base_due_date": "2025-01-01"}]"#;
        let err = FiscalCalendar::from_json_str(json, clock(2025, 1, 1)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_bad_date_and_duplicates_fail_at_load() {
        let bad_date = r#"[{"jurisdiction": "QC", "name": "A", "recurrence": "none",
                            "base_due_date": "2025-02-30"}]"#;
        assert!(FiscalCalendar::from_json_str(bad_date, clock(2025, 1, 1)).is_err());

        let duplicate = r#"[
            {"jurisdiction": "QC", "name": "A", "recurrence": "none", "base_due_date": "2025-02-01"},
            {"jurisdiction": "CA", "name": "a", "recurrence": "none", "base_due_date": "2025-03-01"}
        ]"#;
        assert!(FiscalCalendar::from_json_str(duplicate, clock(2025, 1, 1)).is_err());

        assert!(FiscalCalendar::from_json_str("{not json", clock(2025, 1, 1)).is_err());
    }

    #[test]
    fn test_overdue_only_reports_one_off_deadlines() {
        let json = r#"[
            {"jurisdiction": "QC", "name": "Audit response", "recurrence": "none", "base_due_date": "2025-05-01"},
            {"jurisdiction": "QC", "name": "Monthly QST", "recurrence": "monthly", "base_due_date": "2025-01-31"}
        ]"#;
        let calendar = FiscalCalendar::from_json_str(json, clock(2025, 6, 1)).unwrap();

        let overdue = calendar.overdue();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].name, "Audit response");
        assert!(calendar.next_deadline().is_some());
    }

    #[test]
    fn test_unknown_name_is_not_approaching() {
        let calendar = FiscalCalendar::with_default_seeds(clock(2025, 4, 20)).unwrap();
        assert!(!calendar.is_approaching("Nonexistent", 365));
        assert!(calendar.is_approaching("T1 income tax return", 10));
    }

    #[test]
    fn test_jurisdiction_filter_includes_shared_obligations() {
        let calendar = FiscalCalendar::with_default_seeds(clock(2025, 1, 1)).unwrap();
        let qc = calendar.for_jurisdiction("qc");
        assert!(qc.iter().any(|d| d.name == "TP-1 income tax return"));
        assert!(qc.iter().any(|d| d.jurisdiction == ALL_JURISDICTIONS));
        assert!(!qc.iter().any(|d| d.name == "T1 income tax return"));
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        let calendar = FiscalCalendar::with_default_seeds(clock(2025, 8, 6)).unwrap();

        let err = calendar.upcoming(u32::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(calendar.upcoming(MAX_WINDOW_DAYS).is_ok());
        assert!(calendar.is_approaching("T1 income tax return", u32::MAX));

        let err = calendar.upcoming_at(NaiveDate::MAX, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calendar.json");
        std::fs::write(&path, quarterly_table()).unwrap();

        let calendar = FiscalCalendar::from_path(&path, clock(2025, 8, 1)).unwrap();
        assert_eq!(calendar.deadlines().len(), 1);
        assert!(FiscalCalendar::from_path(dir.path().join("missing.json"), clock(2025, 8, 1)).is_err());
    }
}
