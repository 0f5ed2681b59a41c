//! Core data models for the fiscal pipeline

use crate::calendar::last_day_of_month;
use crate::error::{ErrorKind, OrchestrationError};
use crate::tax::{RecordTax, SalesTaxSummary};
use chrono::{Datelike, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Sub;
use std::str::FromStr;
use uuid::Uuid;

//
// ================= Money =================
//

/// Fixed-point amount in the system's single currency (CAD).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonetaryAmount(Decimal);

impl MonetaryAmount {
    pub const ZERO: MonetaryAmount = MonetaryAmount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, 2))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Round half-up (away from zero on a tie) to cents.
    pub fn round_half_up(self) -> Self {
        Self(self.0.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }

    /// Multiply by a rate without rounding.
    pub fn checked_times(self, rate: Decimal) -> crate::Result<Self> {
        self.0.checked_mul(rate).map(Self).ok_or_else(|| {
            OrchestrationError::ValidationError(format!("amount {} times {} overflows", self, rate))
        })
    }

    pub fn checked_add(self, rhs: Self) -> crate::Result<Self> {
        self.0.checked_add(rhs.0).map(Self).ok_or_else(|| {
            OrchestrationError::ValidationError(format!("amount {} plus {} overflows", self, rhs))
        })
    }

    pub fn checked_sum<I>(amounts: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, |total, amount| total.checked_add(amount))
    }
}

impl FromStr for MonetaryAmount {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim())
            .map(Self)
            .map_err(|e| OrchestrationError::ValidationError(format!("invalid amount '{}': {}", s, e)))
    }
}

impl fmt::Display for MonetaryAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Sub for MonetaryAmount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Monthly,
    Quarterly,
    Annual,
    Strategic,
}

/// Depth at which a stage runs for a given cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StageEmphasis {
    Light,
    Standard,
    Full,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Collect,
    Analyze,
    MonitorCompliance,
    Advise,
    Document,
    Report,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Revenue,
    Expense,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    AtRisk,
    NonCompliant,
}

impl Stage {
    /// Fixed execution order.
    pub const ORDER: [Stage; 6] = [
        Stage::Collect,
        Stage::Analyze,
        Stage::MonitorCompliance,
        Stage::Advise,
        Stage::Document,
        Stage::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "COLLECT",
            Stage::Analyze => "ANALYZE",
            Stage::MonitorCompliance => "MONITOR_COMPLIANCE",
            Stage::Advise => "ADVISE",
            Stage::Document => "DOCUMENT",
            Stage::Report => "REPORT",
        }
    }
}

impl Cadence {
    pub fn emphasis(&self, stage: Stage) -> StageEmphasis {
        use StageEmphasis::*;

        match (self, stage) {
            (Cadence::Monthly, Stage::Advise | Stage::Document | Stage::Report) => Light,
            (Cadence::Quarterly, Stage::Document) => Full,
            (Cadence::Annual, _) => Full,
            (Cadence::Strategic, Stage::Advise | Stage::Report) => Full,
            (Cadence::Strategic, Stage::Document) => Light,
            _ => Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Monthly => "monthly",
            Cadence::Quarterly => "quarterly",
            Cadence::Annual => "annual",
            Cadence::Strategic => "strategic",
        }
    }
}

impl FromStr for Cadence {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "monthly" => Ok(Cadence::Monthly),
            "quarterly" => Ok(Cadence::Quarterly),
            "annual" | "yearly" => Ok(Cadence::Annual),
            "strategic" => Ok(Cadence::Strategic),
            other => Err(OrchestrationError::ValidationError(format!(
                "unknown cadence '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComplianceStatus::Compliant => "compliant",
            ComplianceStatus::AtRisk => "at_risk",
            ComplianceStatus::NonCompliant => "non_compliant",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Period =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawPeriodScope")]
pub struct PeriodScope {
    pub cadence: Cadence,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Deserialize)]
struct RawPeriodScope {
    cadence: Cadence,
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawPeriodScope> for PeriodScope {
    type Error = OrchestrationError;

    fn try_from(raw: RawPeriodScope) -> Result<Self, Self::Error> {
        Self::new(raw.cadence, raw.start, raw.end)
    }
}

impl PeriodScope {
    pub fn new(cadence: Cadence, start: NaiveDate, end: NaiveDate) -> crate::Result<Self> {
        if start > end {
            return Err(OrchestrationError::ValidationError(format!(
                "period start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { cadence, start, end })
    }

    pub fn monthly(year: i32, month: u32) -> crate::Result<Self> {
        let start = ymd(year, month, 1)?;
        let end = ymd(year, month, last_day_of_month(year, month))?;
        Self::new(Cadence::Monthly, start, end)
    }

    pub fn quarterly(year: i32, quarter: u32) -> crate::Result<Self> {
        if !(1..=4).contains(&quarter) {
            return Err(OrchestrationError::ValidationError(format!(
                "quarter must be 1-4, got {}",
                quarter
            )));
        }
        let first_month = (quarter - 1) * 3 + 1;
        let last_month = first_month + 2;
        let start = ymd(year, first_month, 1)?;
        let end = ymd(year, last_month, last_day_of_month(year, last_month))?;
        Self::new(Cadence::Quarterly, start, end)
    }

    pub fn annual(year: i32) -> crate::Result<Self> {
        Self::new(Cadence::Annual, ymd(year, 1, 1)?, ymd(year, 12, 31)?)
    }

    /// A strategic review covers a full calendar year.
    pub fn strategic(year: i32) -> crate::Result<Self> {
        Self::new(Cadence::Strategic, ymd(year, 1, 1)?, ymd(year, 12, 31)?)
    }

    /// The period of the given cadence that contains `date`.
    pub fn containing(cadence: Cadence, date: NaiveDate) -> crate::Result<Self> {
        match cadence {
            Cadence::Monthly => Self::monthly(date.year(), date.month()),
            Cadence::Quarterly => Self::quarterly(date.year(), (date.month() - 1) / 3 + 1),
            Cadence::Annual => Self::annual(date.year()),
            Cadence::Strategic => Self::strategic(date.year()),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn label(&self) -> String {
        match self.cadence {
            Cadence::Monthly => format!("{}-{:02}", self.start.year(), self.start.month()),
            Cadence::Quarterly => {
                format!("{}-Q{}", self.start.year(), (self.start.month() - 1) / 3 + 1)
            }
            Cadence::Annual | Cadence::Strategic => format!("{}", self.start.year()),
        }
    }
}

fn ymd(year: i32, month: u32, day: u32) -> crate::Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
        OrchestrationError::ValidationError(format!("invalid date {}-{}-{}", year, month, day))
    })
}

//
// ================= Financial Records =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialRecord {
    pub id: String,
    pub date: NaiveDate,
    pub kind: RecordKind,
    pub amount: MonetaryAmount,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Zero-rated supplies carry no sales tax.
    #[serde(default = "default_true")]
    pub taxable: bool,
    #[serde(default)]
    pub documented: bool,
    #[serde(default)]
    pub source: Option<String>,
}

fn default_category() -> String {
    "other".to_string()
}

fn default_true() -> bool {
    true
}

//
// ================= Compliance =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceFinding {
    pub rule_name: String,
    pub severity: Severity,
    pub description: String,
    pub action_required: String,
    #[serde(default)]
    pub record_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadlineAlert {
    pub name: String,
    pub jurisdiction: String,
    pub due_date: NaiveDate,
    /// Negative when overdue.
    pub days_remaining: i64,
    pub level: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceReport {
    pub status: ComplianceStatus,
    pub findings: Vec<ComplianceFinding>,
    pub deadline_alerts: Vec<DeadlineAlert>,
    pub rules_evaluated: usize,
}

//
// ================= Advice, Documents, Report =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub category: String,
    pub priority: Severity,
    pub description: String,
    #[serde(default)]
    pub estimated_savings: Option<MonetaryAmount>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    GstReturn,
    QstReturn,
    ComplianceSummary,
    IncomeSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentDraft {
    pub kind: DocumentKind,
    pub period_label: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiscalReport {
    pub title: String,
    pub executive_summary: String,
    pub highlights: Vec<String>,
    pub risk_factors: Vec<String>,
    pub total_revenue: MonetaryAmount,
    pub total_expenses: MonetaryAmount,
    pub net_income: MonetaryAmount,
    pub total_remittance: MonetaryAmount,
}

/// Content handed to the approval store once a run completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicationDraft {
    pub content: String,
    #[serde(default)]
    pub attachment_reference: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

//
// ================= Fiscal Context =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Working state of one pipeline run. Never shared between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiscalContext {
    pub run_id: Uuid,
    pub period: PeriodScope,
    pub reference_date: NaiveDate,
    pub status: PipelineStatus,
    pub current_stage: Option<Stage>,
    pub completed_stages: Vec<Stage>,
    pub preferences: BTreeMap<String, String>,
    pub records: Vec<FinancialRecord>,
    pub record_taxes: Vec<RecordTax>,
    pub tax_summary: Option<SalesTaxSummary>,
    pub compliance: Option<ComplianceReport>,
    pub recommendations: Vec<Recommendation>,
    pub documents: Vec<DocumentDraft>,
    pub report: Option<FiscalReport>,
    pub publication_draft: Option<PublicationDraft>,
    pub failure: Option<StageFailure>,
    pub trace: Vec<String>,
}

impl FiscalContext {
    pub fn new(
        run_id: Uuid,
        period: PeriodScope,
        reference_date: NaiveDate,
        preferences: BTreeMap<String, String>,
    ) -> Self {
        Self {
            run_id,
            period,
            reference_date,
            status: PipelineStatus::Running,
            current_stage: None,
            completed_stages: Vec::with_capacity(Stage::ORDER.len()),
            preferences,
            records: Vec::new(),
            record_taxes: Vec::new(),
            tax_summary: None,
            compliance: None,
            recommendations: Vec::new(),
            documents: Vec::new(),
            report: None,
            publication_draft: None,
            failure: None,
            trace: Vec::new(),
        }
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        self.current_stage = Some(stage);
        self.trace.push(format!("{}: started", stage));
    }

    pub fn complete_stage(&mut self, stage: Stage) {
        self.completed_stages.push(stage);
        self.trace.push(format!("{}: completed", stage));
    }

    pub fn fail(&mut self, stage: Stage, error: &OrchestrationError) {
        self.status = PipelineStatus::Failed;
        self.trace.push(format!("{}: failed - {}", stage, error));
        self.failure = Some(StageFailure {
            stage,
            kind: error.kind(),
            reason: error.to_string(),
        });
    }

    pub fn finish(&mut self) {
        self.status = PipelineStatus::Done;
        self.current_stage = None;
        self.trace.push("DONE".to_string());
    }

    pub fn is_failed(&self) -> bool {
        self.status == PipelineStatus::Failed
    }
}

//
// ================= Run I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub period: PeriodScope,
    /// Pre-collected records; the data collector is used when absent.
    #[serde(default)]
    pub records: Option<Vec<FinancialRecord>>,
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn new(period: PeriodScope) -> Self {
        Self {
            period,
            records: None,
            preferences: BTreeMap::new(),
        }
    }

    pub fn with_records(mut self, records: Vec<FinancialRecord>) -> Self {
        self.records = Some(records);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub context: FiscalContext,
    pub audit_id: Uuid,
    pub publication_id: Option<Uuid>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.context.status == PipelineStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_up() {
        let a: MonetaryAmount = "0.125".parse().unwrap();
        assert_eq!(a.round_half_up().to_string(), "0.13");
        let b: MonetaryAmount = "99.745".parse().unwrap();
        assert_eq!(b.round_half_up().to_string(), "99.75");
        let c: MonetaryAmount = "99.744".parse().unwrap();
        assert_eq!(c.round_half_up().to_string(), "99.74");
    }

    #[test]
    fn test_overflow_is_validation_error() {
        let max = MonetaryAmount::new(Decimal::MAX);
        let err = max.checked_add(max).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = MonetaryAmount::checked_sum([max, MonetaryAmount::from_cents(1)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert!(max.checked_times(Decimal::TWO).is_err());
        assert_eq!(
            MonetaryAmount::checked_sum([MonetaryAmount::from_cents(150), MonetaryAmount::from_cents(250)])
                .unwrap(),
            MonetaryAmount::from_cents(400)
        );
    }

    #[test]
    fn test_invalid_amount_is_validation_error() {
        let err = "12,5".parse::<MonetaryAmount>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_quarter_bounds() {
        let q3 = PeriodScope::quarterly(2025, 3).unwrap();
        assert_eq!(q3.start, NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());
        assert_eq!(q3.end, NaiveDate::from_ymd_opt(2025, 9, 30).unwrap());
        assert_eq!(q3.label(), "2025-Q3");
        assert!(PeriodScope::quarterly(2025, 5).is_err());
    }

    #[test]
    fn test_monthly_handles_leap_february() {
        let feb = PeriodScope::monthly(2024, 2).unwrap();
        assert_eq!(feb.end.day(), 29);
    }

    #[test]
    fn test_containing() {
        let date = NaiveDate::from_ymd_opt(2025, 11, 3).unwrap();
        let period = PeriodScope::containing(Cadence::Quarterly, date).unwrap();
        assert_eq!(period.label(), "2025-Q4");
        assert!(period.contains(date));
    }

    #[test]
    fn test_inverted_period_rejected() {
        let start = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert!(PeriodScope::new(Cadence::Monthly, start, end).is_err());
    }

    #[test]
    fn test_inverted_period_rejected_from_json() {
        let json = r#"{
            "period": {"cadence": "quarterly", "start": "2025-09-30", "end": "2025-07-01"},
            "records": [{"id":"r1","date":"2025-08-01","kind":"revenue","amount":"100.00"}]
        }"#;
        let err = serde_json::from_str::<RunRequest>(json).unwrap_err();
        assert!(err.to_string().contains("after end"));

        let ok = r#"{"period": {"cadence": "monthly", "start": "2025-07-01", "end": "2025-07-31"}}"#;
        let request: RunRequest = serde_json::from_str(ok).unwrap();
        assert_eq!(request.period.label(), "2025-07");
    }

    #[test]
    fn test_strategic_emphasizes_advice() {
        assert_eq!(Cadence::Strategic.emphasis(Stage::Advise), StageEmphasis::Full);
        assert_eq!(Cadence::Monthly.emphasis(Stage::Advise), StageEmphasis::Light);
        assert_eq!(Cadence::Quarterly.emphasis(Stage::Advise), StageEmphasis::Standard);
    }

    #[test]
    fn test_record_defaults_from_json() {
        let record: FinancialRecord = serde_json::from_str(
            r#"{"id":"r1","date":"2025-07-03","kind":"revenue","amount":"1200.50"}"#,
        )
        .unwrap();
        assert!(record.taxable);
        assert!(!record.documented);
        assert_eq!(record.category, "other");
        assert_eq!(record.amount, MonetaryAmount::from_cents(120050));
    }
}
