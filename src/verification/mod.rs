//! Compliance monitoring
//!
//! Rules-based checks over a period's records, tax summary and the fiscal
//! calendar. Deterministic: same inputs, same report.

use crate::calendar::FiscalCalendar;
use crate::error::OrchestrationError;
use crate::models::{
    ComplianceFinding, ComplianceReport, ComplianceStatus, DeadlineAlert, FinancialRecord,
    MonetaryAmount, RecordKind, Severity,
};
use crate::tax::SalesTaxSummary;
use crate::Result;
use chrono::NaiveDate;
use std::cmp::Ordering;
use tracing::{debug, info};

pub const DEFAULT_ALERT_WINDOW_DAYS: u32 = 30;

/// Small supplier threshold for GST/QST registration.
pub const REGISTRATION_THRESHOLD_CENTS: i64 = 3_000_000;

/// Single amounts above this need supporting documentation.
pub const LARGE_AMOUNT_CENTS: i64 = 1_000_000;

/// Everything a rule may look at. All borrowed, nothing mutable.
pub struct ComplianceInput<'a> {
    pub records: &'a [FinancialRecord],
    pub summary: &'a SalesTaxSummary,
    pub calendar: &'a FiscalCalendar,
    pub jurisdiction: &'a str,
    pub reference_date: NaiveDate,
    pub window_days: u32,
}

#[derive(Debug, Default)]
pub struct RuleOutcome {
    pub findings: Vec<ComplianceFinding>,
    pub deadline_alerts: Vec<DeadlineAlert>,
}

impl RuleOutcome {
    fn findings(findings: Vec<ComplianceFinding>) -> Self {
        Self {
            findings,
            deadline_alerts: Vec::new(),
        }
    }
}

/// A pluggable compliance check. An `Err` fails the whole monitoring stage.
pub trait ComplianceRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, input: &ComplianceInput<'_>) -> Result<RuleOutcome>;
}

pub struct ComplianceMonitor {
    rules: Vec<Box<dyn ComplianceRule>>,
}

impl ComplianceMonitor {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn ComplianceRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn evaluate(&self, input: &ComplianceInput<'_>) -> Result<ComplianceReport> {
        let mut findings = Vec::new();
        let mut deadline_alerts = Vec::new();

        for rule in &self.rules {
            let outcome = rule.evaluate(input)?;
            debug!(
                rule = rule.name(),
                findings = outcome.findings.len(),
                alerts = outcome.deadline_alerts.len(),
                "Compliance rule evaluated"
            );
            findings.extend(outcome.findings);
            deadline_alerts.extend(outcome.deadline_alerts);
        }

        deadline_alerts.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then_with(|| a.name.cmp(&b.name))
        });

        let status = overall_status(&findings);

        info!(
            rule_count = self.rules.len(),
            findings = findings.len(),
            deadline_alerts = deadline_alerts.len(),
            status = %status,
            "Compliance check completed"
        );

        Ok(ComplianceReport {
            status,
            findings,
            deadline_alerts,
            rules_evaluated: self.rules.len(),
        })
    }
}

impl Default for ComplianceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline alerts inform but never change the status.
pub fn overall_status(findings: &[ComplianceFinding]) -> ComplianceStatus {
    match findings.iter().map(|f| f.severity).max() {
        Some(Severity::High | Severity::Critical) => ComplianceStatus::NonCompliant,
        Some(Severity::Medium) => ComplianceStatus::AtRisk,
        _ => ComplianceStatus::Compliant,
    }
}

/// Alert level for a deadline `days_remaining` away.
pub fn alert_level(days_remaining: i64) -> Severity {
    match days_remaining {
        d if d <= 7 => Severity::Critical,
        d if d <= 14 => Severity::High,
        d if d <= 21 => Severity::Medium,
        _ => Severity::Low,
    }
}

//
// ================= Severity Ordering =================
//

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl Severity {
    fn rank(&self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }
}

//
// ================= Rules =================
//

/// Revenue above the small supplier threshold requires registration.
pub struct RegistrationThresholdRule;

impl ComplianceRule for RegistrationThresholdRule {
    fn name(&self) -> &'static str {
        "registration_threshold"
    }

    fn evaluate(&self, input: &ComplianceInput<'_>) -> Result<RuleOutcome> {
        let threshold = MonetaryAmount::from_cents(REGISTRATION_THRESHOLD_CENTS);
        if input.summary.total_revenue <= threshold {
            return Ok(RuleOutcome::default());
        }

        Ok(RuleOutcome::findings(vec![ComplianceFinding {
            rule_name: self.name().to_string(),
            severity: Severity::High,
            description: format!(
                "Revenue {} exceeds the GST/QST registration threshold {}",
                input.summary.total_revenue, threshold
            ),
            action_required: "Confirm GST and QST registration".to_string(),
            record_id: None,
        }]))
    }
}

pub struct DocumentationRule;

impl ComplianceRule for DocumentationRule {
    fn name(&self) -> &'static str {
        "documentation"
    }

    fn evaluate(&self, input: &ComplianceInput<'_>) -> Result<RuleOutcome> {
        let undocumented = input.records.iter().filter(|r| !r.documented).count();
        if undocumented == 0 {
            return Ok(RuleOutcome::default());
        }

        Ok(RuleOutcome::findings(vec![ComplianceFinding {
            rule_name: self.name().to_string(),
            severity: Severity::Medium,
            description: format!("{} records without supporting documentation", undocumented),
            action_required: "Attach receipts or invoices before filing".to_string(),
            record_id: None,
        }]))
    }
}

/// One finding per record above the large-amount threshold.
pub struct LargeAmountRule;

impl ComplianceRule for LargeAmountRule {
    fn name(&self) -> &'static str {
        "large_amount"
    }

    fn evaluate(&self, input: &ComplianceInput<'_>) -> Result<RuleOutcome> {
        let limit = MonetaryAmount::from_cents(LARGE_AMOUNT_CENTS);

        let findings = input
            .records
            .iter()
            .filter(|r| r.amount > limit)
            .map(|r| ComplianceFinding {
                rule_name: self.name().to_string(),
                severity: Severity::Medium,
                description: format!(
                    "{} {} of {} exceeds {}",
                    match r.kind {
                        RecordKind::Revenue => "Revenue",
                        RecordKind::Expense => "Expense",
                    },
                    r.id,
                    r.amount,
                    limit
                ),
                action_required: "Keep additional documentation for this transaction".to_string(),
                record_id: Some(r.id.clone()),
            })
            .collect();

        Ok(RuleOutcome::findings(findings))
    }
}

/// Upcoming deadlines in the alert window and overdue one-off deadlines.
pub struct DeadlineRule;

impl ComplianceRule for DeadlineRule {
    fn name(&self) -> &'static str {
        "deadlines"
    }

    fn evaluate(&self, input: &ComplianceInput<'_>) -> Result<RuleOutcome> {
        let reference = input.reference_date;

        let upcoming = input
            .calendar
            .upcoming_at(reference, input.window_days)?
            .into_iter()
            .filter(|d| d.applies_to(input.jurisdiction))
            .map(|d| {
                let days_remaining = input.calendar.days_until(&d, reference);
                DeadlineAlert {
                    level: alert_level(days_remaining),
                    name: d.name,
                    jurisdiction: d.jurisdiction,
                    due_date: d.due_date,
                    days_remaining,
                }
            });

        let overdue = input
            .calendar
            .overdue_at(reference)
            .into_iter()
            .filter(|d| d.applies_to(input.jurisdiction))
            .map(|d| DeadlineAlert {
                days_remaining: input.calendar.days_until(&d, reference),
                level: Severity::Critical,
                name: d.name,
                jurisdiction: d.jurisdiction,
                due_date: d.due_date,
            });

        Ok(RuleOutcome {
            findings: Vec::new(),
            deadline_alerts: overdue.chain(upcoming).collect(),
        })
    }
}

/// Every jurisdiction that produced tax needs a filing obligation on the
/// calendar.
pub struct FilingCoverageRule;

impl ComplianceRule for FilingCoverageRule {
    fn name(&self) -> &'static str {
        "filing_coverage"
    }

    fn evaluate(&self, input: &ComplianceInput<'_>) -> Result<RuleOutcome> {
        for code in input.summary.taxed_jurisdictions() {
            if input.calendar.for_jurisdiction(code).is_empty() {
                return Err(OrchestrationError::ConfigurationError(format!(
                    "no filing obligation on the calendar for taxed jurisdiction {}",
                    code
                )));
            }
        }
        Ok(RuleOutcome::default())
    }
}

/// Monitor with the standard rule set.
pub fn create_default_compliance_monitor() -> ComplianceMonitor {
    let mut monitor = ComplianceMonitor::new();
    monitor.add_rule(Box::new(RegistrationThresholdRule));
    monitor.add_rule(Box::new(DocumentationRule));
    monitor.add_rule(Box::new(LargeAmountRule));
    monitor.add_rule(Box::new(DeadlineRule));
    monitor.add_rule(Box::new(FilingCoverageRule));
    monitor
}

//
// ================= Tests =================
//
