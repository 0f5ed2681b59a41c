//! Stage execution
//!
//! One handler per pipeline stage. Each handler reads the context, computes
//! its output into locals and writes it back only on success, so a failed
//! stage leaves no partial output behind.

use crate::calendar::FiscalCalendar;
use crate::error::OrchestrationError;
use crate::memory::MemoryStore;
use crate::models::{
    Cadence, ComplianceStatus, DocumentDraft, DocumentKind, FinancialRecord, FiscalContext,
    FiscalReport, MonetaryAmount, PublicationDraft, Recommendation, RunRequest, Severity, Stage,
    StageEmphasis,
};
use crate::tax::{SalesTaxSummary, TaxLineSummary, TaxRulesEngine, GST, QST};
use crate::tools::DataCollector;
use crate::verification::{ComplianceInput, ComplianceMonitor};
use crate::Result;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pattern keys written to memory at the end of a run.
pub const PATTERN_PERIOD: &str = "period";
pub const PATTERN_CADENCE: &str = "cadence";
pub const PATTERN_COMPLIANCE_STATUS: &str = "compliance_status";

/// Preference key holding comma-separated publication tags.
pub const PREF_PUBLICATION_TAGS: &str = "publication_tags";

/// Past non-compliant runs needed before advice flags a recurring pattern.
const RECURRING_PATTERN_MIN: usize = 2;

//
// ================= Retry =================
//

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// Retry transient failures with exponential backoff. Anything else is
/// returned on first failure.
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

//
// ================= Executor =================
//

pub struct StageExecutor {
    engine: Arc<TaxRulesEngine>,
    calendar: Arc<FiscalCalendar>,
    memory: Arc<MemoryStore>,
    monitor: ComplianceMonitor,
    collector: Option<Arc<dyn DataCollector>>,
    jurisdiction: String,
    retry: RetryPolicy,
    alert_window_days: u32,
}

impl StageExecutor {
    pub fn new(
        engine: Arc<TaxRulesEngine>,
        calendar: Arc<FiscalCalendar>,
        memory: Arc<MemoryStore>,
        monitor: ComplianceMonitor,
        jurisdiction: &str,
    ) -> Self {
        Self {
            engine,
            calendar,
            memory,
            monitor,
            collector: None,
            jurisdiction: jurisdiction.trim().to_uppercase(),
            retry: RetryPolicy::default(),
            alert_window_days: crate::verification::DEFAULT_ALERT_WINDOW_DAYS,
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn DataCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_alert_window(mut self, days: u32) -> Self {
        self.alert_window_days = days;
        self
    }

    pub fn jurisdiction(&self) -> &str {
        &self.jurisdiction
    }

    pub fn calendar(&self) -> &FiscalCalendar {
        &self.calendar
    }

    pub async fn execute(&self, stage: Stage, ctx: &mut FiscalContext, request: &RunRequest) -> Result<()> {
        let emphasis = ctx.period.cadence.emphasis(stage);
        debug!(run_id = %ctx.run_id, stage = %stage, ?emphasis, "Executing stage");

        match stage {
            Stage::Collect => self.collect(ctx, request).await,
            Stage::Analyze => self.analyze(ctx),
            Stage::MonitorCompliance => self.monitor_compliance(ctx),
            Stage::Advise => self.advise(ctx, emphasis).await,
            Stage::Document => self.document(ctx, emphasis),
            Stage::Report => self.report(ctx, emphasis).await,
        }
    }

    // -------------------------------------------------
    // COLLECT
    // -------------------------------------------------
    async fn collect(&self, ctx: &mut FiscalContext, request: &RunRequest) -> Result<()> {
        if ctx.period.start > ctx.period.end {
            return Err(OrchestrationError::ValidationError(format!(
                "period start {} is after end {}",
                ctx.period.start, ctx.period.end
            )));
        }

        let records = match (&request.records, &self.collector) {
            (Some(records), _) => records.clone(),
            (None, Some(collector)) => {
                let period = ctx.period.clone();
                retry_with_backoff(self.retry, collector.name(), || collector.collect(&period)).await?
            }
            (None, None) => {
                return Err(OrchestrationError::ConfigurationError(
                    "no records supplied and no data collector configured".to_string(),
                ))
            }
        };

        let total = records.len();
        let in_period: Vec<FinancialRecord> = records
            .into_iter()
            .filter(|r| ctx.period.contains(r.date))
            .collect();

        if in_period.len() < total {
            debug!(
                run_id = %ctx.run_id,
                dropped = total - in_period.len(),
                "Dropped records outside the period"
            );
        }

        info!(run_id = %ctx.run_id, records = in_period.len(), period = %ctx.period.label(), "Records collected");
        ctx.records = in_period;
        Ok(())
    }

    // -------------------------------------------------
    // ANALYZE
    // -------------------------------------------------
    fn analyze(&self, ctx: &mut FiscalContext) -> Result<()> {
        let (summary, record_taxes) =
            self.engine
                .summarize(&ctx.records, &self.jurisdiction, ctx.period.end)?;

        info!(
            run_id = %ctx.run_id,
            revenue = %summary.total_revenue,
            expenses = %summary.total_expenses,
            remittance = %summary.total_remittance,
            "Period analyzed"
        );

        ctx.tax_summary = Some(summary);
        ctx.record_taxes = record_taxes;
        Ok(())
    }

    // -------------------------------------------------
    // MONITOR_COMPLIANCE
    // -------------------------------------------------
    fn monitor_compliance(&self, ctx: &mut FiscalContext) -> Result<()> {
        let summary = require_summary(ctx)?;

        let report = self.monitor.evaluate(&ComplianceInput {
            records: &ctx.records,
            summary,
            calendar: &self.calendar,
            jurisdiction: &self.jurisdiction,
            reference_date: ctx.reference_date,
            window_days: self.alert_window_days,
        })?;

        ctx.compliance = Some(report);
        Ok(())
    }

    // -------------------------------------------------
    // ADVISE
    // -------------------------------------------------
    async fn advise(&self, ctx: &mut FiscalContext, emphasis: StageEmphasis) -> Result<()> {
        let summary = require_summary(ctx)?;
        let mut recommendations = Vec::new();

        if summary.total_remittance > MonetaryAmount::ZERO {
            recommendations.push(Recommendation {
                category: "cash_flow".to_string(),
                priority: Severity::High,
                description: format!(
                    "Set aside {} for the GST/QST remittance of {}",
                    summary.total_remittance,
                    ctx.period.label()
                ),
                estimated_savings: None,
            });
        } else if summary.total_remittance.is_negative() {
            recommendations.push(Recommendation {
                category: "refund".to_string(),
                priority: Severity::Medium,
                description: format!(
                    "File promptly to recover {} of input tax credits",
                    MonetaryAmount::ZERO - summary.total_remittance
                ),
                estimated_savings: Some(MonetaryAmount::ZERO - summary.total_remittance),
            });
        }

        for credit in self.engine.estimate_credits(&ctx.records)? {
            recommendations.push(Recommendation {
                category: "tax_credit".to_string(),
                priority: Severity::Medium,
                description: format!(
                    "Claim the {} on {} of eligible expenses",
                    credit.description, credit.eligible_expenses
                ),
                estimated_savings: Some(credit.estimated_credit),
            });
        }

        for deduction in self.engine.estimate_deductions(&ctx.records, &ctx.preferences)? {
            recommendations.push(Recommendation {
                category: "deduction".to_string(),
                priority: Severity::Low,
                description: format!(
                    "Deduct {} under the {} ({} of eligible expenses)",
                    deduction.deductible_amount, deduction.description, deduction.eligible_expenses
                ),
                estimated_savings: None,
            });
        }

        if let Some(compliance) = &ctx.compliance {
            for finding in compliance
                .findings
                .iter()
                .filter(|f| f.severity >= Severity::High)
            {
                recommendations.push(Recommendation {
                    category: "compliance".to_string(),
                    priority: finding.severity,
                    description: finding.action_required.clone(),
                    estimated_savings: None,
                });
            }

            let medium = compliance
                .findings
                .iter()
                .filter(|f| f.severity == Severity::Medium)
                .count();
            if medium > 0 {
                recommendations.push(Recommendation {
                    category: "documentation".to_string(),
                    priority: Severity::Medium,
                    description: format!("Resolve {} medium-severity compliance findings before filing", medium),
                    estimated_savings: None,
                });
            }

            for alert in compliance
                .deadline_alerts
                .iter()
                .filter(|a| a.level == Severity::Critical)
            {
                recommendations.push(Recommendation {
                    category: "deadline".to_string(),
                    priority: Severity::Critical,
                    description: if alert.days_remaining < 0 {
                        format!("{} was due {} and is overdue", alert.name, alert.due_date)
                    } else {
                        format!("Prepare {} due {}", alert.name, alert.due_date)
                    },
                    estimated_savings: None,
                });
            }
        }

        if let Some(pattern) = self.recurring_status(ctx.period.cadence, &ctx.period.label()).await {
            recommendations.push(pattern);
        }

        if recommendations.is_empty() {
            recommendations.push(Recommendation {
                category: "maintenance".to_string(),
                priority: Severity::Low,
                description: "Keep current bookkeeping and filing practices".to_string(),
                estimated_savings: None,
            });
        }

        // Stable: equal priorities keep the order above.
        recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));
        if let Some(limit) = recommendation_limit(emphasis) {
            recommendations.truncate(limit);
        }

        info!(run_id = %ctx.run_id, count = recommendations.len(), ?emphasis, "Advice prepared");
        ctx.recommendations = recommendations;
        Ok(())
    }

    /// Non-compliant statuses recorded by earlier runs of the same cadence
    /// for other periods.
    async fn recurring_status(&self, cadence: Cadence, period_label: &str) -> Option<Recommendation> {
        let snapshot = self.memory.snapshot().await;

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in &snapshot {
            let patterns = &record.learned_patterns;
            let same_cadence = patterns.get(PATTERN_CADENCE).map(String::as_str) == Some(cadence.as_str());
            let other_period = patterns.get(PATTERN_PERIOD).map(String::as_str) != Some(period_label);

            if let (true, true, Some(status)) = (same_cadence, other_period, patterns.get(PATTERN_COMPLIANCE_STATUS)) {
                if status != "compliant" {
                    *counts.entry(status.as_str()).or_insert(0) += 1;
                }
            }
        }

        let (status, count) = counts.into_iter().max_by_key(|(_, count)| *count)?;
        if count < RECURRING_PATTERN_MIN {
            return None;
        }

        Some(Recommendation {
            category: "pattern".to_string(),
            priority: Severity::High,
            description: format!(
                "Status '{}' recurred in {} previous {} runs; review bookkeeping controls",
                status, count, cadence
            ),
            estimated_savings: None,
        })
    }

    // -------------------------------------------------
    // DOCUMENT
    // -------------------------------------------------
    fn document(&self, ctx: &mut FiscalContext, emphasis: StageEmphasis) -> Result<()> {
        let summary = require_summary(ctx)?;
        let period_label = ctx.period.label();
        let mut documents = Vec::new();

        if let Some(line) = summary.line(GST) {
            documents.push(sales_tax_return(DocumentKind::GstReturn, &period_label, line)?);
        }
        if let Some(line) = summary.line(QST) {
            documents.push(sales_tax_return(DocumentKind::QstReturn, &period_label, line)?);
        }

        if let Some(compliance) = &ctx.compliance {
            let mut fields = BTreeMap::new();
            fields.insert("status".to_string(), compliance.status.to_string());
            fields.insert("findings".to_string(), compliance.findings.len().to_string());
            fields.insert("deadline_alerts".to_string(), compliance.deadline_alerts.len().to_string());
            fields.insert("rules_evaluated".to_string(), compliance.rules_evaluated.to_string());
            documents.push(DocumentDraft {
                kind: DocumentKind::ComplianceSummary,
                period_label: period_label.clone(),
                fields,
            });
        }

        if emphasis == StageEmphasis::Full {
            let mut fields = BTreeMap::new();
            fields.insert("total_revenue".to_string(), summary.total_revenue.to_string());
            fields.insert("total_expenses".to_string(), summary.total_expenses.to_string());
            fields.insert("net_income".to_string(), summary.net_income.to_string());
            fields.insert("records".to_string(), ctx.records.len().to_string());
            documents.push(DocumentDraft {
                kind: DocumentKind::IncomeSummary,
                period_label,
                fields,
            });
        }

        info!(run_id = %ctx.run_id, documents = documents.len(), "Documents drafted");
        ctx.documents = documents;
        Ok(())
    }

    // -------------------------------------------------
    // REPORT
    // -------------------------------------------------
    async fn report(&self, ctx: &mut FiscalContext, emphasis: StageEmphasis) -> Result<()> {
        let summary = require_summary(ctx)?;
        let label = ctx.period.label();
        let status = ctx
            .compliance
            .as_ref()
            .map(|c| c.status)
            .unwrap_or(ComplianceStatus::Compliant);

        let mut highlights = vec![
            format!("Revenue: {}", summary.total_revenue),
            format!("Expenses: {}", summary.total_expenses),
            format!("Net income: {}", summary.net_income),
            format!("GST/QST remittance: {}", summary.total_remittance),
        ];
        let credits = MonetaryAmount::checked_sum(ctx.recommendations.iter().filter_map(|r| r.estimated_savings))?;
        if credits > MonetaryAmount::ZERO {
            highlights.push(format!("Identified savings: {}", credits));
        }
        if emphasis == StageEmphasis::Light {
            highlights.truncate(3);
        }

        let mut risk_factors: Vec<String> = Vec::new();
        if let Some(compliance) = &ctx.compliance {
            risk_factors.extend(
                compliance
                    .findings
                    .iter()
                    .filter(|f| f.severity >= Severity::High)
                    .map(|f| f.description.clone()),
            );
            risk_factors.extend(
                compliance
                    .deadline_alerts
                    .iter()
                    .filter(|a| a.level == Severity::Critical)
                    .map(|a| format!("{} due {}", a.name, a.due_date)),
            );
        }

        let report = FiscalReport {
            title: format!("{} fiscal report {}", capitalize(ctx.period.cadence.as_str()), label),
            executive_summary: format!(
                "For {} the business earned {} against {} of expenses (net {}). \
                 Sales tax owed for the period is {}. Compliance status: {}.",
                label,
                summary.total_revenue,
                summary.total_expenses,
                summary.net_income,
                summary.total_remittance,
                status
            ),
            highlights,
            risk_factors,
            total_revenue: summary.total_revenue,
            total_expenses: summary.total_expenses,
            net_income: summary.net_income,
            total_remittance: summary.total_remittance,
        };

        let draft = if emphasis >= StageEmphasis::Standard {
            Some(self.publication_draft(ctx, &report).await)
        } else {
            None
        };

        info!(run_id = %ctx.run_id, has_draft = draft.is_some(), "Report prepared");
        ctx.report = Some(report);
        ctx.publication_draft = draft;
        Ok(())
    }

    async fn publication_draft(&self, ctx: &FiscalContext, report: &FiscalReport) -> PublicationDraft {
        let label = ctx.period.label();

        let mut content = format!("{}\n\n{}\n", report.title, report.executive_summary);
        for highlight in &report.highlights {
            content.push_str(&format!("\n- {}", highlight));
        }

        let mut tags = vec![
            "fiscal".to_string(),
            ctx.period.cadence.as_str().to_string(),
            label.clone(),
        ];

        let preferred = match ctx.preferences.get(PREF_PUBLICATION_TAGS) {
            Some(tags) => Some(tags.clone()),
            None => self.memory.latest_preference(PREF_PUBLICATION_TAGS).await,
        };
        if let Some(preferred) = preferred {
            for tag in preferred.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                if !tags.iter().any(|t| t == tag) {
                    tags.push(tag.to_string());
                }
            }
        }

        PublicationDraft {
            content,
            attachment_reference: Some(format!("reports/fiscal-{}.json", label)),
            tags,
        }
    }
}

fn require_summary(ctx: &FiscalContext) -> Result<&SalesTaxSummary> {
    ctx.tax_summary.as_ref().ok_or_else(|| {
        OrchestrationError::ValidationError("tax summary missing; ANALYZE has not completed".to_string())
    })
}

fn recommendation_limit(emphasis: StageEmphasis) -> Option<usize> {
    match emphasis {
        StageEmphasis::Light => Some(2),
        StageEmphasis::Standard => Some(5),
        StageEmphasis::Full => None,
    }
}

/// Return draft with `net = collected - paid` checked before it is kept.
fn sales_tax_return(kind: DocumentKind, period_label: &str, line: &TaxLineSummary) -> Result<DocumentDraft> {
    if line.remittance != line.collected - line.paid {
        return Err(OrchestrationError::ValidationError(format!(
            "{} return for {} does not balance: {} - {} != {}",
            line.rule_code, period_label, line.collected, line.paid, line.remittance
        )));
    }

    let mut fields = BTreeMap::new();
    fields.insert("tax_code".to_string(), line.rule_code.clone());
    fields.insert("jurisdiction".to_string(), line.jurisdiction_code.clone());
    fields.insert("tax_collected".to_string(), line.collected.to_string());
    fields.insert("input_tax_credits".to_string(), line.paid.to_string());
    fields.insert("net_remittance".to_string(), line.remittance.to_string());

    Ok(DocumentDraft {
        kind,
        period_label: period_label.to_string(),
        fields,
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{Clock, FixedClock};
    use crate::error::ErrorKind;
    use crate::memory::MemoryRecord;
    use crate::models::{PeriodScope, RecordKind};
    use crate::tax::create_default_engine;
    use crate::verification::create_default_compliance_monitor;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(id: &str, day: NaiveDate, kind: RecordKind, cents: i64, category: &str) -> FinancialRecord {
        FinancialRecord {
            id: id.to_string(),
            date: day,
            kind,
            amount: MonetaryAmount::from_cents(cents),
            category: category.to_string(),
            description: String::new(),
            taxable: true,
            documented: true,
            source: None,
        }
    }

    fn executor(memory: Arc<MemoryStore>) -> StageExecutor {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::on(date(2025, 10, 1)));
        let calendar = FiscalCalendar::with_default_seeds(clock).unwrap();
        StageExecutor::new(
            Arc::new(create_default_engine().unwrap()),
            Arc::new(calendar),
            memory,
            create_default_compliance_monitor(),
            "qc",
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        })
    }

    fn context(period: PeriodScope) -> FiscalContext {
        FiscalContext::new(Uuid::new_v4(), period, date(2025, 10, 1), BTreeMap::new())
    }

    struct FlakyCollector {
        calls: AtomicU32,
        failures: u32,
        records: Vec<FinancialRecord>,
    }

    #[async_trait::async_trait]
    impl DataCollector for FlakyCollector {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn collect(&self, _period: &PeriodScope) -> Result<Vec<FinancialRecord>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(OrchestrationError::ExternalDependencyError("export timed out".into()))
            } else {
                Ok(self.records.clone())
            }
        }
    }

    #[tokio::test]
    async fn test_collect_rejects_inverted_period() {
        let executor = executor(Arc::new(MemoryStore::default()));
        let period = PeriodScope {
            cadence: Cadence::Quarterly,
            start: date(2025, 9, 30),
            end: date(2025, 7, 1),
        };
        let mut ctx = context(period);
        let request = RunRequest::new(period).with_records(vec![record(
            "in",
            date(2025, 8, 1),
            RecordKind::Revenue,
            10_000,
            "sales",
        )]);

        let err = executor
            .execute(Stage::Collect, &mut ctx, &request)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(ctx.records.is_empty());
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_transient_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(RetryPolicy::default(), "validate", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(OrchestrationError::ValidationError("bad".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_collect_retries_transient_failures_and_filters_period() {
        let collector = Arc::new(FlakyCollector {
            calls: AtomicU32::new(0),
            failures: 2,
            records: vec![
                record("in", date(2025, 8, 1), RecordKind::Revenue, 10_000, "sales"),
                record("out", date(2025, 10, 2), RecordKind::Revenue, 10_000, "sales"),
            ],
        });
        let executor = executor(Arc::new(MemoryStore::default())).with_collector(collector.clone());
        let period = PeriodScope::quarterly(2025, 3).unwrap();
        let mut ctx = context(period.clone());

        executor
            .execute(Stage::Collect, &mut ctx, &RunRequest::new(period))
            .await
            .unwrap();

        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.records.len(), 1);
        assert_eq!(ctx.records[0].id, "in");
    }

    #[tokio::test]
    async fn test_collect_gives_up_after_max_attempts() {
        let collector = Arc::new(FlakyCollector {
            calls: AtomicU32::new(0),
            failures: 10,
            records: Vec::new(),
        });
        let executor = executor(Arc::new(MemoryStore::default())).with_collector(collector.clone());
        let period = PeriodScope::quarterly(2025, 3).unwrap();
        let mut ctx = context(period.clone());

        let err = executor
            .execute(Stage::Collect, &mut ctx, &RunRequest::new(period))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalDependency);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_collect_without_source_fails() {
        let executor = executor(Arc::new(MemoryStore::default()));
        let period = PeriodScope::monthly(2025, 7).unwrap();
        let mut ctx = context(period.clone());

        let err = executor
            .execute(Stage::Collect, &mut ctx, &RunRequest::new(period))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_document_requires_analysis() {
        let executor = executor(Arc::new(MemoryStore::default()));
        let period = PeriodScope::quarterly(2025, 3).unwrap();
        let mut ctx = context(period.clone());

        let err = executor
            .execute(Stage::Document, &mut ctx, &RunRequest::new(period))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(ctx.documents.is_empty());
    }

    #[tokio::test]
    async fn test_quarterly_documents_balance() {
        let executor = executor(Arc::new(MemoryStore::default()));
        let period = PeriodScope::quarterly(2025, 3).unwrap();
        let records = vec![
            record("r1", date(2025, 7, 5), RecordKind::Revenue, 150_000, "sales"),
            record("e1", date(2025, 8, 5), RecordKind::Expense, 20_000, "supplies"),
        ];
        let request = RunRequest::new(period.clone()).with_records(records);
        let mut ctx = context(period);

        for stage in Stage::ORDER {
            executor.execute(stage, &mut ctx, &request).await.unwrap();
        }

        let gst = ctx.documents.iter().find(|d| d.kind == DocumentKind::GstReturn).unwrap();
        assert_eq!(gst.fields["tax_collected"], "75.00");
        assert_eq!(gst.fields["input_tax_credits"], "10.00");
        assert_eq!(gst.fields["net_remittance"], "65.00");

        let qst = ctx.documents.iter().find(|d| d.kind == DocumentKind::QstReturn).unwrap();
        assert_eq!(qst.fields["net_remittance"], "129.68");

        // Quarterly runs DOCUMENT at full emphasis.
        assert!(ctx.documents.iter().any(|d| d.kind == DocumentKind::IncomeSummary));
        assert!(ctx.publication_draft.is_some());
    }

    #[test]
    fn test_unbalanced_return_is_rejected() {
        let line = TaxLineSummary {
            rule_code: GST.to_string(),
            jurisdiction_code: "CA".to_string(),
            collected: MonetaryAmount::from_cents(7_500),
            paid: MonetaryAmount::from_cents(1_000),
            remittance: MonetaryAmount::from_cents(6_000),
        };
        assert!(sales_tax_return(DocumentKind::GstReturn, "2025-Q3", &line).is_err());
    }

    #[tokio::test]
    async fn test_monthly_advice_is_light_and_has_no_draft() {
        let executor = executor(Arc::new(MemoryStore::default()));
        let period = PeriodScope::monthly(2025, 9).unwrap();
        let records = vec![
            record("r1", date(2025, 9, 2), RecordKind::Revenue, 1_200_000, "sales"),
            record("e1", date(2025, 9, 3), RecordKind::Expense, 500_000, "research"),
            record("e2", date(2025, 9, 4), RecordKind::Expense, 200_000, "digital_media"),
        ];
        let request = RunRequest::new(period.clone()).with_records(records);
        let mut ctx = context(period);

        for stage in Stage::ORDER {
            executor.execute(stage, &mut ctx, &request).await.unwrap();
        }

        assert_eq!(ctx.recommendations.len(), 2);
        assert!(ctx.recommendations[0].priority >= ctx.recommendations[1].priority);
        assert!(ctx.publication_draft.is_none());
        assert_eq!(ctx.report.as_ref().unwrap().highlights.len(), 3);
    }

    #[tokio::test]
    async fn test_strategic_advice_includes_deductions() {
        let executor = executor(Arc::new(MemoryStore::default()));
        let period = PeriodScope::strategic(2025).unwrap();
        let records = vec![
            record("r1", date(2025, 3, 2), RecordKind::Revenue, 4_000_000, "sales"),
            record("e1", date(2025, 3, 9), RecordKind::Expense, 120_000, "home_office"),
        ];
        let request = RunRequest::new(period).with_records(records);
        let mut prefs = BTreeMap::new();
        prefs.insert(crate::tax::PREF_COMPANY_TYPE.to_string(), "tech_startup".to_string());
        let mut ctx = FiscalContext::new(Uuid::new_v4(), period, date(2025, 10, 1), prefs);

        for stage in [Stage::Collect, Stage::Analyze, Stage::MonitorCompliance, Stage::Advise] {
            executor.execute(stage, &mut ctx, &request).await.unwrap();
        }

        let deductions: Vec<&Recommendation> = ctx
            .recommendations
            .iter()
            .filter(|r| r.category == "deduction")
            .collect();
        assert_eq!(deductions.len(), 3);
        assert!(deductions.iter().all(|r| r.priority == Severity::Low));
        assert!(deductions.iter().any(|r| r.description.contains("Home office deduction")));
        assert!(deductions.iter().any(|r| r.description.starts_with("Deduct 180.00")));
    }

    #[tokio::test]
    async fn test_recurring_status_from_other_periods() {
        let memory = Arc::new(MemoryStore::default());
        for label in ["2025-Q1", "2025-Q2"] {
            memory
                .append(
                    MemoryRecord::new(format!("quarterly run {}", label))
                        .with_pattern(PATTERN_CADENCE, "quarterly")
                        .with_pattern(PATTERN_PERIOD, label)
                        .with_pattern(PATTERN_COMPLIANCE_STATUS, "at_risk"),
                )
                .await;
        }
        let executor = executor(memory.clone());

        let pattern = executor.recurring_status(Cadence::Quarterly, "2025-Q3").await.unwrap();
        assert_eq!(pattern.category, "pattern");
        assert!(pattern.description.contains("at_risk"));

        // Earlier runs of the same period are not counted.
        assert!(executor.recurring_status(Cadence::Quarterly, "2025-Q2").await.is_none());
        assert!(executor.recurring_status(Cadence::Monthly, "2025-09").await.is_none());
    }

    #[tokio::test]
    async fn test_publication_tags_from_preferences() {
        let memory = Arc::new(MemoryStore::default());
        let mut prefs = BTreeMap::new();
        prefs.insert(PREF_PUBLICATION_TAGS.to_string(), "quebec, smallbiz".to_string());
        memory.append(MemoryRecord::new("earlier").with_preferences(prefs)).await;

        let executor = executor(memory);
        let period = PeriodScope::annual(2024).unwrap();
        let request = RunRequest::new(period.clone()).with_records(vec![record(
            "r1",
            date(2024, 5, 1),
            RecordKind::Revenue,
            100_000,
            "sales",
        )]);
        let mut ctx = context(period);

        for stage in Stage::ORDER {
            executor.execute(stage, &mut ctx, &request).await.unwrap();
        }

        let draft = ctx.publication_draft.unwrap();
        assert!(draft.tags.contains(&"smallbiz".to_string()));
        assert!(draft.tags.contains(&"2024".to_string()));
        assert_eq!(draft.attachment_reference.as_deref(), Some("reports/fiscal-2024.json"));
    }
}
