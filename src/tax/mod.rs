//! Tax rules engine
//!
//! Pure computation over fixed-point amounts. Every rate in a rule set is
//! applied to the pre-tax base; lines are rounded half-up to cents and the
//! combined total is the sum of the rounded lines.

use crate::error::OrchestrationError;
use crate::models::{FinancialRecord, MonetaryAmount, RecordKind};
use crate::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

pub const GST: &str = "GST";
pub const QST: &str = "QST";

/// Preference key naming the company profile deductions may require.
pub const PREF_COMPANY_TYPE: &str = "company_type";

//
// ================= Rules =================
//

/// A named rate applied by one jurisdiction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JurisdictionRule {
    pub code: String,
    pub description: String,
    pub jurisdiction_code: String,
    pub rate: Decimal,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub effective_from: Option<NaiveDate>,
    #[serde(default)]
    pub expires_on: Option<NaiveDate>,
}

fn enabled_by_default() -> bool {
    true
}

impl JurisdictionRule {
    pub fn new(code: &str, description: &str, jurisdiction_code: &str, rate: Decimal) -> Self {
        Self {
            code: code.to_string(),
            description: description.to_string(),
            jurisdiction_code: jurisdiction_code.to_string(),
            rate,
            enabled: true,
            effective_from: None,
            expires_on: None,
        }
    }

    pub fn effective_from(mut self, date: NaiveDate) -> Self {
        self.effective_from = Some(date);
        self
    }

    pub fn expires_on(mut self, date: NaiveDate) -> Self {
        self.expires_on = Some(date);
        self
    }

    pub fn in_force(&self, on: NaiveDate) -> bool {
        self.enabled
            && self.effective_from.map_or(true, |from| on >= from)
            && self.expires_on.map_or(true, |until| on <= until)
    }
}

/// The rates a jurisdiction applies to one base amount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    pub jurisdiction_code: String,
    pub rules: Vec<JurisdictionRule>,
}

impl RuleSet {
    pub fn new(jurisdiction_code: &str, rules: Vec<JurisdictionRule>) -> Self {
        Self {
            jurisdiction_code: jurisdiction_code.to_string(),
            rules,
        }
    }

    pub fn enabled_rules(&self) -> impl Iterator<Item = &JurisdictionRule> {
        self.rules.iter().filter(|r| r.enabled)
    }
}

//
// ================= Results =================
//

/// One itemized tax line. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxComputation {
    rule_code: String,
    jurisdiction_code: String,
    base_amount: MonetaryAmount,
    rate: Decimal,
    tax_amount: MonetaryAmount,
}

impl TaxComputation {
    pub fn rule_code(&self) -> &str {
        &self.rule_code
    }

    pub fn jurisdiction_code(&self) -> &str {
        &self.jurisdiction_code
    }

    pub fn base_amount(&self) -> MonetaryAmount {
        self.base_amount
    }

    pub fn rate(&self) -> Decimal {
        self.rate
    }

    pub fn tax_amount(&self) -> MonetaryAmount {
        self.tax_amount
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxBreakdown {
    base_amount: MonetaryAmount,
    lines: Vec<TaxComputation>,
    total_tax: MonetaryAmount,
    total_amount: MonetaryAmount,
}

impl TaxBreakdown {
    pub fn lines(&self) -> &[TaxComputation] {
        &self.lines
    }

    pub fn base_amount(&self) -> MonetaryAmount {
        self.base_amount
    }

    /// Sum of the rounded lines.
    pub fn total_tax(&self) -> MonetaryAmount {
        self.total_tax
    }

    pub fn total_amount(&self) -> MonetaryAmount {
        self.total_amount
    }

    pub fn line(&self, rule_code: &str) -> Option<&TaxComputation> {
        self.lines.iter().find(|l| l.rule_code == rule_code)
    }
}

/// Apply every enabled rate of `rule_set` to `amount`.
pub fn compute(amount: MonetaryAmount, rule_set: &RuleSet) -> Result<TaxBreakdown> {
    if amount.is_negative() {
        return Err(OrchestrationError::ValidationError(format!(
            "tax base must be non-negative, got {}",
            amount
        )));
    }

    let mut lines = Vec::with_capacity(rule_set.rules.len());

    for rule in rule_set.enabled_rules() {
        if rule.rate.is_sign_negative() {
            return Err(OrchestrationError::ConfigurationError(format!(
                "rule {} has a negative rate",
                rule.code
            )));
        }

        lines.push(TaxComputation {
            rule_code: rule.code.clone(),
            jurisdiction_code: rule.jurisdiction_code.clone(),
            base_amount: amount,
            rate: rule.rate,
            tax_amount: amount.checked_times(rule.rate)?.round_half_up(),
        });
    }

    if lines.is_empty() {
        return Err(OrchestrationError::ConfigurationError(format!(
            "no enabled tax rate for jurisdiction {}",
            rule_set.jurisdiction_code
        )));
    }

    let total_tax = MonetaryAmount::checked_sum(lines.iter().map(|l| l.tax_amount))?;

    Ok(TaxBreakdown {
        base_amount: amount,
        total_amount: amount.checked_add(total_tax)?,
        lines,
        total_tax,
    })
}

//
// ================= Period Summary =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordTax {
    pub record_id: String,
    pub kind: RecordKind,
    pub breakdown: TaxBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxLineSummary {
    pub rule_code: String,
    pub jurisdiction_code: String,
    pub collected: MonetaryAmount,
    /// Input tax credits on expenses.
    pub paid: MonetaryAmount,
    pub remittance: MonetaryAmount,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SalesTaxSummary {
    pub jurisdiction_code: String,
    pub total_revenue: MonetaryAmount,
    pub total_expenses: MonetaryAmount,
    pub net_income: MonetaryAmount,
    pub lines: Vec<TaxLineSummary>,
    pub total_collected: MonetaryAmount,
    pub total_paid: MonetaryAmount,
    pub total_remittance: MonetaryAmount,
}

impl SalesTaxSummary {
    pub fn line(&self, rule_code: &str) -> Option<&TaxLineSummary> {
        self.lines.iter().find(|l| l.rule_code == rule_code)
    }

    /// Jurisdictions that produced at least one tax line.
    pub fn taxed_jurisdictions(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self
            .lines
            .iter()
            .filter(|l| l.collected != MonetaryAmount::ZERO || l.paid != MonetaryAmount::ZERO)
            .map(|l| l.jurisdiction_code.as_str())
            .collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }
}

//
// ================= Credits =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxCreditRule {
    pub code: String,
    pub description: String,
    pub jurisdiction_code: String,
    /// Expense category the credit applies to.
    pub category: String,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditEstimate {
    pub code: String,
    pub description: String,
    pub eligible_expenses: MonetaryAmount,
    pub estimated_credit: MonetaryAmount,
}

//
// ================= Deductions =================
//

/// Which expenses a deduction applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeductionCondition {
    /// Every expense backed by a receipt or invoice.
    DocumentedExpenses,
    Category { category: String },
    /// Every expense, for a matching company profile under a revenue ceiling.
    CompanyProfile {
        company_type: String,
        revenue_below: MonetaryAmount,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxDeductionRule {
    pub code: String,
    pub description: String,
    pub jurisdiction_code: String,
    pub condition: DeductionCondition,
    /// Deductible share of the eligible expenses.
    pub rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeductionEstimate {
    pub code: String,
    pub description: String,
    pub eligible_expenses: MonetaryAmount,
    pub deductible_amount: MonetaryAmount,
}

//
// ================= Rule Book =================
//

/// Every table an engine holds, in a form that survives a JSON round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleBook {
    #[serde(default)]
    pub rule_sets: Vec<RuleSet>,
    #[serde(default)]
    pub credits: Vec<TaxCreditRule>,
    #[serde(default)]
    pub deductions: Vec<TaxDeductionRule>,
}

//
// ================= Engine =================
//

/// Rule sets keyed by jurisdiction code plus the credit and deduction tables.
#[derive(Default)]
pub struct TaxRulesEngine {
    rule_sets: HashMap<String, Vec<JurisdictionRule>>,
    credits: Vec<TaxCreditRule>,
    deductions: Vec<TaxDeductionRule>,
}

fn check_rate(code: &str, rate: Decimal) -> Result<()> {
    if rate.is_sign_negative() || rate > Decimal::ONE {
        return Err(OrchestrationError::ConfigurationError(format!(
            "rule {} rate {} is outside [0, 1]",
            code, rate
        )));
    }
    Ok(())
}

impl TaxRulesEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the rates of a jurisdiction.
    pub fn insert_rule_set(&mut self, jurisdiction_code: &str, rules: Vec<JurisdictionRule>) -> Result<()> {
        for (i, rule) in rules.iter().enumerate() {
            check_rate(&rule.code, rule.rate)?;
            if rules[..i].iter().any(|r| r.code == rule.code) {
                return Err(OrchestrationError::ConfigurationError(format!(
                    "rule {} appears twice in {}",
                    rule.code, jurisdiction_code
                )));
            }
        }

        self.rule_sets.insert(jurisdiction_code.to_uppercase(), rules);
        Ok(())
    }

    /// Register a credit, replacing any credit with the same code.
    pub fn add_credit_rule(&mut self, rule: TaxCreditRule) -> Result<()> {
        check_rate(&rule.code, rule.rate)?;
        self.credits.retain(|c| c.code != rule.code);
        self.credits.push(rule);
        Ok(())
    }

    /// Register a deduction, replacing any deduction with the same code.
    pub fn add_deduction_rule(&mut self, rule: TaxDeductionRule) -> Result<()> {
        check_rate(&rule.code, rule.rate)?;
        self.deductions.retain(|d| d.code != rule.code);
        self.deductions.push(rule);
        Ok(())
    }

    /// Rules of `jurisdiction_code` in force on `on`.
    pub fn rule_set(&self, jurisdiction_code: &str, on: NaiveDate) -> Result<RuleSet> {
        let rules = self
            .rule_sets
            .get(&jurisdiction_code.to_uppercase())
            .ok_or_else(|| {
                OrchestrationError::ConfigurationError(format!(
                    "no tax rules configured for jurisdiction {}",
                    jurisdiction_code
                ))
            })?;

        let in_force: Vec<JurisdictionRule> =
            rules.iter().filter(|r| r.in_force(on)).cloned().collect();

        if in_force.is_empty() {
            return Err(OrchestrationError::ConfigurationError(format!(
                "no tax rate in force for {} on {}",
                jurisdiction_code, on
            )));
        }

        Ok(RuleSet::new(jurisdiction_code, in_force))
    }

    pub fn compute_for(
        &self,
        amount: MonetaryAmount,
        jurisdiction_code: &str,
        on: NaiveDate,
    ) -> Result<TaxBreakdown> {
        let rule_set = self.rule_set(jurisdiction_code, on)?;
        compute(amount, &rule_set)
    }

    /// Sales tax collected, paid and owed over a set of records.
    pub fn summarize(
        &self,
        records: &[FinancialRecord],
        jurisdiction_code: &str,
        on: NaiveDate,
    ) -> Result<(SalesTaxSummary, Vec<RecordTax>)> {
        let rule_set = self.rule_set(jurisdiction_code, on)?;

        let mut lines: Vec<TaxLineSummary> = rule_set
            .enabled_rules()
            .map(|r| TaxLineSummary {
                rule_code: r.code.clone(),
                jurisdiction_code: r.jurisdiction_code.clone(),
                collected: MonetaryAmount::ZERO,
                paid: MonetaryAmount::ZERO,
                remittance: MonetaryAmount::ZERO,
            })
            .collect();

        let mut total_revenue = MonetaryAmount::ZERO;
        let mut total_expenses = MonetaryAmount::ZERO;
        let mut record_taxes = Vec::with_capacity(records.len());

        for record in records {
            if record.amount.is_negative() {
                return Err(OrchestrationError::ValidationError(format!(
                    "record {} has negative amount {}",
                    record.id, record.amount
                )));
            }

            match record.kind {
                RecordKind::Revenue => total_revenue = total_revenue.checked_add(record.amount)?,
                RecordKind::Expense => total_expenses = total_expenses.checked_add(record.amount)?,
            }

            if !record.taxable {
                debug!(record_id = %record.id, "Zero-rated record, no sales tax");
                continue;
            }

            let breakdown = compute(record.amount, &rule_set)?;

            for computed in breakdown.lines() {
                if let Some(line) = lines.iter_mut().find(|l| l.rule_code == computed.rule_code) {
                    match record.kind {
                        RecordKind::Revenue => line.collected = line.collected.checked_add(computed.tax_amount)?,
                        RecordKind::Expense => line.paid = line.paid.checked_add(computed.tax_amount)?,
                    }
                }
            }

            record_taxes.push(RecordTax {
                record_id: record.id.clone(),
                kind: record.kind,
                breakdown,
            });
        }

        for line in &mut lines {
            line.remittance = line.collected - line.paid;
        }

        let total_collected = MonetaryAmount::checked_sum(lines.iter().map(|l| l.collected))?;
        let total_paid = MonetaryAmount::checked_sum(lines.iter().map(|l| l.paid))?;
        let total_remittance = MonetaryAmount::checked_sum(lines.iter().map(|l| l.remittance))?;

        let summary = SalesTaxSummary {
            jurisdiction_code: rule_set.jurisdiction_code.clone(),
            total_revenue,
            total_expenses,
            net_income: total_revenue - total_expenses,
            lines,
            total_collected,
            total_paid,
            total_remittance,
        };

        Ok((summary, record_taxes))
    }

    /// Credits claimable on categorized expenses, rounded per credit.
    pub fn estimate_credits(&self, records: &[FinancialRecord]) -> Result<Vec<CreditEstimate>> {
        let mut estimates = Vec::new();

        for credit in &self.credits {
            let eligible = MonetaryAmount::checked_sum(
                records
                    .iter()
                    .filter(|r| r.kind == RecordKind::Expense)
                    .filter(|r| r.category.eq_ignore_ascii_case(&credit.category))
                    .map(|r| r.amount),
            )?;

            if eligible == MonetaryAmount::ZERO {
                continue;
            }

            estimates.push(CreditEstimate {
                code: credit.code.clone(),
                description: credit.description.clone(),
                eligible_expenses: eligible,
                estimated_credit: eligible.checked_times(credit.rate)?.round_half_up(),
            });
        }

        Ok(estimates)
    }

    /// Deductible amounts over the period's expenses, rounded per deduction.
    /// Profile conditions read `PREF_COMPANY_TYPE` from `preferences`.
    pub fn estimate_deductions(
        &self,
        records: &[FinancialRecord],
        preferences: &BTreeMap<String, String>,
    ) -> Result<Vec<DeductionEstimate>> {
        let expenses: Vec<&FinancialRecord> = records
            .iter()
            .filter(|r| r.kind == RecordKind::Expense)
            .collect();
        let revenue = MonetaryAmount::checked_sum(
            records
                .iter()
                .filter(|r| r.kind == RecordKind::Revenue)
                .map(|r| r.amount),
        )?;
        let company_type = preferences.get(PREF_COMPANY_TYPE).map(|t| t.trim());

        let mut estimates = Vec::new();

        for deduction in &self.deductions {
            let eligible = match &deduction.condition {
                DeductionCondition::DocumentedExpenses => MonetaryAmount::checked_sum(
                    expenses.iter().filter(|r| r.documented).map(|r| r.amount),
                )?,
                DeductionCondition::Category { category } => MonetaryAmount::checked_sum(
                    expenses
                        .iter()
                        .filter(|r| r.category.eq_ignore_ascii_case(category))
                        .map(|r| r.amount),
                )?,
                DeductionCondition::CompanyProfile {
                    company_type: required,
                    revenue_below,
                } => {
                    let qualifies = company_type.is_some_and(|t| t.eq_ignore_ascii_case(required))
                        && revenue < *revenue_below;
                    if !qualifies {
                        continue;
                    }
                    MonetaryAmount::checked_sum(expenses.iter().map(|r| r.amount))?
                }
            };

            if eligible == MonetaryAmount::ZERO {
                continue;
            }

            estimates.push(DeductionEstimate {
                code: deduction.code.clone(),
                description: deduction.description.clone(),
                eligible_expenses: eligible,
                deductible_amount: eligible.checked_times(deduction.rate)?.round_half_up(),
            });
        }

        Ok(estimates)
    }

    //
    // ---------- Import / Export ----------
    //

    /// Snapshot of every table, rule sets ordered by jurisdiction.
    pub fn export_rules(&self) -> RuleBook {
        let mut rule_sets: Vec<RuleSet> = self
            .rule_sets
            .iter()
            .map(|(code, rules)| RuleSet::new(code, rules.clone()))
            .collect();
        rule_sets.sort_by(|a, b| a.jurisdiction_code.cmp(&b.jurisdiction_code));

        RuleBook {
            rule_sets,
            credits: self.credits.clone(),
            deductions: self.deductions.clone(),
        }
    }

    /// Merge a rule book into the engine. Entries replace existing ones with
    /// the same jurisdiction or code. Nothing is applied unless every entry
    /// is valid.
    pub fn import_rules(&mut self, book: RuleBook) -> Result<()> {
        let mut staged = Self::new();
        for set in book.rule_sets {
            staged.insert_rule_set(&set.jurisdiction_code, set.rules)?;
        }
        for credit in book.credits {
            staged.add_credit_rule(credit)?;
        }
        for deduction in book.deductions {
            staged.add_deduction_rule(deduction)?;
        }

        info!(
            rule_sets = staged.rule_sets.len(),
            credits = staged.credits.len(),
            deductions = staged.deductions.len(),
            "Tax rules imported"
        );

        self.rule_sets.extend(staged.rule_sets);
        for credit in staged.credits {
            self.add_credit_rule(credit)?;
        }
        for deduction in staged.deductions {
            self.add_deduction_rule(deduction)?;
        }
        Ok(())
    }

    pub fn save_rules(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.export_rules())?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn load_rules(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            OrchestrationError::ConfigurationError(format!("cannot read tax rules {}: {}", path.display(), e))
        })?;
        let book: RuleBook = serde_json::from_str(&json).map_err(|e| {
            OrchestrationError::ConfigurationError(format!("invalid tax rules {}: {}", path.display(), e))
        })?;
        self.import_rules(book)
    }
}

fn effective(year: i32, month: u32, day: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
        OrchestrationError::ConfigurationError(format!("invalid effective date {}-{}-{}", year, month, day))
    })
}

/// Federal GST and Quebec QST, the SR&ED and digital media credits, and the
/// business, home office and startup deductions.
pub fn create_default_engine() -> Result<TaxRulesEngine> {
    let gst = JurisdictionRule::new(GST, "Goods and Services Tax", "CA", Decimal::new(5, 2))
        .effective_from(effective(2008, 1, 1)?);
    let qst = JurisdictionRule::new(QST, "Quebec Sales Tax", "QC", Decimal::new(9975, 5))
        .effective_from(effective(2013, 1, 1)?);

    let mut engine = TaxRulesEngine::new();
    engine.insert_rule_set("CA", vec![gst.clone()])?;
    engine.insert_rule_set("QC", vec![gst, qst])?;

    engine.add_credit_rule(TaxCreditRule {
        code: "SRED".to_string(),
        description: "Scientific research and experimental development credit".to_string(),
        jurisdiction_code: "CA".to_string(),
        category: "research".to_string(),
        rate: Decimal::new(35, 2),
    })?;
    engine.add_credit_rule(TaxCreditRule {
        code: "DIGITAL_MEDIA_QC".to_string(),
        description: "Quebec digital media credit".to_string(),
        jurisdiction_code: "QC".to_string(),
        category: "digital_media".to_string(),
        rate: Decimal::new(24, 2),
    })?;

    engine.add_deduction_rule(TaxDeductionRule {
        code: "BUSINESS_EXPENSES".to_string(),
        description: "Business expense deduction".to_string(),
        jurisdiction_code: "ALL".to_string(),
        condition: DeductionCondition::DocumentedExpenses,
        rate: Decimal::ONE,
    })?;
    engine.add_deduction_rule(TaxDeductionRule {
        code: "HOME_OFFICE".to_string(),
        description: "Home office deduction".to_string(),
        jurisdiction_code: "ALL".to_string(),
        condition: DeductionCondition::Category {
            category: "home_office".to_string(),
        },
        rate: Decimal::new(25, 2),
    })?;
    engine.add_deduction_rule(TaxDeductionRule {
        code: "TECH_STARTUP".to_string(),
        description: "Technology startup deduction".to_string(),
        jurisdiction_code: "ALL".to_string(),
        condition: DeductionCondition::CompanyProfile {
            company_type: "tech_startup".to_string(),
            revenue_below: MonetaryAmount::from_cents(10_000_000),
        },
        rate: Decimal::new(15, 2),
    })?;

    Ok(engine)
}
