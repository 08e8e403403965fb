// Result aggregation
// Collects per-company outcomes in any arrival order and produces one ordered report.

use crate::error::{ErrorKind, SegmentationError};
use crate::model::{total_adjusted, total_gross, FinancialLineItem, PipelineVariant, SegmentedRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};

// ============================================================================
// COMPANY OUTCOME
// ============================================================================

/// A company that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyFailure {
    pub company_code: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl CompanyFailure {
    pub fn from_error(company_code: &str, error: &SegmentationError) -> Self {
        CompanyFailure {
            company_code: company_code.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Input total against the gross and adjusted totals a company's records carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalsCheck {
    pub company_code: String,
    pub input_total: Decimal,
    pub gross_total: Decimal,
    pub adjusted_total: Decimal,
}

impl TotalsCheck {
    /// Both output totals reproduce the input exactly
    pub fn is_balanced(&self) -> bool {
        self.gross_total == self.input_total && self.adjusted_total == self.input_total
    }
}

/// What one company task hands back to the collector
#[derive(Debug, Clone)]
pub struct CompanyOutcome {
    /// Position of the company in the target list
    pub index: usize,
    pub company_code: String,
    pub variant: Option<PipelineVariant>,
    /// Filtered input rows the pipeline saw (empty when loading failed)
    pub line_items: Vec<FinancialLineItem>,
    pub result: Result<Vec<SegmentedRecord>, SegmentationError>,
    /// Present when the pipeline succeeded
    pub totals: Option<TotalsCheck>,
}

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub companies: Vec<String>,
    pub records: Vec<SegmentedRecord>,
    pub failures: Vec<CompanyFailure>,
    pub line_items: Vec<FinancialLineItem>,
    /// One check per successful company, in target order
    #[serde(default)]
    pub totals: Vec<TotalsCheck>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl RunReport {
    /// True when every company produced output and every output reconciles
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.is_reconciled()
    }

    pub fn is_reconciled(&self) -> bool {
        self.totals.iter().all(TotalsCheck::is_balanced)
    }

    /// Companies whose records do not add up to their input
    pub fn unbalanced(&self) -> Vec<&TotalsCheck> {
        self.totals.iter().filter(|t| !t.is_balanced()).collect()
    }

    pub fn totals_for(&self, company_code: &str) -> Option<&TotalsCheck> {
        self.totals.iter().find(|t| t.company_code == company_code)
    }

    /// `None` when the run total overflows
    pub fn total_gross(&self) -> Option<Decimal> {
        total_gross(&self.records)
    }

    pub fn total_adjusted(&self) -> Option<Decimal> {
        total_adjusted(&self.records)
    }

    pub fn records_for(&self, company_code: &str) -> Vec<&SegmentedRecord> {
        self.records
            .iter()
            .filter(|r| r.company_code == company_code)
            .collect()
    }

    pub fn failure_for(&self, company_code: &str) -> Option<&CompanyFailure> {
        self.failures.iter().find(|f| f.company_code == company_code)
    }

    /// Number of records emitted per pipeline
    pub fn records_by_variant(&self) -> BTreeMap<PipelineVariant, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.pipeline_variant).or_insert(0) += 1;
        }
        counts
    }

    /// SHA-256 over the canonical record sequence; equal inputs give equal fingerprints
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for record in &self.records {
            hasher.update(record.canonical().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn summary(&self) -> String {
        let adjusted = match self.total_adjusted() {
            Some(total) => total.normalize().to_string(),
            None => "overflow".to_string(),
        };
        format!(
            "Run {}: {} companies, {} records, {} failures, {} unbalanced, adjusted total {}",
            self.run_id,
            self.companies.len(),
            self.records.len(),
            self.failures.len(),
            self.unbalanced().len(),
            adjusted
        )
    }
}

// ============================================================================
// RESULT AGGREGATOR
// ============================================================================

/// Single collector for company outcomes. Output order follows the target list,
/// regardless of the order outcomes arrive in.
pub struct ResultAggregator {
    run_id: String,
    companies: Vec<String>,
    outcomes: BTreeMap<usize, CompanyOutcome>,
}

impl ResultAggregator {
    pub fn new(run_id: &str, companies: Vec<String>) -> Self {
        ResultAggregator {
            run_id: run_id.to_string(),
            companies,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, outcome: CompanyOutcome) {
        match &outcome.result {
            Ok(records) => info!(
                company_code = %outcome.company_code,
                pipeline = outcome.variant.map(|v| v.name()).unwrap_or("-"),
                rows = records.len(),
                "company_processed"
            ),
            Err(error) => warn!(
                company_code = %outcome.company_code,
                kind = error.kind().name(),
                error = %error,
                "company_failed"
            ),
        }
        self.outcomes.insert(outcome.index, outcome);
    }

    /// Companies in the target list with no outcome are reported as cancelled
    pub fn finish(self) -> RunReport {
        let mut records = Vec::new();
        let mut failures = Vec::new();
        let mut line_items = Vec::new();
        let mut totals = Vec::new();
        let mut outcomes = self.outcomes;

        for (index, company_code) in self.companies.iter().enumerate() {
            match outcomes.remove(&index) {
                Some(outcome) => {
                    line_items.extend(outcome.line_items);
                    totals.extend(outcome.totals);
                    match outcome.result {
                        Ok(rows) => records.extend(rows),
                        Err(error) => failures.push(CompanyFailure::from_error(company_code, &error)),
                    }
                }
                None => failures.push(CompanyFailure::from_error(
                    company_code,
                    &SegmentationError::Cancelled {
                        company_code: company_code.clone(),
                    },
                )),
            }
        }

        RunReport {
            run_id: self.run_id,
            companies: self.companies,
            records,
            failures,
            line_items,
            totals,
            completed_at: chrono::Utc::now(),
        }
    }
}
