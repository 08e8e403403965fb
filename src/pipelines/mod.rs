// Segmentation pipelines
//
// Each pipeline is a pure function from one company's filtered datasets, its
// config and its segment rule to segmented records. The variant set is closed:
// dispatch is a match over `PipelineVariant`.

pub mod manual_erosion;
pub mod mixed_activity;
pub mod single_activity;

use crate::aggregator::TotalsCheck;
use crate::config::CompanyConfig;
use crate::error::{Result, SegmentationError};
use crate::model::{
    checked_sum, total_adjusted, total_gross, Activity, Category, FinancialLineItem, PipelineVariant,
    Segment, SegmentedRecord,
};
use crate::rules::SegmentRule;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub use manual_erosion::manual_erosion;
pub use mixed_activity::{mixed_activity, mixed_activity_with_external_costs};
pub use single_activity::single_activity;

// ============================================================================
// PIPELINE INPUT
// ============================================================================

/// One dataset after company and scope filtering
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyDataset {
    pub name: String,
    /// Came from a source with a scope list
    pub isolated: bool,
    pub items: Vec<FinancialLineItem>,
}

impl CompanyDataset {
    pub fn new(name: &str, isolated: bool, items: Vec<FinancialLineItem>) -> Self {
        CompanyDataset {
            name: name.to_string(),
            isolated,
            items,
        }
    }

    /// `None` when the amounts overflow
    pub fn total(&self) -> Option<Decimal> {
        checked_sum(self.items.iter().map(|i| i.amount))
    }
}

/// Everything a pipeline may look at for one company. Borrowed, never mutated.
#[derive(Debug, Clone, Copy)]
pub struct CompanyInput<'a> {
    pub company_code: &'a str,
    pub datasets: &'a [CompanyDataset],
    pub config: Option<&'a CompanyConfig>,
    pub rule: Option<&'a SegmentRule>,
    /// Name of the dataset holding the grand totals
    pub grand_total: &'a str,
}

impl<'a> CompanyInput<'a> {
    pub fn all_items(&self) -> impl Iterator<Item = &'a FinancialLineItem> {
        self.datasets.iter().flat_map(|d| d.items.iter())
    }

    pub fn isolated_items(&self) -> impl Iterator<Item = &'a FinancialLineItem> {
        self.datasets
            .iter()
            .filter(|d| d.isolated)
            .flat_map(|d| d.items.iter())
    }

    pub fn pooled_items(&self) -> impl Iterator<Item = &'a FinancialLineItem> {
        self.datasets
            .iter()
            .filter(|d| !d.isolated)
            .flat_map(|d| d.items.iter())
    }

    pub fn grand_total_dataset(&self) -> Option<&'a CompanyDataset> {
        self.datasets.iter().find(|d| d.name == self.grand_total)
    }

    /// Sum of every input amount; `None` when it overflows
    pub fn input_total(&self) -> Option<Decimal> {
        checked_sum(self.all_items().map(|i| i.amount))
    }

    /// The company's segment rule, for pipelines that cannot run without one
    pub fn require_rule(&self) -> Result<&'a SegmentRule> {
        self.rule.ok_or_else(|| SegmentationError::SegmentMappingNotFound {
            company_code: self.company_code.to_string(),
        })
    }

    pub(crate) fn overflow(&self) -> SegmentationError {
        SegmentationError::AmountOverflow {
            company_code: self.company_code.to_string(),
        }
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Run the pipeline a company is assigned to
pub fn dispatch(variant: PipelineVariant, input: &CompanyInput<'_>) -> Result<Vec<SegmentedRecord>> {
    info!(
        company_code = input.company_code,
        pipeline = variant.name(),
        datasets = input.datasets.len(),
        "pipeline_processing_started"
    );

    let records = match variant {
        PipelineVariant::SingleActivity => single_activity(input),
        PipelineVariant::MixedActivity => mixed_activity(input),
        PipelineVariant::MixedActivityWithExternalCosts => mixed_activity_with_external_costs(input),
        PipelineVariant::ManualErosion => manual_erosion(input),
    }?;

    info!(
        company_code = input.company_code,
        pipeline = variant.name(),
        rows = records.len(),
        "pipeline_processing_completed"
    );
    Ok(records)
}

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Compare a company's emitted totals with the input they were derived from.
///
/// Manual erosion reads only the grand-total dataset, so that dataset is its
/// input; every other variant accounts for all filtered rows.
pub fn reconcile(
    variant: PipelineVariant,
    input: &CompanyInput<'_>,
    records: &[SegmentedRecord],
) -> Result<TotalsCheck> {
    let input_total = match variant {
        PipelineVariant::ManualErosion => match input.grand_total_dataset() {
            Some(dataset) => dataset.total(),
            None => Some(Decimal::ZERO),
        },
        _ => input.input_total(),
    };

    let check = TotalsCheck {
        company_code: input.company_code.to_string(),
        input_total: input_total.ok_or_else(|| input.overflow())?,
        gross_total: total_gross(records).ok_or_else(|| input.overflow())?,
        adjusted_total: total_adjusted(records).ok_or_else(|| input.overflow())?,
    };

    if !check.is_balanced() {
        warn!(
            company_code = input.company_code,
            pipeline = variant.name(),
            input_total = %check.input_total,
            gross_total = %check.gross_total,
            adjusted_total = %check.adjusted_total,
            "totals_mismatch"
        );
    }
    Ok(check)
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// (period, business unit)
pub(crate) type GroupKey = (String, Option<String>);

/// Sum amounts per (period, business unit); BTreeMap keeps output order stable
pub(crate) fn sum_by_period_and_unit<'a, I>(
    input: &CompanyInput<'_>,
    items: I,
) -> Result<BTreeMap<GroupKey, Decimal>>
where
    I: IntoIterator<Item = &'a FinancialLineItem>,
{
    let mut groups: BTreeMap<GroupKey, Decimal> = BTreeMap::new();
    for item in items {
        let total = groups
            .entry((item.period.clone(), item.business_unit.clone()))
            .or_insert(Decimal::ZERO);
        *total = total.checked_add(item.amount).ok_or_else(|| input.overflow())?;
    }
    debug!(groups = groups.len(), "line_items_grouped");
    Ok(groups)
}

/// Sum amounts per period only
pub(crate) fn sum_by_period<'a, I>(input: &CompanyInput<'_>, items: I) -> Result<BTreeMap<String, Decimal>>
where
    I: IntoIterator<Item = &'a FinancialLineItem>,
{
    let mut groups: BTreeMap<String, Decimal> = BTreeMap::new();
    for item in items {
        let total = groups.entry(item.period.clone()).or_insert(Decimal::ZERO);
        *total = total.checked_add(item.amount).ok_or_else(|| input.overflow())?;
    }
    Ok(groups)
}

/// Labels shared by every record a pipeline emits for one company
pub(crate) struct RecordFactory<'a> {
    pub company_code: &'a str,
    pub variant: PipelineVariant,
}

impl<'a> RecordFactory<'a> {
    pub fn new(company_code: &'a str, variant: PipelineVariant) -> Self {
        RecordFactory { company_code, variant }
    }

    /// Record whose adjusted amount equals its gross amount
    pub fn unadjusted(
        &self,
        key: &GroupKey,
        labels: (Segment, Activity, Category),
        amount: Decimal,
    ) -> SegmentedRecord {
        self.shifted(key, labels, amount, amount)
    }

    pub fn shifted(
        &self,
        key: &GroupKey,
        labels: (Segment, Activity, Category),
        gross: Decimal,
        adjusted: Decimal,
    ) -> SegmentedRecord {
        let (segment, activity, category) = labels;
        SegmentedRecord {
            company_code: self.company_code.to_string(),
            period: key.0.clone(),
            segment,
            activity,
            category,
            business_unit: key.1.clone(),
            gross_amount: gross,
            adjusted_amount: adjusted,
            erosion_applied: false,
            pipeline_variant: self.variant,
        }
    }
}
