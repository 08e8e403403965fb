// Mixed activity pipelines
//
// Isolated sources (royalties, shared-service charges, R&D services) carry the
// counterpart of the company's primary activity; everything else stays under the
// primary rule. The external-cost variant then moves configured business units
// out of the isolated activity into the external cost category.

use super::{sum_by_period_and_unit, CompanyInput, GroupKey, RecordFactory};
use crate::error::{Result, SegmentationError};
use crate::model::{Category, PipelineVariant, SegmentedRecord};
use crate::rules::SegmentRule;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Grouped amounts of one company, split by provenance
struct ActivitySplit<'a> {
    rule: &'a SegmentRule,
    pooled: BTreeMap<GroupKey, Decimal>,
    isolated: BTreeMap<GroupKey, Decimal>,
}

fn split<'a>(input: &CompanyInput<'a>) -> Result<ActivitySplit<'a>> {
    let rule = input.require_rule()?;

    if input.isolated_items().next().is_none() {
        return Err(SegmentationError::MissingIsolatedSource {
            company_code: input.company_code.to_string(),
        });
    }

    let pooled = sum_by_period_and_unit(input, input.pooled_items())?;
    let isolated = sum_by_period_and_unit(input, input.isolated_items())?;
    debug!(
        company_code = input.company_code,
        pooled_groups = pooled.len(),
        isolated_groups = isolated.len(),
        "activity_split_computed"
    );

    Ok(ActivitySplit { rule, pooled, isolated })
}

fn pooled_records(split: &ActivitySplit<'_>, factory: &RecordFactory<'_>) -> Vec<SegmentedRecord> {
    let labels = (split.rule.segment, split.rule.activity, split.rule.category);
    split
        .pooled
        .iter()
        .map(|(key, amount)| factory.unadjusted(key, labels, *amount))
        .collect()
}

/// Isolated sources under the counterpart activity, grand-total pool under the rule
pub fn mixed_activity(input: &CompanyInput<'_>) -> Result<Vec<SegmentedRecord>> {
    let split = split(input)?;
    let factory = RecordFactory::new(input.company_code, PipelineVariant::MixedActivity);
    let isolated_labels = (split.rule.segment, split.rule.activity.counterpart(), split.rule.category);

    let mut records = pooled_records(&split, &factory);
    records.extend(
        split
            .isolated
            .iter()
            .map(|(key, amount)| factory.unadjusted(key, isolated_labels, *amount)),
    );
    Ok(records)
}

/// Mixed split, then isolated amounts of external-cost business units are shifted
/// to the external cost category. Gross and adjusted totals are both conserved.
pub fn mixed_activity_with_external_costs(input: &CompanyInput<'_>) -> Result<Vec<SegmentedRecord>> {
    let external_units: &BTreeSet<String> = input
        .config
        .and_then(|c| c.external_costs_business_units.as_ref())
        .filter(|units| !units.is_empty())
        .ok_or_else(|| SegmentationError::MissingExternalCostConfig {
            company_code: input.company_code.to_string(),
        })?;

    let split = split(input)?;
    let factory = RecordFactory::new(input.company_code, PipelineVariant::MixedActivityWithExternalCosts);
    let rule = split.rule;
    let isolated_labels = (rule.segment, rule.activity.counterpart(), rule.category);
    let external_labels = (rule.segment, rule.activity, Category::ExternalCost);

    let mut records = pooled_records(&split, &factory);
    let mut shifted = Vec::new();

    for (key, amount) in &split.isolated {
        let is_external = key
            .1
            .as_ref()
            .map(|bu| external_units.contains(bu))
            .unwrap_or(false);

        if is_external {
            records.push(factory.shifted(key, isolated_labels, *amount, Decimal::ZERO));
            shifted.push(factory.shifted(key, external_labels, Decimal::ZERO, *amount));
        } else {
            records.push(factory.unadjusted(key, isolated_labels, *amount));
        }
    }

    debug!(
        company_code = input.company_code,
        reallocated_groups = shifted.len(),
        "external_costs_reallocated"
    );
    records.extend(shifted);
    Ok(records)
}
