// Shared data model: line items in, segmented records out

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CLASSIFICATION LABELS
// ============================================================================

/// Economic activity a record is classified under.
///
/// `Routine` and `Entrepreneur` come from the rules table; `Residual` and
/// `Eroded` only appear in the output of the manual erosion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Routine,
    Entrepreneur,
    Residual,
    Eroded,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Routine => "routine",
            Activity::Entrepreneur => "entrepreneur",
            Activity::Residual => "residual",
            Activity::Eroded => "eroded",
        }
    }

    /// Activity assigned to isolated sources when this is the company's primary activity
    pub fn counterpart(&self) -> Activity {
        match self {
            Activity::Routine => Activity::Entrepreneur,
            Activity::Entrepreneur => Activity::Routine,
            Activity::Residual => Activity::Eroded,
            Activity::Eroded => Activity::Residual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Segment {
    #[serde(rename = "DIS")]
    Distribution,
    #[serde(rename = "THUB")]
    Transportation,
    #[serde(rename = "OM")]
    OwnManufacturing,
    #[serde(rename = "OTH")]
    Other,
    #[serde(rename = "PPAL")]
    Principal,
    #[serde(rename = "CM")]
    ContractManufacturing,
    #[serde(rename = "OTH BU")]
    Unassigned,
}

impl Segment {
    pub fn code(&self) -> &'static str {
        match self {
            Segment::Distribution => "DIS",
            Segment::Transportation => "THUB",
            Segment::OwnManufacturing => "OM",
            Segment::Other => "OTH",
            Segment::Principal => "PPAL",
            Segment::ContractManufacturing => "CM",
            Segment::Unassigned => "OTH BU",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Distribution,
    OwnManufacturingThirdParty,
    #[serde(rename = "own_manufacturing_ic")]
    OwnManufacturingIC,
    ContractManufacturing,
    /// Target of the external-cost reallocation
    ExternalCost,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Distribution => "distribution",
            Category::OwnManufacturingThirdParty => "own_manufacturing_third_party",
            Category::OwnManufacturingIC => "own_manufacturing_ic",
            Category::ContractManufacturing => "contract_manufacturing",
            Category::ExternalCost => "external_cost",
        }
    }
}

macro_rules! impl_label {
    ($ty:ty, $method:ident, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.$method())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let needle = s.trim();
                [$($variant),+]
                    .into_iter()
                    .find(|v: &$ty| v.$method().eq_ignore_ascii_case(needle))
                    .ok_or_else(|| format!("unknown {}: '{}'", stringify!($ty).to_lowercase(), s))
            }
        }
    };
}

impl_label!(Activity, as_str, [
    Activity::Routine,
    Activity::Entrepreneur,
    Activity::Residual,
    Activity::Eroded,
]);

impl_label!(Segment, code, [
    Segment::Distribution,
    Segment::Transportation,
    Segment::OwnManufacturing,
    Segment::Other,
    Segment::Principal,
    Segment::ContractManufacturing,
    Segment::Unassigned,
]);

impl_label!(Category, as_str, [
    Category::Distribution,
    Category::OwnManufacturingThirdParty,
    Category::OwnManufacturingIC,
    Category::ContractManufacturing,
    Category::ExternalCost,
]);

// ============================================================================
// PIPELINE VARIANT
// ============================================================================

/// The closed set of segmentation pipelines a company can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    SingleActivity,
    MixedActivity,
    MixedActivityWithExternalCosts,
    #[serde(rename = "manual_erosion_entities")]
    ManualErosion,
}

impl PipelineVariant {
    pub const ALL: [PipelineVariant; 4] = [
        PipelineVariant::SingleActivity,
        PipelineVariant::MixedActivity,
        PipelineVariant::MixedActivityWithExternalCosts,
        PipelineVariant::ManualErosion,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineVariant::SingleActivity => "single_activity",
            PipelineVariant::MixedActivity => "mixed_activity",
            PipelineVariant::MixedActivityWithExternalCosts => "mixed_activity_with_external_costs",
            PipelineVariant::ManualErosion => "manual_erosion_entities",
        }
    }
}

impl_label!(PipelineVariant, name, [
    PipelineVariant::SingleActivity,
    PipelineVariant::MixedActivity,
    PipelineVariant::MixedActivityWithExternalCosts,
    PipelineVariant::ManualErosion,
]);

// ============================================================================
// LINE ITEMS (input)
// ============================================================================

/// One row of a loaded dataset. Never mutated after loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialLineItem {
    pub company_code: String,
    pub account_code: String,
    #[serde(default)]
    pub business_unit: Option<String>,
    pub period: String,
    pub amount: Decimal,
    #[serde(default)]
    pub source_name: String,
}

impl FinancialLineItem {
    pub fn new(
        company_code: &str,
        account_code: &str,
        business_unit: Option<&str>,
        period: &str,
        amount: Decimal,
        source_name: &str,
    ) -> Self {
        FinancialLineItem {
            company_code: normalize_code(company_code),
            account_code: account_code.trim().to_string(),
            business_unit: business_unit.map(normalize_code).filter(|bu| !bu.is_empty()),
            period: period.trim().to_string(),
            amount,
            source_name: source_name.to_string(),
        }
    }
}

/// Company codes and business units are compared case-insensitively; store them upper-cased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

// ============================================================================
// SEGMENTED RECORDS (output)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentedRecord {
    pub company_code: String,
    pub period: String,
    pub segment: Segment,
    pub activity: Activity,
    pub category: Category,
    pub business_unit: Option<String>,
    pub gross_amount: Decimal,
    pub adjusted_amount: Decimal,
    pub erosion_applied: bool,
    pub pipeline_variant: PipelineVariant,
}

impl SegmentedRecord {
    /// Canonical one-line form used for hashing and fingerprints
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.company_code,
            self.period,
            self.segment,
            self.activity,
            self.category,
            self.business_unit.as_deref().unwrap_or(""),
            self.gross_amount.normalize(),
            self.adjusted_amount.normalize(),
            self.erosion_applied,
            self.pipeline_variant,
        )
    }
}

/// Overflow-checked sum; `None` when the total leaves the `Decimal` range
pub fn checked_sum<I>(amounts: I) -> Option<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    amounts
        .into_iter()
        .try_fold(Decimal::ZERO, |total, amount| total.checked_add(amount))
}

/// Sum of gross amounts over a slice of records
pub fn total_gross(records: &[SegmentedRecord]) -> Option<Decimal> {
    checked_sum(records.iter().map(|r| r.gross_amount))
}

/// Sum of adjusted amounts over a slice of records
pub fn total_adjusted(records: &[SegmentedRecord]) -> Option<Decimal> {
    checked_sum(records.iter().map(|r| r.adjusted_amount))
}
