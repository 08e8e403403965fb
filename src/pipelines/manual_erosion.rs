// Manual EBIT erosion
// A configured share of the grand-total baseline is moved to the eroded activity.

use super::{sum_by_period, CompanyInput, RecordFactory};
use crate::config::validate_erosion_ratio;
use crate::error::{Result, SegmentationError};
use crate::model::{Activity, Category, PipelineVariant, Segment, SegmentedRecord};
use rust_decimal::Decimal;
use tracing::debug;

/// Two records per period: residual keeps `B * (1 - r)`, eroded receives `B * r`.
///
/// Segment and category follow the company's rule when one exists; otherwise the
/// records are filed under the unassigned segment in the distribution category.
pub fn manual_erosion(input: &CompanyInput<'_>) -> Result<Vec<SegmentedRecord>> {
    let ratio = input
        .config
        .and_then(|c| c.target_ebit_erosion)
        .ok_or_else(|| SegmentationError::ErosionConfigMissing {
            company_code: input.company_code.to_string(),
        })?;
    let ratio = validate_erosion_ratio(input.company_code, ratio)?;

    let (segment, category) = match input.rule {
        Some(rule) => (rule.segment, rule.category),
        None => (Segment::Unassigned, Category::Distribution),
    };

    let grand_total = input
        .grand_total_dataset()
        .ok_or_else(|| SegmentationError::MissingGrandTotal {
            company_code: input.company_code.to_string(),
            dataset: input.grand_total.to_string(),
        })?;

    let factory = RecordFactory::new(input.company_code, PipelineVariant::ManualErosion);
    let mut records = Vec::new();

    for (period, baseline) in sum_by_period(input, &grand_total.items)? {
        let eroded = baseline * ratio;
        let residual = baseline - eroded;
        debug!(
            company_code = input.company_code,
            period = %period,
            baseline = %baseline,
            eroded = %eroded,
            "ebit_erosion_applied"
        );

        let key = (period, None);
        let mut residual_record =
            factory.shifted(&key, (segment, Activity::Residual, category), baseline, residual);
        let mut eroded_record = factory.shifted(&key, (segment, Activity::Eroded, category), Decimal::ZERO, eroded);
        residual_record.erosion_applied = true;
        eroded_record.erosion_applied = true;

        records.push(residual_record);
        records.push(eroded_record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::CompanyDataset;
    use super::*;
    use crate::config::CompanyConfig;
    use crate::model::total_adjusted;
    use std::str::FromStr;

    fn grand_total(amounts: &[(&str, i64)]) -> Vec<CompanyDataset> {
        vec![
            CompanyDataset::new(
                "grand_total",
                false,
                amounts
                    .iter()
                    .map(|(period, amount)| item("ACME", "4000", None, period, *amount))
                    .collect(),
            ),
            // isolated data is ignored by this pipeline
            CompanyDataset::new("royalties", true, vec![item("ACME", "7100", None, "2024012", 999)]),
        ]
    }

    #[test]
    fn test_erosion_split() {
        let datasets = grand_total(&[("2024012", 150_000), ("2024012", 50_000)]);
        let config = CompanyConfig::new("ACME").with_erosion(Decimal::from_str("0.05").unwrap());

        let records = manual_erosion(&input("ACME", &datasets, Some(&config), None)).unwrap();

        assert_eq!(records.len(), 2);
        let residual = &records[0];
        let eroded = &records[1];

        assert_eq!(residual.activity, Activity::Residual);
        assert_eq!(residual.adjusted_amount, Decimal::new(190_000, 0));
        assert_eq!(eroded.activity, Activity::Eroded);
        assert_eq!(eroded.adjusted_amount, Decimal::new(10_000, 0));
        assert!(residual.erosion_applied && eroded.erosion_applied);
        assert_eq!(total_adjusted(&records), Some(Decimal::new(200_000, 0)));
        assert_eq!(residual.segment, Segment::Unassigned);
    }

    #[test]
    fn test_erosion_per_period_with_awkward_ratio() {
        let datasets = grand_total(&[("2024011", 1_000), ("2024012", 333)]);
        let ratio = Decimal::from_str("0.0333").unwrap();
        let config = CompanyConfig::new("ACME").with_erosion(ratio);
        let rule = routine_rule("ACME");

        let records = manual_erosion(&input("ACME", &datasets, Some(&config), Some(&rule))).unwrap();

        assert_eq!(records.len(), 4);
        for pair in records.chunks(2) {
            let baseline = pair[0].gross_amount;
            assert_eq!(pair[0].adjusted_amount + pair[1].adjusted_amount, baseline);
            assert_eq!(pair[1].adjusted_amount, baseline * ratio);
            assert_eq!(pair[0].adjusted_amount, baseline * (Decimal::ONE - ratio));
            assert_eq!(pair[0].segment, Segment::Distribution);
        }
    }

    #[test]
    fn test_missing_erosion_config() {
        let datasets = grand_total(&[("2024012", 100)]);

        let err = manual_erosion(&input("ACME", &datasets, None, None)).unwrap_err();
        assert!(matches!(err, SegmentationError::ErosionConfigMissing { .. }));

        let config = CompanyConfig::new("ACME");
        let err = manual_erosion(&input("ACME", &datasets, Some(&config), None)).unwrap_err();
        assert!(matches!(err, SegmentationError::ErosionConfigMissing { .. }));
    }

    #[test]
    fn test_invalid_erosion_ratio() {
        let datasets = grand_total(&[("2024012", 100)]);
        let config = CompanyConfig::new("ACME").with_erosion(Decimal::from_str("1.2").unwrap());

        let err = manual_erosion(&input("ACME", &datasets, Some(&config), None)).unwrap_err();
        assert_eq!(
            err,
            SegmentationError::InvalidErosionRatio {
                company_code: "ACME".to_string(),
                ratio: "1.2".to_string()
            }
        );
    }

    #[test]
    fn test_full_and_zero_erosion() {
        let datasets = grand_total(&[("2024012", 800)]);

        let config = CompanyConfig::new("ACME").with_erosion(Decimal::ONE);
        let records = manual_erosion(&input("ACME", &datasets, Some(&config), None)).unwrap();
        assert_eq!(records[0].adjusted_amount, Decimal::ZERO);
        assert_eq!(records[1].adjusted_amount, Decimal::new(800, 0));

        let config = CompanyConfig::new("ACME").with_erosion(Decimal::ZERO);
        let records = manual_erosion(&input("ACME", &datasets, Some(&config), None)).unwrap();
        assert_eq!(records[0].adjusted_amount, Decimal::new(800, 0));
        assert_eq!(records[1].adjusted_amount, Decimal::ZERO);
    }

    #[test]
    fn test_missing_grand_total_dataset_fails_the_company() {
        let datasets = vec![CompanyDataset::new(
            "royalties",
            true,
            vec![item("ACME", "7100", None, "2024012", 999)],
        )];
        let config = CompanyConfig::new("ACME").with_erosion(Decimal::new(5, 2));

        let err = manual_erosion(&input("ACME", &datasets, Some(&config), None)).unwrap_err();
        assert_eq!(
            err,
            SegmentationError::MissingGrandTotal {
                company_code: "ACME".to_string(),
                dataset: "grand_total".to_string(),
            }
        );
        assert!(!err.is_fatal());
    }
}
