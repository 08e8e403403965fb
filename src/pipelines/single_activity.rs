// Single economic activity: everything the company does falls under its one rule

use super::{sum_by_period_and_unit, CompanyInput, RecordFactory};
use crate::error::Result;
use crate::model::{PipelineVariant, SegmentedRecord};

/// Tag every line item with the company's segment rule. Amounts are not adjusted.
///
/// Rows are summed per (period, business unit), so a company whose rows span
/// several business units gets one record per unit and period, all carrying the
/// same labels. Rows without a business unit form their own group.
pub fn single_activity(input: &CompanyInput<'_>) -> Result<Vec<SegmentedRecord>> {
    let rule = input.require_rule()?;

    let factory = RecordFactory::new(input.company_code, PipelineVariant::SingleActivity);
    let labels = (rule.segment, rule.activity, rule.category);

    Ok(sum_by_period_and_unit(input, input.all_items())?
        .iter()
        .map(|(key, amount)| factory.unadjusted(key, labels, *amount))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::CompanyDataset;
    use super::*;
    use crate::error::SegmentationError;
    use crate::model::{total_adjusted, Activity, Category, Segment};
    use rust_decimal::Decimal;

    #[test]
    fn test_single_record_per_period() {
        // two accounts totaling 1000 in one period
        let datasets = vec![CompanyDataset::new(
            "grand_total",
            false,
            vec![
                item("AB01", "4000", None, "2024012", 600),
                item("AB01", "4100", None, "2024012", 400),
            ],
        )];
        let rule = routine_rule("AB01");

        let records = single_activity(&input("AB01", &datasets, None, Some(&rule))).unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.adjusted_amount, Decimal::new(1000, 0));
        assert_eq!(record.gross_amount, Decimal::new(1000, 0));
        assert_eq!(record.activity, Activity::Routine);
        assert_eq!(record.segment, Segment::Distribution);
        assert_eq!(record.category, Category::Distribution);
        assert!(!record.erosion_applied);
    }

    #[test]
    fn test_conservation_across_datasets_and_periods() {
        let datasets = vec![
            CompanyDataset::new(
                "grand_total",
                false,
                vec![
                    item("AB01", "4000", Some("BU1"), "2024011", 250),
                    item("AB01", "4000", Some("BU2"), "2024012", -75),
                ],
            ),
            CompanyDataset::new("royalties", true, vec![item("AB01", "7100", None, "2024012", 30)]),
        ];
        let rule = routine_rule("AB01");
        let input = input("AB01", &datasets, None, Some(&rule));

        let records = single_activity(&input).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(total_adjusted(&records), input.input_total());
        assert!(records.iter().all(|r| r.gross_amount == r.adjusted_amount));
    }

    #[test]
    fn test_missing_rule_fails() {
        let datasets = vec![CompanyDataset::new(
            "grand_total",
            false,
            vec![item("AB01", "4000", None, "2024012", 1)],
        )];

        let err = single_activity(&input("AB01", &datasets, None, None)).unwrap_err();
        assert!(matches!(err, SegmentationError::SegmentMappingNotFound { .. }));
    }

    #[test]
    fn test_no_items_no_records() {
        let datasets = vec![CompanyDataset::new("grand_total", false, vec![])];
        let rule = routine_rule("AB01");
        let records = single_activity(&input("AB01", &datasets, None, Some(&rule))).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_one_record_per_business_unit() {
        let datasets = vec![CompanyDataset::new(
            "grand_total",
            false,
            vec![
                item("AB01", "4000", Some("BU1"), "2024012", 600),
                item("AB01", "4100", Some("BU2"), "2024012", 300),
                item("AB01", "4200", Some("BU1"), "2024012", 50),
                item("AB01", "4300", None, "2024012", 50),
            ],
        )];
        let rule = routine_rule("AB01");

        let records = single_activity(&input("AB01", &datasets, None, Some(&rule))).unwrap();

        let groups: Vec<(Option<&str>, Decimal)> = records
            .iter()
            .map(|r| (r.business_unit.as_deref(), r.adjusted_amount))
            .collect();
        assert_eq!(
            groups,
            vec![
                (None, Decimal::new(50, 0)),
                (Some("BU1"), Decimal::new(650, 0)),
                (Some("BU2"), Decimal::new(300, 0)),
            ]
        );
        assert!(records.iter().all(|r| r.segment == Segment::Distribution && r.period == "2024012"));
    }

    #[test]
    fn test_overflowing_amounts_fail_the_company() {
        let mut huge = item("AB01", "4000", None, "2024012", 0);
        huge.amount = Decimal::MAX;
        let datasets = vec![CompanyDataset::new("grand_total", false, vec![huge.clone(), huge])];
        let rule = routine_rule("AB01");

        let err = single_activity(&input("AB01", &datasets, None, Some(&rule))).unwrap_err();
        assert!(matches!(err, SegmentationError::AmountOverflow { .. }));
    }
}
