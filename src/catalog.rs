// Source catalog and scope filtering
// Resolves declared data sources per company; no I/O happens here.

use crate::error::{Result, SegmentationError};
use crate::model::{normalize_code, FinancialLineItem};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

// ============================================================================
// SOURCE DESCRIPTOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceSpec {
    /// Logical dataset name, unique across the catalog
    pub name: String,

    /// File the dataset is read from
    pub path: PathBuf,

    /// Sheet identifier inside a workbook (ignored for CSV)
    #[serde(default = "default_sheet")]
    pub sheet: String,

    /// Account codes in scope. A source with a scope list is an isolated source.
    #[serde(default, deserialize_with = "deserialize_scope")]
    pub scope: Option<Vec<String>>,

    /// Owning company; `None` means the source applies to every company
    #[serde(default)]
    pub company_code: Option<String>,
}

fn default_sheet() -> String {
    "Sheet1".to_string()
}

/// Account codes arrive as strings or bare numbers depending on who wrote the config
#[derive(Deserialize)]
#[serde(untagged)]
enum AccountCode {
    Text(String),
    Number(u64),
}

fn deserialize_scope<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let codes: Option<Vec<AccountCode>> = Option::deserialize(deserializer)?;
    Ok(codes.map(|codes| {
        codes
            .into_iter()
            .map(|code| match code {
                AccountCode::Text(text) => text.trim().to_string(),
                AccountCode::Number(number) => number.to_string(),
            })
            .collect()
    }))
}

impl DataSourceSpec {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        DataSourceSpec {
            name: name.to_string(),
            path: path.into(),
            sheet: default_sheet(),
            scope: None,
            company_code: None,
        }
    }

    /// Builder pattern: restrict to a set of account codes
    pub fn with_scope<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(accounts.into_iter().map(Into::into).collect());
        self
    }

    /// Builder pattern: make this source specific to one company
    pub fn owned_by(mut self, company_code: &str) -> Self {
        self.company_code = Some(normalize_code(company_code));
        self
    }

    /// Builder pattern: set sheet identifier
    pub fn with_sheet(mut self, sheet: &str) -> Self {
        self.sheet = sheet.to_string();
        self
    }

    pub fn is_global(&self) -> bool {
        self.company_code.is_none()
    }

    pub fn is_isolated(&self) -> bool {
        self.scope.is_some()
    }

    pub fn applies_to(&self, company_code: &str) -> bool {
        match &self.company_code {
            None => true,
            Some(owner) => owner.eq_ignore_ascii_case(company_code),
        }
    }
}

// ============================================================================
// SOURCE CATALOG
// ============================================================================

#[derive(Debug, Clone)]
pub struct SourceCatalog {
    sources: Vec<DataSourceSpec>,
    grand_total: String,
}

impl SourceCatalog {
    /// Build a catalog. Source names must be unique and the grand-total source must
    /// be declared and global.
    pub fn new(sources: Vec<DataSourceSpec>, grand_total: &str) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(sources.len());

        for mut spec in sources {
            if !seen.insert(spec.name.clone()) {
                return Err(SegmentationError::DuplicateSource { name: spec.name });
            }
            spec.company_code = spec.company_code.as_deref().map(normalize_code);
            normalized.push(spec);
        }

        let catalog = SourceCatalog {
            sources: normalized,
            grand_total: grand_total.to_string(),
        };

        if let Some(owner) = &catalog.get(grand_total)?.company_code {
            return Err(SegmentationError::GrandTotalNotGlobal {
                name: grand_total.to_string(),
                company_code: owner.clone(),
            });
        }

        Ok(catalog)
    }

    /// Name of the designated grand-total dataset
    pub fn grand_total(&self) -> &str {
        &self.grand_total
    }

    pub fn get(&self, name: &str) -> Result<&DataSourceSpec> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SegmentationError::UnknownSource {
                name: name.to_string(),
            })
    }

    /// Sources applying to every company, in declaration order
    pub fn global_sources(&self) -> impl Iterator<Item = &DataSourceSpec> {
        self.sources.iter().filter(|s| s.is_global())
    }

    /// All sources applicable to a company: globals plus the ones it owns
    pub fn resolve(&self, company_code: &str) -> Vec<&DataSourceSpec> {
        self.sources
            .iter()
            .filter(|s| s.applies_to(company_code))
            .collect()
    }

    /// Every company named as an owner of some source
    pub fn owning_companies(&self) -> BTreeSet<String> {
        self.sources
            .iter()
            .filter_map(|s| s.company_code.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

// ============================================================================
// SCOPE FILTER
// ============================================================================

/// Keep rows whose account code is in scope; pass everything through when no scope is declared.
/// Order is preserved and nothing is ever added.
pub fn filter_scope(items: &[FinancialLineItem], scope: Option<&[String]>) -> Vec<FinancialLineItem> {
    match scope {
        None => items.to_vec(),
        Some(accounts) => {
            let accounts: HashSet<&str> = accounts.iter().map(|a| a.trim()).collect();
            items
                .iter()
                .filter(|item| accounts.contains(item.account_code.as_str()))
                .cloned()
                .collect()
        }
    }
}

/// Keep rows belonging to one company, preserving order
pub fn filter_company(items: &[FinancialLineItem], company_code: &str) -> Vec<FinancialLineItem> {
    items
        .iter()
        .filter(|item| item.company_code.eq_ignore_ascii_case(company_code))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn item(company: &str, account: &str, amount: i64) -> FinancialLineItem {
        FinancialLineItem::new(company, account, None, "2024012", Decimal::new(amount, 0), "test")
    }

    fn catalog() -> SourceCatalog {
        SourceCatalog::new(
            vec![
                DataSourceSpec::new("grand_total", "gt.csv"),
                DataSourceSpec::new("royalties", "roy.csv").with_scope(["7100", "7110"]),
                DataSourceSpec::new("rnd_fr09", "rnd.csv").with_scope(["6000"]).owned_by("fr09"),
            ],
            "grand_total",
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_globals_plus_owned() {
        let catalog = catalog();

        let names: Vec<&str> = catalog.resolve("FR09").iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["grand_total", "royalties", "rnd_fr09"]);

        let names: Vec<&str> = catalog.resolve("AB01").iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["grand_total", "royalties"]);
    }

    #[test]
    fn test_owner_is_normalized() {
        let catalog = catalog();
        let owned: Vec<&str> = catalog
            .resolve("fr09")
            .iter()
            .filter(|s| !s.is_global())
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(owned, vec!["rnd_fr09"]);
        assert!(catalog.owning_companies().contains("FR09"));
    }

    #[test]
    fn test_unknown_grand_total_rejected() {
        let err = SourceCatalog::new(vec![DataSourceSpec::new("royalties", "roy.csv")], "grand_total")
            .unwrap_err();
        assert_eq!(
            err,
            SegmentationError::UnknownSource {
                name: "grand_total".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let err = SourceCatalog::new(
            vec![
                DataSourceSpec::new("grand_total", "a.csv"),
                DataSourceSpec::new("grand_total", "b.csv"),
            ],
            "grand_total",
        )
        .unwrap_err();
        assert!(matches!(err, SegmentationError::DuplicateSource { .. }));
    }

    #[test]
    fn test_get_unknown_source() {
        let catalog = catalog();
        assert!(catalog.get("missing").is_err());
        assert!(catalog.get("royalties").unwrap().is_isolated());
        assert!(!catalog.get("grand_total").unwrap().is_isolated());
    }

    #[test]
    fn test_owned_grand_total_rejected() {
        let err = SourceCatalog::new(
            vec![
                DataSourceSpec::new("grand_total", "gt.csv").owned_by("acme"),
                DataSourceSpec::new("royalties", "roy.csv").with_scope(["7100"]),
            ],
            "grand_total",
        )
        .unwrap_err();

        assert_eq!(
            err,
            SegmentationError::GrandTotalNotGlobal {
                name: "grand_total".to_string(),
                company_code: "ACME".to_string()
            }
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_scope_accepts_numeric_account_codes() {
        let spec: DataSourceSpec = serde_json::from_str(
            r#"{ "name": "royalties", "path": "roy.csv", "scope": [7100, "7110", " 7120 "] }"#,
        )
        .unwrap();
        assert_eq!(
            spec.scope,
            Some(vec!["7100".to_string(), "7110".to_string(), "7120".to_string()])
        );

        let spec: DataSourceSpec = serde_json::from_str(r#"{ "name": "gt", "path": "gt.csv" }"#).unwrap();
        assert_eq!(spec.scope, None);

        let spec: DataSourceSpec =
            serde_json::from_str(r#"{ "name": "gt", "path": "gt.csv", "scope": null }"#).unwrap();
        assert_eq!(spec.scope, None);
    }

    #[test]
    fn test_filter_scope_preserves_order() {
        let items = vec![item("AB01", "7110", 1), item("AB01", "4000", 2), item("AB01", "7100", 3)];
        let scope = vec!["7100".to_string(), "7110".to_string()];

        let filtered = filter_scope(&items, Some(scope.as_slice()));
        let amounts: Vec<Decimal> = filtered.iter().map(|i| i.amount).collect();
        assert_eq!(amounts, vec![Decimal::new(1, 0), Decimal::new(3, 0)]);
    }

    #[test]
    fn test_filter_scope_without_list_passes_all() {
        let items = vec![item("AB01", "7110", 1), item("AB01", "4000", 2)];
        assert_eq!(filter_scope(&items, None), items);
    }

    #[test]
    fn test_filter_company() {
        let items = vec![item("AB01", "4000", 1), item("FR09", "4000", 2), item("ab01", "4100", 3)];
        let filtered = filter_company(&items, "AB01");
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|i| i.company_code == "AB01"));
    }
}
