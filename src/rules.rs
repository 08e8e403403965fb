// Segment Rules - Rules as Data
// One rule per company: which segment, activity and category its activity belongs to

use crate::error::{Result, SegmentationError};
use crate::model::{normalize_code, Activity, Category, Segment};
use anyhow::Context as AnyhowContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRule {
    /// Company the rule classifies (upper-cased)
    pub company_code: String,

    pub segment: Segment,

    /// Primary activity of the company
    pub activity: Activity,

    pub category: Category,
}

impl SegmentRule {
    pub fn new(company_code: &str, segment: Segment, activity: Activity, category: Category) -> Self {
        SegmentRule {
            company_code: normalize_code(company_code),
            segment,
            activity,
            category,
        }
    }
}

/// Row shape of the rules CSV. Extra columns are ignored.
#[derive(Debug, Deserialize)]
struct RuleRow {
    company_code: String,
    segment: String,
    activity: String,
    category: String,
}

impl RuleRow {
    fn into_rule(self) -> anyhow::Result<SegmentRule> {
        let segment = self.segment.parse::<Segment>().map_err(anyhow::Error::msg)?;
        let activity = self.activity.parse::<Activity>().map_err(anyhow::Error::msg)?;
        let category = self.category.parse::<Category>().map_err(anyhow::Error::msg)?;
        Ok(SegmentRule::new(&self.company_code, segment, activity, category))
    }
}

// ============================================================================
// SEGMENT MAPPING TABLE
// ============================================================================

/// Read-only lookup from company code to its segment rule.
#[derive(Debug, Clone, Default)]
pub struct SegmentMappingTable {
    rules: BTreeMap<String, SegmentRule>,
}

impl SegmentMappingTable {
    /// Create an empty table
    pub fn new() -> Self {
        SegmentMappingTable {
            rules: BTreeMap::new(),
        }
    }

    /// Build from a list of rules. A company appearing twice is a configuration error.
    pub fn from_rules(rules: Vec<SegmentRule>) -> Result<Self> {
        let mut table = BTreeMap::new();

        for mut rule in rules {
            rule.company_code = normalize_code(&rule.company_code);
            if table.contains_key(&rule.company_code) {
                return Err(SegmentationError::DuplicateSegmentRule {
                    company_code: rule.company_code,
                });
            }
            table.insert(rule.company_code.clone(), rule);
        }

        Ok(SegmentMappingTable { rules: table })
    }

    /// Parse rules from CSV with columns company_code, segment, activity, category
    pub fn read_csv<R: Read>(reader: R) -> anyhow::Result<Vec<SegmentRule>> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut rules = Vec::new();

        for (line, result) in rdr.deserialize::<RuleRow>().enumerate() {
            let row = result.with_context(|| format!("Failed to deserialize rule on row {}", line + 1))?;
            let rule = row
                .into_rule()
                .with_context(|| format!("Invalid rule on row {}", line + 1))?;
            rules.push(rule);
        }

        Ok(rules)
    }

    /// Load rules from a CSV file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

        // Spreadsheet exports often start with a UTF-8 BOM
        let mut content = String::new();
        std::io::BufReader::new(file)
            .read_to_string(&mut content)
            .context("Failed to read rules CSV")?;
        let content = content.trim_start_matches('\u{feff}');

        let rules = Self::read_csv(content.as_bytes())?;
        Ok(Self::from_rules(rules)?)
    }

    pub fn lookup(&self, company_code: &str) -> Option<&SegmentRule> {
        self.rules.get(&normalize_code(company_code))
    }

    /// Get number of rules loaded
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
