// Dataset loading
// Boundary between the engine and wherever line items come from.

use crate::catalog::DataSourceSpec;
use crate::model::FinancialLineItem;
use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// LOADER TRAIT
// ============================================================================

/// DatasetLoader - turns a source descriptor into line items.
///
/// Implementations must be shareable across worker threads; the engine calls
/// `load` synchronously and treats any error as belonging to the descriptor.
pub trait DatasetLoader: Send + Sync {
    fn load(&self, spec: &DataSourceSpec) -> Result<Vec<FinancialLineItem>>;

    /// Loader version (for provenance tracking)
    fn version(&self) -> &str {
        "1.0.0"
    }
}

// ============================================================================
// FILE LOADER
// ============================================================================

/// Row shape of a normalized dataset export (CSV or one worksheet)
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "CompanyCode")]
    company_code: String,

    #[serde(alias = "gl_account")]
    account_code: String,

    #[serde(default, alias = "OrgBU")]
    business_unit: Option<String>,

    #[serde(alias = "fiscal_year_period")]
    period: String,

    #[serde(alias = "value_chf")]
    amount: String,
}

/// Reads datasets from CSV exports and from one named worksheet of a workbook.
#[derive(Debug, Clone, Default)]
pub struct FileDatasetLoader;

impl FileDatasetLoader {
    pub fn new() -> Self {
        FileDatasetLoader
    }

    /// Parse CSV content for one source
    pub fn read<R: std::io::Read>(reader: R, source_name: &str) -> Result<Vec<FinancialLineItem>> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut items = Vec::new();

        for (line, result) in rdr.deserialize::<CsvRow>().enumerate() {
            let row = result.with_context(|| format!("Failed to deserialize row {}", line + 1))?;
            let amount = parse_amount(&row.amount)
                .with_context(|| format!("Invalid amount '{}' on row {}", row.amount, line + 1))?;

            items.push(FinancialLineItem::new(
                &row.company_code,
                &row.account_code,
                row.business_unit.as_deref(),
                &row.period,
                amount,
                source_name,
            ));
        }

        Ok(items)
    }

    /// Read one worksheet. The first non-empty row is the header and takes the
    /// same column names as a CSV export.
    pub fn read_workbook(path: &Path, sheet: &str, source_name: &str) -> Result<Vec<FinancialLineItem>> {
        let mut workbook = open_workbook_auto(path)
            .with_context(|| format!("Failed to open workbook: {:?}", path))?;

        if !workbook.sheet_names().iter().any(|name| name == sheet) {
            bail!(
                "Sheet '{}' not found in {:?} (available: {})",
                sheet,
                path,
                workbook.sheet_names().join(", ")
            );
        }

        let range = workbook
            .worksheet_range(sheet)
            .with_context(|| format!("Failed to read sheet '{}' from {:?}", sheet, path))?;

        let rows: Vec<&[Data]> = range.rows().collect();
        Self::read_rows(&rows, source_name)
            .with_context(|| format!("Sheet '{}' of {:?}", sheet, path))
    }

    /// Re-encode worksheet rows as CSV so both formats share one row shape
    fn read_rows(rows: &[&[Data]], source_name: &str) -> Result<Vec<FinancialLineItem>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());

        for (row_idx, row) in rows.iter().enumerate() {
            let cells = row
                .iter()
                .enumerate()
                .map(|(col_idx, cell)| {
                    cell_text(cell).with_context(|| {
                        format!("Unreadable cell at row {}, column {}", row_idx + 1, col_idx + 1)
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            wtr.write_record(&cells)?;
        }

        let buffer = wtr
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to buffer worksheet rows: {}", e.error()))?;
        Self::read(buffer.as_slice(), source_name)
    }
}

/// Render a cell the way it would appear in a CSV export.
/// Whole floats drop the fraction so account codes read `4000`, not `4000.0`.
fn cell_text(cell: &Data) -> Result<String> {
    Ok(match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Data::Float(n) => format!("{}", n),
        Data::Int(n) => n.to_string(),
        Data::Error(e) => bail!("cell error {:?}", e),
        other => other.to_string(),
    })
}

impl DatasetLoader for FileDatasetLoader {
    fn load(&self, spec: &DataSourceSpec) -> Result<Vec<FinancialLineItem>> {
        let extension = spec
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match extension.as_deref() {
            Some("csv") => {
                let file = std::fs::File::open(&spec.path)
                    .with_context(|| format!("Failed to open dataset file: {:?}", spec.path))?;
                Self::read(file, &spec.name)
            }
            Some("xlsx" | "xlsm" | "xlsb" | "xls" | "ods") => {
                Self::read_workbook(&spec.path, &spec.sheet, &spec.name)
            }
            Some(other) => bail!("Unsupported dataset format '.{}' for {:?}", other, spec.path),
            None => bail!("Dataset path has no extension: {:?}", spec.path),
        }
    }
}

/// Parse a signed amount, accepting thousands separators and accounting parentheses
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }

    let (negative, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };

    let cleaned: String = body.chars().filter(|c| *c != ',' && *c != '\'' && *c != ' ').collect();
    let value = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .with_context(|| format!("Not a decimal amount: '{}'", raw))?;

    Ok(if negative { -value } else { value })
}

// ============================================================================
// IN-MEMORY LOADER
// ============================================================================

/// Serves pre-materialized datasets by source name
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    datasets: HashMap<String, Vec<FinancialLineItem>>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        InMemoryLoader {
            datasets: HashMap::new(),
        }
    }

    /// Builder pattern: register a dataset; items are stamped with the source name
    pub fn with_dataset(mut self, name: &str, items: Vec<FinancialLineItem>) -> Self {
        self.insert(name, items);
        self
    }

    pub fn insert(&mut self, name: &str, items: Vec<FinancialLineItem>) {
        let items = items
            .into_iter()
            .map(|mut item| {
                item.source_name = name.to_string();
                item
            })
            .collect();
        self.datasets.insert(name.to_string(), items);
    }
}

impl DatasetLoader for InMemoryLoader {
    fn load(&self, spec: &DataSourceSpec) -> Result<Vec<FinancialLineItem>> {
        match self.datasets.get(&spec.name) {
            Some(items) => Ok(items.clone()),
            None => bail!("No dataset registered for source '{}'", spec.name),
        }
    }
}
