// Run configuration
// Read once per run from JSON; everything built from it is read-only afterwards.

use crate::catalog::{DataSourceSpec, SourceCatalog};
use crate::error::{Result, SegmentationError};
use crate::model::{normalize_code, PipelineVariant};
use anyhow::Context as AnyhowContext;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// COMPANY CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyConfig {
    pub company_code: String,

    /// Business units whose shared-service costs are relevant to the company.
    /// Carried for reporting; no pipeline reallocates on it.
    #[serde(default)]
    pub shared_costs_business_units: Option<BTreeSet<String>>,

    /// Business units reallocated to the external cost category
    #[serde(default)]
    pub external_costs_business_units: Option<BTreeSet<String>>,

    /// Fraction of the baseline moved to the eroded activity, in [0, 1]
    #[serde(default)]
    pub target_ebit_erosion: Option<Decimal>,
}

impl CompanyConfig {
    pub fn new(company_code: &str) -> Self {
        CompanyConfig {
            company_code: normalize_code(company_code),
            shared_costs_business_units: None,
            external_costs_business_units: None,
            target_ebit_erosion: None,
        }
    }

    /// Builder pattern: external cost business units
    pub fn with_external_costs<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.external_costs_business_units =
            Some(units.into_iter().map(|u| normalize_code(u.as_ref())).collect());
        self
    }

    /// Builder pattern: target EBIT erosion ratio
    pub fn with_erosion(mut self, ratio: Decimal) -> Self {
        self.target_ebit_erosion = Some(ratio);
        self
    }

    fn normalize(mut self) -> Self {
        self.company_code = normalize_code(&self.company_code);
        let upper = |set: Option<BTreeSet<String>>| {
            set.map(|s| s.iter().map(|u| normalize_code(u)).collect::<BTreeSet<_>>())
        };
        self.shared_costs_business_units = upper(self.shared_costs_business_units);
        self.external_costs_business_units = upper(self.external_costs_business_units);
        self
    }
}

/// Company configs keyed by upper-cased company code
#[derive(Debug, Clone, Default)]
pub struct CompanyConfigs {
    configs: BTreeMap<String, CompanyConfig>,
}

impl CompanyConfigs {
    /// Later entries for the same company replace earlier ones
    pub fn new(configs: Vec<CompanyConfig>) -> Self {
        let configs = configs
            .into_iter()
            .map(CompanyConfig::normalize)
            .map(|c| (c.company_code.clone(), c))
            .collect();
        CompanyConfigs { configs }
    }

    pub fn get(&self, company_code: &str) -> Option<&CompanyConfig> {
        self.configs.get(&normalize_code(company_code))
    }

    pub fn company_codes(&self) -> impl Iterator<Item = &String> {
        self.configs.keys()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

// ============================================================================
// PIPELINE + SOURCES CONFIG
// ============================================================================

/// Which companies run which pipeline (raw form, validated by `PipelineAssignment`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub single_activity: Vec<String>,
    #[serde(default)]
    pub mixed_activity: Vec<String>,
    #[serde(default)]
    pub mixed_activity_with_external_costs: Vec<String>,
    #[serde(default)]
    pub manual_erosion_entities: Vec<String>,
}

impl PipelineConfig {
    pub fn companies(&self, variant: PipelineVariant) -> &[String] {
        match variant {
            PipelineVariant::SingleActivity => &self.single_activity,
            PipelineVariant::MixedActivity => &self.mixed_activity,
            PipelineVariant::MixedActivityWithExternalCosts => &self.mixed_activity_with_external_costs,
            PipelineVariant::ManualErosion => &self.manual_erosion_entities,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourcesConfig {
    /// Name of the grand-total source
    #[serde(default = "default_grand_total")]
    pub grand_total: String,
    pub sources: Vec<DataSourceSpec>,
}

fn default_grand_total() -> String {
    "grand_total".to_string()
}

impl DataSourcesConfig {
    pub fn catalog(&self) -> Result<SourceCatalog> {
        SourceCatalog::new(self.sources.clone(), &self.grand_total)
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Rules table (CSV)
    #[serde(default = "default_segments_path")]
    pub segments_path: PathBuf,

    pub data_sources: DataSourcesConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub company_configs: Vec<CompanyConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./local/app.db")
}

fn default_segments_path() -> PathBuf {
    PathBuf::from("segments.csv")
}

impl AppConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_json::from_str(json).context("Failed to parse config JSON")?;
        Ok(config)
    }

    /// Load from a JSON file; relative paths are resolved against the file's directory
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config = Self::from_json(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        join(&mut self.database_path);
        join(&mut self.segments_path);
        for source in &mut self.data_sources.sources {
            join(&mut source.path);
        }
    }

    pub fn company_configs(&self) -> CompanyConfigs {
        CompanyConfigs::new(self.company_configs.clone())
    }

    /// Debug flag forces debug level, otherwise the configured level
    pub fn effective_log_level(&self, debug: bool) -> String {
        if debug || self.debug {
            "debug".to_string()
        } else {
            self.log_level.clone()
        }
    }
}

/// Ratio must lie in [0, 1]
pub fn validate_erosion_ratio(company_code: &str, ratio: Decimal) -> Result<Decimal> {
    if ratio < Decimal::ZERO || ratio > Decimal::ONE {
        return Err(SegmentationError::InvalidErosionRatio {
            company_code: normalize_code(company_code),
            ratio: ratio.to_string(),
        });
    }
    Ok(ratio)
}
