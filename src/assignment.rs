// Pipeline assignment
// Partition of company codes into the four pipeline variants, validated eagerly.

use crate::config::{CompanyConfigs, PipelineConfig};
use crate::catalog::SourceCatalog;
use crate::error::{Result, SegmentationError};
use crate::model::{normalize_code, PipelineVariant};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct PipelineAssignment {
    by_company: BTreeMap<String, PipelineVariant>,
}

impl PipelineAssignment {
    /// Build the partition. A company listed under two variants is rejected here,
    /// before any dataset is touched.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let mut seen: BTreeMap<String, Vec<PipelineVariant>> = BTreeMap::new();

        for variant in PipelineVariant::ALL {
            for code in config.companies(variant) {
                let variants = seen.entry(normalize_code(code)).or_default();
                if !variants.contains(&variant) {
                    variants.push(variant);
                }
            }
        }

        let mut by_company = BTreeMap::new();
        for (company_code, variants) in seen {
            if variants.len() > 1 {
                return Err(SegmentationError::AmbiguousAssignment {
                    company_code,
                    variants: variants.iter().map(|v| v.name().to_string()).collect(),
                });
            }
            by_company.insert(company_code, variants[0]);
        }

        debug!(companies = by_company.len(), "pipeline_assignment_built");
        Ok(PipelineAssignment { by_company })
    }

    pub fn assignment_of(&self, company_code: &str) -> Result<PipelineVariant> {
        let code = normalize_code(company_code);
        self.by_company
            .get(&code)
            .copied()
            .ok_or(SegmentationError::UnassignedCompany { company_code: code })
    }

    /// Every assigned company, sorted
    pub fn all_companies(&self) -> Vec<String> {
        self.by_company.keys().cloned().collect()
    }

    pub fn companies_for(&self, variant: PipelineVariant) -> Vec<String> {
        self.by_company
            .iter()
            .filter(|(_, v)| **v == variant)
            .map(|(code, _)| code.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_company.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_company.is_empty()
    }

    /// Every company referenced by the targets, the company configs or a source owner
    /// must be assigned. Checked before any per-company work starts.
    pub fn validate_references(
        &self,
        targets: &[String],
        companies: &CompanyConfigs,
        catalog: &SourceCatalog,
    ) -> Result<()> {
        let mut referenced: BTreeSet<String> = targets.iter().map(|c| normalize_code(c)).collect();
        referenced.extend(companies.company_codes().cloned());
        referenced.extend(catalog.owning_companies());

        for code in &referenced {
            self.assignment_of(code)?;
        }
        Ok(())
    }
}
