// Engine error kinds
// Configuration-integrity errors abort the run; everything else is scoped to one company

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SegmentationError {
    #[error("unknown data source: {name}")]
    UnknownSource { name: String },

    #[error("data source declared more than once: {name}")]
    DuplicateSource { name: String },

    #[error("grand-total source '{name}' must be global but is owned by company {company_code}")]
    GrandTotalNotGlobal { name: String, company_code: String },

    #[error("company {company_code} has more than one segment rule")]
    DuplicateSegmentRule { company_code: String },

    #[error("company {company_code} is not assigned to any pipeline")]
    UnassignedCompany { company_code: String },

    #[error("company {company_code} is assigned to more than one pipeline: {variants:?}")]
    AmbiguousAssignment {
        company_code: String,
        variants: Vec<String>,
    },

    #[error("no segment rule found for company {company_code}")]
    SegmentMappingNotFound { company_code: String },

    #[error("company {company_code} has no rows in any isolated source")]
    MissingIsolatedSource { company_code: String },

    #[error("company {company_code} has no external cost business units configured")]
    MissingExternalCostConfig { company_code: String },

    #[error("company {company_code} has no target EBIT erosion configured")]
    ErosionConfigMissing { company_code: String },

    #[error("company {company_code}: target EBIT erosion {ratio} is outside [0, 1]")]
    InvalidErosionRatio { company_code: String, ratio: String },

    #[error("company {company_code} has no grand-total dataset '{dataset}'")]
    MissingGrandTotal { company_code: String, dataset: String },

    #[error("company {company_code}: amounts overflow the decimal range")]
    AmountOverflow { company_code: String },

    #[error("failed to load source '{source_name}'{}: {message}", company_suffix(.company_code))]
    Load {
        source_name: String,
        company_code: Option<String>,
        message: String,
    },

    #[error("company {company_code} was not processed: run cancelled")]
    Cancelled { company_code: String },

    #[error("sink error: {0}")]
    Sink(String),
}

fn company_suffix(company_code: &Option<String>) -> String {
    match company_code {
        Some(code) => format!(" for company {}", code),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, SegmentationError>;

/// Stable tag for each error variant, used in failure reports and the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownSource,
    DuplicateSource,
    GrandTotalNotGlobal,
    DuplicateSegmentRule,
    UnassignedCompany,
    AmbiguousAssignment,
    SegmentMappingNotFound,
    MissingIsolatedSource,
    MissingExternalCostConfig,
    ErosionConfigMissing,
    InvalidErosionRatio,
    MissingGrandTotal,
    AmountOverflow,
    Load,
    Cancelled,
    Sink,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::UnknownSource => "UnknownSourceError",
            ErrorKind::DuplicateSource => "DuplicateSourceError",
            ErrorKind::GrandTotalNotGlobal => "GrandTotalNotGlobalError",
            ErrorKind::DuplicateSegmentRule => "DuplicateSegmentRuleError",
            ErrorKind::UnassignedCompany => "UnassignedCompanyError",
            ErrorKind::AmbiguousAssignment => "AmbiguousAssignmentError",
            ErrorKind::SegmentMappingNotFound => "SegmentMappingNotFoundError",
            ErrorKind::MissingIsolatedSource => "MissingIsolatedSourceError",
            ErrorKind::MissingExternalCostConfig => "MissingExternalCostConfigError",
            ErrorKind::ErosionConfigMissing => "ErosionConfigMissingError",
            ErrorKind::InvalidErosionRatio => "InvalidErosionRatioError",
            ErrorKind::MissingGrandTotal => "MissingGrandTotalError",
            ErrorKind::AmountOverflow => "AmountOverflowError",
            ErrorKind::Load => "LoadError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::Sink => "SinkError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl SegmentationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SegmentationError::UnknownSource { .. } => ErrorKind::UnknownSource,
            SegmentationError::DuplicateSource { .. } => ErrorKind::DuplicateSource,
            SegmentationError::GrandTotalNotGlobal { .. } => ErrorKind::GrandTotalNotGlobal,
            SegmentationError::DuplicateSegmentRule { .. } => ErrorKind::DuplicateSegmentRule,
            SegmentationError::UnassignedCompany { .. } => ErrorKind::UnassignedCompany,
            SegmentationError::AmbiguousAssignment { .. } => ErrorKind::AmbiguousAssignment,
            SegmentationError::SegmentMappingNotFound { .. } => ErrorKind::SegmentMappingNotFound,
            SegmentationError::MissingIsolatedSource { .. } => ErrorKind::MissingIsolatedSource,
            SegmentationError::MissingExternalCostConfig { .. } => {
                ErrorKind::MissingExternalCostConfig
            }
            SegmentationError::ErosionConfigMissing { .. } => ErrorKind::ErosionConfigMissing,
            SegmentationError::InvalidErosionRatio { .. } => ErrorKind::InvalidErosionRatio,
            SegmentationError::MissingGrandTotal { .. } => ErrorKind::MissingGrandTotal,
            SegmentationError::AmountOverflow { .. } => ErrorKind::AmountOverflow,
            SegmentationError::Load { .. } => ErrorKind::Load,
            SegmentationError::Cancelled { .. } => ErrorKind::Cancelled,
            SegmentationError::Sink(_) => ErrorKind::Sink,
        }
    }

    /// Fatal errors abort the whole run before (or instead of) per-company work.
    ///
    /// A load error is fatal only when the source is global (no company attached).
    pub fn is_fatal(&self) -> bool {
        match self {
            SegmentationError::UnknownSource { .. }
            | SegmentationError::DuplicateSource { .. }
            | SegmentationError::GrandTotalNotGlobal { .. }
            | SegmentationError::DuplicateSegmentRule { .. }
            | SegmentationError::UnassignedCompany { .. }
            | SegmentationError::AmbiguousAssignment { .. }
            | SegmentationError::Sink(_) => true,
            SegmentationError::Load { company_code, .. } => company_code.is_none(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        let err = SegmentationError::AmbiguousAssignment {
            company_code: "AB01".to_string(),
            variants: vec!["single_activity".to_string(), "mixed_activity".to_string()],
        };
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::AmbiguousAssignment);

        let err = SegmentationError::UnassignedCompany {
            company_code: "ZZ99".to_string(),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_company_errors_are_recoverable() {
        let err = SegmentationError::InvalidErosionRatio {
            company_code: "ACME".to_string(),
            ratio: "1.5".to_string(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.kind().name(), "InvalidErosionRatioError");

        let err = SegmentationError::AmountOverflow {
            company_code: "ACME".to_string(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.kind().name(), "AmountOverflowError");

        let err = SegmentationError::MissingGrandTotal {
            company_code: "ACME".to_string(),
            dataset: "grand_total".to_string(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_owned_grand_total_is_fatal() {
        let err = SegmentationError::GrandTotalNotGlobal {
            name: "grand_total".to_string(),
            company_code: "ACME".to_string(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.kind().name(), "GrandTotalNotGlobalError");
    }

    #[test]
    fn test_load_error_scope_decides_fatality() {
        let global = SegmentationError::Load {
            source_name: "grand_total".to_string(),
            company_code: None,
            message: "file not found".to_string(),
        };
        let owned = SegmentationError::Load {
            source_name: "rnd_fr09".to_string(),
            company_code: Some("FR09".to_string()),
            message: "file not found".to_string(),
        };

        assert!(global.is_fatal());
        assert!(!owned.is_fatal());
        assert_eq!(
            owned.to_string(),
            "failed to load source 'rnd_fr09' for company FR09: file not found"
        );
    }
}
