// Taxflow - Core Library
// Segmentation engine for financial line items, shared by the CLI and tests

pub mod aggregator;
pub mod assignment;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod loader;
pub mod logging;
pub mod model;
pub mod pipelines;
pub mod rules;
pub mod runner;

// Re-export commonly used types
pub use aggregator::{CompanyFailure, CompanyOutcome, ResultAggregator, RunReport, TotalsCheck};
pub use assignment::PipelineAssignment;
pub use catalog::{filter_company, filter_scope, DataSourceSpec, SourceCatalog};
pub use config::{
    validate_erosion_ratio, AppConfig, CompanyConfig, CompanyConfigs, DataSourcesConfig,
    PipelineConfig,
};
pub use db::{
    get_company_stats, get_events_for_entity, get_records_for_company, insert_event,
    insert_line_items, insert_segmented_records, remove_stale_rows, setup_database, table_counts,
    verify_count,
    CompanyStat, Event, ResultSink, SqliteSink, WriteStats,
};
pub use error::{ErrorKind, Result, SegmentationError};
pub use loader::{parse_amount, DatasetLoader, FileDatasetLoader, InMemoryLoader};
pub use model::{
    checked_sum, Activity, Category, FinancialLineItem, PipelineVariant, Segment, SegmentedRecord,
};
pub use pipelines::{dispatch, reconcile, CompanyDataset, CompanyInput};
pub use rules::{SegmentMappingTable, SegmentRule};
pub use runner::{CancellationToken, Parallelism, RunOptions, SegmentationEngine, Targets};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
