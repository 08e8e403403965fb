// Segmentation runner
//
// Fans a target list of companies out over the pipelines, sequentially or on a
// scoped worker pool, and funnels every outcome into one ResultAggregator.
// Configuration is validated and global sources are loaded before any company
// is dispatched; everything after that is per-company and never aborts the run.

use crate::aggregator::{CompanyOutcome, ResultAggregator, RunReport, TotalsCheck};
use crate::assignment::PipelineAssignment;
use crate::catalog::{filter_company, filter_scope, DataSourceSpec, SourceCatalog};
use crate::config::CompanyConfigs;
use crate::error::{Result, SegmentationError};
use crate::loader::DatasetLoader;
use crate::model::{normalize_code, FinancialLineItem, SegmentedRecord};
use crate::pipelines::{dispatch, reconcile, CompanyDataset, CompanyInput};
use crate::rules::SegmentMappingTable;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, info, info_span, warn};

// ============================================================================
// RUN OPTIONS
// ============================================================================

/// Shared stop flag. Cancelling stops dispatch of further companies; companies
/// already in flight finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    Sequential,
    Workers(usize),
    /// One worker per available core
    #[default]
    Auto,
}

impl Parallelism {
    /// Worker threads to start for `jobs` companies; never more than there are jobs
    pub fn worker_count(&self, jobs: usize) -> usize {
        let wanted = match self {
            Parallelism::Sequential => 1,
            Parallelism::Workers(n) => (*n).max(1),
            Parallelism::Auto => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        };
        wanted.min(jobs.max(1))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub parallelism: Parallelism,
    pub cancellation: CancellationToken,
}

impl RunOptions {
    pub fn sequential() -> Self {
        RunOptions {
            parallelism: Parallelism::Sequential,
            ..Default::default()
        }
    }

    /// Builder pattern: set the worker pool size
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.parallelism = Parallelism::Workers(workers);
        self
    }

    /// Builder pattern: share a cancellation token with the caller
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Which companies to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Every assigned company, sorted by code
    All,
    /// An explicit list; codes are upper-cased and duplicates dropped, order kept
    Subset(Vec<String>),
}

impl Targets {
    pub fn resolve(&self, assignment: &PipelineAssignment) -> Vec<String> {
        match self {
            Targets::All => assignment.all_companies(),
            Targets::Subset(codes) => {
                let mut resolved: Vec<String> = Vec::with_capacity(codes.len());
                for code in codes.iter().map(|c| normalize_code(c)) {
                    if !code.is_empty() && !resolved.contains(&code) {
                        resolved.push(code);
                    }
                }
                resolved
            }
        }
    }
}

// ============================================================================
// SEGMENTATION ENGINE
// ============================================================================

/// Read-only lookup structures for one run, shared by reference across workers
pub struct SegmentationEngine<'a> {
    catalog: &'a SourceCatalog,
    rules: &'a SegmentMappingTable,
    assignment: &'a PipelineAssignment,
    companies: &'a CompanyConfigs,
    loader: &'a dyn DatasetLoader,
}

/// Line items of global sources, loaded once per run
type GlobalDatasets = HashMap<String, Vec<FinancialLineItem>>;

impl<'a> SegmentationEngine<'a> {
    pub fn new(
        catalog: &'a SourceCatalog,
        rules: &'a SegmentMappingTable,
        assignment: &'a PipelineAssignment,
        companies: &'a CompanyConfigs,
        loader: &'a dyn DatasetLoader,
    ) -> Self {
        SegmentationEngine {
            catalog,
            rules,
            assignment,
            companies,
            loader,
        }
    }

    /// Run the target companies and return an ordered report.
    ///
    /// Returns `Err` only for fatal problems: configuration integrity errors and
    /// load failures of global sources. Per-company failures land in the report.
    pub fn run(&self, targets: &Targets, options: &RunOptions) -> Result<RunReport> {
        let companies = targets.resolve(self.assignment);
        self.assignment
            .validate_references(&companies, self.companies, self.catalog)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let workers = options.parallelism.worker_count(companies.len());
        info!(
            run_id = %run_id,
            companies = companies.len(),
            workers,
            loader_version = self.loader.version(),
            "segmentation_run_started"
        );

        let globals = self.load_global_sources()?;
        let mut aggregator = ResultAggregator::new(&run_id, companies.clone());

        if workers <= 1 {
            for (index, company_code) in companies.iter().enumerate() {
                if options.cancellation.is_cancelled() {
                    warn!(company_code = %company_code, "dispatch_cancelled");
                    break;
                }
                aggregator.record(self.process_company(index, company_code, &globals));
            }
        } else {
            self.run_parallel(&companies, &globals, workers, &options.cancellation, &mut aggregator);
        }

        let report = aggregator.finish();
        info!(
            run_id = %report.run_id,
            records = report.records.len(),
            failures = report.failures.len(),
            "segmentation_run_completed"
        );
        Ok(report)
    }

    /// Workers claim company indices from a shared counter; one collector receives outcomes
    fn run_parallel(
        &self,
        companies: &[String],
        globals: &GlobalDatasets,
        workers: usize,
        cancellation: &CancellationToken,
        aggregator: &mut ResultAggregator,
    ) {
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<CompanyOutcome>();

        thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    if cancellation.is_cancelled() {
                        debug!(worker, "worker_stopped_on_cancel");
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(company_code) = companies.get(index) else {
                        break;
                    };
                    if tx.send(self.process_company(index, company_code, globals)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for outcome in rx {
                aggregator.record(outcome);
            }
        });
    }

    fn load_global_sources(&self) -> Result<GlobalDatasets> {
        let mut globals = HashMap::new();
        for spec in self.catalog.global_sources() {
            let items = self.load_source(spec, None)?;
            debug!(source = %spec.name, rows = items.len(), "global_source_loaded");
            globals.insert(spec.name.clone(), items);
        }
        Ok(globals)
    }

    fn load_source(&self, spec: &DataSourceSpec, company_code: Option<&str>) -> Result<Vec<FinancialLineItem>> {
        self.loader
            .load(spec)
            .map_err(|e| SegmentationError::Load {
                source_name: spec.name.clone(),
                company_code: company_code.map(str::to_string),
                message: format!("{:#}", e),
            })
    }

    /// Filtered datasets of one company, in catalog declaration order
    fn company_datasets(&self, company_code: &str, globals: &GlobalDatasets) -> Result<Vec<CompanyDataset>> {
        let mut datasets = Vec::new();

        for spec in self.catalog.resolve(company_code) {
            let owned;
            let items = match globals.get(&spec.name) {
                Some(items) => items,
                None => {
                    owned = self.load_source(spec, Some(company_code))?;
                    &owned
                }
            };

            let rows = filter_scope(&filter_company(items, company_code), spec.scope.as_deref());
            debug!(
                company_code,
                source = %spec.name,
                isolated = spec.is_isolated(),
                rows = rows.len(),
                "dataset_filtered"
            );
            datasets.push(CompanyDataset::new(&spec.name, spec.is_isolated(), rows));
        }

        Ok(datasets)
    }

    fn process_company(&self, index: usize, company_code: &str, globals: &GlobalDatasets) -> CompanyOutcome {
        let _span = info_span!("company", company_code = %company_code).entered();

        let variant = self.assignment.assignment_of(company_code).ok();
        let mut line_items = Vec::new();
        let mut totals = None;
        let result = self.segment_company(company_code, globals, &mut line_items, &mut totals);

        CompanyOutcome {
            index,
            company_code: company_code.to_string(),
            variant,
            line_items,
            result,
            totals,
        }
    }

    fn segment_company(
        &self,
        company_code: &str,
        globals: &GlobalDatasets,
        line_items: &mut Vec<FinancialLineItem>,
        totals: &mut Option<TotalsCheck>,
    ) -> Result<Vec<SegmentedRecord>> {
        let variant = self.assignment.assignment_of(company_code)?;
        let datasets = self.company_datasets(company_code, globals)?;
        let config = self.companies.get(company_code);

        if let Some(shared) = config.and_then(|c| c.shared_costs_business_units.as_ref()) {
            info!(
                company_code,
                shared_costs_business_units = ?shared,
                "shared_costs_business_units_configured"
            );
        }

        let input = CompanyInput {
            company_code,
            datasets: &datasets,
            config,
            rule: self.rules.lookup(company_code),
            grand_total: self.catalog.grand_total(),
        };
        let records = dispatch(variant, &input).and_then(|records| {
            *totals = Some(reconcile(variant, &input, &records)?);
            Ok(records)
        });

        line_items.extend(datasets.into_iter().flat_map(|d| d.items));
        records
    }
}
