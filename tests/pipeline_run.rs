use rust_decimal::Decimal;
use std::fs;
use std::path::Path;
use taxflow::{
    get_company_stats, get_events_for_entity, get_records_for_company, verify_count, Activity,
    AppConfig, Category, FileDatasetLoader, ErrorKind, PipelineAssignment, ResultSink, RunOptions,
    SegmentMappingTable, SegmentationEngine, SqliteSink, Targets,
};
use tempfile::TempDir;

const CONFIG: &str = r#"{
    "log_level": "warn",
    "database_path": "local/app.db",
    "segments_path": "segments.csv",
    "data_sources": {
        "grand_total": "grand_total",
        "sources": [
            { "name": "grand_total", "path": "data/grand_totals.csv" },
            { "name": "royalties", "path": "data/royalties.csv", "scope": [7100, "7110"] },
            { "name": "fr09_rnd", "path": "data/fr09_rnd.csv", "scope": ["6000"], "company_code": "fr09" }
        ]
    },
    "pipeline": {
        "single_activity": ["AB01"],
        "mixed_activity": ["DE03"],
        "mixed_activity_with_external_costs": ["FR09"],
        "manual_erosion_entities": ["ACME", "ZZ01"]
    },
    "company_configs": [
        { "company_code": "ACME", "target_ebit_erosion": "0.05" },
        { "company_code": "ZZ01", "target_ebit_erosion": "1.2" },
        { "company_code": "FR09", "external_costs_business_units": ["EXT"],
          "shared_costs_business_units": ["SHR"] }
    ]
}"#;

const SEGMENTS: &str = "\u{feff}company_code,segment,activity,category
AB01,DIS,routine,distribution
DE03,THUB,entrepreneur,own_manufacturing_third_party
FR09,CM,routine,contract_manufacturing
";

const GRAND_TOTALS: &str = "CompanyCode,gl_account,OrgBU,fiscal_year_period,value_chf
AB01,4000,,2024012,600
AB01,4100,,2024012,400
DE03,4000,BU1,2024012,\"2,000.00\"
FR09,4000,BU1,2024012,900
ACME,4000,,2024012,150000
ACME,4100,,2024012,50000
ZZ01,4000,,2024012,10
";

const ROYALTIES: &str = "company_code,account_code,business_unit,period,amount
DE03,7100,BU1,2024012,120
DE03,9999,BU1,2024012,5
FR09,7110,ext,2024012,(300)
";

const FR09_RND: &str = "company_code,account_code,business_unit,period,amount
FR09,6000,EXT,2024012,-200
FR09,6100,EXT,2024012,-999
";

fn write_workspace(dir: &Path) -> AppConfig {
    fs::create_dir_all(dir.join("data")).unwrap();
    fs::write(dir.join("config.json"), CONFIG).unwrap();
    fs::write(dir.join("segments.csv"), SEGMENTS).unwrap();
    fs::write(dir.join("data/grand_totals.csv"), GRAND_TOTALS).unwrap();
    fs::write(dir.join("data/royalties.csv"), ROYALTIES).unwrap();
    fs::write(dir.join("data/fr09_rnd.csv"), FR09_RND).unwrap();
    AppConfig::from_file(dir.join("config.json")).unwrap()
}

fn run(config: &AppConfig, targets: &Targets, options: &RunOptions) -> taxflow::RunReport {
    let catalog = config.data_sources.catalog().unwrap();
    let rules = SegmentMappingTable::from_file(&config.segments_path).unwrap();
    let assignment = PipelineAssignment::new(&config.pipeline).unwrap();
    let companies = config.company_configs();
    let loader = FileDatasetLoader::new();

    SegmentationEngine::new(&catalog, &rules, &assignment, &companies, &loader)
        .run(targets, options)
        .unwrap()
}

#[test]
fn test_end_to_end_from_csv_files() {
    let dir = TempDir::new().unwrap();
    let config = write_workspace(dir.path());

    let report = run(&config, &Targets::All, &RunOptions::sequential());

    assert_eq!(report.companies, vec!["AB01", "ACME", "DE03", "FR09", "ZZ01"]);

    // single activity
    let ab01 = report.records_for("AB01");
    assert_eq!(ab01.len(), 1);
    assert_eq!(ab01[0].adjusted_amount, Decimal::new(1000, 0));
    assert_eq!(ab01[0].activity, Activity::Routine);

    // manual erosion
    let acme = report.records_for("ACME");
    assert_eq!(acme[0].activity, Activity::Residual);
    assert_eq!(acme[0].adjusted_amount, Decimal::new(190_000, 0));
    assert_eq!(acme[1].activity, Activity::Eroded);
    assert_eq!(acme[1].adjusted_amount, Decimal::new(10_000, 0));
    assert!(acme.iter().all(|r| r.erosion_applied));

    // mixed: out-of-scope royalty row is dropped, isolated rows take the counterpart activity
    let de03 = report.records_for("DE03");
    let routine: Decimal = de03
        .iter()
        .filter(|r| r.activity == Activity::Routine)
        .map(|r| r.adjusted_amount)
        .sum();
    assert_eq!(routine, Decimal::new(120, 0));

    // external costs: royalties (-300) and the owned R&D source (-200) share the EXT unit
    let fr09 = report.records_for("FR09");
    let external: Decimal = fr09
        .iter()
        .filter(|r| r.category == Category::ExternalCost)
        .map(|r| r.adjusted_amount)
        .sum();
    assert_eq!(external, Decimal::new(-500, 0));
    let fr09_total: Decimal = fr09.iter().map(|r| r.adjusted_amount).sum();
    assert_eq!(fr09_total, Decimal::new(400, 0));

    // invalid ratio fails only its own company
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failure_for("ZZ01").unwrap().kind, ErrorKind::InvalidErosionRatio);

    // every successful company adds up to its input
    assert_eq!(report.totals.len(), 4);
    assert!(report.is_reconciled());
}

#[test]
fn test_parallel_run_matches_sequential() {
    let dir = TempDir::new().unwrap();
    let config = write_workspace(dir.path());

    let sequential = run(&config, &Targets::All, &RunOptions::sequential());
    let parallel = run(&config, &Targets::All, &RunOptions::default().with_workers(3));

    assert_eq!(sequential.fingerprint(), parallel.fingerprint());
    assert_eq!(sequential.failures, parallel.failures);
}

#[test]
fn test_subset_persisted_idempotently() {
    let dir = TempDir::new().unwrap();
    let config = write_workspace(dir.path());
    let targets = Targets::Subset(vec!["fr09".to_string(), "ab01".to_string()]);

    let report = run(&config, &targets, &RunOptions::sequential());
    assert!(report.is_clean());
    assert_eq!(report.companies, vec!["FR09", "AB01"]);

    let mut sink = SqliteSink::open(&config.database_path).unwrap();
    let stats = sink.write(&report).unwrap();
    assert_eq!(stats.records_inserted, report.records.len());
    assert!(dir.path().join("local/app.db").exists());

    // a second identical run adds no rows
    let again = run(&config, &targets, &RunOptions::sequential());
    let stats = sink.write(&again).unwrap();
    assert_eq!(stats.records_inserted, 0);
    assert_eq!(stats.line_items_inserted, 0);

    let conn = sink.connection();
    assert_eq!(
        verify_count(conn, "segmented_records").unwrap(),
        report.records.len() as i64
    );
    // AB01: 2 rows; FR09: 1 grand total + 1 royalty + 1 in-scope R&D row
    assert_eq!(verify_count(conn, "line_items").unwrap(), 5);

    let stored = get_records_for_company(conn, "FR09").unwrap();
    assert_eq!(stored, report.records_for("FR09").into_iter().cloned().collect::<Vec<_>>());

    let stats = get_company_stats(conn).unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].company_code, "AB01");
    assert_eq!(stats[0].total_adjusted, Decimal::new(1000, 0));

    assert_eq!(get_events_for_entity(conn, "run", &report.run_id).unwrap().len(), 1);
}

#[test]
fn test_rerun_with_corrected_input_replaces_rows() {
    let dir = TempDir::new().unwrap();
    let config = write_workspace(dir.path());
    let targets = Targets::Subset(vec!["AB01".to_string()]);

    let mut sink = SqliteSink::open(&config.database_path).unwrap();
    sink.write(&run(&config, &targets, &RunOptions::sequential())).unwrap();

    // the 4100 account is corrected from 400 to 100
    fs::write(
        dir.path().join("data/grand_totals.csv"),
        GRAND_TOTALS.replace("AB01,4100,,2024012,400", "AB01,4100,,2024012,100"),
    )
    .unwrap();
    let corrected = run(&config, &targets, &RunOptions::sequential());
    let stats = sink.write(&corrected).unwrap();
    assert_eq!(stats.records_removed, 1);
    assert_eq!(stats.records_inserted, 1);

    let conn = sink.connection();
    let stored = get_records_for_company(conn, "AB01").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].adjusted_amount, Decimal::new(700, 0));
    assert_eq!(verify_count(conn, "line_items").unwrap(), 2);
}

#[test]
fn test_grand_total_from_workbook_sheet() {
    let dir = TempDir::new().unwrap();
    let mut config = write_workspace(dir.path());

    let path = dir.path().join("data/grand_totals.xlsx");
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("GT").unwrap();
    for (col, header) in ["CompanyCode", "gl_account", "OrgBU", "fiscal_year_period", "value_chf"]
        .iter()
        .enumerate()
    {
        sheet.write_string(0, col as u16, *header).unwrap();
    }
    sheet.write_string(1, 0, "AB01").unwrap();
    sheet.write_number(1, 1, 4000.0).unwrap();
    sheet.write_number(1, 3, 2024012.0).unwrap();
    sheet.write_number(1, 4, 1250.75).unwrap();
    workbook.save(&path).unwrap();

    config.data_sources.sources[0].path = path;
    config.data_sources.sources[0].sheet = "GT".to_string();

    let report = run(&config, &Targets::Subset(vec!["AB01".to_string()]), &RunOptions::sequential());
    assert!(report.is_clean());
    let ab01 = report.records_for("AB01");
    assert_eq!(ab01.len(), 1);
    assert_eq!(ab01[0].adjusted_amount, Decimal::new(125075, 2));
}

#[test]
fn test_owned_grand_total_rejected_by_config() {
    let dir = TempDir::new().unwrap();
    let mut config = write_workspace(dir.path());
    config.data_sources.sources[0].company_code = Some("ACME".to_string());

    let err = config.data_sources.catalog().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GrandTotalNotGlobal);
    assert!(err.is_fatal());
}

#[test]
fn test_missing_dataset_file_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = write_workspace(dir.path());
    fs::remove_file(dir.path().join("data/royalties.csv")).unwrap();

    let catalog = config.data_sources.catalog().unwrap();
    let rules = SegmentMappingTable::from_file(&config.segments_path).unwrap();
    let assignment = PipelineAssignment::new(&config.pipeline).unwrap();
    let companies = config.company_configs();
    let loader = FileDatasetLoader::new();

    let err = SegmentationEngine::new(&catalog, &rules, &assignment, &companies, &loader)
        .run(&Targets::All, &RunOptions::sequential())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Load);
    assert!(err.is_fatal());
    assert!(err.to_string().contains("royalties"));
}
