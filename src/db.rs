use crate::aggregator::RunReport;
use crate::model::{FinancialLineItem, SegmentedRecord};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Tables the sink owns, in the order they are reported
pub const TABLES: [&str; 3] = ["line_items", "segmented_records", "events"];

// ============================================================================
// IDEMPOTENCY HASHES
// ============================================================================

/// Deduplication key of a segmented record; equal records hash equally across runs
pub fn record_hash(record: &SegmentedRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.canonical());
    format!("{:x}", hasher.finalize())
}

/// Deduplication key of an input row. The position within its company keeps
/// identical rows of one source apart; a company's input order is deterministic.
pub fn line_item_hash(position: usize, item: &FinancialLineItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}|{}|{}|{}",
        position,
        item.source_name,
        item.company_code,
        item.account_code,
        item.business_unit.as_deref().unwrap_or(""),
        item.period,
        item.amount.normalize()
    ));
    format!("{:x}", hasher.finalize())
}

/// Hashes of a run's input rows, positions counted per company
pub fn line_item_hashes(items: &[FinancialLineItem]) -> Vec<String> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    items
        .iter()
        .map(|item| {
            let position = positions.entry(item.company_code.as_str()).or_insert(0);
            let hash = line_item_hash(*position, item);
            *position += 1;
            hash
        })
        .collect()
}

// ============================================================================
// EVENTS (audit trail)
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL keeps readers unblocked while a run is written
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS line_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            run_id TEXT NOT NULL,
            source_name TEXT NOT NULL,
            company_code TEXT NOT NULL,
            account_code TEXT NOT NULL,
            business_unit TEXT,
            period TEXT NOT NULL,
            amount TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Amounts are stored as decimal TEXT so nothing is lost to floating point
    conn.execute(
        "CREATE TABLE IF NOT EXISTS segmented_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            run_id TEXT NOT NULL,
            company_code TEXT NOT NULL,
            period TEXT NOT NULL,
            segment TEXT NOT NULL,
            activity TEXT NOT NULL,
            category TEXT NOT NULL,
            business_unit TEXT,
            gross_amount TEXT NOT NULL,
            adjusted_amount TEXT NOT NULL,
            erosion_applied INTEGER NOT NULL,
            pipeline_variant TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_company ON segmented_records(company_code)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_line_items_company ON line_items(company_code)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// WRITES
// ============================================================================

/// Insert records, skipping ones already stored. Returns (inserted, duplicates).
pub fn insert_segmented_records(
    conn: &Connection,
    run_id: &str,
    records: &[SegmentedRecord],
) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut duplicates = 0;

    for record in records {
        let result = conn.execute(
            "INSERT INTO segmented_records (
                idempotency_hash, run_id, company_code, period, segment, activity,
                category, business_unit, gross_amount, adjusted_amount,
                erosion_applied, pipeline_variant
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record_hash(record),
                run_id,
                record.company_code,
                record.period,
                record.segment.code(),
                record.activity.as_str(),
                record.category.as_str(),
                record.business_unit,
                record.gross_amount.to_string(),
                record.adjusted_amount.to_string(),
                record.erosion_applied,
                record.pipeline_variant.name(),
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!(inserted, duplicates, "segmented_records_written");
    Ok((inserted, duplicates))
}

/// Insert input rows, skipping ones already stored. Returns (inserted, duplicates).
pub fn insert_line_items(
    conn: &Connection,
    run_id: &str,
    items: &[FinancialLineItem],
) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut duplicates = 0;

    for (item, hash) in items.iter().zip(line_item_hashes(items)) {
        let result = conn.execute(
            "INSERT INTO line_items (
                idempotency_hash, run_id, source_name, company_code, account_code,
                business_unit, period, amount
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                hash,
                run_id,
                item.source_name,
                item.company_code,
                item.account_code,
                item.business_unit,
                item.period,
                item.amount.to_string(),
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!(inserted, duplicates, "line_items_written");
    Ok((inserted, duplicates))
}

/// Delete a company's rows in `table` whose hash is not in `keep`. Returns the count removed.
///
/// Run before inserting a re-run's output so corrected input replaces what an
/// earlier run stored instead of accumulating beside it.
pub fn remove_stale_rows(
    conn: &Connection,
    table: &str,
    company_code: &str,
    keep: &HashSet<String>,
) -> Result<usize> {
    if !matches!(table, "line_items" | "segmented_records") {
        bail!("Table '{}' has no per-company rows", table);
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT idempotency_hash FROM {} WHERE company_code = ?1",
        table
    ))?;
    let stored = stmt
        .query_map(params![company_code], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut removed = 0;
    for hash in stored.iter().filter(|h| !keep.contains(*h)) {
        removed += conn.execute(
            &format!("DELETE FROM {} WHERE idempotency_hash = ?1", table),
            params![hash],
        )?;
    }

    if removed > 0 {
        debug!(table, company_code, removed, "stale_rows_removed");
    }
    Ok(removed)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

// ============================================================================
// READS
// ============================================================================

/// Events for one entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| {
            Ok(Event {
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .with_context(|| format!("Invalid timestamp on event {}", event_id))?
                    .with_timezone(&Utc),
                data: serde_json::from_str(&data)
                    .with_context(|| format!("Invalid data on event {}", event_id))?,
                event_id,
                event_type,
                entity_type,
                entity_id,
                actor,
            })
        })
        .collect()
}

/// Stored shape of a segmented record before labels are parsed back
struct StoredRecord {
    company_code: String,
    period: String,
    segment: String,
    activity: String,
    category: String,
    business_unit: Option<String>,
    gross_amount: String,
    adjusted_amount: String,
    erosion_applied: bool,
    pipeline_variant: String,
}

impl StoredRecord {
    fn into_record(self) -> Result<SegmentedRecord> {
        let label = |e: String| anyhow::anyhow!(e);
        Ok(SegmentedRecord {
            segment: self.segment.parse().map_err(label)?,
            activity: self.activity.parse().map_err(label)?,
            category: self.category.parse().map_err(label)?,
            pipeline_variant: self.pipeline_variant.parse().map_err(label)?,
            gross_amount: Decimal::from_str(&self.gross_amount)
                .with_context(|| format!("Invalid gross amount '{}'", self.gross_amount))?,
            adjusted_amount: Decimal::from_str(&self.adjusted_amount)
                .with_context(|| format!("Invalid adjusted amount '{}'", self.adjusted_amount))?,
            company_code: self.company_code,
            period: self.period,
            business_unit: self.business_unit,
            erosion_applied: self.erosion_applied,
        })
    }
}

/// Records of one company in insertion order
pub fn get_records_for_company(conn: &Connection, company_code: &str) -> Result<Vec<SegmentedRecord>> {
    let mut stmt = conn.prepare(
        "SELECT company_code, period, segment, activity, category, business_unit,
                gross_amount, adjusted_amount, erosion_applied, pipeline_variant
         FROM segmented_records
         WHERE company_code = ?1
         ORDER BY id",
    )?;

    let stored = stmt
        .query_map(params![company_code], |row| {
            Ok(StoredRecord {
                company_code: row.get(0)?,
                period: row.get(1)?,
                segment: row.get(2)?,
                activity: row.get(3)?,
                category: row.get(4)?,
                business_unit: row.get(5)?,
                gross_amount: row.get(6)?,
                adjusted_amount: row.get(7)?,
                erosion_applied: row.get(8)?,
                pipeline_variant: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    stored.into_iter().map(StoredRecord::into_record).collect()
}

/// Per-company totals of stored records
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyStat {
    pub company_code: String,
    pub pipeline_variant: String,
    pub record_count: i64,
    pub total_gross: Decimal,
    pub total_adjusted: Decimal,
}

/// Statistics grouped by company. Sums are done on decimals, not in SQL.
pub fn get_company_stats(conn: &Connection) -> Result<Vec<CompanyStat>> {
    let mut stmt = conn.prepare(
        "SELECT company_code, pipeline_variant, gross_amount, adjusted_amount
         FROM segmented_records
         ORDER BY company_code, id",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stats: BTreeMap<String, CompanyStat> = BTreeMap::new();
    for (company_code, variant, gross, adjusted) in rows {
        let gross = Decimal::from_str(&gross).with_context(|| format!("Invalid gross amount '{}'", gross))?;
        let adjusted =
            Decimal::from_str(&adjusted).with_context(|| format!("Invalid adjusted amount '{}'", adjusted))?;

        let stat = stats.entry(company_code.clone()).or_insert_with(|| CompanyStat {
            company_code,
            pipeline_variant: variant,
            record_count: 0,
            total_gross: Decimal::ZERO,
            total_adjusted: Decimal::ZERO,
        });
        stat.record_count += 1;
        stat.total_gross = stat
            .total_gross
            .checked_add(gross)
            .with_context(|| format!("Gross total of {} overflows", stat.company_code))?;
        stat.total_adjusted = stat
            .total_adjusted
            .checked_add(adjusted)
            .with_context(|| format!("Adjusted total of {} overflows", stat.company_code))?;
    }

    Ok(stats.into_values().collect())
}

/// Row count of one of the sink's tables
pub fn verify_count(conn: &Connection, table: &str) -> Result<i64> {
    if !TABLES.contains(&table) {
        bail!("Unknown table '{}'", table);
    }
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;

    Ok(count)
}

/// Row counts of every table, in `TABLES` order
pub fn table_counts(conn: &Connection) -> Result<Vec<(&'static str, i64)>> {
    TABLES
        .iter()
        .map(|table| Ok((*table, verify_count(conn, table)?)))
        .collect()
}

// ============================================================================
// RESULT SINK
// ============================================================================

/// What one sink write changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub records_inserted: usize,
    pub records_skipped: usize,
    /// Rows of re-run companies that the new output no longer contains
    pub records_removed: usize,
    pub line_items_inserted: usize,
    pub line_items_skipped: usize,
    pub line_items_removed: usize,
}

/// ResultSink - accepts the final result set of a run
pub trait ResultSink {
    fn write(&mut self, report: &RunReport) -> Result<WriteStats>;
}

/// SQLite persistence for run reports
pub struct SqliteSink {
    conn: Connection,
    persist_line_items: bool,
}

impl SqliteSink {
    /// Open (or create) the database file, creating its directory when missing
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn).context("Failed to set up database schema")?;
        Ok(SqliteSink {
            conn,
            persist_line_items: true,
        })
    }

    /// Builder pattern: toggle persistence of input rows
    pub fn with_line_items(mut self, enabled: bool) -> Self {
        self.persist_line_items = enabled;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl ResultSink for SqliteSink {
    fn write(&mut self, report: &RunReport) -> Result<WriteStats> {
        let tx = self.conn.transaction()?;
        let mut stats = WriteStats::default();

        // Companies that produced output replace whatever an earlier run stored for them.
        // Failed companies keep their previous rows.
        let record_hashes: Vec<String> = report.records.iter().map(record_hash).collect();
        let item_hashes = line_item_hashes(&report.line_items);

        for company_code in report
            .companies
            .iter()
            .filter(|c| report.failure_for(c).is_none())
        {
            let keep: HashSet<String> = report
                .records
                .iter()
                .zip(&record_hashes)
                .filter(|(record, _)| &record.company_code == company_code)
                .map(|(_, hash)| hash.clone())
                .collect();
            stats.records_removed += remove_stale_rows(&tx, "segmented_records", company_code, &keep)?;

            if self.persist_line_items {
                let keep: HashSet<String> = report
                    .line_items
                    .iter()
                    .zip(&item_hashes)
                    .filter(|(item, _)| &item.company_code == company_code)
                    .map(|(_, hash)| hash.clone())
                    .collect();
                stats.line_items_removed += remove_stale_rows(&tx, "line_items", company_code, &keep)?;
            }
        }

        if self.persist_line_items {
            let (inserted, skipped) = insert_line_items(&tx, &report.run_id, &report.line_items)?;
            stats.line_items_inserted = inserted;
            stats.line_items_skipped = skipped;
        }

        let (inserted, skipped) = insert_segmented_records(&tx, &report.run_id, &report.records)?;
        stats.records_inserted = inserted;
        stats.records_skipped = skipped;

        for failure in &report.failures {
            let event = Event::new(
                "company_failed",
                "company",
                &failure.company_code,
                serde_json::json!({
                    "run_id": report.run_id,
                    "kind": failure.kind.name(),
                    "message": failure.message,
                }),
                "taxflow",
            );
            insert_event(&tx, &event)?;
        }

        let event = Event::new(
            "segmentation_run_completed",
            "run",
            &report.run_id,
            serde_json::json!({
                "companies": report.companies,
                "records": report.records.len(),
                "failures": report.failures.len(),
                "records_inserted": stats.records_inserted,
                "records_removed": stats.records_removed,
                "fingerprint": report.fingerprint(),
            }),
            "taxflow",
        );
        insert_event(&tx, &event)?;

        tx.commit().context("Failed to commit run")?;
        info!(
            run_id = %report.run_id,
            records_inserted = stats.records_inserted,
            records_skipped = stats.records_skipped,
            records_removed = stats.records_removed,
            line_items_inserted = stats.line_items_inserted,
            "run_persisted"
        );
        Ok(stats)
    }
}
