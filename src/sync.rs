// 🔄 Sync Runner - Fetch → Parse → Dedupe → Check → Enrich → Import, per collection
//
// A failure is contained to its table (import) or its collection (fetch,
// parse). Everything else keeps going and the report says what happened.

use crate::data_quality::{DataQualityEngine, Severity};
use crate::db::{TallyTable, Tenant};
use crate::deduplication::DeduplicationEngine;
use crate::entities::{Collection, Row};
use crate::import::{BatchImporter, ImportOperation, ImportStats, Sink};
use crate::parser::parse_payload;
use crate::source::TallySource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

// ============================================================================
// OPTIONS & REPORT
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Run in this order; defaults to every collection in dependency order
    pub collections: Vec<Collection>,
    pub operation: ImportOperation,
    /// Parse and check, but write nothing
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            collections: Collection::ALL.to_vec(),
            operation: ImportOperation::Upsert,
            dry_run: false,
        }
    }
}

impl SyncOptions {
    /// Requested collections, deduplicated and put in dependency order
    pub fn ordered_collections(&self) -> Vec<Collection> {
        Collection::ALL
            .iter()
            .copied()
            .filter(|c| self.collections.contains(c))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableResult {
    pub table: TallyTable,
    pub collection: Collection,
    pub records: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub quality_issues: usize,
    pub stats: Option<ImportStats>,
    pub error: Option<String>,
}

impl TableResult {
    fn new(collection: Collection, table: TallyTable) -> Self {
        TableResult {
            table,
            collection,
            records: 0,
            skipped: 0,
            duplicates: 0,
            quality_issues: 0,
            stats: None,
            error: None,
        }
    }

    fn failed(collection: Collection, table: TallyTable, error: String) -> Self {
        TableResult {
            error: Some(error),
            ..TableResult::new(collection, table)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub source: String,
    pub sink: String,
    pub tenant: Tenant,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableResult>,
}

impl SyncReport {
    pub fn failed(&self) -> impl Iterator<Item = &TableResult> {
        self.tables.iter().filter(|t| !t.is_ok())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Warn about failed tables; with `strict`, turn them into an error so
    /// the process exits non-zero.
    pub fn check(&self, strict: bool) -> anyhow::Result<()> {
        let failed: Vec<&str> = self.failed().map(|t| t.table.name()).collect();
        if failed.is_empty() {
            return Ok(());
        }

        warn!(failed = failed.len(), tables = %failed.join(", "), "sync finished with failed tables");
        if strict {
            anyhow::bail!("{} table(s) failed: {}", failed.len(), failed.join(", "));
        }
        Ok(())
    }

    pub fn totals(&self) -> ImportStats {
        let mut totals = ImportStats::default();
        for stats in self.tables.iter().filter_map(|t| t.stats) {
            totals.absorb(stats);
        }
        totals
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.tables.len() + 2);
        lines.push(format!("Sync {} from {} into {}", self.run_id, self.source, self.sink));

        for t in &self.tables {
            let line = match (&t.error, &t.stats) {
                (Some(err), _) => format!("  ❌ {:<20} {}", t.table.name(), err),
                (None, Some(s)) => format!(
                    "  ✅ {:<20} {} records: {} inserted, {} updated, {} unchanged, {} deleted",
                    t.table.name(),
                    t.records,
                    s.inserted,
                    s.updated,
                    s.unchanged,
                    s.deleted
                ),
                (None, None) => format!("  ⏭️  {:<20} {} records (dry run)", t.table.name(), t.records),
            };
            lines.push(line);
        }

        let totals = self.totals();
        let failed = self.failed().count();
        lines.push(format!(
            "{} tables ok, {} failed | {} inserted, {} updated, {} unchanged | {:.1}s",
            self.tables.len() - failed,
            failed,
            totals.inserted,
            totals.updated,
            totals.unchanged,
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
        ));
        lines.join("\n")
    }
}

// ============================================================================
// SYNC RUNNER
// ============================================================================

pub struct SyncRunner<'a, S: TallySource + ?Sized, K: Sink + ?Sized> {
    source: &'a S,
    sink: &'a K,
    tenant: Tenant,
    importer: BatchImporter,
    dedupe: DeduplicationEngine,
    quality: DataQualityEngine,
}

impl<'a, S: TallySource + ?Sized, K: Sink + ?Sized> SyncRunner<'a, S, K> {
    pub fn new(source: &'a S, sink: &'a K, tenant: Tenant, importer: BatchImporter) -> Self {
        SyncRunner {
            source,
            sink,
            tenant,
            importer,
            dedupe: DeduplicationEngine::new(),
            quality: DataQualityEngine::new(),
        }
    }

    pub fn with_quality(mut self, quality: DataQualityEngine) -> Self {
        self.quality = quality;
        self
    }

    pub fn run(&self, options: &SyncOptions) -> SyncReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let _span = info_span!("sync", run_id = %run_id).entered();

        info!(
            source = %self.source.describe(),
            sink = %self.sink.describe(),
            company_id = %self.tenant.company_id,
            division_id = %self.tenant.division_id,
            operation = %options.operation,
            "sync started"
        );

        let tables = options
            .ordered_collections()
            .into_iter()
            .flat_map(|collection| self.sync_collection(collection, options))
            .collect();

        let report = SyncReport {
            run_id,
            source: self.source.describe(),
            sink: self.sink.describe(),
            tenant: self.tenant.clone(),
            started_at,
            finished_at: Utc::now(),
            tables,
        };

        info!(
            failed = report.failed().count(),
            inserted = report.totals().inserted,
            "sync finished"
        );
        report
    }

    pub fn sync_collection(&self, collection: Collection, options: &SyncOptions) -> Vec<TableResult> {
        let _span = info_span!("collection", collection = %collection).entered();
        let fail_all = |error: String| {
            error!(error = %error, "collection failed");
            collection
                .tables()
                .iter()
                .map(|table| TableResult::failed(collection, *table, error.clone()))
                .collect::<Vec<_>>()
        };

        let payload = match self.source.fetch(collection) {
            Ok(payload) => payload,
            Err(e) => return fail_all(format!("fetch failed: {:#}", e)),
        };

        let parsed = match parse_payload(&payload, collection) {
            Ok(parsed) => parsed,
            Err(e) => return fail_all(format!("parse failed: {:#}", e)),
        };

        let deduped = self.dedupe.dedupe(parsed.records);
        for m in &deduped.probable {
            warn!(first = m.first_index, second = m.second_index, "{}", m.reason);
        }

        let quality = self.quality.validate(&deduped.records);
        for issue in &quality.issues {
            match issue.severity {
                Severity::Critical => warn!(rule = %issue.rule, guid = %issue.guid, record = %issue.record, "{}", issue.issue),
                _ => debug!(rule = %issue.rule, guid = %issue.guid, record = %issue.record, "{}", issue.issue),
            }
        }
        if !quality.issues.is_empty() {
            info!("{}", quality.summary());
        }

        let mut results = Vec::new();
        for (position, (table, rows)) in deduped.records.table_rows().into_iter().enumerate() {
            let mut result = TableResult::new(collection, table);
            result.records = rows.len();

            // Parse-level counts belong to the collection's main table
            if position == 0 {
                result.skipped = parsed.skipped.len();
                result.duplicates = deduped.removed + deduped.probable.len();
                result.quality_issues = quality.issues.len();
            }

            if !options.dry_run {
                let rows: Vec<Row> = rows.into_iter().map(|row| self.tenant.enrich(row)).collect();
                let imported = self.importer.import_records(
                    self.sink,
                    table,
                    options.operation,
                    &self.tenant,
                    &rows,
                    &deduped.records,
                );
                match imported {
                    Ok(stats) => result.stats = Some(stats),
                    Err(e) => {
                        error!(table = %table, error = %e, "table import failed");
                        result.error = Some(e.to_string());
                    }
                }
            }

            results.push(result);
        }

        results
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_rows, fetch_rows, setup_database, Schema};
    use crate::import::SqliteSink;
    use crate::retry::RetryPolicy;
    use crate::source::DirectorySource;
    use rusqlite::Connection;
    use std::fs;
    use std::time::Duration;

    const GROUPS: &str = r#"<ENVELOPE>
        <GROUP NAME="Current Assets"><GUID>grp-1</GUID><PARENT>&#4; Primary</PARENT><ISDEEMEDPOSITIVE>Yes</ISDEEMEDPOSITIVE></GROUP>
        <GROUP NAME="Bank Accounts"><GUID>grp-2</GUID><PARENT>Current Assets</PARENT></GROUP>
    </ENVELOPE>"#;

    const VOUCHERS: &str = r#"<ENVELOPE>
        <VOUCHER><GUID>v-1</GUID><DATE>20240401</DATE><VOUCHERTYPENAME>Payment</VOUCHERTYPENAME><VOUCHERNUMBER>1</VOUCHERNUMBER>
          <ALLLEDGERENTRIES.LIST><LEDGERNAME>Rent</LEDGERNAME><AMOUNT>-500.00</AMOUNT></ALLLEDGERENTRIES.LIST>
          <ALLLEDGERENTRIES.LIST><LEDGERNAME>Bank</LEDGERNAME><AMOUNT>500.00</AMOUNT></ALLLEDGERENTRIES.LIST>
        </VOUCHER>
        <VOUCHER><GUID>v-2</GUID><VOUCHERNUMBER>2</VOUCHERNUMBER></VOUCHER>
    </ENVELOPE>"#;

    fn tenant() -> Tenant {
        Tenant::new("company-1", "division-1")
    }

    fn importer() -> BatchImporter {
        BatchImporter::new(100, RetryPolicy::linear(2, Duration::ZERO))
    }

    fn fixtures() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("groups.xml"), GROUPS).unwrap();
        fs::write(dir.path().join("vouchers.xml"), VOUCHERS).unwrap();
        dir
    }

    #[test]
    fn test_sync_groups_and_vouchers() {
        let dir = fixtures();
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let source = DirectorySource::new(dir.path());
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        let runner = SyncRunner::new(&source, &sink, tenant(), importer());

        let options = SyncOptions {
            collections: vec![Collection::Vouchers, Collection::Groups],
            ..SyncOptions::default()
        };
        let report = runner.run(&options);

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(report.tables.len(), 4);
        assert_eq!(report.tables[0].table, TallyTable::Groups);

        let vouchers = &report.tables[1];
        assert_eq!(vouchers.records, 1);
        assert_eq!(vouchers.skipped, 1);

        assert_eq!(count_rows(&conn, Schema::Legacy, TallyTable::Groups, &tenant()).unwrap(), 2);
        assert_eq!(count_rows(&conn, Schema::Legacy, TallyTable::AccountingEntries, &tenant()).unwrap(), 2);
        assert_eq!(report.totals().inserted, 5);
    }

    #[test]
    fn test_missing_collection_fails_alone() {
        let dir = fixtures();
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let source = DirectorySource::new(dir.path());
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        let report = SyncRunner::new(&source, &sink, tenant(), importer()).run(&SyncOptions::default());

        // groups and vouchers (3 tables) succeed; 4 masters have no fixture
        assert_eq!(report.failed().count(), 4);
        assert_eq!(report.tables.len(), 9);
        assert!(report.tables.iter().find(|t| t.table == TallyTable::Ledgers).unwrap().error.as_ref().unwrap().contains("fetch failed"));
        assert!(report.summary().contains("5 tables ok, 4 failed"));

        assert!(report.check(false).is_ok());
        let err = report.check(true).unwrap_err().to_string();
        assert!(err.starts_with("4 table(s) failed"), "{}", err);
        assert!(err.contains("ledgers"));
    }

    #[test]
    fn test_resync_drops_removed_voucher_lines() {
        const THREE_LINES: &str = r#"<ENVELOPE>
            <VOUCHER><GUID>v-1</GUID><DATE>20240401</DATE><VOUCHERTYPENAME>Journal</VOUCHERTYPENAME><VOUCHERNUMBER>1</VOUCHERNUMBER>
              <ALLLEDGERENTRIES.LIST><LEDGERNAME>Rent</LEDGERNAME><AMOUNT>-300.00</AMOUNT></ALLLEDGERENTRIES.LIST>
              <ALLLEDGERENTRIES.LIST><LEDGERNAME>Bank</LEDGERNAME><AMOUNT>200.00</AMOUNT></ALLLEDGERENTRIES.LIST>
              <ALLLEDGERENTRIES.LIST><LEDGERNAME>Cash</LEDGERNAME><AMOUNT>100.00</AMOUNT></ALLLEDGERENTRIES.LIST>
            </VOUCHER>
        </ENVELOPE>"#;
        const TWO_LINES: &str = r#"<ENVELOPE>
            <VOUCHER><GUID>v-1</GUID><DATE>20240401</DATE><VOUCHERTYPENAME>Journal</VOUCHERTYPENAME><VOUCHERNUMBER>1</VOUCHERNUMBER>
              <ALLLEDGERENTRIES.LIST><LEDGERNAME>Rent</LEDGERNAME><AMOUNT>-300.00</AMOUNT></ALLLEDGERENTRIES.LIST>
              <ALLLEDGERENTRIES.LIST><LEDGERNAME>Bank</LEDGERNAME><AMOUNT>300.00</AMOUNT></ALLLEDGERENTRIES.LIST>
            </VOUCHER>
        </ENVELOPE>"#;

        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let source = DirectorySource::new(dir.path());
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        let options = SyncOptions {
            collections: vec![Collection::Vouchers],
            ..SyncOptions::default()
        };

        fs::write(dir.path().join("vouchers.xml"), THREE_LINES).unwrap();
        let first = SyncRunner::new(&source, &sink, tenant(), importer()).run(&options);
        assert!(first.is_success(), "{}", first.summary());
        assert_eq!(count_rows(&conn, Schema::Legacy, TallyTable::AccountingEntries, &tenant()).unwrap(), 3);

        fs::write(dir.path().join("vouchers.xml"), TWO_LINES).unwrap();
        let second = SyncRunner::new(&source, &sink, tenant(), importer()).run(&options);
        assert!(second.is_success(), "{}", second.summary());

        let entries = fetch_rows(&conn, Schema::Legacy, TallyTable::AccountingEntries, &tenant()).unwrap();
        assert_eq!(entries.len(), 2);
        let sum: f64 = entries.iter().filter_map(|e| e.row["amount"].as_f64()).sum();
        assert!(sum.abs() < 0.001);

        let stats = second.tables.iter().find(|t| t.table == TallyTable::AccountingEntries).unwrap().stats.unwrap();
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.deleted, 1);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = fixtures();
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let source = DirectorySource::new(dir.path());
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        let options = SyncOptions {
            collections: vec![Collection::Groups],
            dry_run: true,
            ..SyncOptions::default()
        };
        let report = SyncRunner::new(&source, &sink, tenant(), importer()).run(&options);

        assert!(report.is_success());
        assert_eq!(report.tables[0].records, 2);
        assert!(report.tables[0].stats.is_none());
        assert_eq!(count_rows(&conn, Schema::Legacy, TallyTable::Groups, &tenant()).unwrap(), 0);
    }

    #[test]
    fn test_ordered_collections() {
        let options = SyncOptions {
            collections: vec![Collection::Vouchers, Collection::Ledgers, Collection::Vouchers],
            ..SyncOptions::default()
        };
        assert_eq!(options.ordered_collections(), vec![Collection::Ledgers, Collection::Vouchers]);
    }
}
