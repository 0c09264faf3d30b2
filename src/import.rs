// 📦 Batch Import - chunked writes with retry into a sink
//
//   rows ──chunks(batch_size)──▶ Sink::write_chunk   (retried per chunk)
//
// replace → Sink::clear once, then every chunk is appended
// upsert  → insert; on GUID conflict fall back to per-row hash comparison
// append  → insert, silently skipping GUIDs that already exist

use crate::db::{
    self, content_hash, insert_row, row_guid, stored_hash, update_row, OnConflict, Schema,
    TallyTable, Tenant,
};
use crate::entities::{Records, Row};
use crate::error::{ImportError, SinkError};
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, instrument};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MAX_BATCH_SIZE: usize = 5000;

// ============================================================================
// OPERATION & STATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOperation {
    Replace,
    #[default]
    Upsert,
    Append,
}

impl ImportOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportOperation::Replace => "replace",
            ImportOperation::Upsert => "upsert",
            ImportOperation::Append => "append",
        }
    }
}

impl fmt::Display for ImportOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(ImportOperation::Replace),
            "upsert" => Ok(ImportOperation::Upsert),
            "append" | "insert" => Ok(ImportOperation::Append),
            other => Err(format!("unknown import operation: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    #[serde(default)]
    pub chunks: usize,
}

impl ImportStats {
    pub fn absorb(&mut self, other: ImportStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.chunks += other.chunks;
    }

    /// Rows that ended up written (new or changed)
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

// ============================================================================
// SINKS
// ============================================================================

pub trait Sink {
    /// Delete every row of the tenant in `table`. Returns rows deleted.
    fn clear(&self, table: TallyTable, tenant: &Tenant) -> Result<usize, SinkError>;

    /// Write one chunk. `operation` is never `Replace` here.
    fn write_chunk(
        &self,
        table: TallyTable,
        operation: ImportOperation,
        tenant: &Tenant,
        rows: &[Row],
    ) -> Result<ImportStats, SinkError>;

    /// Delete entry rows of each listed voucher that the voucher no longer
    /// carries. Returns rows deleted.
    fn prune_entries(
        &self,
        table: TallyTable,
        tenant: &Tenant,
        entry_sets: &[(String, HashSet<String>)],
    ) -> Result<usize, SinkError>;

    fn describe(&self) -> String;
}

/// Direct writes into one namespace of the local database
pub struct SqliteSink<'a> {
    conn: &'a Connection,
    schema: Schema,
}

impl<'a> SqliteSink<'a> {
    pub fn new(conn: &'a Connection, schema: Schema) -> Self {
        SqliteSink { conn, schema }
    }

    fn is_conflict(error: &rusqlite::Error) -> bool {
        matches!(
            error,
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }

    /// Fast path: every row is new. Returns `None` on a GUID conflict, after
    /// rolling the chunk back.
    fn insert_all(&self, table: TallyTable, tenant: &Tenant, rows: &[Row]) -> Result<Option<usize>, SinkError> {
        let tx = self.conn.unchecked_transaction()?;
        for row in rows {
            match insert_row(&tx, self.schema, table, tenant, row, OnConflict::Fail) {
                Ok(_) => {}
                Err(e) if Self::is_conflict(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        tx.commit()?;
        Ok(Some(rows.len()))
    }

    /// Slow path: compare each row's content hash with what's stored.
    fn upsert_each(&self, table: TallyTable, tenant: &Tenant, rows: &[Row]) -> Result<ImportStats, SinkError> {
        let mut stats = ImportStats::default();
        let tx = self.conn.unchecked_transaction()?;

        for row in rows {
            let guid = row_guid(row).unwrap_or_default();
            match stored_hash(&tx, self.schema, table, tenant, guid)? {
                None => {
                    insert_row(&tx, self.schema, table, tenant, row, OnConflict::Fail)?;
                    stats.inserted += 1;
                }
                Some(hash) if hash == content_hash(table, row) => stats.unchanged += 1,
                Some(_) => {
                    update_row(&tx, self.schema, table, tenant, row)?;
                    stats.updated += 1;
                }
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    fn append(&self, table: TallyTable, tenant: &Tenant, rows: &[Row]) -> Result<ImportStats, SinkError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        for row in rows {
            inserted += insert_row(&tx, self.schema, table, tenant, row, OnConflict::Ignore)?;
        }
        tx.commit()?;

        Ok(ImportStats {
            inserted,
            unchanged: rows.len() - inserted,
            ..ImportStats::default()
        })
    }
}

impl Sink for SqliteSink<'_> {
    fn clear(&self, table: TallyTable, tenant: &Tenant) -> Result<usize, SinkError> {
        Ok(db::delete_tenant_rows(self.conn, self.schema, table, tenant)?)
    }

    fn write_chunk(
        &self,
        table: TallyTable,
        operation: ImportOperation,
        tenant: &Tenant,
        rows: &[Row],
    ) -> Result<ImportStats, SinkError> {
        if let Some(index) = rows.iter().position(|row| row_guid(row).is_none()) {
            return Err(SinkError::Rejected(format!("row {} of {} has no guid", index, table)));
        }

        match operation {
            ImportOperation::Append | ImportOperation::Replace => self.append(table, tenant, rows),
            ImportOperation::Upsert => match self.insert_all(table, tenant, rows)? {
                Some(inserted) => Ok(ImportStats {
                    inserted,
                    ..ImportStats::default()
                }),
                None => {
                    debug!(table = %table, "GUID conflict, falling back to per-row upsert");
                    self.upsert_each(table, tenant, rows)
                }
            },
        }
    }

    fn prune_entries(
        &self,
        table: TallyTable,
        tenant: &Tenant,
        entry_sets: &[(String, HashSet<String>)],
    ) -> Result<usize, SinkError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut deleted = 0;
        for (voucher_guid, keep) in entry_sets {
            deleted += db::delete_stale_entries(&tx, self.schema, table, tenant, voucher_guid, keep)?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn describe(&self) -> String {
        format!("sqlite ({} schema)", self.schema)
    }
}

// ============================================================================
// EDGE FUNCTION SINK
// ============================================================================

/// Body of `POST /functions/v1/tally-bulk-import`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkImportRequest {
    #[serde(default)]
    pub api_key: String,
    pub company_id: String,
    pub division_id: String,
    pub table: String,
    #[serde(default)]
    pub operation: ImportOperation,
    #[serde(default)]
    pub data: Vec<Row>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkImportResponse {
    pub success: bool,
    #[serde(default)]
    pub inserted: usize,
    #[serde(default)]
    pub updated: usize,
    #[serde(default)]
    pub unchanged: usize,
    #[serde(default)]
    pub deleted: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkImportResponse {
    pub fn ok(stats: ImportStats) -> Self {
        BulkImportResponse {
            success: true,
            inserted: stats.inserted,
            updated: stats.updated,
            unchanged: stats.unchanged,
            deleted: stats.deleted,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        BulkImportResponse {
            success: false,
            error: Some(error.into()),
            ..BulkImportResponse::default()
        }
    }
}

/// Pushes chunks to the bulk-import edge function over HTTP
pub struct EdgeFunctionSink<T: Transport> {
    transport: T,
    url: String,
    api_key: String,
}

impl<T: Transport> EdgeFunctionSink<T> {
    pub fn new(transport: T, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        EdgeFunctionSink {
            transport,
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    fn send(&self, request: &BulkImportRequest) -> Result<BulkImportResponse, SinkError> {
        let body = serde_json::to_string(request)?;
        let raw = self.transport.post(&self.url, "application/json", body)?;
        let response: BulkImportResponse = serde_json::from_str(&raw)?;

        if response.success {
            Ok(response)
        } else {
            Err(SinkError::Rejected(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    fn request(&self, table: TallyTable, operation: ImportOperation, tenant: &Tenant, rows: &[Row]) -> BulkImportRequest {
        BulkImportRequest {
            api_key: self.api_key.clone(),
            company_id: tenant.company_id.clone(),
            division_id: tenant.division_id.clone(),
            table: table.name().to_string(),
            operation,
            data: rows.to_vec(),
        }
    }
}

impl<T: Transport> Sink for EdgeFunctionSink<T> {
    /// A replace with no rows deletes the tenant's rows and inserts nothing.
    fn clear(&self, table: TallyTable, tenant: &Tenant) -> Result<usize, SinkError> {
        let response = self.send(&self.request(table, ImportOperation::Replace, tenant, &[]))?;
        Ok(response.deleted)
    }

    fn write_chunk(
        &self,
        table: TallyTable,
        operation: ImportOperation,
        tenant: &Tenant,
        rows: &[Row],
    ) -> Result<ImportStats, SinkError> {
        let response = self.send(&self.request(table, operation, tenant, rows))?;
        Ok(ImportStats {
            inserted: response.inserted,
            updated: response.updated,
            unchanged: response.unchanged,
            deleted: response.deleted,
            chunks: 0,
        })
    }

    /// The bulk-import contract has no per-row delete; stale lines stay until
    /// the next replace.
    fn prune_entries(
        &self,
        table: TallyTable,
        _tenant: &Tenant,
        entry_sets: &[(String, HashSet<String>)],
    ) -> Result<usize, SinkError> {
        debug!(table = %table, vouchers = entry_sets.len(), "edge function cannot prune entries");
        Ok(0)
    }

    fn describe(&self) -> String {
        format!("edge function {}", self.url)
    }
}

// ============================================================================
// BATCH IMPORTER
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct BatchImporter {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl BatchImporter {
    pub fn new(batch_size: usize, retry: RetryPolicy) -> Self {
        BatchImporter {
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            retry,
        }
    }

    #[instrument(skip_all, fields(table = %table, operation = %operation, rows = rows.len()))]
    pub fn import<S: Sink + ?Sized>(
        &self,
        sink: &S,
        table: TallyTable,
        operation: ImportOperation,
        tenant: &Tenant,
        rows: &[Row],
    ) -> Result<ImportStats, ImportError> {
        let mut stats = ImportStats::default();

        let chunk_operation = if operation == ImportOperation::Replace {
            let label = format!("clear {}", table);
            stats.deleted = self
                .retry
                .run(&label, |_| sink.clear(table, tenant))
                .map_err(|e| ImportError::ClearFailed {
                    table: table.name().to_string(),
                    attempts: e.attempts,
                    source: e.error,
                })?;
            ImportOperation::Append
        } else {
            operation
        };

        for (index, chunk) in rows.chunks(self.batch_size).enumerate() {
            let chunk_number = index + 1;
            let label = format!("{} chunk {}", table, chunk_number);

            let chunk_stats = self
                .retry
                .run(&label, |_| sink.write_chunk(table, chunk_operation, tenant, chunk))
                .map_err(|e| ImportError::ChunkFailed {
                    table: table.name().to_string(),
                    chunk: chunk_number,
                    attempts: e.attempts,
                    source: e.error,
                })?;

            debug!(
                chunk = chunk_number,
                inserted = chunk_stats.inserted,
                updated = chunk_stats.updated,
                unchanged = chunk_stats.unchanged,
                "chunk written"
            );
            stats.absorb(chunk_stats);
            stats.chunks += 1;
        }

        info!(
            sink = %sink.describe(),
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            deleted = stats.deleted,
            "table imported"
        );
        Ok(stats)
    }

    /// `import` for one table of a parsed collection. An upsert of a voucher
    /// entry table also drops the lines those vouchers no longer carry.
    pub fn import_records<S: Sink + ?Sized>(
        &self,
        sink: &S,
        table: TallyTable,
        operation: ImportOperation,
        tenant: &Tenant,
        rows: &[Row],
        records: &Records,
    ) -> Result<ImportStats, ImportError> {
        let mut stats = self.import(sink, table, operation, tenant, rows)?;
        if operation == ImportOperation::Upsert && table.is_voucher_entry() {
            stats.deleted += self.prune_entries(sink, table, tenant, &records.entry_sets(table))?;
        }
        Ok(stats)
    }

    /// Drop entry rows the re-synced vouchers no longer carry. Only upserts
    /// need this: replace starts from an empty table and append never touches
    /// existing rows.
    pub fn prune_entries<S: Sink + ?Sized>(
        &self,
        sink: &S,
        table: TallyTable,
        tenant: &Tenant,
        entry_sets: &[(String, HashSet<String>)],
    ) -> Result<usize, ImportError> {
        if entry_sets.is_empty() {
            return Ok(0);
        }

        let label = format!("prune {}", table);
        let deleted = self
            .retry
            .run(&label, |_| sink.prune_entries(table, tenant, entry_sets))
            .map_err(|e| ImportError::PruneFailed {
                table: table.name().to_string(),
                attempts: e.attempts,
                source: e.error,
            })?;

        if deleted > 0 {
            info!(table = %table, deleted, "stale entries removed");
        }
        Ok(deleted)
    }
}

impl Default for BatchImporter {
    fn default() -> Self {
        BatchImporter::new(DEFAULT_BATCH_SIZE, RetryPolicy::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_rows, fetch_rows, setup_database};
    use crate::transport::mock::ScriptedTransport;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn tenant() -> Tenant {
        Tenant::new("company-1", "division-1")
    }

    fn ledger(guid: &str, closing: f64) -> Row {
        json!({
            "guid": guid,
            "name": format!("Ledger {}", guid),
            "parent": "Sundry Debtors",
            "opening_balance": 0.0,
            "closing_balance": closing,
            "is_deemed_positive": true,
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn ledgers(n: usize) -> Vec<Row> {
        (1..=n).map(|i| ledger(&format!("led-{}", i), i as f64 * 10.0)).collect()
    }

    fn importer(batch_size: usize) -> BatchImporter {
        BatchImporter::new(batch_size, RetryPolicy::linear(5, Duration::ZERO))
    }

    fn count(conn: &Connection) -> i64 {
        count_rows(conn, Schema::Legacy, TallyTable::Ledgers, &tenant()).unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let conn = setup();
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        let rows = ledgers(5);

        let first = importer(2)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &rows)
            .unwrap();
        assert_eq!(first.inserted, 5);
        assert_eq!(first.chunks, 3);

        let second = importer(2)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &rows)
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 5);
        assert_eq!(count(&conn), 5);
    }

    #[test]
    fn test_upsert_detects_changes() {
        let conn = setup();
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &ledgers(3))
            .unwrap();

        let mut rows = ledgers(4);
        rows[1] = ledger("led-2", 999.0);

        let stats = importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &rows)
            .unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.unchanged, 2);

        let stored = fetch_rows(&conn, Schema::Legacy, TallyTable::Ledgers, &tenant()).unwrap();
        let led2 = stored.iter().find(|r| r.guid == "led-2").unwrap();
        assert_eq!(led2.row["closing_balance"], json!(999.0));
    }

    #[test]
    fn test_replace_clears_only_the_tenant() {
        let conn = setup();
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        let other = Tenant::new("company-2", "division-1");

        importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &ledgers(4))
            .unwrap();
        importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &other, &ledgers(2))
            .unwrap();

        let stats = importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Replace, &tenant(), &ledgers(1))
            .unwrap();
        assert_eq!(stats.deleted, 4);
        assert_eq!(stats.inserted, 1);
        assert_eq!(count(&conn), 1);
        assert_eq!(count_rows(&conn, Schema::Legacy, TallyTable::Ledgers, &other).unwrap(), 2);
    }

    #[test]
    fn test_append_skips_existing_guids() {
        let conn = setup();
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Append, &tenant(), &ledgers(2))
            .unwrap();

        let mut rows = ledgers(3);
        rows[0] = ledger("led-1", 12345.0);
        let stats = importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Append, &tenant(), &rows)
            .unwrap();

        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.unchanged, 2);

        // Append never overwrites
        let stored = fetch_rows(&conn, Schema::Legacy, TallyTable::Ledgers, &tenant()).unwrap();
        assert_eq!(stored[0].row["closing_balance"], json!(10.0));
    }

    #[test]
    fn test_row_without_guid_is_rejected() {
        let conn = setup();
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        let mut rows = ledgers(2);
        rows[1].remove("guid");

        let err = importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &rows)
            .unwrap_err();
        assert!(matches!(err, ImportError::ChunkFailed { attempts: 1, .. }));
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn test_empty_import_does_nothing() {
        let conn = setup();
        let sink = SqliteSink::new(&conn, Schema::Legacy);
        let stats = importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &[])
            .unwrap();
        assert_eq!(stats, ImportStats::default());
    }

    #[test]
    fn test_edge_function_recovers_after_two_failures() {
        let transport = ScriptedTransport::new()
            .fail(503)
            .fail(500)
            .respond(r#"{"success": true, "inserted": 3, "updated": 0, "unchanged": 0, "deleted": 0}"#);
        let sink = EdgeFunctionSink::new(transport, "https://edge/functions/v1/tally-bulk-import", "key");

        let stats = importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &ledgers(3))
            .unwrap();
        assert_eq!(stats.inserted, 3);
        assert_eq!(sink.transport.request_count(), 3);

        let requests = sink.transport.requests.lock().unwrap();
        let body: BulkImportRequest = serde_json::from_str(&requests[2].1).unwrap();
        assert_eq!(body.table, "ledgers");
        assert_eq!(body.operation, ImportOperation::Upsert);
        assert_eq!(body.company_id, "company-1");
        assert_eq!(body.data.len(), 3);
    }

    #[test]
    fn test_edge_function_gives_up_after_five_attempts() {
        let transport = (0..5).fold(ScriptedTransport::new(), |t, _| t.fail(503));
        let sink = EdgeFunctionSink::new(transport, "https://edge/functions/v1/tally-bulk-import", "key");

        let err = importer(500)
            .import(&sink, TallyTable::Vouchers, ImportOperation::Upsert, &tenant(), &ledgers(1))
            .unwrap_err();

        assert_eq!(err.table(), "vouchers");
        assert!(matches!(err, ImportError::ChunkFailed { attempts: 5, chunk: 1, .. }));
        assert!(err.to_string().contains("vouchers"));
        assert_eq!(sink.transport.request_count(), 5);
    }

    #[test]
    fn test_edge_function_rejection_is_not_retried() {
        let transport = ScriptedTransport::new()
            .respond(r#"{"success": false, "error": "Invalid API key"}"#)
            .respond(r#"{"success": true}"#);
        let sink = EdgeFunctionSink::new(transport, "https://edge", "wrong");

        let err = importer(500)
            .import(&sink, TallyTable::Ledgers, ImportOperation::Upsert, &tenant(), &ledgers(1))
            .unwrap_err();
        assert!(err.to_string().contains("Invalid API key"));
        assert_eq!(sink.transport.request_count(), 1);
    }

    #[test]
    fn test_operation_from_str() {
        assert_eq!("Replace".parse::<ImportOperation>(), Ok(ImportOperation::Replace));
        assert_eq!("insert".parse::<ImportOperation>(), Ok(ImportOperation::Append));
        assert!("merge".parse::<ImportOperation>().is_err());
    }
}
