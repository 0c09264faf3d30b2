use crate::entities::Row;
use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// TABLES & COLUMNS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Real,
    Integer,
    /// Stored as INTEGER 0/1, surfaced as JSON bool
    Bool,
}

impl ColumnKind {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Real => "REAL",
            ColumnKind::Integer | ColumnKind::Bool => "INTEGER",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn text(name: &'static str) -> Column {
    Column { name, kind: ColumnKind::Text }
}

const fn real(name: &'static str) -> Column {
    Column { name, kind: ColumnKind::Real }
}

const fn int(name: &'static str) -> Column {
    Column { name, kind: ColumnKind::Integer }
}

const fn flag(name: &'static str) -> Column {
    Column { name, kind: ColumnKind::Bool }
}

const GROUP_COLUMNS: &[Column] = &[
    text("guid"),
    text("name"),
    text("parent"),
    text("nature"),
    flag("is_revenue"),
    flag("is_deemed_positive"),
    flag("affects_gross_profit"),
];

const LEDGER_COLUMNS: &[Column] = &[
    text("guid"),
    text("name"),
    text("parent"),
    text("alias"),
    real("opening_balance"),
    real("closing_balance"),
    text("gstin"),
    text("email"),
    flag("is_revenue"),
    flag("is_deemed_positive"),
];

const STOCK_ITEM_COLUMNS: &[Column] = &[
    text("guid"),
    text("name"),
    text("parent"),
    text("category"),
    text("base_units"),
    real("opening_quantity"),
    real("opening_rate"),
    real("opening_value"),
    text("hsn_code"),
];

const VOUCHER_TYPE_COLUMNS: &[Column] = &[
    text("guid"),
    text("name"),
    text("parent"),
    text("numbering_method"),
    flag("is_deemed_positive"),
    flag("affects_stock"),
];

const COST_CENTRE_COLUMNS: &[Column] = &[
    text("guid"),
    text("name"),
    text("parent"),
    text("category"),
];

const VOUCHER_COLUMNS: &[Column] = &[
    text("guid"),
    text("date"),
    text("voucher_type"),
    text("voucher_number"),
    text("reference"),
    text("party_ledger_name"),
    text("narration"),
    real("amount"),
    flag("is_cancelled"),
    flag("is_optional"),
    flag("is_invoice"),
];

const ACCOUNTING_ENTRY_COLUMNS: &[Column] = &[
    text("guid"),
    text("voucher_guid"),
    int("position"),
    text("ledger_name"),
    real("amount"),
    flag("is_deemed_positive"),
    flag("is_party_ledger"),
];

const INVENTORY_ENTRY_COLUMNS: &[Column] = &[
    text("guid"),
    text("voucher_guid"),
    int("position"),
    text("stock_item_name"),
    real("quantity"),
    text("unit"),
    real("rate"),
    real("amount"),
    text("godown"),
];

/// Every table the pipeline writes. Each exists once per `Schema`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TallyTable {
    Groups,
    Ledgers,
    StockItems,
    VoucherTypes,
    CostCentres,
    Vouchers,
    AccountingEntries,
    InventoryEntries,
}

impl TallyTable {
    pub const ALL: [TallyTable; 8] = [
        TallyTable::Groups,
        TallyTable::Ledgers,
        TallyTable::StockItems,
        TallyTable::VoucherTypes,
        TallyTable::CostCentres,
        TallyTable::Vouchers,
        TallyTable::AccountingEntries,
        TallyTable::InventoryEntries,
    ];

    /// Unprefixed table name
    pub fn name(&self) -> &'static str {
        match self {
            TallyTable::Groups => "account_groups",
            TallyTable::Ledgers => "ledgers",
            TallyTable::StockItems => "stock_items",
            TallyTable::VoucherTypes => "voucher_types",
            TallyTable::CostCentres => "cost_centres",
            TallyTable::Vouchers => "vouchers",
            TallyTable::AccountingEntries => "accounting_entries",
            TallyTable::InventoryEntries => "inventory_entries",
        }
    }

    /// Record columns, `guid` first. Tenancy and bookkeeping columns are
    /// added by the DDL, not listed here.
    pub fn columns(&self) -> &'static [Column] {
        match self {
            TallyTable::Groups => GROUP_COLUMNS,
            TallyTable::Ledgers => LEDGER_COLUMNS,
            TallyTable::StockItems => STOCK_ITEM_COLUMNS,
            TallyTable::VoucherTypes => VOUCHER_TYPE_COLUMNS,
            TallyTable::CostCentres => COST_CENTRE_COLUMNS,
            TallyTable::Vouchers => VOUCHER_COLUMNS,
            TallyTable::AccountingEntries => ACCOUNTING_ENTRY_COLUMNS,
            TallyTable::InventoryEntries => INVENTORY_ENTRY_COLUMNS,
        }
    }

    pub fn qualified(&self, schema: Schema) -> String {
        format!("{}{}", schema.prefix(), self.name())
    }

    /// Tables whose rows hang off a voucher through `voucher_guid`
    pub fn is_voucher_entry(&self) -> bool {
        matches!(self, TallyTable::AccountingEntries | TallyTable::InventoryEntries)
    }
}

impl fmt::Display for TallyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TallyTable {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        if wanted == "groups" {
            return Ok(TallyTable::Groups);
        }
        TallyTable::ALL
            .iter()
            .copied()
            .find(|t| t.name() == wanted)
            .ok_or_else(|| format!("unknown table: {}", s))
    }
}

// ============================================================================
// SCHEMAS (table namespaces)
// ============================================================================

/// SQLite has no schemas; each namespace is a table-name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schema {
    #[default]
    Legacy,
    /// `bkp_` backup tables
    Backup,
    /// `vt_` migration target
    Vt,
}

impl Schema {
    pub const ALL: [Schema; 3] = [Schema::Legacy, Schema::Backup, Schema::Vt];

    pub fn prefix(&self) -> &'static str {
        match self {
            Schema::Legacy => "",
            Schema::Backup => "bkp_",
            Schema::Vt => "vt_",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Schema::Legacy => "legacy",
            Schema::Backup => "backup",
            Schema::Vt => "vt",
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Schema {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" | "public" => Ok(Schema::Legacy),
            "backup" | "bkp" => Ok(Schema::Backup),
            "vt" => Ok(Schema::Vt),
            other => Err(format!("unknown schema: {}", other)),
        }
    }
}

// ============================================================================
// TENANCY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub company_id: String,
    pub division_id: String,
}

impl Tenant {
    pub fn new(company_id: impl Into<String>, division_id: impl Into<String>) -> Self {
        Tenant {
            company_id: company_id.into(),
            division_id: division_id.into(),
        }
    }

    /// Inject the tenancy columns into a record
    pub fn enrich(&self, mut row: Row) -> Row {
        row.insert("company_id".to_string(), Value::String(self.company_id.clone()));
        row.insert("division_id".to_string(), Value::String(self.division_id.clone()));
        row
    }
}

/// A row as read back from a table
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub guid: String,
    pub content_hash: String,
    pub row: Row,
}

// ============================================================================
// SETUP
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases report "memory" and that's fine
    let _mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .context("Failed to set journal mode")?;

    for schema in Schema::ALL {
        for table in TallyTable::ALL {
            let name = table.qualified(schema);
            conn.execute(&create_table_sql(table, schema), [])
                .with_context(|| format!("Failed to create table {}", name))?;

            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{name}_tenant ON {name}(company_id, division_id)"
                ),
                [],
            )?;
        }

        let vouchers = TallyTable::Vouchers.qualified(schema);
        conn.execute(
            &format!("CREATE INDEX IF NOT EXISTS idx_{vouchers}_date ON {vouchers}(date)"),
            [],
        )?;

        for entries in [TallyTable::AccountingEntries, TallyTable::InventoryEntries] {
            let name = entries.qualified(schema);
            conn.execute(
                &format!("CREATE INDEX IF NOT EXISTS idx_{name}_voucher ON {name}(voucher_guid)"),
                [],
            )?;
        }
    }

    Ok(())
}

fn create_table_sql(table: TallyTable, schema: Schema) -> String {
    let fields: Vec<String> = table
        .columns()
        .iter()
        .filter(|c| c.name != "guid")
        .map(|c| format!("{} {}", c.name, c.kind.sql_type()))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            guid TEXT NOT NULL,
            company_id TEXT NOT NULL,
            division_id TEXT NOT NULL,
            {},
            content_hash TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (guid, company_id, division_id)
        )",
        table.qualified(schema),
        fields.join(",\n            ")
    )
}

// ============================================================================
// VALUE CONVERSION
// ============================================================================

pub fn to_sql_value(value: &Value, kind: ColumnKind) -> SqlValue {
    match (value, kind) {
        (Value::Null, _) => SqlValue::Null,

        (Value::String(s), ColumnKind::Text) => SqlValue::Text(s.clone()),
        (Value::Bool(b), ColumnKind::Text) => SqlValue::Text(b.to_string()),
        (other, ColumnKind::Text) => SqlValue::Text(other.to_string()),

        (Value::Number(n), ColumnKind::Real) => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        (Value::String(s), ColumnKind::Real) => crate::coerce::parse_number(s)
            .map(SqlValue::Real)
            .unwrap_or(SqlValue::Null),
        (Value::Bool(b), ColumnKind::Real) => SqlValue::Real(if *b { 1.0 } else { 0.0 }),

        (Value::Number(n), ColumnKind::Integer) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(SqlValue::Integer)
            .unwrap_or(SqlValue::Null),
        (Value::String(s), ColumnKind::Integer) => s
            .trim()
            .parse::<i64>()
            .map(SqlValue::Integer)
            .unwrap_or(SqlValue::Null),
        (Value::Bool(b), ColumnKind::Integer) => SqlValue::Integer(*b as i64),

        (Value::Bool(b), ColumnKind::Bool) => SqlValue::Integer(*b as i64),
        (Value::String(s), ColumnKind::Bool) => {
            SqlValue::Integer(crate::coerce::parse_bool(s) as i64)
        }
        (Value::Number(n), ColumnKind::Bool) => {
            SqlValue::Integer((n.as_f64().unwrap_or(0.0) != 0.0) as i64)
        }

        _ => SqlValue::Null,
    }
}

pub fn from_sql_value(value: SqlValue, kind: ColumnKind) -> Value {
    match (value, kind) {
        (SqlValue::Null, _) => Value::Null,
        (SqlValue::Integer(i), ColumnKind::Bool) => Value::Bool(i != 0),
        (SqlValue::Integer(i), ColumnKind::Real) => Value::from(i as f64),
        (SqlValue::Integer(i), _) => Value::from(i),
        (SqlValue::Real(f), _) => Value::from(f),
        (SqlValue::Text(s), _) => Value::String(s),
        (SqlValue::Blob(_), _) => Value::Null,
    }
}

/// Field values in column order, normalized through the column types so a
/// row hashes the same before insert and after reading it back.
fn canonical_values(table: TallyTable, row: &Row) -> Vec<Value> {
    table
        .columns()
        .iter()
        .map(|c| {
            let raw = row.get(c.name).unwrap_or(&Value::Null);
            from_sql_value(to_sql_value(raw, c.kind), c.kind)
        })
        .collect()
}

/// Change-detection hash over the record's field columns
pub fn content_hash(table: TallyTable, row: &Row) -> String {
    let values = canonical_values(table, row);
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(&values).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

pub fn row_guid(row: &Row) -> Option<&str> {
    row.get("guid").and_then(Value::as_str).filter(|g| !g.is_empty())
}

// ============================================================================
// ROW OPERATIONS
// ============================================================================

/// What to do when the GUID already exists for the tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Let the UNIQUE constraint fail
    Fail,
    /// `ON CONFLICT DO NOTHING`
    Ignore,
}

/// Insert one row. Returns the number of rows written (0 when ignored).
pub fn insert_row(
    conn: &Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
    row: &Row,
    on_conflict: OnConflict,
) -> rusqlite::Result<usize> {
    let columns = table.columns();
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = (1..=columns.len() + 3).map(|i| format!("?{}", i)).collect();

    let conflict_clause = match on_conflict {
        OnConflict::Fail => "",
        OnConflict::Ignore => " ON CONFLICT(guid, company_id, division_id) DO NOTHING",
    };

    let sql = format!(
        "INSERT INTO {} ({}, company_id, division_id, content_hash) VALUES ({}){}",
        table.qualified(schema),
        names.join(", "),
        placeholders.join(", "),
        conflict_clause
    );

    let mut values: Vec<SqlValue> = columns
        .iter()
        .map(|c| to_sql_value(row.get(c.name).unwrap_or(&Value::Null), c.kind))
        .collect();
    values.push(SqlValue::Text(tenant.company_id.clone()));
    values.push(SqlValue::Text(tenant.division_id.clone()));
    values.push(SqlValue::Text(content_hash(table, row)));

    conn.execute(&sql, params_from_iter(values))
}

/// Overwrite every field of an existing row, keyed by GUID
pub fn update_row(
    conn: &Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
    row: &Row,
) -> rusqlite::Result<usize> {
    let fields: Vec<&Column> = table.columns().iter().filter(|c| c.name != "guid").collect();
    let assignments: Vec<String> = fields
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", c.name, i + 1))
        .collect();

    let n = fields.len();
    let sql = format!(
        "UPDATE {} SET {}, content_hash = ?{} WHERE guid = ?{} AND company_id = ?{} AND division_id = ?{}",
        table.qualified(schema),
        assignments.join(", "),
        n + 1,
        n + 2,
        n + 3,
        n + 4
    );

    let mut values: Vec<SqlValue> = fields
        .iter()
        .map(|c| to_sql_value(row.get(c.name).unwrap_or(&Value::Null), c.kind))
        .collect();
    values.push(SqlValue::Text(content_hash(table, row)));
    values.push(SqlValue::Text(row_guid(row).unwrap_or_default().to_string()));
    values.push(SqlValue::Text(tenant.company_id.clone()));
    values.push(SqlValue::Text(tenant.division_id.clone()));

    conn.execute(&sql, params_from_iter(values))
}

pub fn stored_hash(
    conn: &Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
    guid: &str,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        &format!(
            "SELECT content_hash FROM {} WHERE guid = ?1 AND company_id = ?2 AND division_id = ?3",
            table.qualified(schema)
        ),
        params![guid, tenant.company_id, tenant.division_id],
        |row| row.get(0),
    )
    .optional()
}

/// `DELETE ... WHERE company_id = ?1 AND division_id = ?2`
pub fn delete_tenant_rows(
    conn: &Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE company_id = ?1 AND division_id = ?2",
            table.qualified(schema)
        ),
        params![tenant.company_id, tenant.division_id],
    )
}

pub fn delete_row(
    conn: &Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
    guid: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE guid = ?1 AND company_id = ?2 AND division_id = ?3",
            table.qualified(schema)
        ),
        params![guid, tenant.company_id, tenant.division_id],
    )
}

/// Delete the entry rows of `voucher_guid` whose GUID is not in `keep`.
/// A voucher re-exported with fewer lines leaves its old trailing lines
/// behind otherwise.
pub fn delete_stale_entries(
    conn: &Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
    voucher_guid: &str,
    keep: &HashSet<String>,
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(&format!(
        "SELECT guid FROM {} WHERE voucher_guid = ?1 AND company_id = ?2 AND division_id = ?3",
        table.qualified(schema)
    ))?;
    let stored = stmt
        .query_map(params![voucher_guid, tenant.company_id, tenant.division_id], |r| {
            r.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut deleted = 0;
    for guid in stored.iter().filter(|guid| !keep.contains(*guid)) {
        deleted += delete_row(conn, schema, table, tenant, guid)?;
    }
    Ok(deleted)
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn count_rows(conn: &Connection, schema: Schema, table: TallyTable, tenant: &Tenant) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE company_id = ?1 AND division_id = ?2",
            table.qualified(schema)
        ),
        params![tenant.company_id, tenant.division_id],
        |row| row.get(0),
    )?;

    Ok(count)
}

/// All rows of a tenant, ordered by insertion
pub fn fetch_rows(
    conn: &Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
) -> Result<Vec<StoredRow>> {
    let columns = table.columns();
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();

    let mut stmt = conn.prepare(&format!(
        "SELECT {}, content_hash FROM {} WHERE company_id = ?1 AND division_id = ?2 ORDER BY id",
        names.join(", "),
        table.qualified(schema)
    ))?;

    let rows = stmt
        .query_map(params![tenant.company_id, tenant.division_id], |sql_row| {
            let mut row = Row::new();
            for (i, column) in columns.iter().enumerate() {
                let value: SqlValue = sql_row.get(i)?;
                row.insert(column.name.to_string(), from_sql_value(value, column.kind));
            }
            let content_hash: String = sql_row.get(columns.len())?;

            Ok(StoredRow {
                guid: row_guid(&row).unwrap_or_default().to_string(),
                content_hash,
                row,
            })
        })?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read {}", table.qualified(schema)))?;

    Ok(rows)
}

/// Row counts per schema and table for one tenant
#[derive(Debug, Clone, Serialize)]
pub struct TableCount {
    pub schema: Schema,
    pub table: TallyTable,
    pub rows: i64,
}

pub fn table_counts(conn: &Connection, tenant: &Tenant) -> Result<Vec<TableCount>> {
    let mut counts = Vec::new();
    for schema in Schema::ALL {
        for table in TallyTable::ALL {
            counts.push(TableCount {
                schema,
                table,
                rows: count_rows(conn, schema, table, tenant)?,
            });
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger_row(guid: &str, name: &str, closing: f64) -> Row {
        let value = json!({
            "guid": guid,
            "name": name,
            "parent": "Sundry Debtors",
            "alias": "",
            "opening_balance": 0.0,
            "closing_balance": closing,
            "gstin": "",
            "email": "",
            "is_revenue": false,
            "is_deemed_positive": true,
        });
        value.as_object().unwrap().clone()
    }

    fn tenant() -> Tenant {
        Tenant::new("company-1", "division-1")
    }

    #[test]
    fn test_setup_creates_all_namespaces() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('ledgers', 'bkp_ledgers', 'vt_ledgers')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);

        // Running setup twice is harmless
        setup_database(&conn).unwrap();
    }

    #[test]
    fn test_insert_and_fetch_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let row = ledger_row("led-1", "Acme Traders", -1500.0);
        let written = insert_row(&conn, Schema::Legacy, TallyTable::Ledgers, &tenant(), &row, OnConflict::Fail).unwrap();
        assert_eq!(written, 1);

        let stored = fetch_rows(&conn, Schema::Legacy, TallyTable::Ledgers, &tenant()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].guid, "led-1");
        assert_eq!(stored[0].row["closing_balance"], json!(-1500.0));
        assert_eq!(stored[0].row["is_deemed_positive"], json!(true));
        assert_eq!(stored[0].content_hash, content_hash(TallyTable::Ledgers, &row));
    }

    #[test]
    fn test_duplicate_guid_conflicts() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let row = ledger_row("led-1", "Acme Traders", 0.0);
        insert_row(&conn, Schema::Legacy, TallyTable::Ledgers, &tenant(), &row, OnConflict::Fail).unwrap();

        let err = insert_row(&conn, Schema::Legacy, TallyTable::Ledgers, &tenant(), &row, OnConflict::Fail);
        assert!(matches!(
            err,
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation
        ));

        let ignored = insert_row(&conn, Schema::Legacy, TallyTable::Ledgers, &tenant(), &row, OnConflict::Ignore).unwrap();
        assert_eq!(ignored, 0);

        // Same GUID under another tenant is a different row
        let other = Tenant::new("company-2", "division-1");
        insert_row(&conn, Schema::Legacy, TallyTable::Ledgers, &other, &row, OnConflict::Fail).unwrap();
        assert_eq!(count_rows(&conn, Schema::Legacy, TallyTable::Ledgers, &tenant()).unwrap(), 1);
        assert_eq!(count_rows(&conn, Schema::Legacy, TallyTable::Ledgers, &other).unwrap(), 1);
    }

    #[test]
    fn test_update_and_delete_tenant_rows() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let row = ledger_row("led-1", "Acme Traders", 0.0);
        insert_row(&conn, Schema::Vt, TallyTable::Ledgers, &tenant(), &row, OnConflict::Fail).unwrap();

        let changed = ledger_row("led-1", "Acme Traders Pvt Ltd", 250.0);
        update_row(&conn, Schema::Vt, TallyTable::Ledgers, &tenant(), &changed).unwrap();

        let hash = stored_hash(&conn, Schema::Vt, TallyTable::Ledgers, &tenant(), "led-1").unwrap();
        assert_eq!(hash, Some(content_hash(TallyTable::Ledgers, &changed)));

        let deleted = delete_tenant_rows(&conn, Schema::Vt, TallyTable::Ledgers, &tenant()).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(stored_hash(&conn, Schema::Vt, TallyTable::Ledgers, &tenant(), "led-1").unwrap(), None);
    }

    #[test]
    fn test_delete_stale_entries_keeps_current_lines() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        for (voucher, line) in [("v-1", 1), ("v-1", 2), ("v-1", 3), ("v-2", 1)] {
            let row = json!({
                "guid": format!("{}:L{}", voucher, line),
                "voucher_guid": voucher,
                "position": line,
                "ledger_name": "Cash",
                "amount": 100.0,
            });
            let row = row.as_object().unwrap().clone();
            insert_row(&conn, Schema::Legacy, TallyTable::AccountingEntries, &tenant(), &row, OnConflict::Fail).unwrap();
        }

        let keep: HashSet<String> = ["v-1:L1".to_string(), "v-1:L2".to_string()].into();
        let deleted = delete_stale_entries(&conn, Schema::Legacy, TallyTable::AccountingEntries, &tenant(), "v-1", &keep).unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(count_rows(&conn, Schema::Legacy, TallyTable::AccountingEntries, &tenant()).unwrap(), 3);
        assert!(stored_hash(&conn, Schema::Legacy, TallyTable::AccountingEntries, &tenant(), "v-1:L3").unwrap().is_none());
        assert!(stored_hash(&conn, Schema::Legacy, TallyTable::AccountingEntries, &tenant(), "v-2:L1").unwrap().is_some());
    }

    #[test]
    fn test_content_hash_ignores_number_representation() {
        let mut a = ledger_row("led-1", "Cash", 100.0);
        let mut b = a.clone();
        b.insert("closing_balance".to_string(), json!(100));
        assert_eq!(content_hash(TallyTable::Ledgers, &a), content_hash(TallyTable::Ledgers, &b));

        // Tenancy columns are not part of the content
        a = Tenant::new("x", "y").enrich(a);
        assert_eq!(content_hash(TallyTable::Ledgers, &a), content_hash(TallyTable::Ledgers, &b));
    }

    #[test]
    fn test_table_and_schema_names() {
        assert_eq!(TallyTable::Groups.qualified(Schema::Backup), "bkp_account_groups");
        assert_eq!(TallyTable::Vouchers.qualified(Schema::Vt), "vt_vouchers");
        assert_eq!("groups".parse::<TallyTable>(), Ok(TallyTable::Groups));
        assert_eq!("accounting_entries".parse::<TallyTable>(), Ok(TallyTable::AccountingEntries));
        assert_eq!("bkp".parse::<Schema>(), Ok(Schema::Backup));
    }
}
