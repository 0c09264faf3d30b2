// 📤 CSV Export - one table, one namespace, one tenant

use crate::db::{fetch_rows, Schema, TallyTable, Tenant};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Write the tenant's rows as CSV. Returns the number of data rows.
pub fn export_table<W: Write>(
    conn: &rusqlite::Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
    writer: W,
) -> Result<usize> {
    let rows = fetch_rows(conn, schema, table, tenant)?;
    let columns = table.columns();

    let mut csv = csv::Writer::from_writer(writer);

    let mut header: Vec<&str> = columns.iter().map(|c| c.name).collect();
    header.extend(["company_id", "division_id"]);
    csv.write_record(&header)?;

    for stored in &rows {
        let mut record: Vec<String> = columns.iter().map(|c| cell(stored.row.get(c.name))).collect();
        record.push(tenant.company_id.clone());
        record.push(tenant.division_id.clone());
        csv.write_record(&record)?;
    }

    csv.flush().context("Failed to flush CSV output")?;
    Ok(rows.len())
}

pub fn export_to_path(
    conn: &rusqlite::Connection,
    schema: Schema,
    table: TallyTable,
    tenant: &Tenant,
    path: &Path,
) -> Result<usize> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let count = export_table(conn, schema, table, tenant, file)?;
    info!(path = %path.display(), rows = count, table = %table.qualified(schema), "exported");
    Ok(count)
}
