// ⚖️ Reconciliation Engine - compare namespaces, check the trial balance
//
// Namespace diff (bkp_ → vt_, vt_ → legacy, ...), keyed by GUID:
//   matched  - same GUID, same content hash
//   changed  - same GUID, different content hash
//   missing  - in source, not in target
//   extra    - in target, not in source
//
// Trial balance: every ledger's balance, signed debit-negative, must sum to
// zero for opening and closing balances alike.

use crate::db::{self, fetch_rows, Schema, TallyTable, Tenant};
use crate::entities::Row;
use crate::import::{ImportOperation, Sink, SqliteSink};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, instrument};

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// Opening and closing balances both net to zero
    Balanced { opening_total: f64, closing_total: f64 },

    /// Off by a small amount (< 10.00)
    MinorDiscrepancy {
        opening_total: f64,
        closing_total: f64,
        difference: f64,
        tolerance: f64,
    },

    /// Off by 10.00 or more
    MajorDiscrepancy {
        opening_total: f64,
        closing_total: f64,
        difference: f64,
    },
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced { .. })
    }

    pub fn has_discrepancy(&self) -> bool {
        !self.is_balanced()
    }

    pub fn difference(&self) -> f64 {
        match self {
            ReconciliationResult::Balanced { .. } => 0.0,
            ReconciliationResult::MinorDiscrepancy { difference, .. } => *difference,
            ReconciliationResult::MajorDiscrepancy { difference, .. } => *difference,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialBalance {
    pub schema: Schema,
    pub ledger_count: i64,
    pub result: ReconciliationResult,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl TrialBalance {
    pub fn summary(&self) -> String {
        let status = match &self.result {
            ReconciliationResult::Balanced { .. } => "balanced",
            ReconciliationResult::MinorDiscrepancy { .. } => "minor discrepancy",
            ReconciliationResult::MajorDiscrepancy { .. } => "MAJOR discrepancy",
        };
        format!(
            "Trial balance ({} schema): {} ledgers, {}, difference {:.2}",
            self.schema,
            self.ledger_count,
            status,
            self.result.difference()
        )
    }
}

// ============================================================================
// NAMESPACE DIFF
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDiff {
    pub table: TallyTable,
    pub source: Schema,
    pub target: Schema,
    pub matched: usize,
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    pub changed: Vec<String>,
}

impl TableDiff {
    pub fn is_in_sync(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.changed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {} → {}: {} matched, {} missing, {} changed, {} extra",
            self.table,
            self.source,
            self.target,
            self.matched,
            self.missing.len(),
            self.changed.len(),
            self.extra.len()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    pub inserted: usize,
    pub updated: usize,
    pub pruned: usize,
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    /// Tolerance for floating-point comparisons (default: 0.01)
    pub tolerance: f64,

    /// Threshold for minor vs major discrepancy (default: 10.00)
    pub major_discrepancy_threshold: f64,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine {
            tolerance: 0.01,
            major_discrepancy_threshold: 10.0,
        }
    }

    #[instrument(skip(self, conn, tenant))]
    pub fn reconcile_table(
        &self,
        conn: &Connection,
        source: Schema,
        target: Schema,
        table: TallyTable,
        tenant: &Tenant,
    ) -> Result<TableDiff> {
        let source_rows = fetch_rows(conn, source, table, tenant)?;
        let target_hashes: HashMap<String, String> = fetch_rows(conn, target, table, tenant)?
            .into_iter()
            .map(|r| (r.guid, r.content_hash))
            .collect();

        let mut diff = TableDiff {
            table,
            source,
            target,
            matched: 0,
            missing: Vec::new(),
            extra: Vec::new(),
            changed: Vec::new(),
        };

        let mut seen = HashSet::with_capacity(source_rows.len());
        for row in source_rows {
            match target_hashes.get(&row.guid) {
                Some(hash) if *hash == row.content_hash => diff.matched += 1,
                Some(_) => diff.changed.push(row.guid.clone()),
                None => diff.missing.push(row.guid.clone()),
            }
            seen.insert(row.guid);
        }

        let mut extra: Vec<String> = target_hashes
            .into_keys()
            .filter(|guid| !seen.contains(guid))
            .collect();
        extra.sort();
        diff.extra = extra;

        info!(
            matched = diff.matched,
            missing = diff.missing.len(),
            changed = diff.changed.len(),
            extra = diff.extra.len(),
            "table reconciled"
        );
        Ok(diff)
    }

    pub fn reconcile_all(
        &self,
        conn: &Connection,
        source: Schema,
        target: Schema,
        tenant: &Tenant,
    ) -> Result<Vec<TableDiff>> {
        TallyTable::ALL
            .iter()
            .map(|table| self.reconcile_table(conn, source, target, *table, tenant))
            .collect()
    }

    /// Copy missing and changed rows into the target; with `prune`, delete
    /// rows the source doesn't have.
    #[instrument(skip(self, conn, diff, tenant), fields(table = %diff.table))]
    pub fn apply(&self, conn: &Connection, diff: &TableDiff, tenant: &Tenant, prune: bool) -> Result<ApplyStats> {
        let wanted: HashSet<&str> = diff
            .missing
            .iter()
            .chain(diff.changed.iter())
            .map(String::as_str)
            .collect();

        let rows: Vec<Row> = fetch_rows(conn, diff.source, diff.table, tenant)?
            .into_iter()
            .filter(|r| wanted.contains(r.guid.as_str()))
            .map(|r| r.row)
            .collect();

        let mut stats = ApplyStats::default();

        if !rows.is_empty() {
            let written = SqliteSink::new(conn, diff.target)
                .write_chunk(diff.table, ImportOperation::Upsert, tenant, &rows)
                .with_context(|| format!("Failed to copy {} into {} schema", diff.table, diff.target))?;
            stats.inserted = written.inserted;
            stats.updated = written.updated;
        }

        if prune {
            for guid in &diff.extra {
                stats.pruned += db::delete_row(conn, diff.target, diff.table, tenant, guid)?;
            }
        }

        info!(
            inserted = stats.inserted,
            updated = stats.updated,
            pruned = stats.pruned,
            "reconciliation applied"
        );
        Ok(stats)
    }

    #[instrument(skip(self, conn, tenant))]
    pub fn trial_balance(&self, conn: &Connection, schema: Schema, tenant: &Tenant) -> Result<TrialBalance> {
        let (ledger_count, opening_total, closing_total): (i64, f64, f64) = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(opening_balance), 0.0), COALESCE(SUM(closing_balance), 0.0)
                     FROM {} WHERE company_id = ?1 AND division_id = ?2",
                    TallyTable::Ledgers.qualified(schema)
                ),
                params![tenant.company_id, tenant.division_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to sum ledger balances")?;

        Ok(TrialBalance {
            schema,
            ledger_count,
            result: self.classify(round2(opening_total), round2(closing_total)),
            checked_at: chrono::Utc::now(),
        })
    }

    pub fn classify(&self, opening_total: f64, closing_total: f64) -> ReconciliationResult {
        let difference = opening_total.abs().max(closing_total.abs());

        if difference <= self.tolerance {
            ReconciliationResult::Balanced {
                opening_total,
                closing_total,
            }
        } else if difference < self.major_discrepancy_threshold {
            ReconciliationResult::MinorDiscrepancy {
                opening_total,
                closing_total,
                difference,
                tolerance: self.tolerance,
            }
        } else {
            ReconciliationResult::MajorDiscrepancy {
                opening_total,
                closing_total,
                difference,
            }
        }
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// TESTS
// ============================================================================
