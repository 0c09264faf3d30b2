// 🧾 Voucher Entity - Tally transaction documents
//
// A voucher carries its postings inline:
//   ALLLEDGERENTRIES.LIST      → AccountingEntry (one per ledger line)
//   ALLINVENTORYENTRIES.LIST   → InventoryEntry  (one per stock line)
// Entries get a derived GUID "<voucher_guid>:L<n>" / ":I<n>" so they can be
// upserted like every other row.

use super::{FieldSource, Row, TallyRecord};
use crate::coerce::{split_quantity, synthetic_guid, tally_date_to_iso};
use crate::db::TallyTable;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

const LEDGER_ENTRY_KEYS: &[&str] = &[
    "ALLLEDGERENTRIES.LIST",
    "LEDGERENTRIES.LIST",
    "ledger_entries",
    "accounting_entries",
];

const INVENTORY_ENTRY_KEYS: &[&str] = &[
    "ALLINVENTORYENTRIES.LIST",
    "INVENTORYENTRIES.LIST",
    "inventory_entries",
];

// ============================================================================
// VOUCHER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub guid: String,
    /// ISO date (YYYY-MM-DD)
    pub date: String,
    pub voucher_type: String,
    pub voucher_number: String,
    pub reference: String,
    pub party_ledger_name: String,
    pub narration: String,
    /// Voucher total (sum of debits)
    pub amount: f64,
    pub is_cancelled: bool,
    pub is_optional: bool,
    pub is_invoice: bool,

    #[serde(default)]
    pub ledger_entries: Vec<AccountingEntry>,

    #[serde(default)]
    pub inventory_entries: Vec<InventoryEntry>,
}

impl Voucher {
    pub fn from_fields<F: FieldSource>(fields: &F) -> Result<Self> {
        let voucher_type = fields.string(&["VOUCHERTYPENAME", "VCHTYPE", "VOUCHERTYPE"]);
        let voucher_number = fields.string(&["VOUCHERNUMBER"]);
        let raw_date = fields.string(&["DATE"]);

        let Some(date) = tally_date_to_iso(&raw_date) else {
            bail!(
                "voucher {} ({}) has no valid DATE: {:?}",
                voucher_number,
                voucher_type,
                raw_date
            );
        };

        let guid = fields
            .text(&["GUID"])
            .unwrap_or_else(|| synthetic_guid("voucher", &[&date, &voucher_type, &voucher_number]));

        let ledger_entries: Vec<AccountingEntry> = fields
            .children(LEDGER_ENTRY_KEYS)
            .iter()
            .enumerate()
            .map(|(i, entry)| AccountingEntry::from_fields(entry, &guid, i + 1))
            .collect();

        let inventory_entries: Vec<InventoryEntry> = fields
            .children(INVENTORY_ENTRY_KEYS)
            .iter()
            .enumerate()
            .map(|(i, entry)| InventoryEntry::from_fields(entry, &guid, i + 1))
            .collect();

        let amount = match fields.text(&["AMOUNT"]) {
            Some(_) => fields.number(&["AMOUNT"]).abs(),
            None => round2(ledger_entries.iter().map(|e| e.amount.abs()).sum::<f64>() / 2.0),
        };

        Ok(Voucher {
            guid,
            date,
            voucher_type,
            voucher_number,
            reference: fields.string(&["REFERENCE"]),
            party_ledger_name: fields.string(&["PARTYLEDGERNAME", "PARTYNAME"]),
            narration: fields.string(&["NARRATION"]),
            amount,
            is_cancelled: fields.flag(&["ISCANCELLED"]),
            is_optional: fields.flag(&["ISOPTIONAL"]),
            is_invoice: fields.flag(&["ISINVOICE"]),
            ledger_entries,
            inventory_entries,
        })
    }

    /// Sum of signed ledger amounts; zero for a balanced voucher
    pub fn entry_balance(&self) -> f64 {
        round2(self.ledger_entries.iter().map(|e| e.amount).sum())
    }
}

impl TallyRecord for Voucher {
    const TABLE: TallyTable = TallyTable::Vouchers;

    fn guid(&self) -> &str {
        &self.guid
    }

    /// Header columns only; entries go to their own tables.
    fn to_row(&self) -> Row {
        let mut row = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Row::new(),
        };
        row.remove("ledger_entries");
        row.remove("inventory_entries");
        row
    }
}

// ============================================================================
// ACCOUNTING ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingEntry {
    pub guid: String,
    pub voucher_guid: String,
    /// 1-based line number inside the voucher
    pub position: i64,
    pub ledger_name: String,
    /// Signed: debit negative, credit positive
    pub amount: f64,
    pub is_deemed_positive: bool,
    pub is_party_ledger: bool,
}

impl AccountingEntry {
    pub fn from_fields<F: FieldSource>(fields: &F, voucher_guid: &str, position: usize) -> Self {
        AccountingEntry {
            guid: format!("{}:L{}", voucher_guid, position),
            voucher_guid: voucher_guid.to_string(),
            position: position as i64,
            ledger_name: fields.string(&["LEDGERNAME"]),
            amount: fields.number(&["AMOUNT"]),
            is_deemed_positive: fields.flag(&["ISDEEMEDPOSITIVE"]),
            is_party_ledger: fields.flag(&["ISPARTYLEDGER"]),
        }
    }
}

impl TallyRecord for AccountingEntry {
    const TABLE: TallyTable = TallyTable::AccountingEntries;

    fn guid(&self) -> &str {
        &self.guid
    }
}

// ============================================================================
// INVENTORY ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub guid: String,
    pub voucher_guid: String,
    pub position: i64,
    pub stock_item_name: String,
    pub quantity: f64,
    pub unit: String,
    pub rate: f64,
    pub amount: f64,
    pub godown: String,
}

impl InventoryEntry {
    pub fn from_fields<F: FieldSource>(fields: &F, voucher_guid: &str, position: usize) -> Self {
        let (quantity, unit) =
            split_quantity(&fields.string(&["BILLEDQTY", "ACTUALQTY", "QUANTITY"]));
        let (rate, _) = split_quantity(&fields.string(&["RATE"]));

        // Godown sits inside the batch allocation in full exports
        let godown = fields
            .children(&["BATCHALLOCATIONS.LIST", "batch_allocations"])
            .first()
            .and_then(|batch| batch.text(&["GODOWNNAME"]))
            .or_else(|| fields.text(&["GODOWNNAME", "GODOWN"]))
            .unwrap_or_default();

        InventoryEntry {
            guid: format!("{}:I{}", voucher_guid, position),
            voucher_guid: voucher_guid.to_string(),
            position: position as i64,
            stock_item_name: fields.string(&["STOCKITEMNAME"]),
            quantity,
            unit: fields.text(&["UNIT"]).or(unit).unwrap_or_default(),
            rate,
            amount: fields.number(&["AMOUNT"]),
            godown,
        }
    }
}

impl TallyRecord for InventoryEntry {
    const TABLE: TallyTable = TallyTable::InventoryEntries;

    fn guid(&self) -> &str {
        &self.guid
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
