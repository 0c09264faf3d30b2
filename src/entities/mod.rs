// Entity Models - Tally masters and vouchers
//
// Each entity is a flat record keyed by Tally's GUID. Parents are plain name
// strings, exactly as Tally exports them. The same `from_fields` constructor
// serves XML and JSON input through the `FieldSource` trait.

pub mod cost_centre;
pub mod group;
pub mod ledger;
pub mod stock_item;
pub mod voucher;
pub mod voucher_type;

pub use cost_centre::CostCentre;
pub use group::Group;
pub use ledger::Ledger;
pub use stock_item::StockItem;
pub use voucher::{AccountingEntry, InventoryEntry, Voucher};
pub use voucher_type::VoucherType;

use crate::coerce::{parse_bool, parse_number, synthetic_guid};
use crate::db::TallyTable;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A flat record ready for a sink: column name → JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// FIELD ACCESS
// ============================================================================

/// Uniform read access over an XML element or a JSON object.
///
/// Keys are given in Tally's tag spelling (`OPENINGBALANCE`); JSON sources
/// match them loosely (`opening_balance`, `$OpeningBalance`).
pub trait FieldSource: Sized {
    /// First non-empty value for any of `keys`.
    fn text(&self, keys: &[&str]) -> Option<String>;

    /// Nested records (ledger entries, inventory entries, allocations).
    fn children(&self, keys: &[&str]) -> Vec<Self>;

    fn string(&self, keys: &[&str]) -> String {
        self.text(keys).unwrap_or_default()
    }

    fn number(&self, keys: &[&str]) -> f64 {
        self.text(keys)
            .and_then(|s| parse_number(&s))
            .unwrap_or(0.0)
    }

    fn flag(&self, keys: &[&str]) -> bool {
        self.text(keys).map(|s| parse_bool(&s)).unwrap_or(false)
    }
}

/// Resolve `(guid, name)` for a master, synthesizing the GUID from the name
/// when Tally left it out.
pub(crate) fn master_identity<F: FieldSource>(fields: &F, kind: &str) -> Result<(String, String)> {
    let name = fields.string(&["NAME"]);
    match fields.text(&["GUID"]) {
        Some(guid) => Ok((guid, name)),
        None if !name.is_empty() => Ok((synthetic_guid(kind, &[&name]), name)),
        None => bail!("{} record has neither GUID nor NAME", kind),
    }
}

// ============================================================================
// RECORD TRAIT
// ============================================================================

/// A record that maps onto one table.
pub trait TallyRecord: Serialize {
    const TABLE: TallyTable;

    fn guid(&self) -> &str;

    /// Column map for the record's table. Field names match column names.
    fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Row::new(),
        }
    }
}

// ============================================================================
// COLLECTIONS
// ============================================================================

/// A Tally export unit. Masters map to one table each; vouchers feed three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Groups,
    Ledgers,
    StockItems,
    VoucherTypes,
    CostCentres,
    Vouchers,
}

impl Collection {
    /// Dependency order: parents before children, masters before vouchers.
    pub const ALL: [Collection; 6] = [
        Collection::Groups,
        Collection::Ledgers,
        Collection::StockItems,
        Collection::VoucherTypes,
        Collection::CostCentres,
        Collection::Vouchers,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            Collection::Groups => "groups",
            Collection::Ledgers => "ledgers",
            Collection::StockItems => "stock_items",
            Collection::VoucherTypes => "voucher_types",
            Collection::CostCentres => "cost_centres",
            Collection::Vouchers => "vouchers",
        }
    }

    /// XML element Tally uses for one record of this collection
    pub fn element(&self) -> &'static str {
        match self {
            Collection::Groups => "GROUP",
            Collection::Ledgers => "LEDGER",
            Collection::StockItems => "STOCKITEM",
            Collection::VoucherTypes => "VOUCHERTYPE",
            Collection::CostCentres => "COSTCENTRE",
            Collection::Vouchers => "VOUCHER",
        }
    }

    /// TDL object type for the export request
    pub fn tdl_type(&self) -> &'static str {
        match self {
            Collection::Groups => "Group",
            Collection::Ledgers => "Ledger",
            Collection::StockItems => "StockItem",
            Collection::VoucherTypes => "VoucherType",
            Collection::CostCentres => "CostCentre",
            Collection::Vouchers => "Voucher",
        }
    }

    /// Fields requested in the TDL `FETCH` list
    pub fn fetch_fields(&self) -> &'static [&'static str] {
        match self {
            Collection::Groups => &[
                "GUID",
                "Name",
                "Parent",
                "IsRevenue",
                "IsDeemedPositive",
                "AffectsGrossProfit",
            ],
            Collection::Ledgers => &[
                "GUID",
                "Name",
                "Parent",
                "OpeningBalance",
                "ClosingBalance",
                "PartyGSTIN",
                "Email",
                "IsRevenue",
                "IsDeemedPositive",
            ],
            Collection::StockItems => &[
                "GUID",
                "Name",
                "Parent",
                "Category",
                "BaseUnits",
                "OpeningBalance",
                "OpeningRate",
                "OpeningValue",
                "HSNCode",
            ],
            Collection::VoucherTypes => &[
                "GUID",
                "Name",
                "Parent",
                "NumberingMethod",
                "IsDeemedPositive",
                "AffectsStock",
            ],
            Collection::CostCentres => &["GUID", "Name", "Parent", "Category"],
            Collection::Vouchers => &[
                "GUID",
                "Date",
                "VoucherTypeName",
                "VoucherNumber",
                "Reference",
                "PartyLedgerName",
                "Narration",
                "IsCancelled",
                "IsOptional",
                "IsInvoice",
                "AllLedgerEntries",
                "AllInventoryEntries",
            ],
        }
    }

    /// Tables populated from this collection, in import order
    pub fn tables(&self) -> &'static [TallyTable] {
        match self {
            Collection::Groups => &[TallyTable::Groups],
            Collection::Ledgers => &[TallyTable::Ledgers],
            Collection::StockItems => &[TallyTable::StockItems],
            Collection::VoucherTypes => &[TallyTable::VoucherTypes],
            Collection::CostCentres => &[TallyTable::CostCentres],
            Collection::Vouchers => &[
                TallyTable::Vouchers,
                TallyTable::AccountingEntries,
                TallyTable::InventoryEntries,
            ],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Collection::ALL
            .iter()
            .copied()
            .find(|c| c.slug() == wanted || c.slug().trim_end_matches('s') == wanted)
            .ok_or_else(|| format!("unknown collection: {}", s))
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// Parsed records of one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "collection", content = "records", rename_all = "snake_case")]
pub enum Records {
    Groups(Vec<Group>),
    Ledgers(Vec<Ledger>),
    StockItems(Vec<StockItem>),
    VoucherTypes(Vec<VoucherType>),
    CostCentres(Vec<CostCentre>),
    Vouchers(Vec<Voucher>),
}

impl Records {
    pub fn empty(collection: Collection) -> Self {
        match collection {
            Collection::Groups => Records::Groups(Vec::new()),
            Collection::Ledgers => Records::Ledgers(Vec::new()),
            Collection::StockItems => Records::StockItems(Vec::new()),
            Collection::VoucherTypes => Records::VoucherTypes(Vec::new()),
            Collection::CostCentres => Records::CostCentres(Vec::new()),
            Collection::Vouchers => Records::Vouchers(Vec::new()),
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            Records::Groups(_) => Collection::Groups,
            Records::Ledgers(_) => Collection::Ledgers,
            Records::StockItems(_) => Collection::StockItems,
            Records::VoucherTypes(_) => Collection::VoucherTypes,
            Records::CostCentres(_) => Collection::CostCentres,
            Records::Vouchers(_) => Collection::Vouchers,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Records::Groups(v) => v.len(),
            Records::Ledgers(v) => v.len(),
            Records::StockItems(v) => v.len(),
            Records::VoucherTypes(v) => v.len(),
            Records::CostCentres(v) => v.len(),
            Records::Vouchers(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Each voucher's GUID with the GUIDs of the `table` entries it carries
    /// now. Empty unless these are vouchers and `table` is an entry table.
    pub fn entry_sets(&self, table: TallyTable) -> Vec<(String, HashSet<String>)> {
        let Records::Vouchers(vouchers) = self else {
            return Vec::new();
        };

        vouchers
            .iter()
            .filter_map(|vch| {
                let keep: HashSet<String> = match table {
                    TallyTable::AccountingEntries => vch.ledger_entries.iter().map(|e| e.guid.clone()).collect(),
                    TallyTable::InventoryEntries => vch.inventory_entries.iter().map(|e| e.guid.clone()).collect(),
                    _ => return None,
                };
                Some((vch.guid.clone(), keep))
            })
            .collect()
    }

    /// Flatten into per-table rows. Vouchers split into voucher headers,
    /// accounting entries, and inventory entries.
    pub fn table_rows(&self) -> Vec<(TallyTable, Vec<Row>)> {
        fn rows<T: TallyRecord>(records: &[T]) -> Vec<Row> {
            records.iter().map(TallyRecord::to_row).collect()
        }

        match self {
            Records::Groups(v) => vec![(TallyTable::Groups, rows(v))],
            Records::Ledgers(v) => vec![(TallyTable::Ledgers, rows(v))],
            Records::StockItems(v) => vec![(TallyTable::StockItems, rows(v))],
            Records::VoucherTypes(v) => vec![(TallyTable::VoucherTypes, rows(v))],
            Records::CostCentres(v) => vec![(TallyTable::CostCentres, rows(v))],
            Records::Vouchers(v) => {
                let entries: Vec<Row> = v
                    .iter()
                    .flat_map(|vch| vch.ledger_entries.iter().map(TallyRecord::to_row))
                    .collect();
                let inventory: Vec<Row> = v
                    .iter()
                    .flat_map(|vch| vch.inventory_entries.iter().map(TallyRecord::to_row))
                    .collect();
                vec![
                    (TallyTable::Vouchers, rows(v)),
                    (TallyTable::AccountingEntries, entries),
                    (TallyTable::InventoryEntries, inventory),
                ]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_from_str() {
        assert_eq!("ledgers".parse::<Collection>(), Ok(Collection::Ledgers));
        assert_eq!("stock-items".parse::<Collection>(), Ok(Collection::StockItems));
        assert_eq!("voucher".parse::<Collection>(), Ok(Collection::Vouchers));
        assert!("budgets".parse::<Collection>().is_err());
    }

    #[test]
    fn test_voucher_collection_feeds_three_tables() {
        assert_eq!(Collection::Vouchers.tables().len(), 3);
        assert_eq!(Collection::Ledgers.tables(), &[TallyTable::Ledgers]);
    }

    #[test]
    fn test_empty_records() {
        let records = Records::empty(Collection::Vouchers);
        assert!(records.is_empty());
        assert_eq!(records.collection(), Collection::Vouchers);
        assert_eq!(records.table_rows().len(), 3);
        assert!(records.entry_sets(TallyTable::AccountingEntries).is_empty());
    }
}
