// 📦 Stock Item Entity

use super::{master_identity, FieldSource, TallyRecord};
use crate::coerce::split_quantity;
use crate::db::TallyTable;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
    pub guid: String,
    pub name: String,
    /// Stock group name
    pub parent: String,
    pub category: String,
    pub base_units: String,
    pub opening_quantity: f64,
    pub opening_rate: f64,
    pub opening_value: f64,
    pub hsn_code: String,
}

impl StockItem {
    pub fn from_fields<F: FieldSource>(fields: &F) -> Result<Self> {
        let (guid, name) = master_identity(fields, "stock_item")?;

        // Tally writes " 25 Nos" for the opening balance of an item
        let (opening_quantity, quantity_unit) =
            split_quantity(&fields.string(&["OPENINGBALANCE", "OPENINGQUANTITY"]));
        let (opening_rate, _) = split_quantity(&fields.string(&["OPENINGRATE"]));

        let base_units = fields
            .text(&["BASEUNITS"])
            .or(quantity_unit)
            .unwrap_or_default();

        Ok(StockItem {
            guid,
            name,
            parent: fields.string(&["PARENT"]),
            category: fields.string(&["CATEGORY"]),
            base_units,
            opening_quantity,
            opening_rate,
            opening_value: fields.number(&["OPENINGVALUE"]),
            hsn_code: fields.string(&["HSNCODE", "GSTHSNCODE"]),
        })
    }
}

impl TallyRecord for StockItem {
    const TABLE: TallyTable = TallyTable::StockItems;

    fn guid(&self) -> &str {
        &self.guid
    }
}
