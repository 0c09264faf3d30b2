// 📒 Ledger Entity - Tally accounts
// Balances follow Tally's sign convention: debit negative, credit positive.

use super::{master_identity, FieldSource, TallyRecord};
use crate::db::TallyTable;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub guid: String,
    pub name: String,
    /// Parent group name (denormalized)
    pub parent: String,
    pub alias: String,
    pub opening_balance: f64,
    pub closing_balance: f64,
    pub gstin: String,
    pub email: String,
    pub is_revenue: bool,
    pub is_deemed_positive: bool,
}

impl Ledger {
    pub fn from_fields<F: FieldSource>(fields: &F) -> Result<Self> {
        let (guid, name) = master_identity(fields, "ledger")?;

        Ok(Ledger {
            guid,
            name,
            parent: fields.string(&["PARENT"]),
            alias: fields.string(&["ALIAS"]),
            opening_balance: fields.number(&["OPENINGBALANCE"]),
            closing_balance: fields.number(&["CLOSINGBALANCE"]),
            gstin: fields.string(&["PARTYGSTIN", "GSTIN"]),
            email: fields.string(&["EMAIL"]),
            is_revenue: fields.flag(&["ISREVENUE"]),
            is_deemed_positive: fields.flag(&["ISDEEMEDPOSITIVE"]),
        })
    }
}

impl TallyRecord for Ledger {
    const TABLE: TallyTable = TallyTable::Ledgers;

    fn guid(&self) -> &str {
        &self.guid
    }
}
