use super::{master_identity, FieldSource, TallyRecord};
use crate::db::TallyTable;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherType {
    pub guid: String,
    pub name: String,
    /// Base voucher type (Sales, Payment, Journal, ...)
    pub parent: String,
    pub numbering_method: String,
    pub is_deemed_positive: bool,
    pub affects_stock: bool,
}

impl VoucherType {
    pub fn from_fields<F: FieldSource>(fields: &F) -> Result<Self> {
        let (guid, name) = master_identity(fields, "voucher_type")?;

        Ok(VoucherType {
            guid,
            name,
            parent: fields.string(&["PARENT"]),
            numbering_method: fields.string(&["NUMBERINGMETHOD"]),
            is_deemed_positive: fields.flag(&["ISDEEMEDPOSITIVE"]),
            affects_stock: fields.flag(&["AFFECTSSTOCK"]),
        })
    }
}

impl TallyRecord for VoucherType {
    const TABLE: TallyTable = TallyTable::VoucherTypes;

    fn guid(&self) -> &str {
        &self.guid
    }
}
