use super::{master_identity, FieldSource, TallyRecord};
use crate::db::TallyTable;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostCentre {
    pub guid: String,
    pub name: String,
    pub parent: String,
    /// Cost category the centre belongs to ("Primary Cost Category" by default)
    pub category: String,
}

impl CostCentre {
    pub fn from_fields<F: FieldSource>(fields: &F) -> Result<Self> {
        let (guid, name) = master_identity(fields, "cost_centre")?;

        Ok(CostCentre {
            guid,
            name,
            parent: fields.string(&["PARENT"]),
            category: fields.string(&["CATEGORY"]),
        })
    }
}

impl TallyRecord for CostCentre {
    const TABLE: TallyTable = TallyTable::CostCentres;

    fn guid(&self) -> &str {
        &self.guid
    }
}
