// 🗂️ Group Entity - Tally account groups (Sundry Debtors, Current Assets, ...)

use super::{master_identity, FieldSource, TallyRecord};
use crate::db::TallyTable;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Tally's reserved root of the group tree
pub const PRIMARY: &str = "Primary";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub guid: String,
    pub name: String,
    /// Parent group name; "Primary" for top-level groups
    pub parent: String,
    /// Assets, Liabilities, Income or Expenses
    pub nature: String,
    pub is_revenue: bool,
    pub is_deemed_positive: bool,
    pub affects_gross_profit: bool,
}

impl Group {
    pub fn from_fields<F: FieldSource>(fields: &F) -> Result<Self> {
        let (guid, name) = master_identity(fields, "group")?;
        let is_revenue = fields.flag(&["ISREVENUE"]);
        let is_deemed_positive = fields.flag(&["ISDEEMEDPOSITIVE"]);

        let nature = fields
            .text(&["NATURE", "NATUREOFGROUP"])
            .unwrap_or_else(|| derive_nature(is_revenue, is_deemed_positive).to_string());

        Ok(Group {
            guid,
            name,
            parent: fields
                .text(&["PARENT"])
                .unwrap_or_else(|| PRIMARY.to_string()),
            nature,
            is_revenue,
            is_deemed_positive,
            affects_gross_profit: fields.flag(&["AFFECTSGROSSPROFIT"]),
        })
    }

    pub fn is_primary(&self) -> bool {
        self.parent.is_empty() || self.parent.eq_ignore_ascii_case(PRIMARY)
    }
}

/// Tally classifies groups by two flags: revenue vs. balance sheet, and
/// debit (deemed positive) vs. credit.
pub fn derive_nature(is_revenue: bool, is_deemed_positive: bool) -> &'static str {
    match (is_revenue, is_deemed_positive) {
        (true, true) => "Expenses",
        (true, false) => "Income",
        (false, true) => "Assets",
        (false, false) => "Liabilities",
    }
}

impl TallyRecord for Group {
    const TABLE: TallyTable = TallyTable::Groups;

    fn guid(&self) -> &str {
        &self.guid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_nature() {
        assert_eq!(derive_nature(false, true), "Assets");
        assert_eq!(derive_nature(false, false), "Liabilities");
        assert_eq!(derive_nature(true, false), "Income");
        assert_eq!(derive_nature(true, true), "Expenses");
    }

    #[test]
    fn test_is_primary() {
        let group = Group {
            guid: "g-1".to_string(),
            name: "Current Assets".to_string(),
            parent: "Primary".to_string(),
            nature: "Assets".to_string(),
            is_revenue: false,
            is_deemed_positive: true,
            affects_gross_profit: false,
        };
        assert!(group.is_primary());
    }
}
