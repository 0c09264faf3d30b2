// ✅ Data Quality Engine - non-blocking checks before import
//
// Nothing here stops a sync: issues are logged and counted in the report so
// an operator can fix the books in Tally and re-run.

use crate::entities::group::PRIMARY;
use crate::entities::{Group, Records, Voucher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ============================================================================
// ISSUES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Record is wrong as stored in Tally
    Warning,  // Record is questionable or incomplete
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub rule: String,
    pub guid: String,
    /// Name for masters, type + number for vouchers
    pub record: String,
    pub issue: String,
}

impl QualityIssue {
    fn new(severity: Severity, rule: &str, guid: &str, record: impl Into<String>, issue: impl Into<String>) -> Self {
        QualityIssue {
            severity,
            rule: rule.to_string(),
            guid: guid.to_string(),
            record: record.into(),
            issue: issue.into(),
        }
    }
}

// ============================================================================
// QUALITY REPORT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub checked: usize,
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.count(Severity::Critical) > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} records checked, {} issues ({} critical, {} warnings)",
            self.checked,
            self.issues.len(),
            self.count(Severity::Critical),
            self.count(Severity::Warning)
        )
    }
}

// ============================================================================
// DATA QUALITY ENGINE
// ============================================================================

pub struct DataQualityEngine {
    /// Largest entry imbalance still treated as rounding (default: 0.01)
    pub balance_tolerance: f64,

    /// Group names known from earlier syncs, accepted as parents
    known_groups: HashSet<String>,
}

impl DataQualityEngine {
    pub fn new() -> Self {
        DataQualityEngine {
            balance_tolerance: 0.01,
            known_groups: HashSet::new(),
        }
    }

    pub fn with_known_groups<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_groups
            .extend(names.into_iter().map(|n| n.into().to_lowercase()));
        self
    }

    pub fn validate(&self, records: &Records) -> QualityReport {
        let mut issues = Vec::new();

        match records {
            Records::Groups(groups) => self.check_groups(groups, &mut issues),
            Records::Ledgers(v) => check_names(v.iter().map(|r| (&r.guid, &r.name)), &mut issues),
            Records::StockItems(v) => check_names(v.iter().map(|r| (&r.guid, &r.name)), &mut issues),
            Records::VoucherTypes(v) => check_names(v.iter().map(|r| (&r.guid, &r.name)), &mut issues),
            Records::CostCentres(v) => check_names(v.iter().map(|r| (&r.guid, &r.name)), &mut issues),
            Records::Vouchers(vouchers) => {
                for voucher in vouchers {
                    self.check_voucher(voucher, &mut issues);
                }
            }
        }

        QualityReport {
            checked: records.len(),
            issues,
        }
    }

    fn check_groups(&self, groups: &[Group], issues: &mut Vec<QualityIssue>) {
        check_names(groups.iter().map(|g| (&g.guid, &g.name)), issues);

        let names: HashSet<String> = groups.iter().map(|g| g.name.to_lowercase()).collect();
        for group in groups.iter().filter(|g| !g.is_primary()) {
            let parent = group.parent.to_lowercase();
            if !names.contains(&parent) && !self.known_groups.contains(&parent) {
                issues.push(QualityIssue::new(
                    Severity::Warning,
                    "unknown_parent",
                    &group.guid,
                    &group.name,
                    format!("parent group '{}' is neither in this batch nor {}", group.parent, PRIMARY),
                ));
            }
        }
    }

    fn check_voucher(&self, voucher: &Voucher, issues: &mut Vec<QualityIssue>) {
        let label = format!("{} {}", voucher.voucher_type, voucher.voucher_number);

        if voucher.voucher_type.trim().is_empty() {
            issues.push(QualityIssue::new(
                Severity::Warning,
                "missing_voucher_type",
                &voucher.guid,
                &label,
                "voucher has no type",
            ));
        }

        if voucher.ledger_entries.is_empty() {
            if !voucher.is_cancelled {
                issues.push(QualityIssue::new(
                    Severity::Warning,
                    "no_entries",
                    &voucher.guid,
                    &label,
                    "voucher has no accounting entries",
                ));
            }
            return;
        }

        let balance = voucher.entry_balance();
        if balance.abs() > self.balance_tolerance {
            issues.push(QualityIssue::new(
                Severity::Critical,
                "unbalanced",
                &voucher.guid,
                &label,
                format!("accounting entries are off by {:.2}", balance),
            ));
        }
    }
}

impl Default for DataQualityEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn check_names<'a>(records: impl Iterator<Item = (&'a String, &'a String)>, issues: &mut Vec<QualityIssue>) {
    for (guid, name) in records {
        if name.trim().is_empty() {
            issues.push(QualityIssue::new(
                Severity::Critical,
                "empty_name",
                guid,
                "",
                "master has no name",
            ));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::AccountingEntry;

    fn group(name: &str, parent: &str) -> Group {
        Group {
            guid: format!("g-{}", name),
            name: name.to_string(),
            parent: parent.to_string(),
            nature: "Assets".to_string(),
            is_revenue: false,
            is_deemed_positive: true,
            affects_gross_profit: false,
        }
    }

    fn entry(voucher_guid: &str, position: i64, ledger: &str, amount: f64) -> AccountingEntry {
        AccountingEntry {
            guid: format!("{}:L{}", voucher_guid, position),
            voucher_guid: voucher_guid.to_string(),
            position,
            ledger_name: ledger.to_string(),
            amount,
            is_deemed_positive: amount < 0.0,
            is_party_ledger: false,
        }
    }

    fn voucher(guid: &str, amounts: &[f64]) -> Voucher {
        Voucher {
            guid: guid.to_string(),
            date: "2024-04-01".to_string(),
            voucher_type: "Journal".to_string(),
            voucher_number: "1".to_string(),
            reference: String::new(),
            party_ledger_name: String::new(),
            narration: String::new(),
            amount: 0.0,
            is_cancelled: false,
            is_optional: false,
            is_invoice: false,
            ledger_entries: amounts
                .iter()
                .enumerate()
                .map(|(i, a)| entry(guid, i as i64 + 1, "Ledger", *a))
                .collect(),
            inventory_entries: Vec::new(),
        }
    }

    #[test]
    fn test_balanced_voucher_passes() {
        let report = DataQualityEngine::new().validate(&Records::Vouchers(vec![voucher("v-1", &[-100.0, 60.0, 40.0])]));
        assert!(report.issues.is_empty());
        assert_eq!(report.checked, 1);
    }

    #[test]
    fn test_unbalanced_voucher_is_critical() {
        let report = DataQualityEngine::new().validate(&Records::Vouchers(vec![voucher("v-1", &[-100.0, 99.0])]));
        assert!(report.has_critical_issues());
        assert_eq!(report.issues[0].rule, "unbalanced");
    }

    #[test]
    fn test_rounding_within_tolerance() {
        let report = DataQualityEngine::new().validate(&Records::Vouchers(vec![voucher("v-1", &[-100.0, 99.995])]));
        assert!(!report.has_critical_issues());
    }

    #[test]
    fn test_voucher_without_entries() {
        let mut cancelled = voucher("v-2", &[]);
        cancelled.is_cancelled = true;
        let report = DataQualityEngine::new().validate(&Records::Vouchers(vec![voucher("v-1", &[]), cancelled]));

        assert_eq!(report.count(Severity::Warning), 1);
        assert_eq!(report.issues[0].guid, "v-1");
    }

    #[test]
    fn test_group_parents() {
        let groups = vec![
            group("Current Assets", "Primary"),
            group("Bank Accounts", "Current Assets"),
            group("Petty Cash", "Cash-in-Hand"),
        ];

        let report = DataQualityEngine::new().validate(&Records::Groups(groups.clone()));
        assert_eq!(report.count(Severity::Warning), 1);
        assert_eq!(report.issues[0].record, "Petty Cash");

        let report = DataQualityEngine::new()
            .with_known_groups(["Cash-in-Hand"])
            .validate(&Records::Groups(groups));
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_empty_name_is_critical() {
        let report = DataQualityEngine::new().validate(&Records::Groups(vec![group(" ", "Primary")]));
        assert_eq!(report.count(Severity::Critical), 1);
        assert!(report.summary().contains("1 critical"));
    }
}
