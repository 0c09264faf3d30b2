// 🔍 Deduplication Engine - one row per GUID before import
// Same GUID twice in one payload: the later record replaces the earlier.
// Same voucher number under different GUIDs: reported, kept.

use crate::entities::{Records, TallyRecord, Voucher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// MATCH STRATEGY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchStrategy {
    /// Same voucher type, number and date under different GUIDs
    SameVoucherNumber,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub first_index: usize,
    pub second_index: usize,
    pub strategy: MatchStrategy,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupOutcome {
    pub records: Records,
    /// Records dropped because a later one had the same GUID
    pub removed: usize,
    /// Probable duplicates that were kept
    pub probable: Vec<DuplicateMatch>,
}

// ============================================================================
// DEDUPLICATION ENGINE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DeduplicationEngine {
    /// Skip the voucher-number check entirely
    pub skip_probable: bool,
}

impl DeduplicationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dedupe(&self, records: Records) -> DedupOutcome {
        let mut removed = 0;

        let records = match records {
            Records::Groups(v) => Records::Groups(collapse_by(v, &mut removed)),
            Records::Ledgers(v) => Records::Ledgers(collapse_by(v, &mut removed)),
            Records::StockItems(v) => Records::StockItems(collapse_by(v, &mut removed)),
            Records::VoucherTypes(v) => Records::VoucherTypes(collapse_by(v, &mut removed)),
            Records::CostCentres(v) => Records::CostCentres(collapse_by(v, &mut removed)),
            Records::Vouchers(v) => Records::Vouchers(collapse_by(v, &mut removed)),
        };

        let probable = match &records {
            Records::Vouchers(vouchers) if !self.skip_probable => self.find_probable_duplicates(vouchers),
            _ => Vec::new(),
        };

        DedupOutcome {
            records,
            removed,
            probable,
        }
    }

    /// Vouchers sharing (type, number, date) under different GUIDs. Tally
    /// allows this with manual numbering, so they are reported, not dropped.
    pub fn find_probable_duplicates(&self, vouchers: &[Voucher]) -> Vec<DuplicateMatch> {
        let mut seen: HashMap<(String, &str, &str), usize> = HashMap::new();
        let mut matches = Vec::new();

        for (index, voucher) in vouchers.iter().enumerate() {
            if voucher.voucher_number.is_empty() {
                continue;
            }

            let key = (
                voucher.voucher_type.to_lowercase(),
                voucher.voucher_number.as_str(),
                voucher.date.as_str(),
            );

            match seen.get(&key) {
                Some(&first) if vouchers[first].guid != voucher.guid => {
                    matches.push(DuplicateMatch {
                        first_index: first,
                        second_index: index,
                        strategy: MatchStrategy::SameVoucherNumber,
                        reason: format!(
                            "{} {} on {} appears under two GUIDs",
                            voucher.voucher_type, voucher.voucher_number, voucher.date
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    seen.insert(key, index);
                }
            }
        }

        matches
    }
}

fn collapse_by<T: TallyRecord>(items: Vec<T>, removed: &mut usize) -> Vec<T> {
    let (kept, dropped) = collapse_by_guid(items);
    *removed += dropped;
    kept
}

/// Last occurrence wins; it takes the slot of the first occurrence.
fn collapse_by_guid<T: TallyRecord>(items: Vec<T>) -> (Vec<T>, usize) {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    let mut dropped = 0;

    for item in items {
        match slots.get(item.guid()) {
            Some(&slot) => {
                kept[slot] = item;
                dropped += 1;
            }
            None => {
                slots.insert(item.guid().to_string(), kept.len());
                kept.push(item);
            }
        }
    }

    (kept, dropped)
}

// ============================================================================
// TESTS
// ============================================================================
