// 🔢 Value Coercion - Tally strings → typed values
// Tally exports everything as text: dates as YYYYMMDD, amounts with commas,
// quantities with units glued on, booleans as Yes/No.

use chrono::NaiveDate;
use uuid::Uuid;

// ============================================================================
// DATES
// ============================================================================

/// Convert a Tally date to ISO `YYYY-MM-DD`.
///
/// Accepts the export format `YYYYMMDD`, ISO dates, and the display formats
/// `1-Apr-2024` / `1-Apr-24`. Returns `None` when nothing matches.
pub fn tally_date_to_iso(raw: &str) -> Option<String> {
    parse_tally_date(raw).map(|d| d.format("%Y-%m-%d").to_string())
}

pub fn parse_tally_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if s.len() == 8 && s.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::parse_from_str(s, "%Y%m%d").ok();
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }

    // D-Mon-YYYY or D-Mon-YY; %Y would happily read "24" as year 24
    let year_len = s.rsplit('-').next().map(str::len).unwrap_or(0);
    match year_len {
        4 => NaiveDate::parse_from_str(s, "%d-%b-%Y").ok(),
        2 => NaiveDate::parse_from_str(s, "%d-%b-%y").ok(),
        _ => None,
    }
}

/// Format a date the way Tally expects it in request envelopes.
pub fn to_tally_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

// ============================================================================
// NUMBERS
// ============================================================================

/// Parse a Tally amount such as `"-1,25,000.50"` or `"₹ 100"`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let chars: Vec<char> = raw.trim().chars().collect();
    let mut cleaned = String::with_capacity(chars.len());

    for (i, &c) in chars.iter().enumerate() {
        let keep = match c {
            '0'..='9' | '.' | '-' | '+' => true,
            // Exponent only between digits: "1.5e3" but not "100 Each"
            'e' | 'E' => cleaned.ends_with(|p: char| p.is_ascii_digit()) && exponent_follows(&chars[i + 1..]),
            _ => false,
        };
        if keep {
            cleaned.push(c);
        }
    }

    if cleaned.is_empty() {
        return None;
    }

    cleaned.parse::<f64>().ok()
}

fn exponent_follows(rest: &[char]) -> bool {
    match rest {
        [d, ..] if d.is_ascii_digit() => true,
        ['+' | '-', d, ..] => d.is_ascii_digit(),
        _ => false,
    }
}

/// Split a quantity like `" 10 Nos"` into `(10.0, Some("Nos"))`.
///
/// Rates (`"100.00/Nos"`) go through the same path; the unit after the slash
/// is returned as the unit.
pub fn split_quantity(raw: &str) -> (f64, Option<String>) {
    let s = raw.trim().replace(',', "");
    let numeric_end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let value = s[..numeric_end].parse::<f64>().unwrap_or(0.0);
    let unit = s[numeric_end..]
        .trim_start_matches(|c: char| c.is_whitespace() || c == '/')
        .trim();

    let unit = if unit.is_empty() {
        None
    } else {
        Some(unit.to_string())
    };

    (value, unit)
}

// ============================================================================
// BOOLEANS
// ============================================================================

/// Tally booleans: `Yes`/`No`, but proxies also send `1`/`0` and `true`.
pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

// ============================================================================
// GUIDS
// ============================================================================

/// Deterministic GUID for records Tally exported without one.
///
/// Same kind + parts always yields the same key, so re-runs upsert onto the
/// row created by the previous run instead of duplicating it.
pub fn synthetic_guid(kind: &str, parts: &[&str]) -> String {
    let seed = format!("{}:{}", kind, parts.join("|"));
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

// ============================================================================
// XML TEXT
// ============================================================================

/// Decode XML entities and drop control characters (Tally writes `&#4;`
/// in front of reserved names like "Primary").
pub fn unescape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];

        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            rest = "";
            break;
        };

        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
            }
            _ if entity.starts_with('#') => entity[1..].parse::<u32>().ok().and_then(char::from_u32),
            _ => None,
        };

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);

    out.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eight_digit_date_to_iso() {
        assert_eq!(tally_date_to_iso("20240401"), Some("2024-04-01".to_string()));
        assert_eq!(tally_date_to_iso(" 20231231 "), Some("2023-12-31".to_string()));
    }

    #[test]
    fn test_invalid_dates_are_none() {
        assert_eq!(tally_date_to_iso("20241340"), None);
        assert_eq!(tally_date_to_iso(""), None);
        assert_eq!(tally_date_to_iso("yesterday"), None);
    }

    #[test]
    fn test_display_dates() {
        assert_eq!(tally_date_to_iso("1-Apr-2024"), Some("2024-04-01".to_string()));
        assert_eq!(tally_date_to_iso("15-Mar-24"), Some("2024-03-15".to_string()));
        assert_eq!(tally_date_to_iso("2024-04-01"), Some("2024-04-01".to_string()));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("-1,25,000.50"), Some(-125000.50));
        assert_eq!(parse_number("₹ 100"), Some(100.0));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("100 Each"), Some(100.0));
        assert_eq!(parse_number("12.5 Kgs"), Some(12.5));
        assert_eq!(parse_number("1.5e3"), Some(1500.0));
    }

    #[test]
    fn test_split_quantity() {
        assert_eq!(split_quantity(" 10 Nos"), (10.0, Some("Nos".to_string())));
        assert_eq!(split_quantity("100.00/Nos"), (100.0, Some("Nos".to_string())));
        assert_eq!(split_quantity("-2.5 Kgs"), (-2.5, Some("Kgs".to_string())));
        assert_eq!(split_quantity(""), (0.0, None));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("Yes"));
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(!parse_bool("No"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_synthetic_guid_is_stable() {
        let a = synthetic_guid("ledger", &["Cash"]);
        let b = synthetic_guid("ledger", &["Cash"]);
        let c = synthetic_guid("group", &["Cash"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_unescape_xml() {
        assert_eq!(unescape_xml("&#4; Primary"), "Primary");
        assert_eq!(unescape_xml("R&amp;D &lt;Unit&gt;"), "R&D <Unit>");
        assert_eq!(unescape_xml("A &#x41;"), "A A");
        assert_eq!(unescape_xml("Tom & Jerry"), "Tom & Jerry");
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("R&D <Co>"), "R&amp;D &lt;Co&gt;");
    }
}
