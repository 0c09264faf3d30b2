// 🏗️ Parser Framework - Tally XML and proxy JSON → typed records
//
// Tally's XML is scraped with regexes rather than parsed as a document: the
// export is regular enough (one element per record, scalar children, nested
// *.LIST blocks for sub-records) and Tally is known to emit XML that strict
// parsers reject (bare control characters, undeclared entities).
//
// Both formats feed the same entity constructors through `FieldSource`.

use crate::coerce::unescape_xml;
use crate::entities::{
    Collection, CostCentre, FieldSource, Group, Ledger, Records, StockItem, Voucher, VoucherType,
};
use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::{debug, warn};

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Xml,
    Json,
}

/// Raw response body from a source
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub format: PayloadFormat,
    pub body: String,
}

impl Payload {
    pub fn xml(body: impl Into<String>) -> Self {
        Payload {
            format: PayloadFormat::Xml,
            body: body.into(),
        }
    }

    pub fn json(body: impl Into<String>) -> Self {
        Payload {
            format: PayloadFormat::Json,
            body: body.into(),
        }
    }
}

/// A record that could not be turned into an entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRecord {
    /// Position of the record in the payload (0-based)
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseOutcome {
    pub records: Records,
    pub skipped: Vec<SkippedRecord>,
}

// ============================================================================
// PARSER TRAIT & FACTORY
// ============================================================================

pub trait RecordParser {
    /// Parse one collection's payload. Bad records are skipped, not fatal.
    fn parse(&self, input: &str, collection: Collection) -> Result<ParseOutcome>;

    fn format(&self) -> PayloadFormat;
}

/// Sniff the format from the first non-blank character
pub fn detect_format(input: &str) -> Option<PayloadFormat> {
    match input.trim_start_matches('\u{feff}').trim_start().chars().next()? {
        '<' => Some(PayloadFormat::Xml),
        '{' | '[' => Some(PayloadFormat::Json),
        _ => None,
    }
}

pub fn get_parser(format: PayloadFormat) -> Box<dyn RecordParser> {
    match format {
        PayloadFormat::Xml => Box::new(XmlParser::new()),
        PayloadFormat::Json => Box::new(JsonParser::new()),
    }
}

pub fn parse_payload(payload: &Payload, collection: Collection) -> Result<ParseOutcome> {
    get_parser(payload.format).parse(&payload.body, collection)
}

/// Turn nodes into entities, logging and collecting the ones that fail.
fn build_records<F: FieldSource>(collection: Collection, nodes: &[F]) -> ParseOutcome {
    fn collect<F, T>(
        collection: Collection,
        nodes: &[F],
        build: impl Fn(&F) -> Result<T>,
        skipped: &mut Vec<SkippedRecord>,
    ) -> Vec<T> {
        let mut out = Vec::with_capacity(nodes.len());
        for (index, node) in nodes.iter().enumerate() {
            match build(node) {
                Ok(record) => out.push(record),
                Err(e) => {
                    warn!(collection = %collection, index, error = %e, "skipping unparseable record");
                    skipped.push(SkippedRecord {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }
        out
    }

    let mut skipped = Vec::new();
    let records = match collection {
        Collection::Groups => Records::Groups(collect(collection, nodes, Group::from_fields, &mut skipped)),
        Collection::Ledgers => Records::Ledgers(collect(collection, nodes, Ledger::from_fields, &mut skipped)),
        Collection::StockItems => {
            Records::StockItems(collect(collection, nodes, StockItem::from_fields, &mut skipped))
        }
        Collection::VoucherTypes => {
            Records::VoucherTypes(collect(collection, nodes, VoucherType::from_fields, &mut skipped))
        }
        Collection::CostCentres => {
            Records::CostCentres(collect(collection, nodes, CostCentre::from_fields, &mut skipped))
        }
        Collection::Vouchers => Records::Vouchers(collect(collection, nodes, Voucher::from_fields, &mut skipped)),
    };

    debug!(
        collection = %collection,
        parsed = records.len(),
        skipped = skipped.len(),
        "records built"
    );

    ParseOutcome { records, skipped }
}

// ============================================================================
// REGEX HELPERS
// ============================================================================

thread_local! {
    static REGEX_CACHE: RefCell<HashMap<String, Regex>> = RefCell::new(HashMap::new());
}

/// Compile once per thread; patterns are built from escaped tag names.
fn cached_regex(pattern: &str) -> Option<Regex> {
    REGEX_CACHE.with(|cache| {
        if let Some(re) = cache.borrow().get(pattern) {
            return Some(re.clone());
        }
        let re = Regex::new(pattern).ok()?;
        cache.borrow_mut().insert(pattern.to_string(), re.clone());
        Some(re)
    })
}

fn element_regex(tag: &str) -> Option<Regex> {
    let tag = regex::escape(tag);
    cached_regex(&format!(r"(?s)<{tag}(\s[^>]*)?>(.*?)</{tag}>"))
}

/// `<TAG .../>` with no body
fn empty_element_regex(tag: &str) -> Option<Regex> {
    let tag = regex::escape(tag);
    cached_regex(&format!(r"<{tag}(\s[^>]*)?/>"))
}

/// One `<TAG attrs>body</TAG>` occurrence
#[derive(Debug, Clone, PartialEq)]
pub struct XmlBlock {
    pub attrs: String,
    pub body: String,
}

/// Every `<TAG ...>...</TAG>` in `xml`. The tag must be followed by
/// whitespace or `>`, so `LEDGER` does not match `LEDGERNAME`.
pub fn extract_blocks(xml: &str, tag: &str) -> Vec<XmlBlock> {
    let (Some(re), Some(empty)) = (element_regex(tag), empty_element_regex(tag)) else {
        return Vec::new();
    };

    // Self-closing elements would otherwise swallow the next record
    let cleaned = empty.replace_all(xml, "");

    re.captures_iter(&cleaned)
        .map(|caps| XmlBlock {
            attrs: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
            body: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
        .collect()
}

/// Text of the first `<TAG>` child, decoded and trimmed
pub fn extract_field(xml: &str, tag: &str) -> Option<String> {
    let caps = element_regex(tag)?.captures(xml)?;
    let value = unescape_xml(caps.get(2)?.as_str());
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn extract_all_fields(xml: &str, tag: &str) -> Vec<String> {
    let Some(re) = element_regex(tag) else {
        return Vec::new();
    };
    re.captures_iter(xml)
        .filter_map(|caps| caps.get(2).map(|m| unescape_xml(m.as_str())))
        .filter(|v| !v.is_empty())
        .collect()
}

fn parse_attributes(attrs: &str) -> HashMap<String, String> {
    let Some(re) = cached_regex(r#"([A-Za-z0-9_.:-]+)\s*=\s*"([^"]*)""#) else {
        return HashMap::new();
    };
    re.captures_iter(attrs)
        .map(|caps| (caps[1].to_ascii_uppercase(), unescape_xml(&caps[2])))
        .collect()
}

/// Remove every nested `*.LIST` block so a record's scalar fields can't be
/// shadowed by same-named fields inside allocations.
pub fn strip_lists(body: &str) -> String {
    let Some(open_re) = cached_regex(r"<([A-Z0-9_]+(?:\.[A-Z0-9_]+)*\.LIST)(\s[^>]*)?>") else {
        return body.to_string();
    };

    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(caps) = open_re.captures(rest) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        out.push_str(&rest[..whole.start()]);

        if whole.as_str().ends_with("/>") {
            rest = &rest[whole.end()..];
            continue;
        }

        let after = &rest[whole.end()..];
        rest = match find_matching_close(after, name.as_str()) {
            Some(end) => &after[end..],
            None => "",
        };
    }

    out.push_str(rest);
    out
}

/// Offset just past the `</name>` closing the element already opened.
fn find_matching_close(s: &str, name: &str) -> Option<usize> {
    let open = format!("<{}", name);
    let close = format!("</{}>", name);
    let mut depth = 1;
    let mut pos = 0;

    loop {
        let next_close = pos + s[pos..].find(&close)?;

        let mut search = pos;
        while let Some(offset) = s[search..next_close].find(&open) {
            let at = search + offset;
            let follower = s[at + open.len()..].chars().next();
            if matches!(follower, Some('>') | Some(' ') | Some('\t') | Some('\r') | Some('\n')) {
                depth += 1;
            }
            search = at + open.len();
        }

        depth -= 1;
        pos = next_close + close.len();
        if depth == 0 {
            return Some(pos);
        }
    }
}

// ============================================================================
// XML
// ============================================================================

/// One XML element viewed as a record
#[derive(Debug, Clone)]
pub struct XmlNode {
    attrs: HashMap<String, String>,
    /// Full inner XML, including nested lists
    body: String,
    /// Inner XML with nested lists removed
    flat: String,
    /// Entries of the first NAME.LIST (name, then aliases)
    names: Vec<String>,
}

impl XmlNode {
    pub fn new(block: &XmlBlock) -> Self {
        let names = extract_blocks(&block.body, "NAME.LIST")
            .first()
            .map(|list| extract_all_fields(&list.body, "NAME"))
            .unwrap_or_default();

        XmlNode {
            attrs: parse_attributes(&block.attrs),
            flat: strip_lists(&block.body),
            body: block.body.clone(),
            names,
        }
    }
}

impl FieldSource for XmlNode {
    fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| {
            let tag = key.to_ascii_uppercase();

            if let Some(value) = self.attrs.get(&tag).filter(|v| !v.is_empty()) {
                return Some(value.clone());
            }
            if let Some(value) = extract_field(&self.flat, &tag) {
                return Some(value);
            }
            match tag.as_str() {
                "NAME" => self.names.first().cloned(),
                "ALIAS" => self.names.get(1).cloned(),
                _ => None,
            }
        })
    }

    fn children(&self, keys: &[&str]) -> Vec<Self> {
        keys.iter()
            .flat_map(|key| extract_blocks(&self.body, &key.to_ascii_uppercase()))
            .map(|block| XmlNode::new(&block))
            .collect()
    }
}

pub struct XmlParser;

impl XmlParser {
    pub fn new() -> Self {
        XmlParser
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser for XmlParser {
    fn parse(&self, input: &str, collection: Collection) -> Result<ParseOutcome> {
        if let Some(error) = extract_field(input, "LINEERROR") {
            bail!("Tally reported an error exporting {}: {}", collection, error);
        }

        let nodes: Vec<XmlNode> = extract_blocks(input, collection.element())
            .iter()
            .map(XmlNode::new)
            .collect();

        Ok(build_records(collection, &nodes))
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Xml
    }
}

// ============================================================================
// JSON
// ============================================================================

/// Key comparison that ignores case and `_`, `$`, `.`, spaces
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '$' | '.' | ' ' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// One JSON object viewed as a record
#[derive(Debug, Clone)]
pub struct JsonNode {
    fields: Map<String, Value>,
}

impl JsonNode {
    pub fn new(fields: Map<String, Value>) -> Self {
        JsonNode { fields }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        let wanted = normalize_key(key);
        self.fields
            .iter()
            .find(|(k, _)| normalize_key(k) == wanted)
            .map(|(_, v)| v)
    }
}

impl FieldSource for JsonNode {
    fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| match self.lookup(key)? {
            Value::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    fn children(&self, keys: &[&str]) -> Vec<Self> {
        keys.iter()
            .filter_map(|key| self.lookup(key))
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(Value::as_object)
            .map(|obj| JsonNode::new(obj.clone()))
            .collect()
    }
}

pub struct JsonParser;

impl JsonParser {
    pub fn new() -> Self {
        JsonParser
    }

    /// The record array: the document itself, or an array under the
    /// collection slug, its element name, `data`, or `records`.
    fn record_array(document: Value, collection: Collection) -> Result<Vec<Value>> {
        match document {
            Value::Array(items) => Ok(items),
            Value::Object(mut map) => {
                let candidates = [
                    normalize_key(collection.slug()),
                    normalize_key(collection.element()),
                    "data".to_string(),
                    "records".to_string(),
                ];
                let key = map
                    .keys()
                    .find(|k| candidates.contains(&normalize_key(k)) && map[*k].is_array())
                    .cloned()
                    .ok_or_else(|| anyhow!("no {} array in JSON payload", collection))?;

                match map.remove(&key) {
                    Some(Value::Array(items)) => Ok(items),
                    _ => Ok(Vec::new()),
                }
            }
            Value::Null => Ok(Vec::new()),
            other => bail!("unexpected JSON payload for {}: {}", collection, other),
        }
    }
}

impl Default for JsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser for JsonParser {
    fn parse(&self, input: &str, collection: Collection) -> Result<ParseOutcome> {
        if input.trim().is_empty() {
            return Ok(ParseOutcome {
                records: Records::empty(collection),
                skipped: Vec::new(),
            });
        }

        let document: Value = serde_json::from_str(input)
            .with_context(|| format!("Failed to parse {} JSON payload", collection))?;
        let items = Self::record_array(document, collection)?;

        let mut skipped = Vec::new();
        let mut nodes = Vec::with_capacity(items.len());
        let mut positions = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            match item {
                Value::Object(fields) => {
                    nodes.push(JsonNode::new(fields));
                    positions.push(index);
                }
                other => {
                    warn!(collection = %collection, index, "skipping non-object JSON record");
                    skipped.push(SkippedRecord {
                        index,
                        reason: format!("expected an object, got {}", other),
                    });
                }
            }
        }

        // Report skips by position in the payload, not among the objects
        let mut outcome = build_records(collection, &nodes);
        for record in &mut outcome.skipped {
            record.index = positions[record.index];
        }
        outcome.skipped.extend(skipped);
        outcome.skipped.sort_by_key(|s| s.index);
        Ok(outcome)
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Json
    }
}

// ============================================================================
// TESTS
// ============================================================================
