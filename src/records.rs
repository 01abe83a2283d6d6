use crate::snapshot::{Attributes, EdgeSnapshot, NodeSnapshot};
use crate::stats::LoadStats;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_pickle::Value;
use std::sync::atomic::Ordering;
use tracing::warn;

pub const ID_FIELD: &str = "ID";
pub const DEST_FIELD: &str = "dest_lni";

// Macro for reading a citation flag with Python truthiness
macro_rules! extract_flag {
    ($item:expr, $field:expr) => {
        truthy($item.get($field))
    };
}

// Macro for rendering an optional attribute as a CSV cell
macro_rules! extract_cell {
    ($attrs:expr, $field:expr) => {
        $attrs.get($field).map(cell_text).unwrap_or_default()
    };
}

// ====== VALUE COERCION ======

/// Render a value the way Python's `str()` does. Control characters in nested
/// strings are escaped as `\xNN`; other non-printable code points pass through.
pub fn py_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => py_repr(other),
    }
}

fn py_repr(value: &Value) -> String {
    match value {
        Value::None => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::I64(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::F64(f) => float_repr(*f),
        Value::String(s) => str_repr(s),
        Value::Bytes(b) => format!("b'{}'", b.escape_ascii()),
        Value::List(items) => format!("[{}]", join_repr(items.iter())),
        Value::Tuple(items) if items.len() == 1 => format!("({},)", py_repr(&items[0])),
        Value::Tuple(items) => format!("({})", join_repr(items.iter())),
        Value::Set(items) | Value::FrozenSet(items) if items.is_empty() => "set()".to_string(),
        Value::Set(items) | Value::FrozenSet(items) => {
            let values: Vec<Value> = items.iter().cloned().map(|v| v.into_value()).collect();
            format!("{{{}}}", join_repr(values.iter()))
        }
        Value::Dict(map) => {
            let pairs: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", py_repr(&k.clone().into_value()), py_repr(v)))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        }
    }
}

/// Shortest round-trip digits; scientific below 1e-4 and from 1e16 on, with a signed two-digit exponent.
fn float_repr(f: f64) -> String {
    if !f.is_finite() {
        return if f.is_nan() { "nan".to_string() } else { f.to_string() };
    }
    let scientific = format!("{:e}", f);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if (-4..16).contains(&exponent) {
        let fixed = f.to_string();
        if fixed.contains('.') {
            fixed
        } else {
            format!("{}.0", fixed)
        }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    }
}

/// Single quotes unless the text holds a single quote and no double quote.
fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn join_repr<'a>(items: impl Iterator<Item = &'a Value>) -> String {
    items.map(py_repr).collect::<Vec<_>>().join(", ")
}

/// Python `bool()`; a missing value is false.
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::None) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::I64(i)) => *i != 0,
        Some(Value::Int(_)) => true,
        Some(Value::F64(f)) => *f != 0.0,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Bytes(b)) => !b.is_empty(),
        Some(Value::List(items)) | Some(Value::Tuple(items)) => !items.is_empty(),
        Some(Value::Set(items)) | Some(Value::FrozenSet(items)) => !items.is_empty(),
        Some(Value::Dict(map)) => !map.is_empty(),
    }
}

/// Python `int()`: bools, ints, truncated floats and numeric strings.
pub fn coerce_int(value: Option<&Value>) -> Result<i64> {
    match value {
        Some(Value::I64(i)) => Ok(*i),
        Some(Value::Bool(b)) => Ok(i64::from(*b)),
        Some(Value::F64(f)) if f.is_finite() => {
            let whole = f.trunc();
            // i64::MIN is exactly -2^63; 2^63 itself is out of range.
            if whole < i64::MIN as f64 || whole >= -(i64::MIN as f64) {
                bail!("{} does not fit in a 64-bit count", float_repr(*f));
            }
            Ok(whole as i64)
        }
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow!("invalid literal for int(): '{}'", s)),
        Some(other) => bail!("cannot convert {} to int", py_repr(other)),
        None => bail!("value is missing"),
    }
}

/// CSV cell text: None becomes an empty cell.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::None => String::new(),
        other => py_str(other),
    }
}

// ====== NODE RECORDS ======

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    pub properties: Attributes,
}

fn node_record(key: &str, attrs: &Attributes) -> NodeRecord {
    let mut properties = attrs.clone();
    if let Some(title) = attrs.get("title") {
        properties.insert("title", Value::String(py_str(title)));
    }
    properties.insert(ID_FIELD, Value::String(key.to_string()));
    NodeRecord {
        id: key.to_string(),
        properties,
    }
}

/// One record per snapshot key: every attribute, a stringified title and `ID`.
pub fn node_records(snapshot: &NodeSnapshot) -> impl Iterator<Item = NodeRecord> + '_ {
    snapshot.iter().map(|(key, attrs)| node_record(key, attrs))
}

// ====== CITATION EDGES ======

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CitationProperties {
    pub is_in_headnote: bool,
    pub is_in_footnote: bool,
    pub is_in_overview: bool,
    pub is_in_rfc: bool,
    pub is_in_opinion: bool,
    pub count: i64,
}

impl CitationProperties {
    pub fn from_item(item: &Attributes) -> Result<Self> {
        Ok(Self {
            is_in_headnote: extract_flag!(item, "is_in_headnote"),
            is_in_footnote: extract_flag!(item, "is_in_footnote"),
            is_in_overview: extract_flag!(item, "is_in_overview"),
            is_in_rfc: extract_flag!(item, "is_in_rfc"),
            is_in_opinion: extract_flag!(item, "is_in_opinion"),
            count: coerce_int(item.get("count")).context("count")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitationEdge {
    pub source: String,
    pub properties: CitationProperties,
    pub destination: String,
}

impl CitationEdge {
    /// Composite key used as the relationship `:ID` in bulk-loader files.
    pub fn edge_id(&self) -> String {
        format!("{}-{}", self.source, self.destination)
    }
}

fn destination_of(item: &Attributes) -> Option<String> {
    match item.get(DEST_FIELD) {
        None | Some(Value::None) => None,
        Some(value) => Some(py_str(value)),
    }
}

fn citation_edge(source: &str, item: &Attributes, stats: &LoadStats) -> Option<Result<CitationEdge>> {
    let Some(destination) = destination_of(item) else {
        warn!("{} not found in item of {}: {}", DEST_FIELD, source, describe(item));
        stats.edges_skipped.fetch_add(1, Ordering::Relaxed);
        return None;
    };

    Some(
        CitationProperties::from_item(item)
            .with_context(|| format!("citation {} -> {}", source, destination))
            .map(|properties| CitationEdge {
                source: source.to_string(),
                properties,
                destination,
            }),
    )
}

fn describe(item: &Attributes) -> String {
    let pairs: Vec<String> = item
        .iter()
        .map(|(k, v)| format!("'{}': {}", k, py_repr(v)))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

/// Citation items flattened into edges; items without a destination are skipped.
pub fn citation_edges<'a>(
    snapshot: &'a EdgeSnapshot,
    stats: &'a LoadStats,
) -> impl Iterator<Item = Result<CitationEdge>> + 'a {
    snapshot.iter().flat_map(move |(source, items)| {
        items
            .iter()
            .filter_map(move |item| citation_edge(source, item, stats))
    })
}

/// Number of raw citation items, used to size progress bars.
pub fn citation_item_count(snapshot: &EdgeSnapshot) -> usize {
    snapshot.values().map(Vec::len).sum()
}

// ====== CSV ROWS ======

/// Row with a fixed set of columns, written as the header even when no row follows.
pub trait CsvRow: Serialize {
    const HEADER: &'static [&'static str];
}

/// Edge row for a Cypher `LOAD CSV` source file.
#[derive(Debug, Serialize)]
pub struct PlainEdgeRow {
    #[serde(rename = "src_ID")]
    pub src_id: String,
    #[serde(rename = "dst_ID")]
    pub dst_id: String,
    pub is_in_headnote: bool,
    pub is_in_footnote: bool,
    pub is_in_overview: bool,
    pub is_in_rfc: bool,
    pub is_in_opinion: bool,
    pub count: i64,
}

impl CsvRow for PlainEdgeRow {
    const HEADER: &'static [&'static str] = &[
        "src_ID",
        "dst_ID",
        "is_in_headnote",
        "is_in_footnote",
        "is_in_overview",
        "is_in_rfc",
        "is_in_opinion",
        "count",
    ];
}

impl From<&CitationEdge> for PlainEdgeRow {
    fn from(edge: &CitationEdge) -> Self {
        let p = edge.properties;
        Self {
            src_id: edge.source.clone(),
            dst_id: edge.destination.clone(),
            is_in_headnote: p.is_in_headnote,
            is_in_footnote: p.is_in_footnote,
            is_in_overview: p.is_in_overview,
            is_in_rfc: p.is_in_rfc,
            is_in_opinion: p.is_in_opinion,
            count: p.count,
        }
    }
}

/// Node row for the openCypher bulk-loader format.
#[derive(Debug, Serialize)]
pub struct BulkNodeRow {
    #[serde(rename = ":ID")]
    pub id: String,
    #[serde(rename = ":LABEL")]
    pub label: String,
    #[serde(rename = "title:String")]
    pub title: String,
    #[serde(rename = "court_name:String")]
    pub court_name: String,
    #[serde(rename = "jurisinfo_system_code:String")]
    pub jurisinfo_system_code: String,
    #[serde(rename = "decision_date:DateTime")]
    pub decision_date: String,
}

impl CsvRow for BulkNodeRow {
    const HEADER: &'static [&'static str] = &[
        ":ID",
        ":LABEL",
        "title:String",
        "court_name:String",
        "jurisinfo_system_code:String",
        "decision_date:DateTime",
    ];
}

impl BulkNodeRow {
    pub fn new(key: &str, attrs: &Attributes, label: &str) -> Self {
        Self {
            id: key.to_string(),
            label: label.to_string(),
            title: extract_cell!(attrs, "title"),
            court_name: extract_cell!(attrs, "court_name"),
            jurisinfo_system_code: extract_cell!(attrs, "jurisinfo_system_code"),
            decision_date: extract_cell!(attrs, "decision_date"),
        }
    }
}

/// Edge row for the openCypher bulk-loader format.
#[derive(Debug, Serialize)]
pub struct BulkEdgeRow {
    #[serde(rename = ":ID")]
    pub id: String,
    #[serde(rename = ":START_ID")]
    pub start_id: String,
    #[serde(rename = ":END_ID")]
    pub end_id: String,
    #[serde(rename = ":TYPE")]
    pub rel_type: String,
    #[serde(rename = "is_in_headnote:Bool")]
    pub is_in_headnote: bool,
    #[serde(rename = "is_in_overview:Bool")]
    pub is_in_overview: bool,
    #[serde(rename = "is_in_footnote:Bool")]
    pub is_in_footnote: bool,
    #[serde(rename = "is_in_rfc:Bool")]
    pub is_in_rfc: bool,
    #[serde(rename = "is_in_opinion:Bool")]
    pub is_in_opinion: bool,
    #[serde(rename = "count:Int")]
    pub count: i64,
}

impl CsvRow for BulkEdgeRow {
    const HEADER: &'static [&'static str] = &[
        ":ID",
        ":START_ID",
        ":END_ID",
        ":TYPE",
        "is_in_headnote:Bool",
        "is_in_overview:Bool",
        "is_in_footnote:Bool",
        "is_in_rfc:Bool",
        "is_in_opinion:Bool",
        "count:Int",
    ];
}

impl BulkEdgeRow {
    pub fn new(edge: &CitationEdge, rel_type: &str) -> Self {
        let p = edge.properties;
        Self {
            id: edge.edge_id(),
            start_id: edge.source.clone(),
            end_id: edge.destination.clone(),
            rel_type: rel_type.to_string(),
            is_in_headnote: p.is_in_headnote,
            is_in_overview: p.is_in_overview,
            is_in_footnote: p.is_in_footnote,
            is_in_rfc: p.is_in_rfc,
            is_in_opinion: p.is_in_opinion,
            count: p.count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IdNodeRow {
    #[serde(rename = ":ID")]
    pub id: String,
    #[serde(rename = ":LABEL")]
    pub label: String,
}

impl CsvRow for IdNodeRow {
    const HEADER: &'static [&'static str] = &[":ID", ":LABEL"];
}

#[derive(Debug, Serialize)]
pub struct IdEdgeRow {
    #[serde(rename = ":ID")]
    pub id: String,
    #[serde(rename = ":START_ID")]
    pub start_id: String,
    #[serde(rename = ":END_ID")]
    pub end_id: String,
    #[serde(rename = ":TYPE")]
    pub rel_type: String,
}

impl CsvRow for IdEdgeRow {
    const HEADER: &'static [&'static str] = &[":ID", ":START_ID", ":END_ID", ":TYPE"];
}

impl IdEdgeRow {
    pub fn new(edge: &CitationEdge, rel_type: &str) -> Self {
        Self {
            id: edge.edge_id(),
            start_id: edge.source.clone(),
            end_id: edge.destination.clone(),
            rel_type: rel_type.to_string(),
        }
    }
}
