//! Core data models shared by the sync pipeline and the alerting code.
//!
//! Documents arrive from the source index as `{_index, _type, _id, _source}`
//! hits. [`Document::from_hit`] turns a hit into a typed record whose kind
//! decides which text fields get geocoded; everything the pipeline does not
//! know about is carried along in flattened side-maps so the sink receives
//! the full source record.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered set of district or neighborhood codes. Serializes as a sorted list.
pub type CodeSet = BTreeSet<String>;

/// Field holding the processing timestamp used for bucketing and checkpoints.
pub const PROCESSING_STARTED: &str = "meta.processing_started";

/// Field holding the finish timestamp, used when resending old alerts.
pub const PROCESSING_FINISHED: &str = "meta.processing_finished";

/// Top-level source fields that must never be copied into a sink index.
pub const INTERNAL_FIELDS: [&str; 2] = ["source_data", "combined_index_data"];

/// `meta` keys starting with this marker are internal to the source index.
pub const INTERNAL_META_PREFIX: char = '_';

// ═══════════════════════════════════════════════════════════════════════
// Municipality codes
// ═══════════════════════════════════════════════════════════════════════

/// A CBS municipality code such as `GM0363`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MunicipalityCode(String);

impl MunicipalityCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the per-municipality sink index, e.g. `wo_gm0363`.
    pub fn sink_index(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.0.to_lowercase())
    }
}

impl FromStr for MunicipalityCode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("GM").unwrap_or("");
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            bail!("Municipality code must look like GM0000, got '{}'", s);
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for MunicipalityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Annotations
// ═══════════════════════════════════════════════════════════════════════

/// A `(start, end)` character span into the annotated text.
///
/// Offsets count Unicode scalar values, not bytes. Serializes as `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Posting(pub usize, pub usize);

impl Posting {
    pub fn start(&self) -> usize {
        self.0
    }

    pub fn end(&self) -> usize {
        self.1
    }

    pub fn is_valid(&self) -> bool {
        self.0 < self.1
    }
}

/// One geocoding match attached to a text field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub toponym: String,
    #[serde(default)]
    pub districts: CodeSet,
    #[serde(default)]
    pub neighborhoods: CodeSet,
    #[serde(default)]
    pub postings: Vec<Posting>,
}

impl Annotation {
    /// Districts and neighborhoods this annotation refers to.
    pub fn codes(&self) -> impl Iterator<Item = &String> {
        self.districts.iter().chain(self.neighborhoods.iter())
    }

    pub fn refers_to(&self, code: &str) -> bool {
        self.districts.contains(code) || self.neighborhoods.contains(code)
    }
}

/// Successful response of the annotation service for one text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationResponse {
    #[serde(default)]
    pub districts: CodeSet,
    #[serde(default)]
    pub neighborhoods: CodeSet,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl AnnotationResponse {
    /// Drop postings with `start >= end`; sort the rest so highlighting is stable.
    pub fn sanitized(mut self) -> Self {
        for ann in &mut self.annotations {
            ann.postings.retain(Posting::is_valid);
            ann.postings.sort();
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════

/// Kind of a proceedings document, taken from the hit's `_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocKind {
    Events,
    Motions,
    VoteEvents,
    Items,
    Other(String),
}

impl DocKind {
    pub fn as_str(&self) -> &str {
        match self {
            DocKind::Events => "events",
            DocKind::Motions => "motions",
            DocKind::VoteEvents => "vote_events",
            DocKind::Items => "items",
            DocKind::Other(s) => s,
        }
    }
}

impl From<&str> for DocKind {
    fn from(s: &str) -> Self {
        match s {
            "events" => DocKind::Events,
            "motions" => DocKind::Motions,
            "vote_events" => DocKind::VoteEvents,
            "items" => DocKind::Items,
            other => DocKind::Other(other.to_string()),
        }
    }
}

/// Processing metadata of a source record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_finished: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    pub fn processing_started_millis(&self) -> Option<i64> {
        self.processing_started.as_deref().and_then(parse_es_date)
    }
}

/// A record carrying annotatable text: a document body, a source, or a motion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snippets: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

type TextAccessor = fn(&mut TextRecord) -> &mut Option<String>;

fn description_mut(record: &mut TextRecord) -> &mut Option<String> {
    &mut record.description
}

fn text_mut(record: &mut TextRecord) -> &mut Option<String> {
    &mut record.text
}

/// Text fields in the order they are tried for annotation.
const TEXT_ACCESSORS: [TextAccessor; 2] = [description_mut, text_mut];

impl TextRecord {
    /// First present, non-empty text field, in priority order.
    pub fn primary_text_mut(&mut self) -> Option<&mut String> {
        let index = TEXT_ACCESSORS.iter().position(|get| {
            get(self).as_deref().is_some_and(|t| !t.is_empty())
        })?;
        TEXT_ACCESSORS[index](self).as_mut()
    }

    /// The text that annotation postings refer to.
    pub fn annotated_text(&self) -> Option<&str> {
        [self.description.as_deref(), self.text.as_deref()]
            .into_iter()
            .flatten()
            .find(|t| !t.is_empty())
    }
}

/// The `_source` of a proceedings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<TextRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion: Option<TextRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub districts: Option<CodeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighborhoods: Option<CodeSet>,
    #[serde(flatten)]
    pub record: TextRecord,
}

/// A proceedings document as it moves from source to sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub index: String,
    pub kind: DocKind,
    pub body: DocumentBody,
}

impl Document {
    /// Decode a search hit (`{_index, _type, _id, _source}`).
    pub fn from_hit(hit: &Value) -> Result<Self> {
        let field = |name: &str| {
            hit.get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("hit is missing '{}'", name))
        };
        let id = field("_id")?.to_string();
        let index = field("_index")?.to_string();
        let kind = DocKind::from(hit.get("_type").and_then(Value::as_str).unwrap_or("items"));
        let source = hit.get("_source").cloned().unwrap_or(Value::Object(Map::new()));
        let body: DocumentBody = serde_json::from_value(source)
            .with_context(|| format!("document {} has an unexpected shape", id))?;

        Ok(Self { id, index, kind, body })
    }

    /// The `_source` body as JSON.
    pub fn source_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.body)?)
    }

    pub fn processing_started_millis(&self) -> Option<i64> {
        self.body.meta.as_ref().and_then(Meta::processing_started_millis)
    }

    /// Remove data that must not cross from the source into a sink index.
    pub fn strip_internal_fields(&mut self) {
        for field in INTERNAL_FIELDS {
            self.body.record.extra.remove(field);
        }
        if let Some(meta) = &mut self.body.meta {
            meta.extra
                .retain(|key, _| !key.starts_with(INTERNAL_META_PREFIX));
        }
    }

    /// Text records to send to the annotation service, by document kind.
    ///
    /// Events, motions, and items annotate their own body plus every source;
    /// vote events annotate the nested motion (when present) plus sources.
    /// Other kinds are passed through without annotation.
    pub fn annotatable_fields_mut(&mut self) -> Vec<&mut TextRecord> {
        let body = &mut self.body;
        match self.kind {
            DocKind::Events | DocKind::Motions | DocKind::Items => std::iter::once(&mut body.record)
                .chain(body.sources.iter_mut())
                .collect(),
            DocKind::VoteEvents => body
                .motion
                .iter_mut()
                .chain(body.sources.iter_mut())
                .collect(),
            DocKind::Other(_) => Vec::new(),
        }
    }

    pub fn is_annotatable(&self) -> bool {
        !matches!(self.kind, DocKind::Other(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Buckets, subscriptions, errors
// ═══════════════════════════════════════════════════════════════════════

/// One weekly bucket of a date histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Week start, epoch milliseconds.
    pub key: i64,
    pub key_as_string: String,
    pub doc_count: u64,
}

/// Maximum processing timestamp of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestDate {
    pub value: i64,
    pub value_as_string: String,
}

/// A saved search. Stored in the subscription index under its token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub email: String,
    pub token: String,
    #[serde(default)]
    pub activated: bool,
    #[serde(default)]
    pub area_name: String,
    pub query: Value,
    #[serde(default)]
    pub querystring: String,
    /// Sink index the stored query runs against.
    pub doc_index: String,
}

impl Subscription {
    /// Human-readable label for mails: the area name, or the search URL.
    pub fn label(&self) -> &str {
        if self.area_name.is_empty() {
            &self.querystring
        } else {
            &self.area_name
        }
    }
}

/// A failed annotation call, appended to the municipality's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodingErrorRecord {
    pub doc_id: String,
    pub doc_type: String,
    pub doc_index: String,
    pub municipality_code: String,
    pub status_code: u16,
    /// Local time of the failure. Logs written as `timestamp` read back too.
    #[serde(alias = "timestamp")]
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Parse an Elasticsearch date value into epoch milliseconds.
///
/// Accepts RFC 3339 timestamps, naive ISO timestamps (read as UTC, with or
/// without fractional seconds), plain dates, and epoch-millisecond strings.
pub fn parse_es_date(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
    }
    s.parse::<i64>().ok()
}

/// Format epoch milliseconds the way Elasticsearch renders `key_as_string`.
pub fn format_es_date(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| millis.to_string())
}
