//! Document index abstraction for wo-sync.
//!
//! The [`IndexService`] trait lists every capability the pipeline needs from
//! the search backend: counts, existence checks, ordered scans, bulk writes,
//! date histograms, percolation, and single-document CRUD. The application
//! crate implements it over Elasticsearch's REST API; [`memory::MemoryIndex`]
//! implements it in-process for tests.
//!
//! Implementations must be `Send + Sync` so a single handle can be shared by
//! concurrent municipality runs.

pub mod memory;
pub mod query;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Bucket, Document, LatestDate, Subscription};

/// Failures callers branch on. Returned inside `anyhow::Error`; use
/// `downcast_ref::<IndexError>()` to inspect.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index '{0}' does not exist")]
    NotFound(String),
    #[error("document '{id}' not found in '{index}'")]
    DocumentNotFound { index: String, id: String },
    #[error("bulk write rejected {failed} item(s); first failure: {first_reason}")]
    BulkItems { failed: usize, first_reason: String },
    #[error("index backend error: {0}")]
    Backend(String),
}

/// Date-histogram bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarInterval {
    Day,
    Week,
}

impl CalendarInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarInterval::Day => "day",
            CalendarInterval::Week => "week",
        }
    }
}

/// Histogram of an index over a date field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateHistogram {
    /// Maximum value of the field; `None` when the index holds no documents.
    pub latest: Option<LatestDate>,
    /// Non-empty buckets, ascending by key.
    pub buckets: Vec<Bucket>,
}

/// Range over a date field, in epoch millis. The upper bound is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub field: String,
    pub gte: Option<i64>,
    pub gt: Option<i64>,
    pub lt: Option<i64>,
}

impl DateRange {
    pub fn contains(&self, millis: i64) -> bool {
        self.gte.map_or(true, |gte| millis >= gte)
            && self.gt.map_or(true, |gt| millis > gt)
            && self.lt.map_or(true, |lt| millis < lt)
    }
}

/// Parameters of an ordered scan.
#[derive(Debug, Clone)]
pub struct ScanQuery {
    pub range: Option<DateRange>,
    /// Ascending sort field. Scans without one come back in backend order.
    pub sort_field: Option<String>,
    /// Page size.
    pub chunk_size: usize,
    /// Scroll keep-alive, e.g. `"10m"`.
    pub scroll: String,
}

/// One scanned hit.
#[derive(Debug, Clone)]
pub enum ScanItem {
    Hit(Document),
    /// The backend returned a hit that could not be decoded.
    Failed { id: String, reason: String },
}

/// Pages through a scan. Dropping the cursor before exhaustion is allowed;
/// call [`ScanCursor::close`] to release server-side state early.
#[async_trait]
pub trait ScanCursor: Send {
    /// Next page of hits, or `None` once the scan is exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<ScanItem>>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Bulk write tuning.
#[derive(Debug, Clone, Copy)]
pub struct BulkOptions {
    pub chunk_size: usize,
    pub timeout: Duration,
}

/// An undecoded search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub id: String,
    pub index: String,
    pub kind: String,
    pub source: Value,
}

/// A subscription whose stored query matched a percolated document.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionHit {
    pub id: String,
    pub subscription: Subscription,
}

/// Abstract document index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`count`](IndexService::count) | Number of documents in an index or pattern |
/// | [`index_exists`](IndexService::index_exists) | Whether an index, alias, or pattern resolves |
/// | [`scan`](IndexService::scan) | Ordered, paged scan with an optional date range |
/// | [`bulk_write`](IndexService::bulk_write) | Chunked index requests keyed by document id |
/// | [`date_histogram`](IndexService::date_histogram) | Bucketed counts plus the field maximum |
/// | [`percolate`](IndexService::percolate) | Subscriptions whose query matches a stored document |
/// | [`search`](IndexService::search) / [`count_matching`](IndexService::count_matching) | Query DSL lookups |
/// | [`get`](IndexService::get) / [`put`](IndexService::put) / [`update`](IndexService::update) / [`delete`](IndexService::delete) | Single documents |
#[async_trait]
pub trait IndexService: Send + Sync {
    /// Documents in `index`. A concrete index that does not exist is an
    /// [`IndexError::NotFound`]; a wildcard pattern matching nothing counts 0.
    async fn count(&self, index: &str) -> Result<u64>;

    async fn index_exists(&self, index: &str) -> Result<bool>;

    async fn scan(&self, index: &str, query: &ScanQuery) -> Result<Box<dyn ScanCursor>>;

    /// Index `docs` under their ids, `opts.chunk_size` per request. Returns
    /// the number of documents written; any rejected item fails the call.
    async fn bulk_write(&self, index: &str, docs: &[Document], opts: &BulkOptions)
        -> Result<usize>;

    /// Histogram over `field`, counting only documents with `field > date_from`
    /// when given. `None` when the index does not exist.
    async fn date_histogram(
        &self,
        index: &str,
        field: &str,
        interval: CalendarInterval,
        date_from: Option<i64>,
    ) -> Result<Option<DateHistogram>>;

    /// Subscriptions in `subscription_index` targeting `doc.index` whose
    /// stored query matches the stored copy of `doc`.
    async fn percolate(&self, subscription_index: &str, doc: &Document)
        -> Result<Vec<SubscriptionHit>>;

    /// Every hit matching `query`.
    async fn search(&self, index: &str, query: &Value) -> Result<Vec<RawHit>>;

    async fn count_matching(&self, index: &str, query: &Value) -> Result<u64>;

    /// Source of a single document.
    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>>;

    async fn put(&self, index: &str, kind: &str, id: &str, source: &Value) -> Result<()>;

    /// Merge `partial` into an existing document.
    async fn update(&self, index: &str, id: &str, partial: &Value) -> Result<()>;

    /// Returns `false` when the document did not exist.
    async fn delete(&self, index: &str, id: &str) -> Result<bool>;
}

/// Drain a scan cursor into memory.
pub async fn collect_scan(cursor: &mut dyn ScanCursor) -> Result<Vec<ScanItem>> {
    let mut items = Vec::new();
    while let Some(page) = cursor.next_page().await? {
        items.extend(page);
    }
    Ok(items)
}
