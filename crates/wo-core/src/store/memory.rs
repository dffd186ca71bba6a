//! In-memory [`IndexService`] implementation for tests.
//!
//! Indices are `BTreeMap`s of JSON sources behind a `std::sync::RwLock`.
//! Index names may be given as `*` wildcard patterns, as with
//! Elasticsearch. Queries run through the [`query`](super::query) evaluator,
//! so percolation and saved-search counts behave like the real backend for
//! the clause subset subscriptions use.
//!
//! Bulk failures can be injected with [`MemoryIndex::fail_bulk_after`] to
//! simulate a run dying mid-bucket.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::{format_es_date, parse_es_date, Bucket, Document, LatestDate, Subscription};

use super::query::{field_values, matches};
use super::{
    BulkOptions, CalendarInterval, DateHistogram, IndexError, IndexService, RawHit, ScanCursor,
    ScanItem, ScanQuery, SubscriptionHit,
};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

struct StoredDoc {
    kind: String,
    source: Value,
}

type Indices = BTreeMap<String, BTreeMap<String, StoredDoc>>;

/// In-memory document index.
pub struct MemoryIndex {
    indices: RwLock<Indices>,
    bulk_budget: Mutex<Option<usize>>,
    bulk_written: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(BTreeMap::new()),
            bulk_budget: Mutex::new(None),
            bulk_written: AtomicUsize::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty index if it does not exist yet.
    pub fn create_index(&self, index: &str) {
        self.write().entry(index.to_string()).or_default();
    }

    /// Store a search hit (`{_id, _type, _source}`) under `index`.
    pub fn insert_hit(&self, index: &str, hit: &Value) -> Result<()> {
        let id = hit
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("hit is missing '_id'"))?;
        let kind = hit.get("_type").and_then(Value::as_str).unwrap_or("items");
        let source = hit.get("_source").cloned().unwrap_or_else(|| json!({}));
        self.insert(index, kind, id, source);
        Ok(())
    }

    pub fn insert(&self, index: &str, kind: &str, id: &str, source: Value) {
        self.write().entry(index.to_string()).or_default().insert(
            id.to_string(),
            StoredDoc {
                kind: kind.to_string(),
                source,
            },
        );
    }

    /// Stored source of one document.
    pub fn source_of(&self, index: &str, id: &str) -> Option<Value> {
        self.read()
            .get(index)
            .and_then(|docs| docs.get(id))
            .map(|d| d.source.clone())
    }

    /// Ids stored in `index`, sorted.
    pub fn ids(&self, index: &str) -> Vec<String> {
        self.read()
            .get(index)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Let bulk writes store `docs` more documents, then reject the next
    /// request that would exceed that budget. The budget is cleared once it
    /// has triggered.
    pub fn fail_bulk_after(&self, docs: usize) {
        *self.bulk_budget.lock().unwrap_or_else(PoisonError::into_inner) = Some(docs);
    }

    /// Total documents written through [`IndexService::bulk_write`].
    pub fn bulk_written(&self) -> usize {
        self.bulk_written.load(Ordering::SeqCst)
    }

    /// Index names matching `pattern`, or `NotFound` for a missing concrete name.
    fn resolve(indices: &Indices, pattern: &str) -> Result<Vec<String>> {
        let names: Vec<String> = pattern
            .split(',')
            .flat_map(|part| {
                indices
                    .keys()
                    .filter(move |name| wildcard_match(part, name))
                    .cloned()
            })
            .collect();
        if names.is_empty() && !pattern.contains('*') {
            return Err(IndexError::NotFound(pattern.to_string()).into());
        }
        Ok(names)
    }

    fn docs_in<'a>(
        indices: &'a Indices,
        names: &'a [String],
    ) -> impl Iterator<Item = (&'a str, &'a str, &'a StoredDoc)> {
        names.iter().filter_map(|n| indices.get_key_value(n)).flat_map(|(name, docs)| {
            docs.iter()
                .map(move |(id, doc)| (name.as_str(), id.as_str(), doc))
        })
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || !name[first.len()..].ends_with(last) {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}

/// Epoch millis of a date field, if present and parseable.
fn date_value(source: &Value, field: &str) -> Option<i64> {
    field_values(source, field)
        .into_iter()
        .find_map(|v| match v {
            Value::String(s) => parse_es_date(s),
            Value::Number(n) => n.as_i64(),
            _ => None,
        })
}

/// Start of the calendar bucket containing `millis`. Weeks start on Monday.
fn bucket_key(millis: i64, interval: CalendarInterval) -> i64 {
    let day = millis.div_euclid(DAY_MILLIS);
    let start_day = match interval {
        CalendarInterval::Day => day,
        // 1970-01-05 (epoch day 4) was a Monday.
        CalendarInterval::Week => (day - 4).div_euclid(7) * 7 + 4,
    };
    start_day * DAY_MILLIS
}

fn merge_into(target: &mut Value, partial: &Value) {
    match (target, partial) {
        (Value::Object(t), Value::Object(p)) => {
            for (key, value) in p {
                let nested = value.is_object() && t.get(key).is_some_and(Value::is_object);
                if !nested {
                    t.insert(key.clone(), value.clone());
                } else if let Some(existing) = t.get_mut(key) {
                    merge_into(existing, value);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

struct MemoryCursor {
    pages: VecDeque<Vec<ScanItem>>,
}

#[async_trait]
impl ScanCursor for MemoryCursor {
    async fn next_page(&mut self) -> Result<Option<Vec<ScanItem>>> {
        Ok(self.pages.pop_front())
    }
}

#[async_trait]
impl IndexService for MemoryIndex {
    async fn count(&self, index: &str) -> Result<u64> {
        let indices = self.read();
        let names = Self::resolve(&indices, index)?;
        Ok(Self::docs_in(&indices, &names).count() as u64)
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let indices = self.read();
        Ok(Self::resolve(&indices, index).is_ok_and(|names| !names.is_empty()))
    }

    async fn scan(&self, index: &str, query: &ScanQuery) -> Result<Box<dyn ScanCursor>> {
        let indices = self.read();
        let names = Self::resolve(&indices, index)?;

        let mut selected: Vec<(Option<i64>, &str, &str, &StoredDoc)> = Self::docs_in(&indices, &names)
            .filter_map(|(name, id, doc)| {
                let sort_key = query
                    .sort_field
                    .as_deref()
                    .and_then(|f| date_value(&doc.source, f));
                match &query.range {
                    Some(range) => date_value(&doc.source, &range.field)
                        .filter(|ms| range.contains(*ms))
                        .map(|_| (sort_key, name, id, doc)),
                    None => Some((sort_key, name, id, doc)),
                }
            })
            .collect();
        // Missing sort values go last.
        selected.sort_by_key(|(key, name, id, _)| (key.is_none(), *key, *name, *id));

        let items: Vec<ScanItem> = selected
            .into_iter()
            .map(|(_, name, id, doc)| {
                let hit = json!({"_index": name, "_type": doc.kind, "_id": id, "_source": doc.source});
                match Document::from_hit(&hit) {
                    Ok(document) => ScanItem::Hit(document),
                    Err(e) => ScanItem::Failed {
                        id: id.to_string(),
                        reason: format!("{:#}", e),
                    },
                }
            })
            .collect();

        let mut pages = VecDeque::new();
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            pages.push_back(items.by_ref().take(query.chunk_size.max(1)).collect());
        }
        Ok(Box::new(MemoryCursor { pages }))
    }

    async fn bulk_write(
        &self,
        index: &str,
        docs: &[Document],
        opts: &BulkOptions,
    ) -> Result<usize> {
        let mut written = 0;
        for chunk in docs.chunks(opts.chunk_size.max(1)) {
            {
                let mut budget = self.bulk_budget.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(remaining) = budget.as_mut() {
                    if chunk.len() > *remaining {
                        *budget = None;
                        return Err(IndexError::BulkItems {
                            failed: chunk.len(),
                            first_reason: "injected bulk failure".to_string(),
                        }
                        .into());
                    }
                    *remaining -= chunk.len();
                }
            }

            let mut encoded = Vec::with_capacity(chunk.len());
            for doc in chunk {
                encoded.push((doc.id.clone(), doc.kind.as_str().to_string(), doc.source_json()?));
            }
            let mut indices = self.write();
            let target = indices.entry(index.to_string()).or_default();
            for (id, kind, source) in encoded {
                target.insert(id, StoredDoc { kind, source });
            }
            written += chunk.len();
            self.bulk_written.fetch_add(chunk.len(), Ordering::SeqCst);
        }
        Ok(written)
    }

    async fn date_histogram(
        &self,
        index: &str,
        field: &str,
        interval: CalendarInterval,
        date_from: Option<i64>,
    ) -> Result<Option<DateHistogram>> {
        let indices = self.read();
        let names = match Self::resolve(&indices, index) {
            Ok(names) if !names.is_empty() => names,
            _ => return Ok(None),
        };

        let values: Vec<i64> = Self::docs_in(&indices, &names)
            .filter_map(|(_, _, doc)| date_value(&doc.source, field))
            .filter(|ms| date_from.map_or(true, |from| *ms > from))
            .collect();

        let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
        for ms in &values {
            *counts.entry(bucket_key(*ms, interval)).or_default() += 1;
        }

        Ok(Some(DateHistogram {
            latest: values.iter().max().map(|&value| LatestDate {
                value,
                value_as_string: format_es_date(value),
            }),
            buckets: counts
                .into_iter()
                .map(|(key, doc_count)| Bucket {
                    key,
                    key_as_string: format_es_date(key),
                    doc_count,
                })
                .collect(),
        }))
    }

    /// Returns every subscription whose query matches, activated or not.
    async fn percolate(
        &self,
        subscription_index: &str,
        doc: &Document,
    ) -> Result<Vec<SubscriptionHit>> {
        let target = match self.source_of(&doc.index, &doc.id) {
            Some(source) => source,
            None => doc.source_json()?,
        };
        let indices = self.read();
        let names = Self::resolve(&indices, subscription_index)?;

        Ok(Self::docs_in(&indices, &names)
            .filter_map(|(_, id, stored)| {
                let subscription: Subscription = serde_json::from_value(stored.source.clone()).ok()?;
                (subscription.doc_index == doc.index && matches(&subscription.query, &target)).then(
                    || SubscriptionHit {
                        id: id.to_string(),
                        subscription,
                    },
                )
            })
            .collect())
    }

    async fn search(&self, index: &str, query: &Value) -> Result<Vec<RawHit>> {
        let indices = self.read();
        let names = Self::resolve(&indices, index)?;
        Ok(Self::docs_in(&indices, &names)
            .filter(|(_, _, doc)| matches(query, &doc.source))
            .map(|(name, id, doc)| RawHit {
                id: id.to_string(),
                index: name.to_string(),
                kind: doc.kind.clone(),
                source: doc.source.clone(),
            })
            .collect())
    }

    async fn count_matching(&self, index: &str, query: &Value) -> Result<u64> {
        Ok(self.search(index, query).await?.len() as u64)
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.source_of(index, id))
    }

    async fn put(&self, index: &str, kind: &str, id: &str, source: &Value) -> Result<()> {
        self.insert(index, kind, id, source.clone());
        Ok(())
    }

    async fn update(&self, index: &str, id: &str, partial: &Value) -> Result<()> {
        let mut indices = self.write();
        let stored = indices
            .get_mut(index)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| IndexError::DocumentNotFound {
                index: index.to_string(),
                id: id.to_string(),
            })?;
        merge_into(&mut stored.source, partial);
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool> {
        Ok(self
            .write()
            .get_mut(index)
            .is_some_and(|docs| docs.remove(id).is_some()))
    }
}
