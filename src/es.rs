//! Elasticsearch REST backend for [`IndexService`].
//!
//! Talks plain JSON over HTTP with `reqwest`; no official client crate is
//! involved. Requests target the 6.x API surface the proceedings indices
//! were created with (mapping types in document paths, `interval` in date
//! histograms), which later versions still accept with deprecation warnings.
//!
//! Writes use `refresh=wait_for` so counts, histograms, and percolation
//! issued right after a bulk request observe the new documents.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use wo_core::models::{format_es_date, Bucket, Document, LatestDate, Subscription};
use wo_core::store::{
    BulkOptions, CalendarInterval, DateHistogram, IndexError, IndexService, RawHit, ScanCursor,
    ScanItem, ScanQuery, SubscriptionHit,
};

/// Page size for internal scrolls (subscription listings, saved searches).
const SEARCH_PAGE_SIZE: usize = 500;
/// Upper bound on percolation hits per document.
const PERCOLATE_SIZE: usize = 10_000;

/// A handle on one Elasticsearch cluster.
#[derive(Clone)]
pub struct EsClient {
    client: Client,
    base_url: String,
}

impl EsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Elasticsearch HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| IndexError::Backend(format!("{}: {}", what, e)).into())
    }

    async fn open_scroll(&self, index: &str, body: Value, scroll: &str) -> Result<EsScroll> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{}/_search", index)))
                    .query(&[("scroll", scroll)])
                    .json(&body),
                "scroll search",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(IndexError::NotFound(index.to_string()).into());
        }
        let page = read_json(response, "scroll search").await?;
        log_shard_failures(&page, index);

        Ok(EsScroll {
            es: self.clone(),
            scroll: scroll.to_string(),
            scroll_id: page.get("_scroll_id").and_then(Value::as_str).map(String::from),
            pending: Some(hits_of(&page)),
        })
    }

    /// The hit for `id`, looked up with an `ids` query so the mapping type
    /// does not need to be known.
    async fn find(&self, index: &str, id: &str) -> Result<Option<RawHit>> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{}/_search", index)))
                    .json(&json!({"size": 1, "query": {"ids": {"values": [id]}}})),
                "get by id",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let page = read_json(response, "get by id").await?;
        Ok(hits_of(&page).iter().find_map(raw_hit))
    }
}

/// Parse a successful response body or turn the status into an [`IndexError`].
async fn read_json(response: Response, what: &str) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .with_context(|| format!("{}: response is not valid JSON", what));
    }
    let body = response.text().await.unwrap_or_default();
    Err(IndexError::Backend(format!("{} failed with {}: {}", what, status, body)).into())
}

fn hits_of(page: &Value) -> Vec<Value> {
    page.pointer("/hits/hits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn raw_hit(hit: &Value) -> Option<RawHit> {
    Some(RawHit {
        id: hit.get("_id")?.as_str()?.to_string(),
        index: hit.get("_index")?.as_str()?.to_string(),
        kind: hit
            .get("_type")
            .and_then(Value::as_str)
            .unwrap_or("_doc")
            .to_string(),
        source: hit.get("_source").cloned().unwrap_or_else(|| json!({})),
    })
}

fn log_shard_failures(page: &Value, index: &str) {
    let failed = page.pointer("/_shards/failed").and_then(Value::as_u64).unwrap_or(0);
    if failed > 0 {
        warn!(index, failed, "search reported failed shards");
    }
}

fn scan_item(hit: &Value) -> ScanItem {
    match Document::from_hit(hit) {
        Ok(doc) => ScanItem::Hit(doc),
        Err(e) => ScanItem::Failed {
            id: hit
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>")
                .to_string(),
            reason: format!("{:#}", e),
        },
    }
}

/// Search body for an ordered scan.
pub fn scan_body(query: &ScanQuery) -> Value {
    let filter = match &query.range {
        Some(range) => {
            let mut bounds = serde_json::Map::new();
            if let Some(gte) = range.gte {
                bounds.insert("gte".to_string(), json!(gte));
            }
            if let Some(gt) = range.gt {
                bounds.insert("gt".to_string(), json!(gt));
            }
            if let Some(lt) = range.lt {
                bounds.insert("lt".to_string(), json!(lt));
            }
            bounds.insert("format".to_string(), json!("epoch_millis"));
            json!({"range": {range.field.clone(): bounds}})
        }
        None => json!({"match_all": {}}),
    };
    let mut body = json!({"size": query.chunk_size.max(1), "query": filter});
    if let Some(field) = &query.sort_field {
        body["sort"] = json!([{ field.clone(): "asc" }, "_doc"]);
    }
    body
}

/// NDJSON body of one `_bulk` request.
pub fn bulk_body(index: &str, docs: &[Document]) -> Result<String> {
    let mut body = String::new();
    for doc in docs {
        let action = json!({"index": {"_index": index, "_type": doc.kind.as_str(), "_id": doc.id}});
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&serde_json::to_string(&doc.body)?);
        body.push('\n');
    }
    Ok(body)
}

/// Item failures reported in a `_bulk` response.
pub fn bulk_failures(response: &Value) -> Option<IndexError> {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let reasons: Vec<String> = response
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_object()?.values().next()?.get("error").cloned())
                .map(|error| match error.get("reason").and_then(Value::as_str) {
                    Some(reason) => reason.to_string(),
                    None => error.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    Some(IndexError::BulkItems {
        failed: reasons.len().max(1),
        first_reason: reasons
            .into_iter()
            .next()
            .unwrap_or_else(|| "unknown bulk error".to_string()),
    })
}

/// Search body for a histogram plus the field maximum.
pub fn histogram_body(field: &str, interval: CalendarInterval, date_from: Option<i64>) -> Value {
    let query = match date_from {
        Some(from) => json!({"range": {field: {"gt": from, "format": "epoch_millis"}}}),
        None => json!({"match_all": {}}),
    };
    json!({
        "size": 0,
        "query": query,
        "aggs": {
            "histogram": {"date_histogram": {"field": field, "interval": interval.as_str()}},
            "latest": {"max": {"field": field}}
        }
    })
}

pub fn parse_histogram(response: &Value) -> DateHistogram {
    let latest = response
        .pointer("/aggregations/latest/value")
        .and_then(Value::as_f64)
        .map(|value| {
            let value = value as i64;
            LatestDate {
                value,
                value_as_string: response
                    .pointer("/aggregations/latest/value_as_string")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| format_es_date(value)),
            }
        });
    let buckets = response
        .pointer("/aggregations/histogram/buckets")
        .and_then(Value::as_array)
        .map(|buckets| {
            buckets
                .iter()
                .filter_map(|b| serde_json::from_value::<Bucket>(b.clone()).ok())
                .filter(|b| b.doc_count > 0)
                .collect()
        })
        .unwrap_or_default();
    DateHistogram { latest, buckets }
}

/// Percolation request for a document already stored in its sink index.
pub fn percolate_body(doc: &Document) -> Value {
    json!({
        "size": PERCOLATE_SIZE,
        "query": {
            "constant_score": {
                "filter": {
                    "bool": {
                        "filter": [
                            {"percolate": {
                                "field": "query",
                                "index": doc.index,
                                "type": doc.kind.as_str(),
                                "id": doc.id
                            }},
                            {"term": {"doc_index": doc.index}},
                            {"term": {"activated": true}}
                        ]
                    }
                }
            }
        }
    })
}

struct EsScroll {
    es: EsClient,
    scroll: String,
    scroll_id: Option<String>,
    pending: Option<Vec<Value>>,
}

impl EsScroll {
    /// Next page of raw hits; `None` once a page comes back empty.
    async fn next_raw(&mut self) -> Result<Option<Vec<Value>>> {
        let hits = match self.pending.take() {
            Some(hits) => hits,
            None => {
                let Some(scroll_id) = self.scroll_id.clone() else {
                    return Ok(None);
                };
                let response = self
                    .es
                    .send(
                        self.es
                            .client
                            .post(self.es.url("_search/scroll"))
                            .json(&json!({"scroll": self.scroll, "scroll_id": scroll_id})),
                        "scroll",
                    )
                    .await?;
                let page = read_json(response, "scroll").await?;
                self.scroll_id = page.get("_scroll_id").and_then(Value::as_str).map(String::from);
                hits_of(&page)
            }
        };

        if hits.is_empty() {
            self.close().await?;
            return Ok(None);
        }
        Ok(Some(hits))
    }
}

#[async_trait]
impl ScanCursor for EsScroll {
    async fn next_page(&mut self) -> Result<Option<Vec<ScanItem>>> {
        Ok(self
            .next_raw()
            .await?
            .map(|hits| hits.iter().map(scan_item).collect()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(scroll_id) = self.scroll_id.take() {
            let result = self
                .es
                .client
                .delete(self.es.url("_search/scroll"))
                .json(&json!({"scroll_id": [scroll_id]}))
                .send()
                .await;
            if let Err(e) = result {
                debug!(error = %e, "failed to clear scroll");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IndexService for EsClient {
    async fn count(&self, index: &str) -> Result<u64> {
        let response = self
            .send(self.client.get(self.url(&format!("{}/_count", index))), "count")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(IndexError::NotFound(index.to_string()).into());
        }
        let body = read_json(response, "count").await?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| IndexError::Backend(format!("count response without count: {}", body)).into())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self.send(self.client.head(self.url(index)), "index exists").await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(IndexError::Backend(format!("index exists check returned {}", other)).into()),
        }
    }

    async fn scan(&self, index: &str, query: &ScanQuery) -> Result<Box<dyn ScanCursor>> {
        let scroll = self.open_scroll(index, scan_body(query), &query.scroll).await?;
        Ok(Box::new(scroll))
    }

    async fn bulk_write(
        &self,
        index: &str,
        docs: &[Document],
        opts: &BulkOptions,
    ) -> Result<usize> {
        let mut written = 0;
        for chunk in docs.chunks(opts.chunk_size.max(1)) {
            let body = bulk_body(index, chunk)?;
            let response = self
                .send(
                    self.client
                        .post(self.url("_bulk"))
                        .query(&[("refresh", "wait_for")])
                        .header("Content-Type", "application/x-ndjson")
                        .timeout(opts.timeout)
                        .body(body),
                    "bulk",
                )
                .await?;
            let result = read_json(response, "bulk").await?;
            if let Some(failure) = bulk_failures(&result) {
                return Err(failure.into());
            }
            written += chunk.len();
            debug!(index, written, "bulk chunk indexed");
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
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{}/_search", index)))
                    .json(&histogram_body(field, interval, date_from)),
                "date histogram",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = read_json(response, "date histogram").await?;
        Ok(Some(parse_histogram(&body)))
    }

    async fn percolate(
        &self,
        subscription_index: &str,
        doc: &Document,
    ) -> Result<Vec<SubscriptionHit>> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{}/_search", subscription_index)))
                    .json(&percolate_body(doc)),
                "percolate",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(IndexError::NotFound(subscription_index.to_string()).into());
        }
        let body = read_json(response, "percolate").await?;

        Ok(hits_of(&body)
            .iter()
            .filter_map(|hit| {
                let raw = raw_hit(hit)?;
                match serde_json::from_value::<Subscription>(raw.source) {
                    Ok(subscription) => Some(SubscriptionHit {
                        id: raw.id,
                        subscription,
                    }),
                    Err(e) => {
                        warn!(id = %raw.id, error = %e, "skipping malformed subscription");
                        None
                    }
                }
            })
            .collect())
    }

    async fn search(&self, index: &str, query: &Value) -> Result<Vec<RawHit>> {
        let body = json!({"size": SEARCH_PAGE_SIZE, "query": query});
        let mut scroll = self.open_scroll(index, body, "1m").await?;

        let mut hits = Vec::new();
        while let Some(page) = scroll.next_raw().await? {
            hits.extend(page.iter().filter_map(raw_hit));
        }
        Ok(hits)
    }

    async fn count_matching(&self, index: &str, query: &Value) -> Result<u64> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{}/_count", index)))
                    .json(&json!({"query": query})),
                "count",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(IndexError::NotFound(index.to_string()).into());
        }
        let body = read_json(response, "count").await?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.find(index, id).await?.map(|hit| hit.source))
    }

    async fn put(&self, index: &str, kind: &str, id: &str, source: &Value) -> Result<()> {
        let response = self
            .send(
                self.client
                    .put(self.url(&format!("{}/{}/{}", index, kind, id)))
                    .query(&[("refresh", "wait_for")])
                    .json(source),
                "index document",
            )
            .await?;
        read_json(response, "index document").await?;
        Ok(())
    }

    async fn update(&self, index: &str, id: &str, partial: &Value) -> Result<()> {
        let hit = self
            .find(index, id)
            .await?
            .ok_or_else(|| IndexError::DocumentNotFound {
                index: index.to_string(),
                id: id.to_string(),
            })?;
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{}/{}/{}/_update", index, hit.kind, id)))
                    .query(&[("refresh", "wait_for")])
                    .json(&json!({"doc": partial})),
                "update document",
            )
            .await?;
        read_json(response, "update document").await?;
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{}/_delete_by_query", index)))
                    .query(&[("refresh", "true")])
                    .json(&json!({"query": {"ids": {"values": [id]}}})),
                "delete document",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body = read_json(response, "delete document").await?;
        Ok(body.get("deleted").and_then(Value::as_u64).unwrap_or(0) > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wo_core::store::DateRange;

    fn doc(id: &str, kind: &str) -> Document {
        Document::from_hit(&json!({
            "_index": "ori_a", "_type": kind, "_id": id,
            "_source": {"name": id, "meta": {"processing_started": "2018-01-02T00:00:00"}}
        }))
        .unwrap()
    }

    #[test]
    fn scan_body_uses_half_open_range_and_sort() {
        let body = scan_body(&ScanQuery {
            range: Some(DateRange {
                field: "meta.processing_started".to_string(),
                gte: Some(10),
                gt: None,
                lt: Some(20),
            }),
            sort_field: Some("meta.processing_started".to_string()),
            chunk_size: 25,
            scroll: "10m".to_string(),
        });
        let range = &body["query"]["range"]["meta.processing_started"];
        assert_eq!(range["gte"], 10);
        assert!(range.get("gt").is_none());
        assert_eq!(range["lt"], 20);
        assert_eq!(range["format"], "epoch_millis");
        assert_eq!(body["size"], 25);
        assert_eq!(body["sort"][0]["meta.processing_started"], "asc");
    }

    #[test]
    fn bulk_body_is_ndjson_with_types() {
        let body = bulk_body("wo_gm0363", &[doc("1", "events"), doc("2", "vote_events")]).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["index"]["_index"], "wo_gm0363");
        assert_eq!(lines[2]["index"]["_type"], "vote_events");
        assert_eq!(lines[3]["name"], "2");
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn bulk_failures_surface_first_reason() {
        let ok = json!({"errors": false, "items": [{"index": {"status": 201}}]});
        assert!(bulk_failures(&ok).is_none());

        let failed = json!({"errors": true, "items": [
            {"index": {"status": 201}},
            {"index": {"status": 400, "error": {"type": "mapper_parsing_exception", "reason": "bad date"}}},
            {"index": {"status": 429, "error": {"reason": "queue full"}}}
        ]});
        match bulk_failures(&failed) {
            Some(IndexError::BulkItems {
                failed,
                first_reason,
            }) => {
                assert_eq!(failed, 2);
                assert_eq!(first_reason, "bad date");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn histogram_response_is_parsed() {
        let response = json!({
            "aggregations": {
                "histogram": {"buckets": [
                    {"key": 1514764800000i64, "key_as_string": "2018-01-01T00:00:00.000Z", "doc_count": 4},
                    {"key": 1515369600000i64, "key_as_string": "2018-01-08T00:00:00.000Z", "doc_count": 0}
                ]},
                "latest": {"value": 1514851200000.0, "value_as_string": "2018-01-02T00:00:00.000Z"}
            }
        });
        let h = parse_histogram(&response);
        assert_eq!(h.buckets.len(), 1);
        assert_eq!(h.buckets[0].doc_count, 4);
        assert_eq!(h.latest.unwrap().value, 1_514_851_200_000);

        let empty = json!({"aggregations": {"histogram": {"buckets": []}, "latest": {"value": null}}});
        assert!(parse_histogram(&empty).latest.is_none());
    }

    #[test]
    fn percolate_body_targets_stored_document() {
        let mut d = doc("42", "motions");
        d.index = "wo_gm0363".to_string();
        let body = percolate_body(&d);
        let filters = &body["query"]["constant_score"]["filter"]["bool"]["filter"];
        assert_eq!(filters[0]["percolate"]["index"], "wo_gm0363");
        assert_eq!(filters[0]["percolate"]["id"], "42");
        assert_eq!(filters[1]["term"]["doc_index"], "wo_gm0363");
        assert_eq!(filters[2]["term"]["activated"], true);
    }
}
