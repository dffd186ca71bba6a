//! Weekly gap detection between a source index and its sink.
//!
//! The sink index is its own checkpoint: its maximum
//! `meta.processing_started` marks how far previous runs got, and comparing
//! weekly document counts on both sides yields the buckets that still need
//! (re)processing. Nothing is stored besides the sink documents themselves,
//! so a run that died halfway simply shows up as an incomplete bucket.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::models::{format_es_date, Bucket, LatestDate, PROCESSING_STARTED};
use crate::store::{CalendarInterval, DateRange, IndexService};

/// Width of one bucket.
pub const WEEK_MILLIS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Result of [`incomplete_buckets`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteBuckets {
    /// Latest processing date already in the sink, if it has documents.
    pub checkpoint: Option<LatestDate>,
    /// Buckets to process, ascending by key.
    pub buckets: Vec<Bucket>,
}

/// Source buckets holding more documents than the sink has for the same week.
///
/// Sink buckets missing from the histogram count as empty. The result is
/// sorted by key so runs always make forward progress.
pub fn compute_incomplete(sink: &[Bucket], source: &[Bucket]) -> Vec<Bucket> {
    let sink_by_week: HashMap<i64, u64> = sink.iter().map(|b| (b.key, b.doc_count)).collect();

    let mut incomplete: Vec<Bucket> = source
        .iter()
        .filter(|week| week.doc_count > sink_by_week.get(&week.key).copied().unwrap_or(0))
        .cloned()
        .collect();
    incomplete.sort_by_key(|b| b.key);
    incomplete
}

/// Compare the weekly histograms of `source_alias` and `sink_index`.
///
/// A missing or empty sink yields every source bucket and no checkpoint.
/// Otherwise only source documents newer than the sink's checkpoint are
/// counted on the source side.
pub async fn incomplete_buckets(
    source: &dyn IndexService,
    sink: &dyn IndexService,
    source_alias: &str,
    sink_index: &str,
) -> Result<IncompleteBuckets> {
    let sink_histogram = sink
        .date_histogram(sink_index, PROCESSING_STARTED, CalendarInterval::Week, None)
        .await?;

    let (checkpoint, sink_buckets) = match sink_histogram {
        Some(h) if h.latest.is_some() => (h.latest, h.buckets),
        _ => {
            let all = source
                .date_histogram(source_alias, PROCESSING_STARTED, CalendarInterval::Week, None)
                .await?
                .map(|h| h.buckets)
                .unwrap_or_default();
            return Ok(IncompleteBuckets {
                checkpoint: None,
                buckets: compute_incomplete(&[], &all),
            });
        }
    };

    let since = checkpoint.as_ref().map(|c| c.value);
    let source_buckets = source
        .date_histogram(source_alias, PROCESSING_STARTED, CalendarInterval::Week, since)
        .await?
        .map(|h| h.buckets)
        .unwrap_or_default();

    Ok(IncompleteBuckets {
        checkpoint,
        buckets: compute_incomplete(&sink_buckets, &source_buckets),
    })
}

/// Range of processing dates to scan for a bucket, always ending before the
/// next bucket's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWindow {
    /// Lower bound, epoch millis.
    pub start: i64,
    /// Whether `start` itself is in range. False when resuming from a
    /// checkpoint, whose document is already in the sink.
    pub start_inclusive: bool,
    /// Exclusive upper bound, epoch millis.
    pub end: i64,
}

impl BucketWindow {
    pub fn range(&self, field: &str) -> DateRange {
        let (gte, gt) = if self.start_inclusive {
            (Some(self.start), None)
        } else {
            (None, Some(self.start))
        };
        DateRange {
            field: field.to_string(),
            gte,
            gt,
            lt: Some(self.end),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{}{}, {})",
            if self.start_inclusive { "[" } else { "(" },
            format_es_date(self.start),
            format_es_date(self.end)
        )
    }
}

/// Date range for processing `bucket`, resuming after `checkpoint` when the
/// previous run stopped inside this bucket's week.
///
/// A checkpoint at or past the end of the bucket means the sink was written
/// by something other than an in-order run; that is reported as an error
/// instead of silently skipping documents.
pub fn bucket_window(bucket: &Bucket, checkpoint: Option<&LatestDate>) -> Result<BucketWindow> {
    let end = bucket.key + WEEK_MILLIS;
    let window = match checkpoint {
        Some(cp) if cp.value >= end => bail!(
            "checkpoint {} lies beyond bucket {}; was the sink written concurrently?",
            cp.value_as_string,
            bucket.key_as_string
        ),
        Some(cp) if cp.value >= bucket.key => BucketWindow {
            start: cp.value,
            start_inclusive: false,
            end,
        },
        _ => BucketWindow {
            start: bucket.key,
            start_inclusive: true,
            end,
        },
    };
    Ok(window)
}
