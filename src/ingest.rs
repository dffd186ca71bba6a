//! Sync pipeline orchestration.
//!
//! One [`SyncController`] run brings a municipality's sink index up to date
//! with its source index:
//!
//! ```text
//! CheckCounts ──▶ Skip
//!      │
//!      ▼
//! ComputeGaps ──▶ Done
//!      │
//!      ▼
//! ProcessBuckets ──▶ Done | Cancelled
//! ```
//!
//! Inside a bucket the pipeline is strictly sequential: scan (ascending
//! `meta.processing_started`) → strip internal fields → annotate → derive
//! snippets → buffer → bulk write per chunk. After a bucket completes, its
//! documents are percolated for alerts. There is no stored checkpoint: the
//! next run recomputes it from the sink, so any run can be interrupted
//! between chunks and resumed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use wo_core::gaps::{bucket_window, incomplete_buckets};
use wo_core::models::{Bucket, Document, LatestDate, MunicipalityCode, PROCESSING_STARTED};
use wo_core::snippets::add_doc_snippets;
use wo_core::store::{BulkOptions, IndexService, ScanItem, ScanQuery};

use crate::alerts::{AlertMatcher, AlertReport};
use crate::annotate::{Annotator, DocumentAnnotator};
use crate::config::Config;
use crate::error_log::ErrorLog;
use crate::mail::Mailer;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};

/// Service handles shared by every municipality run.
#[derive(Clone)]
pub struct SyncServices {
    pub source: Arc<dyn IndexService>,
    pub sink: Arc<dyn IndexService>,
    pub annotator: Arc<dyn Annotator>,
    pub mailer: Arc<dyn Mailer>,
}

/// Per-run settings, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub chunk_size: usize,
    pub scroll: String,
    pub bulk_timeout: Duration,
    pub tolerate_item_errors: bool,
    pub context_chars: usize,
    pub index_prefix: String,
    pub subscription_index: String,
    pub site_url: String,
    pub log_dir: std::path::PathBuf,
    pub dry_run_alerts: bool,
}

impl SyncOptions {
    pub fn from_config(config: &Config, dry_run_alerts: bool) -> Self {
        Self {
            chunk_size: config.sync.chunk_size,
            scroll: config.sync.scroll.clone(),
            bulk_timeout: config.sync.bulk_timeout(),
            tolerate_item_errors: config.sync.tolerate_item_errors,
            context_chars: config.snippets.context_chars,
            index_prefix: config.sink.index_prefix.clone(),
            subscription_index: config.sink.subscription_index.clone(),
            site_url: config.mail.site_url.clone(),
            log_dir: config.sync.log_dir.clone(),
            dry_run_alerts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The sink already held at least as many documents as the source.
    Skipped,
    Done,
    /// Stopped between chunks; the next run resumes from the sink.
    Cancelled,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Skipped => "skipped",
            SyncStatus::Done => "done",
            SyncStatus::Cancelled => "cancelled",
        })
    }
}

/// What one municipality run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub code: String,
    pub source_index: String,
    pub sink_index: String,
    pub status: SyncStatus,
    pub source_count: u64,
    pub sink_count_before: u64,
    pub sink_count: u64,
    pub buckets_total: usize,
    pub buckets_done: usize,
    pub indexed: usize,
    pub scan_errors: usize,
    pub annotation_errors: usize,
    pub alerts: AlertReport,
}

enum SyncState {
    CheckCounts,
    ComputeGaps,
    ProcessBuckets {
        checkpoint: Option<LatestDate>,
        buckets: Vec<Bucket>,
    },
    Skip,
    Done,
    Cancelled,
}

enum BucketOutcome {
    Completed,
    Cancelled,
}

/// Synchronizes one source index into one municipality's sink index.
pub struct SyncController {
    source: Arc<dyn IndexService>,
    sink: Arc<dyn IndexService>,
    annotator: DocumentAnnotator,
    alerts: AlertMatcher,
    error_log: ErrorLog,
    options: SyncOptions,
    code: MunicipalityCode,
    source_index: String,
    sink_index: String,
    stop: Arc<AtomicBool>,
}

impl SyncController {
    pub fn new(
        services: &SyncServices,
        options: SyncOptions,
        source_index: &str,
        code: MunicipalityCode,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let sink_index = code.sink_index(&options.index_prefix);
        Self {
            source: services.source.clone(),
            sink: services.sink.clone(),
            annotator: DocumentAnnotator::new(services.annotator.clone(), code.clone()),
            alerts: AlertMatcher::new(
                services.sink.clone(),
                services.mailer.clone(),
                &options.subscription_index,
                &options.site_url,
            ),
            error_log: ErrorLog::for_municipality(&options.log_dir, &code),
            options,
            code,
            source_index: source_index.to_string(),
            sink_index,
            stop,
        }
    }

    pub fn sink_index(&self) -> &str {
        &self.sink_index
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn sink_count(&self) -> Result<u64> {
        if self.sink.index_exists(&self.sink_index).await? {
            self.sink.count(&self.sink_index).await
        } else {
            Ok(0)
        }
    }

    /// Drive the state machine to a terminal state.
    pub async fn run(&self, progress: &dyn SyncProgressReporter) -> Result<SyncReport> {
        let mut report = SyncReport {
            code: self.code.to_string(),
            source_index: self.source_index.clone(),
            sink_index: self.sink_index.clone(),
            status: SyncStatus::Done,
            source_count: 0,
            sink_count_before: 0,
            sink_count: 0,
            buckets_total: 0,
            buckets_done: 0,
            indexed: 0,
            scan_errors: 0,
            annotation_errors: 0,
            alerts: AlertReport::default(),
        };

        let mut state = SyncState::CheckCounts;
        loop {
            state = match state {
                SyncState::CheckCounts => self.check_counts(&mut report).await?,
                SyncState::ComputeGaps => self.compute_gaps(&mut report).await?,
                SyncState::ProcessBuckets {
                    checkpoint,
                    buckets,
                } => {
                    self.process_buckets(checkpoint, &buckets, &mut report, progress)
                        .await?
                }
                SyncState::Skip => {
                    report.status = SyncStatus::Skipped;
                    report.sink_count = report.sink_count_before;
                    return Ok(report);
                }
                SyncState::Done => return self.finish(report, SyncStatus::Done).await,
                SyncState::Cancelled => return self.finish(report, SyncStatus::Cancelled).await,
            };
        }
    }

    async fn finish(&self, mut report: SyncReport, status: SyncStatus) -> Result<SyncReport> {
        report.status = status;
        report.sink_count = self.sink_count().await?;
        info!(code = %self.code, sink_count = report.sink_count, status = %status, "sync finished");
        Ok(report)
    }

    async fn check_counts(&self, report: &mut SyncReport) -> Result<SyncState> {
        if !self.source.index_exists(&self.source_index).await? {
            bail!("Source collection {} cannot be found", self.source_index);
        }
        report.source_count = self
            .source
            .count(&self.source_index)
            .await
            .with_context(|| format!("Failed to count {}", self.source_index))?;
        report.sink_count_before = self.sink_count().await?;

        if report.source_count > report.sink_count_before {
            Ok(SyncState::ComputeGaps)
        } else {
            info!(
                code = %self.code,
                source = report.source_count,
                sink = report.sink_count_before,
                "sink is up to date, skipping"
            );
            Ok(SyncState::Skip)
        }
    }

    async fn compute_gaps(&self, report: &mut SyncReport) -> Result<SyncState> {
        let gaps = incomplete_buckets(
            self.source.as_ref(),
            self.sink.as_ref(),
            &self.source_index,
            &self.sink_index,
        )
        .await?;
        report.buckets_total = gaps.buckets.len();
        info!(
            code = %self.code,
            buckets = gaps.buckets.len(),
            checkpoint = gaps.checkpoint.as_ref().map(|c| c.value_as_string.as_str()),
            "computed incomplete buckets"
        );

        if gaps.buckets.is_empty() {
            Ok(SyncState::Done)
        } else {
            Ok(SyncState::ProcessBuckets {
                checkpoint: gaps.checkpoint,
                buckets: gaps.buckets,
            })
        }
    }

    async fn process_buckets(
        &self,
        checkpoint: Option<LatestDate>,
        buckets: &[Bucket],
        report: &mut SyncReport,
        progress: &dyn SyncProgressReporter,
    ) -> Result<SyncState> {
        for (i, bucket) in buckets.iter().enumerate() {
            if self.stop_requested() {
                return Ok(SyncState::Cancelled);
            }
            progress.report(SyncProgressEvent::Bucket {
                code: self.code.to_string(),
                n: i + 1,
                total: buckets.len(),
                week: bucket.key_as_string.clone(),
            });
            match self
                .process_bucket(bucket, checkpoint.as_ref(), report, progress)
                .await?
            {
                BucketOutcome::Completed => report.buckets_done += 1,
                BucketOutcome::Cancelled => return Ok(SyncState::Cancelled),
            }
        }
        Ok(SyncState::Done)
    }

    async fn process_bucket(
        &self,
        bucket: &Bucket,
        checkpoint: Option<&LatestDate>,
        report: &mut SyncReport,
        progress: &dyn SyncProgressReporter,
    ) -> Result<BucketOutcome> {
        let window = bucket_window(bucket, checkpoint)?;
        info!(source = %self.source_index, window = %window.describe(), expected = bucket.doc_count, "processing bucket");

        let query = ScanQuery {
            range: Some(window.range(PROCESSING_STARTED)),
            sort_field: Some(PROCESSING_STARTED.to_string()),
            chunk_size: self.options.chunk_size,
            scroll: self.options.scroll.clone(),
        };
        let mut cursor = self.source.scan(&self.source_index, &query).await?;

        let mut buffer: Vec<Document> = Vec::with_capacity(self.options.chunk_size);
        let mut written: Vec<Document> = Vec::new();
        let mut cancelled = false;

        'scan: while let Some(page) = cursor.next_page().await? {
            for item in page {
                let doc = match item {
                    ScanItem::Hit(doc) => doc,
                    ScanItem::Failed { id, reason } => {
                        if !self.options.tolerate_item_errors {
                            cursor.close().await?;
                            bail!("scan of {} failed on {}: {}", self.source_index, id, reason);
                        }
                        warn!(id = %id, reason = %reason, "skipping unreadable source document");
                        report.scan_errors += 1;
                        continue;
                    }
                };
                buffer.push(self.prepare(doc, report).await);

                if buffer.len() >= self.options.chunk_size {
                    self.flush(&mut buffer, &mut written, bucket, report, progress)
                        .await?;
                    if self.stop_requested() {
                        cancelled = true;
                        break 'scan;
                    }
                }
            }
        }
        cursor.close().await?;

        if cancelled {
            info!(code = %self.code, indexed = written.len(), "stop requested, leaving bucket");
            return Ok(BucketOutcome::Cancelled);
        }
        self.flush(&mut buffer, &mut written, bucket, report, progress)
            .await?;

        if !written.is_empty() {
            match self
                .alerts
                .match_and_notify(&written, &bucket.key_as_string, self.options.dry_run_alerts)
                .await
            {
                Ok(alerts) => merge_alerts(&mut report.alerts, &alerts),
                Err(e) => warn!(error = %format!("{:#}", e), "alert matching failed"),
            }
        }
        Ok(BucketOutcome::Completed)
    }

    /// Turn a source document into its sink form. Never fails: annotation
    /// errors are logged to the municipality's error log.
    async fn prepare(&self, mut doc: Document, report: &mut SyncReport) -> Document {
        doc.strip_internal_fields();

        let errors = self.annotator.annotate_document(&mut doc).await;
        if !errors.is_empty() {
            report.annotation_errors += errors.len();
            if let Err(e) = self.error_log.append(&errors).await {
                warn!(path = %self.error_log.path().display(), error = %e, "could not write error log");
            }
        }

        add_doc_snippets(&mut doc.body, None, self.options.context_chars);
        doc.index = self.sink_index.clone();
        doc
    }

    async fn flush(
        &self,
        buffer: &mut Vec<Document>,
        written: &mut Vec<Document>,
        bucket: &Bucket,
        report: &mut SyncReport,
        progress: &dyn SyncProgressReporter,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let opts = BulkOptions {
            chunk_size: self.options.chunk_size,
            timeout: self.options.bulk_timeout,
        };
        let n = self
            .sink
            .bulk_write(&self.sink_index, buffer, &opts)
            .await
            .with_context(|| format!("Bulk write to {} failed", self.sink_index))?;
        debug!(index = %self.sink_index, n, "chunk written");

        report.indexed += n;
        written.append(buffer);
        progress.report(SyncProgressEvent::Indexed {
            code: self.code.to_string(),
            n: written.len() as u64,
            expected: bucket.doc_count,
        });
        Ok(())
    }
}

fn merge_alerts(total: &mut AlertReport, bucket: &AlertReport) {
    total.checked += bucket.checked;
    total.matched += bucket.matched;
    total.sent += bucket.sent;
    total.dry_run += bucket.dry_run;
    total.failed += bucket.failed;
    total.inactive_ignored += bucket.inactive_ignored;
}

/// Sync one municipality.
pub async fn run_sync(
    services: &SyncServices,
    options: SyncOptions,
    source_index: &str,
    code: MunicipalityCode,
    stop: Arc<AtomicBool>,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    SyncController::new(services, options, source_index, code, stop)
        .run(progress)
        .await
}

/// Sync every configured municipality, at most `parallelism` at a time.
///
/// A failing municipality does not stop the others; its error is returned
/// in place of its report.
pub async fn run_sync_all(
    services: &SyncServices,
    options: SyncOptions,
    municipalities: &[(String, MunicipalityCode)],
    parallelism: usize,
    stop: Arc<AtomicBool>,
    progress: Arc<dyn SyncProgressReporter>,
) -> Vec<(String, Result<SyncReport>)> {
    let permits = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut tasks = JoinSet::new();

    for (i, (source, code)) in municipalities.iter().enumerate() {
        let services = services.clone();
        let options = options.clone();
        let source = source.clone();
        let code = code.clone();
        let stop = stop.clone();
        let progress = progress.clone();
        let permits = permits.clone();

        tasks.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    run_sync(&services, options, &source, code.clone(), stop, progress.as_ref()).await
                }
                Err(e) => Err(e.into()),
            };
            (i, result)
        });
    }

    let mut slots: Vec<Option<Result<SyncReport>>> =
        municipalities.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((i, result)) => slots[i] = Some(result),
            Err(e) => warn!(error = %e, "sync task panicked"),
        }
    }
    municipalities
        .iter()
        .zip(slots)
        .map(|((_, code), slot)| {
            let result =
                slot.unwrap_or_else(|| Err(anyhow!("sync task for {} did not finish", code)));
            (code.to_string(), result)
        })
        .collect()
}

/// Print a run summary on stdout.
pub fn print_report(report: &SyncReport) {
    println!("sync {} ({})", report.code, report.source_index);
    println!("  status: {}", report.status);
    println!("  source documents: {}", report.source_count);
    println!(
        "  sink documents: {} -> {}",
        report.sink_count_before, report.sink_count
    );
    if report.status != SyncStatus::Skipped {
        println!(
            "  buckets: {} / {}",
            report.buckets_done, report.buckets_total
        );
        println!("  indexed: {}", report.indexed);
        println!("  scan errors: {}", report.scan_errors);
        println!("  annotation errors: {}", report.annotation_errors);
        println!(
            "  alerts: {} sent, {} dry-run, {} failed",
            report.alerts.sent, report.alerts.dry_run, report.alerts.failed
        );
    }
    println!("ok");
}
