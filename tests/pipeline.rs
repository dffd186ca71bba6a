use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use wo_core::models::{Annotation, AnnotationResponse, MunicipalityCode, Posting, PROCESSING_STARTED};
use wo_core::store::memory::MemoryIndex;
use wo_core::store::{CalendarInterval, IndexService};
use wo_sync::annotate::{AnnotateError, Annotator};
use wo_sync::error_log::ErrorLog;
use wo_sync::ingest::{run_sync, run_sync_all, SyncOptions, SyncReport, SyncServices, SyncStatus};
use wo_sync::mail::{MailMessage, Mailer};
use wo_sync::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};

const SOURCE: &str = "ori_amsterdam_*";
const SOURCE_INDEX: &str = "ori_amsterdam_20180101";
const SINK: &str = "wo_gm0363";

/// Annotates "Dam" as district E03, fails texts containing "FAIL" with a 500
/// and panics on "PANIC".
struct ScriptedAnnotator;

#[async_trait]
impl Annotator for ScriptedAnnotator {
    async fn annotate(
        &self,
        text: &str,
        _code: &MunicipalityCode,
    ) -> std::result::Result<AnnotationResponse, AnnotateError> {
        if text.contains("PANIC") {
            panic!("annotator crashed");
        }
        if text.contains("FAIL") {
            return Err(AnnotateError::Status {
                status: 500,
                body: "boom".to_string(),
            });
        }
        let Some(byte_pos) = text.find("Dam") else {
            return Ok(AnnotationResponse::default());
        };
        let start = text[..byte_pos].chars().count();
        Ok(AnnotationResponse {
            districts: ["E03".to_string()].into(),
            neighborhoods: Default::default(),
            annotations: vec![Annotation {
                toponym: "Dam".to_string(),
                districts: ["E03".to_string()].into(),
                neighborhoods: Default::default(),
                postings: vec![Posting(start, start + 3)],
            }],
        })
    }
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<MailMessage>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Raises the stop flag on the first indexed chunk.
struct StopAfterFirstChunk(Arc<AtomicBool>);

impl SyncProgressReporter for StopAfterFirstChunk {
    fn report(&self, event: SyncProgressEvent) {
        if matches!(event, SyncProgressEvent::Indexed { .. }) {
            self.0.store(true, Ordering::SeqCst);
        }
    }
}

struct Harness {
    source: Arc<MemoryIndex>,
    sink: Arc<MemoryIndex>,
    mailer: Arc<RecordingMailer>,
    log_dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let sink = Arc::new(MemoryIndex::new());
        sink.insert("alerts_wo", SINK, "active", subscription("active@example.org", true));
        sink.insert("alerts_wo", SINK, "pending", subscription("pending@example.org", false));
        Self {
            source: Arc::new(MemoryIndex::new()),
            sink,
            mailer: Arc::new(RecordingMailer::default()),
            log_dir: TempDir::new().unwrap(),
        }
    }

    /// `count` events on the given day (2018-01-DD), one hour apart from 10:00.
    fn add_events(&self, prefix: &str, day: u32, count: usize, text: &str) {
        for i in 0..count {
            self.source.insert(
                SOURCE_INDEX,
                "events",
                &format!("{}-{}", prefix, i),
                json!({
                    "name": format!("Vergadering {}", i),
                    "description": text,
                    "source_data": {"raw": "blob"},
                    "meta": {
                        "processing_started": format!("2018-01-{:02}T{:02}:00:00", day, 10 + i),
                        "processing_finished": format!("2018-01-{:02}T{:02}:30:00", day, 10 + i),
                        "_internal": true
                    }
                }),
            );
        }
    }

    fn options(&self, chunk_size: usize) -> SyncOptions {
        SyncOptions {
            chunk_size,
            scroll: "1m".to_string(),
            bulk_timeout: std::time::Duration::from_secs(5),
            tolerate_item_errors: true,
            context_chars: 70,
            index_prefix: "wo".to_string(),
            subscription_index: "alerts_wo".to_string(),
            site_url: "https://wo.test".to_string(),
            log_dir: self.log_dir.path().to_path_buf(),
            dry_run_alerts: false,
        }
    }

    fn services(&self) -> SyncServices {
        SyncServices {
            source: self.source.clone(),
            sink: self.sink.clone(),
            annotator: Arc::new(ScriptedAnnotator),
            mailer: self.mailer.clone(),
        }
    }

    async fn run(&self, options: SyncOptions) -> Result<SyncReport> {
        run_sync(
            &self.services(),
            options,
            SOURCE,
            code(),
            Arc::new(AtomicBool::new(false)),
            &NoProgress,
        )
        .await
    }

    fn sink_ids(&self) -> Vec<String> {
        self.sink.ids(SINK)
    }
}

fn code() -> MunicipalityCode {
    "GM0363".parse().unwrap()
}

fn subscription(email: &str, activated: bool) -> Value {
    json!({
        "email": email,
        "token": email,
        "activated": activated,
        "area_name": "Centrum",
        "query": {"term": {"districts": "E03"}},
        "querystring": "",
        "doc_index": SINK
    })
}

async fn latest_date(index: &MemoryIndex, name: &str) -> Option<i64> {
    index
        .date_histogram(name, PROCESSING_STARTED, CalendarInterval::Week, None)
        .await
        .unwrap()
        .and_then(|h| h.latest)
        .map(|l| l.value)
}

#[tokio::test]
async fn full_sync_then_rerun_is_a_noop() {
    let h = Harness::new();
    h.add_events("w1", 2, 3, "Overleg over de Dam.");
    h.add_events("w2", 9, 2, "Geen plaatsnamen hier.");

    let report = h.run(h.options(2)).await.unwrap();
    assert_eq!(report.status, SyncStatus::Done);
    assert_eq!(report.source_count, 5);
    assert_eq!(report.sink_count_before, 0);
    assert_eq!(report.sink_count, 5);
    assert_eq!(report.buckets_total, 2);
    assert_eq!(report.buckets_done, 2);
    assert_eq!(report.indexed, 5);
    assert_eq!(h.sink_ids().len(), 5);
    assert_eq!(
        latest_date(&h.sink, SINK).await,
        latest_date(&h.source, SOURCE).await
    );

    let written = h.sink.bulk_written();
    let again = h.run(h.options(2)).await.unwrap();
    assert_eq!(again.status, SyncStatus::Skipped);
    assert_eq!(again.sink_count, 5);
    assert_eq!(h.sink.bulk_written(), written);
}

#[tokio::test]
async fn documents_on_a_week_boundary_are_synced() {
    let h = Harness::new();
    for (id, started) in [("sunday", "2018-01-07T23:59:59"), ("monday", "2018-01-08T00:00:00")] {
        h.source.insert(
            SOURCE_INDEX,
            "events",
            id,
            json!({"description": "Nergens.", "meta": {"processing_started": started}}),
        );
    }

    let report = h.run(h.options(10)).await.unwrap();
    assert_eq!(report.status, SyncStatus::Done);
    assert_eq!(report.buckets_total, 2);
    assert_eq!(report.indexed, 2);
    assert_eq!(report.sink_count, 2);
    assert_eq!(h.sink_ids(), vec!["monday", "sunday"]);

    let again = h.run(h.options(10)).await.unwrap();
    assert_eq!(again.status, SyncStatus::Skipped);
    assert_eq!(h.sink.bulk_written(), 2);
}

#[tokio::test]
async fn sink_documents_are_stripped_annotated_and_snippeted() {
    let h = Harness::new();
    h.add_events("w1", 2, 1, "De raad sprak over de Dam.\nDaarna niets.");

    h.run(h.options(10)).await.unwrap();

    let stored = h.sink.source_of(SINK, "w1-0").unwrap();
    assert!(stored.get("source_data").is_none());
    assert!(stored["meta"].get("_internal").is_none());
    assert_eq!(stored["districts"], json!(["E03"]));
    assert_eq!(stored["neighborhoods"], json!([]));
    assert_eq!(stored["annotations"][0]["toponym"], "Dam");
    let snippet = stored["snippets"][0].as_str().unwrap();
    assert!(snippet.contains(r#"<em class="c-details--toponym">Dam</em>"#));
    assert!(!snippet.contains("Daarna"));
}

#[tokio::test]
async fn annotation_failure_is_logged_and_document_still_indexed() {
    let h = Harness::new();
    h.add_events("ok", 2, 1, "Over de Dam.");
    h.add_events("bad", 3, 1, "FAIL tekst");

    h.source.insert(
        SOURCE_INDEX,
        "events",
        "mixed",
        json!({
            "description": "Bij de Dam.",
            "sources": [{"description": "FAIL bijlage"}],
            "meta": {"processing_started": "2018-01-04T10:00:00"}
        }),
    );

    let report = h.run(h.options(10)).await.unwrap();
    assert_eq!(report.annotation_errors, 2);
    assert_eq!(report.sink_count, 3);

    let mixed = h.sink.source_of(SINK, "mixed").unwrap();
    assert_eq!(mixed["districts"], json!(["E03"]));
    assert_eq!(mixed["annotations"][0]["toponym"], "Dam");
    assert!(mixed["sources"][0].get("annotations").is_none());

    let bad = h.sink.source_of(SINK, "bad-0").unwrap();
    assert!(bad.get("annotations").is_none());
    assert_eq!(bad["districts"], json!([]));

    let log = ErrorLog::for_municipality(h.log_dir.path(), &code());
    let mut records = log.read_all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].doc_id, "mixed");
    records.truncate(1);
    assert_eq!(records[0].doc_id, "bad-0");
    assert_eq!(records[0].doc_index, SOURCE_INDEX);
    assert_eq!(records[0].municipality_code, "GM0363");
    assert_eq!(records[0].status_code, 500);
    assert_eq!(records[0].text.as_deref(), Some("FAIL tekst"));
}

#[tokio::test]
async fn only_activated_subscriptions_are_notified_once_per_bucket() {
    let h = Harness::new();
    h.add_events("w1", 2, 3, "Over de Dam.");
    h.add_events("w2", 9, 1, "Nergens.");

    let report = h.run(h.options(2)).await.unwrap();
    assert_eq!(report.alerts.sent, 1);
    assert!(report.alerts.inactive_ignored > 0);

    let sent = h.mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "active@example.org");
    assert!(sent[0].body.contains("3 nieuwe resultaten"));
}

#[tokio::test]
async fn dry_run_alerts_send_nothing() {
    let h = Harness::new();
    h.add_events("w1", 2, 2, "Over de Dam.");

    let mut options = h.options(10);
    options.dry_run_alerts = true;
    let report = h.run(options).await.unwrap();
    assert_eq!(report.alerts.dry_run, 1);
    assert!(h.mailer.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_bulk_write_resumes_after_checkpoint() {
    let h = Harness::new();
    h.add_events("w1", 2, 5, "Nergens.");

    h.sink.fail_bulk_after(2);
    assert!(h.run(h.options(2)).await.is_err());
    assert_eq!(h.sink_ids(), vec!["w1-0", "w1-1"]);

    let report = h.run(h.options(2)).await.unwrap();
    assert_eq!(report.status, SyncStatus::Done);
    assert_eq!(report.sink_count_before, 2);
    assert_eq!(report.indexed, 3);
    assert_eq!(report.sink_count, 5);
    assert_eq!(h.sink.bulk_written(), 5);
}

#[tokio::test]
async fn stop_flag_cancels_between_chunks() {
    let h = Harness::new();
    h.add_events("w1", 2, 5, "Over de Dam.");

    let stop = Arc::new(AtomicBool::new(false));
    let report = run_sync(
        &h.services(),
        h.options(2),
        SOURCE,
        code(),
        stop.clone(),
        &StopAfterFirstChunk(stop.clone()),
    )
    .await
    .unwrap();

    assert_eq!(report.status, SyncStatus::Cancelled);
    assert_eq!(report.sink_count, 2);
    assert_eq!(report.buckets_done, 0);
    assert!(h.mailer.sent.lock().unwrap().is_empty());

    let resumed = h.run(h.options(2)).await.unwrap();
    assert_eq!(resumed.status, SyncStatus::Done);
    assert_eq!(resumed.sink_count, 5);
}

#[tokio::test]
async fn unreadable_source_documents_are_skipped_when_tolerated() {
    let h = Harness::new();
    h.add_events("w1", 2, 2, "Nergens.");
    h.source.insert(
        SOURCE_INDEX,
        "events",
        "broken",
        json!({"sources": "not a list", "meta": {"processing_started": "2018-01-02T20:00:00"}}),
    );

    let report = h.run(h.options(10)).await.unwrap();
    assert_eq!(report.scan_errors, 1);
    assert_eq!(report.sink_count, 2);

    let mut strict = h.options(10);
    strict.tolerate_item_errors = false;
    let fresh = Harness::new();
    fresh.add_events("w1", 2, 1, "Nergens.");
    fresh.source.insert(
        SOURCE_INDEX,
        "events",
        "broken",
        json!({"sources": "not a list", "meta": {"processing_started": "2018-01-02T20:00:00"}}),
    );
    assert!(fresh.run(strict).await.is_err());
}

#[tokio::test]
async fn missing_source_is_an_error() {
    let h = Harness::new();
    let err = run_sync(
        &h.services(),
        h.options(10),
        "ori_nowhere",
        code(),
        Arc::new(AtomicBool::new(false)),
        &NoProgress,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("cannot be found"));
}

#[tokio::test]
async fn crashed_municipality_is_reported_in_sync_all() {
    let h = Harness::new();
    h.add_events("w1", 2, 1, "Over de Dam.");
    h.source.insert(
        "ori_rotterdam_20180101",
        "events",
        "crash",
        json!({"description": "PANIC", "meta": {"processing_started": "2018-01-02T10:00:00"}}),
    );

    let municipalities = vec![
        ("ori_rotterdam_*".to_string(), "GM0599".parse::<MunicipalityCode>().unwrap()),
        (SOURCE.to_string(), code()),
    ];
    let results = run_sync_all(
        &h.services(),
        h.options(10),
        &municipalities,
        2,
        Arc::new(AtomicBool::new(false)),
        Arc::new(NoProgress),
    )
    .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "GM0599");
    let err = results[0].1.as_ref().unwrap_err();
    assert!(err.to_string().contains("did not finish"));
    assert_eq!(results[1].0, "GM0363");
    assert_eq!(results[1].1.as_ref().unwrap().status, SyncStatus::Done);
}
