use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use wo_core::models::{MunicipalityCode, Posting};
use wo_sync::annotate::{Annotator, HttpAnnotator};
use wo_sync::config::AnnotationConfig;

#[derive(Clone)]
struct Mock {
    calls: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    /// Status for each call by position; calls past the end succeed.
    script: Arc<Vec<StatusCode>>,
}

impl Mock {
    fn new(script: Vec<StatusCode>) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            bodies: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(script),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn annotate(State(mock): State<Mock>, Json(body): Json<Value>) -> Response {
    let n = mock.calls.fetch_add(1, Ordering::SeqCst);
    mock.bodies.lock().unwrap().push(body);
    match mock.script.get(n) {
        Some(status) => (*status, "scripted failure").into_response(),
        None => Json(json!({
            "districts": ["E03"],
            "neighborhoods": ["E03a"],
            "annotations": [{
                "toponym": "Dam",
                "districts": ["E03"],
                "neighborhoods": ["E03a"],
                "postings": [[8, 11], [5, 5]]
            }]
        }))
        .into_response(),
    }
}

async fn not_json() -> &'static str {
    "<html>oops</html>"
}

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/annotate", addr)
}

fn config(url: String, max_retries: u32) -> AnnotationConfig {
    AnnotationConfig {
        url,
        timeout_secs: 5,
        max_retries,
        backoff_ms: 1,
    }
}

fn code() -> MunicipalityCode {
    "GM0363".parse().unwrap()
}

#[tokio::test]
async fn retries_server_errors_then_succeeds() {
    let mock = Mock::new(vec![StatusCode::SERVICE_UNAVAILABLE, StatusCode::INTERNAL_SERVER_ERROR]);
    let url = serve(
        Router::new()
            .route("/annotate", post(annotate))
            .with_state(mock.clone()),
    )
    .await;

    let annotator = HttpAnnotator::new(&config(url, 3)).unwrap();
    let response = annotator.annotate("Op de  Dam", &code()).await.unwrap();

    assert_eq!(mock.calls(), 3);
    assert!(response.districts.contains("E03"));
    assert!(response.neighborhoods.contains("E03a"));
    // The empty posting is dropped.
    assert_eq!(response.annotations[0].postings, vec![Posting(8, 11)]);

    let bodies = mock.bodies.lock().unwrap();
    assert_eq!(bodies[0]["municipality_code"], "GM0363");
    assert_eq!(bodies[0]["text"], "Op de  Dam");
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    let mock = Mock::new(vec![StatusCode::BAD_GATEWAY; 10]);
    let url = serve(
        Router::new()
            .route("/annotate", post(annotate))
            .with_state(mock.clone()),
    )
    .await;

    let annotator = HttpAnnotator::new(&config(url, 2)).unwrap();
    let err = annotator.annotate("tekst", &code()).await.unwrap_err();
    assert_eq!(err.status_code(), 502);
    assert!(err.is_server_error());
    assert_eq!(mock.calls(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let mock = Mock::new(vec![StatusCode::BAD_REQUEST]);
    let url = serve(
        Router::new()
            .route("/annotate", post(annotate))
            .with_state(mock.clone()),
    )
    .await;

    let annotator = HttpAnnotator::new(&config(url, 3)).unwrap();
    let err = annotator.annotate("tekst", &code()).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(!err.is_server_error());
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn undecodable_body_is_reported_without_retry() {
    let url = serve(Router::new().route("/annotate", post(not_json))).await;

    let annotator = HttpAnnotator::new(&config(url, 3)).unwrap();
    let err = annotator.annotate("tekst", &code()).await.unwrap_err();
    assert_eq!(err.status_code(), 200);
}

#[tokio::test]
async fn unreachable_service_reports_status_zero() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let annotator = HttpAnnotator::new(&config(format!("http://{}/annotate", addr), 1)).unwrap();
    let err = annotator.annotate("tekst", &code()).await.unwrap_err();
    assert_eq!(err.status_code(), 0);
}
