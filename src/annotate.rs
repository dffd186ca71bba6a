//! Geocoding annotation of document text.
//!
//! [`HttpAnnotator`] posts one text per request to the annotation service:
//!
//! ```text
//! POST {url}  {"municipality_code": "GM0363", "text": "..."}
//!   → {"districts": [...], "neighborhoods": [...],
//!      "annotations": [{"toponym", "districts", "neighborhoods", "postings": [[s, e]]}]}
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Network errors and timeouts → retry
//! - Other non-2xx statuses → fail immediately
//! - Backoff doubles from `annotation.backoff_ms` per attempt
//!
//! [`DocumentAnnotator`] applies the annotator to every annotatable field of
//! a document. A failed field never fails the document: it stays
//! unannotated and produces a [`GeocodingErrorRecord`] instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use wo_core::models::{AnnotationResponse, CodeSet, Document, GeocodingErrorRecord, MunicipalityCode};

use crate::config::AnnotationConfig;

/// Why a single annotation call failed.
#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("annotation service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("annotation request timed out")]
    Timeout,
    #[error("annotation request failed: {0}")]
    Transport(String),
    #[error("annotation response could not be decoded: {0}")]
    Decode(String),
}

impl AnnotateError {
    /// HTTP status for the error log; 0 when no response was received.
    pub fn status_code(&self) -> u16 {
        match self {
            AnnotateError::Status { status, .. } => *status,
            AnnotateError::Decode(_) => 200,
            AnnotateError::Timeout | AnnotateError::Transport(_) => 0,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AnnotateError::Status { status, .. } => *status == 429 || *status >= 500,
            AnnotateError::Timeout | AnnotateError::Transport(_) => true,
            AnnotateError::Decode(_) => false,
        }
    }

    /// Server-side failures keep the offending text in the error log.
    pub fn is_server_error(&self) -> bool {
        matches!(self, AnnotateError::Status { status, .. } if *status >= 500)
    }
}

impl From<reqwest::Error> for AnnotateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AnnotateError::Timeout
        } else if e.is_decode() {
            AnnotateError::Decode(e.to_string())
        } else {
            AnnotateError::Transport(e.to_string())
        }
    }
}

/// The geocoding boundary.
#[async_trait]
pub trait Annotator: Send + Sync {
    async fn annotate(
        &self,
        text: &str,
        code: &MunicipalityCode,
    ) -> std::result::Result<AnnotationResponse, AnnotateError>;
}

/// Annotation service client with timeout and bounded retry.
pub struct HttpAnnotator {
    client: Client,
    url: String,
    max_retries: u32,
    backoff: Duration,
}

impl HttpAnnotator {
    pub fn new(config: &AnnotationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    async fn attempt(
        &self,
        text: &str,
        code: &MunicipalityCode,
    ) -> std::result::Result<AnnotationResponse, AnnotateError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({"municipality_code": code.as_str(), "text": text}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnnotateError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let decoded: AnnotationResponse = response.json().await?;
        Ok(decoded.sanitized())
    }
}

#[async_trait]
impl Annotator for HttpAnnotator {
    async fn annotate(
        &self,
        text: &str,
        code: &MunicipalityCode,
    ) -> std::result::Result<AnnotationResponse, AnnotateError> {
        let mut attempt = 0;
        loop {
            match self.attempt(text, code).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    // Exponential backoff: base, 2×base, 4×base, ...
                    let delay = self.backoff * (1u32 << attempt.min(5));
                    debug!(attempt, error = %e, ?delay, "retrying annotation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Remove end-of-line hyphenation the way the annotation service expects.
pub fn clean_text(text: &str) -> String {
    text.replace("-\n", "")
}

/// Result of annotating one field.
#[derive(Debug)]
pub enum FieldOutcome {
    /// No text, or nothing left after cleaning.
    Skipped,
    Annotated { districts: CodeSet, neighborhoods: CodeSet },
    Failed { error: AnnotateError, text: String },
}

/// Successful code sets and failures of one document.
#[derive(Debug, Default)]
pub struct ReducedOutcomes {
    pub districts: CodeSet,
    pub neighborhoods: CodeSet,
    pub annotated: usize,
    pub failures: Vec<(AnnotateError, String)>,
}

pub fn reduce_outcomes(outcomes: Vec<FieldOutcome>) -> ReducedOutcomes {
    outcomes
        .into_iter()
        .fold(ReducedOutcomes::default(), |mut acc, outcome| {
            match outcome {
                FieldOutcome::Skipped => {}
                FieldOutcome::Annotated {
                    districts,
                    neighborhoods,
                } => {
                    acc.districts.extend(districts);
                    acc.neighborhoods.extend(neighborhoods);
                    acc.annotated += 1;
                }
                FieldOutcome::Failed { error, text } => acc.failures.push((error, text)),
            }
            acc
        })
}

/// Annotates whole documents for one municipality.
pub struct DocumentAnnotator {
    annotator: Arc<dyn Annotator>,
    code: MunicipalityCode,
}

impl DocumentAnnotator {
    pub fn new(annotator: Arc<dyn Annotator>, code: MunicipalityCode) -> Self {
        Self { annotator, code }
    }

    /// Annotate every field the document kind calls for, in place.
    ///
    /// Sets the document-level `districts` and `neighborhoods` to the union
    /// of all successful fields. Returns one error record per failed field.
    pub async fn annotate_document(&self, doc: &mut Document) -> Vec<GeocodingErrorRecord> {
        if !doc.is_annotatable() {
            return Vec::new();
        }

        let mut outcomes = Vec::new();
        for field in doc.annotatable_fields_mut() {
            let Some(text) = field.primary_text_mut() else {
                outcomes.push(FieldOutcome::Skipped);
                continue;
            };
            let cleaned = clean_text(text);
            if cleaned.is_empty() {
                outcomes.push(FieldOutcome::Skipped);
                continue;
            }
            text.clone_from(&cleaned);

            match self.annotator.annotate(&cleaned, &self.code).await {
                Ok(response) => {
                    field.annotations = response.annotations;
                    outcomes.push(FieldOutcome::Annotated {
                        districts: response.districts,
                        neighborhoods: response.neighborhoods,
                    });
                }
                Err(error) => outcomes.push(FieldOutcome::Failed {
                    error,
                    text: cleaned,
                }),
            }
        }

        let reduced = reduce_outcomes(outcomes);
        doc.body.districts = Some(reduced.districts);
        doc.body.neighborhoods = Some(reduced.neighborhoods);

        let time = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        reduced
            .failures
            .into_iter()
            .map(|(error, text)| {
                warn!(doc_id = %doc.id, status = error.status_code(), error = %error, "annotation failed");
                GeocodingErrorRecord {
                    doc_id: doc.id.clone(),
                    doc_type: doc.kind.as_str().to_string(),
                    doc_index: doc.index.clone(),
                    municipality_code: self.code.to_string(),
                    status_code: error.status_code(),
                    time: time.clone(),
                    text: error.is_server_error().then_some(text),
                }
            })
            .collect()
    }
}
