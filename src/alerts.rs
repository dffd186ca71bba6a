//! Saved-search alerts.
//!
//! After a bucket is indexed, every new document is percolated against the
//! subscription index. Matches are grouped per subscription and each
//! activated subscription receives a single mail with its match count.
//! [`AlertMatcher::resend_since`] replays the same notification for all
//! documents finished after a given date, by running each subscription's
//! stored query directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use wo_core::models::{Document, Subscription, PROCESSING_FINISHED};
use wo_core::store::{IndexError, IndexService};

use crate::mail::{alert_message, Mailer};

/// Outcome of one matching pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertReport {
    /// Documents percolated, or subscriptions checked when resending.
    pub checked: usize,
    /// Activated subscriptions with at least one match.
    pub matched: usize,
    /// Mails handed to the mailer successfully.
    pub sent: usize,
    /// Matches only logged because of a dry run.
    pub dry_run: usize,
    pub failed: usize,
    /// Unactivated subscriptions the backend returned anyway.
    pub inactive_ignored: usize,
}

pub struct AlertMatcher {
    index: Arc<dyn IndexService>,
    mailer: Arc<dyn Mailer>,
    subscription_index: String,
    site_url: String,
}

fn is_missing_index(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<IndexError>(), Some(IndexError::NotFound(_)))
}

impl AlertMatcher {
    pub fn new(
        index: Arc<dyn IndexService>,
        mailer: Arc<dyn Mailer>,
        subscription_index: &str,
        site_url: &str,
    ) -> Self {
        Self {
            index,
            mailer,
            subscription_index: subscription_index.to_string(),
            site_url: site_url.to_string(),
        }
    }

    /// Percolate `documents` (already stored in their sink index) and notify
    /// each matching activated subscription once.
    pub async fn match_and_notify(
        &self,
        documents: &[Document],
        as_of: &str,
        dry_run: bool,
    ) -> Result<AlertReport> {
        let mut report = AlertReport {
            checked: documents.len(),
            ..AlertReport::default()
        };
        info!(documents = documents.len(), "running percolate");

        let mut matches: BTreeMap<String, (Subscription, usize)> = BTreeMap::new();
        for doc in documents {
            let hits = match self.index.percolate(&self.subscription_index, doc).await {
                Ok(hits) => hits,
                Err(e) if is_missing_index(&e) => {
                    warn!(index = %self.subscription_index, "subscription index missing; no alerts");
                    return Ok(report);
                }
                Err(e) => return Err(e),
            };
            for hit in hits {
                if !hit.subscription.activated {
                    report.inactive_ignored += 1;
                    continue;
                }
                matches
                    .entry(hit.id)
                    .or_insert_with(|| (hit.subscription, 0))
                    .1 += 1;
            }
        }

        report.matched = matches.len();
        for (id, (subscription, count)) in matches {
            self.notify(&id, &subscription, count, as_of, dry_run, &mut report)
                .await;
        }
        Ok(report)
    }

    /// Notify every activated subscription with documents whose
    /// `meta.processing_finished` is after `since`.
    pub async fn resend_since(&self, since: NaiveDate, dry_run: bool) -> Result<AlertReport> {
        let since = since.format("%Y-%m-%d").to_string();
        let hits = self
            .index
            .search(&self.subscription_index, &json!({"term": {"activated": true}}))
            .await?;

        let mut report = AlertReport::default();
        for hit in hits {
            let subscription: Subscription = match serde_json::from_value(hit.source) {
                Ok(s) => s,
                Err(e) => {
                    warn!(id = %hit.id, error = %e, "skipping malformed subscription");
                    continue;
                }
            };
            if !subscription.activated {
                report.inactive_ignored += 1;
                continue;
            }
            report.checked += 1;

            let query = finished_since_query(&subscription.query, &since);
            let count = match self.index.count_matching(&subscription.doc_index, &query).await {
                Ok(count) => count,
                Err(e) if is_missing_index(&e) => {
                    info!(subscription = %hit.id, index = %subscription.doc_index, "index missing, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if count == 0 {
                info!(subscription = %hit.id, "no docs found, skipping");
                continue;
            }

            report.matched += 1;
            self.notify(&hit.id, &subscription, count as usize, &since, dry_run, &mut report)
                .await;
        }
        Ok(report)
    }

    async fn notify(
        &self,
        id: &str,
        subscription: &Subscription,
        count: usize,
        as_of: &str,
        dry_run: bool,
        report: &mut AlertReport,
    ) {
        info!(subscription = %id, count, email = %subscription.email, dry_run, "subscription matched");
        if dry_run {
            report.dry_run += 1;
            return;
        }
        let message = alert_message(subscription, count, as_of, &self.site_url);
        match self.mailer.send(&message).await {
            Ok(()) => {
                debug!(subscription = %id, "alert sent");
                report.sent += 1;
            }
            Err(e) => {
                warn!(subscription = %id, error = %e, "failed to send alert");
                report.failed += 1;
            }
        }
    }
}

/// The stored query restricted to documents finished after `since`.
pub fn finished_since_query(stored: &Value, since: &str) -> Value {
    json!({
        "bool": {
            "must": [stored],
            "filter": [{"range": {PROCESSING_FINISHED: {"gt": since}}}]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailMessage;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use wo_core::store::memory::MemoryIndex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<MailMessage>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl Mailer for Recording {
        async fn send(&self, message: &MailMessage) -> Result<()> {
            if self.fail_for.as_deref() == Some(message.to.as_str()) {
                anyhow::bail!("smtp down");
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn subscription(email: &str, activated: bool, district: &str) -> Value {
        json!({
            "email": email,
            "token": email,
            "activated": activated,
            "area_name": "Centrum",
            "query": {"term": {"districts": district}},
            "querystring": "",
            "doc_index": "wo_gm0363"
        })
    }

    fn stored_doc(index: &MemoryIndex, id: &str, district: &str, finished: &str) -> Document {
        let source = json!({"districts": [district], "meta": {"processing_finished": finished}});
        index.insert("wo_gm0363", "events", id, source.clone());
        Document::from_hit(&json!({"_index": "wo_gm0363", "_type": "events", "_id": id, "_source": source}))
            .unwrap()
    }

    fn setup(fail_for: Option<&str>) -> (Arc<MemoryIndex>, Arc<Recording>, AlertMatcher) {
        let index = Arc::new(MemoryIndex::new());
        index.insert("alerts_wo", "wo_gm0363", "s1", subscription("one@example.org", true, "E03"));
        index.insert("alerts_wo", "wo_gm0363", "s2", subscription("two@example.org", false, "E03"));
        index.insert("alerts_wo", "wo_gm0363", "s3", subscription("three@example.org", true, "E05"));
        let mailer = Arc::new(Recording {
            sent: Mutex::new(Vec::new()),
            fail_for: fail_for.map(String::from),
        });
        let matcher = AlertMatcher::new(index.clone(), mailer.clone(), "alerts_wo", "https://x");
        (index, mailer, matcher)
    }

    #[tokio::test]
    async fn one_mail_per_activated_subscription() {
        let (index, mailer, matcher) = setup(None);
        let docs = vec![
            stored_doc(&index, "d1", "E03", "2018-01-02T00:00:00"),
            stored_doc(&index, "d2", "E03", "2018-01-02T00:00:00"),
            stored_doc(&index, "d3", "E07", "2018-01-02T00:00:00"),
        ];
        let report = matcher.match_and_notify(&docs, "2018-01-01", false).await.unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(report.inactive_ignored, 2);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "one@example.org");
        assert!(sent[0].body.contains("2 nieuwe resultaten"));
    }

    #[tokio::test]
    async fn dry_run_sends_nothing() {
        let (index, mailer, matcher) = setup(None);
        let docs = vec![stored_doc(&index, "d1", "E05", "2018-01-02T00:00:00")];
        let report = matcher.match_and_notify(&docs, "2018-01-01", true).await.unwrap();
        assert_eq!(report.dry_run, 1);
        assert_eq!(report.sent, 0);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_send_does_not_stop_others() {
        let (index, mailer, matcher) = setup(Some("one@example.org"));
        let docs = vec![
            stored_doc(&index, "d1", "E03", "2018-01-02T00:00:00"),
            stored_doc(&index, "d2", "E05", "2018-01-02T00:00:00"),
        ];
        let report = matcher.match_and_notify(&docs, "2018-01-01", false).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(mailer.sent.lock().unwrap()[0].to, "three@example.org");
    }

    #[tokio::test]
    async fn missing_subscription_index_means_no_alerts() {
        let index = Arc::new(MemoryIndex::new());
        let matcher = AlertMatcher::new(index.clone(), Arc::new(Recording::default()), "alerts_wo", "");
        let docs = vec![stored_doc(&index, "d1", "E03", "2018-01-02T00:00:00")];
        let report = matcher.match_and_notify(&docs, "2018-01-01", false).await.unwrap();
        assert_eq!(report.matched, 0);
    }

    #[tokio::test]
    async fn resend_counts_documents_finished_after_date() {
        let (index, mailer, matcher) = setup(None);
        stored_doc(&index, "old", "E03", "2017-12-30T00:00:00");
        stored_doc(&index, "new1", "E03", "2018-01-05T00:00:00");
        stored_doc(&index, "new2", "E03", "2018-01-06T00:00:00");

        let since = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
        let report = matcher.resend_since(since, false).await.unwrap();

        // s3 (E05) has no documents; s2 is not activated.
        assert_eq!(report.checked, 2);
        assert_eq!(report.matched, 1);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("2 nieuwe resultaten"));
        assert!(sent[0].body.contains("sinds 2018-01-01"));
    }
}
