//! Subscription lifecycle: create, activate, delete.
//!
//! Subscriptions live in the subscription index under their token, with the
//! sink index they watch as document type. A new subscription is stored
//! unactivated and an activation mail with its token link is sent; alerts
//! only reach it after [`SubscriptionManager::activate`].

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use wo_core::models::Subscription;
use wo_core::store::IndexService;

use crate::mail::{activation_message, Mailer};

/// Input for [`SubscriptionManager::create`].
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub email: String,
    pub area_name: String,
    /// Query DSL matched against new documents.
    pub query: Value,
    /// Search page URL the subscriber saved.
    pub querystring: String,
    /// Sink index the query runs against.
    pub doc_index: String,
}

pub struct SubscriptionManager {
    index: Arc<dyn IndexService>,
    mailer: Arc<dyn Mailer>,
    subscription_index: String,
    site_url: String,
}

impl SubscriptionManager {
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

    /// Store an unactivated subscription and mail its activation link.
    pub async fn create(&self, new: NewSubscription) -> Result<Subscription> {
        let subscription = Subscription {
            email: new.email,
            token: Uuid::new_v4().simple().to_string(),
            activated: false,
            area_name: new.area_name,
            query: new.query,
            querystring: strip_date_params(&new.querystring),
            doc_index: new.doc_index,
        };

        self.index
            .put(
                &self.subscription_index,
                &subscription.doc_index,
                &subscription.token,
                &serde_json::to_value(&subscription)?,
            )
            .await
            .context("Failed to store subscription")?;
        info!(token = %subscription.token, index = %subscription.doc_index, "subscription created");

        self.mailer
            .send(&activation_message(&subscription, &self.site_url))
            .await
            .context("Failed to send activation mail")?;
        Ok(subscription)
    }

    pub async fn activate(&self, token: &str) -> Result<Subscription> {
        let source = self
            .index
            .get(&self.subscription_index, token)
            .await?
            .ok_or_else(|| anyhow!("Subscription {} not found", token))?;
        let mut subscription: Subscription =
            serde_json::from_value(source).context("Malformed subscription")?;

        self.index
            .update(&self.subscription_index, token, &json!({"activated": true}))
            .await?;
        subscription.activated = true;
        info!(token, "subscription activated");
        Ok(subscription)
    }

    pub async fn delete(&self, token: &str) -> Result<()> {
        if !self.index.delete(&self.subscription_index, token).await? {
            return Err(anyhow!("Subscription {} not found", token));
        }
        info!(token, "subscription deleted");
        Ok(())
    }
}

/// Drop the `from`/`to` date filters from a saved search URL so alert links
/// show all current results. Strings that are not URLs are kept as given.
pub fn strip_date_params(querystring: &str) -> String {
    let Ok(mut url) = Url::parse(querystring) else {
        return querystring.to_string();
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "from" && k != "to")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.to_string()
}
