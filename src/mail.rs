//! Outgoing mail for subscription activation and alerts.
//!
//! Use [`create_mailer`] to build the configured transport:
//!
//! - **`disabled`** — messages are logged and dropped.
//! - **`sendgrid`** — SendGrid v3 `mail/send`; the API key is read from the
//!   environment variable named by `mail.api_key_env`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use wo_core::models::Subscription;

use crate::config::MailConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<()>;
}

pub fn create_mailer(config: &MailConfig) -> Result<Arc<dyn Mailer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledMailer)),
        "sendgrid" => Ok(Arc::new(SendGridMailer::new(config)?)),
        other => bail!("Unknown mail provider: '{}'", other),
    }
}

pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "mail disabled; not sending");
        Ok(())
    }
}

pub struct SendGridMailer {
    client: Client,
    url: String,
    api_key: String,
    from: String,
}

impl SendGridMailer {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            url: config.sendgrid_url.clone(),
            api_key,
            from: config.from_address.clone(),
        })
    }
}

#[async_trait]
impl Mailer for SendGridMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        let body = json!({
            "personalizations": [{"to": [{"email": message.to}]}],
            "from": {"email": self.from},
            "subject": message.subject,
            "content": [{"type": "text/plain", "value": message.body}],
        });
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("SendGrid request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("SendGrid error {}: {}", status, text);
        }
        Ok(())
    }
}

fn subscription_link(site_url: &str, subscription: &Subscription, action: &str) -> String {
    format!(
        "{}/subscription/{}/{}/{}",
        site_url.trim_end_matches('/'),
        subscription.doc_index,
        subscription.token,
        action
    )
}

/// Activation request sent right after a subscription is created.
pub fn activation_message(subscription: &Subscription, site_url: &str) -> MailMessage {
    MailMessage {
        to: subscription.email.clone(),
        subject: format!(
            "Activeer uw WaarOverheid meldingen voor {}",
            subscription.area_name
        ),
        body: format!(
            "U heeft zich aangemeld voor meldingen over {area}.\n\n\
             Bevestig uw aanmelding via:\n{activate}\n\n\
             Heeft u zich niet aangemeld? Dan kunt u deze e-mail negeren.\n",
            area = subscription.area_name,
            activate = subscription_link(site_url, subscription, "activate"),
        ),
    }
}

/// Notification about `doc_count` new results since `as_of`.
pub fn alert_message(
    subscription: &Subscription,
    doc_count: usize,
    as_of: &str,
    site_url: &str,
) -> MailMessage {
    MailMessage {
        to: subscription.email.clone(),
        subject: format!(
            "Nieuwe resultaten beschikbaar voor uw opgeslagen zoekopdracht in {}",
            subscription.label()
        ),
        body: format!(
            "Er zijn {count} nieuwe resultaten gevonden sinds {as_of} voor uw zoekopdracht in {label}.\n\n\
             Bekijk de resultaten:\n{results}\n\n\
             Afmelden:\n{unsubscribe}\n",
            count = doc_count,
            as_of = as_of,
            label = subscription.label(),
            results = if subscription.querystring.is_empty() {
                site_url.to_string()
            } else {
                subscription.querystring.clone()
            },
            unsubscribe = subscription_link(site_url, subscription, "delete"),
        ),
    }
}
