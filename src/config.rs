use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wo_core::models::MunicipalityCode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub snippets: SnippetsConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub municipalities: Vec<MunicipalityConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    /// Cluster holding the source (ORI) indices.
    pub source_url: String,
    /// Cluster holding the per-municipality sink indices and subscriptions.
    pub sink_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default = "default_subscription_index")]
    pub subscription_index: String,
}

fn default_index_prefix() -> String {
    "wo".to_string()
}
fn default_subscription_index() -> String {
    "alerts_wo".to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            index_prefix: default_index_prefix(),
            subscription_index: default_subscription_index(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotationConfig {
    #[serde(default = "default_annotation_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_annotation_url() -> String {
    "https://api.waaroverheid.nl/annotate".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            url: default_annotation_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_scroll")]
    pub scroll: String,
    #[serde(default = "default_bulk_timeout_secs")]
    pub bulk_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub tolerate_item_errors: bool,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_chunk_size() -> usize {
    25
}
fn default_scroll() -> String {
    "10m".to_string()
}
fn default_bulk_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_parallelism() -> usize {
    1
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./log")
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            scroll: default_scroll(),
            bulk_timeout_secs: default_bulk_timeout_secs(),
            tolerate_item_errors: true,
            parallelism: default_parallelism(),
            log_dir: default_log_dir(),
        }
    }
}

impl SyncConfig {
    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnippetsConfig {
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,
}

fn default_context_chars() -> usize {
    wo_core::snippets::DEFAULT_CONTEXT_CHARS
}

impl Default for SnippetsConfig {
    fn default() -> Self {
        Self {
            context_chars: default_context_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    #[serde(default = "default_mail_provider")]
    pub provider: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    /// Environment variable holding the SendGrid API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Base URL used in activation and unsubscribe links.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default = "default_sendgrid_url")]
    pub sendgrid_url: String,
}

fn default_mail_provider() -> String {
    "disabled".to_string()
}
fn default_from_address() -> String {
    "no-reply@waaroverheid.nl".to_string()
}
fn default_api_key_env() -> String {
    "WO_SENDGRID_KEY".to_string()
}
fn default_site_url() -> String {
    "https://waaroverheid.nl".to_string()
}
fn default_sendgrid_url() -> String {
    "https://api.sendgrid.com/v3/mail/send".to_string()
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            provider: default_mail_provider(),
            from_address: default_from_address(),
            api_key_env: default_api_key_env(),
            site_url: default_site_url(),
            sendgrid_url: default_sendgrid_url(),
        }
    }
}

impl MailConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// One `[[municipalities]]` entry for `sync-all`.
#[derive(Debug, Deserialize, Clone)]
pub struct MunicipalityConfig {
    pub code: String,
    /// Source index, alias, or wildcard pattern.
    pub source: String,
}

impl MunicipalityConfig {
    pub fn parsed_code(&self) -> Result<MunicipalityCode> {
        self.code.parse()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.sync.chunk_size == 0 {
        anyhow::bail!("sync.chunk_size must be > 0");
    }

    if config.sync.parallelism == 0 {
        anyhow::bail!("sync.parallelism must be >= 1");
    }

    if config.snippets.context_chars == 0 {
        anyhow::bail!("snippets.context_chars must be > 0");
    }

    for municipality in &config.municipalities {
        municipality
            .parsed_code()
            .with_context(|| format!("Invalid [[municipalities]] entry '{}'", municipality.code))?;
    }

    match config.mail.provider.as_str() {
        "disabled" | "sendgrid" => {}
        other => anyhow::bail!(
            "Unknown mail provider: '{}'. Must be disabled or sendgrid.",
            other
        ),
    }

    Ok(config)
}
