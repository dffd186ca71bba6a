//! Per-municipality geocoding error log.
//!
//! One JSON object per line in `<log_dir>/geocoding_errors_<CODE>.log`.
//! Records are only ever appended; the file is created on first use.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use wo_core::models::{GeocodingErrorRecord, MunicipalityCode};

#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn for_municipality(log_dir: &Path, code: &MunicipalityCode) -> Self {
        Self {
            path: log_dir.join(format!("geocoding_errors_{}.log", code)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `records` in a single write.
    pub async fn append(&self, records: &[GeocodingErrorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// All records in the log; empty when the file does not exist.
    pub async fn read_all(&self) -> Result<Vec<GeocodingErrorRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Malformed error log line"))
            .collect()
    }
}
