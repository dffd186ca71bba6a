//! Sync progress reporting.
//!
//! Reports observable progress during `wo-sync sync` so operators see which
//! week is being processed and how many documents have been indexed.
//! Progress is emitted on **stderr** so the stdout summary stays parseable.

use std::io::Write;

/// A single progress event for one municipality run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// Starting bucket `n` of `total`.
    Bucket {
        code: String,
        n: usize,
        total: usize,
        week: String,
    },
    /// `n` of the bucket's `expected` documents written so far.
    Indexed { code: String, n: u64, expected: u64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress: "sync GM0363  bucket 2 / 14  2018-01-08".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Bucket {
                code,
                n,
                total,
                week,
            } => format!("sync {}  bucket {} / {}  {}\n", code, n, total, week),
            SyncProgressEvent::Indexed { code, n, expected } => format!(
                "sync {}  indexed  {} / {} documents\n",
                code,
                format_number(*n),
                format_number(*expected)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Bucket {
                code,
                n,
                total,
                week,
            } => serde_json::json!({
                "event": "progress",
                "municipality": code,
                "phase": "bucket",
                "n": n,
                "total": total,
                "week": week
            }),
            SyncProgressEvent::Indexed { code, n, expected } => serde_json::json!({
                "event": "progress",
                "municipality": code,
                "phase": "indexed",
                "n": n,
                "total": expected
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(25_000), "25,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
