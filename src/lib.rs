//! # wo-sync
//!
//! Geo-annotation and alert sync for council proceedings.
//!
//! wo-sync copies documents from a source Elasticsearch index into one
//! sink index per municipality. On the way, every text field is sent to a
//! geocoding service; the districts and neighborhoods it finds are attached
//! to the document together with highlighted sentence snippets. Once a week
//! of documents is stored, it is percolated against saved searches and
//! subscribers are mailed about new matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │ Source index │──▶│ Sync controller           │──▶│ Sink index   │
//! │ ori_<city>_* │   │ gaps → scan → annotate    │   │ wo_<gm code> │
//! └──────────────┘   │ → snippets → bulk write   │   └──────┬───────┘
//!                    └────────────┬─────────────┘          │
//!                                 ▼                        ▼
//!                        ┌────────────────┐       ┌────────────────┐
//!                        │ Annotation API │       │ Alert matcher  │──▶ mail
//!                        └────────────────┘       └────────────────┘
//! ```
//!
//! Runs are incremental: the checkpoint is the newest processing date
//! already in the sink, recomputed at the start of each run, so an
//! interrupted run simply resumes.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`es`] | Elasticsearch implementation of the index service |
//! | [`annotate`] | Annotation client and per-document annotation |
//! | [`error_log`] | Per-municipality geocoding error log |
//! | [`ingest`] | Sync controller |
//! | [`alerts`] | Percolation and alert mails |
//! | [`subscriptions`] | Subscription lifecycle |
//! | [`mail`] | Mail transports and templates |
//! | [`inspect`] | Snippet inspection |
//! | [`progress`] | Progress reporting |
//!
//! Pure logic (models, snippets, gap detection, the in-memory index) lives in
//! the `wo-core` crate.

pub mod alerts;
pub mod annotate;
pub mod config;
pub mod error_log;
pub mod es;
pub mod ingest;
pub mod inspect;
pub mod mail;
pub mod progress;
pub mod subscriptions;
