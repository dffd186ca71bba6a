//! # wo-core
//!
//! Shared, I/O-free logic for wo-sync: the proceedings document model,
//! the interval-based snippet engine, weekly gap detection, and the
//! [`store::IndexService`] abstraction over the document index.
//!
//! This crate contains no tokio, reqwest, or filesystem access. The
//! application crate provides the Elasticsearch-backed service and the
//! annotation client; [`store::memory::MemoryIndex`] backs the tests.

pub mod gaps;
pub mod interval;
pub mod models;
pub mod snippets;
pub mod store;
