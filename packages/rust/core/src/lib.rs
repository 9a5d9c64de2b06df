//! Core retrieval pipeline for Tramit.
//!
//! This crate ties together seed discovery, crawling, source selection and
//! the document store into per-session workflows ([`ResearchSession`]), and
//! owns the chunker, the in-memory vector index and the query planner.

pub mod chunker;
pub mod index;
pub mod ingest;
pub mod pipeline;
pub mod planner;
pub mod providers;
pub mod store;

pub use ingest::{ingest_file, ingest_text, ingest_url};
pub use pipeline::{ProgressReporter, ResearchOutcome, ResearchSession, SilentProgress};
pub use planner::QueryPlanner;
pub use store::DocumentStore;
