//! Concurrent web crawler for gathering candidate sources.
//!
//! [`Crawler::explore`] turns a set of seed URLs into a [`PageForest`]
//! (re-exported from `tramit-shared`), one tree per seed, with page content
//! already extracted by [`tramit_extract::ContentExtractor`].

pub mod engine;

pub use engine::{CrawlOutcome, CrawlStats, Crawler};
pub use tramit_extract::ExtractedPage;
pub use tramit_shared::{PageForest, PageNode};
