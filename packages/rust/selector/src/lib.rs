//! Source selection: which crawled pages are worth answering from.
//!
//! [`SourceSelector`] batches candidates, asks the completion service which
//! URLs answer the query, keeps only URLs that were actually offered and are
//! still reachable, and accumulates the survivors across crawls.

mod selector;
mod urls;
mod verify;

pub use selector::SourceSelector;
pub use urls::{extract_urls, remove_parent_urls};
pub use verify::{HttpVerifier, UrlVerifier};
