//! Shared types, error model, and configuration for Tramit.
//!
//! This crate is the foundation depended on by all other Tramit crates.
//! It provides:
//! - [`TramitError`], the unified error type
//! - Domain types ([`PageForest`], [`SourceCandidate`], [`Document`], [`ChunkRecord`], [`Citation`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], [`SelectorConfig`], [`StoreConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlConfig, DefaultsConfig, EmbeddingProvider, EmbeddingsConfig, LlmConfig,
    PlannerConfig, SearchConfig, SelectorConfig, StoreConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, resolve_api_key,
};
pub use error::{Result, TramitError};
pub use types::{
    ChunkMeta, ChunkRecord, Citation, DocType, Document, DocumentId, DocumentSummary,
    GroundedAnswer, NO_CONTEXT_RESPONSE, NodeId, PageForest, PageNode, ScoredChunk,
    SelectedSource, SourceCandidate,
};
