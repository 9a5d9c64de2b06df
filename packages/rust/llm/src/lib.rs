//! Completion and embedding seams for Tramit.
//!
//! Every model-backed step (query planning, source selection, grounded
//! answers) talks to a [`CompletionService`]; the vector index talks to an
//! [`Embedder`]. [`OpenAiCompatClient`] implements both over any
//! OpenAI-compatible HTTP API, and [`HashingEmbedder`] is the offline default.

mod completion;
mod hashing;
mod openai;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use completion::{ChatMessage, CompletionRequest, CompletionService, Embedder, Role};
pub use hashing::HashingEmbedder;
pub use openai::OpenAiCompatClient;
