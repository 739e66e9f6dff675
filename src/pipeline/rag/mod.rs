//! Time-aware legal retrieval (C5): every returned passage is the
//! version in force on the business-event date, with a citation precise
//! to article, paragraph, and gazette issue.

pub mod embedder;
pub mod index;
pub mod quarantine;
pub mod types;

pub use self::embedder::{Embedding, HashEmbedder, HttpEmbedder};
pub use self::index::LawIndex;
pub use self::types::{RagError, ScoredChunk};
