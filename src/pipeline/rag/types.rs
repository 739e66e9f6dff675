//! Retrieval result shapes.

use serde::Serialize;

use crate::db::repository::LawChunkRow;
use crate::models::CitationRef;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("validity slices overlap for {law_code} čl. {article}")]
    OverlappingSlice { law_code: String, article: String },
    #[error("chunk not found: {0}")]
    NotFound(String),
    #[error("quarantine intake failed: {0}")]
    Intake(String),
    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

/// One search hit: the chunk, its combined score, and the citation the
/// caller attaches to whatever the chunk justified.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub law_code: String,
    pub article: String,
    pub paragraph: Option<String>,
    pub text: String,
    pub score: f32,
    pub citation: CitationRef,
}

impl ScoredChunk {
    pub fn from_row(row: &LawChunkRow, score: f32, as_of: chrono::NaiveDate) -> Self {
        Self {
            chunk_id: row.id.clone(),
            law_code: row.law_code.clone(),
            article: row.article.clone(),
            paragraph: row.paragraph.clone(),
            text: row.text.clone(),
            score,
            citation: CitationRef {
                law_code: row.law_code.clone(),
                article: row.article.clone(),
                paragraph: row.paragraph.clone(),
                gazette_ref: row.gazette_ref.clone(),
                effective_on: as_of,
            },
        }
    }
}
