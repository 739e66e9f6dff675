//! Provenance citation attached to RAG results and bookings.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A legal citation precise to article/paragraph and gazette issue,
/// pinned to the business-event date it was resolved for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationRef {
    pub law_code: String,
    pub article: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paragraph: Option<String>,
    pub gazette_ref: String,
    pub effective_on: NaiveDate,
}

impl CitationRef {
    /// Display form used in narratives and the approval UI,
    /// e.g. `ZPDV čl. 75. (NN 39/22, na dan 2026-03-02)`.
    pub fn display(&self) -> String {
        match &self.paragraph {
            Some(p) => format!(
                "{} čl. {}. st. {}. ({}, na dan {})",
                self.law_code, self.article, p, self.gazette_ref, self.effective_on
            ),
            None => format!(
                "{} čl. {}. ({}, na dan {})",
                self.law_code, self.article, self.gazette_ref, self.effective_on
            ),
        }
    }
}
