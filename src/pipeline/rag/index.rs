//! Time-aware legal index (C5).
//!
//! Search is a union of dense similarity (brute-force cosine over the
//! stored vectors; the corpus is a few thousand article chunks) and a
//! keyword overlap score, filtered to the chunks in force on the query
//! date. Writes are serialized behind one mutex and each write commits
//! in a single transaction, so readers always observe a complete
//! snapshot of the corpus.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::embedder::{cosine_similarity, Embedding};
use super::types::{RagError, ScoredChunk};
use crate::audit;
use crate::db::repository::{self, LawChunkRow};
use crate::db::Database;

const DENSE_WEIGHT: f32 = 0.7;
const KEYWORD_WEIGHT: f32 = 0.3;
/// Small preference for the slice enacted closest to the query date.
const PROXIMITY_BOOST: f32 = 0.02;

pub struct LawIndex {
    db: Database,
    embedder: Arc<dyn Embedding>,
    confidence_floor: f32,
    write_lock: Mutex<()>,
}

/// Normalized keyword tokens for indexing and scoring.
pub fn keyword_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(String::from)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

impl LawIndex {
    pub fn new(db: Database, embedder: Arc<dyn Embedding>, confidence_floor: f32) -> Self {
        Self {
            db,
            embedder,
            confidence_floor,
            write_lock: Mutex::new(()),
        }
    }

    /// Ingest a new chunk into quarantine. Rejects a chunk whose slot
    /// already has an open-ended slice; that path must go through
    /// `supersede` so slicing stays total and non-overlapping.
    pub async fn ingest(&self, mut chunk: LawChunkRow, actor: &str) -> Result<String, RagError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.db.open()?;

        if let Some(open) = repository::open_ended_chunk(
            &conn,
            &chunk.law_code,
            &chunk.article,
            chunk.paragraph.as_deref(),
        )? {
            if open.id != chunk.id {
                return Err(RagError::OverlappingSlice {
                    law_code: chunk.law_code,
                    article: chunk.article,
                });
            }
        }

        if chunk.id.is_empty() {
            chunk.id = Uuid::new_v4().to_string();
        }
        if chunk.embedding.is_none() {
            chunk.embedding = Some(self.embedder.embed(&chunk.text).await?);
        }
        if chunk.keywords.is_empty() {
            chunk.keywords = keyword_tokens(&chunk.text).join(" ");
        }
        chunk.confirmed = false;

        repository::insert_chunk(&conn, &chunk)?;
        audit::append(
            &conn,
            actor,
            audit::kind::CORPUS_INGESTED,
            &chunk.id,
            serde_json::json!({
                "law_code": chunk.law_code,
                "article": chunk.article,
                "gazette_ref": chunk.gazette_ref,
                "effective_from": chunk.effective_from,
            }),
        )
        .map_err(|e| RagError::Intake(e.to_string()))?;

        tracing::info!(chunk_id = %chunk.id, law = %chunk.law_code, "Law chunk quarantined");
        Ok(chunk.id)
    }

    /// Replace the current slice of an article from the new chunk's
    /// start date onward. The old slice keeps serving earlier dates.
    pub async fn supersede(
        &self,
        old_id: &str,
        mut new_chunk: LawChunkRow,
        actor: &str,
    ) -> Result<String, RagError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.db.open()?;

        let old = repository::get_chunk(&conn, old_id)?
            .ok_or_else(|| RagError::NotFound(old_id.to_string()))?;

        let new_from = NaiveDate::parse_from_str(&new_chunk.effective_from, "%Y-%m-%d")
            .map_err(|_| RagError::Intake(format!("bad effective_from: {}", new_chunk.effective_from)))?;
        let old_to = (new_from - chrono::Duration::days(1))
            .format("%Y-%m-%d")
            .to_string();

        if new_chunk.id.is_empty() {
            new_chunk.id = Uuid::new_v4().to_string();
        }
        if new_chunk.embedding.is_none() {
            new_chunk.embedding = Some(self.embedder.embed(&new_chunk.text).await?);
        }
        if new_chunk.keywords.is_empty() {
            new_chunk.keywords = keyword_tokens(&new_chunk.text).join(" ");
        }
        new_chunk.supersedes = Some(old.id.clone());
        new_chunk.confirmed = false;

        // One transaction: close the old slice and insert the new one,
        // so no reader sees a gap.
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(crate::db::DatabaseError::from)?;
        let result = (|| -> Result<(), RagError> {
            repository::close_chunk_validity(&conn, &old.id, &old_to)?;
            repository::insert_chunk(&conn, &new_chunk)?;
            audit::append(
                &conn,
                actor,
                audit::kind::CORPUS_SUPERSEDED,
                &new_chunk.id,
                serde_json::json!({
                    "supersedes": old.id,
                    "old_effective_to": old_to,
                    "new_effective_from": new_chunk.effective_from,
                }),
            )
            .map_err(|e| RagError::Intake(e.to_string()))?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")
                    .map_err(crate::db::DatabaseError::from)?;
                tracing::info!(old = %old.id, new = %new_chunk.id, "Law chunk superseded");
                Ok(new_chunk.id)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Promote a quarantined chunk to searchable. Operator-only; the
    /// caller enforces the admin role.
    pub async fn confirm(&self, chunk_id: &str, actor: &str) -> Result<(), RagError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.db.open()?;
        repository::confirm_chunk(&conn, chunk_id)?;
        audit::append(
            &conn,
            actor,
            audit::kind::CORPUS_CONFIRMED,
            chunk_id,
            serde_json::json!({}),
        )
        .map_err(|e| RagError::Intake(e.to_string()))?;
        Ok(())
    }

    pub fn quarantine_list(&self) -> Result<Vec<LawChunkRow>, RagError> {
        let conn = self.db.open()?;
        Ok(repository::quarantined_chunks(&conn)?)
    }

    /// Search the corpus as it stood in force on `as_of`.
    ///
    /// A dense-search failure (embedding endpoint down) degrades to
    /// keyword-only scoring rather than failing the query.
    pub async fn search(
        &self,
        query: &str,
        as_of: NaiveDate,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let conn = self.db.open()?;
        let rows = repository::chunks_in_force(&conn, &as_of.format("%Y-%m-%d").to_string())?;
        if rows.is_empty() {
            return Ok(vec![]);
        }

        let query_vector = match self.embedder.embed(query).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "Dense search unavailable, keyword fallback");
                None
            }
        };
        let query_tokens = keyword_tokens(query);

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let keyword_score = if query_tokens.is_empty() {
                    0.0
                } else {
                    let chunk_tokens: Vec<&str> = row.keywords.split(' ').collect();
                    let hits = query_tokens
                        .iter()
                        .filter(|t| chunk_tokens.contains(&t.as_str()))
                        .count();
                    hits as f32 / query_tokens.len() as f32
                };

                let score = match (&query_vector, &row.embedding) {
                    (Some(q), Some(v)) => {
                        DENSE_WEIGHT * cosine_similarity(q, v) + KEYWORD_WEIGHT * keyword_score
                    }
                    _ => keyword_score,
                };

                let proximity = NaiveDate::parse_from_str(&row.effective_from, "%Y-%m-%d")
                    .map(|from| {
                        let days = (as_of - from).num_days().max(0) as f32;
                        PROXIMITY_BOOST / (1.0 + days / 365.0)
                    })
                    .unwrap_or(0.0);

                ScoredChunk::from_row(row, score + proximity, as_of)
            })
            .filter(|c| c.score >= self.confidence_floor)
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::super::embedder::HashEmbedder;
    use super::*;

    fn index(dir: &tempfile::TempDir) -> LawIndex {
        let db = Database::initialize(dir.path().join("kontura.db")).unwrap();
        LawIndex::new(db, Arc::new(HashEmbedder), 0.05)
    }

    fn chunk(law: &str, article: &str, text: &str, from: &str) -> LawChunkRow {
        LawChunkRow {
            id: String::new(),
            law_code: law.into(),
            article: article.into(),
            paragraph: None,
            text: text.into(),
            gazette_ref: "NN 73/13".into(),
            effective_from: from.into(),
            effective_to: None,
            supersedes: None,
            embedding: None,
            keywords: String::new(),
            confirmed: false,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn search_respects_time_slices() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(&dir);

        let old = idx
            .ingest(
                chunk("ZPDV", "38", "Opća stopa PDV-a iznosi 25%.", "2013-07-01"),
                "admin",
            )
            .await
            .unwrap();
        idx.confirm(&old, "admin").await.unwrap();

        let new = idx
            .supersede(
                &old,
                chunk("ZPDV", "38", "Opća stopa PDV-a iznosi 23%.", "2026-01-01"),
                "admin",
            )
            .await
            .unwrap();
        idx.confirm(&new, "admin").await.unwrap();

        let past = idx.search("stopa pdv", date("2025-06-15"), 5).await.unwrap();
        assert_eq!(past.len(), 1);
        assert!(past[0].text.contains("25%"));

        let current = idx.search("stopa pdv", date("2026-03-02"), 5).await.unwrap();
        assert_eq!(current.len(), 1);
        assert!(current[0].text.contains("23%"));
    }

    #[tokio::test]
    async fn supersession_does_not_affect_prior_dates() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(&dir);

        let old = idx
            .ingest(chunk("ZPDV", "75", "Prijenos porezne obveze.", "2013-07-01"), "admin")
            .await
            .unwrap();
        idx.confirm(&old, "admin").await.unwrap();

        // Supersession effective D+1 leaves queries at D bound to the old text.
        let new = idx
            .supersede(
                &old,
                chunk("ZPDV", "75", "Prijenos porezne obveze, izmijenjen.", "2026-03-03"),
                "admin",
            )
            .await
            .unwrap();
        idx.confirm(&new, "admin").await.unwrap();

        let at_d = idx
            .search("prijenos porezne obveze", date("2026-03-02"), 5)
            .await
            .unwrap();
        assert_eq!(at_d.len(), 1);
        assert_eq!(at_d[0].chunk_id, old);
    }

    #[tokio::test]
    async fn results_carry_precise_citations() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(&dir);

        let mut c = chunk("ZPDV", "75", "Prijenos porezne obveze na primatelja.", "2013-07-01");
        c.paragraph = Some("2".into());
        c.gazette_ref = "NN 39/22".into();
        let id = idx.ingest(c, "admin").await.unwrap();
        idx.confirm(&id, "admin").await.unwrap();

        let hits = idx
            .search("prijenos porezne obveze", date("2026-03-02"), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let citation = &hits[0].citation;
        assert_eq!(citation.law_code, "ZPDV");
        assert_eq!(citation.article, "75");
        assert_eq!(citation.paragraph.as_deref(), Some("2"));
        assert_eq!(citation.gazette_ref, "NN 39/22");
        assert_eq!(citation.effective_on, date("2026-03-02"));
    }

    #[tokio::test]
    async fn unconfirmed_chunks_invisible_to_search() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(&dir);

        idx.ingest(chunk("ZPDV", "38", "Stopa PDV-a 25%.", "2013-07-01"), "admin")
            .await
            .unwrap();

        let hits = idx.search("stopa pdv", date("2026-03-02"), 5).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(idx.quarantine_list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ingest_rejects_overlapping_open_slice() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(&dir);

        idx.ingest(chunk("ZPDV", "38", "Stopa 25%.", "2013-07-01"), "admin")
            .await
            .unwrap();
        let err = idx
            .ingest(chunk("ZPDV", "38", "Stopa 23%.", "2026-01-01"), "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::OverlappingSlice { .. }));
    }

    #[tokio::test]
    async fn ranking_prefers_relevant_article() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(&dir);

        for (article, text) in [
            ("38", "Opća stopa poreza na dodanu vrijednost iznosi 25% na sve isporuke."),
            ("75", "Prijenos porezne obveze primjenjuje se na primatelja usluge."),
            ("17", "Mjesto obavljanja usluga određuje se prema sjedištu primatelja."),
        ] {
            let id = idx
                .ingest(chunk("ZPDV", article, text, "2013-07-01"), "admin")
                .await
                .unwrap();
            idx.confirm(&id, "admin").await.unwrap();
        }

        let hits = idx
            .search("prijenos porezne obveze primatelj", date("2026-03-02"), 3)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].article, "75");
    }
}
