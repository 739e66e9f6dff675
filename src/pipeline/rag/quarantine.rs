//! Operator-drop intake for the legal corpus.
//!
//! Files dropped into `watched/` are parsed into article chunks, moved
//! to `quarantine/`, and inserted unconfirmed. Nothing becomes
//! searchable until an admin confirms it through the index.
//!
//! File naming convention: `<LAW_CODE>_<NN ref with - for />_<effective from>.txt`,
//! e.g. `ZPDV_NN-39-22_2022-04-01.txt`. Article boundaries are the
//! standard `Članak N.` headings.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use super::index::{keyword_tokens, LawIndex};
use super::types::RagError;
use crate::db::repository::LawChunkRow;

fn article_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Članak\s+(\d+[a-z]?)\.\s*$").expect("static regex"))
}

/// Parsed drop-file name.
#[derive(Debug, PartialEq, Eq)]
pub struct DropName {
    pub law_code: String,
    pub gazette_ref: String,
    pub effective_from: String,
}

pub fn parse_drop_name(file_name: &str) -> Option<DropName> {
    let stem = file_name.strip_suffix(".txt")?;
    let parts: Vec<&str> = stem.splitn(3, '_').collect();
    if parts.len() != 3 {
        return None;
    }
    let gazette = parts[1].strip_prefix("NN-")?;
    chrono::NaiveDate::parse_from_str(parts[2], "%Y-%m-%d").ok()?;
    Some(DropName {
        law_code: parts[0].to_string(),
        gazette_ref: format!("NN {}", gazette.replace('-', "/")),
        effective_from: parts[2].to_string(),
    })
}

/// Split a law text into per-article chunks.
pub fn split_articles(name: &DropName, text: &str) -> Vec<LawChunkRow> {
    let mut chunks = Vec::new();
    let headings: Vec<(usize, String)> = article_heading()
        .captures_iter(text)
        .map(|c| {
            let m = c.get(0).expect("match");
            (m.start(), c.get(1).expect("group").as_str().to_string())
        })
        .collect();

    for (i, (start, article)) in headings.iter().enumerate() {
        let end = headings
            .get(i + 1)
            .map(|(next, _)| *next)
            .unwrap_or(text.len());
        let body = text[*start..end].trim().to_string();
        if body.is_empty() {
            continue;
        }
        chunks.push(LawChunkRow {
            id: String::new(),
            law_code: name.law_code.clone(),
            article: article.clone(),
            paragraph: None,
            text: body.clone(),
            gazette_ref: name.gazette_ref.clone(),
            effective_from: name.effective_from.clone(),
            effective_to: None,
            supersedes: None,
            embedding: None,
            keywords: keyword_tokens(&body).join(" "),
            confirmed: false,
        });
    }

    chunks
}

/// Scan the watched directory, quarantine every parseable drop, and
/// move the file out of `watched/`. Returns ids of quarantined chunks.
pub async fn intake_watched_dir(
    index: &LawIndex,
    watched: &Path,
    quarantine: &Path,
    actor: &str,
) -> Result<Vec<String>, RagError> {
    std::fs::create_dir_all(watched).map_err(|e| RagError::Intake(e.to_string()))?;
    std::fs::create_dir_all(quarantine).map_err(|e| RagError::Intake(e.to_string()))?;

    let mut ingested = Vec::new();

    for entry in std::fs::read_dir(watched).map_err(|e| RagError::Intake(e.to_string()))? {
        let entry = entry.map_err(|e| RagError::Intake(e.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();

        let Some(drop_name) = parse_drop_name(&file_name) else {
            tracing::warn!(file = %file_name, "Unrecognized drop file name, skipping");
            continue;
        };

        let text = std::fs::read_to_string(&path).map_err(|e| RagError::Intake(e.to_string()))?;
        let chunks = split_articles(&drop_name, &text);
        if chunks.is_empty() {
            tracing::warn!(file = %file_name, "No articles found in drop file");
        }

        for chunk in chunks {
            let id = index.ingest(chunk, actor).await?;
            ingested.push(id);
        }

        std::fs::rename(&path, quarantine.join(&file_name))
            .map_err(|e| RagError::Intake(e.to_string()))?;
        tracing::info!(file = %file_name, "Drop file moved to quarantine");
    }

    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use super::super::embedder::HashEmbedder;
    use super::*;
    use crate::db::Database;
    use std::sync::Arc;

    const LAW_TEXT: &str = "\
Članak 38.

Opća stopa PDV-a iznosi 25%.

Članak 39.

Snižena stopa od 13% primjenjuje se na smještaj.
";

    #[test]
    fn drop_name_parses() {
        let n = parse_drop_name("ZPDV_NN-39-22_2022-04-01.txt").unwrap();
        assert_eq!(n.law_code, "ZPDV");
        assert_eq!(n.gazette_ref, "NN 39/22");
        assert_eq!(n.effective_from, "2022-04-01");

        assert!(parse_drop_name("whatever.pdf").is_none());
        assert!(parse_drop_name("ZPDV_NN-39-22_not-a-date.txt").is_none());
    }

    #[test]
    fn articles_split_on_headings() {
        let name = parse_drop_name("ZPDV_NN-73-13_2013-07-01.txt").unwrap();
        let chunks = split_articles(&name, LAW_TEXT);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].article, "38");
        assert!(chunks[0].text.contains("25%"));
        assert_eq!(chunks[1].article, "39");
        assert!(chunks[1].text.contains("13%"));
        assert!(!chunks[0].keywords.is_empty());
    }

    #[tokio::test]
    async fn intake_quarantines_and_moves_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::initialize(dir.path().join("kontura.db")).unwrap();
        let index = LawIndex::new(db, Arc::new(HashEmbedder), 0.05);

        let watched = dir.path().join("watched");
        let quarantine = dir.path().join("quarantine");
        std::fs::create_dir_all(&watched).unwrap();
        std::fs::write(watched.join("ZPDV_NN-73-13_2013-07-01.txt"), LAW_TEXT).unwrap();

        let ids = intake_watched_dir(&index, &watched, &quarantine, "admin")
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        // File moved out of watched.
        assert!(!watched.join("ZPDV_NN-73-13_2013-07-01.txt").exists());
        assert!(quarantine.join("ZPDV_NN-73-13_2013-07-01.txt").exists());

        // Chunks sit in quarantine, not in search.
        assert_eq!(index.quarantine_list().unwrap().len(), 2);
        let hits = index
            .search(
                "stopa pdv",
                chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
                5,
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
