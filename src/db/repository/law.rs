use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DatabaseError;

/// A legal corpus chunk row. Embeddings are little-endian f32 blobs,
/// the same encoding the vector search decodes.
#[derive(Debug, Clone)]
pub struct LawChunkRow {
    pub id: String,
    pub law_code: String,
    pub article: String,
    pub paragraph: Option<String>,
    pub text: String,
    pub gazette_ref: String,
    pub effective_from: String,
    pub effective_to: Option<String>,
    pub supersedes: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub keywords: String,
    pub confirmed: bool,
}

pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn insert_chunk(conn: &Connection, chunk: &LawChunkRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO law_chunks (id, law_code, article, paragraph, text, gazette_ref,
             effective_from, effective_to, supersedes, embedding, keywords, confirmed, ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            chunk.id,
            chunk.law_code,
            chunk.article,
            chunk.paragraph,
            chunk.text,
            chunk.gazette_ref,
            chunk.effective_from,
            chunk.effective_to,
            chunk.supersedes,
            chunk.embedding.as_deref().map(encode_embedding),
            chunk.keywords,
            chunk.confirmed as i64,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_chunk(conn: &Connection, id: &str) -> Result<Option<LawChunkRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, law_code, article, paragraph, text, gazette_ref, effective_from,
                    effective_to, supersedes, embedding, keywords, confirmed
             FROM law_chunks WHERE id = ?1",
            params![id],
            row_to_chunk,
        )
        .optional()?;
    Ok(row)
}

/// Confirmed chunks whose validity window contains `as_of` (ISO date).
pub fn chunks_in_force(
    conn: &Connection,
    as_of: &str,
) -> Result<Vec<LawChunkRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, law_code, article, paragraph, text, gazette_ref, effective_from,
                effective_to, supersedes, embedding, keywords, confirmed
         FROM law_chunks
         WHERE confirmed = 1 AND effective_from <= ?1
           AND (effective_to IS NULL OR effective_to >= ?1)",
    )?;
    let rows = stmt
        .query_map(params![as_of], row_to_chunk)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Unconfirmed chunks awaiting operator review (admin surface only).
pub fn quarantined_chunks(conn: &Connection) -> Result<Vec<LawChunkRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, law_code, article, paragraph, text, gazette_ref, effective_from,
                effective_to, supersedes, embedding, keywords, confirmed
         FROM law_chunks WHERE confirmed = 0 ORDER BY ingested_at ASC",
    )?;
    let rows = stmt
        .query_map([], row_to_chunk)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn confirm_chunk(conn: &Connection, id: &str) -> Result<(), DatabaseError> {
    let n = conn.execute(
        "UPDATE law_chunks SET confirmed = 1 WHERE id = ?1",
        params![id],
    )?;
    if n == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "law_chunk".into(),
            id: id.into(),
        });
    }
    Ok(())
}

/// Close the old chunk's validity the day before the new one begins.
pub fn close_chunk_validity(
    conn: &Connection,
    id: &str,
    effective_to: &str,
) -> Result<(), DatabaseError> {
    let n = conn.execute(
        "UPDATE law_chunks SET effective_to = ?2 WHERE id = ?1",
        params![id, effective_to],
    )?;
    if n == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "law_chunk".into(),
            id: id.into(),
        });
    }
    Ok(())
}

/// Open-ended chunk for a (law, article, paragraph) slot, if any.
/// At most one may exist; supersession keeps it that way.
pub fn open_ended_chunk(
    conn: &Connection,
    law_code: &str,
    article: &str,
    paragraph: Option<&str>,
) -> Result<Option<LawChunkRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, law_code, article, paragraph, text, gazette_ref, effective_from,
                    effective_to, supersedes, embedding, keywords, confirmed
             FROM law_chunks
             WHERE law_code = ?1 AND article = ?2
               AND ((?3 IS NULL AND paragraph IS NULL) OR paragraph = ?3)
               AND effective_to IS NULL",
            params![law_code, article, paragraph],
            row_to_chunk,
        )
        .optional()?;
    Ok(row)
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<LawChunkRow> {
    let embedding: Option<Vec<u8>> = row.get(9)?;
    Ok(LawChunkRow {
        id: row.get(0)?,
        law_code: row.get(1)?,
        article: row.get(2)?,
        paragraph: row.get(3)?,
        text: row.get(4)?,
        gazette_ref: row.get(5)?,
        effective_from: row.get(6)?,
        effective_to: row.get(7)?,
        supersedes: row.get(8)?,
        embedding: embedding.as_deref().map(decode_embedding),
        keywords: row.get(10)?,
        confirmed: row.get::<_, i64>(11)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn chunk(id: &str, from: &str, to: Option<&str>, confirmed: bool) -> LawChunkRow {
        LawChunkRow {
            id: id.into(),
            law_code: "ZPDV".into(),
            article: "38".into(),
            paragraph: None,
            text: "Stopa PDV-a iznosi 25%.".into(),
            gazette_ref: "NN 73/13".into(),
            effective_from: from.into(),
            effective_to: to.map(String::from),
            supersedes: None,
            embedding: Some(vec![0.1, 0.2, 0.3]),
            keywords: "stopa pdv".into(),
            confirmed,
        }
    }

    #[test]
    fn embedding_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.75];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }

    #[test]
    fn time_filter_selects_in_force() {
        let conn = open_memory_database().unwrap();
        insert_chunk(&conn, &chunk("old", "2013-07-01", Some("2025-12-31"), true)).unwrap();
        insert_chunk(&conn, &chunk("new", "2026-01-01", None, true)).unwrap();

        let past = chunks_in_force(&conn, "2024-06-15").unwrap();
        assert_eq!(past.len(), 1);
        assert_eq!(past[0].id, "old");

        let current = chunks_in_force(&conn, "2026-03-02").unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, "new");
    }

    #[test]
    fn unconfirmed_chunks_not_searchable() {
        let conn = open_memory_database().unwrap();
        insert_chunk(&conn, &chunk("q", "2026-01-01", None, false)).unwrap();

        assert!(chunks_in_force(&conn, "2026-03-02").unwrap().is_empty());
        assert_eq!(quarantined_chunks(&conn).unwrap().len(), 1);

        confirm_chunk(&conn, "q").unwrap();
        assert_eq!(chunks_in_force(&conn, "2026-03-02").unwrap().len(), 1);
    }

    #[test]
    fn open_ended_lookup_finds_current_slice() {
        let conn = open_memory_database().unwrap();
        insert_chunk(&conn, &chunk("a", "2013-07-01", Some("2025-12-31"), true)).unwrap();
        insert_chunk(&conn, &chunk("b", "2026-01-01", None, true)).unwrap();

        let open = open_ended_chunk(&conn, "ZPDV", "38", None).unwrap().unwrap();
        assert_eq!(open.id, "b");
    }
}
