//! Append-only, hash-chained audit log.
//!
//! Every event links to its predecessor: `hash = H(prev_hash ||
//! canonical(envelope))` where the envelope covers seq, timestamp, actor,
//! kind, subject and payload. The sequence is dense, so both removal and
//! mutation of any row are detectable by `verify`. Appends happen inside
//! the same SQLite transaction as the state change they record.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::canonical::{canonical_hash, canonical_json, hex_encode};
use crate::db::DatabaseError;

/// Hash of "nothing": the chain anchor before the first event.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit chain broken at seq {seq}: {reason}")]
    IntegrityViolation { seq: i64, reason: String },
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Event kinds, named by what happened.
pub mod kind {
    pub const AUTH_LOGIN: &str = "auth.login";
    pub const AUTH_FAILED: &str = "auth.failed";
    pub const AUTH_LOCKOUT: &str = "auth.lockout";
    pub const DOCUMENT_INGESTED: &str = "document.ingested";
    pub const BOOKING_TRANSITION: &str = "booking.transition";
    pub const BOOKING_APPROVED: &str = "booking.approved";
    pub const BOOKING_REJECTED: &str = "booking.rejected";
    pub const BOOKING_CORRECTED: &str = "booking.corrected";
    pub const BOOKING_OVERRIDE: &str = "booking.rule_override";
    pub const EXPORT_RECEIPT: &str = "export.receipt";
    pub const EXPORT_FAILED: &str = "export.failed";
    pub const MEMORY_RULE_CREATED: &str = "memory.rule_created";
    pub const MEMORY_RULE_CONFLICT: &str = "memory.rule_conflict";
    pub const CORPUS_INGESTED: &str = "corpus.ingested";
    pub const CORPUS_CONFIRMED: &str = "corpus.confirmed";
    pub const CORPUS_SUPERSEDED: &str = "corpus.superseded";
    pub const MODEL_SWAP: &str = "model.swap";
    pub const SAFETY_REFUSAL: &str = "safety.refusal";
    pub const PIPELINE_FAILURE: &str = "pipeline.failure";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: i64,
    pub timestamp: String,
    pub actor: String,
    pub kind: String,
    pub subject_id: String,
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub prev_hash: String,
    pub hash: String,
}

/// Append an event to the chain. Must run on the connection (and inside
/// the transaction, when there is one) of the state change it records.
///
/// Appends outside a transaction can race another writer to the next
/// sequence number; the losing insert hits the primary key and is
/// retried against the new chain head.
pub fn append(
    conn: &Connection,
    actor: &str,
    event_kind: &str,
    subject_id: &str,
    payload: serde_json::Value,
) -> Result<AuditEvent, AuditError> {
    let payload_hash = canonical_hash(&payload);

    let mut last_error = None;
    for _ in 0..3 {
        let (prev_seq, prev_hash) = last_link(conn)?;
        let seq = prev_seq + 1;
        let timestamp = chrono::Utc::now().to_rfc3339();
        let hash =
            chain_hash(&prev_hash, seq, &timestamp, actor, event_kind, subject_id, &payload);

        let inserted = conn.execute(
            "INSERT INTO audit_log (seq, timestamp, actor, kind, subject_id, payload, payload_hash, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                seq,
                timestamp,
                actor,
                event_kind,
                subject_id,
                payload.to_string(),
                payload_hash,
                prev_hash,
                hash
            ],
        );

        match inserted {
            Ok(_) => {
                return Ok(AuditEvent {
                    seq,
                    timestamp,
                    actor: actor.to_string(),
                    kind: event_kind.to_string(),
                    subject_id: subject_id.to_string(),
                    payload,
                    payload_hash,
                    prev_hash,
                    hash,
                })
            }
            Err(rusqlite::Error::SqliteFailure(e, detail))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                last_error = Some(rusqlite::Error::SqliteFailure(e, detail));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(last_error.expect("loop ran").into())
}

/// Verify the chain over `[from, to]` (entire log when `None`).
/// Returns the number of events verified.
pub fn verify(conn: &Connection, range: Option<(i64, i64)>) -> Result<u64, AuditError> {
    let (from, to) = match range {
        Some(r) => r,
        None => (1, i64::MAX),
    };

    let mut stmt = conn.prepare(
        "SELECT seq, timestamp, actor, kind, subject_id, payload, payload_hash, prev_hash, hash
         FROM audit_log WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![from, to], row_to_event)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut verified = 0u64;
    let mut expected_seq = from;
    let mut expected_prev: Option<String> = if from == 1 {
        Some(GENESIS_HASH.to_string())
    } else {
        // Mid-chain start: trust the stored prev_hash of the first row,
        // everything after is fully checked.
        None
    };

    for event in rows {
        if event.seq != expected_seq {
            return Err(AuditError::IntegrityViolation {
                seq: expected_seq,
                reason: format!("sequence gap: expected {expected_seq}, found {}", event.seq),
            });
        }

        if let Some(prev) = &expected_prev {
            if &event.prev_hash != prev {
                return Err(AuditError::IntegrityViolation {
                    seq: event.seq,
                    reason: "prev_hash does not match predecessor".into(),
                });
            }
        }

        if canonical_hash(&event.payload) != event.payload_hash {
            return Err(AuditError::IntegrityViolation {
                seq: event.seq,
                reason: "payload hash mismatch".into(),
            });
        }

        let recomputed = chain_hash(
            &event.prev_hash,
            event.seq,
            &event.timestamp,
            &event.actor,
            &event.kind,
            &event.subject_id,
            &event.payload,
        );
        if recomputed != event.hash {
            return Err(AuditError::IntegrityViolation {
                seq: event.seq,
                reason: "chain hash mismatch".into(),
            });
        }

        expected_prev = Some(event.hash.clone());
        expected_seq += 1;
        verified += 1;
    }

    Ok(verified)
}

/// Events in a sequence range, ascending.
pub fn query_range(
    conn: &Connection,
    from: i64,
    to: i64,
) -> Result<Vec<AuditEvent>, AuditError> {
    let mut stmt = conn.prepare(
        "SELECT seq, timestamp, actor, kind, subject_id, payload, payload_hash, prev_hash, hash
         FROM audit_log WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![from, to], row_to_event)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn last_link(conn: &Connection) -> Result<(i64, String), AuditError> {
    let row = conn
        .query_row(
            "SELECT seq, hash FROM audit_log ORDER BY seq DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row.unwrap_or((0, GENESIS_HASH.to_string())))
}

fn chain_hash(
    prev_hash: &str,
    seq: i64,
    timestamp: &str,
    actor: &str,
    kind: &str,
    subject_id: &str,
    payload: &serde_json::Value,
) -> String {
    let envelope = json!({
        "seq": seq,
        "timestamp": timestamp,
        "actor": actor,
        "kind": kind,
        "subject_id": subject_id,
        "payload": payload,
    });
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_json(&envelope).as_bytes());
    hex_encode(&hasher.finalize())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let payload_raw: String = row.get(5)?;
    let payload = serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null);
    Ok(AuditEvent {
        seq: row.get(0)?,
        timestamp: row.get(1)?,
        actor: row.get(2)?,
        kind: row.get(3)?,
        subject_id: row.get(4)?,
        payload,
        payload_hash: row.get(6)?,
        prev_hash: row.get(7)?,
        hash: row.get(8)?,
    })
}
