use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;

/// One L2 semantic rule row: what the office learned about how a
/// (client, supplier, document class, feature) combination gets booked.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryRuleRow {
    pub key_hash: String,
    pub client_id: String,
    pub supplier_id: Option<String>,
    pub doc_class: String,
    pub feature_hash: String,
    pub suggested_accounts: Vec<String>,
    pub vat_class: String,
    pub confidence: f64,
    pub hits: i64,
    pub half_life_days: f64,
    pub conflict: bool,
    pub created_from: Option<String>,
    pub created_at: String,
    pub last_used: String,
}

pub fn upsert_rule(conn: &Connection, rule: &MemoryRuleRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO memory_rules (key_hash, client_id, supplier_id, doc_class, feature_hash,
             suggested_accounts, vat_class, confidence, hits, half_life_days, conflict,
             created_from, created_at, last_used)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(key_hash) DO UPDATE SET
             suggested_accounts = excluded.suggested_accounts,
             vat_class = excluded.vat_class,
             confidence = excluded.confidence,
             hits = excluded.hits,
             conflict = excluded.conflict,
             last_used = excluded.last_used",
        params![
            rule.key_hash,
            rule.client_id,
            rule.supplier_id,
            rule.doc_class,
            rule.feature_hash,
            serde_json::to_string(&rule.suggested_accounts).expect("accounts serialize"),
            rule.vat_class,
            rule.confidence,
            rule.hits,
            rule.half_life_days,
            rule.conflict as i64,
            rule.created_from,
            rule.created_at,
            rule.last_used,
        ],
    )?;
    Ok(())
}

pub fn get_rule(conn: &Connection, key_hash: &str) -> Result<Option<MemoryRuleRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT key_hash, client_id, supplier_id, doc_class, feature_hash,
                    suggested_accounts, vat_class, confidence, hits, half_life_days,
                    conflict, created_from, created_at, last_used
             FROM memory_rules WHERE key_hash = ?1",
            params![key_hash],
            row_to_rule,
        )
        .optional()?;
    Ok(row)
}

/// All rules for a lookup key group (supplier optional).
pub fn rules_for(
    conn: &Connection,
    client_id: &str,
    supplier_id: Option<&str>,
    doc_class: &str,
) -> Result<Vec<MemoryRuleRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT key_hash, client_id, supplier_id, doc_class, feature_hash,
                suggested_accounts, vat_class, confidence, hits, half_life_days,
                conflict, created_from, created_at, last_used
         FROM memory_rules
         WHERE client_id = ?1 AND doc_class = ?2
           AND (?3 IS NULL OR supplier_id = ?3 OR supplier_id IS NULL)",
    )?;
    let rows = stmt
        .query_map(params![client_id, doc_class, supplier_id], row_to_rule)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRuleRow> {
    let accounts_raw: String = row.get(5)?;
    Ok(MemoryRuleRow {
        key_hash: row.get(0)?,
        client_id: row.get(1)?,
        supplier_id: row.get(2)?,
        doc_class: row.get(3)?,
        feature_hash: row.get(4)?,
        suggested_accounts: serde_json::from_str(&accounts_raw).unwrap_or_default(),
        vat_class: row.get(6)?,
        confidence: row.get(7)?,
        hits: row.get(8)?,
        half_life_days: row.get(9)?,
        conflict: row.get::<_, i64>(10)? != 0,
        created_from: row.get(11)?,
        created_at: row.get(12)?,
        last_used: row.get(13)?,
    })
}

// ── L1 episodes ─────────────────────────────────────────────

pub fn insert_episode(
    conn: &Connection,
    user_id: &str,
    session_id: &str,
    kind: &str,
    payload: &serde_json::Value,
) -> Result<Uuid, DatabaseError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO episodes (id, user_id, session_id, kind, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            user_id,
            session_id,
            kind,
            payload.to_string(),
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(id)
}

/// Count L1 episodes of one kind whose payload contains the given
/// (canonical) fragment. Used to decide when a correction pattern is
/// stable enough to become an L2 rule.
pub fn count_episodes_matching(
    conn: &Connection,
    kind: &str,
    payload_fragment: &str,
) -> Result<i64, DatabaseError> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM episodes WHERE kind = ?1 AND payload LIKE ?2",
        params![kind, format!("%{payload_fragment}%")],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(n)
}

pub fn prune_episodes(conn: &Connection, retention_days: i64) -> Result<usize, DatabaseError> {
    let n = conn.execute(
        "DELETE FROM episodes WHERE created_at < datetime('now', ?1)",
        params![format!("-{retention_days} days")],
    )?;
    Ok(n)
}

// ── L3 preference pairs ─────────────────────────────────────

pub fn insert_preference_pair(
    conn: &Connection,
    booking_id: &Uuid,
    prompt_context: &str,
    chosen: &str,
    rejected: &str,
) -> Result<Uuid, DatabaseError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO preference_pairs (id, booking_id, prompt_context, chosen, rejected, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            booking_id.to_string(),
            prompt_context,
            chosen,
            rejected,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(id)
}

/// Unexported pairs, oldest first, marking them exported.
pub fn drain_preference_pairs(
    conn: &Connection,
) -> Result<Vec<(String, String, String, String)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, prompt_context, chosen, rejected FROM preference_pairs
         WHERE exported_at IS NULL ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let now = chrono::Utc::now().to_rfc3339();
    for (id, _, _, _) in &rows {
        conn.execute(
            "UPDATE preference_pairs SET exported_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
    }
    Ok(rows)
}

// ── Supplier account history (fraud heuristic) ──────────────

/// Record a supplier IBAN sighting; returns true when this IBAN is new
/// for a supplier that already has a different one on file.
pub fn record_supplier_iban(
    conn: &Connection,
    supplier_id: &str,
    iban: &str,
) -> Result<bool, DatabaseError> {
    let known: i64 = conn.query_row(
        "SELECT COUNT(*) FROM supplier_accounts WHERE supplier_id = ?1",
        params![supplier_id],
        |row| row.get(0),
    )?;
    let this_one: i64 = conn.query_row(
        "SELECT COUNT(*) FROM supplier_accounts WHERE supplier_id = ?1 AND iban = ?2",
        params![supplier_id, iban],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO supplier_accounts (supplier_id, iban, first_seen)
         VALUES (?1, ?2, ?3)",
        params![supplier_id, iban, chrono::Utc::now().to_rfc3339()],
    )?;

    Ok(known > 0 && this_one == 0)
}
