//! Learning memory.
//!
//! L0 lives in request state and is not persisted. This module covers:
//! - L1: episodic journal with bounded retention,
//! - L2: durable semantic rules (client/supplier → accounts, VAT class)
//!   with half-life decay,
//! - L3: preference pairs consumed by the external fine-tuner.
//!
//! L2 keys are content-addressed over (client, supplier, doc class,
//! feature hash, correction value), so a model swap cannot invalidate
//! them and concurring corrections always strengthen the same row.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::audit;
use crate::canonical::{canonical_json, hex_encode};
use crate::db::repository::{self, MemoryRuleRow};
use crate::db::DatabaseError;
use crate::models::{Booking, DocClass};

/// Decayed score below which a rule is no longer offered.
pub const LIVE_SCORE_FLOOR: f64 = 0.2;

/// Concurring corrections required before a pattern becomes a rule.
const REINFORCE_THRESHOLD: i64 = 2;

/// Half-life defaults by rule kind (days). Account mappings are stable,
/// client preferences churn.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HalfLifeDefaults {
    pub account_mapping: f64,
    pub vat_class: f64,
    pub client_preference: f64,
}

impl Default for HalfLifeDefaults {
    fn default() -> Self {
        Self {
            account_mapping: 365.0,
            vat_class: 180.0,
            client_preference: 90.0,
        }
    }
}

/// L2 lookup key before hashing.
#[derive(Debug, Clone)]
pub struct RuleKey<'a> {
    pub client_id: &'a str,
    pub supplier_id: Option<&'a str>,
    pub doc_class: DocClass,
    pub feature_hash: &'a str,
}

/// Derive rule-key features from a booking narrative. Both the pipeline
/// (at suggestion time) and the gateway (at correction time) go through
/// this, so a learned rule and a later lookup always agree on the key.
pub fn features_from_narrative(narrative: &str) -> Vec<String> {
    narrative
        .split_whitespace()
        .take(6)
        .map(String::from)
        .collect()
}

/// Hash free-text document features (description tokens, say) into the
/// feature component of the rule key.
pub fn feature_hash(features: &[String]) -> String {
    let mut normalized: Vec<String> = features
        .iter()
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    hex_encode(&Sha256::digest(normalized.join("\n").as_bytes()))[..16].to_string()
}

fn rule_row_key(key: &RuleKey<'_>, accounts: &[String], vat_class: &str) -> String {
    let value = json!({
        "client": key.client_id,
        "supplier": key.supplier_id,
        "doc_class": key.doc_class.as_str(),
        "features": key.feature_hash,
        "accounts": accounts,
        "vat_class": vat_class,
    });
    hex_encode(&Sha256::digest(canonical_json(&value).as_bytes()))
}

/// A rule with its decayed score at lookup time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredRule {
    pub rule: MemoryRuleRow,
    pub score: f64,
}

/// Decayed score: `confidence * 0.5^(age_days / half_life)`.
fn decayed_score(rule: &MemoryRuleRow, now: DateTime<Utc>) -> f64 {
    let last_used = DateTime::parse_from_rfc3339(&rule.last_used)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);
    let age_days = (now - last_used).num_seconds().max(0) as f64 / 86_400.0;
    rule.confidence * 0.5_f64.powf(age_days / rule.half_life_days.max(1.0))
}

/// Live L2 rules for a key, strongest first.
pub fn suggest(
    conn: &Connection,
    key: &RuleKey<'_>,
    now: DateTime<Utc>,
) -> Result<Vec<ScoredRule>, DatabaseError> {
    let rows = repository::rules_for(
        conn,
        key.client_id,
        key.supplier_id,
        key.doc_class.as_str(),
    )?;

    let mut scored: Vec<ScoredRule> = rows
        .into_iter()
        .filter(|r| r.feature_hash == key.feature_hash || r.feature_hash.is_empty())
        .map(|rule| {
            let score = decayed_score(&rule, now);
            ScoredRule { rule, score }
        })
        .filter(|s| s.score > LIVE_SCORE_FLOOR)
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored)
}

/// Append an L1 episode.
pub fn journal(
    conn: &Connection,
    user_id: &str,
    session_id: &str,
    kind: &str,
    payload: serde_json::Value,
) -> Result<Uuid, DatabaseError> {
    repository::insert_episode(conn, user_id, session_id, kind, &payload)
}

/// Remove L1 episodes past retention. Called by the nightly task.
pub fn prune_l1(conn: &Connection, retention_days: i64) -> Result<usize, DatabaseError> {
    repository::prune_episodes(conn, retention_days)
}

/// Record an operator correction and, when the same correction has
/// concurred often enough, create or reinforce an L2 rule.
///
/// Reinforcement is monotonic: identical (key, correction) only
/// strengthens. A contradicting correction creates a second rule and
/// marks both with a conflict annotation instead of overwriting.
pub fn record_correction(
    conn: &Connection,
    actor: &str,
    key: &RuleKey<'_>,
    corrected_accounts: &[String],
    corrected_vat_class: &str,
    from_booking: &Booking,
    half_life_days: f64,
    now: DateTime<Utc>,
) -> Result<Option<MemoryRuleRow>, DatabaseError> {
    let row_key = rule_row_key(key, corrected_accounts, corrected_vat_class);

    // L1 first: the journal is what makes the pattern countable.
    let episode_payload = json!({
        "rule_key": row_key,
        "booking": from_booking.id.to_string(),
        "accounts": corrected_accounts,
        "vat_class": corrected_vat_class,
    });
    repository::insert_episode(conn, actor, "-", "correction", &episode_payload)?;

    // Existing rule for the exact same correction → reinforce.
    if let Some(mut rule) = repository::get_rule(conn, &row_key)? {
        rule.hits += 1;
        rule.confidence = (rule.confidence + 0.1).min(1.0);
        rule.last_used = now.to_rfc3339();
        repository::upsert_rule(conn, &rule)?;
        tracing::debug!(rule = %row_key, hits = rule.hits, "L2 rule reinforced");
        return Ok(Some(rule));
    }

    let concurring = repository::count_episodes_matching(
        conn,
        "correction",
        &format!("\"rule_key\":\"{row_key}\""),
    )?;
    if concurring < REINFORCE_THRESHOLD {
        return Ok(None);
    }

    // A different correction already learned for the same key group?
    let siblings = repository::rules_for(
        conn,
        key.client_id,
        key.supplier_id,
        key.doc_class.as_str(),
    )?;
    let mut conflict = false;
    for mut sibling in siblings
        .into_iter()
        .filter(|s| s.feature_hash == key.feature_hash && s.key_hash != row_key)
    {
        conflict = true;
        if !sibling.conflict {
            sibling.conflict = true;
            repository::upsert_rule(conn, &sibling)?;
            audit::append(
                conn,
                actor,
                audit::kind::MEMORY_RULE_CONFLICT,
                &sibling.key_hash,
                json!({ "contradicted_by": row_key }),
            )
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;
        }
    }

    let rule = MemoryRuleRow {
        key_hash: row_key.clone(),
        client_id: key.client_id.to_string(),
        supplier_id: key.supplier_id.map(String::from),
        doc_class: key.doc_class.as_str().to_string(),
        feature_hash: key.feature_hash.to_string(),
        suggested_accounts: corrected_accounts.to_vec(),
        vat_class: corrected_vat_class.to_string(),
        confidence: 0.8,
        hits: concurring,
        half_life_days,
        conflict,
        created_from: Some(from_booking.id.to_string()),
        created_at: now.to_rfc3339(),
        last_used: now.to_rfc3339(),
    };
    repository::upsert_rule(conn, &rule)?;
    audit::append(
        conn,
        actor,
        audit::kind::MEMORY_RULE_CREATED,
        &row_key,
        json!({
            "accounts": corrected_accounts,
            "vat_class": corrected_vat_class,
            "conflict": conflict,
        }),
    )
    .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;

    tracing::info!(rule = %row_key, conflict, "L2 rule created from correction pattern");
    Ok(Some(rule))
}

/// Store an L3 preference pair: the approved booking as `chosen`, the
/// machine proposal it replaced as `rejected`. Canonical JSON on both
/// sides keeps the dataset model-agnostic.
pub fn preference_pair(
    conn: &Connection,
    approved: &Booking,
    proposed: &Booking,
    prompt_context: &str,
) -> Result<Uuid, DatabaseError> {
    let chosen = canonical_json(&serde_json::to_value(approved).expect("booking serialize"));
    let rejected = canonical_json(&serde_json::to_value(proposed).expect("booking serialize"));
    repository::insert_preference_pair(conn, &approved.id, prompt_context, &chosen, &rejected)
}

/// Drain unexported L3 pairs into JSONL for the external fine-tuner.
pub fn export_preference_dataset(conn: &Connection) -> Result<String, DatabaseError> {
    let pairs = repository::drain_preference_pairs(conn)?;
    let mut out = String::new();
    for (_, prompt, chosen, rejected) in pairs {
        let line = json!({
            "prompt": prompt,
            "chosen": chosen,
            "rejected": rejected,
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::models::{BookingStatus, Entry};
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn booking() -> Booking {
        Booking {
            id: Uuid::new_v4(),
            client_id: "K1".into(),
            source: None,
            doc_class: DocClass::InvoiceIn,
            entries: vec![
                Entry::debit("4000", dec("100.00"), "EUR"),
                Entry::credit("2200", dec("100.00"), "EUR"),
            ],
            vat_breakdown: vec![],
            posting_date: None,
            narrative: String::new(),
            citations: vec![],
            status: BookingStatus::Corrected,
            proposed_by: "pipeline".into(),
            approved_by: None,
            corrected_from: None,
            created_at: Utc::now().to_rfc3339(),
            finalized_at: None,
            fingerprint: "fp".into(),
            verification: json!({}),
            blockers: vec![],
        }
    }

    fn key<'a>(fh: &'a str) -> RuleKey<'a> {
        RuleKey {
            client_id: "K1",
            supplier_id: Some("12345678903"),
            doc_class: DocClass::InvoiceIn,
            feature_hash: fh,
        }
    }

    #[test]
    fn single_correction_does_not_create_rule() {
        let conn = open_memory_database().unwrap();
        let fh = feature_hash(&["uredski materijal".into()]);
        let created = record_correction(
            &conn,
            "ana",
            &key(&fh),
            &["4100".into()],
            "25",
            &booking(),
            365.0,
            Utc::now(),
        )
        .unwrap();
        assert!(created.is_none());
    }

    #[test]
    fn second_concurring_correction_creates_rule() {
        let conn = open_memory_database().unwrap();
        let fh = feature_hash(&["uredski materijal".into()]);
        let now = Utc::now();

        record_correction(&conn, "ana", &key(&fh), &["4100".into()], "25", &booking(), 365.0, now)
            .unwrap();
        let created = record_correction(
            &conn,
            "ivan",
            &key(&fh),
            &["4100".into()],
            "25",
            &booking(),
            365.0,
            now,
        )
        .unwrap()
        .expect("rule created at threshold");

        assert_eq!(created.suggested_accounts, vec!["4100"]);
        assert!(!created.conflict);

        let suggestions = suggest(&conn, &key(&fh), now).unwrap();
        assert_eq!(suggestions.len(), 1);
        assert!(suggestions[0].score > 0.5);
    }

    #[test]
    fn reinforcement_is_monotonic() {
        let conn = open_memory_database().unwrap();
        let fh = feature_hash(&["prijevoz".into()]);
        let now = Utc::now();

        for _ in 0..2 {
            record_correction(&conn, "ana", &key(&fh), &["4300".into()], "25", &booking(), 365.0, now)
                .unwrap();
        }
        let before = suggest(&conn, &key(&fh), now).unwrap()[0].clone();

        record_correction(&conn, "ana", &key(&fh), &["4300".into()], "25", &booking(), 365.0, now)
            .unwrap();
        let after = suggest(&conn, &key(&fh), now).unwrap()[0].clone();

        assert!(after.rule.hits > before.rule.hits);
        assert!(after.score >= before.score);
    }

    #[test]
    fn contradiction_splits_and_flags_conflict() {
        let conn = open_memory_database().unwrap();
        let fh = feature_hash(&["telefon".into()]);
        let now = Utc::now();

        for _ in 0..2 {
            record_correction(&conn, "ana", &key(&fh), &["4100".into()], "25", &booking(), 365.0, now)
                .unwrap();
        }
        for _ in 0..2 {
            record_correction(&conn, "ivan", &key(&fh), &["4300".into()], "25", &booking(), 365.0, now)
                .unwrap();
        }

        let suggestions = suggest(&conn, &key(&fh), now).unwrap();
        assert_eq!(suggestions.len(), 2, "conflicting corrections split into two rules");
        assert!(suggestions.iter().all(|s| s.rule.conflict));
    }

    #[test]
    fn decay_halves_score_at_half_life() {
        let conn = open_memory_database().unwrap();
        let fh = feature_hash(&["najam".into()]);
        let start = Utc::now();

        for _ in 0..2 {
            record_correction(&conn, "ana", &key(&fh), &["4200".into()], "25", &booking(), 90.0, start)
                .unwrap();
        }

        let fresh = suggest(&conn, &key(&fh), start).unwrap()[0].score;
        let aged = suggest(&conn, &key(&fh), start + chrono::Duration::days(90)).unwrap()[0].score;
        assert!((aged - fresh / 2.0).abs() < 0.01);
    }

    #[test]
    fn dead_rules_filtered_out() {
        let conn = open_memory_database().unwrap();
        let fh = feature_hash(&["stari obrazac".into()]);
        let start = Utc::now();

        for _ in 0..2 {
            record_correction(&conn, "ana", &key(&fh), &["4400".into()], "25", &booking(), 30.0, start)
                .unwrap();
        }

        // Several half-lives later the rule has decayed below the floor.
        let much_later = start + chrono::Duration::days(300);
        assert!(suggest(&conn, &key(&fh), much_later).unwrap().is_empty());
    }

    #[test]
    fn preference_pairs_round_trip_to_jsonl() {
        let conn = open_memory_database().unwrap();
        let approved = booking();
        let proposed = booking();
        preference_pair(&conn, &approved, &proposed, "invoice K1 supplier X").unwrap();

        let jsonl = export_preference_dataset(&conn).unwrap();
        assert_eq!(jsonl.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["prompt"], "invoice K1 supplier X");

        // Drained: second export is empty.
        assert!(export_preference_dataset(&conn).unwrap().is_empty());
    }

    #[test]
    fn feature_hash_is_order_insensitive() {
        let a = feature_hash(&["Uredski".into(), "materijal".into()]);
        let b = feature_hash(&["materijal".into(), "uredski".into()]);
        assert_eq!(a, b);
    }
}
