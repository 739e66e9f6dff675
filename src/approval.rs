//! Approval gateway (C8): the operator-facing contracts.
//!
//! Every mutation runs under the per-booking lock, validates the state
//! machine, and commits together with its audit event. A correction
//! never edits a booking in place: it rejects the predecessor and
//! creates a successor pointing back via `corrected_from`.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::auth::AuthedUser;
use crate::db::repository::{self, BookingSummary};
use crate::memory;
use crate::models::{Booking, BookingStatus, CitationRef, Entry, VatLine};
use crate::pipeline::booking::blockers::Blocker;
use crate::pipeline::booking::{accounts, fingerprint, in_transaction, BookingPipeline, PipelineError};

/// Operator patch applied by `correct`. Absent fields stay as proposed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Entry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vat_breakdown: Option<Vec<VatLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<CitationRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posting_date: Option<NaiveDate>,
    /// Set when the operator overrides a failed rule check; the
    /// justification is recorded in the audit trail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_override_justification: Option<String>,
}

impl CorrectionPatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_none()
            && self.vat_breakdown.is_none()
            && self.narrative.is_none()
            && self.citations.is_none()
            && self.posting_date.is_none()
            && self.rule_override_justification.is_none()
    }
}

/// Monetary verification keys: the fields whose 1of3 consensus can
/// never be overridden.
fn is_monetary_field(name: &str) -> bool {
    matches!(name, "net" | "vat" | "gross")
        || name.starts_with("vat_") && (name.ends_with("_base") || name.ends_with("_amount"))
        || name.starts_with("tx_") && name.ends_with("_amount")
        || name.starts_with("total_")
}

fn monetary_one_of_three(verification: &serde_json::Value) -> Vec<String> {
    let Some(map) = verification.as_object() else {
        return vec![];
    };
    map.iter()
        .filter(|(name, consensus)| {
            is_monetary_field(name)
                && consensus.get("agreement").and_then(|a| a.as_str()) == Some("1of3")
        })
        .map(|(name, _)| name.clone())
        .collect()
}

pub fn list(
    pipeline: &BookingPipeline,
    status: Option<BookingStatus>,
    client: Option<&str>,
) -> Result<Vec<BookingSummary>, PipelineError> {
    let conn = pipeline.database().open()?;
    Ok(repository::list_bookings(&conn, status, client)?)
}

pub fn get(pipeline: &BookingPipeline, id: Uuid) -> Result<Booking, PipelineError> {
    let conn = pipeline.database().open()?;
    repository::get_booking(&conn, &id)?.ok_or(PipelineError::NotFound(id))
}

/// Approve a proposed booking. First acquirer of the booking lock wins;
/// a racing second operator observes `StateConflict`.
pub async fn approve(
    pipeline: &BookingPipeline,
    id: Uuid,
    actor: &AuthedUser,
) -> Result<BookingStatus, PipelineError> {
    if !actor.role.can_review() {
        return Err(PipelineError::Forbidden);
    }

    let lock = pipeline.lock_for(id).await;
    let _guard = lock.lock().await;

    let conn = pipeline.database().open()?;
    let mut booking =
        repository::get_booking(&conn, &id)?.ok_or(PipelineError::NotFound(id))?;
    if booking.status != BookingStatus::Proposed {
        // Both the loser of an approval race and an attempt on a
        // non-proposed booking land here; the audit records the attempt.
        audit::append(
            &conn,
            &actor.username,
            audit::kind::BOOKING_APPROVED,
            &id.to_string(),
            json!({ "outcome": "state_conflict", "current": booking.status.as_str() }),
        )?;
        return Err(PipelineError::StateConflict {
            current: booking.status,
        });
    }

    booking.approved_by = Some(actor.username.clone());
    pipeline.transition(
        &conn,
        &mut booking,
        BookingStatus::Approved,
        &actor.username,
        json!({ "outcome": "approved" }),
    )?;

    // A correction chain that ends in approval yields an L3 pair:
    // the approved booking against the machine proposal it replaced.
    if let Some(predecessor_id) = booking.corrected_from {
        if let Some(predecessor) = repository::get_booking(&conn, &predecessor_id)? {
            let context = format!(
                "client={} doc_class={} narrative={}",
                booking.client_id,
                booking.doc_class.as_str(),
                predecessor.narrative
            );
            memory::preference_pair(&conn, &booking, &predecessor, &context)?;
        }
    }

    Ok(booking.status)
}

pub async fn reject(
    pipeline: &BookingPipeline,
    id: Uuid,
    actor: &AuthedUser,
    reason: &str,
) -> Result<BookingStatus, PipelineError> {
    if !actor.role.can_review() {
        return Err(PipelineError::Forbidden);
    }
    if reason.trim().is_empty() {
        return Err(PipelineError::Validation("rejection requires a reason".into()));
    }

    let lock = pipeline.lock_for(id).await;
    let _guard = lock.lock().await;

    let conn = pipeline.database().open()?;
    let mut booking =
        repository::get_booking(&conn, &id)?.ok_or(PipelineError::NotFound(id))?;
    if !booking.status.allows(BookingStatus::Rejected) {
        return Err(PipelineError::StateConflict {
            current: booking.status,
        });
    }

    pipeline.transition(
        &conn,
        &mut booking,
        BookingStatus::Rejected,
        &actor.username,
        json!({ "reason": reason }),
    )?;
    audit::append(
        &conn,
        &actor.username,
        audit::kind::BOOKING_REJECTED,
        &id.to_string(),
        json!({ "reason": reason }),
    )?;

    Ok(booking.status)
}

/// Correct a proposed or review-pending booking. The predecessor moves
/// to `REJECTED`; a successor re-enters verification and lands on
/// `PROPOSED` or `NEEDS_REVIEW`. Returns the successor id.
pub async fn correct(
    pipeline: &BookingPipeline,
    id: Uuid,
    patch: CorrectionPatch,
    actor: &AuthedUser,
) -> Result<Uuid, PipelineError> {
    if !actor.role.can_review() {
        return Err(PipelineError::Forbidden);
    }
    if patch.is_empty() {
        return Err(PipelineError::Validation("empty correction patch".into()));
    }

    let lock = pipeline.lock_for(id).await;
    let _guard = lock.lock().await;

    let conn = pipeline.database().open()?;
    let predecessor =
        repository::get_booking(&conn, &id)?.ok_or(PipelineError::NotFound(id))?;
    if !matches!(
        predecessor.status,
        BookingStatus::Proposed | BookingStatus::NeedsReview
    ) {
        return Err(PipelineError::StateConflict {
            current: predecessor.status,
        });
    }

    // Build the successor.
    let mut successor = predecessor.clone();
    successor.id = Uuid::new_v4();
    successor.corrected_from = Some(predecessor.id);
    successor.proposed_by = format!("user:{}", actor.username);
    successor.approved_by = None;
    successor.created_at = Utc::now().to_rfc3339();
    successor.finalized_at = None;
    successor.status = BookingStatus::Corrected;

    let amounts_patched = patch.entries.is_some();
    if let Some(entries) = patch.entries {
        successor.entries = entries;
    }
    if let Some(vat) = patch.vat_breakdown {
        successor.vat_breakdown = vat;
    }
    if let Some(narrative) = patch.narrative {
        successor.narrative = narrative;
    }
    if let Some(citations) = patch.citations {
        successor.citations = citations;
    }
    if let Some(date) = patch.posting_date {
        successor.posting_date = Some(date);
    }

    for entry in &successor.entries {
        if !accounts::is_known_account(&entry.account) {
            return Err(PipelineError::Validation(format!(
                "unknown account {}",
                entry.account
            )));
        }
    }

    // Re-verification of the correction.
    let mut blockers: Vec<String> = Vec::new();
    for (currency, (debit, credit)) in successor.balance_by_currency() {
        if debit != credit {
            blockers.push(Blocker::UnbalancedLedger { currency }.code());
        }
    }
    let cash_total: rust_decimal::Decimal = successor
        .entries
        .iter()
        .filter(|e| e.account == accounts::CASH && e.currency == pipeline.config().home_currency)
        .map(|e| e.amount)
        .sum();
    if cash_total >= pipeline.config().aml_cash_threshold
        && patch.rule_override_justification.is_none()
    {
        blockers.push(
            Blocker::AmlCashThreshold {
                amount: crate::money::format_amount(&cash_total),
            }
            .code(),
        );
    }
    // Operator-entered amounts supersede the machine reading; a
    // monetary field stuck at 1of3 blocks unless the patch replaced
    // the amounts outright. A rule override never clears this.
    if !amounts_patched {
        for field in monetary_one_of_three(&successor.verification) {
            blockers.push(Blocker::FieldConsensus { field }.code());
        }
    }

    successor.blockers = blockers.clone();
    successor.fingerprint = fingerprint::fingerprint(&successor);

    let next = if blockers.is_empty() {
        BookingStatus::Proposed
    } else {
        BookingStatus::NeedsReview
    };

    let mut predecessor = predecessor;
    in_transaction(&conn, || {
        repository::insert_booking(&conn, &successor)?;
        audit::append(
            &conn,
            &actor.username,
            audit::kind::BOOKING_CORRECTED,
            &successor.id.to_string(),
            json!({
                "corrected_from": predecessor.id.to_string(),
                "amounts_patched": amounts_patched,
            }),
        )?;
        if let Some(justification) = &patch.rule_override_justification {
            audit::append(
                &conn,
                &actor.username,
                audit::kind::BOOKING_OVERRIDE,
                &successor.id.to_string(),
                json!({ "justification": justification }),
            )?;
        }
        Ok(())
    })?;

    // Predecessor is rejected by the correction; successor advances.
    pipeline.transition(
        &conn,
        &mut predecessor,
        BookingStatus::Rejected,
        &actor.username,
        json!({ "superseded_by": successor.id.to_string() }),
    )?;
    let mut successor_mut = successor;
    pipeline.transition(
        &conn,
        &mut successor_mut,
        next,
        &actor.username,
        json!({ "blockers": blockers }),
    )?;

    // The correction feeds L2: a stable pattern becomes a rule.
    let corrected_accounts: Vec<String> = successor_mut
        .entries
        .iter()
        .filter(|e| e.account.starts_with('4') || e.account.starts_with('6'))
        .map(|e| e.account.clone())
        .collect();
    if !corrected_accounts.is_empty() {
        let vat_class = successor_mut
            .vat_breakdown
            .first()
            .map(|l| l.rate.to_string())
            .unwrap_or_else(|| "25".to_string());
        let features = memory::features_from_narrative(&predecessor.narrative);
        let feature_hash = memory::feature_hash(&features);
        let key = memory::RuleKey {
            client_id: &successor_mut.client_id,
            supplier_id: None,
            doc_class: successor_mut.doc_class,
            feature_hash: &feature_hash,
        };
        memory::record_correction(
            &conn,
            &actor.username,
            &key,
            &corrected_accounts,
            &vat_class,
            &predecessor,
            pipeline.config().l2_half_life_days.account_mapping,
            Utc::now(),
        )?;
    }

    Ok(successor_mut.id)
}
