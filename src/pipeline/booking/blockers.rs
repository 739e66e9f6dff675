//! Blockers: conditions that forbid auto-advance to `PROPOSED`.
//! Every blocker is resolvable only by an operator action.

use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::accounts;
use crate::config::Config;
use crate::db::repository;
use crate::memory::ScoredRule;
use crate::models::Booking;
use crate::pipeline::extraction::field;
use crate::pipeline::verify::{Agreement, VerifiedDoc};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Blocker {
    /// Some field reached no consensus majority.
    FieldConsensus { field: String },
    /// Debits and credits differ.
    UnbalancedLedger { currency: String },
    /// Cash transaction at or above the AML threshold.
    AmlCashThreshold { amount: String },
    /// Supplier bank account changed from the memorized one.
    SupplierIbanChanged { supplier_id: String, iban: String },
    /// The model's proposal contradicts a live L2 rule.
    MemoryRuleConflict { rule_key: String, suggested: String },
    /// Cross-currency booking without a usable FX rate.
    MissingFxRate { currency: String, date: String },
    /// Possible duplicate payment to the same supplier.
    DuplicatePayment { prior_booking: String },
}

impl Blocker {
    /// Stable code stored on the booking and shown to operators.
    pub fn code(&self) -> String {
        match self {
            Self::FieldConsensus { field } => format!("field_consensus:{field}"),
            Self::UnbalancedLedger { currency } => format!("unbalanced_ledger:{currency}"),
            Self::AmlCashThreshold { amount } => format!("aml_cash_threshold:{amount}"),
            Self::SupplierIbanChanged { supplier_id, .. } => {
                format!("supplier_iban_changed:{supplier_id}")
            }
            Self::MemoryRuleConflict { rule_key, .. } => format!("memory_rule_conflict:{rule_key}"),
            Self::MissingFxRate { currency, date } => format!("missing_fx_rate:{currency}:{date}"),
            Self::DuplicatePayment { prior_booking } => format!("duplicate_payment:{prior_booking}"),
        }
    }
}

/// Evaluate every blocker for a constructed booking.
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    conn: &Connection,
    config: &Config,
    booking: &Booking,
    verified: &VerifiedDoc,
    l2_rules: &[ScoredRule],
    model_account: Option<&str>,
    fx_rate_found: bool,
) -> Vec<Blocker> {
    let mut blockers = Vec::new();

    // 1of3 consensus anywhere.
    for (name, consensus) in &verified.verification {
        if matches!(consensus.agreement, Agreement::OneOfThree | Agreement::None) {
            blockers.push(Blocker::FieldConsensus { field: name.clone() });
        }
    }

    // Ledger invariant.
    for (currency, (debit, credit)) in booking.balance_by_currency() {
        if debit != credit {
            blockers.push(Blocker::UnbalancedLedger { currency });
        }
    }

    // AML: cash-account entries at or above the configured threshold.
    let cash_total: Decimal = booking
        .entries
        .iter()
        .filter(|e| e.account == accounts::CASH && e.currency == config.home_currency)
        .map(|e| e.amount)
        .sum();
    if cash_total >= config.aml_cash_threshold {
        blockers.push(Blocker::AmlCashThreshold {
            amount: crate::money::format_amount(&cash_total),
        });
    }

    // Supplier IBAN change heuristic.
    let supplier_id = verified
        .doc
        .field(field::SUPPLIER_OIB)
        .or_else(|| verified.doc.field(field::SUPPLIER_VAT_ID))
        .and_then(|fv| fv.value.as_text().map(String::from));
    let iban = verified
        .doc
        .field(field::SUPPLIER_IBAN)
        .and_then(|fv| fv.value.as_text().map(String::from));
    if let (Some(supplier_id), Some(iban)) = (&supplier_id, &iban) {
        match repository::record_supplier_iban(conn, supplier_id, iban) {
            Ok(true) => blockers.push(Blocker::SupplierIbanChanged {
                supplier_id: supplier_id.clone(),
                iban: iban.clone(),
            }),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Supplier IBAN history unavailable");
            }
        }
    }

    // Model vs live L2 rule.
    if let Some(model_account) = model_account {
        for scored in l2_rules {
            if !scored.rule.suggested_accounts.is_empty()
                && !scored
                    .rule
                    .suggested_accounts
                    .iter()
                    .any(|a| a == model_account)
            {
                blockers.push(Blocker::MemoryRuleConflict {
                    rule_key: scored.rule.key_hash.clone(),
                    suggested: model_account.to_string(),
                });
                break;
            }
        }
    }

    // FX rate availability for cross-currency bookings.
    if !fx_rate_found {
        if let Some(date) = booking.posting_date {
            let foreign: Vec<&str> = booking
                .entries
                .iter()
                .map(|e| e.currency.as_str())
                .filter(|c| *c != config.home_currency)
                .collect();
            if let Some(currency) = foreign.first() {
                blockers.push(Blocker::MissingFxRate {
                    currency: currency.to_string(),
                    date: date.format("%Y-%m-%d").to_string(),
                });
            }
        }
    }

    // Duplicate payment: a live booking for the same supplier with the
    // same gross within a week.
    if let (Some(supplier_id), Some(date)) = (&supplier_id, booking.posting_date) {
        if let Some((gross, _)) = verified.doc.money(field::GROSS) {
            match find_recent_same_amount(conn, &booking.client_id, supplier_id, gross, date, &booking.id.to_string()) {
                Ok(Some(prior)) => blockers.push(Blocker::DuplicatePayment { prior_booking: prior }),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Duplicate-payment check unavailable"),
            }
        }
    }

    blockers
}

fn find_recent_same_amount(
    conn: &Connection,
    client_id: &str,
    supplier_id: &str,
    gross: &Decimal,
    date: chrono::NaiveDate,
    exclude_id: &str,
) -> Result<Option<String>, crate::db::DatabaseError> {
    use rusqlite::OptionalExtension;
    let window_start = (date - chrono::Duration::days(7)).format("%Y-%m-%d").to_string();
    let window_end = (date + chrono::Duration::days(7)).format("%Y-%m-%d").to_string();
    // The supplier id rides in the verification JSON; match on it plus
    // an identical credit total.
    let row = conn
        .query_row(
            "SELECT id FROM bookings
             WHERE client_id = ?1 AND id != ?2
               AND status NOT IN ('rejected', 'blocked')
               AND posting_date BETWEEN ?3 AND ?4
               AND verification LIKE ?5
               AND entries LIKE ?6
             LIMIT 1",
            rusqlite::params![
                client_id,
                exclude_id,
                window_start,
                window_end,
                format!("%{supplier_id}%"),
                format!("%\"{}\"%", crate::money::format_amount(gross)),
            ],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(row)
}
