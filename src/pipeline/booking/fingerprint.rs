//! Booking fingerprint: a hash over the canonical, model-independent
//! core of a booking. Used for ingest deduplication and for checking
//! that a model swap reproduces the same deterministic outcome.
//!
//! Account suggestions come from the model and may legitimately change
//! between models, so the fingerprint covers per-currency totals rather
//! than per-account lines.

use serde_json::json;

use crate::canonical::canonical_hash;
use crate::models::Booking;
use crate::money::format_amount;

pub fn fingerprint(booking: &Booking) -> String {
    let balances: Vec<serde_json::Value> = booking
        .balance_by_currency()
        .iter()
        .map(|(currency, (debit, credit))| {
            json!({
                "currency": currency,
                "debit": format_amount(debit),
                "credit": format_amount(credit),
            })
        })
        .collect();

    let vat: Vec<serde_json::Value> = booking
        .vat_breakdown
        .iter()
        .map(|line| {
            json!({
                "rate": line.rate,
                "base": format_amount(&line.base),
                "amount": format_amount(&line.amount),
                "currency": line.currency,
            })
        })
        .collect();

    let core = json!({
        "client_id": booking.client_id,
        "source": booking.source,
        "doc_class": booking.doc_class.as_str(),
        "posting_date": booking.posting_date.map(|d| d.format("%Y-%m-%d").to_string()),
        "balances": balances,
        "vat": vat,
    });

    canonical_hash(&core)
}
