//! The booking record: a proposed or finalized double-entry posting.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::citation::CitationRef;
use super::enums::DocClass;

/// Debit or credit side of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Debit,
    Credit,
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub account: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
}

impl Entry {
    pub fn debit(account: &str, amount: Decimal, currency: &str) -> Self {
        Self {
            account: account.into(),
            side: Side::Debit,
            amount,
            currency: currency.into(),
        }
    }

    pub fn credit(account: &str, amount: Decimal, currency: &str) -> Self {
        Self {
            account: account.into(),
            side: Side::Credit,
            amount,
            currency: currency.into(),
        }
    }
}

/// One VAT block (multi-rate invoices carry several).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatLine {
    pub rate: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub base: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
}

/// Booking lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Ingested,
    Extracted,
    Verified,
    Proposed,
    NeedsReview,
    Corrected,
    Approved,
    Rejected,
    Exported,
    Blocked,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "ingested",
            Self::Extracted => "extracted",
            Self::Verified => "verified",
            Self::Proposed => "proposed",
            Self::NeedsReview => "needs_review",
            Self::Corrected => "corrected",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Exported => "exported",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingested" => Some(Self::Ingested),
            "extracted" => Some(Self::Extracted),
            "verified" => Some(Self::Verified),
            "proposed" => Some(Self::Proposed),
            "needs_review" => Some(Self::NeedsReview),
            "corrected" => Some(Self::Corrected),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "exported" => Some(Self::Exported),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Terminal states are immutable; corrections spawn a new booking.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exported | Self::Rejected | Self::Blocked)
    }

    /// Whether `self → to` is a legal transition.
    pub fn allows(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        // Any pre-terminal state may be force-blocked on a safety violation.
        if to == Blocked && !self.is_terminal() {
            return true;
        }
        matches!(
            (self, to),
            (Ingested, Extracted)
                | (Extracted, Verified)
                | (Verified, Proposed)
                | (Verified, NeedsReview)
                | (Proposed, Approved)
                | (Proposed, Rejected)
                | (Proposed, Corrected)
                | (NeedsReview, Corrected)
                | (NeedsReview, Rejected)
                | (Corrected, Proposed)
                | (Corrected, NeedsReview)
                | (Approved, Exported)
        )
    }
}

/// A booking: balanced ledger lines plus provenance, verification and
/// approval metadata. Fields explicitly not stored here (raw extracted
/// document) live with the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub client_id: String,
    /// Content hash of the source blob; `None` for manual bookings.
    pub source: Option<String>,
    pub doc_class: DocClass,
    pub entries: Vec<Entry>,
    pub vat_breakdown: Vec<VatLine>,
    pub posting_date: Option<NaiveDate>,
    pub narrative: String,
    pub citations: Vec<CitationRef>,
    pub status: BookingStatus,
    pub proposed_by: String,
    pub approved_by: Option<String>,
    pub corrected_from: Option<Uuid>,
    pub created_at: String,
    pub finalized_at: Option<String>,
    pub fingerprint: String,
    /// Per-field consensus, serialized alongside the booking so the
    /// approval UI can show warnings without re-running verification.
    pub verification: serde_json::Value,
    pub blockers: Vec<String>,
}

impl Booking {
    /// Per-currency sums of debits and credits, exact decimal arithmetic.
    pub fn balance_by_currency(&self) -> BTreeMap<String, (Decimal, Decimal)> {
        let mut sums: BTreeMap<String, (Decimal, Decimal)> = BTreeMap::new();
        for entry in &self.entries {
            let slot = sums.entry(entry.currency.clone()).or_default();
            match entry.side {
                Side::Debit => slot.0 += entry.amount,
                Side::Credit => slot.1 += entry.amount,
            }
        }
        sums
    }

    /// Ledger invariant: debits equal credits in every currency present.
    pub fn is_balanced(&self) -> bool {
        self.balance_by_currency()
            .values()
            .all(|(debit, credit)| debit == credit)
    }
}
