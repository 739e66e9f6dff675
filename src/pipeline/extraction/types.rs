//! Extraction output shapes shared by all tiers.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{DocClass, SourceTier};

/// Canonical field names. Extractors at every tier emit the same names so
/// the verifier can line values up across tiers. Multi-VAT invoices use
/// the indexed `vat_N_*` family alongside the totals.
pub mod field {
    pub const SUPPLIER_NAME: &str = "supplier_name";
    pub const SUPPLIER_OIB: &str = "supplier_oib";
    pub const SUPPLIER_VAT_ID: &str = "supplier_vat_id";
    pub const SUPPLIER_IBAN: &str = "supplier_iban";
    pub const INVOICE_NUMBER: &str = "invoice_number";
    pub const INVOICE_DATE: &str = "invoice_date";
    pub const DUE_DATE: &str = "due_date";
    pub const NET: &str = "net";
    pub const VAT: &str = "vat";
    pub const GROSS: &str = "gross";
    pub const VAT_RATE: &str = "vat_rate";
    pub const CURRENCY: &str = "currency";
    pub const DESCRIPTION: &str = "description";

    pub fn vat_line(index: usize, part: &str) -> String {
        format!("vat_{index}_{part}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("no extractor produced a result: {}", diagnostics.join("; "))]
    Unextractable { diagnostics: Vec<String> },
    #[error("malformed input for {extractor}: {reason}")]
    Malformed { extractor: String, reason: String },
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Typed field payload. Monetary values always carry their currency and,
/// when not in home currency, the FX date that will price them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldData {
    Text {
        value: String,
    },
    Money {
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
        currency: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fx_date: Option<NaiveDate>,
    },
    Date {
        value: NaiveDate,
    },
    Identifier {
        value: String,
    },
    Rate {
        percent: u32,
    },
}

impl FieldData {
    pub fn as_money(&self) -> Option<(&Decimal, &str)> {
        match self {
            Self::Money { amount, currency, .. } => Some((amount, currency)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { value } | Self::Identifier { value } => Some(value),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date { value } => Some(*value),
            _ => None,
        }
    }

    pub fn is_monetary(&self) -> bool {
        matches!(self, Self::Money { .. })
    }
}

/// Where a value came from, precise enough to audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub tier: SourceTier,
    pub extractor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

/// One extracted field with its confidence and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: FieldData,
    pub confidence: f32,
    pub provenance: Provenance,
}

/// A document normalized out of one extraction tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDoc {
    pub blob_id: String,
    pub doc_class: DocClass,
    pub fields: BTreeMap<String, FieldValue>,
    pub source_tier: SourceTier,
    pub language: String,
    pub currency: String,
}

impl ExtractedDoc {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn money(&self, name: &str) -> Option<(&Decimal, &str)> {
        self.fields.get(name).and_then(|f| f.value.as_money())
    }
}

/// Input handed to every extractor: raw bytes plus, once the vision tier
/// has run, the OCR transcript.
#[derive(Debug)]
pub struct ExtractInput {
    pub blob_id: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
    pub doc_class: DocClass,
    pub ocr_text: Option<String>,
}

/// A single extraction tier. `Ok(None)` means "does not apply / no
/// match" and selects the next tier; only malformed input is an error.
pub trait Extractor: Send + Sync {
    fn id(&self) -> &'static str;
    fn tier(&self) -> SourceTier;
    fn extract(&self, input: &ExtractInput) -> Result<Option<ExtractedDoc>, ExtractionError>;
}

/// Fabric result: the highest-fidelity extraction plus every lower-tier
/// extraction that also matched, kept as independent evidence for the
/// verifier.
#[derive(Debug)]
pub struct FabricOutput {
    pub primary: ExtractedDoc,
    pub shadows: Vec<ExtractedDoc>,
    pub diagnostics: Vec<String>,
}
