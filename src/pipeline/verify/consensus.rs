//! Triple-check consensus: every field is judged by the AI extraction,
//! an independent algorithmic reading, and a deterministic rule.
//!
//! A missing check is a disagreement, never an agreement. Monetary and
//! identifier fields are rejected outright when no rule check can be
//! formed for them.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::checks;
use crate::money;
use crate::pipeline::extraction::{field, ExtractedDoc, FieldData};

/// Who produced a check value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSource {
    Ai,
    Algo,
    Rule,
}

/// One of the three checks on a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub source: CheckSource,
    pub value: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Agreement {
    #[serde(rename = "3of3")]
    ThreeOfThree,
    #[serde(rename = "2of3")]
    TwoOfThree,
    #[serde(rename = "1of3")]
    OneOfThree,
    #[serde(rename = "none")]
    None,
}

/// Consensus over one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    pub checks: Vec<Check>,
    pub agreement: Agreement,
    pub score: f32,
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Consensus {
    pub fn rejected(&self) -> bool {
        !self.admitted
    }
}

/// A verified document: the primary extraction plus per-field consensus.
#[derive(Debug, Clone)]
pub struct VerifiedDoc {
    pub doc: ExtractedDoc,
    pub verification: BTreeMap<String, Consensus>,
}

impl VerifiedDoc {
    /// Lowest score across monetary fields, 1.0 when none present.
    pub fn monetary_floor(&self) -> f32 {
        self.doc
            .fields
            .iter()
            .filter(|(_, fv)| fv.value.is_monetary())
            .filter_map(|(name, _)| self.verification.get(name))
            .map(|c| c.score)
            .fold(1.0, f32::min)
    }

    /// Overall score: the minimum across all fields. One bad field is
    /// enough to stop auto-advance, so averaging would hide exactly the
    /// thing the gate exists to catch.
    pub fn overall_score(&self) -> f32 {
        self.verification
            .values()
            .map(|c| c.score)
            .fold(1.0, f32::min)
    }

    /// Score used by the auto-advance gate: the minimum over monetary
    /// fields. Identifier and date problems gate through field
    /// rejection and blockers; free-text fields rarely have an
    /// independent reading and must not poison the gate.
    pub fn gating_score(&self) -> f32 {
        self.monetary_floor()
    }

    pub fn has_rejected_field(&self) -> bool {
        self.verification.values().any(|c| c.rejected())
    }

    pub fn warnings(&self) -> Vec<(String, String)> {
        self.verification
            .iter()
            .filter_map(|(name, c)| c.warning.clone().map(|w| (name.clone(), w)))
            .collect()
    }
}

fn fmt_value(data: &FieldData) -> String {
    match data {
        FieldData::Text { value } | FieldData::Identifier { value } => value.clone(),
        FieldData::Money { amount, currency, .. } => format!("{} {currency}", money::format_amount(amount)),
        FieldData::Date { value } => value.format("%Y-%m-%d").to_string(),
        FieldData::Rate { percent } => format!("{percent}%"),
    }
}

/// Find an independent (shadow) value for a field.
fn shadow_value<'a>(shadows: &'a [ExtractedDoc], name: &str) -> Option<&'a FieldData> {
    shadows.iter().find_map(|s| s.field(name).map(|fv| &fv.value))
}

/// Closed-form recomputation for the monetary triple, used as the algo
/// check when no shadow extraction carries the field.
fn recompute_money(doc: &ExtractedDoc, name: &str) -> Option<Decimal> {
    let net = doc.money(field::NET).map(|(d, _)| *d);
    let vat = doc.money(field::VAT).map(|(d, _)| *d);
    let gross = doc.money(field::GROSS).map(|(d, _)| *d);
    let rate = doc.field(field::VAT_RATE).and_then(|fv| match fv.value {
        FieldData::Rate { percent } => Some(percent),
        _ => None,
    });

    match name {
        field::NET => match (gross, vat) {
            (Some(g), Some(v)) => Some(g - v),
            _ => None,
        },
        field::VAT => match (net, rate) {
            (Some(n), Some(r)) => Some((n * Decimal::from(r) / Decimal::from(100)).round_dp(2)),
            _ => match (gross, net) {
                (Some(g), Some(n)) => Some(g - n),
                _ => None,
            },
        },
        field::GROSS => match (net, vat) {
            (Some(n), Some(v)) => Some(n + v),
            _ => None,
        },
        _ => recompute_vat_line(doc, name),
    }
}

/// Recompute one side of a `vat_N_*` block from the other side and the
/// block's rate.
fn recompute_vat_line(doc: &ExtractedDoc, name: &str) -> Option<Decimal> {
    let rest = name.strip_prefix("vat_")?;
    let (index, part) = rest.split_once('_')?;
    let rate = doc.field(&field::vat_line(index.parse().ok()?, "rate")).and_then(|fv| {
        match fv.value {
            FieldData::Rate { percent } => Some(percent),
            _ => None,
        }
    })?;
    if rate == 0 {
        return None;
    }
    let index: usize = index.parse().ok()?;
    let base = doc.money(&field::vat_line(index, "base")).map(|(d, _)| *d);
    let amount = doc.money(&field::vat_line(index, "amount")).map(|(d, _)| *d);

    match part {
        "base" => amount.map(|a| (a * Decimal::from(100) / Decimal::from(rate)).round_dp(2)),
        "amount" => base.map(|b| (b * Decimal::from(rate) / Decimal::from(100)).round_dp(2)),
        _ => None,
    }
}

fn values_agree(a: &FieldData, b: &FieldData, tolerance: &Decimal) -> bool {
    match (a, b) {
        (FieldData::Money { amount: x, .. }, FieldData::Money { amount: y, .. }) => {
            money::amounts_agree(x, y, tolerance)
        }
        (FieldData::Date { value: x }, FieldData::Date { value: y }) => x == y,
        (FieldData::Rate { percent: x }, FieldData::Rate { percent: y }) => x == y,
        _ => match (a.as_text(), b.as_text()) {
            (Some(x), Some(y)) => {
                crate::pipeline::extraction::normalize::normalize_text(x)
                    == crate::pipeline::extraction::normalize::normalize_text(y)
            }
            _ => false,
        },
    }
}

/// The deterministic rule check for one field, if one applies.
/// Returns (value rendered for the audit trail, ok).
fn rule_check(
    doc: &ExtractedDoc,
    name: &str,
    data: &FieldData,
    tolerance: &Decimal,
    today: chrono::NaiveDate,
) -> Option<(String, bool)> {
    match name {
        field::SUPPLIER_OIB => data
            .as_text()
            .map(|v| ("mod11,10".into(), checks::validate_oib(v))),
        field::SUPPLIER_IBAN => data
            .as_text()
            .map(|v| ("mod97".into(), checks::validate_iban(v))),
        field::SUPPLIER_VAT_ID => data
            .as_text()
            .map(|v| ("vat-id-syntax".into(), checks::validate_eu_vat_id(v))),
        field::VAT_RATE => match data {
            FieldData::Rate { percent } => {
                Some(("rate-catalog".into(), checks::is_valid_vat_rate(*percent)))
            }
            _ => None,
        },
        field::NET | field::VAT | field::GROSS => {
            let net = doc.money(field::NET).map(|(d, _)| *d);
            let vat = doc.money(field::VAT).map(|(d, _)| *d);
            let gross = doc.money(field::GROSS).map(|(d, _)| *d);
            match (net, vat, gross) {
                (Some(n), Some(v), Some(g)) => Some((
                    "net+vat=gross".into(),
                    checks::vat_identity_holds(&n, &v, &g, tolerance),
                )),
                _ => match data {
                    // Identity unavailable: fall back to the sanity rule
                    // so the monetary field still has a rule leg.
                    FieldData::Money { amount, .. } => {
                        Some(("amount-sane".into(), checks::amount_is_sane(amount)))
                    }
                    _ => None,
                },
            }
        }
        field::INVOICE_DATE | field::DUE_DATE => data
            .as_date()
            .map(|d| ("date-range".into(), checks::date_in_plausible_range(d, today))),
        _ => match data {
            // Any other monetary field (bank transactions, VAT lines)
            // gets the sanity rule; identifiers get mod-97 when they
            // look like account numbers.
            FieldData::Money { amount, .. } => {
                Some(("amount-sane".into(), checks::amount_is_sane(amount)))
            }
            FieldData::Identifier { value } if name.ends_with("iban") => {
                Some(("mod97".into(), checks::validate_iban(value)))
            }
            FieldData::Text { value } => Some((
                "normalized-nonempty".into(),
                !crate::pipeline::extraction::normalize::normalize_text(value).is_empty(),
            )),
            FieldData::Date { value } => Some((
                "date-range".into(),
                checks::date_in_plausible_range(*value, today),
            )),
            _ => None,
        },
    }
}

/// Run the three checks on every field of the primary extraction.
pub fn verify_document(
    primary: &ExtractedDoc,
    shadows: &[ExtractedDoc],
    home_currency: &str,
    today: chrono::NaiveDate,
) -> VerifiedDoc {
    let mut verification = BTreeMap::new();

    for (name, fv) in &primary.fields {
        let tolerance = match &fv.value {
            FieldData::Money { currency, .. } if currency != home_currency => money::fx_tolerance(),
            _ => money::home_tolerance(),
        };

        // AI check: the primary extractor's value. An ambiguous or
        // low-confidence read is a failed check, not silent agreement.
        let ai_ok = fv.confidence >= 0.5;
        let ai_check = Check {
            source: CheckSource::Ai,
            value: fmt_value(&fv.value),
            ok: ai_ok,
        };

        // Algo check: an independent tier's reading, or a closed-form
        // recomputation for the monetary triple.
        let algo_check = match shadow_value(shadows, name) {
            Some(other) => Check {
                source: CheckSource::Algo,
                value: fmt_value(other),
                ok: values_agree(&fv.value, other, &tolerance),
            },
            None => match recompute_money(primary, name) {
                Some(recomputed) => {
                    let ok = fv
                        .value
                        .as_money()
                        .map(|(amount, _)| money::amounts_agree(amount, &recomputed, &tolerance))
                        .unwrap_or(false);
                    Check {
                        source: CheckSource::Algo,
                        value: money::format_amount(&recomputed),
                        ok,
                    }
                }
                None => Check {
                    source: CheckSource::Algo,
                    value: String::new(),
                    ok: false, // missing check counts as disagreement
                },
            },
        };

        let rule = rule_check(primary, name, &fv.value, &tolerance, today);
        let rule_missing = rule.is_none();
        let rule_check = match rule {
            Some((value, ok)) => Check {
                source: CheckSource::Rule,
                value,
                ok,
            },
            None => Check {
                source: CheckSource::Rule,
                value: String::new(),
                ok: false,
            },
        };

        let needs_rule = fv.value.is_monetary() || matches!(fv.value, FieldData::Identifier { .. });
        let ok_count = [&ai_check, &algo_check, &rule_check]
            .iter()
            .filter(|c| c.ok)
            .count();

        let (agreement, mut score): (Agreement, f32) = match ok_count {
            3 => (Agreement::ThreeOfThree, 1.0),
            2 => (Agreement::TwoOfThree, 0.82),
            1 => (Agreement::OneOfThree, 0.40),
            _ => (Agreement::None, 0.10),
        };
        if agreement == Agreement::TwoOfThree && !rule_check.ok && !rule_missing {
            // Values agree but the domain rule failed: weakest admission.
            score = 0.70;
        }

        let mut admitted = matches!(agreement, Agreement::ThreeOfThree | Agreement::TwoOfThree);
        let mut warning = None;

        // OCR-sourced values are never trusted enough to auto-advance on
        // their own: the recompute and identity checks share the same
        // transcript, so "three agreeing checks" is weaker than it looks.
        if fv.provenance.tier == crate::models::SourceTier::VisionOcr && score > 0.94 {
            score = 0.94;
            warning = Some("value read by vision OCR".into());
        }

        if needs_rule && rule_missing {
            admitted = false;
            score = score.min(0.40);
            warning = Some("no rule check available for a monetary/identifier field".into());
        } else if needs_rule && !rule_check.ok {
            // A failed checksum or broken identity rejects the field no
            // matter how confidently the extractors agree.
            admitted = false;
            warning = Some(format!("rule check '{}' failed", rule_check.value));
        } else if agreement == Agreement::TwoOfThree {
            let differing = [&ai_check, &algo_check, &rule_check]
                .iter()
                .find(|c| !c.ok)
                .map(|c| format!("{:?}", c.source).to_lowercase())
                .unwrap_or_default();
            warning = Some(format!("2of3 consensus, {differing} check differs"));
        }

        verification.insert(
            name.clone(),
            Consensus {
                checks: vec![ai_check, algo_check, rule_check],
                agreement,
                score,
                admitted,
                warning,
            },
        );
    }

    VerifiedDoc {
        doc: primary.clone(),
        verification,
    }
}
