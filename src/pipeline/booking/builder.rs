//! Deterministic booking construction.
//!
//! The model only classifies: it suggests an expense account and a VAT
//! class. Every amount on a ledger line is computed here from the
//! verified extraction, so no monetary value ever originates from a
//! text channel.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::accounts;
use crate::models::{DocClass, Entry, VatLine};
use crate::money::{self, FxRate};
use crate::pipeline::extraction::{field, FieldData};
use crate::pipeline::verify::VerifiedDoc;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing monetary field {0}")]
    MissingField(&'static str),
    #[error("document class {0} does not produce bookings")]
    NotBookable(&'static str),
}

/// The model's classification of an invoice-like document.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Classification {
    pub expense_account: String,
    pub vat_class: String,
}

/// Parse the classifier's reply. The prompt demands a JSON object; a
/// model that wraps it in prose still gets parsed by slicing the first
/// top-level object out of the text.
pub fn parse_classification(text: &str) -> Option<Classification> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let parsed: Classification = serde_json::from_str(&text[start..=end]).ok()?;
    if !accounts::is_known_account(&parsed.expense_account) {
        return None;
    }
    Some(parsed)
}

/// Amounts for the ledger, already in the currency the booking will be
/// kept in (home, when a rate was available).
struct BookedAmounts {
    net: Decimal,
    vat: Decimal,
    gross: Decimal,
    currency: String,
    fx_applied: bool,
}

fn booked_amounts(
    verified: &VerifiedDoc,
    home_currency: &str,
    fx_rate: Option<&FxRate>,
) -> Result<BookedAmounts, BuildError> {
    let (net, currency) = verified
        .doc
        .money(field::NET)
        .map(|(d, c)| (*d, c.to_string()))
        .ok_or(BuildError::MissingField(field::NET))?;
    let vat = verified
        .doc
        .money(field::VAT)
        .map(|(d, _)| *d)
        .unwrap_or(Decimal::ZERO);
    let gross = verified
        .doc
        .money(field::GROSS)
        .map(|(d, _)| *d)
        .unwrap_or(net + vat);

    if currency == home_currency {
        return Ok(BookedAmounts {
            net,
            vat,
            gross,
            currency,
            fx_applied: false,
        });
    }

    match fx_rate {
        Some(rate) => Ok(BookedAmounts {
            net: money::convert_to_home(&net, rate),
            vat: money::convert_to_home(&vat, rate),
            gross: money::convert_to_home(&gross, rate),
            currency: home_currency.to_string(),
            fx_applied: true,
        }),
        // No rate: keep original currency; the missing-rate blocker
        // stops auto-advance.
        None => Ok(BookedAmounts {
            net,
            vat,
            gross,
            currency,
            fx_applied: false,
        }),
    }
}

/// Result of entry construction.
#[derive(Debug)]
pub struct BuiltEntries {
    pub entries: Vec<Entry>,
    pub vat_breakdown: Vec<VatLine>,
    /// False when a cross-currency document had no usable rate.
    pub fx_ok: bool,
}

/// Build balanced ledger lines for a verified document.
pub fn build_entries(
    verified: &VerifiedDoc,
    classification: Option<&Classification>,
    home_currency: &str,
    fx_rate: Option<&FxRate>,
) -> Result<BuiltEntries, BuildError> {
    match verified.doc.doc_class {
        DocClass::BankStmt => build_bank_entries(verified),
        DocClass::InvoiceIn | DocClass::InvoiceEu | DocClass::CashRegister => {
            build_invoice_entries(verified, classification, home_currency, fx_rate)
        }
        DocClass::TravelOrder => build_travel_entries(verified, home_currency, fx_rate),
        DocClass::PayrollInput => build_payroll_entries(verified, home_currency, fx_rate),
        DocClass::InvoiceOut => build_outgoing_entries(verified, home_currency, fx_rate),
    }
}

fn vat_rate_of(verified: &VerifiedDoc) -> u32 {
    verified
        .doc
        .field(field::VAT_RATE)
        .and_then(|fv| match fv.value {
            FieldData::Rate { percent } => Some(percent),
            _ => None,
        })
        .unwrap_or(25)
}

fn build_invoice_entries(
    verified: &VerifiedDoc,
    classification: Option<&Classification>,
    home_currency: &str,
    fx_rate: Option<&FxRate>,
) -> Result<BuiltEntries, BuildError> {
    let amounts = booked_amounts(verified, home_currency, fx_rate)?;
    let currency = amounts.currency.as_str();
    let expense = classification
        .map(|c| c.expense_account.as_str())
        .unwrap_or(accounts::EXPENSE_FALLBACK);
    let cross_currency = verified
        .doc
        .money(field::NET)
        .map(|(_, c)| c != home_currency)
        .unwrap_or(false);
    let fx_ok = !cross_currency || amounts.fx_applied;

    let reverse_charge = verified.doc.doc_class == DocClass::InvoiceEu;

    let (entries, vat_breakdown) = if reverse_charge {
        // Recipient accounts for the VAT: input and output lines at the
        // home standard rate cancel out against each other.
        let rc_vat = (amounts.net * Decimal::from(25) / Decimal::from(100)).round_dp(2);
        (
            vec![
                Entry::debit(expense, amounts.net, currency),
                Entry::debit(accounts::INPUT_VAT, rc_vat, currency),
                Entry::credit(accounts::OUTPUT_VAT_RC, rc_vat, currency),
                Entry::credit(accounts::SUPPLIERS_EU, amounts.net, currency),
            ],
            vec![VatLine {
                rate: 25,
                base: amounts.net,
                amount: rc_vat,
                currency: currency.to_string(),
            }],
        )
    } else {
        let payable = if verified.doc.doc_class == DocClass::CashRegister {
            accounts::CASH
        } else {
            accounts::SUPPLIERS_DOMESTIC
        };
        let mut entries = vec![Entry::debit(expense, amounts.net, currency)];
        if amounts.vat > Decimal::ZERO {
            entries.push(Entry::debit(accounts::INPUT_VAT, amounts.vat, currency));
        }
        entries.push(Entry::credit(payable, amounts.gross, currency));
        (
            entries,
            vec![VatLine {
                rate: vat_rate_of(verified),
                base: amounts.net,
                amount: amounts.vat,
                currency: currency.to_string(),
            }],
        )
    };

    Ok(BuiltEntries {
        entries,
        vat_breakdown,
        fx_ok,
    })
}

fn build_bank_entries(verified: &VerifiedDoc) -> Result<BuiltEntries, BuildError> {
    let inflow = verified
        .doc
        .money("total_inflow")
        .map(|(d, c)| (*d, c.to_string()))
        .ok_or(BuildError::MissingField("total_inflow"))?;
    let outflow = verified
        .doc
        .money("total_outflow")
        .map(|(d, _)| *d)
        .ok_or(BuildError::MissingField("total_outflow"))?;
    let currency = inflow.1.as_str();

    // Statement lines clear through the transit account until matched
    // against open items in the ERP.
    let mut entries = Vec::new();
    if inflow.0 > Decimal::ZERO {
        entries.push(Entry::debit(accounts::BANK, inflow.0, currency));
        entries.push(Entry::credit(accounts::CLEARING, inflow.0, currency));
    }
    if outflow > Decimal::ZERO {
        entries.push(Entry::debit(accounts::CLEARING, outflow, currency));
        entries.push(Entry::credit(accounts::BANK, outflow, currency));
    }

    Ok(BuiltEntries {
        entries,
        vat_breakdown: vec![],
        fx_ok: true,
    })
}

fn build_travel_entries(
    verified: &VerifiedDoc,
    home_currency: &str,
    fx_rate: Option<&FxRate>,
) -> Result<BuiltEntries, BuildError> {
    let amounts = booked_amounts(verified, home_currency, fx_rate)?;
    let currency = amounts.currency.as_str();
    Ok(BuiltEntries {
        entries: vec![
            Entry::debit("4300", amounts.gross, currency),
            Entry::credit("2700", amounts.gross, currency),
        ],
        vat_breakdown: vec![],
        fx_ok: true,
    })
}

fn build_payroll_entries(
    verified: &VerifiedDoc,
    home_currency: &str,
    fx_rate: Option<&FxRate>,
) -> Result<BuiltEntries, BuildError> {
    let amounts = booked_amounts(verified, home_currency, fx_rate)?;
    let currency = amounts.currency.as_str();
    // Gross cost on one side; the net/levy split happens in the payroll
    // module's detailed calculation, which the operator reviews.
    Ok(BuiltEntries {
        entries: vec![
            Entry::debit("4500", amounts.gross, currency),
            Entry::credit("2700", amounts.gross, currency),
        ],
        vat_breakdown: vec![],
        fx_ok: true,
    })
}

fn build_outgoing_entries(
    verified: &VerifiedDoc,
    home_currency: &str,
    fx_rate: Option<&FxRate>,
) -> Result<BuiltEntries, BuildError> {
    let amounts = booked_amounts(verified, home_currency, fx_rate)?;
    let currency = amounts.currency.as_str();
    let mut entries = vec![Entry::debit("1090", amounts.gross, currency)];
    entries.push(Entry::credit("6200", amounts.net, currency));
    if amounts.vat > Decimal::ZERO {
        entries.push(Entry::credit(accounts::OUTPUT_VAT, amounts.vat, currency));
    }
    Ok(BuiltEntries {
        entries,
        vat_breakdown: vec![VatLine {
            rate: vat_rate_of(verified),
            base: amounts.net,
            amount: amounts.vat,
            currency: currency.to_string(),
        }],
        fx_ok: true,
    })
}

/// Prompt for the account/VAT classifier, seeded with legal context
/// retrieved for the posting date.
pub fn classification_prompt(
    verified: &VerifiedDoc,
    posting_date: Option<NaiveDate>,
    legal_context: &[crate::pipeline::rag::ScoredChunk],
) -> String {
    let mut prompt = String::from(
        "Klasificiraj knjiženje. Odgovori isključivo JSON objektom \
         {\"expense_account\": \"...\", \"vat_class\": \"...\"}.\n",
    );
    prompt.push_str(&format!(
        "Dozvoljeni konti: {}.\n",
        accounts::expense_accounts().join(", ")
    ));
    if let Some(date) = posting_date {
        prompt.push_str(&format!("Datum poslovnog događaja: {date}.\n"));
    }
    prompt.push_str("Polja dokumenta:\n");
    for (name, fv) in &verified.doc.fields {
        if let Some(text) = fv.value.as_text() {
            prompt.push_str(&format!("  {name}: {text}\n"));
        }
    }
    if !legal_context.is_empty() {
        prompt.push_str("Mjerodavne odredbe:\n");
        for chunk in legal_context {
            prompt.push_str(&format!(
                "  [{}] {}\n",
                chunk.citation.display(),
                chunk.text.chars().take(200).collect::<String>()
            ));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use crate::models::SourceTier;
    use crate::pipeline::extraction::{ExtractedDoc, FieldValue, Provenance};
    use crate::pipeline::verify::verify_document;
    use std::collections::BTreeMap;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn money_fv(amount: &str, currency: &str) -> FieldValue {
        FieldValue {
            value: FieldData::Money {
                amount: dec(amount),
                currency: currency.into(),
                fx_date: None,
            },
            confidence: 0.98,
            provenance: Provenance {
                tier: SourceTier::StructuredXml,
                extractor_id: "test".into(),
                span: None,
            },
        }
    }

    fn invoice_doc(class: DocClass, net: &str, vat: &str, gross: &str, currency: &str) -> VerifiedDoc {
        let mut fields = BTreeMap::new();
        fields.insert(field::NET.to_string(), money_fv(net, currency));
        fields.insert(field::VAT.to_string(), money_fv(vat, currency));
        fields.insert(field::GROSS.to_string(), money_fv(gross, currency));
        let doc = ExtractedDoc {
            blob_id: "b".into(),
            doc_class: class,
            fields,
            source_tier: SourceTier::StructuredXml,
            language: "hr".into(),
            currency: currency.into(),
        };
        verify_document(&doc, &[], "EUR", chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
    }

    fn totals(entries: &[Entry], side: Side) -> Decimal {
        entries
            .iter()
            .filter(|e| e.side == side)
            .map(|e| e.amount)
            .sum()
    }

    #[test]
    fn domestic_invoice_builds_three_lines() {
        let verified = invoice_doc(DocClass::InvoiceIn, "1000.00", "250.00", "1250.00", "EUR");
        let classification = Classification {
            expense_account: "4000".into(),
            vat_class: "25".into(),
        };

        let built = build_entries(&verified, Some(&classification), "EUR", None).unwrap();
        assert_eq!(built.entries.len(), 3);
        assert_eq!(built.entries[0], Entry::debit("4000", dec("1000.00"), "EUR"));
        assert_eq!(built.entries[1], Entry::debit("1230", dec("250.00"), "EUR"));
        assert_eq!(built.entries[2], Entry::credit("2200", dec("1250.00"), "EUR"));
        assert_eq!(totals(&built.entries, Side::Debit), totals(&built.entries, Side::Credit));
        assert!(built.fx_ok);
    }

    #[test]
    fn eu_reverse_charge_builds_four_lines() {
        let verified = invoice_doc(DocClass::InvoiceEu, "5000.00", "0.00", "5000.00", "EUR");
        let built = build_entries(
            &verified,
            Some(&Classification {
                expense_account: "4100".into(),
                vat_class: "reverse_charge".into(),
            }),
            "EUR",
            None,
        )
        .unwrap();

        assert_eq!(built.entries.len(), 4);
        // Pretax debit and VAT-obligation credit at the home standard rate.
        assert!(built
            .entries
            .contains(&Entry::debit("1230", dec("1250.00"), "EUR")));
        assert!(built
            .entries
            .contains(&Entry::credit("2610", dec("1250.00"), "EUR")));
        assert!(built
            .entries
            .contains(&Entry::credit("2210", dec("5000.00"), "EUR")));
        assert_eq!(totals(&built.entries, Side::Debit), totals(&built.entries, Side::Credit));
        assert_eq!(built.vat_breakdown[0].rate, 25);
    }

    #[test]
    fn cash_register_credits_cash() {
        let verified = invoice_doc(DocClass::CashRegister, "80.00", "20.00", "100.00", "EUR");
        let built = build_entries(&verified, None, "EUR", None).unwrap();
        assert!(built
            .entries
            .contains(&Entry::credit(accounts::CASH, dec("100.00"), "EUR")));
    }

    #[test]
    fn cross_currency_converts_at_rate() {
        let verified = invoice_doc(DocClass::InvoiceIn, "100.00", "25.00", "125.00", "USD");
        let rate = FxRate {
            currency: "USD".into(),
            rate_date: chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            mid_rate: dec("0.9213"),
        };

        let built = build_entries(&verified, None, "EUR", Some(&rate)).unwrap();
        assert!(built.fx_ok);
        assert!(built.entries.iter().all(|e| e.currency == "EUR"));
        assert_eq!(built.entries[0].amount, dec("92.13"));
    }

    #[test]
    fn cross_currency_without_rate_flags_fx() {
        let verified = invoice_doc(DocClass::InvoiceIn, "100.00", "25.00", "125.00", "USD");
        let built = build_entries(&verified, None, "EUR", None).unwrap();
        assert!(!built.fx_ok);
        assert!(built.entries.iter().all(|e| e.currency == "USD"));
    }

    #[test]
    fn missing_net_is_an_error() {
        let mut fields = BTreeMap::new();
        fields.insert(field::GROSS.to_string(), money_fv("100.00", "EUR"));
        let doc = ExtractedDoc {
            blob_id: "b".into(),
            doc_class: DocClass::InvoiceIn,
            fields,
            source_tier: SourceTier::Regex,
            language: "hr".into(),
            currency: "EUR".into(),
        };
        let verified = verify_document(&doc, &[], "EUR", chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());

        let err = build_entries(&verified, None, "EUR", None).unwrap_err();
        assert!(matches!(err, BuildError::MissingField(_)));
    }

    #[test]
    fn bank_statement_clears_through_transit() {
        let mut fields = BTreeMap::new();
        fields.insert("total_inflow".to_string(), money_fv("1250.00", "EUR"));
        fields.insert("total_outflow".to_string(), money_fv("342.18", "EUR"));
        let doc = ExtractedDoc {
            blob_id: "b".into(),
            doc_class: DocClass::BankStmt,
            fields,
            source_tier: SourceTier::TemplateMatch,
            language: "hr".into(),
            currency: "EUR".into(),
        };
        let verified = verify_document(&doc, &[], "EUR", chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());

        let built = build_entries(&verified, None, "EUR", None).unwrap();
        assert_eq!(built.entries.len(), 4);
        assert_eq!(totals(&built.entries, Side::Debit), totals(&built.entries, Side::Credit));
    }

    #[test]
    fn classification_parsing_is_lenient_but_validated() {
        assert_eq!(
            parse_classification(r#"{"expense_account": "4100", "vat_class": "25"}"#),
            Some(Classification {
                expense_account: "4100".into(),
                vat_class: "25".into()
            })
        );
        // Prose-wrapped JSON still parses.
        assert!(parse_classification(
            "Prijedlog: {\"expense_account\": \"4000\", \"vat_class\": \"25\"} jer materijal."
        )
        .is_some());
        // Unknown account is refused, not trusted.
        assert!(parse_classification(r#"{"expense_account": "9999", "vat_class": "25"}"#).is_none());
        assert!(parse_classification("nema JSON-a").is_none());
    }

    #[test]
    fn prompt_carries_citations_and_constraints() {
        let verified = invoice_doc(DocClass::InvoiceIn, "1000.00", "250.00", "1250.00", "EUR");
        let chunk = crate::pipeline::rag::ScoredChunk {
            chunk_id: "c1".into(),
            law_code: "ZPDV".into(),
            article: "38".into(),
            paragraph: None,
            text: "Opća stopa PDV-a iznosi 25%.".into(),
            score: 0.9,
            citation: crate::models::CitationRef {
                law_code: "ZPDV".into(),
                article: "38".into(),
                paragraph: None,
                gazette_ref: "NN 73/13".into(),
                effective_on: chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            },
        };
        let prompt = classification_prompt(
            &verified,
            chrono::NaiveDate::from_ymd_opt(2026, 3, 2),
            &[chunk],
        );
        assert!(prompt.contains("expense_account"));
        assert!(prompt.contains("ZPDV"));
        assert!(prompt.contains("2026-03-02"));
    }
}
