//! Regex tier: line-oriented invoice grammar over plain text, plus the
//! vision tier that re-reads the same grammar over an OCR transcript.
//!
//! The grammar recognizes the labels Croatian invoices actually use
//! (osnovica, PDV, ukupno, OIB, IBAN, račun br., datum) with English
//! fallbacks for EU documents. The vision tier never touches bytes: the
//! pipeline runs OCR through the inference orchestrator and hands the
//! transcript in via `ExtractInput::ocr_text`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use super::normalize::{normalize_currency, normalize_text, parse_date, parse_locale_amount};
use super::types::{
    field, ExtractInput, ExtractedDoc, ExtractionError, Extractor, FieldData, FieldValue,
    Provenance,
};
use crate::models::{DocClass, SourceTier};

struct Grammar {
    oib: Regex,
    iban: Regex,
    vat_id: Regex,
    number: Regex,
    date: Regex,
    net: Regex,
    vat: Regex,
    vat_rate: Regex,
    gross: Regex,
    currency: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| Grammar {
        oib: Regex::new(r"(?i)\bOIB[:.\s]*([0-9]{11})\b").expect("static regex"),
        iban: Regex::new(r"\b([A-Z]{2}[0-9]{2}[A-Z0-9]{11,30})\b").expect("static regex"),
        vat_id: Regex::new(r"(?i)\b(?:VAT\s*(?:ID|No\.?)?|PDV\s*ID)[:.\s]*([A-Z]{2}[0-9A-Z]{8,12})\b")
            .expect("static regex"),
        number: Regex::new(r"(?i)(?:ra[čc]un\s*(?:br\.?|broj)|invoice\s*(?:no\.?|number)|broj\s*ra[čc]una)[:.\s]*([0-9][0-9/\-]*)")
            .expect("static regex"),
        date: Regex::new(r"(?i)(?:datum(?:\s*(?:ra[čc]una|izdavanja))?|date)[:.\s]*([0-9]{1,4}[./\-][0-9]{1,2}[./\-][0-9]{1,4}\.?)")
            .expect("static regex"),
        net: Regex::new(r"(?i)(?:osnovica|neto|net(?:\s*amount)?|iznos\s*bez\s*PDV-?a)[:.\s]*([0-9][0-9.,\s]*)")
            .expect("static regex"),
        vat: Regex::new(r"(?i)(?:PDV(?:\s*25\s*%|\s*13\s*%|\s*5\s*%)?|VAT(?:\s*amount)?)[:.\s]*([0-9][0-9.,\s]*)")
            .expect("static regex"),
        vat_rate: Regex::new(r"(?i)(?:PDV|VAT)\s*\(?([0-9]{1,2})\s*%").expect("static regex"),
        gross: Regex::new(r"(?i)(?:ukupno(?:\s*za\s*platiti)?|sveukupno|total|gross)[:.\s]*([0-9][0-9.,\s]*)")
            .expect("static regex"),
        currency: Regex::new(r"(?i)\b(EUR|USD|GBP|CHF)\b|(€|\$|£)").expect("static regex"),
    })
}

/// Parse invoice fields out of free text. Returns `None` when the text
/// carries no recognizable monetary total.
fn parse_invoice_text(
    blob_id: &str,
    doc_class: DocClass,
    text: &str,
    tier: SourceTier,
    extractor_id: &'static str,
    confidence: f32,
) -> Option<ExtractedDoc> {
    let text = normalize_text(text);
    let g = grammar();

    let make = |value: FieldData, span: Option<String>| FieldValue {
        value,
        confidence,
        provenance: Provenance {
            tier,
            extractor_id: extractor_id.into(),
            span,
        },
    };

    let currency = g
        .currency
        .captures(&text)
        .and_then(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .and_then(|m| normalize_currency(m.as_str()))
        })
        .unwrap_or_else(|| "EUR".to_string());

    let date = g
        .date
        .captures(&text)
        .and_then(|c| parse_date(c.get(1).expect("group").as_str(), doc_class.dates_are_day_first()));
    let fx_date = date.map(|p| p.date);

    let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();

    if let Some(c) = g.oib.captures(&text) {
        fields.insert(
            field::SUPPLIER_OIB.into(),
            make(
                FieldData::Identifier {
                    value: c.get(1).expect("group").as_str().into(),
                },
                Some("oib".into()),
            ),
        );
    }
    if let Some(c) = g.vat_id.captures(&text) {
        fields.insert(
            field::SUPPLIER_VAT_ID.into(),
            make(
                FieldData::Identifier {
                    value: c.get(1).expect("group").as_str().into(),
                },
                Some("vat_id".into()),
            ),
        );
    }
    if let Some(c) = g.iban.captures(&text) {
        fields.insert(
            field::SUPPLIER_IBAN.into(),
            make(
                FieldData::Identifier {
                    value: c.get(1).expect("group").as_str().into(),
                },
                Some("iban".into()),
            ),
        );
    }
    if let Some(c) = g.number.captures(&text) {
        fields.insert(
            field::INVOICE_NUMBER.into(),
            make(
                FieldData::Text {
                    value: c.get(1).expect("group").as_str().trim_end_matches('-').into(),
                },
                Some("number".into()),
            ),
        );
    }

    if let Some(p) = date {
        // An ambiguous slash date is kept but marked down so the
        // verifier surfaces it instead of trusting a guess.
        let mut fv = make(FieldData::Date { value: p.date }, Some("date".into()));
        if p.ambiguous {
            fv.confidence = 0.40;
        }
        fields.insert(field::INVOICE_DATE.into(), fv);
    }

    for (name, re) in [(field::NET, &g.net), (field::VAT, &g.vat), (field::GROSS, &g.gross)] {
        if let Some(c) = re.captures(&text) {
            if let Some(amount) = parse_locale_amount(c.get(1).expect("group").as_str()) {
                fields.insert(
                    name.into(),
                    make(
                        FieldData::Money {
                            amount,
                            currency: currency.clone(),
                            fx_date,
                        },
                        Some(name.into()),
                    ),
                );
            }
        }
    }

    if let Some(c) = g.vat_rate.captures(&text) {
        if let Ok(rate) = c.get(1).expect("group").as_str().parse::<u32>() {
            fields.insert(field::VAT_RATE.into(), make(FieldData::Rate { percent: rate }, None));
        }
    }

    if !fields.contains_key(field::GROSS) && !fields.contains_key(field::NET) {
        return None;
    }

    fields.insert(
        field::CURRENCY.into(),
        make(FieldData::Text { value: currency.clone() }, None),
    );

    Some(ExtractedDoc {
        blob_id: blob_id.into(),
        doc_class,
        fields,
        source_tier: tier,
        language: "hr".into(),
        currency,
    })
}

fn invoice_like(doc_class: DocClass) -> bool {
    matches!(
        doc_class,
        DocClass::InvoiceIn
            | DocClass::InvoiceEu
            | DocClass::InvoiceOut
            | DocClass::CashRegister
            | DocClass::TravelOrder
    )
}

// ── Regex tier ──────────────────────────────────────────────

pub struct RegexInvoiceExtractor;

impl RegexInvoiceExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RegexInvoiceExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for RegexInvoiceExtractor {
    fn id(&self) -> &'static str {
        "regex_invoice"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Regex
    }

    fn extract(&self, input: &ExtractInput) -> Result<Option<ExtractedDoc>, ExtractionError> {
        if !invoice_like(input.doc_class) {
            return Ok(None);
        }
        let text = match input.media_type.as_str() {
            "text/plain" | "application/xml" | "text/xml" | "text/csv" => {
                std::str::from_utf8(&input.bytes)
                    .map_err(|e| ExtractionError::Encoding(e.to_string()))?
            }
            // Binary media has no text for this tier.
            _ => return Ok(None),
        };
        Ok(parse_invoice_text(
            &input.blob_id,
            input.doc_class,
            text,
            SourceTier::Regex,
            "regex_invoice",
            0.75,
        ))
    }
}

// ── Vision tier ─────────────────────────────────────────────

/// Final tier: the same grammar over a vision-model OCR transcript.
pub struct VisionTextExtractor;

impl VisionTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VisionTextExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for VisionTextExtractor {
    fn id(&self) -> &'static str {
        "vision_text"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::VisionOcr
    }

    fn extract(&self, input: &ExtractInput) -> Result<Option<ExtractedDoc>, ExtractionError> {
        if !invoice_like(input.doc_class) {
            return Ok(None);
        }
        let Some(ocr_text) = input.ocr_text.as_deref() else {
            return Ok(None);
        };
        Ok(parse_invoice_text(
            &input.blob_id,
            input.doc_class,
            ocr_text,
            SourceTier::VisionOcr,
            "vision_text",
            0.60,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    const SAMPLE_TEXT: &str = "\
        Uredski Servis d.o.o.\n\
        OIB: 12345678903\n\
        IBAN: HR1210010051863000160\n\
        Račun br. 14/1/1\n\
        Datum računa: 02.03.2026.\n\
        Osnovica: 1.000,00 EUR\n\
        PDV 25%: 250,00\n\
        Ukupno za platiti: 1.250,00 EUR\n";

    fn input(text: &str) -> ExtractInput {
        ExtractInput {
            blob_id: "blob1".into(),
            media_type: "text/plain".into(),
            bytes: text.as_bytes().to_vec(),
            doc_class: DocClass::InvoiceIn,
            ocr_text: None,
        }
    }

    #[test]
    fn croatian_invoice_text_parses() {
        let doc = RegexInvoiceExtractor::new()
            .extract(&input(SAMPLE_TEXT))
            .unwrap()
            .expect("grammar match");

        assert_eq!(doc.source_tier, SourceTier::Regex);
        assert_eq!(doc.field(field::SUPPLIER_OIB).unwrap().value.as_text(), Some("12345678903"));
        assert_eq!(doc.money(field::NET).unwrap().0, &dec("1000.00"));
        assert_eq!(doc.money(field::VAT).unwrap().0, &dec("250.00"));
        assert_eq!(doc.money(field::GROSS).unwrap().0, &dec("1250.00"));
        assert_eq!(
            doc.field(field::INVOICE_DATE).unwrap().value.as_date(),
            chrono::NaiveDate::from_ymd_opt(2026, 3, 2)
        );
        assert!(matches!(
            doc.field(field::VAT_RATE).unwrap().value,
            FieldData::Rate { percent: 25 }
        ));
    }

    #[test]
    fn text_without_totals_is_no_match() {
        let doc = RegexInvoiceExtractor::new()
            .extract(&input("Ponuda za suradnju, bez iznosa."))
            .unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn ambiguous_date_marked_low_confidence() {
        let text = "Invoice no. 77\nDate: 03/04/2026\nTotal: 500.00 EUR\n";
        let doc = RegexInvoiceExtractor::new().extract(&input(text)).unwrap().unwrap();
        let date_field = doc.field(field::INVOICE_DATE).unwrap();
        assert!(date_field.confidence < 0.5, "ambiguous date must not look trustworthy");
    }

    #[test]
    fn vision_tier_requires_transcript() {
        let mut i = input(SAMPLE_TEXT);
        i.media_type = "image/png".into();
        i.bytes = vec![0x89, 0x50, 0x4e, 0x47];
        assert!(VisionTextExtractor::new().extract(&i).unwrap().is_none());

        i.ocr_text = Some(SAMPLE_TEXT.into());
        let doc = VisionTextExtractor::new().extract(&i).unwrap().unwrap();
        assert_eq!(doc.source_tier, SourceTier::VisionOcr);
        assert_eq!(doc.money(field::GROSS).unwrap().0, &dec("1250.00"));
        assert!(doc.field(field::GROSS).unwrap().confidence < 0.75);
    }

    #[test]
    fn regex_tier_skips_binary_media() {
        let mut i = input(SAMPLE_TEXT);
        i.media_type = "application/pdf".into();
        assert!(RegexInvoiceExtractor::new().extract(&i).unwrap().is_none());
    }

    #[test]
    fn eu_vat_id_found() {
        let text = "Invoice number: 2026-117\nVAT ID: DE123456789\nNet: 5,000.00 EUR\nVAT: 0.00\nTotal: 5,000.00 EUR\n";
        let mut i = input(text);
        i.doc_class = DocClass::InvoiceEu;
        let doc = RegexInvoiceExtractor::new().extract(&i).unwrap().unwrap();
        assert_eq!(
            doc.field(field::SUPPLIER_VAT_ID).unwrap().value.as_text(),
            Some("DE123456789")
        );
        assert_eq!(doc.money(field::NET).unwrap().0, &dec("5000.00"));
    }
}
