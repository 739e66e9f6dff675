//! Template tier: bank statement CSV.
//!
//! The office's bank exports semicolon-separated statements with a fixed
//! header. One statement becomes one extracted document; transactions
//! land in indexed `tx_N_*` fields plus inflow/outflow totals the
//! verifier can recompute.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use super::normalize::{normalize_currency, parse_date, parse_locale_amount};
use super::types::{
    field, ExtractInput, ExtractedDoc, ExtractionError, Extractor, FieldData, FieldValue,
    Provenance,
};
use crate::models::{DocClass, SourceTier};

const CONFIDENCE: f32 = 0.95;
const HEADER: &str = "datum;opis;iznos;valuta;smjer;iban";

pub struct BankCsvExtractor;

impl BankCsvExtractor {
    pub fn new() -> Self {
        Self
    }

    fn make_field(&self, value: FieldData) -> FieldValue {
        FieldValue {
            value,
            confidence: CONFIDENCE,
            provenance: Provenance {
                tier: SourceTier::TemplateMatch,
                extractor_id: "bank_csv".into(),
                span: None,
            },
        }
    }
}

impl Default for BankCsvExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for BankCsvExtractor {
    fn id(&self) -> &'static str {
        "bank_csv"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::TemplateMatch
    }

    fn extract(&self, input: &ExtractInput) -> Result<Option<ExtractedDoc>, ExtractionError> {
        if input.doc_class != DocClass::BankStmt {
            return Ok(None);
        }
        if !matches!(input.media_type.as_str(), "text/csv" | "text/plain") {
            return Ok(None);
        }

        let text = std::str::from_utf8(&input.bytes)
            .map_err(|e| ExtractionError::Encoding(e.to_string()))?;
        let mut lines = text.lines();
        let header = match lines.next() {
            Some(h) => h.trim().to_lowercase(),
            None => return Ok(None),
        };
        if header != HEADER {
            return Ok(None);
        }

        let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();
        let mut total_in = Decimal::ZERO;
        let mut total_out = Decimal::ZERO;
        let mut currency = "EUR".to_string();
        let mut count = 0usize;

        for (line_no, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let cols: Vec<&str> = line.split(';').collect();
            if cols.len() != 6 {
                return Err(ExtractionError::Malformed {
                    extractor: "bank_csv".into(),
                    reason: format!("line {} has {} columns, expected 6", line_no + 2, cols.len()),
                });
            }

            let date = parse_date(cols[0], false).ok_or(ExtractionError::Malformed {
                extractor: "bank_csv".into(),
                reason: format!("unparseable date on line {}", line_no + 2),
            })?;
            let amount = parse_locale_amount(cols[2]).ok_or(ExtractionError::Malformed {
                extractor: "bank_csv".into(),
                reason: format!("unparseable amount on line {}", line_no + 2),
            })?;
            currency = normalize_currency(cols[3]).ok_or(ExtractionError::Malformed {
                extractor: "bank_csv".into(),
                reason: format!("unknown currency on line {}", line_no + 2),
            })?;

            let inflow = match cols[4].trim() {
                "uplata" => true,
                "isplata" => false,
                other => {
                    return Err(ExtractionError::Malformed {
                        extractor: "bank_csv".into(),
                        reason: format!("unknown direction '{other}' on line {}", line_no + 2),
                    })
                }
            };
            if inflow {
                total_in += amount;
            } else {
                total_out += amount;
            }

            let i = count;
            fields.insert(
                format!("tx_{i}_date"),
                self.make_field(FieldData::Date { value: date.date }),
            );
            fields.insert(
                format!("tx_{i}_description"),
                self.make_field(FieldData::Text {
                    value: super::normalize::normalize_text(cols[1]),
                }),
            );
            fields.insert(
                format!("tx_{i}_amount"),
                self.make_field(FieldData::Money {
                    amount,
                    currency: currency.clone(),
                    fx_date: Some(date.date),
                }),
            );
            fields.insert(
                format!("tx_{i}_direction"),
                self.make_field(FieldData::Text {
                    value: if inflow { "uplata" } else { "isplata" }.into(),
                }),
            );
            if !cols[5].trim().is_empty() {
                fields.insert(
                    format!("tx_{i}_iban"),
                    self.make_field(FieldData::Identifier {
                        value: cols[5].replace(' ', ""),
                    }),
                );
            }
            count += 1;
        }

        if count == 0 {
            return Ok(None);
        }

        fields.insert(
            "total_inflow".into(),
            self.make_field(FieldData::Money {
                amount: total_in,
                currency: currency.clone(),
                fx_date: None,
            }),
        );
        fields.insert(
            "total_outflow".into(),
            self.make_field(FieldData::Money {
                amount: total_out,
                currency: currency.clone(),
                fx_date: None,
            }),
        );
        fields.insert(
            "tx_count".into(),
            self.make_field(FieldData::Text {
                value: count.to_string(),
            }),
        );
        fields.insert(
            field::CURRENCY.into(),
            self.make_field(FieldData::Text {
                value: currency.clone(),
            }),
        );

        Ok(Some(ExtractedDoc {
            blob_id: input.blob_id.clone(),
            doc_class: input.doc_class,
            fields,
            source_tier: SourceTier::TemplateMatch,
            language: "hr".into(),
            currency,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    const SAMPLE: &str = "datum;opis;iznos;valuta;smjer;iban\n\
        2026-03-02;Uplata kupca 12/1/1;1250,00;EUR;uplata;HR1210010051863000160\n\
        2026-03-03;Režije ožujak;342,18;EUR;isplata;HR2923400091110000001\n";

    fn input(csv: &str) -> ExtractInput {
        ExtractInput {
            blob_id: "blob-stmt".into(),
            media_type: "text/csv".into(),
            bytes: csv.as_bytes().to_vec(),
            doc_class: DocClass::BankStmt,
            ocr_text: None,
        }
    }

    #[test]
    fn parses_statement_with_totals() {
        let doc = BankCsvExtractor::new().extract(&input(SAMPLE)).unwrap().unwrap();

        assert_eq!(doc.money("total_inflow").unwrap().0, &dec("1250.00"));
        assert_eq!(doc.money("total_outflow").unwrap().0, &dec("342.18"));
        assert_eq!(doc.field("tx_count").unwrap().value.as_text(), Some("2"));
        assert_eq!(
            doc.field("tx_1_iban").unwrap().value.as_text(),
            Some("HR2923400091110000001")
        );
    }

    #[test]
    fn wrong_header_is_no_match() {
        let doc = BankCsvExtractor::new()
            .extract(&input("foo;bar\n1;2\n"))
            .unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn malformed_row_is_an_error_not_silence() {
        let bad = "datum;opis;iznos;valuta;smjer;iban\n2026-03-02;samo;tri\n";
        let err = BankCsvExtractor::new().extract(&input(bad)).unwrap_err();
        assert!(matches!(err, ExtractionError::Malformed { .. }));
    }

    #[test]
    fn unknown_direction_rejected() {
        let bad = "datum;opis;iznos;valuta;smjer;iban\n\
            2026-03-02;x;10,00;EUR;sideways;HR1210010051863000160\n";
        let err = BankCsvExtractor::new().extract(&input(bad)).unwrap_err();
        assert!(matches!(err, ExtractionError::Malformed { .. }));
    }

    #[test]
    fn other_doc_class_is_no_match() {
        let mut i = input(SAMPLE);
        i.doc_class = DocClass::InvoiceIn;
        assert!(BankCsvExtractor::new().extract(&i).unwrap().is_none());
    }
}
