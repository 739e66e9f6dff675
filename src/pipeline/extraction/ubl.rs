//! Structured-XML tier: UBL 2.1 e-invoices.
//!
//! Both Croatian e-invoice platforms and the EU Peppol network deliver
//! UBL 2.1, so this is the highest-fidelity path. The profile the office
//! receives is narrow and stable; fields are pulled by qualified tag
//! within the relevant party/total sections rather than through a full
//! schema mapper.

use std::collections::BTreeMap;

use regex::Regex;
use rust_decimal::prelude::ToPrimitive;

use super::normalize::{normalize_currency, parse_date, parse_locale_amount};
use super::types::{
    field, ExtractInput, ExtractedDoc, ExtractionError, Extractor, FieldData, FieldValue,
    Provenance,
};
use crate::models::{DocClass, SourceTier};

const CONFIDENCE: f32 = 0.98;

pub struct UblInvoiceExtractor;

impl UblInvoiceExtractor {
    pub fn new() -> Self {
        Self
    }

    fn make_field(&self, value: FieldData, span: Option<String>) -> FieldValue {
        FieldValue {
            value,
            confidence: CONFIDENCE,
            provenance: Provenance {
                tier: SourceTier::StructuredXml,
                extractor_id: "ubl21".into(),
                span,
            },
        }
    }
}

impl Default for UblInvoiceExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// First text content of `<ns:tag>…</ns:tag>` (namespace prefix optional).
fn tag_text(xml: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"<(?:[A-Za-z0-9]+:)?{tag}\b[^>]*>([^<]+)<")).ok()?;
    re.captures(xml)
        .map(|c| c.get(1).expect("capture group").as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Slice the document to one aggregate section, e.g. the supplier party.
fn section<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = Regex::new(&format!(r"<(?:[A-Za-z0-9]+:)?{tag}[\s>]")).ok()?;
    let close = Regex::new(&format!(r"</(?:[A-Za-z0-9]+:)?{tag}>")).ok()?;
    let start = open.find(xml)?.start();
    let end = close.find(&xml[start..])?.end() + start;
    Some(&xml[start..end])
}

impl Extractor for UblInvoiceExtractor {
    fn id(&self) -> &'static str {
        "ubl21"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::StructuredXml
    }

    fn extract(&self, input: &ExtractInput) -> Result<Option<ExtractedDoc>, ExtractionError> {
        if !matches!(input.doc_class, DocClass::InvoiceIn | DocClass::InvoiceEu) {
            return Ok(None);
        }
        if !matches!(input.media_type.as_str(), "application/xml" | "text/xml") {
            return Ok(None);
        }

        let xml = std::str::from_utf8(&input.bytes)
            .map_err(|e| ExtractionError::Encoding(e.to_string()))?;
        if !xml.contains("Invoice") {
            return Ok(None);
        }

        let currency = tag_text(xml, "DocumentCurrencyCode")
            .and_then(|c| normalize_currency(&c))
            .unwrap_or_else(|| "EUR".to_string());
        let fx_date = tag_text(xml, "IssueDate")
            .and_then(|d| parse_date(&d, true))
            .map(|p| p.date);

        let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();

        if let Some(number) = tag_text(xml, "ID") {
            fields.insert(
                field::INVOICE_NUMBER.into(),
                self.make_field(FieldData::Text { value: number }, Some("cbc:ID".into())),
            );
        }

        if let Some(p) = tag_text(xml, "IssueDate").and_then(|d| parse_date(&d, true)) {
            fields.insert(
                field::INVOICE_DATE.into(),
                self.make_field(FieldData::Date { value: p.date }, Some("cbc:IssueDate".into())),
            );
        }
        if let Some(p) = tag_text(xml, "DueDate").and_then(|d| parse_date(&d, true)) {
            fields.insert(
                field::DUE_DATE.into(),
                self.make_field(FieldData::Date { value: p.date }, Some("cbc:DueDate".into())),
            );
        }

        if let Some(supplier) = section(xml, "AccountingSupplierParty") {
            if let Some(name) = tag_text(supplier, "RegistrationName")
                .or_else(|| tag_text(supplier, "Name"))
            {
                fields.insert(
                    field::SUPPLIER_NAME.into(),
                    self.make_field(FieldData::Text { value: name }, None),
                );
            }
            if let Some(company_id) = tag_text(supplier, "CompanyID") {
                let cleaned = company_id.replace(' ', "");
                if cleaned.chars().all(|c| c.is_ascii_digit()) {
                    fields.insert(
                        field::SUPPLIER_OIB.into(),
                        self.make_field(FieldData::Identifier { value: cleaned }, None),
                    );
                } else {
                    fields.insert(
                        field::SUPPLIER_VAT_ID.into(),
                        self.make_field(FieldData::Identifier { value: cleaned }, None),
                    );
                }
            }
        }

        if let Some(iban) = section(xml, "PayeeFinancialAccount").and_then(|s| tag_text(s, "ID")) {
            fields.insert(
                field::SUPPLIER_IBAN.into(),
                self.make_field(FieldData::Identifier { value: iban.replace(' ', "") }, None),
            );
        }

        let monetary = section(xml, "LegalMonetaryTotal").unwrap_or(xml);
        if let Some(net) = tag_text(monetary, "TaxExclusiveAmount").and_then(|v| parse_locale_amount(&v)) {
            fields.insert(
                field::NET.into(),
                self.make_field(
                    FieldData::Money { amount: net, currency: currency.clone(), fx_date },
                    Some("cbc:TaxExclusiveAmount".into()),
                ),
            );
        }
        if let Some(gross) = tag_text(monetary, "PayableAmount").and_then(|v| parse_locale_amount(&v)) {
            fields.insert(
                field::GROSS.into(),
                self.make_field(
                    FieldData::Money { amount: gross, currency: currency.clone(), fx_date },
                    Some("cbc:PayableAmount".into()),
                ),
            );
        }

        if let Some(tax_total) = section(xml, "TaxTotal") {
            if let Some(vat) = tag_text(tax_total, "TaxAmount").and_then(|v| parse_locale_amount(&v)) {
                fields.insert(
                    field::VAT.into(),
                    self.make_field(
                        FieldData::Money { amount: vat, currency: currency.clone(), fx_date },
                        Some("cbc:TaxAmount".into()),
                    ),
                );
            }

            // Per-rate subtotals for multi-VAT invoices.
            let sub_re = Regex::new(r"(?s)<(?:[A-Za-z0-9]+:)?TaxSubtotal[\s>].*?</(?:[A-Za-z0-9]+:)?TaxSubtotal>")
                .expect("static regex");
            for (i, m) in sub_re.find_iter(tax_total).enumerate() {
                let sub = m.as_str();
                if let Some(base) = tag_text(sub, "TaxableAmount").and_then(|v| parse_locale_amount(&v)) {
                    fields.insert(
                        field::vat_line(i, "base"),
                        self.make_field(
                            FieldData::Money { amount: base, currency: currency.clone(), fx_date },
                            None,
                        ),
                    );
                }
                if let Some(amount) = tag_text(sub, "TaxAmount").and_then(|v| parse_locale_amount(&v)) {
                    fields.insert(
                        field::vat_line(i, "amount"),
                        self.make_field(
                            FieldData::Money { amount, currency: currency.clone(), fx_date },
                            None,
                        ),
                    );
                }
                if let Some(rate) = tag_text(sub, "Percent")
                    .and_then(|v| parse_locale_amount(&v))
                    .and_then(|d| d.to_u32())
                {
                    fields.insert(
                        field::vat_line(i, "rate"),
                        self.make_field(FieldData::Rate { percent: rate }, None),
                    );
                }
            }

            if let Some(rate) = tag_text(tax_total, "Percent")
                .and_then(|v| parse_locale_amount(&v))
                .and_then(|d| d.to_u32())
            {
                fields.insert(
                    field::VAT_RATE.into(),
                    self.make_field(FieldData::Rate { percent: rate }, None),
                );
            }
        }

        // An invoice without totals is not a usable structured match.
        if !fields.contains_key(field::GROSS) && !fields.contains_key(field::NET) {
            return Ok(None);
        }

        fields.insert(
            field::CURRENCY.into(),
            self.make_field(FieldData::Text { value: currency.clone() }, None),
        );

        Ok(Some(ExtractedDoc {
            blob_id: input.blob_id.clone(),
            doc_class: input.doc_class,
            fields,
            source_tier: SourceTier::StructuredXml,
            language: "hr".into(),
            currency,
        }))
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_UBL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice xmlns:cbc="urn:oasis:names:specification:ubl:schema:xsd:CommonBasicComponents-2"
         xmlns:cac="urn:oasis:names:specification:ubl:schema:xsd:CommonAggregateComponents-2">
  <cbc:ID>14/1/1</cbc:ID>
  <cbc:IssueDate>2026-03-02</cbc:IssueDate>
  <cbc:DueDate>2026-03-17</cbc:DueDate>
  <cbc:DocumentCurrencyCode>EUR</cbc:DocumentCurrencyCode>
  <cac:AccountingSupplierParty>
    <cac:Party>
      <cac:PartyLegalEntity>
        <cbc:RegistrationName>Uredski Servis d.o.o.</cbc:RegistrationName>
        <cbc:CompanyID>12345678903</cbc:CompanyID>
      </cac:PartyLegalEntity>
    </cac:Party>
  </cac:AccountingSupplierParty>
  <cac:PaymentMeans>
    <cac:PayeeFinancialAccount>
      <cbc:ID>HR1210010051863000160</cbc:ID>
    </cac:PayeeFinancialAccount>
  </cac:PaymentMeans>
  <cac:TaxTotal>
    <cbc:TaxAmount currencyID="EUR">250.00</cbc:TaxAmount>
    <cac:TaxSubtotal>
      <cbc:TaxableAmount currencyID="EUR">1000.00</cbc:TaxableAmount>
      <cbc:TaxAmount currencyID="EUR">250.00</cbc:TaxAmount>
      <cac:TaxCategory>
        <cbc:ID>S</cbc:ID>
        <cbc:Percent>25</cbc:Percent>
      </cac:TaxCategory>
    </cac:TaxSubtotal>
  </cac:TaxTotal>
  <cac:LegalMonetaryTotal>
    <cbc:TaxExclusiveAmount currencyID="EUR">1000.00</cbc:TaxExclusiveAmount>
    <cbc:PayableAmount currencyID="EUR">1250.00</cbc:PayableAmount>
  </cac:LegalMonetaryTotal>
</Invoice>
"#;
