//! Deterministic CSV artifact (plus a JSON sidecar) for the CSV/JSON
//! ERP target. Semicolon separator, fixed column order, two-place
//! amounts, ISO dates.

use serde_json::json;

use crate::models::Booking;
use crate::money::format_amount;

const HEADER: &str = "temeljnica;klijent;datum;konto;strana;iznos;valuta;opis";

fn csv_field(text: &str) -> String {
    if text.contains(';') || text.contains('"') || text.contains('\n') {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

pub fn render(booking: &Booking) -> String {
    let date = booking
        .posting_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    let mut csv = String::from(HEADER);
    csv.push('\n');
    for entry in &booking.entries {
        let side = match entry.side {
            crate::models::Side::Debit => "D",
            crate::models::Side::Credit => "P",
        };
        csv.push_str(&format!(
            "{};{};{};{};{};{};{};{}\n",
            booking.id,
            csv_field(&booking.client_id),
            date,
            csv_field(&entry.account),
            side,
            format_amount(&entry.amount),
            csv_field(&entry.currency),
            csv_field(&booking.narrative),
        ));
    }
    csv
}

/// JSON sidecar with the VAT breakdown and citations the flat CSV
/// cannot carry.
pub fn render_sidecar(booking: &Booking) -> String {
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
    let citations: Vec<String> = booking.citations.iter().map(|c| c.display()).collect();

    let value = json!({
        "booking_id": booking.id.to_string(),
        "client_id": booking.client_id,
        "doc_class": booking.doc_class.as_str(),
        "posting_date": booking.posting_date.map(|d| d.format("%Y-%m-%d").to_string()),
        "vat": vat,
        "citations": citations,
    });
    crate::canonical::canonical_json(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookingStatus, DocClass, Entry, VatLine};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn booking() -> Booking {
        Booking {
            id: Uuid::parse_str("3e1c2f60-0000-4000-8000-0000000000aa").unwrap(),
            client_id: "K1".into(),
            source: None,
            doc_class: DocClass::InvoiceIn,
            entries: vec![
                Entry::debit("4000", dec("1000.00"), "EUR"),
                Entry::credit("2200", dec("1000.00"), "EUR"),
            ],
            vat_breakdown: vec![VatLine {
                rate: 25,
                base: dec("800.00"),
                amount: dec("200.00"),
                currency: "EUR".into(),
            }],
            posting_date: chrono::NaiveDate::from_ymd_opt(2026, 3, 2),
            narrative: "Račun; s točka-zarezom".into(),
            citations: vec![],
            status: BookingStatus::Approved,
            proposed_by: "pipeline".into(),
            approved_by: Some("ana".into()),
            corrected_from: None,
            created_at: "2026-03-02T08:00:00Z".into(),
            finalized_at: None,
            fingerprint: "fp".into(),
            verification: serde_json::json!({}),
            blockers: vec![],
        }
    }

    #[test]
    fn csv_is_byte_stable_with_header() {
        let b = booking();
        let a = render(&b);
        assert_eq!(a, render(&b));
        assert!(a.starts_with(HEADER));
        assert_eq!(a.lines().count(), 3);
    }

    #[test]
    fn separator_in_narrative_is_quoted() {
        let csv = render(&booking());
        assert!(csv.contains("\"Račun; s točka-zarezom\""));
    }

    #[test]
    fn sidecar_is_canonical_json() {
        let sidecar = render_sidecar(&booking());
        let parsed: serde_json::Value = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(parsed["vat"][0]["amount"], "200.00");
        // Canonical: keys sorted, no whitespace.
        assert!(!sidecar.contains(": "));
    }
}
