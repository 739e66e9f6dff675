//! Deterministic XML artifact for the XML-file ERP target.
//!
//! Built by string assembly with a fixed element order, fixed two-place
//! decimal formatting, and ISO dates, so the same booking always
//! produces byte-identical output.

use crate::models::Booking;
use crate::money::format_amount;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn render(booking: &Booking) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<Temeljnica>\n");
    xml.push_str(&format!("  <Id>{}</Id>\n", booking.id));
    xml.push_str(&format!("  <Klijent>{}</Klijent>\n", escape(&booking.client_id)));
    xml.push_str(&format!("  <Vrsta>{}</Vrsta>\n", booking.doc_class.as_str()));
    if let Some(date) = booking.posting_date {
        xml.push_str(&format!("  <Datum>{}</Datum>\n", date.format("%Y-%m-%d")));
    }
    xml.push_str(&format!("  <Opis>{}</Opis>\n", escape(&booking.narrative)));

    xml.push_str("  <Stavke>\n");
    for entry in &booking.entries {
        let side = match entry.side {
            crate::models::Side::Debit => "duguje",
            crate::models::Side::Credit => "potrazuje",
        };
        xml.push_str(&format!(
            "    <Stavka konto=\"{}\" strana=\"{}\" iznos=\"{}\" valuta=\"{}\"/>\n",
            escape(&entry.account),
            side,
            format_amount(&entry.amount),
            escape(&entry.currency),
        ));
    }
    xml.push_str("  </Stavke>\n");

    xml.push_str("  <Pdv>\n");
    for line in &booking.vat_breakdown {
        xml.push_str(&format!(
            "    <Stopa posto=\"{}\" osnovica=\"{}\" iznos=\"{}\" valuta=\"{}\"/>\n",
            line.rate,
            format_amount(&line.base),
            format_amount(&line.amount),
            escape(&line.currency),
        ));
    }
    xml.push_str("  </Pdv>\n");

    for citation in &booking.citations {
        xml.push_str(&format!(
            "  <Propis>{}</Propis>\n",
            escape(&citation.display())
        ));
    }

    xml.push_str("</Temeljnica>\n");
    xml
}
