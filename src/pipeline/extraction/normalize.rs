//! Text, number, and date normalization applied before any field
//! comparison. All text goes to NFC; amounts accept the EU and the
//! anglophone separator conventions; ambiguous dates are reported as
//! ambiguous rather than guessed.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use unicode_normalization::UnicodeNormalization;

/// NFC-normalize and collapse whitespace runs.
pub fn normalize_text(s: &str) -> String {
    let nfc: String = s.nfc().collect();
    nfc.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Map currency symbols and common aliases to ISO codes.
pub fn normalize_currency(raw: &str) -> Option<String> {
    let t = raw.trim();
    let code = match t {
        "€" => "EUR",
        "$" => "USD",
        "£" => "GBP",
        _ => {
            let upper = t.to_uppercase();
            return if crate::money::is_known_currency(&upper) {
                Some(upper)
            } else {
                None
            };
        }
    };
    Some(code.to_string())
}

/// Parse an amount written in either locale convention:
/// `1.234,56` / `1 234,56` (EU) or `1,234.56` (anglophone) or plain
/// `1234.56`. Returns `None` when the shape is not a number.
pub fn parse_locale_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{00a0}')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let digits_ok = cleaned
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == ',' || c == '-');
    if !digits_ok {
        return None;
    }

    let has_dot = cleaned.contains('.');
    let has_comma = cleaned.contains(',');

    let canonical = match (has_dot, has_comma) {
        (true, true) => {
            // The later separator is the decimal mark.
            let last_dot = cleaned.rfind('.').expect("has dot");
            let last_comma = cleaned.rfind(',').expect("has comma");
            if last_comma > last_dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (false, true) => {
            // One comma followed by exactly two digits reads as decimal;
            // anything else is a thousands separator.
            let last_comma = cleaned.rfind(',').expect("has comma");
            let tail = cleaned.len() - last_comma - 1;
            if cleaned.matches(',').count() == 1 && tail == 2 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (true, false) => {
            let last_dot = cleaned.rfind('.').expect("has dot");
            let tail = cleaned.len() - last_dot - 1;
            if cleaned.matches('.').count() == 1 && tail <= 2 {
                cleaned
            } else {
                cleaned.replace('.', "")
            }
        }
        (false, false) => cleaned,
    };

    canonical.parse::<Decimal>().ok()
}

/// A parsed date and whether the source notation was ambiguous
/// (day/month both ≤ 12 in a slash notation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDate {
    pub date: NaiveDate,
    pub ambiguous: bool,
}

/// Parse the date notations seen on Croatian and EU documents.
/// `day_first` is the document-class resolution hint for slash dates.
pub fn parse_date(raw: &str, day_first: bool) -> Option<ParsedDate> {
    let t = raw.trim().trim_end_matches('.');

    if let Ok(date) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(ParsedDate { date, ambiguous: false });
    }
    // Croatian notation `02.03.2026` (with or without trailing dot) is
    // always day-first.
    if let Ok(date) = NaiveDate::parse_from_str(t, "%d.%m.%Y") {
        return Some(ParsedDate { date, ambiguous: false });
    }

    // Slash notation: 03/04/2026 could be either convention.
    let parts: Vec<&str> = t.split('/').collect();
    if parts.len() == 3 {
        let a: u32 = parts[0].parse().ok()?;
        let b: u32 = parts[1].parse().ok()?;
        let year: i32 = parts[2].parse().ok()?;

        let (day, month) = if day_first { (a, b) } else { (b, a) };
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let ambiguous = a <= 12 && b <= 12 && a != b;
        return Some(ParsedDate { date, ambiguous });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn nfc_and_whitespace_normalization() {
        // Decomposed č normalizes to composed form.
        assert_eq!(normalize_text("rac\u{030c}un  \t br."), "račun br.");
    }

    #[test]
    fn eu_amounts() {
        assert_eq!(parse_locale_amount("1.234,56"), Some(dec("1234.56")));
        assert_eq!(parse_locale_amount("1 000,00"), Some(dec("1000.00")));
        assert_eq!(parse_locale_amount("12,50"), Some(dec("12.50")));
    }

    #[test]
    fn anglophone_amounts() {
        assert_eq!(parse_locale_amount("1,234.56"), Some(dec("1234.56")));
        assert_eq!(parse_locale_amount("1000.00"), Some(dec("1000.00")));
    }

    #[test]
    fn bare_and_thousands_only() {
        assert_eq!(parse_locale_amount("1250"), Some(dec("1250")));
        // `1.000` reads as one thousand, not one-with-three-decimals.
        assert_eq!(parse_locale_amount("1.000"), Some(dec("1000")));
        assert_eq!(parse_locale_amount("1,000"), Some(dec("1000")));
        assert_eq!(parse_locale_amount("1.000.000"), Some(dec("1000000")));
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(parse_locale_amount("n/a"), None);
        assert_eq!(parse_locale_amount(""), None);
        assert_eq!(parse_locale_amount("12a4"), None);
    }

    #[test]
    fn currency_symbols_mapped() {
        assert_eq!(normalize_currency("€").as_deref(), Some("EUR"));
        assert_eq!(normalize_currency("eur").as_deref(), Some("EUR"));
        assert_eq!(normalize_currency("USD").as_deref(), Some("USD"));
        assert_eq!(normalize_currency("XYZ"), None);
    }

    #[test]
    fn croatian_dates_are_day_first() {
        let p = parse_date("02.03.2026.", true).unwrap();
        assert_eq!(p.date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert!(!p.ambiguous);
    }

    #[test]
    fn iso_dates_never_ambiguous() {
        let p = parse_date("2026-03-02", false).unwrap();
        assert_eq!(p.date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert!(!p.ambiguous);
    }

    #[test]
    fn slash_dates_flagged_when_ambiguous() {
        let p = parse_date("03/04/2026", true).unwrap();
        assert_eq!(p.date, NaiveDate::from_ymd_opt(2026, 4, 3).unwrap());
        assert!(p.ambiguous);

        // Day > 12 disambiguates itself.
        let q = parse_date("25/04/2026", true).unwrap();
        assert_eq!(q.date, NaiveDate::from_ymd_opt(2026, 4, 25).unwrap());
        assert!(!q.ambiguous);
    }

    #[test]
    fn slash_dates_respect_hint() {
        let p = parse_date("03/04/2026", false).unwrap();
        assert_eq!(p.date, NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());
        assert!(p.ambiguous);
    }
}
