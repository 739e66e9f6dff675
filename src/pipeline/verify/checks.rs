//! Deterministic rule checks: identifier checksums and monetary
//! identities. These are the third leg of every field's verification and
//! the only leg that can never come from a model.

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use std::sync::OnceLock;

use crate::money::VAT_RATES;

/// OIB check digit per ISO 7064, MOD 11,10.
pub fn validate_oib(oib: &str) -> bool {
    if oib.len() != 11 || !oib.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let mut a: u32 = 10;
    for digit in oib[..10].chars() {
        a = (a + digit.to_digit(10).expect("digit")) % 10;
        if a == 0 {
            a = 10;
        }
        a = (a * 2) % 11;
    }
    let mut control = 11 - a;
    if control == 10 {
        control = 0;
    }
    control == oib[10..].chars().next().expect("digit").to_digit(10).expect("digit")
}

/// IBAN mod-97 check (ISO 13616).
pub fn validate_iban(iban: &str) -> bool {
    let iban = iban.replace(' ', "").to_uppercase();
    if iban.len() < 15 || iban.len() > 34 {
        return false;
    }
    if !iban.chars().all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }

    let rearranged = format!("{}{}", &iban[4..], &iban[..4]);
    let mut remainder: u32 = 0;
    for c in rearranged.chars() {
        let value = if c.is_ascii_digit() {
            c.to_digit(10).expect("digit")
        } else {
            c as u32 - 'A' as u32 + 10
        };
        remainder = if value < 10 {
            (remainder * 10 + value) % 97
        } else {
            (remainder * 100 + value) % 97
        };
    }
    remainder == 1
}

/// EU VAT identifier syntax: two-letter member state prefix plus the
/// national pattern length band. Syntax only; registry lookups are an
/// outbound call this system does not make.
pub fn validate_eu_vat_id(vat_id: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Z]{2}[0-9A-Z+*]{2,12}$").expect("static regex"));
    let v = vat_id.replace(' ', "").to_uppercase();
    if !re.is_match(&v) {
        return false;
    }
    // HR VAT ids embed an OIB; check it fully.
    if let Some(oib) = v.strip_prefix("HR") {
        return validate_oib(oib);
    }
    true
}

/// `net + vat = gross` within tolerance.
pub fn vat_identity_holds(
    net: &Decimal,
    vat: &Decimal,
    gross: &Decimal,
    tolerance: &Decimal,
) -> bool {
    ((*net + *vat) - *gross).abs() <= *tolerance
}

/// VAT recomputed from net × rate matches the extracted VAT.
pub fn vat_matches_rate(
    net: &Decimal,
    vat: &Decimal,
    rate_percent: u32,
    tolerance: &Decimal,
) -> bool {
    let computed = (*net * Decimal::from(rate_percent) / Decimal::from(100)).round_dp(2);
    (computed - *vat).abs() <= *tolerance
}

pub fn is_valid_vat_rate(rate: u32) -> bool {
    VAT_RATES.contains(&rate)
}

/// A business-event date plausible for a live bookkeeping office:
/// no more than five years back, no more than one year ahead.
pub fn date_in_plausible_range(date: NaiveDate, today: NaiveDate) -> bool {
    let floor = today - chrono::Duration::days(5 * 365);
    let ceil = today + chrono::Duration::days(365);
    date >= floor && date <= ceil
}

/// Positive, at most two decimal places. The fallback monetary rule when
/// no identity can be formed.
pub fn amount_is_sane(amount: &Decimal) -> bool {
    *amount > Decimal::ZERO && amount.scale() <= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn known_good_oib_passes() {
        // Test OIB with a valid ISO 7064 check digit.
        assert!(validate_oib("12345678903"));
        assert!(validate_oib("00000000001"));
    }

    #[test]
    fn bad_oib_check_digit_fails() {
        assert!(!validate_oib("12345678900"));
        assert!(!validate_oib("12345678901"));
    }

    #[test]
    fn oib_shape_enforced() {
        assert!(!validate_oib("1234567890"));
        assert!(!validate_oib("123456789012"));
        assert!(!validate_oib("1234567890a"));
        assert!(!validate_oib(""));
    }

    #[test]
    fn iban_mod97() {
        assert!(validate_iban("HR1210010051863000160"));
        assert!(validate_iban("DE89370400440532013000"));
        assert!(validate_iban("HR12 1001 0051 8630 0016 0"));

        assert!(!validate_iban("HR1210010051863000161"));
        assert!(!validate_iban("HR12"));
        assert!(!validate_iban("XX00!!"));
    }

    #[test]
    fn eu_vat_id_syntax() {
        assert!(validate_eu_vat_id("DE123456789"));
        assert!(validate_eu_vat_id("ATU12345678"));
        assert!(validate_eu_vat_id("HR12345678903"));

        assert!(!validate_eu_vat_id("HR12345678900")); // embedded OIB fails checksum
        assert!(!validate_eu_vat_id("D1"));
        assert!(!validate_eu_vat_id("123456789"));
    }

    #[test]
    fn vat_identity_with_tolerance() {
        let t = dec("0.01");
        assert!(vat_identity_holds(&dec("1000.00"), &dec("250.00"), &dec("1250.00"), &t));
        assert!(vat_identity_holds(&dec("1000.00"), &dec("250.00"), &dec("1250.01"), &t));
        assert!(!vat_identity_holds(&dec("1000.00"), &dec("250.00"), &dec("1250.02"), &t));
    }

    #[test]
    fn vat_rate_recompute() {
        let t = dec("0.01");
        assert!(vat_matches_rate(&dec("1000.00"), &dec("250.00"), 25, &t));
        assert!(vat_matches_rate(&dec("77.77"), &dec("19.44"), 25, &t));
        assert!(!vat_matches_rate(&dec("1000.00"), &dec("130.00"), 25, &t));
    }

    #[test]
    fn rate_catalog() {
        for r in [25, 13, 5, 0] {
            assert!(is_valid_vat_rate(r));
        }
        assert!(!is_valid_vat_rate(19));
    }

    #[test]
    fn date_plausibility() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(date_in_plausible_range(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), today));
        assert!(date_in_plausible_range(NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(), today));
        assert!(!date_in_plausible_range(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(), today));
        assert!(!date_in_plausible_range(NaiveDate::from_ymd_opt(2028, 1, 1).unwrap(), today));
    }

    #[test]
    fn amount_sanity() {
        assert!(amount_is_sane(&dec("0.01")));
        assert!(amount_is_sane(&dec("1250.00")));
        assert!(!amount_is_sane(&dec("0")));
        assert!(!amount_is_sane(&dec("-5.00")));
        assert!(!amount_is_sane(&dec("1.005")));
    }
}
