//! Monetary values and FX lookup.
//!
//! Every amount that crosses a component boundary is a `rust_decimal::Decimal`
//! carried with its ISO 4217 currency code. Conversion between text and
//! decimal is lossless; binary floats never hold money.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

/// Tolerance for monetary rule checks in home currency.
pub const HOME_TOLERANCE: &str = "0.01";
/// Tolerance for monetary rule checks after FX conversion.
pub const FX_TOLERANCE: &str = "0.02";

/// VAT rates in force (percent). The zero rate covers exemptions and
/// reverse-charge lines.
pub const VAT_RATES: &[u32] = &[25, 13, 5, 0];

#[derive(Debug, thiserror::Error)]
pub enum MoneyError {
    #[error("unparseable amount: {0}")]
    Unparseable(String),
    #[error("unknown currency code: {0}")]
    UnknownCurrency(String),
}

/// An amount in a specific currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
}

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Self {
        Self {
            amount,
            currency: currency.to_string(),
        }
    }

    /// Canonical 2-decimal-place text form used in exports and fingerprints.
    pub fn canonical(&self) -> String {
        format_amount(&self.amount)
    }
}

/// Parse a decimal from canonical (dot-separated) text.
pub fn parse_decimal(s: &str) -> Result<Decimal, MoneyError> {
    s.trim()
        .parse::<Decimal>()
        .map_err(|_| MoneyError::Unparseable(s.to_string()))
}

/// Render an amount with exactly two decimal places.
pub fn format_amount(d: &Decimal) -> String {
    let mut v = d.round_dp(2);
    v.rescale(2);
    v.to_string()
}

/// Tolerance helpers; the constants are canonical text.
pub fn home_tolerance() -> Decimal {
    HOME_TOLERANCE.parse().expect("constant")
}

pub fn fx_tolerance() -> Decimal {
    FX_TOLERANCE.parse().expect("constant")
}

/// Whether two amounts agree within the given tolerance.
pub fn amounts_agree(a: &Decimal, b: &Decimal, tolerance: &Decimal) -> bool {
    (*a - *b).abs() <= *tolerance
}

/// Currency codes accepted on ingest. Anything else is an input error,
/// not a silent passthrough.
pub fn is_known_currency(code: &str) -> bool {
    matches!(
        code,
        "EUR" | "USD" | "GBP" | "CHF" | "SEK" | "NOK" | "DKK" | "PLN" | "CZK" | "HUF" | "BAM" | "RSD"
    )
}

// ── FX rates ────────────────────────────────────────────────

/// Mid-rate for one currency on one date, as published by the central bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxRate {
    pub currency: String,
    pub rate_date: NaiveDate,
    #[serde(with = "rust_decimal::serde::str")]
    pub mid_rate: Decimal,
}

/// Store a published mid-rate. Idempotent per (currency, date).
pub fn upsert_fx_rate(conn: &Connection, rate: &FxRate) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO fx_rates (currency, rate_date, mid_rate) VALUES (?1, ?2, ?3)
         ON CONFLICT(currency, rate_date) DO UPDATE SET mid_rate = excluded.mid_rate",
        params![
            rate.currency,
            rate.rate_date.format("%Y-%m-%d").to_string(),
            rate.mid_rate.to_string()
        ],
    )?;
    Ok(())
}

/// Rate in effect on `date`: the newest published rate on or before `date`,
/// looking back at most 5 calendar days (weekends and holidays have no
/// publication). `None` means the booking cannot auto-advance.
pub fn rate_in_effect(
    conn: &Connection,
    currency: &str,
    date: NaiveDate,
) -> Result<Option<FxRate>, DatabaseError> {
    let floor = date - chrono::Duration::days(5);
    let row = conn
        .query_row(
            "SELECT currency, rate_date, mid_rate FROM fx_rates
             WHERE currency = ?1 AND rate_date <= ?2 AND rate_date >= ?3
             ORDER BY rate_date DESC LIMIT 1",
            params![
                currency,
                date.format("%Y-%m-%d").to_string(),
                floor.format("%Y-%m-%d").to_string()
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((currency, date_str, rate_str)) => {
            let rate_date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").map_err(|_| {
                DatabaseError::InvalidEnum {
                    field: "rate_date".into(),
                    value: date_str,
                }
            })?;
            let mid_rate = rate_str.parse::<Decimal>().map_err(|_| {
                DatabaseError::InvalidEnum {
                    field: "mid_rate".into(),
                    value: rate_str,
                }
            })?;
            Ok(Some(FxRate {
                currency,
                rate_date,
                mid_rate,
            }))
        }
    }
}

/// Convert into home currency at the given mid-rate, rounded to 2 dp.
pub fn convert_to_home(amount: &Decimal, rate: &FxRate) -> Decimal {
    (*amount * rate.mid_rate).round_dp(2)
}
