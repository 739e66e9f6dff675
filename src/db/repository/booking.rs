use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::{Booking, BookingStatus, CitationRef, DocClass, Entry, VatLine};

fn json_field<T: serde::de::DeserializeOwned>(
    field: &'static str,
    raw: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|_| DatabaseError::InvalidEnum {
        field: field.into(),
        value: raw.chars().take(80).collect(),
    })
}

pub fn insert_booking(conn: &Connection, booking: &Booking) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO bookings (id, client_id, source_blob, doc_class, status, entries,
             vat_breakdown, posting_date, narrative, citations, verification, blockers,
             proposed_by, approved_by, corrected_from, created_at, finalized_at, fingerprint)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            booking.id.to_string(),
            booking.client_id,
            booking.source,
            booking.doc_class.as_str(),
            booking.status.as_str(),
            serde_json::to_string(&booking.entries).expect("entries serialize"),
            serde_json::to_string(&booking.vat_breakdown).expect("vat serialize"),
            booking.posting_date.map(|d| d.format("%Y-%m-%d").to_string()),
            booking.narrative,
            serde_json::to_string(&booking.citations).expect("citations serialize"),
            booking.verification.to_string(),
            serde_json::to_string(&booking.blockers).expect("blockers serialize"),
            booking.proposed_by,
            booking.approved_by,
            booking.corrected_from.map(|u| u.to_string()),
            booking.created_at,
            booking.finalized_at,
            booking.fingerprint,
        ],
    )?;
    Ok(())
}

/// Rewrite a non-terminal booking row. The service layer guarantees the
/// stored status allows the transition before calling this.
pub fn update_booking(conn: &Connection, booking: &Booking) -> Result<(), DatabaseError> {
    let n = conn.execute(
        "UPDATE bookings SET status = ?2, entries = ?3, vat_breakdown = ?4, posting_date = ?5,
             narrative = ?6, citations = ?7, verification = ?8, blockers = ?9,
             approved_by = ?10, finalized_at = ?11, fingerprint = ?12
         WHERE id = ?1",
        params![
            booking.id.to_string(),
            booking.status.as_str(),
            serde_json::to_string(&booking.entries).expect("entries serialize"),
            serde_json::to_string(&booking.vat_breakdown).expect("vat serialize"),
            booking.posting_date.map(|d| d.format("%Y-%m-%d").to_string()),
            booking.narrative,
            serde_json::to_string(&booking.citations).expect("citations serialize"),
            booking.verification.to_string(),
            serde_json::to_string(&booking.blockers).expect("blockers serialize"),
            booking.approved_by,
            booking.finalized_at,
            booking.fingerprint,
        ],
    )?;
    if n == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "booking".into(),
            id: booking.id.to_string(),
        });
    }
    Ok(())
}

pub fn get_booking(conn: &Connection, id: &Uuid) -> Result<Option<Booking>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, client_id, source_blob, doc_class, status, entries, vat_breakdown,
                    posting_date, narrative, citations, verification, blockers, proposed_by,
                    approved_by, corrected_from, created_at, finalized_at, fingerprint
             FROM bookings WHERE id = ?1",
            params![id.to_string()],
            row_to_parts,
        )
        .optional()?;

    row.map(parts_to_booking).transpose()
}

/// Summary for list views, without entry details.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BookingSummary {
    pub id: Uuid,
    pub client_id: String,
    pub doc_class: DocClass,
    pub status: BookingStatus,
    pub posting_date: Option<NaiveDate>,
    pub narrative: String,
    pub created_at: String,
}

pub fn list_bookings(
    conn: &Connection,
    status: Option<BookingStatus>,
    client: Option<&str>,
) -> Result<Vec<BookingSummary>, DatabaseError> {
    let mut sql = String::from(
        "SELECT id, client_id, doc_class, status, posting_date, narrative, created_at
         FROM bookings WHERE 1=1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(s) = status {
        binds.push(s.as_str().to_string());
        sql.push_str(&format!(" AND status = ?{}", binds.len()));
    }
    if let Some(c) = client {
        binds.push(c.to_string());
        sql.push_str(&format!(" AND client_id = ?{}", binds.len()));
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, client_id, doc_class, status, posting_date, narrative, created_at) in rows {
        out.push(BookingSummary {
            id: Uuid::parse_str(&id).map_err(|_| DatabaseError::InvalidEnum {
                field: "bookings.id".into(),
                value: id,
            })?,
            client_id,
            doc_class: DocClass::parse(&doc_class).ok_or(DatabaseError::InvalidEnum {
                field: "bookings.doc_class".into(),
                value: doc_class,
            })?,
            status: BookingStatus::parse(&status).ok_or(DatabaseError::InvalidEnum {
                field: "bookings.status".into(),
                value: status,
            })?,
            posting_date: posting_date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            narrative,
            created_at,
        });
    }
    Ok(out)
}

/// Dedup lookup: a live booking already created from the same blob for
/// the same client and document class.
pub fn find_existing_for_blob(
    conn: &Connection,
    client_id: &str,
    doc_class: DocClass,
    blob_id: &str,
) -> Result<Option<Uuid>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id FROM bookings
             WHERE client_id = ?1 AND doc_class = ?2 AND source_blob = ?3
               AND status NOT IN ('rejected', 'blocked')
             ORDER BY created_at ASC LIMIT 1",
            params![client_id, doc_class.as_str(), blob_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    Ok(row.and_then(|s| Uuid::parse_str(&s).ok()))
}

type BookingParts = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    String,
);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<BookingParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
    ))
}

fn parts_to_booking(parts: BookingParts) -> Result<Booking, DatabaseError> {
    let (
        id,
        client_id,
        source,
        doc_class,
        status,
        entries,
        vat_breakdown,
        posting_date,
        narrative,
        citations,
        verification,
        blockers,
        proposed_by,
        approved_by,
        corrected_from,
        created_at,
        finalized_at,
        fingerprint,
    ) = parts;

    let entries: Vec<Entry> = json_field("bookings.entries", &entries)?;
    let vat_breakdown: Vec<VatLine> = json_field("bookings.vat_breakdown", &vat_breakdown)?;
    let citations: Vec<CitationRef> = json_field("bookings.citations", &citations)?;
    let blockers: Vec<String> = json_field("bookings.blockers", &blockers)?;
    let verification: serde_json::Value =
        serde_json::from_str(&verification).unwrap_or(serde_json::Value::Null);

    Ok(Booking {
        id: Uuid::parse_str(&id).map_err(|_| DatabaseError::InvalidEnum {
            field: "bookings.id".into(),
            value: id,
        })?,
        client_id,
        source,
        doc_class: DocClass::parse(&doc_class).ok_or(DatabaseError::InvalidEnum {
            field: "bookings.doc_class".into(),
            value: doc_class,
        })?,
        status: BookingStatus::parse(&status).ok_or(DatabaseError::InvalidEnum {
            field: "bookings.status".into(),
            value: status,
        })?,
        entries,
        vat_breakdown,
        posting_date: posting_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
        narrative,
        citations,
        verification,
        blockers,
        proposed_by,
        approved_by,
        corrected_from: corrected_from.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        created_at,
        finalized_at,
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn sample(client: &str, blob: Option<&str>) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            client_id: client.into(),
            source: blob.map(String::from),
            doc_class: DocClass::InvoiceIn,
            entries: vec![
                Entry::debit("4000", dec("1000.00"), "EUR"),
                Entry::debit("1230", dec("250.00"), "EUR"),
                Entry::credit("2200", dec("1250.00"), "EUR"),
            ],
            vat_breakdown: vec![VatLine {
                rate: 25,
                base: dec("1000.00"),
                amount: dec("250.00"),
                currency: "EUR".into(),
            }],
            posting_date: NaiveDate::from_ymd_opt(2026, 3, 2),
            narrative: "Ulazni račun 14/1/1".into(),
            citations: vec![],
            status: BookingStatus::Proposed,
            proposed_by: "pipeline".into(),
            approved_by: None,
            corrected_from: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            finalized_at: None,
            fingerprint: "fp".into(),
            verification: serde_json::json!({"net": {"agreement": "3of3"}}),
            blockers: vec![],
        }
    }

    #[test]
    fn insert_get_round_trip_preserves_amounts() {
        let conn = open_memory_database().unwrap();
        let booking = sample("K1", Some("blob1"));
        insert_booking(&conn, &booking).unwrap();

        let loaded = get_booking(&conn, &booking.id).unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 3);
        assert_eq!(loaded.entries[0].amount, dec("1000.00"));
        assert_eq!(loaded.entries[2].amount, dec("1250.00"));
        assert_eq!(loaded.vat_breakdown[0].rate, 25);
        assert_eq!(loaded.status, BookingStatus::Proposed);
        assert!(loaded.is_balanced());
    }

    #[test]
    fn update_changes_status_and_approver() {
        let conn = open_memory_database().unwrap();
        let mut booking = sample("K1", None);
        insert_booking(&conn, &booking).unwrap();

        booking.status = BookingStatus::Approved;
        booking.approved_by = Some("ana".into());
        update_booking(&conn, &booking).unwrap();

        let loaded = get_booking(&conn, &booking.id).unwrap().unwrap();
        assert_eq!(loaded.status, BookingStatus::Approved);
        assert_eq!(loaded.approved_by.as_deref(), Some("ana"));
    }

    #[test]
    fn list_filters_by_status_and_client() {
        let conn = open_memory_database().unwrap();
        let a = sample("K1", None);
        let mut b = sample("K2", None);
        b.status = BookingStatus::NeedsReview;
        insert_booking(&conn, &a).unwrap();
        insert_booking(&conn, &b).unwrap();

        let proposed = list_bookings(&conn, Some(BookingStatus::Proposed), None).unwrap();
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].id, a.id);

        let k2 = list_bookings(&conn, None, Some("K2")).unwrap();
        assert_eq!(k2.len(), 1);
        assert_eq!(k2[0].id, b.id);
    }

    #[test]
    fn dedup_finds_live_booking_for_same_blob() {
        let conn = open_memory_database().unwrap();
        let booking = sample("K1", Some("blobX"));
        insert_booking(&conn, &booking).unwrap();

        let found =
            find_existing_for_blob(&conn, "K1", DocClass::InvoiceIn, "blobX").unwrap();
        assert_eq!(found, Some(booking.id));

        // Different client: no dedup.
        let other = find_existing_for_blob(&conn, "K2", DocClass::InvoiceIn, "blobX").unwrap();
        assert!(other.is_none());
    }

    #[test]
    fn dedup_ignores_rejected() {
        let conn = open_memory_database().unwrap();
        let mut booking = sample("K1", Some("blobY"));
        booking.status = BookingStatus::Rejected;
        insert_booking(&conn, &booking).unwrap();

        let found =
            find_existing_for_blob(&conn, "K1", DocClass::InvoiceIn, "blobY").unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn missing_booking_is_none() {
        let conn = open_memory_database().unwrap();
        assert!(get_booking(&conn, &Uuid::new_v4()).unwrap().is_none());
    }
}
