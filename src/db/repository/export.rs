use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;

/// Receipt of a delivered export artifact. One per booking, ever.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExportReceipt {
    pub booking_id: Uuid,
    pub target: String,
    pub filename: String,
    pub bytes_hash: String,
    pub delivered_at: String,
}

pub fn insert_receipt(conn: &Connection, receipt: &ExportReceipt) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO export_receipts (booking_id, target, filename, bytes_hash, delivered_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            receipt.booking_id.to_string(),
            receipt.target,
            receipt.filename,
            receipt.bytes_hash,
            receipt.delivered_at
        ],
    )?;
    Ok(())
}

pub fn get_receipt(
    conn: &Connection,
    booking_id: &Uuid,
) -> Result<Option<ExportReceipt>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT booking_id, target, filename, bytes_hash, delivered_at
             FROM export_receipts WHERE booking_id = ?1",
            params![booking_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((booking_id, target, filename, bytes_hash, delivered_at)) => {
            let booking_id =
                Uuid::parse_str(&booking_id).map_err(|_| DatabaseError::InvalidEnum {
                    field: "export_receipts.booking_id".into(),
                    value: booking_id,
                })?;
            Ok(Some(ExportReceipt {
                booking_id,
                target,
                filename,
                bytes_hash,
                delivered_at,
            }))
        }
    }
}
