//! ERP export (C9): deterministic artifacts, exactly-once delivery.
//!
//! A successful export inserts the receipt and moves the booking to
//! `EXPORTED` in one transaction; calling export again returns the
//! stored receipt without touching the target. Transient delivery
//! faults retry with capped backoff and then surface as `Pending`,
//! leaving the booking `APPROVED`; schema-level rejections block the
//! booking with the validator diagnostic in the audit trail.

pub mod csv_target;
pub mod xml_target;

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::audit;
use crate::canonical::hex_encode;
use crate::config::{ExportKind, ExportTarget};
use crate::db::repository::{self, ExportReceipt};
use crate::db::DatabaseError;
use crate::models::{Booking, BookingStatus};
use crate::pipeline::booking::{in_transaction, BookingPipeline, PipelineError};

const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("booking not found: {0}")]
    NotFound(Uuid),
    #[error("booking is {current:?}, not exportable")]
    NotExportable { current: BookingStatus },
    #[error("unknown export target: {0}")]
    UnknownTarget(String),
    #[error("delivery still pending after {attempts} attempts: {reason}")]
    Pending { attempts: u32, reason: String },
    #[error("artifact rejected by target schema: {0}")]
    Permanent(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Pre-delivery validation mirroring what the receiving ERP enforces.
fn validate_artifact(booking: &Booking) -> Result<(), ExportError> {
    if booking.entries.is_empty() {
        return Err(ExportError::Permanent("booking has no ledger lines".into()));
    }
    if !booking.is_balanced() {
        return Err(ExportError::Permanent("debits and credits differ".into()));
    }
    if booking.posting_date.is_none() {
        return Err(ExportError::Permanent("posting date missing".into()));
    }
    Ok(())
}

/// Render the artifact for a target. Deterministic: stable key order,
/// fixed decimal scale, ISO dates.
pub fn render_artifact(booking: &Booking, kind: &ExportKind) -> (String, Vec<u8>) {
    match kind {
        ExportKind::XmlFile | ExportKind::Http => {
            let filename = format!("{}_{}.xml", booking.client_id, booking.id);
            (filename, xml_target::render(booking).into_bytes())
        }
        ExportKind::CsvFile => {
            let filename = format!("{}_{}.csv", booking.client_id, booking.id);
            let mut bytes = csv_target::render(booking).into_bytes();
            bytes.extend_from_slice(b"\n");
            bytes.extend_from_slice(csv_target::render_sidecar(booking).as_bytes());
            bytes.extend_from_slice(b"\n");
            (filename, bytes)
        }
    }
}

async fn deliver(
    target: &ExportTarget,
    filename: &str,
    bytes: &[u8],
) -> Result<(), ExportError> {
    match target.kind {
        ExportKind::XmlFile | ExportKind::CsvFile => {
            let dir = Path::new(&target.dest);
            std::fs::create_dir_all(dir)
                .map_err(|e| ExportError::Pending { attempts: 0, reason: e.to_string() })?;
            let path = dir.join(filename);
            let tmp = path.with_extension("part");
            std::fs::write(&tmp, bytes)
                .and_then(|_| std::fs::rename(&tmp, &path))
                .map_err(|e| ExportError::Pending { attempts: 0, reason: e.to_string() })?;
            Ok(())
        }
        ExportKind::Http => {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| ExportError::Pending { attempts: 0, reason: e.to_string() })?;
            let response = client
                .post(&target.dest)
                .header("Content-Type", "application/xml")
                .header("X-Filename", filename)
                .body(bytes.to_vec())
                .send()
                .await
                .map_err(|e| ExportError::Pending { attempts: 0, reason: e.to_string() })?;

            if response.status().is_success() {
                Ok(())
            } else if response.status().is_client_error() {
                Err(ExportError::Permanent(format!(
                    "target rejected artifact: {}",
                    response.status()
                )))
            } else {
                Err(ExportError::Pending {
                    attempts: 0,
                    reason: format!("target returned {}", response.status()),
                })
            }
        }
    }
}

/// Export one approved booking to a named target, exactly once.
pub async fn export_booking(
    pipeline: &BookingPipeline,
    target_name: &str,
    booking_id: Uuid,
    actor: &str,
) -> Result<ExportReceipt, ExportError> {
    let target = pipeline
        .config()
        .export_targets
        .get(target_name)
        .cloned()
        .ok_or_else(|| ExportError::UnknownTarget(target_name.to_string()))?;

    let lock = pipeline.lock_for(booking_id).await;
    let _guard = lock.lock().await;

    let conn = pipeline.database().open()?;
    let mut booking = repository::get_booking(&conn, &booking_id)?
        .ok_or(ExportError::NotFound(booking_id))?;

    // Repeat call: the receipt is the answer, no second delivery.
    if let Some(receipt) = repository::get_receipt(&conn, &booking_id)? {
        return Ok(receipt);
    }

    if booking.status != BookingStatus::Approved {
        return Err(ExportError::NotExportable {
            current: booking.status,
        });
    }

    if let Err(e) = validate_artifact(&booking) {
        // Schema violations escalate to BLOCKED with the diagnostic.
        let reason = e.to_string();
        pipeline.transition(
            &conn,
            &mut booking,
            BookingStatus::Blocked,
            actor,
            json!({ "export_target": target_name, "validator": reason }),
        )?;
        return Err(e);
    }

    let (filename, bytes) = render_artifact(&booking, &target.kind);
    let bytes_hash = hex_encode(&Sha256::digest(&bytes));

    let mut last_reason = String::new();
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match deliver(&target, &filename, &bytes).await {
            Ok(()) => {
                let receipt = ExportReceipt {
                    booking_id,
                    target: target_name.to_string(),
                    filename: filename.clone(),
                    bytes_hash: bytes_hash.clone(),
                    delivered_at: chrono::Utc::now().to_rfc3339(),
                };

                // Receipt insert and terminal transition share one
                // transaction: the exactly-once boundary.
                let receipt_clone = receipt.clone();
                in_transaction(&conn, || {
                    repository::insert_receipt(&conn, &receipt_clone)
                        .map_err(PipelineError::from)?;
                    booking.status = BookingStatus::Exported;
                    booking.finalized_at = Some(chrono::Utc::now().to_rfc3339());
                    repository::update_booking(&conn, &booking).map_err(PipelineError::from)?;
                    audit::append(
                        &conn,
                        actor,
                        audit::kind::EXPORT_RECEIPT,
                        &booking_id.to_string(),
                        json!({
                            "target": receipt_clone.target,
                            "filename": receipt_clone.filename,
                            "bytes_hash": receipt_clone.bytes_hash,
                        }),
                    )
                    .map_err(PipelineError::from)?;
                    Ok(())
                })?;

                tracing::info!(booking_id = %booking_id, target = target_name, "Booking exported");
                return Ok(receipt);
            }
            Err(ExportError::Permanent(reason)) => {
                pipeline.transition(
                    &conn,
                    &mut booking,
                    BookingStatus::Blocked,
                    actor,
                    json!({ "export_target": target_name, "validator": reason }),
                )?;
                audit::append(
                    &conn,
                    actor,
                    audit::kind::EXPORT_FAILED,
                    &booking_id.to_string(),
                    json!({ "target": target_name, "reason": reason, "permanent": true }),
                )
                .map_err(PipelineError::from)?;
                return Err(ExportError::Permanent(reason));
            }
            Err(ExportError::Pending { reason, .. }) => {
                last_reason = reason;
                if attempt < MAX_DELIVERY_ATTEMPTS {
                    tokio::time::sleep(RETRY_BASE * attempt).await;
                }
            }
            Err(other) => return Err(other),
        }
    }

    // Out of attempts: booking stays APPROVED for a later run.
    audit::append(
        &conn,
        actor,
        audit::kind::EXPORT_FAILED,
        &booking_id.to_string(),
        json!({ "target": target_name, "reason": last_reason, "permanent": false }),
    )
    .map_err(PipelineError::from)?;
    Err(ExportError::Pending {
        attempts: MAX_DELIVERY_ATTEMPTS,
        reason: last_reason,
    })
}

/// Export every approved booking of one client. Partial failures do not
/// stop the batch; the caller receives receipts for what succeeded.
pub async fn export_client(
    pipeline: &BookingPipeline,
    target_name: &str,
    client_id: &str,
    actor: &str,
) -> Result<Vec<ExportReceipt>, ExportError> {
    let approved: Vec<Uuid> = {
        let conn = pipeline.database().open()?;
        repository::list_bookings(&conn, Some(BookingStatus::Approved), Some(client_id))?
            .into_iter()
            .map(|s| s.id)
            .collect()
    };

    let mut receipts = Vec::new();
    for booking_id in approved {
        match export_booking(pipeline, target_name, booking_id, actor).await {
            Ok(receipt) => receipts.push(receipt),
            Err(e) => {
                tracing::warn!(booking_id = %booking_id, error = %e, "Export skipped in batch");
            }
        }
    }
    Ok(receipts)
}
