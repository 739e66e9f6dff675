//! Booking pipeline (C7): ingest → extract → verify → propose, the
//! per-booking state machine, and re-verification of corrections.
//!
//! Transitions commit atomically with their audit event. Per-booking
//! mutations serialize on a keyed async lock; the second of two racing
//! operators observes `StateConflict`.

pub mod accounts;
pub mod blockers;
pub mod builder;
pub mod fingerprint;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{self, AuditError};
use crate::blobstore::{BlobError, ContentStore};
use crate::config::Config;
use crate::db::repository;
use crate::db::{Database, DatabaseError};
use crate::inference::{GenerateRequest, InferKind, InferenceError, InferenceOrchestrator};
use crate::memory;
use crate::models::{Booking, BookingStatus, DocClass};
use crate::pipeline::extraction::{field, ExtractInput, ExtractionError, ExtractorRegistry};
use crate::pipeline::rag::{LawIndex, RagError};
use crate::pipeline::verify::{self, VerifiedDoc};

use self::blockers::Blocker;
use self::builder::{build_entries, classification_prompt, parse_classification, BuildError};

/// Consensus floor for auto-advance to `PROPOSED`.
const AUTO_ADVANCE_SCORE: f32 = 0.95;
/// Deadline for pipeline-internal inference calls.
const PIPELINE_INFER_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("booking not found: {0}")]
    NotFound(Uuid),
    #[error("state conflict: booking is {current:?}")]
    StateConflict { current: BookingStatus },
    #[error("operation not permitted for this role")]
    Forbidden,
    #[error("document could not be extracted: {0}")]
    Unextractable(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("ingest paused: inference queue saturated")]
    Overloaded,
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Rag(#[from] RagError),
    #[error(transparent)]
    Build(#[from] BuildError),
}

pub struct BookingPipeline {
    db: Database,
    blobs: ContentStore,
    registry: ExtractorRegistry,
    orchestrator: Arc<InferenceOrchestrator>,
    law_index: Arc<LawIndex>,
    config: Arc<Config>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl BookingPipeline {
    pub fn new(
        db: Database,
        blobs: ContentStore,
        registry: ExtractorRegistry,
        orchestrator: Arc<InferenceOrchestrator>,
        law_index: Arc<LawIndex>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            blobs,
            registry,
            orchestrator,
            law_index,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn blobs(&self) -> &ContentStore {
        &self.blobs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The single-writer lock for one booking.
    pub async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Store a document and run it through the pipeline. Returns the
    /// blob id and the booking id (existing one when the same blob was
    /// already ingested for this client and class).
    pub async fn ingest_document(
        &self,
        actor: &str,
        client_id: &str,
        doc_class: DocClass,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<(String, Uuid), PipelineError> {
        // Backpressure: ingest-triggered inference waits out saturation
        // rather than piling onto the queue.
        if self.orchestrator.is_saturated() {
            return Err(PipelineError::Overloaded);
        }

        let blob_id = self.blobs.put(bytes, media_type)?;
        let conn = self.db.open()?;

        if let Some(existing) =
            repository::find_existing_for_blob(&conn, client_id, doc_class, &blob_id)?
        {
            tracing::info!(blob_id = %blob_id, booking_id = %existing, "Duplicate ingest deduplicated");
            return Ok((blob_id, existing));
        }

        let booking = Booking {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            source: Some(blob_id.clone()),
            doc_class,
            entries: vec![],
            vat_breakdown: vec![],
            posting_date: None,
            narrative: String::new(),
            citations: vec![],
            status: BookingStatus::Ingested,
            proposed_by: "pipeline".into(),
            approved_by: None,
            corrected_from: None,
            created_at: Utc::now().to_rfc3339(),
            finalized_at: None,
            fingerprint: String::new(),
            verification: json!({}),
            blockers: vec![],
        };

        in_transaction(&conn, || {
            repository::insert_booking(&conn, &booking)?;
            audit::append(
                &conn,
                actor,
                audit::kind::DOCUMENT_INGESTED,
                &booking.id.to_string(),
                json!({
                    "blob_id": blob_id,
                    "client_id": client_id,
                    "doc_class": doc_class.as_str(),
                    "media_type": media_type,
                }),
            )?;
            Ok(())
        })?;
        drop(conn);

        let booking_id = booking.id;
        if let Err(e) = self.process(booking_id, actor).await {
            // Failures leave the booking where it stands, audited.
            tracing::warn!(booking_id = %booking_id, error = %e, "Pipeline run failed");
            let conn = self.db.open()?;
            audit::append(
                &conn,
                "pipeline",
                audit::kind::PIPELINE_FAILURE,
                &booking_id.to_string(),
                json!({ "error": e.to_string() }),
            )?;
        }

        Ok((blob_id, booking_id))
    }

    /// Advance one booking from `INGESTED` as far as verification and
    /// blockers allow.
    pub async fn process(&self, booking_id: Uuid, actor: &str) -> Result<BookingStatus, PipelineError> {
        let lock = self.lock_for(booking_id).await;
        let _guard = lock.lock().await;

        let conn = self.db.open()?;
        let mut booking = repository::get_booking(&conn, &booking_id)?
            .ok_or(PipelineError::NotFound(booking_id))?;
        if booking.status != BookingStatus::Ingested {
            return Err(PipelineError::StateConflict {
                current: booking.status,
            });
        }

        // ── Extract ─────────────────────────────────────────
        let blob_id = booking
            .source
            .clone()
            .ok_or_else(|| PipelineError::Validation("booking has no source blob".into()))?;
        let (bytes, meta) = self.blobs.get(&blob_id)?;

        let mut input = ExtractInput {
            blob_id: blob_id.clone(),
            media_type: meta.media_type.clone(),
            bytes,
            doc_class: booking.doc_class,
            ocr_text: None,
        };

        let fabric_output = match self.registry.extract(&input) {
            Ok(out) => out,
            Err(ExtractionError::Unextractable { diagnostics }) => {
                // Last resort: vision OCR through the orchestrator, then
                // one more pass over the tiers.
                match self.run_vision_ocr(&input).await {
                    Ok(transcript) => {
                        input.ocr_text = Some(transcript);
                        self.registry.extract(&input).map_err(|e| {
                            PipelineError::Unextractable(format!(
                                "{e}; earlier: {}",
                                diagnostics.join("; ")
                            ))
                        })?
                    }
                    Err(vision_err) => {
                        return Err(PipelineError::Unextractable(format!(
                            "{}; vision: {vision_err}",
                            diagnostics.join("; ")
                        )))
                    }
                }
            }
            Err(other) => return Err(PipelineError::Unextractable(other.to_string())),
        };

        self.transition(&conn, &mut booking, BookingStatus::Extracted, actor, json!({
            "tier": fabric_output.primary.source_tier.as_str(),
            "fields": fabric_output.primary.fields.len(),
            "shadows": fabric_output.shadows.len(),
        }))?;

        // ── Verify ──────────────────────────────────────────
        let today = Utc::now().date_naive();
        let verified = verify::verify_document(
            &fabric_output.primary,
            &fabric_output.shadows,
            &self.config.home_currency,
            today,
        );
        booking.verification =
            serde_json::to_value(&verified.verification).unwrap_or(json!({}));

        self.transition(&conn, &mut booking, BookingStatus::Verified, actor, json!({
            "gating_score": verified.gating_score(),
            "warnings": verified.warnings().len(),
        }))?;

        // ── Propose ─────────────────────────────────────────
        let posting_date = verified
            .doc
            .field(field::INVOICE_DATE)
            .and_then(|fv| fv.value.as_date())
            .unwrap_or(today);
        booking.posting_date = Some(posting_date);

        let supplier_id = verified
            .doc
            .field(field::SUPPLIER_OIB)
            .or_else(|| verified.doc.field(field::SUPPLIER_VAT_ID))
            .and_then(|fv| fv.value.as_text().map(String::from));

        // Legal context pinned to the posting date.
        let legal = self
            .law_index
            .search(&legal_query(booking.doc_class), posting_date, 3)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Legal retrieval unavailable");
                vec![]
            });

        // L2 suggestions for this client/supplier/class. The narrative
        // is the shared feature source for rule keys.
        booking.narrative = narrative_for(&verified, &booking);
        let features = memory::features_from_narrative(&booking.narrative);
        let feature_hash = memory::feature_hash(&features);
        let rule_key = memory::RuleKey {
            client_id: &booking.client_id,
            supplier_id: supplier_id.as_deref(),
            doc_class: booking.doc_class,
            feature_hash: &feature_hash,
        };
        let l2_rules = memory::suggest(&conn, &rule_key, Utc::now())?;

        // Model classification: account and VAT class only.
        let classification = if invoice_like(booking.doc_class) {
            let prompt = classification_prompt(&verified, Some(posting_date), &legal);
            match self
                .orchestrator
                .infer(
                    GenerateRequest {
                        kind: InferKind::Classify,
                        system: "Ti si knjigovodstveni klasifikator.".into(),
                        prompt,
                        max_tokens: 128,
                    },
                    PIPELINE_INFER_DEADLINE,
                )
                .await
            {
                Ok(completed) => parse_classification(&completed.text),
                Err(e) => {
                    // Inference faults leave the booking at VERIFIED for a
                    // later retry; the failure is audited by the caller.
                    tracing::warn!(booking_id = %booking.id, error = %e, "Classifier unavailable");
                    audit::append(
                        &conn,
                        "pipeline",
                        audit::kind::PIPELINE_FAILURE,
                        &booking.id.to_string(),
                        json!({ "stage": "classify", "error": e.to_string() }),
                    )?;
                    repository::update_booking(&conn, &booking)?;
                    return Ok(booking.status);
                }
            }
        } else {
            None
        };

        // Prefer a live L2 rule over the model when the model is silent.
        let classification = classification.or_else(|| {
            l2_rules.first().and_then(|scored| {
                scored.rule.suggested_accounts.first().map(|account| builder::Classification {
                    expense_account: account.clone(),
                    vat_class: scored.rule.vat_class.clone(),
                })
            })
        });

        // FX rate for cross-currency documents.
        let doc_currency = verified.doc.currency.clone();
        let fx_rate = if doc_currency != self.config.home_currency {
            crate::money::rate_in_effect(&conn, &doc_currency, posting_date)?
        } else {
            None
        };
        let cross_currency = doc_currency != self.config.home_currency;

        let built = build_entries(
            &verified,
            classification.as_ref(),
            &self.config.home_currency,
            fx_rate.as_ref(),
        )?;
        booking.entries = built.entries;
        booking.vat_breakdown = built.vat_breakdown;
        booking.citations = legal.iter().map(|c| c.citation.clone()).collect();

        let fx_ok = !cross_currency || built.fx_ok;
        let found_blockers = blockers::evaluate(
            &conn,
            &self.config,
            &booking,
            &verified,
            &l2_rules,
            classification.as_ref().map(|c| c.expense_account.as_str()),
            fx_ok,
        );
        booking.blockers = found_blockers.iter().map(Blocker::code).collect();
        booking.fingerprint = fingerprint::fingerprint(&booking);

        let next = if found_blockers.is_empty()
            && !verified.has_rejected_field()
            && verified.gating_score() >= AUTO_ADVANCE_SCORE
        {
            BookingStatus::Proposed
        } else {
            BookingStatus::NeedsReview
        };

        let audit_blockers = booking.blockers.clone();
        let audit_fingerprint = booking.fingerprint.clone();
        self.transition(&conn, &mut booking, next, actor, json!({
            "blockers": audit_blockers,
            "fingerprint": audit_fingerprint,
            "posting_date": posting_date.format("%Y-%m-%d").to_string(),
        }))?;

        Ok(booking.status)
    }

    /// One audited state transition, atomic with the row update.
    pub fn transition(
        &self,
        conn: &Connection,
        booking: &mut Booking,
        to: BookingStatus,
        actor: &str,
        detail: serde_json::Value,
    ) -> Result<(), PipelineError> {
        if !booking.status.allows(to) {
            return Err(PipelineError::StateConflict {
                current: booking.status,
            });
        }

        let from = booking.status;
        booking.status = to;
        if to.is_terminal() || to == BookingStatus::Approved {
            booking.finalized_at = Some(Utc::now().to_rfc3339());
        }

        in_transaction(conn, || {
            repository::update_booking(conn, booking)?;
            audit::append(
                conn,
                actor,
                audit::kind::BOOKING_TRANSITION,
                &booking.id.to_string(),
                json!({
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "detail": detail,
                }),
            )?;
            Ok(())
        })?;

        tracing::info!(
            booking_id = %booking.id,
            from = from.as_str(),
            to = to.as_str(),
            "Booking transition"
        );
        Ok(())
    }

    async fn run_vision_ocr(&self, input: &ExtractInput) -> Result<String, PipelineError> {
        if !matches!(
            input.media_type.as_str(),
            "image/png" | "image/jpeg" | "application/pdf"
        ) {
            return Err(PipelineError::Unextractable(
                "no vision path for this media type".into(),
            ));
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(&input.bytes);
        let completed = self
            .orchestrator
            .infer(
                GenerateRequest {
                    kind: InferKind::VisionOcr,
                    system: "Pročitaj sav tekst s dokumenta, bez komentara.".into(),
                    prompt: format!("[{};base64]{}", input.media_type, encoded),
                    max_tokens: 2048,
                },
                PIPELINE_INFER_DEADLINE,
            )
            .await?;
        Ok(completed.text)
    }
}

fn invoice_like(doc_class: DocClass) -> bool {
    matches!(
        doc_class,
        DocClass::InvoiceIn | DocClass::InvoiceEu | DocClass::InvoiceOut | DocClass::CashRegister
    )
}

fn legal_query(doc_class: DocClass) -> String {
    match doc_class {
        DocClass::InvoiceEu => "prijenos porezne obveze stjecanje usluge primatelj".into(),
        DocClass::TravelOrder => "dnevnica službeno putovanje neoporezivi iznos".into(),
        DocClass::PayrollInput => "doprinosi plaća osnovica obračun".into(),
        DocClass::CashRegister => "gotovinski promet blagajnički maksimum".into(),
        _ => "stopa poreza na dodanu vrijednost odbitak pretporeza".into(),
    }
}

fn narrative_for(verified: &VerifiedDoc, booking: &Booking) -> String {
    let number = verified
        .doc
        .field(field::INVOICE_NUMBER)
        .and_then(|fv| fv.value.as_text())
        .unwrap_or("-");
    let supplier = verified
        .doc
        .field(field::SUPPLIER_NAME)
        .and_then(|fv| fv.value.as_text())
        .unwrap_or("");

    let mut narrative = match booking.doc_class {
        DocClass::InvoiceIn => format!("Ulazni račun {number} {supplier}"),
        DocClass::InvoiceEu => format!("EU račun {number} {supplier}, prijenos porezne obveze"),
        DocClass::InvoiceOut => format!("Izlazni račun {number}"),
        DocClass::BankStmt => "Izvod banke".to_string(),
        DocClass::CashRegister => format!("Blagajna {number}"),
        DocClass::TravelOrder => format!("Putni nalog {number}"),
        DocClass::PayrollInput => "Obračun plaće".to_string(),
    };

    let warnings = verified.warnings();
    if !warnings.is_empty() {
        narrative.push_str(" — provjeriti: ");
        narrative.push_str(
            &warnings
                .iter()
                .map(|(field, w)| format!("{field} ({w})"))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }
    narrative.trim().to_string()
}

/// Run `body` inside BEGIN IMMEDIATE … COMMIT with rollback on error.
pub fn in_transaction<F>(conn: &Connection, body: F) -> Result<(), PipelineError>
where
    F: FnOnce() -> Result<(), PipelineError>,
{
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(DatabaseError::from)?;
    match body() {
        Ok(()) => {
            conn.execute_batch("COMMIT").map_err(DatabaseError::from)?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}
