//! Extractor fabric: explicit registry, tier routing, shadow capture.
//!
//! The registry is built at startup; nothing is discovered implicitly.
//! Extraction walks tiers from highest fidelity down. The first match
//! becomes the primary document; matches from lower tiers are kept as
//! shadow extractions so the verifier has an independent algorithmic
//! reading of every field. Per-extractor failures become diagnostics,
//! not pipeline failures; only total exhaustion is `Unextractable`.

use super::types::{ExtractInput, ExtractionError, Extractor, FabricOutput};

pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Registry with the production tier set.
    pub fn standard() -> Self {
        Self {
            extractors: vec![
                Box::new(super::ubl::UblInvoiceExtractor::new()),
                Box::new(super::bank::BankCsvExtractor::new()),
                Box::new(super::text_grammar::RegexInvoiceExtractor::new()),
                Box::new(super::text_grammar::VisionTextExtractor::new()),
            ],
        }
    }

    /// Custom registry (tests, reduced deployments).
    pub fn with_extractors(extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// Run the fabric. Extractors run in fidelity order; the first match
    /// wins, later matches shadow it.
    pub fn extract(&self, input: &ExtractInput) -> Result<FabricOutput, ExtractionError> {
        let mut ordered: Vec<&Box<dyn Extractor>> = self.extractors.iter().collect();
        ordered.sort_by_key(|e| e.tier());

        let mut primary = None;
        let mut shadows = Vec::new();
        let mut diagnostics = Vec::new();

        for extractor in ordered {
            match extractor.extract(input) {
                Ok(Some(doc)) => {
                    tracing::debug!(
                        blob_id = %input.blob_id,
                        extractor = extractor.id(),
                        tier = doc.source_tier.as_str(),
                        fields = doc.fields.len(),
                        "Extractor matched"
                    );
                    if primary.is_none() {
                        primary = Some(doc);
                    } else {
                        shadows.push(doc);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // A broken tier must not sink the document; record and
                    // fall through to the next tier.
                    tracing::warn!(
                        blob_id = %input.blob_id,
                        extractor = extractor.id(),
                        error = %e,
                        "Extractor failed, falling through"
                    );
                    diagnostics.push(format!("{}: {e}", extractor.id()));
                }
            }
        }

        match primary {
            Some(primary) => Ok(FabricOutput {
                primary,
                shadows,
                diagnostics,
            }),
            None => {
                if diagnostics.is_empty() {
                    diagnostics.push("no extractor applied to this input".into());
                }
                Err(ExtractionError::Unextractable { diagnostics })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{field, ExtractedDoc};
    use super::*;
    use crate::models::{DocClass, SourceTier};

    fn xml_input() -> ExtractInput {
        ExtractInput {
            blob_id: "blob1".into(),
            media_type: "application/xml".into(),
            bytes: super::super::ubl::SAMPLE_UBL.as_bytes().to_vec(),
            doc_class: DocClass::InvoiceIn,
            ocr_text: None,
        }
    }

    #[test]
    fn structured_wins_with_regex_shadow() {
        let registry = ExtractorRegistry::standard();
        // The UBL sample contains enough labels for the regex grammar to
        // also produce a (shadow) reading.
        let out = registry.extract(&xml_input()).unwrap();
        assert_eq!(out.primary.source_tier, SourceTier::StructuredXml);
        assert!(out
            .shadows
            .iter()
            .all(|s| s.source_tier > SourceTier::StructuredXml));
    }

    #[test]
    fn falls_back_to_regex_for_plain_text() {
        let registry = ExtractorRegistry::standard();
        let input = ExtractInput {
            blob_id: "blob2".into(),
            media_type: "text/plain".into(),
            bytes: b"Racun broj: 9/1/1\nOIB: 12345678903\nUkupno: 625,00 EUR\n".to_vec(),
            doc_class: DocClass::InvoiceIn,
            ocr_text: None,
        };
        let out = registry.extract(&input).unwrap();
        assert_eq!(out.primary.source_tier, SourceTier::Regex);
    }

    #[test]
    fn exhaustion_is_unextractable_with_diagnostics() {
        let registry = ExtractorRegistry::standard();
        let input = ExtractInput {
            blob_id: "blob3".into(),
            media_type: "image/png".into(),
            bytes: vec![0x89, 0x50],
            doc_class: DocClass::InvoiceIn,
            ocr_text: None, // vision transcript never produced
        };
        let err = registry.extract(&input).unwrap_err();
        assert!(matches!(err, ExtractionError::Unextractable { .. }));
    }

    #[test]
    fn failing_extractor_becomes_diagnostic() {
        struct Exploding;
        impl Extractor for Exploding {
            fn id(&self) -> &'static str {
                "exploding"
            }
            fn tier(&self) -> SourceTier {
                SourceTier::StructuredXml
            }
            fn extract(
                &self,
                _input: &ExtractInput,
            ) -> Result<Option<ExtractedDoc>, ExtractionError> {
                Err(ExtractionError::Malformed {
                    extractor: "exploding".into(),
                    reason: "boom".into(),
                })
            }
        }

        let registry = ExtractorRegistry::with_extractors(vec![
            Box::new(Exploding),
            Box::new(super::super::text_grammar::RegexInvoiceExtractor::new()),
        ]);
        let input = ExtractInput {
            blob_id: "blob4".into(),
            media_type: "text/plain".into(),
            bytes: b"Ukupno: 100,00 EUR".to_vec(),
            doc_class: DocClass::InvoiceIn,
            ocr_text: None,
        };

        let out = registry.extract(&input).unwrap();
        assert_eq!(out.primary.source_tier, SourceTier::Regex);
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].contains("exploding"));
    }

    #[test]
    fn vision_shadow_attached_when_transcript_present() {
        let registry = ExtractorRegistry::standard();
        let mut input = ExtractInput {
            blob_id: "blob5".into(),
            media_type: "text/plain".into(),
            bytes: b"Osnovica: 1.000,00\nPDV: 250,00\nUkupno: 1.250,00 EUR\n".to_vec(),
            doc_class: DocClass::InvoiceIn,
            ocr_text: None,
        };
        input.ocr_text = Some("Osnovica: 1 000,00\nPDV: 250,00\nUkupno: 1.250,00 EUR\n".into());

        let out = registry.extract(&input).unwrap();
        assert_eq!(out.primary.source_tier, SourceTier::Regex);
        assert_eq!(out.shadows.len(), 1);
        assert_eq!(out.shadows[0].source_tier, SourceTier::VisionOcr);
        assert!(out.shadows[0].field(field::GROSS).is_some());
    }
}
