//! Process-scoped services, constructed together with injected
//! dependencies and shared behind one `Arc`. There is no module-level
//! mutable state anywhere in the crate.

use std::sync::Arc;

use crate::audit::AuditError;
use crate::blobstore::{BlobError, ContentStore};
use crate::config::Config;
use crate::db::{Database, DatabaseError};
use crate::inference::{
    HttpLlmBackend, InferenceError, InferenceOrchestrator, LlmBackend, OrchestratorConfig,
};
use crate::pipeline::booking::BookingPipeline;
use crate::pipeline::extraction::ExtractorRegistry;
use crate::pipeline::rag::{Embedding, HttpEmbedder, LawIndex};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("audit chain verification failed: {0}")]
    AuditIntegrity(#[from] AuditError),
}

pub struct CoreState {
    pub config: Arc<Config>,
    pub db: Database,
    pub blobs: ContentStore,
    pub orchestrator: Arc<InferenceOrchestrator>,
    pub law_index: Arc<LawIndex>,
    pub pipeline: Arc<BookingPipeline>,
}

impl CoreState {
    /// Production wiring: HTTP backends for inference, vision, and
    /// embeddings, all against the configured local endpoints.
    pub fn initialize(config: Config) -> Result<Arc<Self>, CoreError> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            CoreError::Blob(BlobError::Io(e))
        })?;

        let primary: Arc<dyn LlmBackend> = Arc::new(HttpLlmBackend::new(
            &config.inference_endpoint.url,
            &config.inference_endpoint.model,
        ));
        let vision_endpoint = config.vision_endpoint.clone();
        let vision_factory = Box::new(move || {
            Ok(Arc::new(HttpLlmBackend::new(&vision_endpoint.url, &vision_endpoint.model))
                as Arc<dyn LlmBackend>)
        });
        let embedder: Arc<dyn Embedding> = Arc::new(HttpEmbedder::new(
            &config.embedding_endpoint.url,
            &config.embedding_endpoint.model,
        ));

        Self::with_parts(config, primary, vision_factory, embedder)
    }

    /// Assemble the service graph from injected backends. Used directly
    /// by tests with scripted models.
    pub fn with_parts(
        config: Arc<Config>,
        primary: Arc<dyn LlmBackend>,
        vision_factory: Box<
            dyn Fn() -> Result<Arc<dyn LlmBackend>, InferenceError> + Send + Sync,
        >,
        embedder: Arc<dyn Embedding>,
    ) -> Result<Arc<Self>, CoreError> {
        let db = Database::initialize(config.db_path())?;
        let blobs = ContentStore::new(config.blobs_dir())?;

        // Refusing to run on a tampered audit trail is the whole point
        // of having one.
        {
            let conn = db.open()?;
            let verified = crate::audit::verify(&conn, None)?;
            tracing::info!(events = verified, "Audit chain verified");
        }

        let orchestrator = Arc::new(InferenceOrchestrator::new(
            primary,
            vision_factory,
            OrchestratorConfig {
                max_sessions: config.max_sessions,
                max_queue_depth: config.max_queue_depth,
                prompt_token_budget: config.prompt_token_budget,
                ..OrchestratorConfig::default()
            },
        ));

        let law_index = Arc::new(LawIndex::new(
            db.clone(),
            embedder,
            config.rag_confidence_floor,
        ));

        let pipeline = Arc::new(BookingPipeline::new(
            db.clone(),
            blobs.clone(),
            ExtractorRegistry::standard(),
            orchestrator.clone(),
            law_index.clone(),
            config.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            db,
            blobs,
            orchestrator,
            law_index,
            pipeline,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ScriptedBackend;
    use crate::pipeline::rag::HashEmbedder;

    #[test]
    fn core_state_assembles_and_verifies_empty_chain() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        });

        let core = CoreState::with_parts(
            config,
            Arc::new(ScriptedBackend::new("primary")),
            Box::new(|| Err(InferenceError::VisionUnavailable("test".into()))),
            Arc::new(HashEmbedder),
        )
        .unwrap();

        assert_eq!(core.config.home_currency, "EUR");
        assert!(core.db.path().exists());
    }

    #[test]
    fn tampered_audit_chain_refuses_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        });

        // Seed a chain, then corrupt it.
        {
            let db = Database::initialize(config.db_path()).unwrap();
            let conn = db.open().unwrap();
            crate::audit::append(&conn, "system", "booking.transition", "b1", serde_json::json!({}))
                .unwrap();
            conn.execute("UPDATE audit_log SET payload = '{\"x\":1}' WHERE seq = 1", [])
                .unwrap();
        }

        let result = CoreState::with_parts(
            config,
            Arc::new(ScriptedBackend::new("primary")),
            Box::new(|| Err(InferenceError::VisionUnavailable("test".into()))),
            Arc::new(HashEmbedder),
        );
        assert!(matches!(result, Err(CoreError::AuditIntegrity(_))));
    }
}
