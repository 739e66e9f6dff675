//! Embedding backends behind a trait, so the index never knows whether
//! vectors come from the local embedding endpoint or a test stub.

use async_trait::async_trait;

use super::types::RagError;

pub const EMBEDDING_DIM: usize = 384;

#[async_trait]
pub trait Embedding: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError>;
}

/// HTTP client for the configured local embedding endpoint
/// (OpenAI-compatible `/v1/embeddings` shape).
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        }
    }
}

#[derive(serde::Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(serde::Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedding for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": text });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::EmbeddingFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RagError::EmbeddingFailed(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::EmbeddingFailed(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|r| r.embedding)
            .ok_or_else(|| RagError::EmbeddingFailed("empty embedding response".into()))
    }
}

/// Deterministic token-hash embedder for tests: texts sharing tokens get
/// similar vectors, disjoint texts stay near-orthogonal.
pub struct HashEmbedder;

#[async_trait]
impl Embedding for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        use sha2::{Digest, Sha256};

        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
        {
            let digest = Sha256::digest(token.as_bytes());
            let slot = u16::from_le_bytes([digest[0], digest[1]]) as usize % EMBEDDING_DIM;
            vector[slot] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
