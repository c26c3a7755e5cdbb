// External embedding and generation capability
//
// *Le Fournisseur* (The Provider) - Encoder/generator contract with retry policy

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{MemoryError, Result};

/// Timeout applied to every external call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts made before an external call is given up.
pub const MAX_ATTEMPTS: u32 = 3;

/// Options for the text generator.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Sampling temperature
    pub temperature: f32,
    /// Output budget in tokens
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 60,
        }
    }
}

/// Contract for the external encoder and generator.
///
/// The production implementation talks to a real model; tests inject
/// [`HashedEmbedder`] or a wrapper around it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text into a dense vector of the provider's dimension.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Generate text from a prompt (used for consolidation summaries).
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;

    /// The embedding dimension this provider produces.
    fn dimension(&self) -> usize;
}

/// Run an external call under the timeout/retry policy: up to
/// [`MAX_ATTEMPTS`] attempts, exponential backoff of 1 s, 2 s, 4 s.
pub async fn call_with_retry<T, F, Fut>(operation: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Duration::from_secs(1);
    let mut last_failure = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        match tokio::time::timeout(CALL_TIMEOUT, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last_failure = e.to_string(),
            Err(_) => last_failure = format!("timed out after {}s", CALL_TIMEOUT.as_secs()),
        }
        warn!(operation, attempt, failure = %last_failure, "provider call failed");
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    Err(MemoryError::Encoder {
        operation,
        attempts: MAX_ATTEMPTS,
        message: last_failure,
    })
}

/// Deterministic hashed bag-of-words embedder.
///
/// Each token contributes weight at a few digest-derived positions, and
/// the result is L2-normalized, so identical texts embed identically and
/// texts sharing tokens land close in cosine space. Useful for tests and
/// fully offline operation; not a substitute for a learned encoder.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    /// Create an embedder producing vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            for chunk in digest.chunks_exact(8).take(3) {
                let h = u64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
                ]);
                let position = (h % self.dimension as u64) as usize;
                let weight = 1.0 + ((h >> 32) % 997) as f32 / 997.0;
                vector[position] += weight;
            }
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    async fn generate(&self, prompt: &str, _options: &GenerateOptions) -> Result<String> {
        // Extractive stand-in: echo the first few words of the prompt body
        let summary: Vec<&str> = prompt.split_whitespace().take(12).collect();
        Ok(summary.join(" "))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
