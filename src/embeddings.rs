use crate::chunking::TextChunk;
use crate::rag::ModelBackend;
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    fn magnitude(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1]; 0 for mismatched dimensions or zero vectors
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.dimension() != other.dimension() {
            return 0.0;
        }

        let dot_product: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();

        let magnitude = self.magnitude() * other.magnitude();
        if magnitude == 0.0 {
            0.0
        } else {
            dot_product / magnitude
        }
    }
}

/// Generate embeddings for multiple chunks, one request at a time
pub async fn embed_chunks<M: ModelBackend>(
    backend: &M,
    chunks: &[TextChunk],
) -> Result<Vec<Embedding>> {
    let mut embeddings = Vec::with_capacity(chunks.len());

    for (idx, chunk) in chunks.iter().enumerate() {
        let embedding = backend
            .embed(&chunk.text)
            .await
            .with_context(|| format!("Failed to embed chunk {} of {}", idx, chunk.document_id))?;
        embeddings.push(embedding);
    }

    debug!("Embedded {} chunks", embeddings.len());
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = embedding(&[1.0, 0.0]);
        assert!((a.cosine_similarity(&embedding(&[2.0, 0.0])) - 1.0).abs() < 1e-6);
        assert!(a.cosine_similarity(&embedding(&[0.0, 3.0])).abs() < 1e-6);
        assert!((a.cosine_similarity(&embedding(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate_inputs() {
        let a = embedding(&[1.0, 2.0]);
        assert_eq!(a.cosine_similarity(&embedding(&[1.0, 2.0, 3.0])), 0.0);
        assert_eq!(a.cosine_similarity(&embedding(&[0.0, 0.0])), 0.0);
    }
}
