//! Offline lexical embedder.
//!
//! Every lower-cased alphanumeric token of the text and every character
//! trigram of those tokens is hashed into a signed bucket of a fixed-size
//! vector, which is then L2-normalised. Paths that share words or word
//! fragments with a request land close to it under cosine distance, without a
//! model server.

#[cfg(test)]
mod tests;

use anyhow::Result;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::{Embedder, l2_normalize};

const MODEL_ID: &str = "hashed-v1";
const TOKEN_SEED: u64 = 0x7061_7468;
const TRIGRAM_SEED: u64 = 0x7472_6967;
const TOKEN_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed a single text.
    #[inline]
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];

        for token in tokens(text) {
            self.accumulate(&mut vector, token.as_bytes(), TOKEN_SEED, TOKEN_WEIGHT);

            let padded: Vec<char> = std::iter::once('^')
                .chain(token.chars())
                .chain(std::iter::once('$'))
                .collect();
            let mut buffer = String::with_capacity(12);
            for window in padded.windows(3) {
                buffer.clear();
                buffer.extend(window);
                self.accumulate(&mut vector, buffer.as_bytes(), TRIGRAM_SEED, TRIGRAM_WEIGHT);
            }
        }

        l2_normalize(&mut vector);
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8], seed: u64, weight: f32) {
        let hash = xxh3_64_with_seed(feature, seed);
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        if let Some(slot) = vector.get_mut(bucket) {
            *slot += sign * weight;
        }
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

impl Embedder for HashedEmbedder {
    #[inline]
    fn model_id(&self) -> &str {
        MODEL_ID
    }

    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}
