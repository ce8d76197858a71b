//! Exact nearest-neighbour search over a dense row-major matrix.

use std::cmp::Ordering;

use rayon::prelude::*;

use super::{IndexError, VectorIndex};
use crate::embeddings::l2_normalize;

/// Brute-force cosine index.
///
/// Rows are normalised on insertion, so the distance of a row to a normalised
/// query is `1 - dot`. Ordinal IDs are row positions.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    fn push_row(&mut self, row: &[f32]) {
        let start = self.data.len();
        self.data.extend_from_slice(row);
        if let Some(slot) = self.data.get_mut(start..) {
            l2_normalize(slot);
        }
    }
}

fn by_distance_then_id(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
}

impl VectorIndex for FlatIndex {
    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    #[inline]
    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        self.data.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.push_row(vector);
        }
        Ok(())
    }

    #[inline]
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let k = k.min(self.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        l2_normalize(&mut query);

        let mut scored: Vec<(usize, f32)> = self
            .data
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(id, row)| {
                let dot: f32 = row.iter().zip(&query).map(|(a, b)| a * b).sum();
                (id, (1.0 - dot).clamp(0.0, 2.0))
            })
            .collect();

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_distance_then_id);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_distance_then_id);

        Ok(scored)
    }
}
