use crate::embeddings::{cosine_similarity, normalize};
use crate::error::{RecallError, Result};

const INDEX_MAGIC: &[u8; 4] = b"RVI1";

/// Exact nearest-neighbor index over normalized vectors.
///
/// Rows are held in insertion order and have no identity beyond their
/// position; callers recover identity through the record store, whose
/// i-th record corresponds to row i. There is no delete or update:
/// any removal means discarding the index and re-adding the survivors
/// in the desired final order.
pub struct VectorIndex {
    dimension: usize,
    rows: Vec<Vec<f32>>,
}

impl VectorIndex {
    #[must_use]
    pub const fn new(dimension: usize) -> Self {
        Self {
            dimension,
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Append vectors in order. Each is normalized before storage so
    /// that inner product equals cosine similarity at query time.
    pub fn add_batch(&mut self, vectors: Vec<Vec<f32>>) -> Result<()> {
        for mut vector in vectors {
            if vector.len() != self.dimension {
                return Err(RecallError::InvalidDimension {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
            normalize(&mut vector);
            self.rows.push(vector);
        }
        Ok(())
    }

    /// Top-k by cosine similarity, brute force over all rows.
    ///
    /// Returns `(position, score)` pairs ordered by descending score;
    /// equal scores break ties by ascending position, so results are
    /// deterministic. An empty index yields an empty result.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dimension {
            return Err(RecallError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = self
            .rows
            .iter()
            .enumerate()
            .map(|(position, row)| (position, cosine_similarity(query, row)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);

        Ok(scored)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Serialize to the on-disk blob: magic, write generation,
    /// dimension, row count, then all rows as little-endian f32.
    ///
    /// The generation is an opaque stamp the persistence layer shares
    /// between the index blob and the record blob of one save, so a
    /// torn pair is detectable at load even when row counts agree.
    #[must_use]
    pub fn encode(&self, generation: u128) -> Vec<u8> {
        let mut out = Vec::with_capacity(28 + self.rows.len() * self.dimension * 4);
        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&generation.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.rows.len() as u32).to_le_bytes());
        for row in &self.rows {
            for value in row {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }

    /// Decode an on-disk blob into the index and its write generation.
    /// Returns `None` on any structural mismatch (bad magic, truncated
    /// payload, zero dimension) so the caller can degrade to an empty
    /// namespace.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<(Self, u128)> {
        if bytes.len() < 28 || &bytes[0..4] != INDEX_MAGIC {
            return None;
        }
        let generation = u128::from_le_bytes(bytes[4..20].try_into().ok()?);
        let dimension = u32::from_le_bytes(bytes[20..24].try_into().ok()?) as usize;
        let count = u32::from_le_bytes(bytes[24..28].try_into().ok()?) as usize;
        if dimension == 0 {
            return None;
        }
        let expected_len = 28usize
            .checked_add(count.checked_mul(dimension)?.checked_mul(4)?)?;
        if bytes.len() != expected_len {
            return None;
        }

        let mut rows = Vec::with_capacity(count);
        let mut offset = 28;
        for _ in 0..count {
            let mut row = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                let value = f32::from_le_bytes(bytes[offset..offset + 4].try_into().ok()?);
                row.push(value);
                offset += 4;
            }
            rows.push(row);
        }

        Some((Self { dimension, rows }, generation))
    }
}
