//! Deterministic partitioning of a flat buffer across ranks.
//!
//! Every worker computes the same boundaries from `(total, world_size)` alone, so agreeing on
//! the partition never needs a collective. The buffer is padded up to
//! `world_size * ceil(total / world_size)` elements; padding always sits at the end, so only
//! the trailing ranks may hold padding (and a rank may hold nothing but padding).

use crate::error::{Error, Result};

/// The slice of a flat buffer owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardBounds {
    /// Offset of the first real element in the unpadded buffer.
    pub start: usize,
    /// Number of real elements in this rank's chunk.
    pub len: usize,
    /// Number of zero elements appended to reach the common chunk length.
    pub pad: usize,
}

impl ShardBounds {
    /// Length of the chunk as stored locally (real elements plus padding).
    pub const fn chunk_len(&self) -> usize {
        self.len + self.pad
    }
}

/// Computes the chunk owned by `rank` when `total` elements are split across `world_size` ranks.
///
/// Panics if `world_size == 0` or `rank >= world_size`; [`ShardSpec::new`] validates both.
pub fn shard_bounds(total: usize, world_size: usize, rank: usize) -> ShardBounds {
    assert!(world_size > 0, "world_size must be positive");
    assert!(rank < world_size, "rank {rank} out of range for world size {world_size}");

    let chunk = total.div_ceil(world_size);
    let start = (rank * chunk).min(total);
    let end = (start + chunk).min(total);
    let len = end - start;
    ShardBounds {
        start,
        len,
        pad: chunk - len,
    }
}

/// Sharding layout of one flat parameter on one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    numel: usize,
    world_size: usize,
    rank: usize,
}

impl ShardSpec {
    pub fn new(numel: usize, world_size: usize, rank: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::Config("world size must be positive".into()));
        }
        if rank >= world_size {
            return Err(Error::Config(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        Ok(Self {
            numel,
            world_size,
            rank,
        })
    }

    pub const fn numel(&self) -> usize {
        self.numel
    }

    pub const fn world_size(&self) -> usize {
        self.world_size
    }

    pub const fn rank(&self) -> usize {
        self.rank
    }

    /// Boundaries of this rank's chunk.
    pub fn bounds(&self) -> ShardBounds {
        shard_bounds(self.numel, self.world_size, self.rank)
    }

    /// Boundaries of another rank's chunk under the same layout.
    pub fn bounds_of(&self, rank: usize) -> ShardBounds {
        shard_bounds(self.numel, self.world_size, rank)
    }

    /// Common chunk length, `ceil(numel / world_size)`.
    pub fn chunk_len(&self) -> usize {
        self.numel.div_ceil(self.world_size)
    }

    /// Length of the padded buffer, `world_size * chunk_len`.
    pub fn padded_numel(&self) -> usize {
        self.chunk_len() * self.world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        assert_eq!(shard_bounds(8, 4, 0), ShardBounds { start: 0, len: 2, pad: 0 });
        assert_eq!(shard_bounds(8, 4, 3), ShardBounds { start: 6, len: 2, pad: 0 });
    }

    #[test]
    fn test_uneven_split_pads_tail() {
        // 5 elements over 4 ranks: chunk 2 -> [0,1] [2,3] [4,pad] [pad,pad]
        assert_eq!(shard_bounds(5, 4, 0), ShardBounds { start: 0, len: 2, pad: 0 });
        assert_eq!(shard_bounds(5, 4, 2), ShardBounds { start: 4, len: 1, pad: 1 });
        assert_eq!(shard_bounds(5, 4, 3), ShardBounds { start: 5, len: 0, pad: 2 });
    }

    #[test]
    fn test_exhaustive_small_values() {
        for total in 0usize..=17 {
            for world_size in 1..=6 {
                let chunk = total.div_ceil(world_size);
                let mut covered = 0;
                let mut pad_seen = false;
                for rank in 0..world_size {
                    let b = shard_bounds(total, world_size, rank);
                    assert_eq!(b.chunk_len(), chunk, "total={total} ws={world_size}");
                    // Chunks tile the buffer in rank order.
                    assert_eq!(b.start, covered.min(total));
                    covered += b.len;
                    // Once a rank is padded every later rank holds no real elements past total.
                    if pad_seen {
                        assert_eq!(b.len, 0);
                    }
                    pad_seen |= b.pad > 0;
                }
                assert_eq!(covered, total);
                assert!(chunk * world_size - total < world_size.max(1));
            }
        }
    }

    #[test]
    fn test_world_size_one_is_identity() {
        for total in 0..10 {
            assert_eq!(shard_bounds(total, 1, 0), ShardBounds { start: 0, len: total, pad: 0 });
        }
    }

    #[test]
    fn test_spec_validation() {
        assert!(ShardSpec::new(10, 0, 0).is_err());
        assert!(ShardSpec::new(10, 2, 2).is_err());
        let spec = ShardSpec::new(10, 4, 1).unwrap();
        assert_eq!(spec.chunk_len(), 3);
        assert_eq!(spec.padded_numel(), 12);
        assert_eq!(spec.bounds(), ShardBounds { start: 3, len: 3, pad: 0 });
        assert_eq!(spec.bounds_of(3), ShardBounds { start: 9, len: 1, pad: 2 });
    }
}
