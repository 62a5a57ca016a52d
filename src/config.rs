use std::path::PathBuf;

use crate::errinput;
use crate::error::Result;

/// When to build Bloom filters over sealed chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomPolicy {
    /// Never build filters.
    Off,
    /// Build on every sealed chunk except the oldest (default).
    On,
    /// Build on every sealed chunk, including the oldest.
    Oldest,
    /// Build only on merge outputs.
    Merged,
}

/// Upper bound on worker threads per tree.
pub const MAX_WORKERS: usize = 10;

/// Configuration for an LSM tree.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Directory holding the tree's chunk and filter files
    pub dir: PathBuf,

    /// Primary chunk size that triggers a switch (default: 2MB)
    pub chunk_size: u64,

    /// Hard ceiling on any single chunk's size (default: 128MB)
    pub chunk_max: u64,

    /// Minimum chunks fused by one merge (default: 4)
    pub merge_min: u32,

    /// Maximum chunks fused by one merge (default: 8)
    pub merge_max: u32,

    /// Bloom filter creation policy (default: On)
    pub bloom: BloomPolicy,

    /// Filter bits per record (default: 16)
    pub bloom_bit_count: u32,

    /// Hash evaluations per filter probe (default: 8)
    pub bloom_hash_count: u32,

    /// Worker thread count (default: 4, max 10)
    pub workers: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            chunk_size: 2 * 1024 * 1024,
            chunk_max: 128 * 1024 * 1024,
            merge_min: 4,
            merge_max: 8,
            bloom: BloomPolicy::On,
            bloom_bit_count: 16,
            bloom_hash_count: 8,
            workers: 4,
        }
    }
}

impl TreeConfig {
    /// Create a new config rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the primary chunk size
    pub fn chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the hard chunk size ceiling
    pub fn chunk_max(mut self, size: u64) -> Self {
        self.chunk_max = size;
        self
    }

    /// Set the minimum merge width
    pub fn merge_min(mut self, min: u32) -> Self {
        self.merge_min = min;
        self
    }

    /// Set the maximum merge width
    pub fn merge_max(mut self, max: u32) -> Self {
        self.merge_max = max;
        self
    }

    /// Set the Bloom filter policy
    pub fn bloom(mut self, policy: BloomPolicy) -> Self {
        self.bloom = policy;
        self
    }

    /// Set filter bits per record
    pub fn bloom_bit_count(mut self, bits: u32) -> Self {
        self.bloom_bit_count = bits;
        self
    }

    /// Set hash evaluations per filter probe
    pub fn bloom_hash_count(mut self, hashes: u32) -> Self {
        self.bloom_hash_count = hashes;
        self
    }

    /// Set the worker thread count
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Validate parameter bounds. Called once at tree open.
    pub fn validate(&self) -> Result<()> {
        if self.merge_min < 2 || self.merge_min > self.merge_max || self.merge_max > 10 {
            return errinput!(
                "merge bounds must satisfy 2 <= merge_min <= merge_max <= 10, got {}..{}",
                self.merge_min,
                self.merge_max
            );
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return errinput!("workers must be 1..={MAX_WORKERS}, got {}", self.workers);
        }
        if self.chunk_size == 0 || self.chunk_size > self.chunk_max {
            return errinput!(
                "chunk_size must be nonzero and <= chunk_max ({} > {})",
                self.chunk_size,
                self.chunk_max
            );
        }
        if self.bloom != BloomPolicy::Off && (self.bloom_bit_count == 0 || self.bloom_hash_count == 0)
        {
            return errinput!("bloom bit and hash counts must be nonzero");
        }
        Ok(())
    }
}
