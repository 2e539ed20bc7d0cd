/// Bloom filters over precomputed key hashes
///
/// The build side of a hash join hashes its join keys with the same
/// `FieldHasher` the probe side uses and inserts the hashes here. The filter is
/// then shipped to the probe-side scan fragments, which drop rows whose key
/// hash is definitely absent.
use crate::error::{EngineError, EngineResult};
use bitvec::prelude::{bitvec, BitVec, Lsb0};
use serde::{Deserialize, Serialize};

/// Bloom filter keyed by 64-bit hashes
///
/// Probes use double hashing: the i-th bit position is
/// `(h1 + i * h2) mod num_bits`, with `h1`/`h2` the low/high halves of the
/// key hash (remixed so adjacent keys spread).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Bit array for the filter
    bits: BitVec<u64, Lsb0>,

    /// Number of hash functions
    num_hashes: u32,

    /// Number of hashes inserted (duplicates counted)
    num_inserted: u64,
}

impl BloomFilter {
    /// Create a new Bloom filter
    ///
    /// # Arguments
    /// * `num_bits` - Number of bits in the filter (at least 64)
    /// * `num_hashes` - Number of probe positions per key (at least 1)
    pub fn new(num_bits: usize, num_hashes: u32) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; num_bits.max(64)],
            num_hashes: num_hashes.max(1),
            num_inserted: 0,
        }
    }

    /// Size the filter for `expected_elements` at false positive rate `fpp`
    pub fn with_expected(expected_elements: usize, fpp: f64) -> Self {
        let num_bits = Self::optimal_num_bits(expected_elements, fpp);
        let num_hashes = Self::optimal_num_hashes(expected_elements, num_bits);
        Self::new(num_bits, num_hashes)
    }

    /// `m = -n ln p / (ln 2)^2`
    pub fn optimal_num_bits(expected_elements: usize, fpp: f64) -> usize {
        let n = expected_elements.max(1) as f64;
        let p = fpp.clamp(1e-9, 0.5);
        let m = -n * p.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2);
        (m.ceil() as usize).max(64)
    }

    /// `k = m / n * ln 2`
    pub fn optimal_num_hashes(expected_elements: usize, num_bits: usize) -> u32 {
        let n = expected_elements.max(1) as f64;
        let k = (num_bits as f64 / n * std::f64::consts::LN_2).round();
        (k as u32).clamp(1, 16)
    }

    pub fn num_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn num_inserted(&self) -> u64 {
        self.num_inserted
    }

    /// Insert a key hash
    pub fn insert_hash(&mut self, hash: i64) {
        let (h1, h2) = split(hash);
        let m = self.bits.len() as u64;
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % m;
            self.bits.set(bit as usize, true);
        }
        self.num_inserted += 1;
    }

    /// Check if a key hash might be in the filter
    ///
    /// # Returns
    /// - `true` if the key might be present (could be a false positive)
    /// - `false` if the key is definitely absent (no false negatives)
    pub fn might_contain_hash(&self, hash: i64) -> bool {
        let (h1, h2) = split(hash);
        let m = self.bits.len() as u64;
        (0..self.num_hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % m;
            self.bits[bit as usize]
        })
    }

    /// Get number of bits set
    pub fn bits_set(&self) -> usize {
        self.bits.count_ones()
    }

    /// Get false positive rate estimate
    ///
    /// Formula: (1 - e^(-k*n/m))^k
    /// where k = num_hashes, n = num_inserted, m = num_bits
    pub fn false_positive_rate(&self) -> f64 {
        if self.num_inserted == 0 {
            return 0.0;
        }
        let k = self.num_hashes as f64;
        let n = self.num_inserted as f64;
        let m = self.bits.len() as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Union `other` into this filter
    ///
    /// Used when combining the partial filters produced by each build-side
    /// minor fragment.
    pub fn merge(&mut self, other: &BloomFilter) -> EngineResult<()> {
        if self.bits.len() != other.bits.len() || self.num_hashes != other.num_hashes {
            return Err(EngineError::execution(format!(
                "cannot merge bloom filters of {} bits/{} hashes and {} bits/{} hashes",
                self.bits.len(),
                self.num_hashes,
                other.bits.len(),
                other.num_hashes
            )));
        }
        for (dst, src) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *dst |= *src;
        }
        self.num_inserted += other.num_inserted;
        Ok(())
    }

    /// Get memory usage in bytes
    pub fn memory_usage_bytes(&self) -> usize {
        self.bits.as_raw_slice().len() * std::mem::size_of::<u64>() + std::mem::size_of::<Self>()
    }
}

// splitmix64 finalizer; h2 is forced odd so probe positions never collapse
fn split(hash: i64) -> (u64, u64) {
    let mut z = (hash as u64).wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z & 0xffff_ffff, (z >> 32) | 1)
}
