use ferry_core::hash::blake3_32;
use ferry_core::BundleId;
use serde::{Deserialize, Serialize};

const BLOOM_HASH_DOMAIN: &[u8] = b"ferry/bloom/v1";

/// Salted bloom filter over bundle ids.
///
/// The salt is fresh per session so a false positive for one pair of peers
/// does not repeat on the next contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BloomFilter {
    pub bit_len: usize,
    pub hash_count: u8,
    pub salt: [u8; 16],
    #[serde(with = "serde_bytes")]
    pub bits: Vec<u8>,
}

impl BloomFilter {
    pub fn new(bit_len: usize, hash_count: u8, salt: [u8; 16]) -> Self {
        let bit_len = bit_len.max(8);
        Self {
            bit_len,
            hash_count: hash_count.max(1),
            salt,
            bits: vec![0; bit_len.div_ceil(8)],
        }
    }

    /// Sizes a filter for `expected_items` at the given false-positive rate.
    pub fn recommended(expected_items: usize, false_positive_rate: f64, salt: [u8; 16]) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(0.000_1, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil() as usize;
        let k = ((m as f64 / n) * ln2).round().clamp(1.0, 16.0) as u8;
        Self::new(m.max(256), k, salt)
    }

    pub fn from_ids<'a>(
        ids: impl IntoIterator<Item = &'a BundleId>,
        expected_items: usize,
        false_positive_rate: f64,
        salt: [u8; 16],
    ) -> Self {
        let mut filter = Self::recommended(expected_items, false_positive_rate, salt);
        for id in ids {
            filter.insert(id);
        }
        filter
    }

    pub fn insert(&mut self, id: &BundleId) {
        let indices: Vec<usize> = self.bit_indices(id).collect();
        for idx in indices {
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    pub fn might_contain(&self, id: &BundleId) -> bool {
        self.bit_indices(id)
            .all(|idx| self.bits.get(idx / 8).is_some_and(|b| b & (1 << (idx % 8)) != 0))
    }

    /// Rejects filters whose declared length disagrees with their bit array.
    pub fn is_well_formed(&self) -> bool {
        self.bit_len >= 8 && self.hash_count >= 1 && self.bits.len() == self.bit_len.div_ceil(8)
    }

    fn bit_indices<'a>(&'a self, id: &'a BundleId) -> impl Iterator<Item = usize> + 'a {
        (0..self.hash_count).map(move |round| {
            let mut preimage = Vec::with_capacity(BLOOM_HASH_DOMAIN.len() + 16 + 32 + 1);
            preimage.extend_from_slice(BLOOM_HASH_DOMAIN);
            preimage.extend_from_slice(&self.salt);
            preimage.extend_from_slice(id.as_bytes());
            preimage.push(round);
            let h = blake3_32(&preimage);
            let mixed = u64::from_be_bytes([h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7]]);
            (mixed % self.bit_len as u64) as usize
        })
    }
}
