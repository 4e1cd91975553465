//! Bloom filter for SST negative-lookup elimination.
//!
//! Each SST carries a bloom filter over all keys it contains. A point
//! lookup consults the filter before opening any data block; a negative
//! answer skips the file entirely.

/// Bloom filter using double hashing (Kirsch-Mitzenmacher): two base
/// hashes combined as `h1 + i*h2` stand in for k independent hashes.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_probes: u32,
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;
const SECOND_SEED: u64 = 0x9e3779b97f4a7c15;

fn fnv1a(seed: u64, data: &[u8]) -> u64 {
    let mut h = seed;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

impl BloomFilter {
    /// Size the filter for `expected_keys` at the given false-positive
    /// rate (e.g. 0.01 = 1%).
    pub fn new(expected_keys: usize, fp_rate: f64) -> Self {
        let n = expected_keys.max(1) as f64;
        let p = fp_rate.clamp(1e-10, 0.5);

        // m = -n * ln(p) / ln(2)^2, k = (m/n) * ln(2)
        let num_bits = ((-n * p.ln() / 2.0_f64.ln().powi(2)).ceil() as u64).max(64);
        let num_probes = (((num_bits as f64 / n) * 2.0_f64.ln()).ceil() as u32).clamp(1, 30);

        Self {
            words: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_probes,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let h1 = fnv1a(FNV_OFFSET, key);
        let h2 = fnv1a(SECOND_SEED, key);
        for i in 0..self.num_probes {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits;
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    /// Returns `false` only if the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let h1 = fnv1a(FNV_OFFSET, key);
        let h2 = fnv1a(SECOND_SEED, key);
        for i in 0..self.num_probes {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits;
            if self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Serialize for storage in an SST trailer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.words.len() * 8);
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        buf.extend_from_slice(&self.num_probes.to_le_bytes());
        buf.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
        for w in &self.words {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        let num_bits = u64::from_le_bytes(data[0..8].try_into().ok()?);
        let num_probes = u32::from_le_bytes(data[8..12].try_into().ok()?);
        let word_count = u32::from_le_bytes(data[12..16].try_into().ok()?) as usize;
        if num_bits == 0 || data.len() < 16 + word_count * 8 {
            return None;
        }
        let mut words = Vec::with_capacity(word_count);
        for i in 0..word_count {
            let off = 16 + i * 8;
            words.push(u64::from_le_bytes(data[off..off + 8].try_into().ok()?));
        }
        Some(Self {
            words,
            num_bits,
            num_probes,
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.words.len() * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_insert_and_probe() {
        let mut bf = BloomFilter::new(1000, 0.01);
        bf.insert(b"alpha");
        bf.insert(b"beta");

        assert!(bf.may_contain(b"alpha"));
        assert!(bf.may_contain(b"beta"));
    }

    #[test]
    fn test_bloom_empty_rejects_everything() {
        let bf = BloomFilter::new(100, 0.01);
        assert!(!bf.may_contain(b"anything"));
    }

    #[test]
    fn test_bloom_false_positive_rate() {
        let n = 10_000u64;
        let mut bf = BloomFilter::new(n as usize, 0.01);
        for i in 0..n {
            bf.insert(&i.to_le_bytes());
        }
        for i in 0..n {
            assert!(bf.may_contain(&i.to_le_bytes()));
        }

        let mut false_positives = 0;
        for i in n..2 * n {
            if bf.may_contain(&i.to_le_bytes()) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / n as f64;
        assert!(rate < 0.03, "FP rate too high: {:.4}", rate);
    }

    #[test]
    fn test_bloom_serialize_roundtrip() {
        let mut bf = BloomFilter::new(200, 0.01);
        bf.insert(b"k1");
        bf.insert(b"k2");

        let bytes = bf.to_bytes();
        let back = BloomFilter::from_bytes(&bytes).unwrap();
        assert!(back.may_contain(b"k1"));
        assert!(back.may_contain(b"k2"));
        assert_eq!(back.num_bits, bf.num_bits);
        assert_eq!(back.num_probes, bf.num_probes);
    }

    #[test]
    fn test_bloom_rejects_short_encoding() {
        assert!(BloomFilter::from_bytes(&[0u8; 8]).is_none());
    }
}
