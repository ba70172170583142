//! Bloom filter used as the cheap pre-check in front of the exact domain set.
//!
//! Sized from the expected entry count and target false-positive rate:
//!
//! ```text
//! m = ceil(-n * ln(p) / ln(2)^2)    bits
//! k = round(m / n * ln(2))          probes, clamped to [1, 16]
//! ```
//!
//! Probe positions use double hashing `h1 + i * h2` over two independent
//! 64-bit hashes (FxHash and FNV-1a), so one pass over the bytes per hash.

use std::hash::Hasher;

use rustc_hash::FxHasher;

pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

const MIN_BITS: u64 = 64;
const MAX_PROBES: u32 = 16;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_probes: u32,
}

impl BloomFilter {
    /// Build an empty filter for `expected_items` entries at `fp_rate`.
    ///
    /// `fp_rate` outside `(0, 1)` falls back to the default rate.
    pub fn with_rate(expected_items: usize, fp_rate: f64) -> Self {
        let p = if fp_rate > 0.0 && fp_rate < 1.0 {
            fp_rate
        } else {
            DEFAULT_FALSE_POSITIVE_RATE
        };
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;

        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = num_bits.max(MIN_BITS);
        let num_probes = ((num_bits as f64 / n) * ln2).round() as u32;
        let num_probes = num_probes.clamp(1, MAX_PROBES);

        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            num_bits,
            num_probes,
        }
    }

    pub fn insert(&mut self, item: &[u8]) {
        let (h1, h2) = hash_pair(item);
        for i in 0..self.num_probes {
            let bit = self.position(h1, h2, i);
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// `false` means definitely absent; `true` means possibly present.
    pub fn might_contain(&self, item: &[u8]) -> bool {
        let (h1, h2) = hash_pair(item);
        (0..self.num_probes).all(|i| {
            let bit = self.position(h1, h2, i);
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_probes(&self) -> u32 {
        self.num_probes
    }

    pub fn size_bytes(&self) -> usize {
        self.bits.len() * 8
    }

    #[inline]
    fn position(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}

#[inline]
fn hash_pair(bytes: &[u8]) -> (u64, u64) {
    let mut fx = FxHasher::default();
    fx.write(bytes);
    // Force h2 odd so successive probes never collapse onto one bit.
    (fx.finish(), fnv1a(bytes) | 1)
}

#[inline]
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_follows_formula() {
        let filter = BloomFilter::with_rate(100_000, 0.01);
        // ~9.59 bits per entry and 7 probes at 1%.
        assert!(filter.num_bits() >= 958_000 && filter.num_bits() <= 960_000);
        assert_eq!(filter.num_probes(), 7);

        let fallback = BloomFilter::with_rate(10, 2.0);
        assert_eq!(fallback.num_probes(), 7);
    }

    #[test]
    fn test_no_false_negatives() {
        let domains: Vec<String> = (0..5_000).map(|i| format!("host{}.example.com", i)).collect();
        let mut filter = BloomFilter::with_rate(domains.len(), 0.01);
        for d in &domains {
            filter.insert(d.as_bytes());
        }
        assert!(domains.iter().all(|d| filter.might_contain(d.as_bytes())));
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::with_rate(10_000, 0.01);
        for i in 0..10_000 {
            filter.insert(format!("in{}.example.com", i).as_bytes());
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.might_contain(format!("out{}.example.net", i).as_bytes()))
            .count();
        // Generous bound: 3x the target rate.
        assert!(false_positives < 300, "fp count {}", false_positives);
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = BloomFilter::with_rate(0, 0.01);
        assert!(!filter.might_contain(b"example.com"));
    }
}
