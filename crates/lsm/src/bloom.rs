//! Bloom filters for sealed chunks.
//!
//! Each on-disk chunk can carry a Bloom filter so point lookups skip
//! chunks that can't contain the key. Probes use two independent xxh3
//! hashes combined Kirsch-Mitzenmacher style: probe i lands on
//! `h1 + i * h2`.

use shale_core::{Error, PackStream, Result, UnpackStream};
use xxhash_rust::xxh3::xxh3_64_with_seed;

const BLOOM_SEED_1: u64 = 0x5368616c65; // "Shale"
const BLOOM_SEED_2: u64 = 0x626c6f6f6d; // "bloom"

/// The two base hashes of one key, computed once per lookup and
/// reusable across every chunk's filter.
#[derive(Debug, Clone, Copy)]
pub struct BloomHash {
    h1: u64,
    h2: u64,
}

impl BloomHash {
    /// Hash a key for filter probes.
    pub fn new(key: &[u8]) -> Self {
        BloomHash {
            h1: xxh3_64_with_seed(key, BLOOM_SEED_1),
            h2: xxh3_64_with_seed(key, BLOOM_SEED_2),
        }
    }

    fn probe(&self, i: u32, nbits: u64) -> u64 {
        self.h1.wrapping_add((i as u64).wrapping_mul(self.h2)) % nbits
    }
}

/// A fixed-size Bloom filter.
#[derive(Debug, Clone)]
pub struct Bloom {
    bits: Vec<u8>,
    nbits: u64,
    hash_count: u32,
}

impl Bloom {
    /// Size a filter for `count` keys at `bit_count` bits per key with
    /// `hash_count` probes.
    pub fn new(count: u64, bit_count: u32, hash_count: u32) -> Self {
        let nbits = (count.max(1)).saturating_mul(bit_count as u64).max(8);
        Bloom {
            bits: vec![0u8; ((nbits + 7) / 8) as usize],
            nbits,
            hash_count,
        }
    }

    /// Insert a key.
    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(&BloomHash::new(key));
    }

    /// Insert a pre-hashed key.
    pub fn insert_hash(&mut self, hash: &BloomHash) {
        for i in 0..self.hash_count {
            let bit = hash.probe(i, self.nbits);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Whether the key may be present; false means definitely absent.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        self.maybe_contains_hash(&BloomHash::new(key))
    }

    /// Whether a pre-hashed key may be present.
    pub fn maybe_contains_hash(&self, hash: &BloomHash) -> bool {
        (0..self.hash_count).all(|i| {
            let bit = hash.probe(i, self.nbits);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    /// Serialize the filter.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut pack = PackStream::new();
        pack.put_uint(self.nbits)
            .put_uint(self.hash_count as u64)
            .put_bytes(&self.bits);
        pack.into_bytes()
    }

    /// Deserialize a filter.
    pub fn from_bytes(buf: &[u8]) -> Result<Bloom> {
        let mut stream = UnpackStream::new(buf);
        let nbits = stream.get_uint().map_err(Error::from)?;
        let hash_count = stream.get_uint().map_err(Error::from)? as u32;
        let bits = stream.get_bytes().map_err(Error::from)?.to_vec();
        if nbits == 0 || hash_count == 0 || bits.len() as u64 != (nbits + 7) / 8 {
            return Err(Error::CorruptBlock("malformed bloom filter".to_string()));
        }
        Ok(Bloom {
            bits,
            nbits,
            hash_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_keys_always_hit() {
        let mut bloom = Bloom::new(100, 16, 8);
        for i in 0..100u32 {
            bloom.insert(format!("key-{i}").as_bytes());
        }
        for i in 0..100u32 {
            assert!(bloom.maybe_contains(format!("key-{i}").as_bytes()));
        }
    }

    #[test]
    fn test_absent_keys_mostly_miss() {
        let mut bloom = Bloom::new(1000, 16, 8);
        for i in 0..1000u32 {
            bloom.insert(format!("present-{i}").as_bytes());
        }
        let false_positives = (0..1000u32)
            .filter(|i| bloom.maybe_contains(format!("absent-{i}").as_bytes()))
            .count();
        // At 16 bits/key and 8 hashes the false positive rate is a
        // small fraction of a percent; 5% leaves generous slack.
        assert!(false_positives < 50, "{false_positives} false positives");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut bloom = Bloom::new(64, 16, 4);
        bloom.insert(b"alpha");
        bloom.insert(b"beta");

        let read = Bloom::from_bytes(&bloom.to_bytes()).unwrap();
        assert!(read.maybe_contains(b"alpha"));
        assert!(read.maybe_contains(b"beta"));
        assert_eq!(read.nbits, bloom.nbits);
        assert_eq!(read.hash_count, bloom.hash_count);
    }

    #[test]
    fn test_malformed_rejected() {
        let mut bytes = Bloom::new(8, 8, 2).to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(Bloom::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_shared_hash_across_filters() {
        let mut a = Bloom::new(16, 16, 4);
        let mut b = Bloom::new(16, 16, 4);
        let hash = BloomHash::new(b"key");
        a.insert_hash(&hash);
        b.insert_hash(&hash);
        assert!(a.maybe_contains_hash(&hash));
        assert!(b.maybe_contains_hash(&hash));
    }
}
