//! Keyed encryptor and compressor capability interfaces.
//!
//! The block manager and WAL transform payloads through these traits
//! before checksum-and-write and after read-and-verify. The engine does
//! not implement any real cipher or compressor; applications register
//! implementations under a `(name, keyid)` pair and table configuration
//! selects one by name.

use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Payload encryption capability.
///
/// Implementations must be length-preserving or expand by a constant
/// they report via [`Encryptor::size_const`], so callers can size
/// output buffers without a trial run.
pub trait Encryptor: Send + Sync {
    /// Encrypt `src`, appending the ciphertext to `dst`.
    fn encrypt(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    /// Decrypt `src`, appending the plaintext to `dst`.
    fn decrypt(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    /// Constant byte overhead added by encryption.
    fn size_const(&self) -> usize {
        0
    }
}

/// Payload compression capability.
///
/// The first `skip` bytes of a block are never compressed; they hold
/// the headers a salvage pass must be able to read without inflating
/// the block.
pub trait Compressor: Send + Sync {
    /// Compress `src` into `dst`; returns false when the output would
    /// not be smaller than the input, in which case `dst` is unspecified
    /// and the caller writes the raw block.
    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<bool>;

    /// Decompress `src` into `dst`, which the caller sizes to the
    /// recorded in-memory length.
    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;
}

/// An encryptor that copies bytes through unchanged.
///
/// Stands in wherever tests need the encryption code path exercised
/// without a real cipher.
#[derive(Debug, Default)]
pub struct NoopEncryptor;

impl Encryptor for NoopEncryptor {
    fn encrypt(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        dst.extend_from_slice(src);
        Ok(())
    }

    fn decrypt(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        dst.extend_from_slice(src);
        Ok(())
    }
}

/// Hash-bucketed registry of keyed encryptors.
///
/// Keyed encryptors are customized per `(name, keyid)`: the same cipher
/// registered under one name can serve many tables, each with its own
/// key identifier. Entries live until the connection closes.
#[derive(Default)]
pub struct EncryptorRegistry {
    entries: DashMap<(String, String), Arc<dyn Encryptor>>,
}

impl EncryptorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        EncryptorRegistry::default()
    }

    /// Register an encryptor under `(name, keyid)`, replacing any
    /// previous registration.
    pub fn register(&self, name: &str, keyid: &str, encryptor: Arc<dyn Encryptor>) {
        self.entries
            .insert((name.to_string(), keyid.to_string()), encryptor);
    }

    /// Look up the encryptor for `(name, keyid)`.
    pub fn lookup(&self, name: &str, keyid: &str) -> Result<Arc<dyn Encryptor>> {
        self.entries
            .get(&(name.to_string(), keyid.to_string()))
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| {
                Error::InvalidArgument(format!("unknown encryptor: {name:?} keyid {keyid:?}"))
            })
    }

    /// Number of registered encryptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let reg = EncryptorRegistry::new();
        reg.register("noop", "k1", Arc::new(NoopEncryptor));
        assert!(reg.lookup("noop", "k1").is_ok());
        assert!(reg.lookup("noop", "k2").is_err());
        assert!(reg.lookup("aes", "k1").is_err());
    }

    #[test]
    fn test_duplicate_registration_replaces() {
        let reg = EncryptorRegistry::new();
        reg.register("noop", "k1", Arc::new(NoopEncryptor));
        reg.register("noop", "k1", Arc::new(NoopEncryptor));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_noop_roundtrip() {
        let enc = NoopEncryptor;
        let mut ct = Vec::new();
        enc.encrypt(b"payload", &mut ct).unwrap();
        let mut pt = Vec::new();
        enc.decrypt(&ct, &mut pt).unwrap();
        assert_eq!(pt, b"payload");
    }
}
