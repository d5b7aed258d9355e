//! Address and checkpoint cookies.
//!
//! A block on disk is identified by an opaque address cookie: its file
//! offset, size and checksum, varint-packed with offset and size scaled
//! down by the allocation unit (both are always multiples of it, and
//! scaling keeps the packed form short). A checkpoint cookie strings
//! together the checkpoint version, the root block address, the three
//! persisted extent-list addresses and the file sizes.

use shale_core::{Error, PackStream, Result, UnpackStream};

/// Version number written into checkpoint cookies.
pub const CHECKPOINT_VERSION: u8 = 1;

/// The location of a single block: `(offset, size, checksum)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    /// Byte offset in the file; always a multiple of the allocation
    /// size and never zero (offset zero holds the file descriptor
    /// block)
    pub off: u64,
    /// Block size in bytes; a multiple of the allocation size
    pub size: u32,
    /// Checksum of the block contents
    pub cksum: u32,
}

impl Addr {
    /// Create an address cookie.
    pub fn new(off: u64, size: u32, cksum: u32) -> Self {
        Addr { off, size, cksum }
    }

    /// Pack onto a stream, scaled by `allocsize`. An absent address
    /// packs as three zeros; a real address can never collide with
    /// that encoding because offset zero is the descriptor block.
    pub fn pack(addr: Option<&Addr>, pack: &mut PackStream, allocsize: u32) {
        match addr {
            Some(a) => {
                pack.put_uint(a.off / allocsize as u64)
                    .put_uint(a.size as u64 / allocsize as u64)
                    .put_uint(a.cksum as u64);
            }
            None => {
                pack.put_uint(0).put_uint(0).put_uint(0);
            }
        }
    }

    /// Unpack from a stream, scaling by `allocsize`.
    pub fn unpack(stream: &mut UnpackStream<'_>, allocsize: u32) -> Result<Option<Addr>> {
        let off = stream.get_uint().map_err(Error::from)?;
        let size = stream.get_uint().map_err(Error::from)?;
        let cksum = stream.get_uint().map_err(Error::from)?;
        if size == 0 {
            return Ok(None);
        }
        if off == 0 {
            return Err(Error::CorruptBlock(
                "address cookie offset names the descriptor block".to_string(),
            ));
        }
        let size = size * allocsize as u64;
        if size > u32::MAX as u64 || cksum > u32::MAX as u64 {
            return Err(Error::CorruptBlock("address cookie field overflow".to_string()));
        }
        Ok(Some(Addr {
            off: off * allocsize as u64,
            size: size as u32,
            cksum: cksum as u32,
        }))
    }

    /// Pack a single address into a fresh cookie buffer.
    pub fn to_cookie(&self, allocsize: u32) -> Vec<u8> {
        let mut pack = PackStream::new();
        Addr::pack(Some(self), &mut pack, allocsize);
        pack.into_bytes()
    }

    /// Unpack a single address from a cookie buffer.
    pub fn from_cookie(cookie: &[u8], allocsize: u32) -> Result<Addr> {
        let mut stream = UnpackStream::new(cookie);
        Addr::unpack(&mut stream, allocsize)?
            .ok_or_else(|| Error::CorruptBlock("empty address cookie".to_string()))
    }

    /// End of the block: `off + size`.
    pub fn end(&self) -> u64 {
        self.off + self.size as u64
    }
}

/// The decoded form of a checkpoint cookie.
///
/// Persisted opaquely in the metadata layer; only the block manager
/// cracks it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointCookie {
    /// Cookie format version
    pub version: u8,
    /// Root page, absent for a checkpoint of an empty tree
    pub root: Option<Addr>,
    /// Serialized alloc extent list
    pub alloc: Option<Addr>,
    /// Serialized avail extent list
    pub avail: Option<Addr>,
    /// Serialized discard extent list
    pub discard: Option<Addr>,
    /// File size when the checkpoint was taken
    pub file_size: u64,
    /// Bytes in the checkpoint (live allocation minus discards,
    /// accumulated across checkpoints)
    pub ckpt_size: u64,
}

impl CheckpointCookie {
    /// Encode the cookie.
    pub fn to_bytes(&self, allocsize: u32) -> Vec<u8> {
        let mut pack = PackStream::new();
        pack.put_uint(self.version as u64);
        Addr::pack(self.root.as_ref(), &mut pack, allocsize);
        Addr::pack(self.alloc.as_ref(), &mut pack, allocsize);
        Addr::pack(self.avail.as_ref(), &mut pack, allocsize);
        Addr::pack(self.discard.as_ref(), &mut pack, allocsize);
        pack.put_uint(self.file_size).put_uint(self.ckpt_size);
        pack.into_bytes()
    }

    /// Decode a cookie, verifying the version.
    pub fn from_bytes(cookie: &[u8], allocsize: u32) -> Result<Self> {
        let mut stream = UnpackStream::new(cookie);
        let version = stream.get_uint().map_err(Error::from)?;
        if version != CHECKPOINT_VERSION as u64 {
            return Err(Error::CorruptBlock(format!(
                "unexpected checkpoint cookie version {version}"
            )));
        }
        let root = Addr::unpack(&mut stream, allocsize)?;
        let alloc = Addr::unpack(&mut stream, allocsize)?;
        let avail = Addr::unpack(&mut stream, allocsize)?;
        let discard = Addr::unpack(&mut stream, allocsize)?;
        let file_size = stream.get_uint().map_err(Error::from)?;
        let ckpt_size = stream.get_uint().map_err(Error::from)?;
        Ok(CheckpointCookie {
            version: version as u8,
            root,
            alloc,
            avail,
            discard,
            file_size,
            ckpt_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_cookie_roundtrip() {
        let addr = Addr::new(512, 1024, 0xdeadbeef);
        let cookie = addr.to_cookie(512);
        assert_eq!(Addr::from_cookie(&cookie, 512).unwrap(), addr);
    }

    #[test]
    fn test_absent_addr_roundtrip() {
        let mut pack = PackStream::new();
        Addr::pack(None, &mut pack, 512);
        let bytes = pack.into_bytes();
        let mut stream = UnpackStream::new(&bytes);
        assert_eq!(Addr::unpack(&mut stream, 512).unwrap(), None);
    }

    #[test]
    fn test_checkpoint_cookie_roundtrip() {
        let ci = CheckpointCookie {
            version: CHECKPOINT_VERSION,
            root: Some(Addr::new(4096, 4096, 1)),
            alloc: Some(Addr::new(8192, 4096, 2)),
            avail: Some(Addr::new(12288, 4096, 3)),
            discard: None,
            file_size: 1 << 20,
            ckpt_size: 3 * 4096,
        };
        let bytes = ci.to_bytes(4096);
        assert_eq!(CheckpointCookie::from_bytes(&bytes, 4096).unwrap(), ci);
    }

    #[test]
    fn test_empty_checkpoint_cookie_roundtrip() {
        let ci = CheckpointCookie {
            version: CHECKPOINT_VERSION,
            file_size: 4096,
            ..Default::default()
        };
        let bytes = ci.to_bytes(4096);
        let read = CheckpointCookie::from_bytes(&bytes, 4096).unwrap();
        assert_eq!(read.root, None);
        assert_eq!(read.file_size, 4096);
    }

    #[test]
    fn test_bad_version_rejected() {
        let ci = CheckpointCookie {
            version: CHECKPOINT_VERSION,
            ..Default::default()
        };
        let mut bytes = ci.to_bytes(512);
        bytes[0] = 0x80 | 9;
        assert!(matches!(
            CheckpointCookie::from_bytes(&bytes, 512),
            Err(Error::CorruptBlock(_))
        ));
    }
}
