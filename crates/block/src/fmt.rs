//! On-disk header formats.
//!
//! Three fixed layouts, all little-endian:
//!
//! - **Descriptor block**: the first allocation unit of every file.
//!   Magic, version and a checksum over the unit with the checksum
//!   field zeroed.
//! - **Page header** (28 bytes): written by the tree layer at the start
//!   of every page image. The block manager treats it as opaque except
//!   during salvage, where it is the only clue a span is a page.
//! - **Block header** (12 bytes): block-manager-owned, immediately
//!   after the page header. Carries the on-disk size, the checksum and
//!   the data-checksum flag.

use byteorder::{ByteOrder, LittleEndian};
use shale_core::{Error, Result};

/// Magic number in every descriptor block.
pub const BLOCK_MAGIC: u32 = 120_897;
/// Major version of the file format.
pub const BLOCK_MAJOR_VERSION: u16 = 1;
/// Minor version of the file format.
pub const BLOCK_MINOR_VERSION: u16 = 0;

/// Size of the serialized descriptor fields (the rest of the first
/// allocation unit is zero padding).
pub const DESC_SIZE: usize = 12;

/// Size of the page header.
pub const PAGE_HEADER_SIZE: usize = 28;
/// Size of the block-manager header.
pub const BLOCK_HEADER_SIZE: usize = 12;
/// Offset of the block header within a block image.
pub const BLOCK_HEADER_OFFSET: usize = PAGE_HEADER_SIZE;
/// First byte of block data, after both headers.
pub const BLOCK_DATA_OFFSET: usize = PAGE_HEADER_SIZE + BLOCK_HEADER_SIZE;

/// Bytes skipped by compression and covered by the header-only
/// checksum. Both headers plus padding out to a fixed boundary so the
/// skip size never moves.
pub const BLOCK_COMPRESS_SKIP: usize = 64;

/// Checksum the whole block rather than just the compression-skip
/// prefix.
pub const BLOCK_DATA_CKSUM: u8 = 0x01;

/// Largest page image the block manager will write.
pub const BTREE_PAGE_SIZE_MAX: usize = 512 * 1024 * 1024;

/// Descriptor block, stored in the first allocation unit of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDesc {
    /// File magic
    pub magic: u32,
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Checksum over the descriptor unit with this field zeroed
    pub cksum: u32,
}

impl FileDesc {
    /// Build the descriptor for a new file.
    pub fn new() -> Self {
        FileDesc {
            magic: BLOCK_MAGIC,
            major: BLOCK_MAJOR_VERSION,
            minor: BLOCK_MINOR_VERSION,
            cksum: 0,
        }
    }

    /// Serialize into a zero-padded allocation unit, computing the
    /// checksum over the padded buffer with the checksum field zeroed.
    pub fn to_block(&self, allocsize: u32) -> Vec<u8> {
        let mut buf = vec![0u8; allocsize as usize];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u16(&mut buf[4..6], self.major);
        LittleEndian::write_u16(&mut buf[6..8], self.minor);
        let cksum = crc32fast::hash(&buf);
        LittleEndian::write_u32(&mut buf[8..12], cksum);
        buf
    }

    /// Parse and verify a descriptor unit.
    pub fn from_block(buf: &[u8]) -> Result<FileDesc> {
        if buf.len() < DESC_SIZE {
            return Err(Error::CorruptFile("descriptor block too small".to_string()));
        }
        let desc = FileDesc {
            magic: LittleEndian::read_u32(&buf[0..4]),
            major: LittleEndian::read_u16(&buf[4..6]),
            minor: LittleEndian::read_u16(&buf[6..8]),
            cksum: LittleEndian::read_u32(&buf[8..12]),
        };

        if desc.magic != BLOCK_MAGIC {
            return Err(Error::CorruptFile(format!(
                "bad file magic {:#x}, expected {:#x}",
                desc.magic, BLOCK_MAGIC
            )));
        }
        if desc.major > BLOCK_MAJOR_VERSION
            || (desc.major == BLOCK_MAJOR_VERSION && desc.minor > BLOCK_MINOR_VERSION)
        {
            return Err(Error::CorruptFile(format!(
                "unsupported file version {}.{}",
                desc.major, desc.minor
            )));
        }

        let mut copy = buf.to_vec();
        copy[8..12].fill(0);
        let expect = crc32fast::hash(&copy);
        if desc.cksum != expect {
            return Err(Error::CorruptFile(format!(
                "descriptor checksum {:#x} does not match computed {expect:#x}",
                desc.cksum
            )));
        }
        Ok(desc)
    }
}

impl Default for FileDesc {
    fn default() -> Self {
        FileDesc::new()
    }
}

/// Page types stored in the page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Block-manager-owned block (serialized extent lists)
    BlockManager = 1,
    /// Fixed-length column store leaf
    ColFix = 2,
    /// Column store internal
    ColInt = 3,
    /// Variable-length column store leaf
    ColVar = 4,
    /// Overflow item
    Ovfl = 5,
    /// Row store internal
    RowInt = 6,
    /// Row store leaf
    RowLeaf = 7,
}

impl PageType {
    /// Parse a page type byte.
    pub fn from_u8(v: u8) -> Option<PageType> {
        match v {
            1 => Some(PageType::BlockManager),
            2 => Some(PageType::ColFix),
            3 => Some(PageType::ColInt),
            4 => Some(PageType::ColVar),
            5 => Some(PageType::Ovfl),
            6 => Some(PageType::RowInt),
            7 => Some(PageType::RowLeaf),
            _ => None,
        }
    }
}

/// Page header flag: the page image is compressed.
pub const PAGE_COMPRESSED: u8 = 0x01;
/// Page header flag: all values on the page are empty.
pub const PAGE_EMPTY_V_ALL: u8 = 0x02;
/// Page header flag: no value on the page is empty.
pub const PAGE_EMPTY_V_NONE: u8 = 0x04;
/// Page header flag: the page image is encrypted.
pub const PAGE_ENCRYPTED: u8 = 0x08;
/// Page header flag: the page carries lookaside updates.
pub const PAGE_LAS_UPDATE: u8 = 0x10;

/// The 28-byte page header.
///
/// The layout is load-bearing: pages written by one build must parse in
/// every other, so the struct is packed (28 bytes, no padding) and its
/// size is asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PageHeader {
    /// Starting record number (column store), zero for row store
    pub recno: u64,
    /// Write generation, used by salvage to order candidate pages
    pub write_gen: u64,
    /// In-memory size of the page
    pub mem_size: u32,
    /// Entry count or overflow data length, per page type
    pub entries: u32,
    /// Page type
    pub page_type: u8,
    /// Flags
    pub flags: u8,
    /// Must be zero
    pub reserved: [u8; 2],
}

impl PageHeader {
    /// Create a header for a page image.
    pub fn new(page_type: PageType, recno: u64, write_gen: u64, mem_size: u32, entries: u32) -> Self {
        PageHeader {
            recno,
            write_gen,
            mem_size,
            entries,
            page_type: page_type as u8,
            flags: 0,
            reserved: [0; 2],
        }
    }

    /// Serialize into the first [`PAGE_HEADER_SIZE`] bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.recno);
        LittleEndian::write_u64(&mut buf[8..16], self.write_gen);
        LittleEndian::write_u32(&mut buf[16..20], self.mem_size);
        LittleEndian::write_u32(&mut buf[20..24], self.entries);
        buf[24] = self.page_type;
        buf[25] = self.flags;
        buf[26] = 0;
        buf[27] = 0;
    }

    /// Parse from the first [`PAGE_HEADER_SIZE`] bytes of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<PageHeader> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::CorruptBlock("short page header".to_string()));
        }
        Ok(PageHeader {
            recno: LittleEndian::read_u64(&buf[0..8]),
            write_gen: LittleEndian::read_u64(&buf[8..16]),
            mem_size: LittleEndian::read_u32(&buf[16..20]),
            entries: LittleEndian::read_u32(&buf[20..24]),
            page_type: buf[24],
            flags: buf[25],
            reserved: [buf[26], buf[27]],
        })
    }
}

/// The block-manager header following the page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// On-disk size of the block (aligned to the allocation unit)
    pub disk_size: u32,
    /// Block checksum, computed with this field zeroed
    pub cksum: u32,
    /// Flags ([`BLOCK_DATA_CKSUM`])
    pub flags: u8,
}

impl BlockHeader {
    /// Serialize into `buf` at [`BLOCK_HEADER_OFFSET`].
    pub fn write_to(&self, buf: &mut [u8]) {
        let b = &mut buf[BLOCK_HEADER_OFFSET..BLOCK_DATA_OFFSET];
        LittleEndian::write_u32(&mut b[0..4], self.disk_size);
        LittleEndian::write_u32(&mut b[4..8], self.cksum);
        b[8] = self.flags;
        b[9] = 0;
        b[10] = 0;
        b[11] = 0;
    }

    /// Parse from `buf` at [`BLOCK_HEADER_OFFSET`].
    pub fn read_from(buf: &[u8]) -> Result<BlockHeader> {
        if buf.len() < BLOCK_DATA_OFFSET {
            return Err(Error::CorruptBlock("short block header".to_string()));
        }
        let b = &buf[BLOCK_HEADER_OFFSET..BLOCK_DATA_OFFSET];
        Ok(BlockHeader {
            disk_size: LittleEndian::read_u32(&b[0..4]),
            cksum: LittleEndian::read_u32(&b[4..8]),
            flags: b[8],
        })
    }

    /// Zero the checksum field in a serialized block, as required
    /// before recomputing the checksum.
    pub fn zero_cksum(buf: &mut [u8]) {
        buf[BLOCK_HEADER_OFFSET + 4..BLOCK_HEADER_OFFSET + 8].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(std::mem::size_of::<PageHeader>(), PAGE_HEADER_SIZE);
    const_assert_eq!(BLOCK_DATA_OFFSET, 40);

    #[test]
    fn test_descriptor_roundtrip() {
        let desc = FileDesc::new();
        let block = desc.to_block(512);
        assert_eq!(block.len(), 512);

        let read = FileDesc::from_block(&block).unwrap();
        assert_eq!(read.magic, BLOCK_MAGIC);
        assert_eq!(read.major, BLOCK_MAJOR_VERSION);
        assert_eq!(read.minor, BLOCK_MINOR_VERSION);
    }

    #[test]
    fn test_descriptor_detects_corruption() {
        let mut block = FileDesc::new().to_block(512);
        block[100] ^= 0xff;
        assert!(matches!(
            FileDesc::from_block(&block),
            Err(Error::CorruptFile(_))
        ));
    }

    #[test]
    fn test_descriptor_rejects_bad_magic() {
        let mut block = FileDesc::new().to_block(512);
        block[0] ^= 0xff;
        assert!(matches!(
            FileDesc::from_block(&block),
            Err(Error::CorruptFile(_))
        ));
    }

    #[test]
    fn test_descriptor_rejects_future_version() {
        let mut desc = FileDesc::new();
        desc.major = BLOCK_MAJOR_VERSION + 1;
        let mut buf = vec![0u8; 512];
        LittleEndian::write_u32(&mut buf[0..4], desc.magic);
        LittleEndian::write_u16(&mut buf[4..6], desc.major);
        LittleEndian::write_u16(&mut buf[6..8], desc.minor);
        let cksum = crc32fast::hash(&buf);
        LittleEndian::write_u32(&mut buf[8..12], cksum);
        assert!(matches!(
            FileDesc::from_block(&buf),
            Err(Error::CorruptFile(_))
        ));
    }

    #[test]
    fn test_page_header_roundtrip() {
        let hdr = PageHeader::new(PageType::RowLeaf, 0, 7, 1234, 56);
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        hdr.write_to(&mut buf);
        let read = PageHeader::read_from(&buf).unwrap();
        assert_eq!(read, hdr);
        assert_eq!(PageType::from_u8(read.page_type), Some(PageType::RowLeaf));
    }

    #[test]
    fn test_block_header_roundtrip() {
        let hdr = BlockHeader {
            disk_size: 4096,
            cksum: 0xabad1dea,
            flags: BLOCK_DATA_CKSUM,
        };
        let mut buf = vec![0u8; BLOCK_DATA_OFFSET];
        hdr.write_to(&mut buf);
        assert_eq!(BlockHeader::read_from(&buf).unwrap(), hdr);

        BlockHeader::zero_cksum(&mut buf);
        assert_eq!(BlockHeader::read_from(&buf).unwrap().cksum, 0);
    }

    #[test]
    fn test_page_type_parse() {
        assert_eq!(PageType::from_u8(5), Some(PageType::Ovfl));
        assert_eq!(PageType::from_u8(0), None);
        assert_eq!(PageType::from_u8(8), None);
    }
}
