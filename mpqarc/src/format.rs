//! On-disk layout of the archive: header, hash entries, block entries.
//!
//! Every record here is little-endian with no padding. The 16-byte entry size
//! is load-bearing: the table cipher treats each table as a flat stream of
//! 32-bit words, so any size or ordering change breaks every existing archive.

use std::io::{self, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, WriteBytesExt};
use nom::bytes::complete::tag;
use nom::combinator::verify;
use nom::number::complete::{le_u16, le_u32};
use nom::sequence::tuple;
use nom::IResult;

/// `MPQ\x1A`, the archive signature.
pub const SIGNATURE: &[u8; 4] = b"MPQ\x1A";

/// Size of the fixed header at offset 0.
pub const HEADER_SIZE: u32 = 32;

/// Both tables are fixed at this many entries for the lifetime of an archive
/// written by this profile. Growth beyond it is not supported.
pub const TABLE_ENTRIES: usize = 2048;

/// Wire size of one hash or block entry.
pub const ENTRY_SIZE: usize = 16;

/// Sector size exponent: sector size is `512 << SECTOR_SHIFT`.
pub const SECTOR_SHIFT: u16 = 3;

/// Uncompressed bytes per sector (4096 in this profile).
pub const SECTOR_SIZE: usize = 512 << SECTOR_SHIFT;

/// The block table sits immediately after the header, the hash table after the
/// block table. Most MPQ tools put the tables at the end of the file instead;
/// the fixed layout is what makes the single rewrite-on-close possible.
pub const BLOCK_TABLE_OFFSET: u32 = HEADER_SIZE;
pub const HASH_TABLE_OFFSET: u32 = BLOCK_TABLE_OFFSET + (TABLE_ENTRIES * ENTRY_SIZE) as u32;

/// Logical size of an archive with no members: header plus both tables.
pub const EMPTY_ARCHIVE_SIZE: u32 = HASH_TABLE_OFFSET + (TABLE_ENTRIES * ENTRY_SIZE) as u32;

/// Fixed 32-byte header at file offset 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Logical size of the whole archive in bytes.
    pub file_size: u32,
    /// Format version; always 0 in this profile.
    pub version: u16,
    /// Sector size exponent.
    pub sector_shift: u16,
    pub hash_table_offset: u32,
    pub block_table_offset: u32,
    pub hash_table_len: u32,
    pub block_table_len: u32,
}

impl Header {
    /// The canonical header for an archive of `file_size` bytes written by
    /// this profile.
    pub fn for_profile(file_size: u32) -> Self {
        Header {
            file_size,
            version: 0,
            sector_shift: SECTOR_SHIFT,
            hash_table_offset: HASH_TABLE_OFFSET,
            block_table_offset: BLOCK_TABLE_OFFSET,
            hash_table_len: TABLE_ENTRIES as u32,
            block_table_len: TABLE_ENTRIES as u32,
        }
    }

    /// Whether this header matches the fixed layout this profile writes.
    pub fn matches_profile(&self) -> bool {
        self.version == 0
            && self.sector_shift == SECTOR_SHIFT
            && self.hash_table_offset == HASH_TABLE_OFFSET
            && self.block_table_offset == BLOCK_TABLE_OFFSET
            && self.hash_table_len == TABLE_ENTRIES as u32
            && self.block_table_len == TABLE_ENTRIES as u32
    }

    /// Uncompressed bytes per sector for this archive.
    pub fn sector_size(&self) -> usize {
        512usize << self.sector_shift
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(SIGNATURE)?;
        w.write_u32::<LittleEndian>(HEADER_SIZE)?;
        w.write_u32::<LittleEndian>(self.file_size)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_u16::<LittleEndian>(self.sector_shift)?;
        w.write_u32::<LittleEndian>(self.hash_table_offset)?;
        w.write_u32::<LittleEndian>(self.block_table_offset)?;
        w.write_u32::<LittleEndian>(self.hash_table_len)?;
        w.write_u32::<LittleEndian>(self.block_table_len)
    }
}

/// Parses a [Header] from the 32 bytes at the start of an archive.
pub fn header(input: &[u8]) -> IResult<&[u8], Header> {
    let (input, _) = tag(&SIGNATURE[..])(input)?;
    let (input, _header_size) = verify(le_u32, |size: &u32| *size == HEADER_SIZE)(input)?;
    let (input, (file_size, version, sector_shift)) = tuple((le_u32, le_u16, le_u16))(input)?;
    let (input, (hash_table_offset, block_table_offset, hash_table_len, block_table_len)) =
        tuple((le_u32, le_u32, le_u32, le_u32))(input)?;

    Ok((
        input,
        Header {
            file_size,
            version,
            sector_shift,
            hash_table_offset,
            block_table_offset,
            hash_table_len,
            block_table_len,
        },
    ))
}

/// What a hash entry's block field points at. On the wire this is a single
/// signed 32-bit field with two sentinel values; keeping it as an enum in
/// memory means probe logic never compares against magic integers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockRef {
    /// Slot was never used. Terminates a probe chain.
    Empty,
    /// Slot held a file that was removed. Keeps the probe chain alive and may
    /// be reused as an insertion target.
    Tombstone,
    /// Slot refers to this block table index.
    Block(u32),
}

impl BlockRef {
    const WIRE_EMPTY: u32 = 0xFFFF_FFFF;
    const WIRE_TOMBSTONE: u32 = 0xFFFF_FFFE;

    pub fn from_wire(word: u32) -> Self {
        match word {
            Self::WIRE_EMPTY => BlockRef::Empty,
            Self::WIRE_TOMBSTONE => BlockRef::Tombstone,
            index => BlockRef::Block(index),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            BlockRef::Empty => Self::WIRE_EMPTY,
            BlockRef::Tombstone => Self::WIRE_TOMBSTONE,
            BlockRef::Block(index) => index,
        }
    }
}

/// One hash table entry (16 bytes on the wire).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HashEntry {
    /// First verification word for the filename.
    pub hash_a: u32,
    /// Second verification word for the filename.
    pub hash_b: u32,
    /// Windows LANGID of the entry; always 0 in this profile.
    pub locale: u16,
    /// Target platform; always 0 in this profile.
    pub platform: u16,
    pub block: BlockRef,
}

impl HashEntry {
    /// A never-used slot. Serializes as all-0xFF bytes, matching what the
    /// reference implementation memsets fresh tables to.
    pub const EMPTY: HashEntry = HashEntry {
        hash_a: 0xFFFF_FFFF,
        hash_b: 0xFFFF_FFFF,
        locale: 0xFFFF,
        platform: 0xFFFF,
        block: BlockRef::Empty,
    };

    pub fn from_words(words: [u32; 4]) -> Self {
        HashEntry {
            hash_a: words[0],
            hash_b: words[1],
            locale: (words[2] & 0xFFFF) as u16,
            platform: (words[2] >> 16) as u16,
            block: BlockRef::from_wire(words[3]),
        }
    }

    pub fn to_words(self) -> [u32; 4] {
        [
            self.hash_a,
            self.hash_b,
            (self.platform as u32) << 16 | self.locale as u32,
            self.block.to_wire(),
        ]
    }
}

bitflags! {
    /// Storage flags of a block entry.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Sectors are PKWare-imploded with no method byte (retail-era
        /// archives; never written by this profile).
        const IMPLODED = 0x0000_0100;
        /// Sectors carry a compression method byte (this profile writes zlib).
        const COMPRESSED = 0x0000_0200;
        /// Payload is encrypted with the per-file key.
        const ENCRYPTED = 0x0001_0000;
        /// The file key is additionally mixed with the block position.
        const ADJUSTED_KEY = 0x0002_0000;
        /// The block holds a live file.
        const EXISTS = 0x8000_0000;
    }
}

/// One block table entry (16 bytes on the wire): either a live file's storage
/// span or a free region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockEntry {
    /// Byte offset of the block within the archive.
    pub offset: u32,
    /// Allocated (stored) size of the block in bytes.
    pub packed_size: u32,
    /// Uncompressed size of the member file; 0 for free regions.
    pub unpacked_size: u32,
    pub flags: BlockFlags,
}

impl BlockEntry {
    /// A slot not referring to any region at all.
    pub const VACANT: BlockEntry = BlockEntry {
        offset: 0,
        packed_size: 0,
        unpacked_size: 0,
        flags: BlockFlags::empty(),
    };

    /// Whether this entry records a free region: allocated space that no file
    /// occupies.
    pub fn is_free(&self) -> bool {
        self.offset != 0 && self.unpacked_size == 0 && self.flags.is_empty()
    }

    /// Whether this slot is unused and can record a new free region.
    pub fn is_vacant(&self) -> bool {
        self.offset == 0
            && self.packed_size == 0
            && self.unpacked_size == 0
            && self.flags.is_empty()
    }

    pub fn exists(&self) -> bool {
        self.flags.contains(BlockFlags::EXISTS)
    }

    pub fn from_words(words: [u32; 4]) -> Self {
        BlockEntry {
            offset: words[0],
            packed_size: words[1],
            unpacked_size: words[2],
            flags: BlockFlags::from_bits_retain(words[3]),
        }
    }

    pub fn to_words(self) -> [u32; 4] {
        [
            self.offset,
            self.packed_size,
            self.unpacked_size,
            self.flags.bits(),
        ]
    }
}
