//! Read-only access to an existing archive.
//!
//! An [MpqArchive] loads and decrypts the header and both tables once at open
//! time and never mutates on-disk state. Individual file reads go through a
//! [SectorTable] guard whose construction reads (and, for encrypted files,
//! decrypts) the file's sector offset table; the decrypted offsets live
//! exactly as long as the guard.
//!
//! A single handle is not safe for concurrent use: sector reads seek the
//! underlying file. Concurrent readers should each hold a [MpqArchive::try_clone],
//! which duplicates the file handle and shares the parsed tables.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::debug;

use crate::crypto::{self, HashPurpose};
use crate::format::{self, BlockEntry, BlockFlags, Header};
use crate::sector::{decompress_sector, SectorError};
use crate::tables::{BlockTable, HashTable};

#[derive(Error, Debug)]
pub enum MpqError {
    /// The named member is not in the archive. Expected, not exceptional.
    #[error("file not found in archive")]
    FileNotFound,
    /// The archive exists but its header or tables are not usable.
    #[error("malformed archive: {0}")]
    Format(String),
    #[error("failed to decompress sector")]
    Sector(#[from] SectorError),
    #[error("archive I/O failed")]
    Io(#[from] io::Error),
}

/// A read-only handle to one archive.
#[derive(Debug)]
pub struct MpqArchive {
    file: File,
    path: PathBuf,
    header: Header,
    hash_table: Arc<HashTable>,
    block_table: Arc<BlockTable>,
}

impl MpqArchive {
    /// Opens an archive for reading. A path that does not exist is a normal
    /// `Ok(None)` outcome; an existing file that is not a valid archive is an
    /// error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Option<Self>, MpqError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::from_file(file, path.to_path_buf()).map(Some)
    }

    fn from_file(mut file: File, path: PathBuf) -> Result<Self, MpqError> {
        let actual_size = file.metadata()?.len();
        if actual_size < format::HEADER_SIZE as u64 {
            return Err(MpqError::Format(format!(
                "{} bytes is too small to hold an archive header",
                actual_size
            )));
        }

        let mut header_bytes = [0u8; format::HEADER_SIZE as usize];
        file.read_exact(&mut header_bytes)?;
        let (_, header) = format::header(&header_bytes)
            .map_err(|_| MpqError::Format("bad signature or header".into()))?;

        if header.version != 0 {
            return Err(MpqError::Format(format!(
                "unsupported format version {}",
                header.version
            )));
        }
        if header.sector_shift > 15 {
            return Err(MpqError::Format(format!(
                "unreasonable sector size exponent {}",
                header.sector_shift
            )));
        }
        if header.file_size as u64 > actual_size {
            return Err(MpqError::Format(format!(
                "archive truncated: header declares {} bytes, file holds {}",
                header.file_size, actual_size
            )));
        }

        let hash_words = read_table_words(
            &mut file,
            &header,
            header.hash_table_offset,
            header.hash_table_len,
            crypto::hash("(hash table)", HashPurpose::FileKey),
        )?;
        let hash_table = HashTable::from_words(&hash_words)
            .map_err(|e| MpqError::Format(e.to_string()))?;

        let block_words = read_table_words(
            &mut file,
            &header,
            header.block_table_offset,
            header.block_table_len,
            crypto::hash("(block table)", HashPurpose::FileKey),
        )?;
        let block_table = BlockTable::from_words(&block_words);

        debug!(
            path = %path.display(),
            size = header.file_size,
            hash_entries = header.hash_table_len,
            block_entries = header.block_table_len,
            "opened archive"
        );

        Ok(MpqArchive {
            file,
            path,
            header,
            hash_table: Arc::new(hash_table),
            block_table: Arc::new(block_table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Resolves a filename to its block table index.
    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.hash_table.block_of(name)
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Uncompressed size of a member file.
    pub fn unpacked_size(&self, name: &str) -> Result<u32, MpqError> {
        Ok(self.block_entry(name)?.unpacked_size)
    }

    /// Reads and decompresses a whole member file.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, MpqError> {
        let mut sectors = self.open_sector_table(name)?;
        let mut out = Vec::with_capacity(sectors.unpacked_size() as usize);
        for index in 0..sectors.sector_count() {
            out.append(&mut sectors.read_sector(index)?);
        }
        Ok(out)
    }

    /// Opens the sector offset table of a member file, returning a guard for
    /// per-sector reads. The decrypted offsets are cached on the guard and
    /// dropped with it.
    pub fn open_sector_table(&mut self, name: &str) -> Result<SectorTable<'_>, MpqError> {
        let entry = *self.block_entry(name)?;

        let end = entry.offset as u64 + entry.packed_size as u64;
        if end > self.header.file_size as u64 {
            return Err(MpqError::Format(format!(
                "block [{}, {}) lies outside the archive",
                entry.offset, end
            )));
        }

        let sector_size = self.header.sector_size();
        let sector_count = (entry.unpacked_size as usize + sector_size - 1) / sector_size;

        let key = if entry.flags.contains(BlockFlags::ENCRYPTED) {
            let base = crypto::file_key(name);
            Some(if entry.flags.contains(BlockFlags::ADJUSTED_KEY) {
                crypto::adjusted_file_key(base, entry.offset, entry.unpacked_size)
            } else {
                base
            })
        } else {
            None
        };

        let offsets = if entry
            .flags
            .intersects(BlockFlags::COMPRESSED | BlockFlags::IMPLODED)
        {
            self.read_offset_table(&entry, sector_count, key)?
        } else {
            // Uncompressed files carry no offset table; sectors lie back to
            // back at sector-size strides.
            (0..=sector_count)
                .map(|i| (i * sector_size).min(entry.unpacked_size as usize) as u32)
                .collect()
        };

        Ok(SectorTable {
            archive: self,
            entry,
            offsets,
            key,
            sector_size,
        })
    }

    /// Duplicates this handle for use from another thread. The file handle is
    /// duplicated; the parsed tables are shared.
    pub fn try_clone(&self) -> Result<Self, MpqError> {
        Ok(MpqArchive {
            file: self.file.try_clone()?,
            path: self.path.clone(),
            header: self.header.clone(),
            hash_table: Arc::clone(&self.hash_table),
            block_table: Arc::clone(&self.block_table),
        })
    }

    fn block_entry(&self, name: &str) -> Result<&BlockEntry, MpqError> {
        let index = self.resolve(name).ok_or(MpqError::FileNotFound)?;
        let entry = self.block_table.get(index).ok_or_else(|| {
            MpqError::Format(format!(
                "hash entry points at block {index} of {}",
                self.block_table.len()
            ))
        })?;
        if !entry.exists() {
            return Err(MpqError::FileNotFound);
        }
        Ok(entry)
    }

    fn read_offset_table(
        &mut self,
        entry: &BlockEntry,
        sector_count: usize,
        key: Option<u32>,
    ) -> Result<SmallVec<[u32; 16]>, MpqError> {
        let table_bytes = (sector_count + 1) * 4;
        if table_bytes as u64 > entry.packed_size as u64 {
            return Err(MpqError::Format(
                "sector offset table larger than its block".into(),
            ));
        }

        let mut raw = vec![0u8; table_bytes];
        self.file.seek(SeekFrom::Start(entry.offset as u64))?;
        self.file.read_exact(&mut raw)?;

        let mut words = vec![0u32; sector_count + 1];
        LittleEndian::read_u32_into(&raw, &mut words);
        if let Some(key) = key {
            // The offset table is keyed one below the first sector.
            crypto::decrypt(&mut words, key.wrapping_sub(1));
        }

        let offsets: SmallVec<[u32; 16]> = SmallVec::from_vec(words);
        for pair in offsets.windows(2) {
            if pair[1] < pair[0] {
                return Err(MpqError::Format("sector offsets are not ordered".into()));
            }
        }
        if offsets[0] < table_bytes as u32 {
            return Err(MpqError::Format(
                "sector offsets overlap the offset table".into(),
            ));
        }
        if let Some(&last) = offsets.last() {
            if last > entry.packed_size {
                return Err(MpqError::Format(
                    "sector offsets run past the block".into(),
                ));
            }
        }

        Ok(offsets)
    }
}

/// Scoped access to one member file's sectors. Holds the decrypted sector
/// offset table for the duration of a read session.
#[derive(Debug)]
pub struct SectorTable<'a> {
    archive: &'a mut MpqArchive,
    entry: BlockEntry,
    offsets: SmallVec<[u32; 16]>,
    key: Option<u32>,
    sector_size: usize,
}

impl SectorTable<'_> {
    /// Number of sectors in the file. Zero for an empty file.
    pub fn sector_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Uncompressed size of the whole file.
    pub fn unpacked_size(&self) -> u32 {
        self.entry.unpacked_size
    }

    /// Uncompressed size of one sector. Every sector is full-size except
    /// possibly the last.
    pub fn unpacked_len(&self, index: usize) -> usize {
        let total = self.entry.unpacked_size as usize;
        let start = index * self.sector_size;
        self.sector_size.min(total.saturating_sub(start))
    }

    /// Reads and decompresses exactly one sector.
    pub fn read_sector(&mut self, index: usize) -> Result<Vec<u8>, MpqError> {
        if index >= self.sector_count() {
            return Err(MpqError::Format(format!(
                "sector {index} out of range ({} sectors)",
                self.sector_count()
            )));
        }

        let start = self.offsets[index];
        let end = self.offsets[index + 1];
        let mut packed = vec![0u8; (end - start) as usize];
        self.archive
            .file
            .seek(SeekFrom::Start(self.entry.offset as u64 + start as u64))?;
        self.archive.file.read_exact(&mut packed)?;

        if let Some(key) = self.key {
            decrypt_in_place(&mut packed, key.wrapping_add(index as u32));
        }

        Ok(decompress_sector(
            &packed,
            self.unpacked_len(index),
            self.entry.flags,
        )?)
    }
}

/// Decrypts every whole 32-bit word of a byte buffer in place, leaving any
/// trailing partial word untouched.
fn decrypt_in_place(bytes: &mut [u8], key: u32) {
    let word_count = bytes.len() / 4;
    if word_count == 0 {
        return;
    }
    let mut words = vec![0u32; word_count];
    LittleEndian::read_u32_into(&bytes[..word_count * 4], &mut words);
    crypto::decrypt(&mut words, key);
    LittleEndian::write_u32_into(&words, &mut bytes[..word_count * 4]);
}

/// Reads one encrypted table and returns its decrypted words.
fn read_table_words(
    file: &mut File,
    header: &Header,
    offset: u32,
    entry_count: u32,
    key: u32,
) -> Result<Vec<u32>, MpqError> {
    let byte_len = entry_count as u64 * format::ENTRY_SIZE as u64;
    if offset as u64 + byte_len > header.file_size as u64 {
        return Err(MpqError::Format(format!(
            "table [{offset}, {}) lies outside the archive",
            offset as u64 + byte_len
        )));
    }

    let mut raw = vec![0u8; byte_len as usize];
    file.seek(SeekFrom::Start(offset as u64))?;
    file.read_exact(&mut raw)?;

    let mut words = vec![0u32; raw.len() / 4];
    LittleEndian::read_u32_into(&raw, &mut words);
    crypto::decrypt(&mut words, key);
    Ok(words)
}
