//! Mutable archive sessions.
//!
//! A [MpqWriter] owns one archive for the duration of a write session: the
//! hash and block tables are fully resident in memory and mutated there by
//! add/remove/rename, and the header and both tables are rewritten at their
//! fixed offsets on [MpqWriter::flush]. Payload data is written as it is
//! added; only the index is deferred. A session that fails mid-flush can
//! leave the file truncated or inconsistent; there is no journal.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::crypto::{self, HashPurpose};
use crate::format::{
    self, BlockEntry, BlockFlags, Header, BLOCK_TABLE_OFFSET, EMPTY_ARCHIVE_SIZE,
    HASH_TABLE_OFFSET, SECTOR_SIZE,
};
use crate::sector::compress_sector;
use crate::tables::{BlockTable, HashTable, TableError};

/// Tail space left over after compression is returned to the free list only
/// when it is at least this large; smaller remainders stay as slack inside
/// the block rather than fragmenting the free list. Overridable per writer
/// via [MpqWriter::set_reclaim_threshold].
pub const DEFAULT_RECLAIM_THRESHOLD: u32 = 1024;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("table update failed: {0}")]
    Table(#[from] TableError),
    /// The member (or the archive as a whole) would exceed the format's
    /// 32-bit size fields.
    #[error("file too large for the archive format")]
    FileTooLarge,
    #[error("archive I/O failed")]
    Io(#[from] io::Error),
}

/// An archive open for writing. Exactly one writer should own a given archive
/// at a time; nothing enforces this beyond convention.
#[derive(Debug)]
pub struct MpqWriter {
    file: File,
    path: PathBuf,
    hash_table: HashTable,
    block_table: BlockTable,
    logical_size: u32,
    modified: bool,
    reclaim_threshold: u32,
}

impl MpqWriter {
    /// Opens an archive for writing, creating it if absent. An existing file
    /// whose header does not match this profile (or whose declared size
    /// disagrees with its actual size) is reinitialized as empty rather than
    /// rejected. A freshly initialized archive is marked modified so that
    /// closing always produces a valid file, even with no members added.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self, WriterError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let actual_size = file.metadata()?.len();
        let loaded = if actual_size >= format::HEADER_SIZE as u64 {
            load_existing(&mut file, actual_size)?
        } else {
            None
        };

        let writer = match loaded {
            Some((hash_table, block_table, logical_size)) => {
                debug!(path = %path.display(), size = logical_size, "opened archive for writing");
                MpqWriter {
                    file,
                    path,
                    hash_table,
                    block_table,
                    logical_size,
                    modified: false,
                    reclaim_threshold: DEFAULT_RECLAIM_THRESHOLD,
                }
            }
            None => {
                debug!(path = %path.display(), "initializing empty archive");
                MpqWriter {
                    file,
                    path,
                    hash_table: HashTable::new(),
                    block_table: BlockTable::new(),
                    logical_size: EMPTY_ARCHIVE_SIZE,
                    modified: true,
                    reclaim_threshold: DEFAULT_RECLAIM_THRESHOLD,
                }
            }
        };
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical size of the archive in bytes. The backing file is
    /// resized to this on flush.
    pub fn logical_size(&self) -> u32 {
        self.logical_size
    }

    /// Overrides [DEFAULT_RECLAIM_THRESHOLD] for this writer.
    pub fn set_reclaim_threshold(&mut self, threshold: u32) {
        self.reclaim_threshold = threshold;
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.hash_table.block_of(name).is_some()
    }

    /// Adds a member file, replacing any existing member of the same name.
    /// Replacement is always remove-then-add; nothing is updated in place.
    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<(), WriterError> {
        let unpacked_size = u32::try_from(data.len()).map_err(|_| WriterError::FileTooLarge)?;
        self.remove_file(name)?;

        let block_index = self.block_table.new_block()?;
        self.hash_table.insert(name, block_index)?;
        self.modified = true;
        trace!(name, size = unpacked_size, "adding file");

        if let Err(e) = self.write_contents(data, unpacked_size, block_index) {
            self.rollback_failed_add(name);
            return Err(e);
        }
        Ok(())
    }

    /// Tombstones a member and returns its storage to the free list. Returns
    /// false if no such member exists.
    pub fn remove_file(&mut self, name: &str) -> Result<bool, WriterError> {
        let Some(block_index) = self.hash_table.remove(name) else {
            return Ok(false);
        };
        let entry = self
            .block_table
            .get_mut(block_index)
            .ok_or(TableError::BadBlockIndex(block_index))?;
        let (offset, size) = (entry.offset, entry.packed_size);
        *entry = BlockEntry::VACANT;
        if size != 0 {
            self.block_table
                .release(offset, size, &mut self.logical_size)?;
        }
        self.modified = true;
        trace!(name, "removed file");
        Ok(true)
    }

    /// Renames a member without touching its payload: the old hash entry is
    /// tombstoned and a new one points at the same block. Returns false if
    /// `old` does not exist; renaming onto an existing name is an error.
    pub fn rename_file(&mut self, old: &str, new: &str) -> Result<bool, WriterError> {
        let Some(block_index) = self.hash_table.remove(old) else {
            return Ok(false);
        };
        match self.hash_table.insert(new, block_index) {
            Ok(_) => {
                self.modified = true;
                trace!(old, new, "renamed file");
                Ok(true)
            }
            Err(e) => {
                // Put the old entry back; the tombstone just created is
                // guaranteed to accept it.
                let _ = self.hash_table.insert(old, block_index);
                Err(e.into())
            }
        }
    }

    /// Rewrites the header and both tables at their fixed offsets and resizes
    /// the backing file to the logical size. The in-memory tables stay
    /// resident (and plaintext) for further mutation; only the scratch copies
    /// handed to the file are encrypted.
    pub fn flush(&mut self) -> Result<(), WriterError> {
        if !self.modified {
            return Ok(());
        }

        let mut header_bytes = Vec::with_capacity(format::HEADER_SIZE as usize);
        Header::for_profile(self.logical_size).write_to(&mut header_bytes)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;

        self.write_table(BLOCK_TABLE_OFFSET, self.block_table.to_words(), "(block table)")?;
        self.write_table(HASH_TABLE_OFFSET, self.hash_table.to_words(), "(hash table)")?;

        // Trailing free space may have been reclaimed; the file shrinks with
        // the logical size.
        self.file.set_len(self.logical_size as u64)?;
        self.modified = false;
        debug!(path = %self.path.display(), size = self.logical_size, "flushed archive");
        Ok(())
    }

    /// Flushes (if needed) and releases the session.
    pub fn close(mut self) -> Result<(), WriterError> {
        self.flush()?;
        debug!(path = %self.path.display(), "closed archive");
        Ok(())
    }

    fn write_contents(
        &mut self,
        data: &[u8],
        unpacked_size: u32,
        block_index: u32,
    ) -> Result<(), WriterError> {
        let sector_count = (data.len() + SECTOR_SIZE - 1) / SECTOR_SIZE;
        let table_bytes = 4 * (sector_count as u32 + 1);
        let alloc_size = unpacked_size
            .checked_add(table_bytes)
            .ok_or(WriterError::FileTooLarge)?;

        let offset = self
            .block_table
            .find_free(alloc_size, &mut self.logical_size)?;
        {
            let entry = self
                .block_table
                .get_mut(block_index)
                .ok_or(TableError::BadBlockIndex(block_index))?;
            *entry = BlockEntry {
                offset,
                packed_size: alloc_size,
                unpacked_size,
                flags: BlockFlags::EXISTS | BlockFlags::COMPRESSED,
            };
        }

        // The offset table is filled in as compression proceeds; compressed
        // sector sizes are not known in advance. First offset is the start of
        // the first sector, last offset is the end of the last sector, all
        // relative to the start of the block.
        let mut offsets: SmallVec<[u32; 16]> = SmallVec::with_capacity(sector_count + 1);
        let mut running = table_bytes;

        self.file
            .seek(SeekFrom::Start(offset as u64 + table_bytes as u64))?;
        for chunk in data.chunks(SECTOR_SIZE) {
            let stored = compress_sector(chunk)?;
            self.file.write_all(&stored)?;
            offsets.push(running);
            running += stored.len() as u32;
        }
        offsets.push(running);

        let mut table_buf = Vec::with_capacity(table_bytes as usize);
        for &sector_offset in &offsets {
            table_buf.write_u32::<LittleEndian>(sector_offset)?;
        }
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(&table_buf)?;

        // Compression usually beats the reservation; hand a large enough tail
        // back to the free list, keep a small one as slack.
        let packed_size = running;
        if packed_size < alloc_size {
            let remainder = alloc_size - packed_size;
            if remainder >= self.reclaim_threshold {
                self.block_table
                    .release(offset + packed_size, remainder, &mut self.logical_size)?;
                if let Some(entry) = self.block_table.get_mut(block_index) {
                    entry.packed_size = packed_size;
                }
            }
        }
        Ok(())
    }

    /// Undoes the table half of a failed add so no live entry points at a
    /// partially written block.
    fn rollback_failed_add(&mut self, name: &str) {
        let Some(block_index) = self.hash_table.remove(name) else {
            return;
        };
        if let Some(entry) = self.block_table.get_mut(block_index) {
            let (offset, size) = (entry.offset, entry.packed_size);
            *entry = BlockEntry::VACANT;
            if size != 0 {
                if let Err(e) = self
                    .block_table
                    .release(offset, size, &mut self.logical_size)
                {
                    warn!(name, error = %e, "could not reclaim block of failed add");
                }
            }
        }
    }

    fn write_table(
        &mut self,
        offset: u32,
        mut words: Vec<u32>,
        seed: &str,
    ) -> Result<(), WriterError> {
        crypto::encrypt(&mut words, crypto::hash(seed, HashPurpose::FileKey));
        let mut bytes = vec![0u8; words.len() * 4];
        LittleEndian::write_u32_into(&words, &mut bytes);
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }
}

impl Drop for MpqWriter {
    fn drop(&mut self) {
        if self.modified {
            if let Err(e) = self.flush() {
                warn!(path = %self.path.display(), error = %e, "failed to flush archive on drop");
            }
        }
    }
}

/// Loads the tables of an existing archive. `None` means the file is not a
/// valid archive of this profile and should be reinitialized.
#[allow(clippy::type_complexity)]
fn load_existing(
    file: &mut File,
    actual_size: u64,
) -> Result<Option<(HashTable, BlockTable, u32)>, WriterError> {
    let mut header_bytes = [0u8; format::HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header_bytes)?;

    let header = match format::header(&header_bytes) {
        Ok((_, header)) => header,
        Err(_) => return Ok(None),
    };
    if !header.matches_profile() || header.file_size as u64 != actual_size {
        return Ok(None);
    }

    let hash_words = read_table_words(
        file,
        HASH_TABLE_OFFSET,
        crypto::hash("(hash table)", HashPurpose::FileKey),
    )?;
    let block_words = read_table_words(
        file,
        BLOCK_TABLE_OFFSET,
        crypto::hash("(block table)", HashPurpose::FileKey),
    )?;

    let hash_table = HashTable::from_words(&hash_words).map_err(WriterError::Table)?;
    let block_table = BlockTable::from_words(&block_words);
    Ok(Some((hash_table, block_table, header.file_size)))
}

fn read_table_words(file: &mut File, offset: u32, key: u32) -> Result<Vec<u32>, WriterError> {
    let mut raw = vec![0u8; format::TABLE_ENTRIES * format::ENTRY_SIZE];
    file.seek(SeekFrom::Start(offset as u64))?;
    file.read_exact(&mut raw)?;

    let mut words = vec![0u32; raw.len() / 4];
    LittleEndian::read_u32_into(&raw, &mut words);
    crypto::decrypt(&mut words, key);
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_ok::assert_ok;

    #[test]
    fn fresh_archive_starts_at_the_empty_size() {
        let dir = assert_ok!(tempfile::tempdir());
        let writer = assert_ok!(MpqWriter::open_or_create(dir.path().join("new.mpq")));
        assert_eq!(writer.logical_size(), EMPTY_ARCHIVE_SIZE);
        assert!(!writer.has_file("anything"));
    }

    #[test]
    fn reclaim_threshold_controls_tail_slack() {
        let dir = assert_ok!(tempfile::tempdir());
        // Highly compressible: two 4096-byte sectors collapse to a few bytes
        // each, leaving a tail far above the default threshold.
        let data = vec![0u8; 8192];

        let mut keep_slack = assert_ok!(MpqWriter::open_or_create(dir.path().join("slack.mpq")));
        keep_slack.set_reclaim_threshold(u32::MAX);
        assert_ok!(keep_slack.add_file("big.bin", &data));
        let alloc_size = 8192 + 4 * 3;
        assert_eq!(
            keep_slack.logical_size(),
            EMPTY_ARCHIVE_SIZE + alloc_size
        );

        let mut reclaim = assert_ok!(MpqWriter::open_or_create(dir.path().join("reclaim.mpq")));
        assert_ok!(reclaim.add_file("big.bin", &data));
        // The tail is returned and, being at the logical end, shrinks the
        // archive below the full reservation.
        assert!(reclaim.logical_size() < EMPTY_ARCHIVE_SIZE + alloc_size);
    }

    #[test]
    fn rename_collision_restores_the_source() {
        let dir = assert_ok!(tempfile::tempdir());
        let mut writer = assert_ok!(MpqWriter::open_or_create(dir.path().join("r.mpq")));
        assert_ok!(writer.add_file("a.bin", b"aaa"));
        assert_ok!(writer.add_file("b.bin", b"bbb"));

        let err = writer.rename_file("a.bin", "b.bin").unwrap_err();
        assert!(matches!(
            err,
            WriterError::Table(TableError::DuplicateName)
        ));
        assert!(writer.has_file("a.bin"));
        assert!(writer.has_file("b.bin"));
    }

    #[test]
    fn rename_of_missing_file_is_false() {
        let dir = assert_ok!(tempfile::tempdir());
        let mut writer = assert_ok!(MpqWriter::open_or_create(dir.path().join("m.mpq")));
        assert_eq!(assert_ok!(writer.rename_file("ghost", "real")), false);
        assert_eq!(assert_ok!(writer.remove_file("ghost")), false);
    }
}
