//! An implementation of the MPQ archive format as used for game save data:
//! one binary file multiplexing many compressed member files, indexed by a
//! fixed-size open-addressed hash table and a parallel block allocation
//! table. Reading and writing are independent components sharing the format
//! definitions: [MpqArchive] serves read requests from a finished archive,
//! [MpqWriter] builds or mutates one and rewrites the header and tables on
//! close.
//!
//! There is no on-disk directory of filenames: an archive only stores hashes,
//! so a member is only reachable by a caller that already knows its name.
//! This is a property of the format, not a limitation of the implementation.

pub mod crypto;
pub mod format;
pub mod reader;
pub mod sector;
pub mod tables;
pub mod writer;

pub use reader::{MpqArchive, MpqError, SectorTable};
pub use sector::SectorError;
pub use tables::TableError;
pub use writer::{MpqWriter, WriterError, DEFAULT_RECLAIM_THRESHOLD};
