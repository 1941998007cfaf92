//! Append-only, content-addressed journal files.
//!
//! This crate implements the persistence engine of the logging service:
//! the chunked file format with its hash-linked objects, the append
//! contract with strict seqnum and realtime ordering, rotation into
//! archived files, disposal of damaged files, vacuuming under space and
//! retention limits, and a multi-file read cursor.

mod compress;
mod error;
mod file;
mod filename;
mod format;
mod hash;
mod mmap;
mod reader;
mod space;
mod vacuum;

pub use compress::CompressionConfig;
pub use error::{JournalError, Result};
pub use file::{
    EntryRecord, JournalFile, JournalFileOptions, ReadableJournal, Sealer, SeqnumSource,
    WritableJournal,
};
pub use filename::{FileKind, JournalFilename, Source, has_journal_extension};
pub use format::{IncompatibleFlag, JournalHeader, JournalState, ObjectType};
pub use hash::journal_hash_data;
pub use mmap::{MappedFile, MemoryMap, ReadMap};
pub use reader::DirectoryReader;
pub use space::{ConfiguredMetrics, SpaceAccountant, SpaceMetrics, SpaceVerdict, directory_usage};
pub use vacuum::{VacuumStats, vacuum_directory};
