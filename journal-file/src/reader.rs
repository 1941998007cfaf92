//! Sequential entry cursor over a directory of journal files.
//!
//! The reader snapshots the directory at open: every parseable
//! `*.journal` file is mapped and its entries merged into one sequence.
//! Ordering follows the same rules writers maintain: entries from files
//! sharing a seqnum id order by seqnum, entries from the same boot order
//! by monotonic time, everything else by realtime. The documented
//! `(seqnum_id, seqnum)` collision between a file and a reopened
//! predecessor resolves in favor of the file with the later mtime.

use crate::error::{JournalError, Result};
use crate::file::{EntryRecord, ReadableJournal};
use crate::filename::{FileKind, JournalFilename};
use journal_common::{Id128, Microseconds};
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One entry's merge key, resolved eagerly at open.
#[derive(Debug, Clone, Copy)]
struct MergedEntry {
    realtime: u64,
    monotonic: u64,
    seqnum: u64,
    seqnum_id: Id128,
    boot_id: Id128,
    file_idx: usize,
    offset: u64,
}

/// Cursor position: before the first entry, after the last, or on one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Head,
    Tail,
    At(usize),
}

pub struct DirectoryReader {
    files: Vec<ReadableJournal>,
    entries: Vec<MergedEntry>,
    position: Position,
}

fn merge_cmp(a: &MergedEntry, b: &MergedEntry) -> Ordering {
    if a.seqnum_id == b.seqnum_id {
        a.seqnum.cmp(&b.seqnum)
    } else if a.boot_id == b.boot_id {
        a.monotonic
            .cmp(&b.monotonic)
            .then_with(|| a.realtime.cmp(&b.realtime))
    } else {
        a.realtime.cmp(&b.realtime)
    }
}

impl DirectoryReader {
    /// Open every journal file under `dir` (recursively, so a tree of
    /// machine-id directories works too). Unreadable files are skipped
    /// with a warning; disposed files are never read.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(JournalError::NotADirectory);
        }

        let mut files = Vec::new();
        let mut mtimes = Vec::new();

        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable directory entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Some(parsed) = JournalFilename::parse(name) else {
                continue;
            };
            if matches!(parsed.kind, FileKind::Disposed { .. }) {
                continue;
            }

            match ReadableJournal::open(entry.path()) {
                Ok(journal) => {
                    let mtime = journal.mtime().unwrap_or(Microseconds(0));
                    files.push(journal);
                    mtimes.push(mtime);
                }
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "skipping journal file");
                }
            }
        }

        let mut entries = Vec::new();
        for (file_idx, journal) in files.iter().enumerate() {
            let seqnum_id = journal.seqnum_id();
            for offset in journal.entry_offsets()? {
                let header = journal.entry_header_at(offset)?;
                entries.push(MergedEntry {
                    realtime: header.realtime,
                    monotonic: header.monotonic,
                    seqnum: header.seqnum,
                    seqnum_id,
                    boot_id: Id128(header.boot_id),
                    file_idx,
                    offset,
                });
            }
        }

        entries.sort_by(merge_cmp);

        // Collapse seqnum collisions between a file and its reopened
        // predecessor: the later-mtime file is authoritative.
        entries.dedup_by(|b, a| {
            if a.seqnum_id == b.seqnum_id && a.seqnum == b.seqnum {
                if mtimes[b.file_idx] >= mtimes[a.file_idx] {
                    *a = *b;
                }
                debug!(seqnum = a.seqnum, "dropping duplicate seqnum");
                true
            } else {
                false
            }
        });

        Ok(Self {
            files,
            entries,
            position: Position::Head,
        })
    }

    pub fn n_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn seek_head(&mut self) {
        self.position = Position::Head;
    }

    pub fn seek_tail(&mut self) {
        self.position = Position::Tail;
    }

    fn resolve(&self, idx: usize) -> Result<EntryRecord> {
        let merged = &self.entries[idx];
        self.files[merged.file_idx].entry_record_at(merged.offset)
    }

    /// Step forward; `None` once the cursor passes the last entry.
    pub fn next_entry(&mut self) -> Result<Option<EntryRecord>> {
        let next = match self.position {
            Position::Head => {
                if self.entries.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            Position::At(idx) => {
                if idx + 1 < self.entries.len() {
                    Some(idx + 1)
                } else {
                    None
                }
            }
            Position::Tail => None,
        };

        match next {
            Some(idx) => {
                self.position = Position::At(idx);
                Ok(Some(self.resolve(idx)?))
            }
            None => {
                self.position = Position::Tail;
                Ok(None)
            }
        }
    }

    /// Step backward; `None` once the cursor passes the first entry.
    pub fn previous_entry(&mut self) -> Result<Option<EntryRecord>> {
        let previous = match self.position {
            Position::Tail => {
                if self.entries.is_empty() {
                    None
                } else {
                    Some(self.entries.len() - 1)
                }
            }
            Position::At(idx) => {
                if idx > 0 {
                    Some(idx - 1)
                } else {
                    None
                }
            }
            Position::Head => None,
        };

        match previous {
            Some(idx) => {
                self.position = Position::At(idx);
                Ok(Some(self.resolve(idx)?))
            }
            None => {
                self.position = Position::Head;
                Ok(None)
            }
        }
    }

    /// Step backward `n` times, returning where the cursor lands.
    pub fn previous_skip(&mut self, n: usize) -> Result<Option<EntryRecord>> {
        let mut last = None;
        for _ in 0..n {
            match self.previous_entry()? {
                Some(record) => last = Some(record),
                None => return Ok(last),
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{JournalFileOptions, WritableJournal};

    fn options(seqnum_id: u8) -> JournalFileOptions {
        JournalFileOptions::new(Id128([1; 16]), Id128([2; 16]), Id128([seqnum_id; 16]))
    }

    fn append(journal: &mut WritableJournal, usec: u64, value: &str) {
        journal
            .append_entry(
                Microseconds(usec),
                Microseconds(usec),
                Id128([2; 16]),
                &[(b"NUMBER", value.as_bytes())],
            )
            .unwrap();
    }

    fn values(records: &[EntryRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| String::from_utf8(r.items[0].1.clone()).unwrap())
            .collect()
    }

    #[test]
    fn merges_two_files_by_time() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut a = WritableJournal::create(dir.path().join("system.journal"), &options(0x10)).unwrap();
        let mut b =
            WritableJournal::create(dir.path().join("user-1000.journal"), &options(0x20)).unwrap();

        append(&mut a, 100, "1");
        append(&mut b, 200, "2");
        append(&mut a, 300, "3");
        append(&mut b, 400, "4");
        a.close().unwrap();
        b.close().unwrap();

        let mut reader = DirectoryReader::open(dir.path()).unwrap();
        assert_eq!(reader.n_entries(), 4);

        let mut forward = Vec::new();
        while let Some(record) = reader.next_entry().unwrap() {
            forward.push(record);
        }
        assert_eq!(values(&forward), vec!["1", "2", "3", "4"]);

        reader.seek_tail();
        let mut backward = Vec::new();
        while let Some(record) = reader.previous_entry().unwrap() {
            backward.push(record);
        }
        assert_eq!(values(&backward), vec!["4", "3", "2", "1"]);
    }

    #[test]
    fn previous_skip_lands_on_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut journal =
            WritableJournal::create(dir.path().join("system.journal"), &options(0x10)).unwrap();
        for (i, v) in ["1", "2", "3", "4"].iter().enumerate() {
            append(&mut journal, (i as u64 + 1) * 100, v);
        }
        journal.close().unwrap();

        let mut reader = DirectoryReader::open(dir.path()).unwrap();
        reader.seek_tail();
        let landed = reader.previous_skip(4).unwrap().unwrap();
        assert_eq!(landed.items[0].1, b"1");
    }

    #[test]
    fn empty_directory_reads_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut reader = DirectoryReader::open(dir.path()).unwrap();
        assert!(reader.is_empty());
        assert!(reader.next_entry().unwrap().is_none());
        reader.seek_tail();
        assert!(reader.previous_entry().unwrap().is_none());
    }

    #[test]
    fn same_seqnum_id_orders_by_seqnum_despite_backward_time() {
        let dir = tempfile::TempDir::new().unwrap();

        // Simulate a backward-moving clock handled by rotation: the
        // archived file holds the later realtime, its successor the
        // earlier one. Seqnum order must win.
        let mut journal =
            WritableJournal::create(dir.path().join("system.journal"), &options(0x10)).unwrap();
        append(&mut journal, 1_000_000, "first");
        let mut successor = journal.rotate().unwrap();
        append(&mut successor, 500_000, "second");
        successor.close().unwrap();

        let mut reader = DirectoryReader::open(dir.path()).unwrap();
        let mut forward = Vec::new();
        while let Some(record) = reader.next_entry().unwrap() {
            forward.push(record);
        }
        assert_eq!(values(&forward), vec!["first", "second"]);
    }

    #[test]
    fn disposed_files_are_not_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut journal =
            WritableJournal::create(dir.path().join("system.journal"), &options(0x10)).unwrap();
        append(&mut journal, 100, "kept");
        journal.close().unwrap();

        std::fs::write(
            dir.path()
                .join("system@0000000000000001-0000000000000002.journal~"),
            b"garbage",
        )
        .unwrap();

        let reader = DirectoryReader::open(dir.path()).unwrap();
        assert_eq!(reader.n_entries(), 1);
    }
}
