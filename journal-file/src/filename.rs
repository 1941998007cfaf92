//! Journal file naming.
//!
//! Three spellings exist side by side in a journal directory:
//!
//! - active: `system.journal`, `user-1000.journal`
//! - archived: `system@<seqnum-id>-<head-seqnum>-<head-realtime>.journal`
//!   (both counters as 16-digit hex)
//! - disposed: `system@<realtime>-<nonce>.journal~`, produced when a
//!   corrupt file is moved out of the way
//!
//! Names are parsed right to left: suffix first, then the `@` metadata,
//! then the base name.

use journal_common::Id128;
use std::cmp::Ordering;

/// Which logical stream a file belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    System,
    User(u32),
}

impl Source {
    fn parse(base: &str) -> Option<Self> {
        if base == "system" {
            Some(Source::System)
        } else if let Some(uid) = base.strip_prefix("user-") {
            uid.parse::<u32>().ok().map(Source::User)
        } else {
            None
        }
    }

    pub fn base_name(&self) -> String {
        match self {
            Source::System => String::from("system"),
            Source::User(uid) => format!("user-{uid}"),
        }
    }
}

/// Lifecycle stage encoded in the filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileKind {
    Active,
    Archived {
        seqnum_id: Id128,
        head_seqnum: u64,
        head_realtime: u64,
    },
    Disposed {
        realtime: u64,
        nonce: u64,
    },
}

impl Ord for FileKind {
    fn cmp(&self, other: &Self) -> Ordering {
        use FileKind::*;

        match (self, other) {
            // Disposed files sort first, oldest first.
            (
                Disposed {
                    realtime: t1,
                    nonce: n1,
                },
                Disposed {
                    realtime: t2,
                    nonce: n2,
                },
            ) => t1.cmp(t2).then_with(|| n1.cmp(n2)),
            (Disposed { .. }, _) => Ordering::Less,
            (_, Disposed { .. }) => Ordering::Greater,

            // Archived files by head realtime, seqnum id and head seqnum
            // only break ties for stability.
            (
                Archived {
                    seqnum_id: id1,
                    head_seqnum: s1,
                    head_realtime: t1,
                },
                Archived {
                    seqnum_id: id2,
                    head_seqnum: s2,
                    head_realtime: t2,
                },
            ) => t1
                .cmp(t2)
                .then_with(|| id1.cmp(id2))
                .then_with(|| s1.cmp(s2)),
            (Archived { .. }, Active) => Ordering::Less,
            (Active, Archived { .. }) => Ordering::Greater,

            (Active, Active) => Ordering::Equal,
        }
    }
}

impl PartialOrd for FileKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A parsed journal filename (no directory components).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalFilename {
    pub source: Source,
    pub kind: FileKind,
}

impl JournalFilename {
    pub fn parse(name: &str) -> Option<Self> {
        let (kind, base) = FileKind::parse(name)?;
        let source = Source::parse(base)?;
        Some(Self { source, kind })
    }

    /// Format the archived name a file takes when it is rotated away.
    pub fn format_archived(
        source: &Source,
        seqnum_id: Id128,
        head_seqnum: u64,
        head_realtime: u64,
    ) -> String {
        format!(
            "{}@{}-{:016x}-{:016x}.journal",
            source.base_name(),
            seqnum_id,
            head_seqnum,
            head_realtime
        )
    }

    /// Format the out-of-the-way name a corrupt file is renamed to.
    pub fn format_disposed(source: &Source, realtime: u64, nonce: u64) -> String {
        format!(
            "{}@{:016x}-{:016x}.journal~",
            source.base_name(),
            realtime,
            nonce
        )
    }
}

impl FileKind {
    /// Parse the lifecycle suffix, returning the kind and the base name.
    fn parse(name: &str) -> Option<(Self, &str)> {
        if let Some(stem) = name.strip_suffix(".journal") {
            let Some((base, meta)) = stem.rsplit_once('@') else {
                return Some((FileKind::Active, stem));
            };

            let mut parts = meta.split('-');
            let seqnum_id = parts.next()?;
            let head_seqnum = parts.next()?;
            let head_realtime = parts.next()?;
            if parts.next().is_some() {
                return None;
            }

            let seqnum_id = Id128::parse(seqnum_id).ok()?;
            let head_seqnum = u64::from_str_radix(head_seqnum, 16).ok()?;
            let head_realtime = u64::from_str_radix(head_realtime, 16).ok()?;

            Some((
                FileKind::Archived {
                    seqnum_id,
                    head_seqnum,
                    head_realtime,
                },
                base,
            ))
        } else if let Some(stem) = name.strip_suffix(".journal~") {
            let (base, meta) = stem.rsplit_once('@')?;
            let (realtime, nonce) = meta.rsplit_once('-')?;

            let realtime = u64::from_str_radix(realtime, 16).ok()?;
            let nonce = u64::from_str_radix(nonce, 16).ok()?;

            Some((FileKind::Disposed { realtime, nonce }, base))
        } else {
            None
        }
    }
}

/// Quick extension check used by space accounting, which must count files
/// whose names do not parse.
pub fn has_journal_extension(name: &str) -> bool {
    name.ends_with(".journal") || name.ends_with(".journal~")
}
