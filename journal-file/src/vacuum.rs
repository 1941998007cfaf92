//! Removal of archived journal files under space, count and age limits.

use crate::error::Result;
use crate::filename::{FileKind, JournalFilename};
use journal_common::Microseconds;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct VacuumStats {
    pub removed_files: u64,
    pub freed_bytes: u64,
}

struct Candidate {
    path: PathBuf,
    kind: FileKind,
    size: u64,
}

impl Candidate {
    /// The timestamp retention is measured against: when the file's
    /// content began (archived) or when it was put aside (disposed).
    fn realtime(&self) -> u64 {
        match self.kind {
            FileKind::Archived { head_realtime, .. } => head_realtime,
            FileKind::Disposed { realtime, .. } => realtime,
            FileKind::Active => unreachable!("active files are never candidates"),
        }
    }
}

/// Delete archived and disposed files, oldest first, until the directory
/// fits `limit` bytes, holds at most `n_max_files` files and nothing is
/// older than the retention window. Active files are never touched.
#[tracing::instrument(skip_all, fields(dir = %dir.as_ref().display()))]
pub fn vacuum_directory(
    dir: impl AsRef<Path>,
    limit: u64,
    n_max_files: u64,
    max_retention_usec: Option<u64>,
    now: Microseconds,
) -> Result<VacuumStats> {
    let dir = dir.as_ref();
    let mut stats = VacuumStats::default();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
        Err(err) => return Err(err.into()),
    };

    let mut candidates = Vec::new();
    let mut usage = 0u64;
    let mut n_files = 0u64;

    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        let Some(parsed) = JournalFilename::parse(&name) else {
            continue;
        };

        let size = match entry.metadata() {
            Ok(meta) => meta.blocks() * 512,
            Err(err) => {
                warn!(file = %name, error = %err, "cannot stat journal file");
                continue;
            }
        };

        usage += size;
        n_files += 1;

        if parsed.kind != FileKind::Active {
            candidates.push(Candidate {
                path: entry.path(),
                kind: parsed.kind,
                size,
            });
        }
    }

    candidates.sort_by(|a, b| a.kind.cmp(&b.kind));

    for candidate in candidates {
        let aged_out = max_retention_usec.is_some_and(|retention| {
            candidate.realtime().saturating_add(retention) < now.get()
        });

        if !aged_out && usage <= limit && n_files <= n_max_files {
            break;
        }

        match std::fs::remove_file(&candidate.path) {
            Ok(()) => {
                debug!(file = %candidate.path.display(), size = candidate.size, "vacuumed");
                usage = usage.saturating_sub(candidate.size);
                n_files -= 1;
                stats.removed_files += 1;
                stats.freed_bytes += candidate.size;
            }
            Err(err) => {
                warn!(file = %candidate.path.display(), error = %err, "vacuum unlink failed");
            }
        }
    }

    if stats.removed_files > 0 {
        info!(
            removed = stats.removed_files,
            freed = stats.freed_bytes,
            "vacuumed journal directory"
        );
    }

    Ok(stats)
}
