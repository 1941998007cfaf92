//! Disk-space accounting for a journal directory.
//!
//! The accountant combines the directory's on-disk usage with filesystem
//! free-space figures and the operator's ceilings into a cached verdict
//! `(limit, available)`. Re-querying the filesystem is rate-limited; most
//! writes are served from the cache.

use crate::error::Result;
use crate::filename::has_journal_extension;
use nix::sys::statvfs::statvfs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a verdict stays fresh.
const VERDICT_TTL: Duration = Duration::from_secs(30);

const DEFAULT_MIN_USE: u64 = 1024 * 1024;
const DEFAULT_MAX_USE_CAP: u64 = 4u64 * 1024 * 1024 * 1024;
const DEFAULT_KEEP_FREE_CAP: u64 = 4u64 * 1024 * 1024 * 1024;
const DEFAULT_MAX_FILE_SIZE_CAP: u64 = 128 * 1024 * 1024;
const DEFAULT_N_MAX_FILES: u64 = 100;

/// Operator-supplied ceilings, `None` meaning "derive from the
/// filesystem".
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredMetrics {
    pub max_use: Option<u64>,
    pub keep_free: Option<u64>,
    pub max_file_size: Option<u64>,
    pub n_max_files: Option<u64>,
}

/// Fully resolved ceilings for one journal directory.
#[derive(Debug, Clone, Copy)]
pub struct SpaceMetrics {
    pub min_use: u64,
    pub max_use: u64,
    pub keep_free: u64,
    pub max_file_size: u64,
    pub n_max_files: u64,
}

impl SpaceMetrics {
    /// Resolve configured values against the filesystem the directory
    /// lives on: defaults are 10 % of the filesystem for `max_use`
    /// (capped), 15 % kept free (capped), an eighth of `max_use` per
    /// file (capped).
    pub fn resolve(configured: &ConfiguredMetrics, fs_size: u64) -> Self {
        let max_use = configured
            .max_use
            .unwrap_or_else(|| (fs_size / 10).min(DEFAULT_MAX_USE_CAP))
            .max(DEFAULT_MIN_USE);

        let keep_free = configured
            .keep_free
            .unwrap_or_else(|| (fs_size * 15 / 100).min(DEFAULT_KEEP_FREE_CAP));

        let max_file_size = configured
            .max_file_size
            .unwrap_or_else(|| (max_use / 8).min(DEFAULT_MAX_FILE_SIZE_CAP))
            .max(crate::mmap::FILE_SIZE_INCREASE);

        Self {
            min_use: DEFAULT_MIN_USE.min(max_use),
            max_use,
            keep_free,
            max_file_size,
            n_max_files: configured.n_max_files.unwrap_or(DEFAULT_N_MAX_FILES),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpaceVerdict {
    pub vfs_used: u64,
    pub vfs_available: u64,
    pub limit: u64,
    pub available: u64,
}

pub struct SpaceAccountant {
    directory: PathBuf,
    metrics: SpaceMetrics,
    cached: Option<(Instant, SpaceVerdict)>,
}

/// Bytes of disk a directory's journal files occupy, counted in blocks
/// so sparse allocation is not overstated. Missing directories count as
/// empty; files that cannot be stat'ed are skipped.
pub fn directory_usage(dir: &Path) -> u64 {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut used = 0u64;
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        if !has_journal_extension(&name) {
            continue;
        }

        match entry.metadata() {
            Ok(meta) => used += meta.blocks() * 512,
            Err(err) => {
                warn!(file = %name, error = %err, "cannot stat journal file");
            }
        }
    }

    used
}

impl SpaceAccountant {
    pub fn new(directory: impl Into<PathBuf>, mut metrics: SpaceMetrics) -> Self {
        let directory = directory.into();

        // Raise min_use to what is already there, so a directory that
        // grew under a more generous configuration is not vacuumed down
        // in one burst.
        let used = directory_usage(&directory);
        if used > metrics.min_use {
            metrics.min_use = used.min(metrics.max_use);
        }

        Self {
            directory,
            metrics,
            cached: None,
        }
    }

    pub fn metrics(&self) -> &SpaceMetrics {
        &self.metrics
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Drop the cache; the next verdict re-queries the filesystem.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Current verdict, served from cache within the staleness window.
    pub fn verdict(&mut self) -> SpaceVerdict {
        let now = Instant::now();
        if let Some((at, verdict)) = self.cached {
            if now.duration_since(at) < VERDICT_TTL {
                return verdict;
            }
        }

        let verdict = self.determine();
        self.cached = Some((now, verdict));
        verdict
    }

    fn determine(&self) -> SpaceVerdict {
        let vfs_used = directory_usage(&self.directory);

        let vfs_available = match statvfs(&self.directory) {
            Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size() as u64,
            Err(err) => {
                debug!(dir = %self.directory.display(), error = %err, "statvfs failed");
                0
            }
        };

        let m = &self.metrics;
        let limit = m
            .max_use
            .min((vfs_used + vfs_available.saturating_sub(m.keep_free)).max(m.min_use));
        let available = limit.saturating_sub(vfs_used);

        SpaceVerdict {
            vfs_used,
            vfs_available,
            limit,
            available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> SpaceMetrics {
        SpaceMetrics {
            min_use: 1024,
            max_use: 1024 * 1024,
            keep_free: 0,
            max_file_size: 128 * 1024,
            n_max_files: 10,
        }
    }

    #[test]
    fn missing_directory_is_empty_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");

        assert_eq!(directory_usage(&missing), 0);

        let mut accountant = SpaceAccountant::new(&missing, metrics());
        let verdict = accountant.verdict();
        assert_eq!(verdict.vfs_used, 0);
        assert_eq!(verdict.vfs_available, 0);
        assert_eq!(verdict.available, verdict.limit);
    }

    #[test]
    fn usage_counts_only_journal_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("system.journal"), vec![0u8; 8192]).unwrap();
        std::fs::write(
            dir.path().join("system@00000000000000aa-00000000000000bb.journal~"),
            vec![0u8; 4096],
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), vec![0u8; 1 << 16]).unwrap();

        let used = directory_usage(dir.path());
        assert!(used >= 8192 + 4096, "used = {used}");
        assert!(used < 1 << 16, "used = {used}");
    }

    #[test]
    fn verdict_respects_max_use() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut accountant = SpaceAccountant::new(dir.path(), metrics());
        let verdict = accountant.verdict();

        assert!(verdict.limit <= 1024 * 1024);
        assert_eq!(verdict.available, verdict.limit - verdict.vfs_used);
    }

    #[test]
    fn verdict_is_cached() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut accountant = SpaceAccountant::new(dir.path(), metrics());
        let first = accountant.verdict();

        // New data appears, but the cache still answers.
        std::fs::write(dir.path().join("system.journal"), vec![0u8; 64 * 1024]).unwrap();
        let second = accountant.verdict();
        assert_eq!(first.vfs_used, second.vfs_used);

        accountant.invalidate();
        let third = accountant.verdict();
        assert!(third.vfs_used > second.vfs_used);
    }

    #[test]
    fn min_use_raised_to_existing_usage() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("system.journal"), vec![0u8; 256 * 1024]).unwrap();

        let accountant = SpaceAccountant::new(dir.path(), metrics());
        assert!(accountant.metrics().min_use >= 256 * 1024);
    }

    #[test]
    fn resolve_derives_from_filesystem() {
        let resolved = SpaceMetrics::resolve(&ConfiguredMetrics::default(), 100 * 1024 * 1024);
        assert_eq!(resolved.max_use, 10 * 1024 * 1024);
        assert_eq!(resolved.keep_free, 15 * 1024 * 1024);
        assert_eq!(resolved.n_max_files, DEFAULT_N_MAX_FILES);

        let configured = SpaceMetrics::resolve(
            &ConfiguredMetrics {
                max_use: Some(64 * 1024 * 1024),
                keep_free: Some(1024),
                max_file_size: Some(8 * 1024 * 1024),
                n_max_files: Some(7),
            },
            100 * 1024 * 1024,
        );
        assert_eq!(configured.max_use, 64 * 1024 * 1024);
        assert_eq!(configured.keep_free, 1024);
        assert_eq!(configured.max_file_size, 8 * 1024 * 1024);
        assert_eq!(configured.n_max_files, 7);
    }
}
