//! Storage tiers and the runtime → persistent flush.
//!
//! Two tiers exist: the volatile *runtime* tier under `/run` and the
//! *persistent* tier under `/var`. Which tiers are live follows the
//! configured storage mode and, in `auto` mode, the presence of the
//! `flushed` flag file. All writable handles are constructed through
//! [`JournalTiers::open_all`], which is idempotent and called on every
//! write path, giving automatic recovery from a rotate that failed at
//! the create step.

use crate::config::{Config, SplitMode, Storage};
use crate::driver::{Driver, SD_MESSAGE_JOURNAL_FLUSHED};
use crate::error::{Result, ServerError};
use crate::shard::UserJournals;
use journal_common::{Id128, Microseconds, Priority};
use journal_file::{
    CompressionConfig, DirectoryReader, JournalError, JournalFileOptions, SeqnumSource,
    SpaceAccountant, SpaceMetrics, SpaceVerdict, WritableJournal, vacuum_directory,
};
use nix::sys::statvfs::statvfs;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Uids that always log to the system journal: the static system range,
/// the dynamic service range and the unprivileged nobody user.
const SYSTEM_UID_MAX: u32 = 999;
const DYNAMIC_UID_MIN: u32 = 61184;
const DYNAMIC_UID_MAX: u32 = 65519;
const NOBODY_UID: u32 = 65534;

pub fn uid_for_system_journal(uid: u32) -> bool {
    uid <= SYSTEM_UID_MAX
        || (DYNAMIC_UID_MIN..=DYNAMIC_UID_MAX).contains(&uid)
        || uid == NOBODY_UID
}

/// Filesystem layout the daemon works against; overridable for tests.
#[derive(Debug, Clone)]
pub struct Paths {
    pub runtime_root: PathBuf,
    pub system_root: PathBuf,
    pub flags_dir: PathBuf,
    pub kmsg_device: PathBuf,
}

impl Paths {
    pub fn system_default() -> Self {
        Self {
            runtime_root: PathBuf::from("/run/log/journal"),
            system_root: PathBuf::from("/var/log/journal"),
            flags_dir: PathBuf::from("/run/systemd/journal"),
            kmsg_device: PathBuf::from("/dev/kmsg"),
        }
    }

    /// Everything under one root; used by tests.
    pub fn under(root: &Path) -> Self {
        Self {
            runtime_root: root.join("run/log/journal"),
            system_root: root.join("var/log/journal"),
            flags_dir: root.join("run/systemd/journal"),
            kmsg_device: root.join("dev/kmsg"),
        }
    }

    pub fn flushed_flag(&self) -> PathBuf {
        self.flags_dir.join("flushed")
    }

    pub fn rotated_flag(&self) -> PathBuf {
        self.flags_dir.join("rotated")
    }

    pub fn synced_flag(&self) -> PathBuf {
        self.flags_dir.join("synced")
    }
}

/// Touch a flag file; readers use its mtime as the signal.
pub fn touch_flag(path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let result = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .and_then(|file| file.set_times(std::fs::FileTimes::new().set_modified(std::time::SystemTime::now())));

    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "cannot touch flag file");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlushStats {
    pub n_entries: u64,
    pub elapsed: Duration,
}

#[derive(Clone, Copy)]
enum Tier {
    Runtime,
    System,
    User(u32),
}

pub struct JournalTiers {
    storage: Storage,
    split_mode: SplitMode,
    compression: CompressionConfig,
    seal: bool,
    max_retention_usec: Option<u64>,
    max_file_usec: Option<u64>,

    paths: Paths,
    machine_id: Id128,
    boot_id: Id128,
    seqnum_id: Id128,
    seqnum_source: SeqnumSource,
    driver: Driver,

    configured_runtime: journal_file::ConfiguredMetrics,
    configured_system: journal_file::ConfiguredMetrics,

    runtime: Option<WritableJournal>,
    system: Option<WritableJournal>,
    user: UserJournals,

    runtime_accountant: Option<SpaceAccountant>,
    system_accountant: Option<SpaceAccountant>,
}

impl JournalTiers {
    pub fn new(config: &Config, paths: Paths, machine_id: Id128, boot_id: Id128) -> Self {
        Self {
            storage: config.storage,
            split_mode: config.split_mode,
            compression: CompressionConfig {
                threshold: config.compress,
            },
            seal: config.seal,
            max_retention_usec: config.max_retention_usec,
            max_file_usec: config.max_file_usec,
            paths,
            machine_id,
            boot_id,
            seqnum_id: Id128::random(),
            seqnum_source: SeqnumSource::new(0),
            driver: Driver::new(machine_id, boot_id),
            configured_runtime: config.runtime_metrics,
            configured_system: config.system_metrics,
            runtime: None,
            system: None,
            user: UserJournals::default(),
            runtime_accountant: None,
            system_accountant: None,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn runtime_machine_dir(&self) -> PathBuf {
        self.paths.runtime_root.join(self.machine_id.to_string())
    }

    pub fn system_machine_dir(&self) -> PathBuf {
        self.paths.system_root.join(self.machine_id.to_string())
    }

    fn flushed(&self) -> bool {
        self.paths.flushed_flag().exists()
    }

    fn fs_size(dir: &Path) -> u64 {
        statvfs(dir)
            .map(|stat| stat.blocks() as u64 * stat.fragment_size() as u64)
            .unwrap_or(0)
    }

    fn file_options(&self, metrics: &SpaceMetrics) -> JournalFileOptions {
        JournalFileOptions::new(self.machine_id, self.boot_id, self.seqnum_id)
            .with_compression(self.compression)
            .with_seal(self.seal)
            .with_max_file_size(metrics.max_file_size)
            .with_tail_entry_seqnum(self.seqnum_source.last())
    }

    fn open_tier_file(
        &self,
        dir: &Path,
        filename: &str,
        metrics: &SpaceMetrics,
    ) -> Result<WritableJournal> {
        DirBuilder::new().recursive(true).mode(0o755).create(dir)?;

        let options = self.file_options(metrics);
        let mut journal = WritableJournal::reliably_open(dir.join(filename), &options)?;
        journal.attach_seqnum_source(self.seqnum_source.clone());
        Ok(journal)
    }

    /// The sole constructor of writable tier handles (the user shard
    /// variant lives in `find_user_journal`). Idempotent: with both
    /// relevant tiers live this returns without touching the disk.
    pub fn open_all(&mut self) -> Result<()> {
        if self.storage == Storage::None {
            return Ok(());
        }

        let want_system = matches!(self.storage, Storage::Persistent | Storage::Auto)
            && (self.storage == Storage::Persistent || self.flushed());

        if want_system && self.system.is_none() {
            let dir = self.system_machine_dir();
            let fs_size =
                Self::fs_size(self.paths.system_root.parent().unwrap_or(Path::new("/")));
            let metrics = SpaceMetrics::resolve(&self.configured_system, fs_size);

            match self.open_tier_file(&dir, "system.journal", &metrics) {
                Ok(journal) => {
                    info!(path = %journal.path().display(), "system journal open");
                    self.system = Some(journal);
                    let mut accountant = SpaceAccountant::new(&dir, metrics);
                    accountant.invalidate();
                    self.system_accountant = Some(accountant);
                }
                Err(err) => {
                    warn!(error = %err, "cannot open system journal");
                }
            }
        }

        // The runtime tier exists while the system tier cannot take
        // writes, and lingers when old runtime files still await a
        // flush.
        let runtime_dir = self.runtime_machine_dir();
        let want_runtime = match self.storage {
            Storage::None => false,
            Storage::Volatile => true,
            Storage::Auto | Storage::Persistent => {
                self.system.is_none() || runtime_dir.join("system.journal").exists()
            }
        };

        if want_runtime && self.runtime.is_none() {
            let fs_size =
                Self::fs_size(self.paths.runtime_root.parent().unwrap_or(Path::new("/")));
            let metrics = SpaceMetrics::resolve(&self.configured_runtime, fs_size);

            match self.open_tier_file(&runtime_dir, "system.journal", &metrics) {
                Ok(journal) => {
                    info!(path = %journal.path().display(), "runtime journal open");
                    self.runtime = Some(journal);
                    let mut accountant = SpaceAccountant::new(&runtime_dir, metrics);
                    accountant.invalidate();
                    self.runtime_accountant = Some(accountant);
                }
                Err(err) => {
                    if self.system.is_none() {
                        return Err(ServerError::RuntimeDirectory(std::io::Error::other(
                            err.to_string(),
                        )));
                    }
                    warn!(error = %err, "cannot open runtime journal");
                }
            }
        }

        Ok(())
    }

    /// Space verdict of the tier new records land in.
    pub fn current_space(&mut self) -> SpaceVerdict {
        let accountant = if self.system.is_some() {
            self.system_accountant.as_mut()
        } else {
            self.runtime_accountant.as_mut()
        };

        accountant.map(|a| a.verdict()).unwrap_or_default()
    }

    fn target_for(&self, uid: u32) -> Option<Tier> {
        if self.storage == Storage::None {
            return None;
        }

        let split = match self.split_mode {
            SplitMode::None => None,
            SplitMode::Uid => Some(uid),
            // Login splitting keys on the non-root real uid; root and
            // system uids fall through to the system journal.
            SplitMode::Login => (uid != 0).then_some(uid),
        };

        match split {
            Some(uid) if !uid_for_system_journal(uid) && self.system.is_some() => {
                Some(Tier::User(uid))
            }
            _ => {
                if self.system.is_some() {
                    Some(Tier::System)
                } else if self.runtime.is_some() {
                    Some(Tier::Runtime)
                } else {
                    None
                }
            }
        }
    }

    fn find_user_journal(&mut self, uid: u32) -> Result<&mut WritableJournal> {
        if self.user.get(uid).is_none() {
            let dir = self.system_machine_dir();
            let metrics = self
                .system_accountant
                .as_ref()
                .map(|a| *a.metrics())
                .unwrap_or_else(|| {
                    SpaceMetrics::resolve(&self.configured_system, Self::fs_size(&dir))
                });

            let filename = format!("user-{uid}.journal");
            let journal = self.open_tier_file(&dir, &filename, &metrics)?;

            // Grant the owning user read access to their shard; system
            // users get no such grant.
            let path = dir.join(&filename);
            if let Err(err) = nix::unistd::chown(
                &path,
                None,
                Some(nix::unistd::Gid::from_raw(uid)),
            ) {
                debug!(uid, error = %err, "cannot grant shard read access");
            }

            self.user.insert(uid, journal);
        }

        Ok(self.user.get(uid).unwrap())
    }

    fn journal_for(&mut self, tier: Tier) -> Result<Option<&mut WritableJournal>> {
        Ok(match tier {
            Tier::Runtime => self.runtime.as_mut(),
            Tier::System => self.system.as_mut(),
            Tier::User(uid) => Some(self.find_user_journal(uid)?),
        })
    }

    /// Append an entry for `uid`, retrying exactly once after a rotate
    /// and vacuum when the failure is of the transient-storage class.
    /// Returns false when storage is configured off or the retried write
    /// failed (logged, entry dropped).
    pub fn write_entry(
        &mut self,
        uid: u32,
        realtime: Microseconds,
        monotonic: Microseconds,
        items: &[(&[u8], &[u8])],
    ) -> Result<bool> {
        self.open_all()?;

        let Some(tier) = self.target_for(uid) else {
            return Ok(false);
        };

        // Honor the size and age thresholds before writing into a file
        // that is due for archival anyway.
        let max_file_usec = self.max_file_usec;
        let rotate_first = self
            .journal_for(tier)?
            .is_some_and(|journal| journal.rotate_suggested(max_file_usec, realtime));
        if rotate_first {
            self.rotate_tier(&tier)?;
            self.open_all()?;
        }

        let boot_id = self.boot_id;
        let Some(journal) = self.journal_for(tier)? else {
            return Ok(false);
        };

        match journal.append_entry(realtime, monotonic, boot_id, items) {
            Ok(_) => return Ok(true),
            Err(err) if err.is_transient() => {
                warn!(error = %err, "append failed, rotating and retrying");
            }
            Err(err) => return Err(err.into()),
        }

        self.rotate_tier(&tier)?;
        self.open_all()?;

        let Some(journal) = self.journal_for(tier)? else {
            warn!("no journal after rotation, dropping entry");
            return Ok(false);
        };

        match journal.append_entry(realtime, monotonic, boot_id, items) {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!(error = %err, "append failed after rotation, dropping entry");
                Ok(false)
            }
        }
    }

    fn rotate_tier(&mut self, tier: &Tier) -> Result<()> {
        match tier {
            Tier::Runtime => {
                if let Some(journal) = self.runtime.take() {
                    match journal.rotate() {
                        Ok(successor) => self.runtime = Some(successor),
                        Err(err) => warn!(error = %err, "runtime rotation failed"),
                    }
                }
                self.vacuum_runtime();
            }
            Tier::System => {
                if let Some(journal) = self.system.take() {
                    match journal.rotate() {
                        Ok(successor) => self.system = Some(successor),
                        Err(err) => warn!(error = %err, "system rotation failed"),
                    }
                }
                self.vacuum_system();
            }
            Tier::User(uid) => {
                if let Some(journal) = self.user.remove(*uid) {
                    match journal.rotate() {
                        Ok(successor) => {
                            self.user.replace(*uid, successor);
                        }
                        Err(err) => warn!(uid, error = %err, "user shard rotation failed"),
                    }
                }
                self.vacuum_system();
            }
        }
        Ok(())
    }

    fn vacuum_dir(
        dir: PathBuf,
        accountant: Option<&mut SpaceAccountant>,
        max_retention_usec: Option<u64>,
    ) {
        let Some(accountant) = accountant else {
            return;
        };

        accountant.invalidate();
        let verdict = accountant.verdict();
        let n_max_files = accountant.metrics().n_max_files;

        if let Err(err) = vacuum_directory(
            &dir,
            verdict.limit,
            n_max_files,
            max_retention_usec,
            Microseconds::now_realtime(),
        ) {
            warn!(dir = %dir.display(), error = %err, "vacuum failed");
        }

        accountant.invalidate();
    }

    pub fn vacuum_runtime(&mut self) {
        Self::vacuum_dir(
            self.runtime_machine_dir(),
            self.runtime_accountant.as_mut(),
            self.max_retention_usec,
        );
    }

    pub fn vacuum_system(&mut self) {
        Self::vacuum_dir(
            self.system_machine_dir(),
            self.system_accountant.as_mut(),
            self.max_retention_usec,
        );
    }

    /// Rotate every open file and vacuum both tiers.
    #[tracing::instrument(skip_all)]
    pub fn rotate_all(&mut self) {
        if let Some(journal) = self.system.take() {
            match journal.rotate() {
                Ok(successor) => self.system = Some(successor),
                Err(err) => warn!(error = %err, "system rotation failed"),
            }
        }

        if let Some(journal) = self.runtime.take() {
            match journal.rotate() {
                Ok(successor) => self.runtime = Some(successor),
                Err(err) => warn!(error = %err, "runtime rotation failed"),
            }
        }

        for (uid, journal) in self.user.drain() {
            match journal.rotate() {
                Ok(successor) => {
                    self.user.replace(uid, successor);
                }
                Err(err) => warn!(uid, error = %err, "user shard rotation failed"),
            }
        }

        self.vacuum_system();
        self.vacuum_runtime();
        touch_flag(&self.paths.rotated_flag());
    }

    /// Sync every open file to disk.
    pub fn sync_all(&mut self) {
        for journal in self
            .system
            .iter_mut()
            .chain(self.runtime.iter_mut())
        {
            if let Err(err) = journal.sync() {
                warn!(error = %err, "sync failed");
            }
        }

        for (uid, journal) in self.user.iter_mut() {
            if let Err(err) = journal.sync() {
                warn!(uid, error = %err, "user shard sync failed");
            }
        }

        touch_flag(&self.paths.synced_flag());
    }

    /// Whether the per-file age threshold suggests rotating now.
    pub fn rotate_suggested(&mut self, max_file_usec: Option<u64>) -> bool {
        let now = Microseconds::now_realtime();
        self.system
            .as_ref()
            .is_some_and(|j| j.rotate_suggested(max_file_usec, now))
            || self
                .runtime
                .as_ref()
                .is_some_and(|j| j.rotate_suggested(max_file_usec, now))
    }

    /// One-shot copy of all runtime entries into the persistent tier,
    /// after which the runtime directory is removed.
    ///
    /// Aborts (keeping the runtime tier intact) if an entry cannot be
    /// copied even after one rotation of the destination.
    #[tracing::instrument(skip_all)]
    pub fn flush_runtime_to_system(&mut self) -> Result<Option<FlushStats>> {
        if !matches!(self.storage, Storage::Auto | Storage::Persistent) {
            return Ok(None);
        }

        // The flag both signals readers and makes auto mode open the
        // persistent tier below.
        touch_flag(&self.paths.flushed_flag());
        self.open_all()?;

        if self.system.is_none() {
            warn!("flush requested but persistent tier is unavailable");
            return Ok(None);
        }

        let runtime_dir = self.runtime_machine_dir();
        if !runtime_dir.is_dir() {
            return Ok(None);
        }

        let start = Instant::now();
        let mut n_entries = 0u64;

        {
            let mut reader = DirectoryReader::open(&runtime_dir)?;
            while let Some(record) = reader.next_entry()? {
                let system = self.system.as_mut().unwrap();
                match system.copy_entry_from(&record) {
                    Ok(_) => {}
                    Err(err) if err.is_transient() => {
                        debug!(error = %err, "copy failed, rotating destination");
                        self.rotate_tier(&Tier::System)?;
                        self.open_all()?;

                        let Some(system) = self.system.as_mut() else {
                            warn!("persistent tier lost during flush, aborting");
                            return Err(ServerError::Journal(JournalError::NotWritable));
                        };
                        system.copy_entry_from(&record)?;
                    }
                    Err(err) => return Err(err.into()),
                }
                n_entries += 1;
            }
        }

        // Runtime contents now live in the persistent tier; drop the
        // writer and the directory.
        if let Some(runtime) = self.runtime.take() {
            if let Err(err) = runtime.close() {
                warn!(error = %err, "closing runtime journal failed");
            }
        }
        self.runtime_accountant = None;

        if let Err(err) = std::fs::remove_dir_all(&runtime_dir) {
            warn!(dir = %runtime_dir.display(), error = %err, "cannot remove runtime directory");
        }

        touch_flag(&self.paths.flushed_flag());

        let stats = FlushStats {
            n_entries,
            elapsed: start.elapsed(),
        };

        info!(
            entries = stats.n_entries,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "flushed runtime journal to persistent storage"
        );

        let items = self.driver.record(
            SD_MESSAGE_JOURNAL_FLUSHED,
            Priority::Info,
            &format!(
                "Time spent on flushing to /var is {}ms for {} entries.",
                stats.elapsed.as_millis(),
                stats.n_entries
            ),
            &[(b"JOURNAL_N_ENTRIES", stats.n_entries.to_string())],
        );
        self.write_driver_record(&items);

        Ok(Some(stats))
    }

    /// Store a prebuilt driver record; failures are logged, never
    /// re-reported.
    pub fn write_driver_record(&mut self, items: &[(Vec<u8>, Vec<u8>)]) {
        let borrowed: Vec<(&[u8], &[u8])> = items
            .iter()
            .map(|(name, value)| (name.as_slice(), value.as_slice()))
            .collect();

        let now = Microseconds::now_realtime();
        if let Err(err) = self.write_entry(0, now, Microseconds::now_monotonic(), &borrowed) {
            warn!(error = %err, "cannot store driver record");
        }
    }

    /// Offline everything; used at shutdown and before exec'ing a new
    /// daemon.
    pub fn close_all(&mut self) {
        for (uid, journal) in self.user.drain() {
            if let Err(err) = journal.close() {
                warn!(uid, error = %err, "closing user shard failed");
            }
        }

        if let Some(journal) = self.runtime.take() {
            if let Err(err) = journal.close() {
                warn!(error = %err, "closing runtime journal failed");
            }
        }

        if let Some(journal) = self.system.take() {
            if let Err(err) = journal.close() {
                warn!(error = %err, "closing system journal failed");
            }
        }
    }

    pub fn system_open(&self) -> bool {
        self.system.is_some()
    }

    pub fn runtime_open(&self) -> bool {
        self.runtime.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use journal_common::USEC_PER_SEC;

    fn test_tiers(root: &Path, storage: Storage) -> JournalTiers {
        let config = Config {
            storage,
            ..Config::default()
        };
        JournalTiers::new(
            &config,
            Paths::under(root),
            Id128([0xaa; 16]),
            Id128([0xbb; 16]),
        )
    }

    fn write_numbers(tiers: &mut JournalTiers, base_usec: u64, count: u64) {
        for i in 0..count {
            let value = (i + 1).to_string();
            let items: Vec<(&[u8], &[u8])> =
                vec![(b"MESSAGE", value.as_bytes()), (b"PRIORITY", b"6")];
            let now = Microseconds(base_usec + i * USEC_PER_SEC);
            assert!(tiers.write_entry(0, now, now, &items).unwrap());
        }
    }

    #[test]
    fn auto_without_flag_writes_runtime_only() {
        let root = tempfile::TempDir::new().unwrap();
        let mut tiers = test_tiers(root.path(), Storage::Auto);

        write_numbers(&mut tiers, 1_000_000, 3);

        assert!(tiers.runtime_open());
        assert!(!tiers.system_open());
        assert!(tiers.runtime_machine_dir().join("system.journal").exists());
        assert!(!tiers.system_machine_dir().join("system.journal").exists());
    }

    #[test]
    fn volatile_never_opens_system() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::File::create({
            let flag = Paths::under(root.path()).flushed_flag();
            std::fs::create_dir_all(flag.parent().unwrap()).unwrap();
            flag
        })
        .unwrap();

        let mut tiers = test_tiers(root.path(), Storage::Volatile);
        write_numbers(&mut tiers, 1_000_000, 2);

        assert!(!tiers.system_open());
        assert!(tiers.runtime_open());
    }

    #[test]
    fn storage_none_drops_everything() {
        let root = tempfile::TempDir::new().unwrap();
        let mut tiers = test_tiers(root.path(), Storage::None);

        let items: Vec<(&[u8], &[u8])> = vec![(b"MESSAGE", b"x")];
        let now = Microseconds(1_000_000);
        assert!(!tiers.write_entry(0, now, now, &items).unwrap());
        assert!(!tiers.runtime_open());
        assert!(!tiers.system_open());
    }

    #[test]
    fn open_all_is_idempotent() {
        let root = tempfile::TempDir::new().unwrap();
        let mut tiers = test_tiers(root.path(), Storage::Auto);

        tiers.open_all().unwrap();
        assert!(tiers.runtime_open());

        let path = tiers.runtime_machine_dir().join("system.journal");
        let mtime_before = std::fs::metadata(&path).unwrap().modified().unwrap();

        tiers.open_all().unwrap();
        tiers.open_all().unwrap();
        let mtime_after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[test]
    fn flush_moves_runtime_entries_to_system() {
        let root = tempfile::TempDir::new().unwrap();
        let mut tiers = test_tiers(root.path(), Storage::Auto);

        write_numbers(&mut tiers, 1_000_000, 5);
        assert!(!tiers.system_machine_dir().join("system.journal").exists());

        let stats = tiers.flush_runtime_to_system().unwrap().expect("flushed");
        assert_eq!(stats.n_entries, 5);

        // Runtime directory is gone, the persistent tier has the five
        // entries plus the flush driver record.
        assert!(!tiers.runtime_machine_dir().exists());
        assert!(tiers.system_open());

        tiers.close_all();
        let mut reader = DirectoryReader::open(tiers.system_machine_dir()).unwrap();
        let mut messages = Vec::new();
        let mut flush_records = 0;
        while let Some(record) = reader.next_entry().unwrap() {
            if let Some((_, id)) = record.items.iter().find(|(n, _)| n == b"MESSAGE_ID") {
                if id == SD_MESSAGE_JOURNAL_FLUSHED.as_bytes() {
                    flush_records += 1;
                    continue;
                }
            }
            let (_, message) = record
                .items
                .iter()
                .find(|(n, _)| n == b"MESSAGE")
                .unwrap();
            messages.push(String::from_utf8(message.clone()).unwrap());
        }

        assert_eq!(messages, vec!["1", "2", "3", "4", "5"]);
        assert_eq!(flush_records, 1);
        assert!(tiers.paths().flushed_flag().exists());
    }

    #[test]
    fn flag_makes_auto_open_system() {
        let root = tempfile::TempDir::new().unwrap();
        {
            let mut tiers = test_tiers(root.path(), Storage::Auto);
            write_numbers(&mut tiers, 1_000_000, 1);
            tiers.flush_runtime_to_system().unwrap();
            tiers.close_all();
        }

        // A fresh daemon sees the flag and goes straight to /var.
        let mut tiers = test_tiers(root.path(), Storage::Auto);
        write_numbers(&mut tiers, 10_000_000, 1);
        assert!(tiers.system_open());
        assert!(!tiers.runtime_open());
    }

    #[test]
    fn user_records_shard_by_uid() {
        let root = tempfile::TempDir::new().unwrap();
        let mut tiers = test_tiers(root.path(), Storage::Persistent);

        let now = Microseconds(1_000_000);
        let items: Vec<(&[u8], &[u8])> = vec![(b"MESSAGE", b"hi")];
        assert!(tiers.write_entry(1000, now, now, &items).unwrap());
        assert!(tiers.write_entry(450, now, now, &items).unwrap());

        let dir = tiers.system_machine_dir();
        assert!(dir.join("user-1000.journal").exists());
        // System uids share the system journal.
        assert!(!dir.join("user-450.journal").exists());
        assert!(dir.join("system.journal").exists());
    }

    #[test]
    fn split_mode_none_keeps_everything_in_system() {
        let root = tempfile::TempDir::new().unwrap();
        let config = Config {
            storage: Storage::Persistent,
            split_mode: SplitMode::None,
            ..Config::default()
        };
        let mut tiers = JournalTiers::new(
            &config,
            Paths::under(root.path()),
            Id128([0xaa; 16]),
            Id128([0xbb; 16]),
        );

        let now = Microseconds(1_000_000);
        let items: Vec<(&[u8], &[u8])> = vec![(b"MESSAGE", b"hi")];
        assert!(tiers.write_entry(1000, now, now, &items).unwrap());
        assert!(!tiers
            .system_machine_dir()
            .join("user-1000.journal")
            .exists());
    }

    #[test]
    fn seqnums_continue_across_tiers() {
        let root = tempfile::TempDir::new().unwrap();
        let mut tiers = test_tiers(root.path(), Storage::Persistent);

        let now = Microseconds(1_000_000);
        let items: Vec<(&[u8], &[u8])> = vec![(b"MESSAGE", b"a")];
        tiers.write_entry(0, now, now, &items).unwrap();
        tiers.write_entry(1000, Microseconds(2_000_000), Microseconds(2), &items).unwrap();
        tiers.write_entry(0, Microseconds(3_000_000), Microseconds(3), &items).unwrap();

        tiers.close_all();

        let mut reader = DirectoryReader::open(tiers.system_machine_dir()).unwrap();
        let mut seqnums = Vec::new();
        while let Some(record) = reader.next_entry().unwrap() {
            seqnums.push(record.seqnum);
        }
        seqnums.sort_unstable();
        assert_eq!(seqnums, vec![1, 2, 3]);
    }
}
