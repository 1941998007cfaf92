//! The journal file: an append-only arena of hash-linked objects.
//!
//! A [`JournalFile`] is generic over its mapping so the same accessors
//! serve the writer (whole-file mutable map) and readers (read-only map).
//! Writers are exclusive per path; readers share the mapping with a live
//! writer and only ever observe appended data plus the single state byte
//! in the header.
//!
//! Cyclic structures (hash chains, entry arrays) are file offsets resolved
//! through the map, never in-memory pointers.

use crate::compress::{self, CompressionConfig};
use crate::error::{JournalError, Result};
use crate::filename::{FileKind, JournalFilename};
use crate::format::*;
use crate::hash::journal_hash_data;
use crate::mmap::{MappedFile, MemoryMap, ReadMap};
use journal_common::{Id128, Microseconds, field_name_is_valid};
use rand::Rng;
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

/// Capacity of the first entry array; each successor doubles, capped.
const FIRST_ENTRY_ARRAY_CAPACITY: u64 = 4;
const MAX_ENTRY_ARRAY_CAPACITY: u64 = 128 * 1024;

/// Fill ratio past which the data hash table degrades enough to prefer a
/// fresh file.
const HASH_TABLE_FILL_NUM: u64 = 3;
const HASH_TABLE_FILL_DEN: u64 = 4;

/// A capability that produces tamper-evidence tags appended to the file
/// when it goes offline. The cryptography behind it is not this crate's
/// concern.
pub trait Sealer {
    fn seal(&mut self, epoch: u64, data: &[u8]) -> [u8; 32];
}

/// A seqnum counter shared by every file of one chain owner.
///
/// Files holding the same [`SeqnumSource`] never reuse a seqnum even when
/// writes alternate between them; a file appending without a source falls
/// back to its own tail, which is how the documented collision with a
/// reopened successor arises.
#[derive(Debug, Clone, Default)]
pub struct SeqnumSource {
    last: Rc<Cell<u64>>,
}

impl SeqnumSource {
    pub fn new(last: u64) -> Self {
        Self {
            last: Rc::new(Cell::new(last)),
        }
    }

    pub fn last(&self) -> u64 {
        self.last.get()
    }

    /// Issue the next seqnum, never below `floor + 1`.
    fn next(&self, floor: u64) -> u64 {
        let next = (self.last.get() + 1).max(floor + 1);
        self.last.set(next);
        next
    }

    /// Fast-forward past seqnums observed elsewhere.
    pub fn observe(&self, seqnum: u64) {
        if seqnum > self.last.get() {
            self.last.set(seqnum);
        }
    }
}

/// Creation parameters for a writable journal file.
pub struct JournalFileOptions {
    pub machine_id: Id128,
    pub boot_id: Id128,
    pub seqnum_id: Id128,
    pub compression: CompressionConfig,
    pub seal: bool,
    pub max_file_size: u64,
    pub data_hash_table_buckets: u64,
    pub field_hash_table_buckets: u64,
    /// Seqnum of the predecessor's last entry; the first entry written
    /// here gets this plus one. Zero starts a fresh chain.
    pub tail_entry_seqnum: u64,
}

impl JournalFileOptions {
    pub fn new(machine_id: Id128, boot_id: Id128, seqnum_id: Id128) -> Self {
        Self {
            machine_id,
            boot_id,
            seqnum_id,
            compression: CompressionConfig::default(),
            seal: false,
            max_file_size: 128 * 1024 * 1024,
            data_hash_table_buckets: 4096,
            field_hash_table_buckets: 512,
            tail_entry_seqnum: 0,
        }
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_seal(mut self, seal: bool) -> Self {
        self.seal = seal;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_hash_table_buckets(mut self, data: u64, field: u64) -> Self {
        self.data_hash_table_buckets = data;
        self.field_hash_table_buckets = field;
        self
    }

    pub fn with_tail_entry_seqnum(mut self, seqnum: u64) -> Self {
        self.tail_entry_seqnum = seqnum;
        self
    }
}

/// One fully resolved entry, independent of any file mapping. Produced by
/// the read side, consumed by `copy_entry_from` during flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub seqnum: u64,
    pub seqnum_id: Id128,
    pub realtime: Microseconds,
    pub monotonic: Microseconds,
    pub boot_id: Id128,
    pub items: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Cached position of the tail entry array so appends do not rescan the
/// chain.
#[derive(Debug, Clone, Copy)]
struct EntryArrayTail {
    offset: u64,
    capacity: u64,
    used: u64,
}

pub struct JournalFile<M: MemoryMap> {
    path: PathBuf,
    file: File,
    map: M,
    compression: CompressionConfig,
    sealer: Option<Box<dyn Sealer>>,
    seqnum_source: Option<SeqnumSource>,
    max_file_size: u64,
    online: bool,
    append_offset: u64,
    ea_tail: Option<EntryArrayTail>,
}

impl<M: MemoryMap> std::fmt::Debug for JournalFile<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalFile")
            .field("path", &self.path)
            .field("compression", &self.compression)
            .field("max_file_size", &self.max_file_size)
            .field("online", &self.online)
            .field("append_offset", &self.append_offset)
            .field("ea_tail", &self.ea_tail)
            .finish_non_exhaustive()
    }
}

pub type WritableJournal = JournalFile<MappedFile>;
pub type ReadableJournal = JournalFile<ReadMap>;

// ── Shared accessors ─────────────────────────────────────────────

impl<M: MemoryMap> JournalFile<M> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &JournalHeader {
        // The header was validated at open; reborrowing cannot fail.
        JournalHeader::ref_from_prefix(self.map.bytes()).unwrap().0
    }

    pub fn seqnum_id(&self) -> Id128 {
        Id128(self.header().seqnum_id)
    }

    pub fn machine_id(&self) -> Id128 {
        Id128(self.header().machine_id)
    }

    pub fn n_entries(&self) -> u64 {
        self.header().n_entries
    }

    pub fn tail_entry_seqnum(&self) -> u64 {
        self.header().tail_entry_seqnum
    }

    /// Bytes of the file actually in use (trailing allocation slack is not
    /// counted).
    pub fn used_size(&self) -> u64 {
        self.append_offset
    }

    fn keyed_hash(&self) -> bool {
        self.header().has_incompatible_flag(IncompatibleFlag::KeyedHash)
    }

    pub fn hash(&self, data: &[u8]) -> u64 {
        let keyed = self.keyed_hash();
        journal_hash_data(data, keyed, if keyed { Some(&self.header().file_id) } else { None })
    }

    fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(JournalError::BadOffset(offset))?;
        if offset < HEADER_SIZE || end > self.map.bytes().len() as u64 {
            return Err(JournalError::BadOffset(offset));
        }
        Ok(&self.map.bytes()[offset as usize..end as usize])
    }

    fn read_struct<T: FromBytes + Copy>(&self, offset: u64) -> Result<T> {
        let bytes = self.slice(offset, std::mem::size_of::<T>() as u64)?;
        Ok(T::read_from_bytes(bytes).unwrap())
    }

    pub fn object_header_at(&self, offset: u64) -> Result<ObjectHeader> {
        if offset % OBJECT_ALIGNMENT != 0 {
            return Err(JournalError::BadOffset(offset));
        }

        let header: ObjectHeader = self.read_struct(offset)?;
        if ObjectType::from_byte(header.type_).is_none() {
            return Err(JournalError::Corrupted("unknown object type"));
        }
        if header.size < OBJECT_HEADER_SIZE {
            return Err(JournalError::Corrupted("object smaller than its header"));
        }

        // The whole object must lie within the mapping.
        self.slice(offset, header.size)?;
        Ok(header)
    }

    fn typed_object_at<T: FromBytes + Copy>(
        &self,
        offset: u64,
        expected: ObjectType,
    ) -> Result<T> {
        let header = self.object_header_at(offset)?;
        if header.type_ != expected as u8 {
            return Err(JournalError::InvalidObjectType {
                expected: expected as u8,
                found: header.type_,
            });
        }
        if (header.size as usize) < std::mem::size_of::<T>() {
            return Err(JournalError::Corrupted("object payload truncated"));
        }
        self.read_struct(offset)
    }

    pub fn data_header_at(&self, offset: u64) -> Result<DataObjectHeader> {
        self.typed_object_at(offset, ObjectType::Data)
    }

    pub fn field_header_at(&self, offset: u64) -> Result<FieldObjectHeader> {
        self.typed_object_at(offset, ObjectType::Field)
    }

    pub fn entry_header_at(&self, offset: u64) -> Result<EntryObjectHeader> {
        self.typed_object_at(offset, ObjectType::Entry)
    }

    pub fn entry_array_header_at(&self, offset: u64) -> Result<EntryArrayObjectHeader> {
        self.typed_object_at(offset, ObjectType::EntryArray)
    }

    /// Raw stored payload of a DATA object plus its compression flags.
    pub fn data_payload_at(&self, offset: u64) -> Result<(u8, &[u8])> {
        let header = self.data_header_at(offset)?;
        let payload = self.slice(
            offset + DATA_OBJECT_HEADER_SIZE,
            header.object.size - DATA_OBJECT_HEADER_SIZE,
        )?;
        Ok((header.object.flags & OBJECT_COMPRESSION_MASK, payload))
    }

    /// Decompressed `NAME=value` payload of a DATA object.
    pub fn data_payload_decoded(&self, offset: u64) -> Result<Vec<u8>> {
        let (flags, payload) = self.data_payload_at(offset)?;
        if flags == 0 {
            Ok(payload.to_vec())
        } else {
            compress::decompress(payload, flags)
        }
    }

    pub fn entry_items_at(&self, offset: u64) -> Result<Vec<EntryItem>> {
        let header = self.entry_header_at(offset)?;
        let items_size = header.object.size - ENTRY_OBJECT_HEADER_SIZE;
        if items_size % ENTRY_ITEM_SIZE != 0 {
            return Err(JournalError::Corrupted("entry item region misaligned"));
        }

        let bytes = self.slice(offset + ENTRY_OBJECT_HEADER_SIZE, items_size)?;
        let items = <[EntryItem]>::ref_from_bytes(bytes)
            .map_err(|_| JournalError::Corrupted("entry item region misaligned"))?;
        Ok(items.to_vec())
    }

    /// Resolve a complete entry into an [`EntryRecord`].
    pub fn entry_record_at(&self, offset: u64) -> Result<EntryRecord> {
        let header = self.entry_header_at(offset)?;
        let items = self.entry_items_at(offset)?;

        let mut fields = Vec::with_capacity(items.len());
        for item in items {
            let payload = self.data_payload_decoded(item.object_offset)?;
            let split = payload
                .iter()
                .position(|&b| b == b'=')
                .ok_or(JournalError::Corrupted("data payload without separator"))?;
            let (name, value) = payload.split_at(split);
            fields.push((name.to_vec(), value[1..].to_vec()));
        }

        Ok(EntryRecord {
            seqnum: header.seqnum,
            seqnum_id: self.seqnum_id(),
            realtime: Microseconds(header.realtime),
            monotonic: Microseconds(header.monotonic),
            boot_id: Id128(header.boot_id),
            items: fields,
        })
    }

    /// Offsets of all entries in insertion order, collected from the
    /// global entry array chain.
    pub fn entry_offsets(&self) -> Result<Vec<u64>> {
        let header = self.header();
        let mut remaining = header.n_entries;
        let mut offsets = Vec::with_capacity(remaining as usize);
        let mut array_offset = header.entry_array_offset;

        while remaining > 0 {
            if array_offset == 0 {
                return Err(JournalError::Corrupted("entry array chain too short"));
            }

            let array = self.entry_array_header_at(array_offset)?;
            let capacity = (array.object.size - ENTRY_ARRAY_HEADER_SIZE) / 8;
            let take = capacity.min(remaining);

            let bytes = self.slice(array_offset + ENTRY_ARRAY_HEADER_SIZE, take * 8)?;
            for chunk in bytes.chunks_exact(8) {
                let entry = u64::from_le_bytes(chunk.try_into().unwrap());
                if entry == 0 {
                    return Err(JournalError::Corrupted("null entry in entry array"));
                }
                offsets.push(entry);
            }

            remaining -= take;
            array_offset = array.next_entry_array_offset;
        }

        Ok(offsets)
    }

    fn bucket_at(&self, table_offset: u64, table_size: u64, hash: u64) -> Result<(u64, HashItem)> {
        let n_buckets = table_size / HASH_ITEM_SIZE;
        if n_buckets == 0 {
            return Err(JournalError::Corrupted("empty hash table"));
        }

        let bucket_offset = table_offset + (hash % n_buckets) * HASH_ITEM_SIZE;
        Ok((bucket_offset, self.read_struct(bucket_offset)?))
    }

    /// Look up a DATA object by payload, walking the bucket chain.
    pub fn find_data_offset(&self, hash: u64, payload: &[u8]) -> Result<Option<u64>> {
        let header = self.header();
        let (_, bucket) = self.bucket_at(
            header.data_hash_table_offset,
            header.data_hash_table_size,
            hash,
        )?;

        let mut offset = bucket.head_hash_offset;
        while offset != 0 {
            let data = self.data_header_at(offset)?;
            if data.hash == hash && self.data_payload_decoded(offset)? == payload {
                return Ok(Some(offset));
            }
            offset = data.next_hash_offset;
        }

        Ok(None)
    }

    /// Look up a FIELD object by name.
    pub fn find_field_offset(&self, hash: u64, name: &[u8]) -> Result<Option<u64>> {
        let header = self.header();
        let (_, bucket) = self.bucket_at(
            header.field_hash_table_offset,
            header.field_hash_table_size,
            hash,
        )?;

        let mut offset = bucket.head_hash_offset;
        while offset != 0 {
            let field = self.field_header_at(offset)?;
            if field.hash == hash {
                let payload = self.slice(
                    offset + FIELD_OBJECT_HEADER_SIZE,
                    field.object.size - FIELD_OBJECT_HEADER_SIZE,
                )?;
                if payload == name {
                    return Ok(Some(offset));
                }
            }
            offset = field.next_hash_offset;
        }

        Ok(None)
    }
}

// ── Read-only opening ────────────────────────────────────────────

impl JournalFile<ReadMap> {
    /// Open an existing file for reading. Readers accept archived and
    /// online files alike.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let map = ReadMap::create(&file)?;

        let journal = Self {
            path,
            file,
            map,
            compression: CompressionConfig::default(),
            sealer: None,
            seqnum_source: None,
            max_file_size: u64::MAX,
            online: false,
            append_offset: 0,
            ea_tail: None,
        };

        journal.validate_header(None, INCOMPATIBLE_SUPPORTED_READ)?;
        Ok(journal)
    }

    pub fn mtime(&self) -> Result<Microseconds> {
        let meta = self.file.metadata()?;
        Ok(Microseconds(
            meta.mtime() as u64 * 1_000_000 + meta.mtime_nsec() as u64 / 1_000,
        ))
    }
}

impl<M: MemoryMap> JournalFile<M> {
    /// Validate the mapped header. `machine_id` is enforced for writers
    /// only; readers may look at foreign files.
    fn validate_header(&self, machine_id: Option<Id128>, supported: u32) -> Result<()> {
        if (self.map.bytes().len() as u64) < HEADER_SIZE {
            return Err(JournalError::Truncated);
        }

        let header = JournalHeader::ref_from_prefix(self.map.bytes())
            .map_err(|_| JournalError::Truncated)?
            .0;

        if header.signature != SIGNATURE {
            return Err(JournalError::InvalidMagic);
        }

        let unsupported = header.incompatible_flags & !supported;
        if unsupported != 0 {
            return Err(JournalError::UnsupportedFeature(unsupported));
        }

        if header.header_size != HEADER_SIZE {
            return Err(JournalError::Corrupted("unexpected header size"));
        }

        if header.state().is_none() {
            return Err(JournalError::Corrupted("invalid state byte"));
        }

        if let Some(machine_id) = machine_id {
            if Id128(header.machine_id) != machine_id {
                return Err(JournalError::ForeignMachineId);
            }
        }

        // The tail object must lie within the file, otherwise the file
        // was truncated behind our back.
        if header.tail_object_offset != 0 {
            let end = header
                .tail_object_offset
                .checked_add(OBJECT_HEADER_SIZE)
                .ok_or(JournalError::Truncated)?;
            if end > self.map.bytes().len() as u64 {
                return Err(JournalError::Truncated);
            }
        }

        if header.data_hash_table_offset == 0 || header.field_hash_table_offset == 0 {
            return Err(JournalError::Corrupted("missing hash tables"));
        }

        Ok(())
    }
}

// ── Writable opening and appending ───────────────────────────────

impl JournalFile<MappedFile> {
    /// Create a fresh journal file at `path`, truncating anything there.
    pub fn create(path: impl AsRef<Path>, options: &JournalFileOptions) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .mode(0o640)
            .open(&path)?;

        let data_table_size = options.data_hash_table_buckets * HASH_ITEM_SIZE;
        let field_table_size = options.field_hash_table_buckets * HASH_ITEM_SIZE;

        let data_table_offset = HEADER_SIZE + OBJECT_HEADER_SIZE;
        let field_table_offset = data_table_offset + data_table_size + OBJECT_HEADER_SIZE;
        let tail_object_offset = data_table_offset + data_table_size;
        let end = field_table_offset + field_table_size;

        let mut map = MappedFile::create(&file, end)?;

        let mut header = JournalHeader::new_zeroed();
        header.signature = SIGNATURE;
        header.incompatible_flags = IncompatibleFlag::KeyedHash as u32;
        if options.compression.enabled() {
            header.incompatible_flags |= IncompatibleFlag::CompressedLz4 as u32;
        }
        if options.seal {
            header.compatible_flags = CompatibleFlag::Sealed as u32;
        }
        header.state = JournalState::Offline as u8;
        header.file_id = Id128::random().0;
        header.machine_id = options.machine_id.0;
        header.tail_entry_boot_id = options.boot_id.0;
        header.seqnum_id = options.seqnum_id.0;
        header.header_size = HEADER_SIZE;
        header.arena_size = map.len() - HEADER_SIZE;
        header.data_hash_table_offset = data_table_offset;
        header.data_hash_table_size = data_table_size;
        header.field_hash_table_offset = field_table_offset;
        header.field_hash_table_size = field_table_size;
        header.tail_object_offset = tail_object_offset;
        header.n_objects = 2;
        header.tail_entry_seqnum = options.tail_entry_seqnum;

        header.write_to_prefix(map.bytes_mut()).unwrap();

        // The two hash tables are objects like any other; their headers
        // sit immediately before the bucket regions.
        let dht = ObjectHeader {
            type_: ObjectType::DataHashTable as u8,
            flags: 0,
            reserved: [0; 6],
            size: OBJECT_HEADER_SIZE + data_table_size,
        };
        dht.write_to_prefix(&mut map.bytes_mut()[HEADER_SIZE as usize..])
            .unwrap();

        let fht = ObjectHeader {
            type_: ObjectType::FieldHashTable as u8,
            flags: 0,
            reserved: [0; 6],
            size: OBJECT_HEADER_SIZE + field_table_size,
        };
        fht.write_to_prefix(&mut map.bytes_mut()[tail_object_offset as usize..])
            .unwrap();

        let mut journal = Self {
            path,
            file,
            map,
            compression: options.compression,
            sealer: None,
            seqnum_source: None,
            max_file_size: options.max_file_size,
            online: false,
            append_offset: end,
            ea_tail: None,
        };

        journal.set_online()?;
        Ok(journal)
    }

    /// Open an existing file for appending.
    ///
    /// A file that was left online (unclean shutdown) or already archived
    /// is refused; `reliably_open` turns those refusals into disposal.
    /// Note that reopening an archived chain's predecessor under a fresh
    /// name can reproduce an already-issued `(seqnum_id, seqnum)` pair;
    /// this is a documented property of the format, and readers resolve
    /// the collision by file mtime.
    pub fn open_writable(path: impl AsRef<Path>, options: &JournalFileOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let map = MappedFile::create(&file, len)?;

        let mut journal = Self {
            path,
            file,
            map,
            compression: options.compression,
            sealer: None,
            seqnum_source: None,
            max_file_size: options.max_file_size,
            online: false,
            append_offset: 0,
            ea_tail: None,
        };

        journal.validate_header(Some(options.machine_id), INCOMPATIBLE_SUPPORTED_WRITE)?;

        match journal.header().state().unwrap() {
            JournalState::Online => return Err(JournalError::UncleanShutdown),
            JournalState::Archived => return Err(JournalError::AlreadyArchived),
            JournalState::Offline => {}
        }

        // Recompute the append cursor from the tail object.
        let tail = journal.header().tail_object_offset;
        let tail_header = journal.object_header_at(tail)?;
        journal.append_offset = align64(tail + tail_header.size);

        journal.set_online()?;
        Ok(journal)
    }

    /// Open-or-create with disposal of damaged files: the writable path's
    /// reliable constructor. A file that cannot be appended to is moved
    /// aside under a `.journal~` name and replaced with a fresh one.
    pub fn reliably_open(path: impl AsRef<Path>, options: &JournalFileOptions) -> Result<Self> {
        let path = path.as_ref();

        let exists = match std::fs::metadata(path) {
            Ok(meta) => meta.len() > 0,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };

        if !exists {
            return Self::create(path, options);
        }

        match Self::open_writable(path, options) {
            Ok(journal) => Ok(journal),
            Err(err) if err.is_transient() => {
                warn!(path = %path.display(), error = %err, "disposing damaged journal file");
                dispose(path)?;
                Self::create(path, options)
            }
            Err(err) => Err(err),
        }
    }

    pub fn attach_sealer(&mut self, sealer: Box<dyn Sealer>) {
        self.sealer = Some(sealer);
    }

    /// Share a seqnum counter with the other files of this chain owner.
    pub fn attach_seqnum_source(&mut self, source: SeqnumSource) {
        source.observe(self.header().tail_entry_seqnum);
        self.seqnum_source = Some(source);
    }

    fn header_mut(&mut self) -> &mut JournalHeader {
        JournalHeader::mut_from_prefix(self.map.bytes_mut()).unwrap().0
    }

    fn set_online(&mut self) -> Result<()> {
        self.header_mut().state = JournalState::Online as u8;
        self.map.flush_range(0, HEADER_SIZE as usize)?;
        self.online = true;
        Ok(())
    }

    fn write_struct<T: IntoBytes + zerocopy::Immutable>(&mut self, offset: u64, value: &T) {
        value
            .write_to_prefix(&mut self.map.bytes_mut()[offset as usize..])
            .unwrap();
    }

    fn update_struct<T: FromBytes + IntoBytes + zerocopy::Immutable + Copy>(
        &mut self,
        offset: u64,
        update: impl FnOnce(&mut T),
    ) -> Result<()> {
        let mut value: T = self.read_struct(offset)?;
        update(&mut value);
        self.write_struct(offset, &value);
        Ok(())
    }

    /// Reserve space for a new object at the append cursor and write its
    /// common header. Returns the object's offset.
    fn allocate_object(&mut self, type_: ObjectType, flags: u8, size: u64) -> Result<u64> {
        let offset = self.append_offset;
        debug_assert_eq!(offset % OBJECT_ALIGNMENT, 0);

        self.map.ensure(&self.file, offset + size)?;

        let arena_size = self.map.len() - HEADER_SIZE;
        let header = self.header_mut();
        header.arena_size = arena_size;
        header.tail_object_offset = offset;
        header.n_objects += 1;

        self.write_struct(
            offset,
            &ObjectHeader {
                type_: type_ as u8,
                flags,
                reserved: [0; 6],
                size,
            },
        );

        self.append_offset = align64(offset + size);
        Ok(offset)
    }

    /// Chain a freshly written object into its hash table bucket.
    fn hash_table_link(
        &mut self,
        table_offset: u64,
        table_size: u64,
        hash: u64,
        object_offset: u64,
        object_type: ObjectType,
    ) -> Result<()> {
        let (bucket_offset, bucket) = self.bucket_at(table_offset, table_size, hash)?;

        if bucket.tail_hash_offset != 0 {
            match object_type {
                ObjectType::Data => self.update_struct::<DataObjectHeader>(
                    bucket.tail_hash_offset,
                    |data| data.next_hash_offset = object_offset,
                )?,
                ObjectType::Field => self.update_struct::<FieldObjectHeader>(
                    bucket.tail_hash_offset,
                    |field| field.next_hash_offset = object_offset,
                )?,
                _ => unreachable!("only data and field objects are hash-chained"),
            }
        }

        self.write_struct(
            bucket_offset,
            &HashItem {
                head_hash_offset: if bucket.head_hash_offset != 0 {
                    bucket.head_hash_offset
                } else {
                    object_offset
                },
                tail_hash_offset: object_offset,
            },
        );

        Ok(())
    }

    fn append_field_object(&mut self, name: &[u8]) -> Result<u64> {
        let hash = self.hash(name);
        let size = FIELD_OBJECT_HEADER_SIZE + name.len() as u64;
        let offset = self.allocate_object(ObjectType::Field, 0, size)?;

        self.update_struct::<FieldObjectHeader>(offset, |field| field.hash = hash)?;
        let payload_offset = (offset + FIELD_OBJECT_HEADER_SIZE) as usize;
        self.map.bytes_mut()[payload_offset..payload_offset + name.len()].copy_from_slice(name);

        let (table_offset, table_size) = {
            let header = self.header();
            (header.field_hash_table_offset, header.field_hash_table_size)
        };
        self.hash_table_link(table_offset, table_size, hash, offset, ObjectType::Field)?;
        self.header_mut().n_fields += 1;

        Ok(offset)
    }

    fn append_data_object(&mut self, name: &[u8], hash: u64, payload: &[u8]) -> Result<u64> {
        let compressed = if self.compression.should_compress(payload.len()) {
            compress::compress(payload)
        } else {
            None
        };

        let (stored, flags): (&[u8], u8) = match &compressed {
            Some((bytes, flags)) => (bytes, *flags),
            None => (payload, 0),
        };

        let size = DATA_OBJECT_HEADER_SIZE + stored.len() as u64;
        let offset = self.allocate_object(ObjectType::Data, flags, size)?;

        self.update_struct::<DataObjectHeader>(offset, |data| data.hash = hash)?;
        let payload_offset = (offset + DATA_OBJECT_HEADER_SIZE) as usize;
        self.map.bytes_mut()[payload_offset..payload_offset + stored.len()]
            .copy_from_slice(stored);

        let (table_offset, table_size) = {
            let header = self.header();
            (header.data_hash_table_offset, header.data_hash_table_size)
        };
        self.hash_table_link(table_offset, table_size, hash, offset, ObjectType::Data)?;

        // Link the new data object at the head of its field's chain.
        let field_hash = self.hash(name);
        let field_offset = match self.find_field_offset(field_hash, name)? {
            Some(offset) => offset,
            None => self.append_field_object(name)?,
        };
        let old_head = self.field_header_at(field_offset)?.head_data_offset;
        self.update_struct::<FieldObjectHeader>(field_offset, |field| {
            field.head_data_offset = offset;
        })?;
        self.update_struct::<DataObjectHeader>(offset, |data| {
            data.next_field_offset = old_head;
        })?;

        self.header_mut().n_data += 1;
        Ok(offset)
    }

    /// Locate (or lazily rebuild) the tail of the global entry array
    /// chain.
    fn entry_array_tail(&mut self) -> Result<Option<EntryArrayTail>> {
        if let Some(tail) = self.ea_tail {
            return Ok(Some(tail));
        }

        let header = self.header();
        let mut array_offset = header.entry_array_offset;
        if array_offset == 0 {
            return Ok(None);
        }

        let mut remaining = header.n_entries;
        loop {
            let array = self.entry_array_header_at(array_offset)?;
            let capacity = (array.object.size - ENTRY_ARRAY_HEADER_SIZE) / 8;

            if array.next_entry_array_offset == 0 {
                let tail = EntryArrayTail {
                    offset: array_offset,
                    capacity,
                    used: remaining,
                };
                self.ea_tail = Some(tail);
                return Ok(Some(tail));
            }

            remaining = remaining.saturating_sub(capacity);
            array_offset = array.next_entry_array_offset;
        }
    }

    fn entry_array_append(&mut self, entry_offset: u64) -> Result<()> {
        let tail = self.entry_array_tail()?;

        let tail = match tail {
            Some(tail) if tail.used < tail.capacity => tail,
            Some(full) => {
                let capacity = (full.capacity * 2).min(MAX_ENTRY_ARRAY_CAPACITY);
                let size = ENTRY_ARRAY_HEADER_SIZE + capacity * 8;
                let offset = self.allocate_object(ObjectType::EntryArray, 0, size)?;

                self.update_struct::<EntryArrayObjectHeader>(full.offset, |array| {
                    array.next_entry_array_offset = offset;
                })?;
                self.header_mut().n_entry_arrays += 1;

                EntryArrayTail {
                    offset,
                    capacity,
                    used: 0,
                }
            }
            None => {
                let size = ENTRY_ARRAY_HEADER_SIZE + FIRST_ENTRY_ARRAY_CAPACITY * 8;
                let offset = self.allocate_object(ObjectType::EntryArray, 0, size)?;

                let header = self.header_mut();
                header.entry_array_offset = offset;
                header.n_entry_arrays += 1;

                EntryArrayTail {
                    offset,
                    capacity: FIRST_ENTRY_ARRAY_CAPACITY,
                    used: 0,
                }
            }
        };

        let slot = (tail.offset + ENTRY_ARRAY_HEADER_SIZE + tail.used * 8) as usize;
        self.map.bytes_mut()[slot..slot + 8].copy_from_slice(&entry_offset.to_le_bytes());

        self.ea_tail = Some(EntryArrayTail {
            used: tail.used + 1,
            ..tail
        });

        Ok(())
    }

    /// Append one entry. Items are ordered `(name, value)` pairs; value
    /// payloads are deduplicated against existing DATA objects and
    /// compressed above the configured threshold. Returns the entry's
    /// seqnum.
    pub fn append_entry(
        &mut self,
        realtime: Microseconds,
        monotonic: Microseconds,
        boot_id: Id128,
        items: &[(&[u8], &[u8])],
    ) -> Result<u64> {
        if !self.online {
            return Err(JournalError::NotWritable);
        }

        if self.file.metadata()?.nlink() == 0 {
            return Err(JournalError::FileDeleted);
        }

        // Entries within one file are strictly realtime-ordered; a write
        // that would move backwards belongs in a successor file.
        let header = self.header();
        if header.n_entries > 0 && realtime.get() < header.tail_entry_realtime {
            return Err(JournalError::BackwardTime);
        }

        if self.append_offset >= self.max_file_size {
            return Err(JournalError::LimitReached);
        }

        let mut entry_items = Vec::with_capacity(items.len());
        let mut xor_hash = 0u64;

        for (name, value) in items {
            if !field_name_is_valid(name) {
                return Err(JournalError::InvalidFieldName);
            }

            let mut payload = Vec::with_capacity(name.len() + 1 + value.len());
            payload.extend_from_slice(name);
            payload.push(b'=');
            payload.extend_from_slice(value);

            let hash = self.hash(&payload);
            let offset = match self.find_data_offset(hash, &payload)? {
                Some(offset) => offset,
                None => self.append_data_object(name, hash, &payload)?,
            };

            xor_hash ^= hash;
            entry_items.push(EntryItem {
                object_offset: offset,
                hash,
            });
        }

        let tail_seqnum = self.header().tail_entry_seqnum;
        let seqnum = match &self.seqnum_source {
            Some(source) => source.next(tail_seqnum),
            None => tail_seqnum + 1,
        };
        let size = ENTRY_OBJECT_HEADER_SIZE + entry_items.len() as u64 * ENTRY_ITEM_SIZE;
        let entry_offset = self.allocate_object(ObjectType::Entry, 0, size)?;

        self.update_struct::<EntryObjectHeader>(entry_offset, |entry| {
            entry.seqnum = seqnum;
            entry.realtime = realtime.get();
            entry.monotonic = monotonic.get();
            entry.boot_id = boot_id.0;
            entry.xor_hash = xor_hash;
        })?;

        let items_offset = (entry_offset + ENTRY_OBJECT_HEADER_SIZE) as usize;
        let item_bytes = entry_items.as_slice().as_bytes();
        self.map.bytes_mut()[items_offset..items_offset + item_bytes.len()]
            .copy_from_slice(item_bytes);

        // Back-link the referenced data objects.
        for item in &entry_items {
            self.update_struct::<DataObjectHeader>(item.object_offset, |data| {
                data.n_entries += 1;
                if data.entry_offset == 0 {
                    data.entry_offset = entry_offset;
                }
            })?;
        }

        self.entry_array_append(entry_offset)?;

        let header = self.header_mut();
        header.n_entries += 1;
        header.tail_entry_seqnum = seqnum;
        header.tail_entry_realtime = realtime.get();
        header.tail_entry_monotonic = monotonic.get();
        header.tail_entry_boot_id = boot_id.0;
        if header.head_entry_seqnum == 0 {
            header.head_entry_seqnum = seqnum;
            header.head_entry_realtime = realtime.get();
        }

        Ok(seqnum)
    }

    /// Bulk-copy one resolved entry, preserving its timestamps and boot
    /// id but taking the next seqnum of this file.
    pub fn copy_entry_from(&mut self, record: &EntryRecord) -> Result<u64> {
        let items: Vec<(&[u8], &[u8])> = record
            .items
            .iter()
            .map(|(name, value)| (name.as_slice(), value.as_slice()))
            .collect();

        self.append_entry(record.realtime, record.monotonic, record.boot_id, &items)
    }

    /// Whether the caller would be better served by a fresh file.
    pub fn rotate_suggested(&self, max_file_usec: Option<u64>, now: Microseconds) -> bool {
        let header = self.header();

        if self.append_offset >= self.max_file_size {
            debug!(path = %self.path.display(), "rotate: file size reached");
            return true;
        }

        let buckets = header.data_hash_table_size / HASH_ITEM_SIZE;
        if buckets > 0 && header.n_data * HASH_TABLE_FILL_DEN > buckets * HASH_TABLE_FILL_NUM {
            debug!(path = %self.path.display(), "rotate: data hash table fill");
            return true;
        }

        if let Some(max_usec) = max_file_usec {
            if header.n_entries > 0
                && now.get().saturating_sub(header.head_entry_realtime) > max_usec
            {
                debug!(path = %self.path.display(), "rotate: file age");
                return true;
            }
        }

        false
    }

    fn dirty_sync(&mut self) -> Result<()> {
        self.map.flush()?;
        nix::unistd::fdatasync(&self.file).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Take the file offline: flush the arena, then flip and flush the
    /// state byte with a barrier in between.
    ///
    /// The transition runs synchronously inside the caller's loop
    /// regardless of `wait`; the parameter is part of the contract and
    /// kept for callers that can tolerate a deferred completion.
    pub fn set_offline(&mut self, _wait: bool) -> Result<()> {
        if !self.online {
            return Ok(());
        }

        self.seal_if_configured()?;

        // Trim allocation slack so archived and offline files carry their
        // true size.
        let used = self.append_offset;
        self.map.truncate(&self.file, used)?;
        self.header_mut().arena_size = used - HEADER_SIZE;

        self.dirty_sync()?;

        self.header_mut().state = JournalState::Offline as u8;
        self.map.flush_range(0, HEADER_SIZE as usize)?;
        nix::unistd::fdatasync(&self.file).map_err(std::io::Error::from)?;

        self.online = false;
        Ok(())
    }

    fn seal_if_configured(&mut self) -> Result<()> {
        if !self.header().has_compatible_flag(CompatibleFlag::Sealed) {
            return Ok(());
        }

        let Some(mut sealer) = self.sealer.take() else {
            return Ok(());
        };

        let epoch = self.header().tail_entry_realtime;
        let seqnum = self.header().tail_entry_seqnum;
        let tag = sealer.seal(epoch, &self.map.bytes()[..self.append_offset as usize]);

        let offset =
            self.allocate_object(ObjectType::Tag, 0, std::mem::size_of::<TagObjectHeader>() as u64)?;
        self.update_struct::<TagObjectHeader>(offset, |tag_object| {
            tag_object.seqnum = seqnum;
            tag_object.epoch = epoch;
            tag_object.tag = tag;
        })?;
        self.header_mut().n_tags += 1;

        self.sealer = Some(sealer);
        Ok(())
    }

    /// Flush written data to disk without going offline.
    pub fn sync(&mut self) -> Result<()> {
        self.dirty_sync()
    }

    /// Offline and drop the handle; the preferred way to let go of a
    /// writable file.
    pub fn close(mut self) -> Result<()> {
        self.set_offline(true)
    }

    /// Archive this file and create its successor.
    ///
    /// The archived file is renamed to the `@seqnum-id-…` spelling and
    /// never written again; the successor inherits the seqnum id and
    /// continues the sequence.
    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    pub fn rotate(mut self) -> Result<Self> {
        let filename = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(JournalFilename::parse)
            .ok_or(JournalError::InvalidFilename)?;

        if filename.kind != FileKind::Active {
            return Err(JournalError::AlreadyArchived);
        }

        let header = *self.header();
        let options = JournalFileOptions {
            machine_id: Id128(header.machine_id),
            boot_id: Id128(header.tail_entry_boot_id),
            seqnum_id: Id128(header.seqnum_id),
            compression: self.compression,
            seal: header.has_compatible_flag(CompatibleFlag::Sealed),
            max_file_size: self.max_file_size,
            data_hash_table_buckets: header.data_hash_table_size / HASH_ITEM_SIZE,
            field_hash_table_buckets: header.field_hash_table_size / HASH_ITEM_SIZE,
            tail_entry_seqnum: header.tail_entry_seqnum,
        };

        // Offline first (flushes and trims), then mark archived.
        self.set_offline(true)?;
        self.header_mut().state = JournalState::Archived as u8;
        self.map.flush_range(0, HEADER_SIZE as usize)?;
        nix::unistd::fdatasync(&self.file).map_err(std::io::Error::from)?;

        let archived = JournalFilename::format_archived(
            &filename.source,
            Id128(header.seqnum_id),
            header.head_entry_seqnum,
            header.head_entry_realtime,
        );
        let archived_path = self
            .path
            .parent()
            .map(|dir| dir.join(&archived))
            .ok_or(JournalError::InvalidFilename)?;

        std::fs::rename(&self.path, &archived_path)?;
        debug!(archived = %archived_path.display(), "archived journal file");

        let sealer = self.sealer.take();
        let seqnum_source = self.seqnum_source.take();
        let path = self.path.clone();
        drop(self);

        let mut successor = Self::create(&path, &options)?;
        if let Some(sealer) = sealer {
            successor.attach_sealer(sealer);
        }
        successor.seqnum_source = seqnum_source;
        Ok(successor)
    }
}

impl<M: MemoryMap> Drop for JournalFile<M> {
    fn drop(&mut self) {
        if !self.online {
            return;
        }

        // Fallback for handles dropped without `close()`: flush and flip
        // the state byte so the file is not mistaken for an unclean
        // shutdown later. Trimming and sealing only happen on the
        // explicit path.
        let _ = self.map.flush_all();
        let _ = nix::unistd::fdatasync(&self.file);
        if let Some(bytes) = self.map.bytes_mut_opt() {
            bytes[std::mem::offset_of!(JournalHeader, state)] = JournalState::Offline as u8;
        }
        let _ = self.map.flush_all();
        let _ = nix::unistd::fdatasync(&self.file);
    }
}

/// Move a damaged file out of the way under a disposed name.
fn dispose(path: &Path) -> Result<()> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(JournalFilename::parse)
        .ok_or(JournalError::InvalidFilename)?;

    let nonce: u64 = rand::rng().random();
    let disposed = JournalFilename::format_disposed(
        &filename.source,
        Microseconds::now_realtime().get(),
        nonce,
    );
    let disposed_path = path
        .parent()
        .map(|dir| dir.join(&disposed))
        .ok_or(JournalError::InvalidFilename)?;

    std::fs::rename(path, &disposed_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_options() -> JournalFileOptions {
        JournalFileOptions::new(
            Id128(Uuid::from_u128(0x11111111_1111_1111_1111_111111111111).into_bytes()),
            Id128(Uuid::from_u128(0x22222222_2222_2222_2222_222222222222).into_bytes()),
            Id128(Uuid::from_u128(0x33333333_3333_3333_3333_333333333333).into_bytes()),
        )
    }

    fn append_simple(journal: &mut WritableJournal, usec: u64, value: &str) -> u64 {
        let boot_id = Id128(journal.header().tail_entry_boot_id);
        journal
            .append_entry(
                Microseconds(usec),
                Microseconds(usec),
                boot_id,
                &[(b"MESSAGE", value.as_bytes())],
            )
            .unwrap()
    }

    #[test]
    fn create_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");

        {
            let mut journal = WritableJournal::create(&path, &test_options()).unwrap();
            assert_eq!(journal.header().state(), Some(JournalState::Online));
            append_simple(&mut journal, 1_000, "hello");
            journal.set_offline(true).unwrap();
        }

        let journal = WritableJournal::open_writable(&path, &test_options()).unwrap();
        assert_eq!(journal.n_entries(), 1);
        assert_eq!(journal.tail_entry_seqnum(), 1);
    }

    #[test]
    fn append_assigns_consecutive_seqnums() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");
        let mut journal = WritableJournal::create(&path, &test_options()).unwrap();

        for i in 1..=100u64 {
            let seqnum = append_simple(&mut journal, 1_000 * i, &format!("msg {i}"));
            assert_eq!(seqnum, i);
        }

        assert_eq!(journal.header().head_entry_seqnum, 1);
        assert_eq!(journal.header().tail_entry_seqnum, 100);
        assert_eq!(journal.entry_offsets().unwrap().len(), 100);
    }

    #[test]
    fn entries_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");
        let mut journal = WritableJournal::create(&path, &test_options()).unwrap();

        journal
            .append_entry(
                Microseconds(5),
                Microseconds(5),
                Id128([7; 16]),
                &[
                    (b"MESSAGE", b"first".as_slice()),
                    (b"PRIORITY", b"6".as_slice()),
                ],
            )
            .unwrap();

        let offsets = journal.entry_offsets().unwrap();
        let record = journal.entry_record_at(offsets[0]).unwrap();
        assert_eq!(record.seqnum, 1);
        assert_eq!(record.realtime, Microseconds(5));
        assert_eq!(record.boot_id, Id128([7; 16]));
        assert_eq!(
            record.items,
            vec![
                (b"MESSAGE".to_vec(), b"first".to_vec()),
                (b"PRIORITY".to_vec(), b"6".to_vec()),
            ]
        );
    }

    #[test]
    fn data_objects_are_deduplicated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");
        let mut journal = WritableJournal::create(&path, &test_options()).unwrap();

        append_simple(&mut journal, 1, "same");
        append_simple(&mut journal, 2, "same");
        append_simple(&mut journal, 3, "same");

        assert_eq!(journal.header().n_data, 1);
        assert_eq!(journal.header().n_entries, 3);

        let offsets = journal.entry_offsets().unwrap();
        let first = journal.entry_items_at(offsets[0]).unwrap();
        let last = journal.entry_items_at(offsets[2]).unwrap();
        assert_eq!(first[0].object_offset, last[0].object_offset);

        let data = journal.data_header_at(first[0].object_offset).unwrap();
        assert_eq!(data.n_entries, 3);
    }

    #[test]
    fn large_values_are_compressed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");

        let options = test_options().with_compression(CompressionConfig {
            threshold: Some(64),
        });
        let mut journal = WritableJournal::create(&path, &options).unwrap();

        let value = "x".repeat(4096);
        append_simple(&mut journal, 1, &value);

        let offsets = journal.entry_offsets().unwrap();
        let items = journal.entry_items_at(offsets[0]).unwrap();
        let (flags, stored) = journal.data_payload_at(items[0].object_offset).unwrap();
        assert_eq!(flags, OBJECT_COMPRESSED_LZ4);
        assert!(stored.len() < value.len());

        let record = journal.entry_record_at(offsets[0]).unwrap();
        assert_eq!(record.items[0].1, value.as_bytes());
    }

    #[test]
    fn backward_time_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");
        let mut journal = WritableJournal::create(&path, &test_options()).unwrap();

        append_simple(&mut journal, 1_000, "now");

        let err = journal
            .append_entry(
                Microseconds(999),
                Microseconds(999),
                Id128([1; 16]),
                &[(b"MESSAGE", b"past".as_slice())],
            )
            .unwrap_err();
        assert!(matches!(err, JournalError::BackwardTime));
        assert!(err.is_transient());
    }

    #[test]
    fn invalid_field_names_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");
        let mut journal = WritableJournal::create(&path, &test_options()).unwrap();

        let err = journal
            .append_entry(
                Microseconds(1),
                Microseconds(1),
                Id128([1; 16]),
                &[(b"bad name", b"v".as_slice())],
            )
            .unwrap_err();
        assert!(matches!(err, JournalError::InvalidFieldName));
    }

    #[test]
    fn size_limit_reports_limit_reached() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");

        let options = test_options().with_max_file_size(256 * 1024);
        let mut journal = WritableJournal::create(&path, &options).unwrap();

        let value = "y".repeat(32 * 1024);
        let mut hit_limit = false;
        for i in 1..=64u64 {
            let result = journal.append_entry(
                Microseconds(i),
                Microseconds(i),
                Id128([1; 16]),
                &[(b"MESSAGE", format!("{i} {value}").as_bytes())],
            );
            match result {
                Ok(_) => {}
                Err(JournalError::LimitReached) => {
                    hit_limit = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(hit_limit);
    }

    #[test]
    fn rotate_archives_and_continues_sequence() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");
        let mut journal = WritableJournal::create(&path, &test_options()).unwrap();

        append_simple(&mut journal, 1_000, "one");
        append_simple(&mut journal, 2_000, "two");
        let seqnum_id = journal.seqnum_id();

        let mut successor = journal.rotate().unwrap();
        assert_eq!(successor.seqnum_id(), seqnum_id);
        assert_eq!(successor.n_entries(), 0);

        let seqnum = append_simple(&mut successor, 3_000, "three");
        assert_eq!(seqnum, 3);

        let archived: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains('@'))
            .collect();
        assert_eq!(archived.len(), 1);

        let parsed = JournalFilename::parse(&archived[0]).unwrap();
        match parsed.kind {
            FileKind::Archived {
                seqnum_id: id,
                head_seqnum,
                head_realtime,
            } => {
                assert_eq!(id, seqnum_id);
                assert_eq!(head_seqnum, 1);
                assert_eq!(head_realtime, 1_000);
            }
            other => panic!("expected archived name, got {other:?}"),
        }

        let archived_file = ReadableJournal::open(dir.path().join(&archived[0])).unwrap();
        assert_eq!(
            archived_file.header().state(),
            Some(JournalState::Archived)
        );
        assert_eq!(archived_file.n_entries(), 2);
    }

    #[test]
    fn offline_state_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");

        let mut journal = WritableJournal::create(&path, &test_options()).unwrap();
        append_simple(&mut journal, 1, "x");
        journal.set_offline(false).unwrap();

        let reader = ReadableJournal::open(&path).unwrap();
        assert_eq!(reader.header().state(), Some(JournalState::Offline));

        // Offline files carry no allocation slack.
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), reader.header().header_size + reader.header().arena_size);
    }

    #[test]
    fn unclean_file_is_refused_then_disposed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");

        {
            let mut journal = WritableJournal::create(&path, &test_options()).unwrap();
            append_simple(&mut journal, 1, "dirty");
            // Simulate a crash: leak the online state.
            std::mem::forget(journal);
        }

        let err = WritableJournal::open_writable(&path, &test_options()).unwrap_err();
        assert!(matches!(err, JournalError::UncleanShutdown));

        let journal = WritableJournal::reliably_open(&path, &test_options()).unwrap();
        assert_eq!(journal.n_entries(), 0);

        let disposed: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".journal~"))
            .collect();
        assert_eq!(disposed.len(), 1);
    }

    #[test]
    fn foreign_machine_id_is_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");

        {
            let mut journal = WritableJournal::create(&path, &test_options()).unwrap();
            append_simple(&mut journal, 1, "x");
            journal.set_offline(true).unwrap();
        }

        let mut foreign = test_options();
        foreign.machine_id = Id128([0x99; 16]);
        let err = WritableJournal::open_writable(&path, &foreign).unwrap_err();
        assert!(matches!(err, JournalError::ForeignMachineId));
    }

    #[test]
    fn copy_entry_preserves_timestamps_and_reassigns_seqnum() {
        let dir = tempfile::TempDir::new().unwrap();

        let src_path = dir.path().join("runtime.journal");
        let mut src = WritableJournal::create(&src_path, &test_options()).unwrap();
        // Filenames with an unknown base cannot rotate, but appending is
        // path-agnostic; use a proper name in real deployments.
        append_simple(&mut src, 1_000, "copied");
        let record = {
            let offsets = src.entry_offsets().unwrap();
            src.entry_record_at(offsets[0]).unwrap()
        };

        let dst_path = dir.path().join("system.journal");
        let mut dst_options = test_options();
        dst_options.seqnum_id = Id128([0x44; 16]);
        dst_options.tail_entry_seqnum = 41;
        let mut dst = WritableJournal::create(&dst_path, &dst_options).unwrap();

        let seqnum = dst.copy_entry_from(&record).unwrap();
        assert_eq!(seqnum, 42);

        let offsets = dst.entry_offsets().unwrap();
        let copied = dst.entry_record_at(offsets[0]).unwrap();
        assert_eq!(copied.realtime, record.realtime);
        assert_eq!(copied.monotonic, record.monotonic);
        assert_eq!(copied.boot_id, record.boot_id);
        assert_eq!(copied.items, record.items);
        assert_eq!(copied.seqnum, 42);
    }

    #[test]
    fn rotate_suggested_on_fill_and_age() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");

        let options = test_options().with_hash_table_buckets(8, 8);
        let mut journal = WritableJournal::create(&path, &options).unwrap();

        assert!(!journal.rotate_suggested(None, Microseconds(0)));

        // More distinct payloads than the tiny table can comfortably hold.
        for i in 0..8u64 {
            append_simple(&mut journal, i + 1, &format!("distinct {i}"));
        }
        assert!(journal.rotate_suggested(None, Microseconds(10)));

        // Age-based suggestion on an otherwise fine file.
        let path2 = dir.path().join("user-1000.journal");
        let mut journal2 = WritableJournal::create(&path2, &test_options()).unwrap();
        append_simple(&mut journal2, 1_000_000, "aged");
        assert!(!journal2.rotate_suggested(Some(u64::MAX), Microseconds(2_000_000)));
        assert!(journal2.rotate_suggested(Some(1), Microseconds(2_000_000)));
    }

    #[test]
    fn entry_array_chain_grows() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");
        let mut journal = WritableJournal::create(&path, &test_options()).unwrap();

        // More entries than the first array holds forces chaining.
        for i in 1..=32u64 {
            append_simple(&mut journal, i, &format!("m{i}"));
        }

        assert!(journal.header().n_entry_arrays > 1);
        let offsets = journal.entry_offsets().unwrap();
        assert_eq!(offsets.len(), 32);

        let records: Vec<_> = offsets
            .iter()
            .map(|&o| journal.entry_record_at(o).unwrap().seqnum)
            .collect();
        let expected: Vec<u64> = (1..=32).collect();
        assert_eq!(records, expected);
    }

    struct FixedSealer;

    impl Sealer for FixedSealer {
        fn seal(&mut self, _epoch: u64, _data: &[u8]) -> [u8; 32] {
            [0xAB; 32]
        }
    }

    #[test]
    fn sealing_appends_tag_on_offline() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("system.journal");

        let options = test_options().with_seal(true);
        let mut journal = WritableJournal::create(&path, &options).unwrap();
        journal.attach_sealer(Box::new(FixedSealer));

        append_simple(&mut journal, 1, "sealed");
        journal.set_offline(true).unwrap();

        let reader = ReadableJournal::open(&path).unwrap();
        assert_eq!(reader.header().n_tags, 1);
        assert!(reader.header().has_compatible_flag(CompatibleFlag::Sealed));
    }
}
