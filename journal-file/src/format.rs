//! On-disk layout of journal files.
//!
//! A journal file is a header followed by an arena of 8-byte-aligned
//! objects. All integers are little-endian; the structs below are only
//! ever reinterpreted from mapped file bytes on little-endian hosts.
//!
//! ```text
//! [JournalHeader]
//! [ObjectHeader | DATA_HASH_TABLE buckets]
//! [ObjectHeader | FIELD_HASH_TABLE buckets]
//! [DATA / FIELD / ENTRY / ENTRY_ARRAY / TAG objects …]
//! ```

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const SIGNATURE: [u8; 8] = *b"LPKSHHRH";

/// Objects are padded to 8 bytes.
pub const OBJECT_ALIGNMENT: u64 = 8;

#[inline]
pub const fn align64(n: u64) -> u64 {
    (n + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

// ── Header ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct JournalHeader {
    pub signature: [u8; 8],
    pub compatible_flags: u32,
    pub incompatible_flags: u32,
    pub state: u8,
    pub reserved: [u8; 31],
    pub file_id: [u8; 16],
    pub machine_id: [u8; 16],
    pub tail_entry_boot_id: [u8; 16],
    pub seqnum_id: [u8; 16],
    pub header_size: u64,
    pub arena_size: u64,
    pub data_hash_table_offset: u64,
    pub data_hash_table_size: u64,
    pub field_hash_table_offset: u64,
    pub field_hash_table_size: u64,
    pub tail_object_offset: u64,
    pub n_objects: u64,
    pub n_entries: u64,
    pub tail_entry_seqnum: u64,
    pub head_entry_seqnum: u64,
    pub entry_array_offset: u64,
    pub head_entry_realtime: u64,
    pub tail_entry_realtime: u64,
    pub tail_entry_monotonic: u64,
    pub n_data: u64,
    pub n_fields: u64,
    pub n_tags: u64,
    pub n_entry_arrays: u64,
}

const_assert_eq!(std::mem::size_of::<JournalHeader>(), 264);

/// Incompatible feature bits: a reader that does not understand one of
/// these must not use the file, a writer must not append to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IncompatibleFlag {
    CompressedXz = 1 << 0,
    CompressedLz4 = 1 << 1,
    KeyedHash = 1 << 2,
    CompressedZstd = 1 << 3,
    Compact = 1 << 4,
}

/// Every incompatible bit this implementation can read.
pub const INCOMPATIBLE_SUPPORTED_READ: u32 = IncompatibleFlag::CompressedLz4 as u32
    | IncompatibleFlag::KeyedHash as u32
    | IncompatibleFlag::CompressedZstd as u32;

/// Every incompatible bit this implementation can append under. Compact
/// entries and XZ payloads are read-path-only concerns elsewhere; zstd
/// payloads can be read but are never produced.
pub const INCOMPATIBLE_SUPPORTED_WRITE: u32 =
    IncompatibleFlag::CompressedLz4 as u32 | IncompatibleFlag::KeyedHash as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompatibleFlag {
    Sealed = 1 << 0,
}

/// The sole header mutation visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalState {
    Offline = 0,
    Online = 1,
    Archived = 2,
}

impl JournalState {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Offline),
            1 => Some(Self::Online),
            2 => Some(Self::Archived),
            _ => None,
        }
    }
}

impl JournalHeader {
    pub fn has_incompatible_flag(&self, flag: IncompatibleFlag) -> bool {
        self.incompatible_flags & flag as u32 != 0
    }

    pub fn has_compatible_flag(&self, flag: CompatibleFlag) -> bool {
        self.compatible_flags & flag as u32 != 0
    }

    pub fn state(&self) -> Option<JournalState> {
        JournalState::from_byte(self.state)
    }
}

// ── Objects ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Data = 1,
    Field = 2,
    Entry = 3,
    DataHashTable = 4,
    FieldHashTable = 5,
    EntryArray = 6,
    Tag = 7,
}

impl ObjectType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Data),
            2 => Some(Self::Field),
            3 => Some(Self::Entry),
            4 => Some(Self::DataHashTable),
            5 => Some(Self::FieldHashTable),
            6 => Some(Self::EntryArray),
            7 => Some(Self::Tag),
            _ => None,
        }
    }
}

/// Object flag bits identifying the payload compression algorithm.
pub const OBJECT_COMPRESSED_XZ: u8 = 1 << 0;
pub const OBJECT_COMPRESSED_LZ4: u8 = 1 << 1;
pub const OBJECT_COMPRESSED_ZSTD: u8 = 1 << 2;
pub const OBJECT_COMPRESSION_MASK: u8 =
    OBJECT_COMPRESSED_XZ | OBJECT_COMPRESSED_LZ4 | OBJECT_COMPRESSED_ZSTD;

/// Common 16-byte prefix of every object. `size` covers the header too.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ObjectHeader {
    pub type_: u8,
    pub flags: u8,
    pub reserved: [u8; 6],
    pub size: u64,
}

const_assert_eq!(std::mem::size_of::<ObjectHeader>(), 16);

/// A DATA object holds one deduplicated `NAME=value` payload, linked into
/// its hash bucket chain and its field's data chain.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DataObjectHeader {
    pub object: ObjectHeader,
    pub hash: u64,
    pub next_hash_offset: u64,
    pub next_field_offset: u64,
    pub entry_offset: u64,
    pub entry_array_offset: u64,
    pub n_entries: u64,
}

const_assert_eq!(std::mem::size_of::<DataObjectHeader>(), 64);

/// A FIELD object holds one field name, heading the chain of its DATA
/// objects.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FieldObjectHeader {
    pub object: ObjectHeader,
    pub hash: u64,
    pub next_hash_offset: u64,
    pub head_data_offset: u64,
}

const_assert_eq!(std::mem::size_of::<FieldObjectHeader>(), 40);

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EntryObjectHeader {
    pub object: ObjectHeader,
    pub seqnum: u64,
    pub realtime: u64,
    pub monotonic: u64,
    pub boot_id: [u8; 16],
    pub xor_hash: u64,
}

const_assert_eq!(std::mem::size_of::<EntryObjectHeader>(), 64);

/// One item of an ENTRY object, pointing at a DATA object.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EntryItem {
    pub object_offset: u64,
    pub hash: u64,
}

const_assert_eq!(std::mem::size_of::<EntryItem>(), 16);

/// One bucket of a hash table: head and tail of the collision chain.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HashItem {
    pub head_hash_offset: u64,
    pub tail_hash_offset: u64,
}

const_assert_eq!(std::mem::size_of::<HashItem>(), 16);

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EntryArrayObjectHeader {
    pub object: ObjectHeader,
    pub next_entry_array_offset: u64,
}

const_assert_eq!(std::mem::size_of::<EntryArrayObjectHeader>(), 24);

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct TagObjectHeader {
    pub object: ObjectHeader,
    pub seqnum: u64,
    pub epoch: u64,
    pub tag: [u8; 32],
}

const_assert_eq!(std::mem::size_of::<TagObjectHeader>(), 64);

pub const OBJECT_HEADER_SIZE: u64 = std::mem::size_of::<ObjectHeader>() as u64;
pub const DATA_OBJECT_HEADER_SIZE: u64 = std::mem::size_of::<DataObjectHeader>() as u64;
pub const FIELD_OBJECT_HEADER_SIZE: u64 = std::mem::size_of::<FieldObjectHeader>() as u64;
pub const ENTRY_OBJECT_HEADER_SIZE: u64 = std::mem::size_of::<EntryObjectHeader>() as u64;
pub const ENTRY_ARRAY_HEADER_SIZE: u64 = std::mem::size_of::<EntryArrayObjectHeader>() as u64;
pub const ENTRY_ITEM_SIZE: u64 = std::mem::size_of::<EntryItem>() as u64;
pub const HASH_ITEM_SIZE: u64 = std::mem::size_of::<HashItem>() as u64;
pub const HEADER_SIZE: u64 = std::mem::size_of::<JournalHeader>() as u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align64(0), 0);
        assert_eq!(align64(1), 8);
        assert_eq!(align64(8), 8);
        assert_eq!(align64(17), 24);
    }

    #[test]
    fn state_bytes() {
        assert_eq!(JournalState::from_byte(0), Some(JournalState::Offline));
        assert_eq!(JournalState::from_byte(1), Some(JournalState::Online));
        assert_eq!(JournalState::from_byte(2), Some(JournalState::Archived));
        assert_eq!(JournalState::from_byte(3), None);
    }

    #[test]
    fn object_types_round_trip() {
        for t in [
            ObjectType::Data,
            ObjectType::Field,
            ObjectType::Entry,
            ObjectType::DataHashTable,
            ObjectType::FieldHashTable,
            ObjectType::EntryArray,
            ObjectType::Tag,
        ] {
            assert_eq!(ObjectType::from_byte(t as u8), Some(t));
        }
        assert_eq!(ObjectType::from_byte(0), None);
        assert_eq!(ObjectType::from_byte(8), None);
    }
}
