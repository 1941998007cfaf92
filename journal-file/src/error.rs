use std::io::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic number")]
    InvalidMagic,

    #[error("unsupported incompatible feature flags: {0:#x}")]
    UnsupportedFeature(u32),

    #[error("journal file belongs to a different machine")]
    ForeignMachineId,

    #[error("journal file was not closed cleanly")]
    UncleanShutdown,

    #[error("journal file is already archived")]
    AlreadyArchived,

    #[error("journal file is truncated")]
    Truncated,

    #[error("journal file is corrupted: {0}")]
    Corrupted(&'static str),

    #[error("configured size limit reached")]
    LimitReached,

    #[error("journal file was deleted while open")]
    FileDeleted,

    #[error("entry realtime moves backwards")]
    BackwardTime,

    #[error("unexpected object type: expected {expected}, found {found}")]
    InvalidObjectType { expected: u8, found: u8 },

    #[error("object offset {0:#x} out of bounds")]
    BadOffset(u64),

    #[error("payload decompression failed")]
    Decompression,

    #[error("file is not open for writing")]
    NotWritable,

    #[error("invalid journal filename")]
    InvalidFilename,

    #[error("not a directory")]
    NotADirectory,

    #[error("invalid field name")]
    InvalidFieldName,

    #[error("entry index out of range")]
    EntryOutOfRange,

    #[error("id error: {0}")]
    Id(#[from] journal_common::IdError),
}

impl JournalError {
    /// Whether a write that failed with this error should be retried once
    /// after rotating and vacuuming.
    ///
    /// This classification drives the single-retry contract of the write
    /// path: a fresh successor file cures everything listed here, anything
    /// else is fatal to the write.
    pub fn is_transient(&self) -> bool {
        match self {
            JournalError::LimitReached
            | JournalError::ForeignMachineId
            | JournalError::UncleanShutdown
            | JournalError::UnsupportedFeature(_)
            | JournalError::Corrupted(_)
            | JournalError::Truncated
            | JournalError::AlreadyArchived
            | JournalError::FileDeleted
            | JournalError::BackwardTime
            | JournalError::InvalidMagic
            | JournalError::BadOffset(_)
            | JournalError::InvalidObjectType { .. } => true,

            JournalError::Io(err) => matches!(
                err.kind(),
                ErrorKind::StorageFull | ErrorKind::QuotaExceeded | ErrorKind::FileTooLarge
            ) || err.raw_os_error() == Some(libc::EIO),

            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;
