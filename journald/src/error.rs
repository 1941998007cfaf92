#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Journal(#[from] journal_file::JournalError),

    #[error("id error: {0}")]
    Id(#[from] journal_common::IdError),

    #[error("cannot create event loop: {0}")]
    EventLoop(std::io::Error),

    #[error("no ingestion socket could be opened")]
    NoSockets,

    #[error("cannot create runtime journal directory: {0}")]
    RuntimeDirectory(std::io::Error),
}

impl From<nix::errno::Errno> for ServerError {
    fn from(errno: nix::errno::Errno) -> Self {
        ServerError::Io(errno.into())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
