use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

/// Error taxonomy for every overlay operation.
///
/// Each kind maps to a stable POSIX errno via [`FsError::errno`] so the
/// host-extension surface can return numeric codes without re-interpreting
/// error strings.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Too many levels of symbolic links: {0}")]
    TooManyLinks(String),

    #[error("Name too long: {0}")]
    NameTooLong(String),

    #[error("No space left on backend")]
    NoSpace,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt metadata: {0}")]
    Corruption(String),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation canceled")]
    Canceled,
}

impl FsError {
    /// Stable errno for the host-extension transport.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Exists(_) => libc::EEXIST,
            FsError::NotDirectory(_) => libc::ENOTDIR,
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::Permission(_) => libc::EPERM,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NotSupported(_) => libc::ENOTSUP,
            FsError::TooManyLinks(_) => libc::ELOOP,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Storage(_) => libc::EIO,
            FsError::Corruption(_) => libc::EIO,
            FsError::Conflict(_) => libc::EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Canceled => libc::ECANCELED,
        }
    }

    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        FsError::NotFound(path.into())
    }

    pub(crate) fn exists(path: impl Into<String>) -> Self {
        FsError::Exists(path.into())
    }
}

impl From<redb::DatabaseError> for FsError {
    fn from(err: redb::DatabaseError) -> Self {
        match err {
            redb::DatabaseError::Storage(e) => e.into(),
            other => FsError::Storage(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for FsError {
    fn from(err: redb::TransactionError) -> Self {
        match err {
            redb::TransactionError::Storage(e) => e.into(),
            other => FsError::Storage(other.to_string()),
        }
    }
}

impl From<redb::TableError> for FsError {
    fn from(err: redb::TableError) -> Self {
        match err {
            redb::TableError::Storage(e) => e.into(),
            redb::TableError::TableTypeMismatch { .. }
            | redb::TableError::TableIsMultimap(_)
            | redb::TableError::TableIsNotMultimap(_) => FsError::Corruption(err.to_string()),
            other => FsError::Storage(other.to_string()),
        }
    }
}

impl From<redb::StorageError> for FsError {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Corrupted(msg) => FsError::Corruption(msg),
            redb::StorageError::Io(e) if e.raw_os_error() == Some(libc::ENOSPC) => FsError::NoSpace,
            other => FsError::Storage(other.to_string()),
        }
    }
}

impl From<redb::CommitError> for FsError {
    fn from(err: redb::CommitError) -> Self {
        FsError::Storage(err.to_string())
    }
}
