use libc::{c_int, EACCES, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, ENOTEMPTY, ENOTSUP};
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// Every failure the core can surface to the kernel. One variant per errno
/// the mount is allowed to return.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("tag still has matching files: {0}")]
    NotEmpty(String),

    #[error("illegal name: {0}")]
    BadName(String),

    #[error("invalid operation: {0}")]
    Invalid(&'static str),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("permission denied")]
    Denied,

    #[error("datastore i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("snapshot decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl FsError {
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound(_) => ENOENT,
            FsError::Exists(_) => EEXIST,
            FsError::NotEmpty(_) => ENOTEMPTY,
            FsError::BadName(_) | FsError::Invalid(_) => EINVAL,
            FsError::NotDirectory => ENOTDIR,
            FsError::IsDirectory(_) => EISDIR,
            FsError::Unsupported(_) => ENOTSUP,
            FsError::Denied => EACCES,
            FsError::Io(_) | FsError::Encode(_) | FsError::Decode(_) => EIO,
        }
    }
}
