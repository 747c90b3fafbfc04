use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by model loading and querying.
#[derive(Debug, Error)]
pub enum Error {
    /// The model file is structurally broken: bad magic number, unsupported
    /// format version, an out-of-range enum byte, or inconsistent sections.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A caller-supplied value is outside the bounds declared by the model.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A dictionary string is not valid UTF-8.
    #[error("invalid UTF-8 in model string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The handle owning this resource has already been closed.
    #[error("{0} is already closed")]
    AlreadyClosed(&'static str),

    /// The mmap syscall failed. On 32-bit targets or under restrictive
    /// `ulimit -v`/`vm.max_map_count` settings the address space may simply
    /// be too small for the model.
    #[error("mmap of {path:?} failed: {source} (check virtual address space limits)")]
    MapFailed { path: PathBuf, source: io::Error },

    /// End of file in the middle of a field.
    #[error("unexpected end of file while reading {0}")]
    Truncated(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}
