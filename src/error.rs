use thiserror::Error;

/// Crate-wide error type.
///
/// Internal invariant violations panic; everything a caller can trigger
/// comes back as one of these.
#[derive(Error, Debug)]
pub enum SfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No such file or directory")]
    NoSuchFile,

    #[error("Is a directory")]
    IsADirectory,

    #[error("Not a directory")]
    NotADirectory,

    #[error("File exists")]
    Exists,

    #[error("Device or resource busy")]
    Busy,

    #[error("No space left on device")]
    NoSpace,

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("File too big")]
    FileTooBig,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Name too long")]
    NameTooLong,

    /// A buffer was detached or reassigned while a waiter slept on its
    /// busy bit. Never escapes the buffer cache; waiters retry the lookup.
    #[error("stale buffer")]
    StaleBuffer,
}

pub type Result<T> = std::result::Result<T, SfsError>;
