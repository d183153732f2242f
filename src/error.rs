use std::fmt;

/// Errors surfaced across the public API.
///
/// Most invalid-argument conditions described by the cache's contract are
/// *not* represented here: they are silent no-ops returning a sentinel value
/// (`0`, `false`, `None`), per the cache's error-handling design. `Error` is
/// reserved for the one condition that contract calls a genuine developer
/// mistake, and for the internal reentrancy guard on the access-lock path.
#[derive(Debug)]
pub enum Error {
    /// A tile-header read scope was requested before any `set_read_scope`
    /// call established which stream the tile header belongs to.
    ReadScopeNotSet,
    /// `lock_failed` was invoked while the calling thread already held the
    /// cache mutex. This indicates a bug in the walker, not caller misuse.
    ReentrantMutexAcquire,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReadScopeNotSet => {
                write!(f, "tile-header scope requested before a read scope was set")
            }
            Error::ReentrantMutexAcquire => {
                write!(f, "attempted to re-acquire the cache mutex from the same thread")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
