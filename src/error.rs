use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Transient outcomes of one multipath attempt. Both are expected under
/// concurrency and safe to retry after re-reading the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transient {
    /// An input of the composition was retired before publication.
    Busy,
    /// The route no longer pointed at the expected forward at commit time.
    Conflict,
}

impl fmt::Display for Transient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transient::Busy => f.write_str("busy"),
            Transient::Conflict => f.write_str("conflict"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("composition input retired concurrently")]
    Busy,

    #[error("route changed concurrently")]
    Conflict,

    #[error("not found")]
    NotFound,

    #[error("route already exists")]
    Exists,

    #[error("gave up after {attempts} attempts, last failure: {last}")]
    RetryExhausted { attempts: u32, last: Transient },
}

impl Error {
    pub fn err_oom<T>(what: &'static str) -> Result<T> {
        Err(Error::OutOfMemory(what))
    }

    pub fn err_busy<T>() -> Result<T> {
        Err(Error::Busy)
    }

    pub fn err_conflict<T>() -> Result<T> {
        Err(Error::Conflict)
    }

    pub fn err_not_found<T>() -> Result<T> {
        Err(Error::NotFound)
    }

    /// Busy and Conflict are the only errors a caller may retry blindly.
    pub fn is_transient(&self) -> bool {
        self.transient().is_some()
    }

    pub fn transient(&self) -> Option<Transient> {
        match self {
            Error::Busy => Some(Transient::Busy),
            Error::Conflict => Some(Transient::Conflict),
            _ => None,
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory("allocation failed")
    }
}

impl From<Transient> for Error {
    fn from(t: Transient) -> Self {
        match t {
            Transient::Busy => Error::Busy,
            Transient::Conflict => Error::Conflict,
        }
    }
}
