use std::fmt;

/// A storaged error. Transport failures surface as IO, malformed packets as
/// InvalidData, and non-zero status bytes from a tracker as Remote with the
/// raw code, so callers can special-case the codes that are meaningful for
/// their RPC (e.g. not-found from a sync-notify).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The operation was aborted, e.g. because the process is shutting down.
    Abort,
    /// Invalid data, e.g. a bad packet size or an unknown status byte.
    InvalidData(String),
    /// An input/output error, e.g. a connect, send, or receive failure.
    IO(String),
    /// An error code reported by a remote tracker in a response status byte.
    Remote(u8),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Remote(code) => write!(f, "remote error code {code}"),
        }
    }
}

impl Error {
    /// Returns true if the remote reported not-found. Frequently meaningful
    /// rather than fatal, e.g. "no sync source configured for you".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Remote(code) if *code == crate::protocol::code::NOT_FOUND)
    }

    /// Returns true if the remote reported the operation as a duplicate.
    /// Treated as success-equivalent for trunk-role and delete operations.
    pub fn is_already_done(&self) -> bool {
        matches!(self, Error::Remote(code)
            if *code == crate::protocol::code::ALREADY_EXISTS
            || *code == crate::protocol::code::IN_PROGRESS)
    }

    /// The remote status code for this error, if any.
    pub fn remote_code(&self) -> Option<u8> {
        match self {
            Error::Remote(code) => Some(*code),
            _ => None,
        }
    }
}

/// Constructs an Error::InvalidData via format!() and args.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// A storaged Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidData(err.to_string())
    }
}
