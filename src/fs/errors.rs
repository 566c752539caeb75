use std::io;
use thiserror::Error;

/// Status taxonomy shared by every storage and RPC operation.
///
/// POSIX errno values are mapped here and nowhere else; layers above this one
/// only ever see `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Status {
    #[error("no entry")]
    NoEntry,
    #[error("already exists")]
    Exist,
    #[error("no memory")]
    NoMemory,
    #[error("no backend path")]
    NoBackendPath,
    #[error("not supported")]
    NotSupported,
    #[error("server down")]
    ServerDown,
    #[error("partial read")]
    PartialRead,
    #[error("unknown error")]
    Unknown,
}

impl Status {
    /// Wire representation. 0 is reserved for success.
    pub fn code(self) -> i32 {
        match self {
            Status::NoEntry => 1,
            Status::Exist => 2,
            Status::NoMemory => 3,
            Status::NoBackendPath => 4,
            Status::NotSupported => 5,
            Status::ServerDown => 6,
            Status::PartialRead => 7,
            Status::Unknown => 8,
        }
    }

    pub fn from_code(code: i32) -> Option<Status> {
        match code {
            0 => None,
            1 => Some(Status::NoEntry),
            2 => Some(Status::Exist),
            3 => Some(Status::NoMemory),
            4 => Some(Status::NoBackendPath),
            5 => Some(Status::NotSupported),
            6 => Some(Status::ServerDown),
            7 => Some(Status::PartialRead),
            _ => Some(Status::Unknown),
        }
    }

    pub fn from_errno(errno: i32) -> Status {
        match errno {
            libc::ENOENT => Status::NoEntry,
            libc::EEXIST => Status::Exist,
            libc::ENOMEM => Status::NoMemory,
            libc::ENOTSUP => Status::NotSupported,
            libc::ENODATA => Status::NoEntry,
            _ => Status::Unknown,
        }
    }

    pub fn from_io(err: &io::Error) -> Status {
        match err.raw_os_error() {
            Some(errno) => Status::from_errno(errno),
            None => Status::Unknown,
        }
    }

    /// `NoEntry` is an expected outcome for most callers; everything else is
    /// worth an error-level log line.
    pub fn is_benign(self) -> bool {
        self == Status::NoEntry
    }
}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Status {
        Status::from_io(&err)
    }
}

/// Wire code of an operation result: 0 on success, taxonomy code otherwise.
pub fn code_of<T>(result: &Result<T, Status>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(s) => s.code(),
    }
}

/// Inverse of [`code_of`] for unit results received over the wire.
pub fn result_of(code: i32) -> Result<(), Status> {
    match Status::from_code(code) {
        None => Ok(()),
        Some(s) => Err(s),
    }
}
