use std::{fmt::Display, io, num::NonZeroU32};

use rustix::io::Errno;

/// Error returned from back-end operations.
///
/// Transfer-level results never travel through this type: an asynchronous
/// submit only reports setup-level failures, and the transfer outcome is
/// read from the reaped request's status field.
#[derive(Debug, Clone)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) code: Option<NonZeroU32>,
    pub(crate) message: &'static str,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            code: None,
            message,
        }
    }

    pub(crate) fn from_errno(errno: Errno, message: &'static str) -> Self {
        let kind = match errno {
            Errno::IO => ErrorKind::Io,
            Errno::ACCESS | Errno::PERM => ErrorKind::Access,
            Errno::NOENT | Errno::NXIO | Errno::NODEV => ErrorKind::NoDevice,
            Errno::NOMEM => ErrorKind::NoMemory,
            Errno::TIMEDOUT => ErrorKind::TimedOut,
            Errno::INVAL => ErrorKind::InvalidParam,
            _ => ErrorKind::Other,
        };
        Self {
            kind,
            code: NonZeroU32::new(errno.raw_os_error() as u32),
            message,
        }
    }

    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the `errno` value from the OS, if applicable.
    pub fn os_error(&self) -> Option<u32> {
        self.code.map(|c| c.get())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (errno {})", code.get())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::Io => io::ErrorKind::Other,
            ErrorKind::Access => io::ErrorKind::PermissionDenied,
            ErrorKind::NoDevice => io::ErrorKind::NotFound,
            ErrorKind::NoMemory => io::ErrorKind::OutOfMemory,
            ErrorKind::TimedOut => io::ErrorKind::TimedOut,
            ErrorKind::NotSupported => io::ErrorKind::Unsupported,
            ErrorKind::InvalidParam => io::ErrorKind::InvalidInput,
            ErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Generic I/O failure.
    Io,

    /// This user does not have permission to open the node.
    Access,

    /// Bus or endpoint node does not exist, or the device is gone.
    NoDevice,

    /// Allocation failed in the driver.
    NoMemory,

    /// Deadline elapsed.
    TimedOut,

    /// The operation is not supported on this transfer type.
    NotSupported,

    /// Malformed request.
    InvalidParam,

    /// Uncategorized error.
    Other,
}
