use std::fmt;

use serde::Serialize;

/// Runtime error taxonomy shared by every sluice crate.
///
/// Errors returned from `process` are transient: the filter stays
/// scheduled and the session records the value as its last process
/// error. Configuration and resource errors abort the operation that
/// raised them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Error {
    // argument errors
    BadParam,
    NotSupported,
    ProfileNotSupported,
    RequiresNewInstance,

    // resource errors
    OutOfMemory,
    IoError,
    FilterNotFound,
    UrlError,

    // data errors
    Corrupted,
    NonCompliantBitstream,
    BufferTooSmall,

    // network errors
    AddressNotFound,
    ConnectionFailure,
    NetworkFailure,
    ConnectionClosed,
    NetworkEmpty,
    UdpTimeout,
    AuthenticationFailure,

    // state errors
    ServiceError,
    NotFound,
    InvalidConfiguration,
    /// The packet was queued on its source filter because output
    /// connections are still pending. Not a failure.
    PendingPacket,
    /// End of stream reached. Not a failure.
    Eos,
}

impl Error {
    /// Stable process exit code for the CLI, one per taxonomy class.
    pub fn exit_code(self) -> i32 {
        match self {
            Error::BadParam
            | Error::NotSupported
            | Error::ProfileNotSupported
            | Error::RequiresNewInstance => 2,
            Error::OutOfMemory | Error::IoError | Error::FilterNotFound | Error::UrlError => 3,
            Error::Corrupted | Error::NonCompliantBitstream | Error::BufferTooSmall => 4,
            Error::AddressNotFound
            | Error::ConnectionFailure
            | Error::NetworkFailure
            | Error::ConnectionClosed
            | Error::NetworkEmpty
            | Error::UdpTimeout
            | Error::AuthenticationFailure => 5,
            Error::ServiceError | Error::NotFound | Error::InvalidConfiguration => 6,
            Error::PendingPacket | Error::Eos => 0,
        }
    }

    /// True for the two non-failure signals of the taxonomy.
    pub fn is_benign(self) -> bool {
        matches!(self, Error::PendingPacket | Error::Eos)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::BadParam => "bad parameter",
            Error::NotSupported => "feature not supported",
            Error::ProfileNotSupported => "profile not supported",
            Error::RequiresNewInstance => "filter requires a new instance",
            Error::OutOfMemory => "out of memory",
            Error::IoError => "I/O error",
            Error::FilterNotFound => "filter not found",
            Error::UrlError => "invalid URL",
            Error::Corrupted => "corrupted data",
            Error::NonCompliantBitstream => "non-compliant bitstream",
            Error::BufferTooSmall => "buffer too small",
            Error::AddressNotFound => "address not found",
            Error::ConnectionFailure => "connection failure",
            Error::NetworkFailure => "network failure",
            Error::ConnectionClosed => "connection closed",
            Error::NetworkEmpty => "network empty",
            Error::UdpTimeout => "UDP timeout",
            Error::AuthenticationFailure => "authentication failure",
            Error::ServiceError => "service error",
            Error::NotFound => "not found",
            Error::InvalidConfiguration => "invalid configuration",
            Error::PendingPacket => "packet pending on output connection",
            Error::Eos => "end of stream",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::IoError
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(Error::BadParam.to_string(), "bad parameter");
        assert_eq!(Error::Eos.to_string(), "end of stream");
        assert_eq!(Error::RequiresNewInstance.to_string(), "filter requires a new instance");
    }

    #[test]
    fn exit_codes_group_by_class() {
        assert_eq!(Error::BadParam.exit_code(), Error::NotSupported.exit_code());
        assert_eq!(Error::IoError.exit_code(), 3);
        assert_eq!(Error::UdpTimeout.exit_code(), 5);
        assert_eq!(Error::Eos.exit_code(), 0);
    }

    #[test]
    fn benign_signals() {
        assert!(Error::Eos.is_benign());
        assert!(Error::PendingPacket.is_benign());
        assert!(!Error::ServiceError.is_benign());
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(Error::from(io), Error::IoError);
    }
}
