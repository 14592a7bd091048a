//! All possible non-I/O stage errors.
//!
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible non-I/O stage errors.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The very first frame of the connection could not be parsed.
    ///
    /// The peer is most likely not running the same stage (or no stage at
    /// all). The stage has switched to raw passthrough.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is not fatal. It signals that this stage should no longer
    /// be attempted on the connection; the bytes that follow are relayed
    /// unchanged.
    ProtocolMismatch,

    /// A frame failed verification after at least one frame had been
    /// decoded successfully.
    ///
    /// The parameter provides a hint about which check failed.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal. The stream is corrupted and the connection
    /// should be closed.
    IntegrityFailure(IntegrityFailure),

    /// The authenticated framer refused the client/connection identifier
    /// carried by the first frame.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal and is handled like [`Error::IntegrityFailure`].
    AdmissionRejected(Rejection),

    /// The stage could not be configured.
    Config(ConfigError),
}

/// The reason a frame failed verification.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum IntegrityFailure {
    /// The `len` field of the frame is at or above the framer's limit.
    LengthOutOfRange {
        /// The received `len` field of the frame.
        received: u16,
    },

    /// The `len` field is too small to hold the fixed frame fields.
    FrameTooShort {
        /// The received `len` field of the frame.
        received: u16,
    },

    /// The CRC32 trailer does not match the frame contents.
    ChecksumMismatch,

    /// The `hdr_len` field points beyond the payload.
    HeaderLenInvalid {
        /// The received `hdr_len` field of the frame.
        received: u8,
    },

    /// The DEFLATE body could not be decompressed.
    InflateFailed,
}

/// The reason the authenticated framer refused a connection.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Rejection {
    /// The first frame carried fewer than 8 payload bytes.
    MissingHeader {
        /// The number of payload bytes received.
        received: usize,
    },

    /// The client table refused the identifier pair.
    Denied {
        /// The client identifier carried by the frame.
        client_id: u32,
        /// The connection identifier carried by the frame.
        connection_id: u32,
    },
}

/// Errors raised while building or configuring a stage.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ConfigError {
    /// No stage is registered under this name.
    UnknownStage {
        /// The requested stage name.
        name: String,
    },
}

impl Error {
    /// Returns `true` if the connection cannot continue.
    ///
    /// [`Error::ProtocolMismatch`] is the only non-fatal variant.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::ProtocolMismatch)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::ProtocolMismatch => write!(f, "ProtocolMismatch"),
            Error::IntegrityFailure(err) => write!(f, "IntegrityFailure: {}", err),
            Error::AdmissionRejected(err) => write!(f, "AdmissionRejected: {}", err),
            Error::Config(err) => write!(f, "Config: {}", err),
        }
    }
}

impl Display for IntegrityFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            IntegrityFailure::LengthOutOfRange { received } => {
                write!(f, "LengthOutOfRange: received {}", received)
            }
            IntegrityFailure::FrameTooShort { received } => {
                write!(f, "FrameTooShort: received {}", received)
            }
            IntegrityFailure::ChecksumMismatch => write!(f, "ChecksumMismatch"),
            IntegrityFailure::HeaderLenInvalid { received } => {
                write!(f, "HeaderLenInvalid: received {}", received)
            }
            IntegrityFailure::InflateFailed => write!(f, "InflateFailed"),
        }
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Rejection::MissingHeader { received } => {
                write!(f, "MissingHeader: received {} bytes", received)
            }
            Rejection::Denied { client_id, connection_id } => write!(
                f,
                "Denied: client {:#010x}, connection {:#010x}",
                client_id, connection_id
            ),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::UnknownStage { name } => write!(f, "UnknownStage: {:?}", name),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::ProtocolMismatch => None,
            Error::IntegrityFailure(err) => Some(err),
            Error::AdmissionRejected(err) => Some(err),
            Error::Config(err) => Some(err),
        }
    }
}

impl error::Error for IntegrityFailure {}

impl error::Error for Rejection {}

impl error::Error for ConfigError {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(ErrorKind::Other, e)
    }
}

impl From<IntegrityFailure> for io::Error {
    fn from(e: IntegrityFailure) -> Self {
        io::Error::new(ErrorKind::Other, Error::IntegrityFailure(e))
    }
}

impl From<IntegrityFailure> for Error {
    fn from(e: IntegrityFailure) -> Self {
        Error::IntegrityFailure(e)
    }
}

impl From<Rejection> for Error {
    fn from(e: Rejection) -> Self {
        Error::AdmissionRejected(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_only_mismatch_is_recoverable() {
        assert!(!Error::ProtocolMismatch.is_fatal());
        assert!(Error::from(IntegrityFailure::ChecksumMismatch).is_fatal());
        assert!(Error::from(Rejection::MissingHeader { received: 3 }).is_fatal());
    }

    #[test]
    fn test_io_error_downcast() {
        let e: io::Error = IntegrityFailure::InflateFailed.into();
        assert_eq!(e.kind(), ErrorKind::Other);
        let inner = e.get_ref().and_then(|e| e.downcast_ref::<Error>());
        assert_eq!(
            inner,
            Some(&Error::IntegrityFailure(IntegrityFailure::InflateFailed))
        );
    }

    #[test]
    fn test_display() {
        let e = Error::from(Rejection::Denied { client_id: 1, connection_id: 2 });
        assert_eq!(
            e.to_string(),
            "AdmissionRejected: Denied: client 0x00000001, connection 0x00000002"
        );
    }
}
