//! Crate & protocol level errors.
//!
//! A non-success memcached response is both a structured value and an
//! error: the dispatcher classifies the status into one of the variants
//! below, and the variant keeps the full [`Response`] so callers can still
//! inspect opcode, opaque, cas, and body. [`Error::response`] recovers it.
//!
//! Classification also decides connection reuse: a *resumable* error is a
//! protocol-level outcome on an intact byte stream (the connection goes
//! back to its pool), while a fatal one destroys the connection. See
//! [`Error::is_resumable`].

use std::io;

use thiserror::Error as ThisError;

use crate::protocol::Status;
use crate::response::Response;

pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds the client distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// A get/delta/append targeted a key the server does not hold.
    #[error("cache miss: {0}")]
    CacheMiss(Box<Response>),

    /// A conditional write (add/replace/append/prepend) found its
    /// condition unsatisfied, or the key already exists.
    #[error("item not stored: {0}")]
    NotStored(Box<Response>),

    /// Invalid arguments or a non-numeric value handed to a delta op.
    #[error("invalid arguments: {0}")]
    InvalidArgs(Box<Response>),

    /// The server refused the value for exceeding its size limit.
    #[error("data size exceeds limit: {0}")]
    ValueTooLarge(Box<Response>),

    /// A request body was rejected before transmission for exceeding the
    /// 22 MB frame cap.
    #[error("request body of {0} bytes exceeds the frame limit")]
    BodyTooLarge(usize),

    /// The server did not recognize the opcode.
    #[error("unknown command: {0}")]
    UnknownCommand(Box<Response>),

    /// Out of memory on the server, or a status outside the known table.
    #[error("server error: {0}")]
    Server(Box<Response>),

    /// Temporary failure; the operation cannot be performed right now.
    #[error("server unavailable: {0}")]
    ServerUnavailable(Box<Response>),

    /// SASL authentication failed or the handshake went off-script.
    #[error("authentication failed: {0}")]
    AuthFail(Box<Response>),

    /// Key is longer than 250 bytes or contains a forbidden byte.
    #[error("key is too long or contains invalid characters")]
    MalformedKey,

    /// The ring is empty or the connection has no usable stream.
    #[error("no servers configured or available")]
    NoServers,

    /// A configured server string could not be parsed into an address.
    #[error("invalid address for server: {0}")]
    InvalidAddr(String),

    /// Neither an explicit server list nor a headless service name was
    /// provided.
    #[error("incomplete configuration: set either the server list or the headless service address")]
    NotConfigured,

    /// The pool's creation-permit wait expired and no idle connection
    /// appeared.
    #[error("timeout acquiring a connection from the pool; consider raising max idle connections")]
    AcquireTimeout,

    /// The pool was destroyed.
    #[error("pool is closed")]
    PoolClosed,

    /// A response header opened with a byte that is neither request nor
    /// response magic.
    #[error("bad magic: 0x{0:02x}")]
    BadMagic(u8),

    /// An incoming frame declared a body larger than the 22 MB cap.
    ///
    /// Unlike [`Error::BodyTooLarge`] this arrives mid-stream, so the
    /// connection cannot be trusted afterwards.
    #[error("incoming frame of {0} bytes exceeds the frame limit")]
    OversizedFrame(usize),

    /// Dialing a node took longer than the configured socket timeout.
    #[error("connect timeout to {0}")]
    ConnectTimeout(String),

    /// An error in the network.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// Order-independent join of per-partition errors from a batch
    /// operation.
    #[error("{}", format_multi(.0))]
    Multi(Vec<Error>),
}

impl Error {
    /// Classify a non-success response into its error kind.
    pub fn from_response(resp: Response) -> Error {
        let resp = Box::new(resp);
        match resp.status {
            Status::KeyNotFound => Error::CacheMiss(resp),
            Status::NotStored | Status::KeyExists => Error::NotStored(resp),
            Status::InvalidArgs | Status::DeltaBadValue => Error::InvalidArgs(resp),
            Status::ValueTooLarge => Error::ValueTooLarge(resp),
            Status::UnknownCommand => Error::UnknownCommand(resp),
            Status::TemporaryFail => Error::ServerUnavailable(resp),
            Status::AuthFail => Error::AuthFail(resp),
            _ => Error::Server(resp),
        }
    }

    /// The response behind an error-as-response variant, if any.
    ///
    /// Lets callers handle a status without caring whether it counted as
    /// success or failure.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::CacheMiss(r)
            | Error::NotStored(r)
            | Error::InvalidArgs(r)
            | Error::ValueTooLarge(r)
            | Error::UnknownCommand(r)
            | Error::Server(r)
            | Error::ServerUnavailable(r)
            | Error::AuthFail(r) => Some(r),
            _ => None,
        }
    }

    /// Returns true if this error does not indicate a broken byte stream.
    ///
    /// The connection that produced a resumable error is returned to its
    /// pool; a fatal error destroys it.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Error::CacheMiss(_)
                | Error::NotStored(_)
                | Error::InvalidArgs(_)
                | Error::ValueTooLarge(_)
                | Error::ServerUnavailable(_)
                | Error::BodyTooLarge(_)
                | Error::MalformedKey
        )
    }

    /// Join a set of per-partition errors into one composite error.
    ///
    /// Returns `Ok(())` for an empty set and the error itself for a
    /// singleton; order is not significant.
    pub fn join(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multi(errors)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

fn format_multi(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;

    fn resp(status: Status) -> Response {
        Response {
            opcode: OpCode::Get,
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_classification_table() {
        assert!(matches!(
            Error::from_response(resp(Status::KeyNotFound)),
            Error::CacheMiss(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::NotStored)),
            Error::NotStored(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::KeyExists)),
            Error::NotStored(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::InvalidArgs)),
            Error::InvalidArgs(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::DeltaBadValue)),
            Error::InvalidArgs(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::ValueTooLarge)),
            Error::ValueTooLarge(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::UnknownCommand)),
            Error::UnknownCommand(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::OutOfMemory)),
            Error::Server(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::TemporaryFail)),
            Error::ServerUnavailable(_)
        ));
        assert!(matches!(
            Error::from_response(resp(Status::AuthFail)),
            Error::AuthFail(_)
        ));
        // Unrecognized statuses fold into the server-error bucket.
        assert!(matches!(
            Error::from_response(resp(Status::Unknown)),
            Error::Server(_)
        ));
    }

    #[test]
    fn test_resumable_policy() {
        assert!(Error::from_response(resp(Status::KeyNotFound)).is_resumable());
        assert!(Error::from_response(resp(Status::NotStored)).is_resumable());
        assert!(Error::from_response(resp(Status::InvalidArgs)).is_resumable());
        assert!(Error::from_response(resp(Status::ValueTooLarge)).is_resumable());
        assert!(Error::from_response(resp(Status::TemporaryFail)).is_resumable());
        assert!(Error::BodyTooLarge(23_000_000).is_resumable());
        assert!(Error::MalformedKey.is_resumable());

        assert!(!Error::from_response(resp(Status::UnknownCommand)).is_resumable());
        assert!(!Error::from_response(resp(Status::OutOfMemory)).is_resumable());
        assert!(!Error::from_response(resp(Status::AuthFail)).is_resumable());
        assert!(!Error::BadMagic(0x83).is_resumable());
        assert!(!Error::OversizedFrame(23_000_000).is_resumable());
        assert!(!Error::AcquireTimeout.is_resumable());
        assert!(!Error::PoolClosed.is_resumable());
        assert!(!Error::Io(io::ErrorKind::ConnectionReset).is_resumable());
    }

    #[test]
    fn test_response_accessor() {
        let err = Error::from_response(resp(Status::KeyNotFound));
        let recovered = err.response().expect("should carry the response");
        assert_eq!(recovered.status, Status::KeyNotFound);

        assert!(Error::NoServers.response().is_none());
        assert!(Error::MalformedKey.response().is_none());
    }

    #[test]
    fn test_join_empty_is_ok() {
        assert_eq!(Error::join(vec![]), Ok(()));
    }

    #[test]
    fn test_join_single_unwraps() {
        let joined = Error::join(vec![Error::NoServers]);
        assert_eq!(joined, Err(Error::NoServers));
    }

    #[test]
    fn test_join_many_formats_all_parts() {
        let joined = Error::join(vec![Error::NoServers, Error::AcquireTimeout]).unwrap_err();
        let display = joined.to_string();
        assert!(display.contains("no servers"));
        assert!(display.contains("timeout acquiring"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err, Error::Io(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_display_bad_magic() {
        assert_eq!(Error::BadMagic(0x83).to_string(), "bad magic: 0x83");
    }
}
