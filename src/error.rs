#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::Arguments;
use core::str::Utf8Error;

use snafu::prelude::*;

use crate::proto::StatusCode;
use crate::sshwire::WireError;

/// The SFTP error type.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    RanOut,

    /// Not a valid string in the negotiated encoding
    BadString,

    /// Received packet at a disallowed time, or of the wrong direction.
    PacketWrong,

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    #[snafu(display("Packet size {size} too large"))]
    BigPacket { size: usize },

    /// A request arrived before the version exchange.
    NotInitialized,

    /// A second INIT arrived.
    AlreadyInitialized,

    #[snafu(display("Peer version {version} has no overlap with ours"))]
    NoVersionOverlap { version: u32 },

    /// The peer answered a request with a failure status.
    ///
    /// The code is authoritative, the message is only diagnostic.
    #[snafu(display("{code:?}: {msg}"))]
    Status { code: StatusCode, msg: String },

    /// A handle that this client didn't obtain, or already closed.
    BadHandle,

    /// A resumed transfer offset beyond the source length.
    #[snafu(display("Can't resume at {offset}, length is {len}"))]
    BadResume { offset: u64, len: u64 },

    #[snafu(display("Bad API usage: {msg}"))]
    BadUsage { msg: &'static str },

    /// The channel closed while a request was outstanding.
    ConnectionLost,

    /// A transfer was cancelled by the caller.
    Cancelled,

    /// IO Error
    IoError { source: std::io::Error },

    /// Program bug
    Bug,
}

impl Error {
    pub fn status(code: StatusCode, msg: impl Into<String>) -> Error {
        Error::Status { code, msg: msg.into() }
    }

    /// Returns the wire status if this error came from a peer status reply.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at `debug` level.
    #[cold]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            debug!("Hit a bug: {args}");
            Error::Bug
        }
    }

    #[cold]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }
}

/// A Sunset SFTP Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        match w {
            WireError::NoRoom => Error::NoRoom,
            WireError::RanOut => Error::RanOut,
            WireError::BadString => Error::BadString,
            WireError::PacketWrong => Error::PacketWrong,
            WireError::UnknownPacket { number } => Error::UnknownPacket { number },
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => Error::ConnectionLost,
            _ => Self::IoError { source: value },
        }
    }
}
