//! Our error types for the bus, the codec and the supply drivers.

use thiserror::Error;

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Custom error type for bench supply communications.
///
/// Generic over the error type of the injected [`BusSession`](crate::bus::BusSession) so
/// transport failures keep their original cause.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    #[error("Bus transport error")]
    Transport(I),
    #[error("Communication timeout")]
    Timeout,
    #[error("Bus session closed")]
    Disconnected,
    #[error("Malformed response: {0}")]
    Format(#[from] FormatError),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),
    #[error("Not supported by this instrument: {0}")]
    Unsupported(&'static str),
    #[error("Invalid range")]
    InvalidRange,
}

impl<I: embedded_io::Error> Error<I> {
    /// Map a raw transport error, singling out timeouts.
    pub fn from_transport(err: I) -> Self {
        match err.kind() {
            embedded_io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Transport(err),
        }
    }

    /// `true` for timeouts, disconnects and other transport failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout | Error::Disconnected
        )
    }
}

/// Decoding failures which don't depend on the transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormatError {
    #[error("not a number: {0:?}")]
    BadNumber(String),
    #[error("bad definite-length block header")]
    BlockHeader,
    #[error("block payload of {0} bytes is not a whole number of floats")]
    BlockLength(usize),
    #[error("response is not valid UTF-8")]
    NotUtf8,
}
