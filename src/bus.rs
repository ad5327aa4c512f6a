//! The transport seam.
//!
//! Opening an instrument address and moving bytes are left to the caller. Any byte stream that
//! implements [embedded_io::Read] & [embedded_io::Write] can carry the instrument dialects; the
//! few session-level controls the drivers need on top of that are collected in [BusSession].

use core::time::Duration;

/// A message-based instrument session (GPIB, USBTMC, a serial GPIB adapter, ...).
///
/// Reads are expected to block until at least one byte is available or the configured timeout
/// elapses, in which case the implementation should return an error whose
/// [kind](embedded_io::Error::kind) is [`TimedOut`](embedded_io::ErrorKind::TimedOut).
pub trait BusSession: embedded_io::Read + embedded_io::Write {
    /// Set the read timeout. Default for the supplies is 5 seconds.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Self::Error>;

    /// Discard anything pending in the device's output queue and in local input buffers.
    fn clear(&mut self) -> Result<(), Self::Error>;
}

impl<T: BusSession + ?Sized> BusSession for &mut T {
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Self::Error> {
        T::set_timeout(self, timeout)
    }

    fn clear(&mut self) -> Result<(), Self::Error> {
        T::clear(self)
    }
}
