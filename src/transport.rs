//! Byte transport abstraction for the payload link (a UART on the flight board).

/// Point-to-point byte stream with an inspectable receive buffer.
pub trait Transport {
    /// Transport error.
    type Error: core::fmt::Debug;

    /// Number of received bytes waiting to be read.
    fn bytes_available(&mut self) -> usize;

    /// Reads up to `buf.len()` bytes; returns the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Writes all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Drops everything in the receive buffer.
    fn reset_input_buffer(&mut self);
}
