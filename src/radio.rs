//! Radio transceiver abstraction for the ground link.
//!
//! The transceiver (a LoRa module on the flight board) handles modulation,
//! framing and CRC generation/checking itself. The session only needs to hand
//! it a complete frame and to poll it for received frames.

/// A frame received by the transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct RxFrame {
    /// Number of bytes written into the receive buffer.
    pub len: usize,
    /// Whether the transceiver flagged a payload CRC error on this frame.
    pub crc_error: bool,
}

/// Half-duplex packet radio.
pub trait Radio {
    /// Transceiver error.
    type Error: core::fmt::Debug;

    /// Transmits one frame, blocking until it has left the transceiver.
    fn send(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Copies the next received frame into `buf`.
    ///
    /// Returns [`nb::Error::WouldBlock`] while nothing has been received.
    fn receive(&mut self, buf: &mut [u8]) -> nb::Result<RxFrame, Self::Error>;
}
