//! Stop-and-wait transfer over the payload link.
//!
//! The sender announces a message with a header packet and then sends its data
//! packets one at a time, each only after the previous one was acknowledged:
//!
//! ```text
//! sender                          receiver
//!   | -- header (seq 0) ------------> |
//!   | <------------------- ack 0 ---- |
//!   | -- data 1 --------------------> |
//!   | <------------------- ack 1 ---- |
//!   |            ...                  |
//!   | -- data N --------------------> |
//!   | <------------------- ack N ---- |
//! ```
//!
//! A lost data packet or ack is recovered by resending; a confused peer is
//! recovered by restarting from the header. Both ends give up after a bounded
//! number of failed exchanges, see [`PayloadLinkConfig`].

use core::convert::Infallible;

use embedded_hal::delay::DelayNs;
use thiserror::Error;

use crate::consts::{
    DEFAULT_HEADER_TIMEOUT_TICKS, DEFAULT_MAX_RECEIVE_RETRIES, DEFAULT_MAX_SEND_ATTEMPTS,
    DEFAULT_PACKET_TIMEOUT_TICKS, DEFAULT_TICK_US, MAX_PACKET_SIZE, PKT_METADATA_SIZE,
};
use crate::packet::{
    PacketBuf, PacketCodec, PacketError, PacketKind, PacketMeta, PacketSize, PayloadMessage,
    decode_header_payload, decode_meta,
};
use crate::store::{StoreError, UploadStore};
use crate::timer::{TickBudget, poll_with_budget};
use crate::transport::Transport;

/// Runtime settings of the payload link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct PayloadLinkConfig {
    /// Fixed packet size used by both ends.
    pub packet_size: PacketSize,
    /// How long the receiver waits for a header.
    pub header_timeout: TickBudget,
    /// How long either end waits for the next packet.
    pub packet_timeout: TickBudget,
    /// Consecutive bad or missing data packets the receiver tolerates.
    pub max_receive_retries: u8,
    /// Consecutive resends or restarts the sender tolerates.
    pub max_send_attempts: u16,
}

impl Default for PayloadLinkConfig {
    fn default() -> Self {
        Self {
            packet_size: PacketSize::default(),
            header_timeout: TickBudget::new(DEFAULT_HEADER_TIMEOUT_TICKS, DEFAULT_TICK_US),
            packet_timeout: TickBudget::new(DEFAULT_PACKET_TIMEOUT_TICKS, DEFAULT_TICK_US),
            max_receive_retries: DEFAULT_MAX_RECEIVE_RETRIES,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
        }
    }
}

/// Errors returned by the payload link.
#[derive(Debug, Error)]
pub enum LinkError<E> {
    /// The transport failed.
    #[error("transport error: {0:?}")]
    Transport(E),
    /// A packet could not be encoded or decoded.
    #[error(transparent)]
    Packet(#[from] PacketError),
    /// Nothing arrived in time; the payload is not talking.
    #[error("no packet within the timeout")]
    LinkTimeout,
    /// Retries exhausted; any partial upload was discarded.
    #[error("transfer failed")]
    TransferFailed,
    /// The upload sink failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary of a message received with [`PayloadLink::receive_message`].
///
/// The bytes themselves were written to the upload sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct ReceivedMessage {
    /// Message type from the header.
    pub message_type: u8,
    /// Number of data packets.
    pub packet_count: u16,
    /// Number of bytes written to the sink.
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
enum SendState {
    Header,
    Packet(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
enum DataOutcome {
    Complete(usize),
    Restarted { message_type: u8, packet_count: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
enum Response {
    Packet(PacketMeta),
    Garbled,
    Silent,
}

/// One end of the payload link.
#[derive(Debug)]
pub struct PayloadLink<T, D> {
    transport: T,
    delay: D,
    config: PayloadLinkConfig,
    codec: PacketCodec,
}

impl<T: Transport, D: DelayNs> PayloadLink<T, D> {
    /// Creates a link over `transport`.
    pub fn new(transport: T, delay: D, config: PayloadLinkConfig) -> Self {
        Self {
            transport,
            delay,
            codec: PacketCodec::new(config.packet_size),
            config,
        }
    }

    /// Link settings.
    pub fn config(&self) -> &PayloadLinkConfig {
        &self.config
    }

    /// Gives back the transport and delay provider.
    pub fn release(self) -> (T, D) {
        (self.transport, self.delay)
    }

    fn wait_for(&mut self, len: usize, budget: TickBudget) -> bool {
        let transport = &mut self.transport;
        let ready = poll_with_budget(&mut self.delay, budget, || -> nb::Result<(), Infallible> {
            if transport.bytes_available() >= len {
                Ok(())
            } else {
                Err(nb::Error::WouldBlock)
            }
        });
        matches!(ready, Ok(Some(())))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LinkError<T::Error>> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .transport
                .read(&mut buf[filled..])
                .map_err(LinkError::Transport)?;
            if n == 0 {
                return Err(PacketError::MalformedPacket.into());
            }
            filled += n;
        }
        Ok(())
    }

    fn write(&mut self, packet: &PacketBuf) -> Result<(), LinkError<T::Error>> {
        self.transport.write(packet).map_err(LinkError::Transport)
    }

    fn await_response(&mut self) -> Result<Response, LinkError<T::Error>> {
        if !self.wait_for(PKT_METADATA_SIZE, self.config.packet_timeout) {
            return Ok(Response::Silent);
        }
        let mut meta = [0u8; PKT_METADATA_SIZE];
        self.read_exact(&mut meta)?;
        Ok(match decode_meta(&meta) {
            Ok(meta) => Response::Packet(meta),
            Err(_) => Response::Garbled,
        })
    }

    /// Sends `message`, returning once its last packet was acknowledged.
    ///
    /// # Errors
    /// - [`LinkError::TransferFailed`] after more than `max_send_attempts`
    ///   consecutive resends or restarts
    /// - [`LinkError::Transport`] if the transport fails
    pub fn send_message(&mut self, message: &PayloadMessage<'_>) -> Result<(), LinkError<T::Error>> {
        let count = message.packet_count();
        let mut state = SendState::Header;
        let mut setbacks: u16 = 0;
        debug!(
            "sending message type {} in {} packets",
            message.message_type(),
            count
        );

        loop {
            let (sequence, packet) = match state {
                SendState::Header => (0, self.codec.encode_header(message.message_type(), count)),
                SendState::Packet(sequence) => {
                    let chunk = message
                        .chunk(sequence)
                        .ok_or(PacketError::MalformedPacket)?;
                    (sequence, self.codec.encode_data(sequence, chunk)?)
                }
            };
            self.write(&packet)?;

            let next = match self.await_response()? {
                Response::Packet(PacketMeta {
                    kind: PacketKind::Ack,
                    sequence: acked,
                    ..
                }) if acked == sequence => {
                    if sequence == count {
                        debug!("message delivered");
                        return Ok(());
                    }
                    if sequence > 0 {
                        setbacks = 0;
                    }
                    trace!("packet {} acknowledged", sequence);
                    state = SendState::Packet(sequence + 1);
                    continue;
                }
                Response::Packet(PacketMeta {
                    kind: PacketKind::Nack,
                    ..
                }) => {
                    debug!("packet {} rejected, resending", sequence);
                    state
                }
                Response::Packet(PacketMeta {
                    kind: PacketKind::Ack,
                    sequence: acked,
                    ..
                }) if acked < sequence => {
                    // The receiver is still waiting for this packet.
                    debug!("ack {} behind packet {}, resending", acked, sequence);
                    state
                }
                Response::Silent => {
                    debug!("no response to packet {}, resending", sequence);
                    state
                }
                Response::Packet(PacketMeta {
                    kind: PacketKind::Reset,
                    ..
                }) => {
                    debug!("receiver asked for a restart");
                    SendState::Header
                }
                other => {
                    warn!("unexpected response {:?} to packet {}, restarting", other, sequence);
                    SendState::Header
                }
            };

            if setbacks >= self.config.max_send_attempts {
                error!("giving up after {} resends or restarts", setbacks);
                return Err(LinkError::TransferFailed);
            }
            setbacks += 1;
            state = next;
        }
    }

    /// Receives one message into a new upload in `store`.
    ///
    /// A header arriving in the middle of the data means the sender started
    /// over; the partial upload is discarded and reception restarts.
    ///
    /// # Errors
    /// - [`LinkError::LinkTimeout`] if no header arrives within the header timeout
    /// - [`LinkError::Packet`] if the first packet is not a valid header
    /// - [`LinkError::TransferFailed`] after more than `max_receive_retries`
    ///   consecutive bad or missing data packets, or as many restarts; the
    ///   upload is discarded
    pub fn receive_message<S: UploadStore>(
        &mut self,
        store: &mut S,
    ) -> Result<ReceivedMessage, LinkError<T::Error>> {
        let size = self.config.packet_size.bytes();
        if !self.wait_for(size, self.config.header_timeout) {
            return Err(LinkError::LinkTimeout);
        }

        let mut buf = [0u8; MAX_PACKET_SIZE];
        self.read_exact(&mut buf[..size])?;
        self.transport.reset_input_buffer();

        let meta = decode_meta(&buf[..size])?;
        if meta.kind != PacketKind::Header {
            warn!("expected a header, got {:?}", meta.kind);
            return Err(PacketError::MalformedPacket.into());
        }
        let (mut message_type, mut packet_count) =
            decode_header_payload(&buf[PKT_METADATA_SIZE..size])?;
        let mut restarts: u8 = 0;

        loop {
            debug!(
                "receiving message type {} in {} packets",
                message_type, packet_count
            );
            self.write(&self.codec.encode_ack(0))?;

            let mut handle = store.open_upload_sink()?;
            match self.receive_data(store, &mut handle, packet_count, &mut buf) {
                Ok(DataOutcome::Complete(len)) => {
                    store.finalize(handle)?;
                    return Ok(ReceivedMessage {
                        message_type,
                        packet_count,
                        len,
                    });
                }
                Ok(DataOutcome::Restarted {
                    message_type: restarted_type,
                    packet_count: restarted_count,
                }) => {
                    store.discard(handle);
                    if restarts >= self.config.max_receive_retries {
                        error!("sender restarted again after {} restarts, giving up", restarts);
                        return Err(LinkError::TransferFailed);
                    }
                    restarts += 1;
                    message_type = restarted_type;
                    packet_count = restarted_count;
                }
                Err(e) => {
                    store.discard(handle);
                    return Err(e);
                }
            }
        }
    }

    fn receive_data<S: UploadStore>(
        &mut self,
        store: &mut S,
        handle: &mut S::Handle,
        packet_count: u16,
        buf: &mut [u8; MAX_PACKET_SIZE],
    ) -> Result<DataOutcome, LinkError<T::Error>> {
        let size = self.config.packet_size.bytes();
        let mut expected: u16 = 1;
        let mut retries: u8 = 0;
        let mut len = 0;

        while u32::from(expected) <= u32::from(packet_count) {
            let meta = if self.wait_for(size, self.config.packet_timeout) {
                self.read_exact(&mut buf[..size])?;
                decode_meta(&buf[..size]).ok()
            } else {
                None
            };

            match meta {
                Some(meta) if meta.kind == PacketKind::Data && meta.sequence == expected => {
                    let n = usize::from(meta.payload_size).min(size - PKT_METADATA_SIZE);
                    store.write_chunk(handle, &buf[PKT_METADATA_SIZE..PKT_METADATA_SIZE + n])?;
                    len += n;
                    self.write(&self.codec.encode_ack(expected))?;
                    trace!("packet {} received", expected);
                    retries = 0;
                    match expected.checked_add(1) {
                        Some(next) => expected = next,
                        None => break,
                    }
                }
                Some(meta) if meta.kind == PacketKind::Header => {
                    if let Ok((message_type, packet_count)) =
                        decode_header_payload(&buf[PKT_METADATA_SIZE..size])
                    {
                        debug!("sender restarted at packet {}", expected);
                        return Ok(DataOutcome::Restarted {
                            message_type,
                            packet_count,
                        });
                    }
                    retries = self.retry(expected, retries)?;
                }
                _ => retries = self.retry(expected, retries)?,
            }
        }
        Ok(DataOutcome::Complete(len))
    }

    /// Counts a bad or missing packet, drops whatever is left of it and
    /// re-acks the last good sequence.
    fn retry(&mut self, expected: u16, retries: u8) -> Result<u8, LinkError<T::Error>> {
        if retries >= self.config.max_receive_retries {
            error!("packet {} lost after {} retries", expected, retries);
            return Err(LinkError::TransferFailed);
        }
        debug!("packet {} missing or out of order, re-acking", expected);
        self.transport.reset_input_buffer();
        self.write(&self.codec.encode_ack(expected - 1))?;
        Ok(retries + 1)
    }
}
