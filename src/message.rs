//! Ground-link message codec.
//!
//! Every message exchanged with the ground station starts with the same
//! 4-byte header, followed by `length` payload bytes:
//!
//! ```text
//! +---------+----------------+----------------+--------+------------------+
//! | ack (1) | message id (7) | sequence (16)  | length | payload          |
//! +---------+----------------+----------------+--------+------------------+
//!    byte 0                    bytes 1-2 (BE)   byte 3   `length` bytes
//! ```
//!
//! The ack bit asks the far end to answer before anything else is sent. It is
//! protocol metadata and is never part of the message id.
//!
//! This module provides:
//! - [`MessageId`]: the id space as a sum type (unknown ids are preserved)
//! - [`GroundMessage`]: header + payload, with [`GroundMessage::parse`] and
//!   [`GroundMessage::to_frame`]
//! - builders for every satellite-originated payload (heartbeats, image info,
//!   image chunks, OTA responses, acknowledgements)
//! - parsers for ground-originated payloads ([`AckPayload`], [`OtaChunk`])

use heapless::Vec;
use thiserror::Error;

use crate::consts::{
    GROUND_HEADER_LEN, GROUND_MAX_FRAME_LEN, GROUND_MAX_PAYLOAD_LEN, IMAGE_CHUNK_SIZE,
    MESSAGE_ID_MASK, OTA_REQUEST_PREFIX_LEN, REQ_ACK_FLAG, STAGED_IMAGE_UID,
};
use crate::fixed_point::{encode_compact_saturating, encode_standard_saturating};
use crate::telemetry::{
    BatteryReading, GpsReading, ImuReading, JetsonReading, Reading, SunReading, Topic,
};

/// Payload buffer of a ground-link message.
pub type Payload = Vec<u8, GROUND_MAX_PAYLOAD_LEN>;

/// A serialized ground-link message, header included.
pub type Frame = Vec<u8, GROUND_MAX_FRAME_LEN>;

/// Errors raised while building or parsing ground-link messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum FrameError {
    /// Fewer bytes than the header or a payload field requires.
    #[error("truncated message: {0} bytes")]
    Truncated(usize),
    /// The `length` header field disagrees with the bytes received.
    #[error("length field says {declared} bytes but {actual} followed the header")]
    LengthMismatch {
        /// Value of the `length` field.
        declared: u8,
        /// Number of bytes after the header.
        actual: usize,
    },
    /// The payload does not fit the 1-byte `length` field.
    #[error("payload of {0} bytes exceeds the maximum of 255")]
    PayloadTooLong(usize),
}

/// The heartbeat variants cycled while no ground command is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum HeartbeatKind {
    /// Battery state of charge, current and reboot count.
    Battery,
    /// Sun vector.
    Sun,
    /// Magnetometer and gyroscope.
    Imu,
    /// GPS position and velocity.
    Gps,
    /// Payload computer health.
    Jetson,
}

impl HeartbeatKind {
    /// Telemetry topic the heartbeat reports.
    pub const fn topic(self) -> Topic {
        match self {
            HeartbeatKind::Battery => Topic::Monitor,
            HeartbeatKind::Sun => Topic::Sun,
            HeartbeatKind::Imu => Topic::Imu,
            HeartbeatKind::Gps => Topic::Gps,
            HeartbeatKind::Jetson => Topic::Jetson,
        }
    }

    /// Payload length of this heartbeat on the wire.
    pub const fn payload_len(self) -> usize {
        match self {
            HeartbeatKind::Battery => 10,
            HeartbeatKind::Sun => 18,
            HeartbeatKind::Imu => 30,
            HeartbeatKind::Gps => 54,
            HeartbeatKind::Jetson => 10,
        }
    }
}

/// Ground-link message ids.
///
/// Ids this build does not know are kept as [`MessageId::Unknown`] so they can
/// be logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum MessageId {
    /// Satellite heartbeat (`0x00`–`0x04`).
    Heartbeat(HeartbeatKind),
    /// Ground station acknowledgement carrying its next request (`0x08`).
    GroundAck,
    /// Satellite acknowledgement (`0x09`).
    SatAck,
    /// OTA upload chunk from the ground (`0x14`).
    OtaRequest,
    /// OTA upload status from the satellite (`0x15`).
    OtaResponse,
    /// Metadata of the image staged for downlink (`0x21`).
    ImageInfo,
    /// Delete the staged image and move to the next one (`0x22`).
    ImageDelete,
    /// Ground ends the pass; the session resets (`0x30`).
    OtaStop,
    /// One chunk of the staged image (`0x50`).
    ImageChunk,
    /// Any other 7-bit id.
    Unknown(u8),
}

impl MessageId {
    /// Decodes an id from the first header byte. The ack bit is ignored.
    pub const fn from_raw(raw: u8) -> Self {
        match raw & MESSAGE_ID_MASK {
            0x00 => MessageId::Heartbeat(HeartbeatKind::Battery),
            0x01 => MessageId::Heartbeat(HeartbeatKind::Sun),
            0x02 => MessageId::Heartbeat(HeartbeatKind::Imu),
            0x03 => MessageId::Heartbeat(HeartbeatKind::Gps),
            0x04 => MessageId::Heartbeat(HeartbeatKind::Jetson),
            0x08 => MessageId::GroundAck,
            0x09 => MessageId::SatAck,
            0x14 => MessageId::OtaRequest,
            0x15 => MessageId::OtaResponse,
            0x21 => MessageId::ImageInfo,
            0x22 => MessageId::ImageDelete,
            0x30 => MessageId::OtaStop,
            0x50 => MessageId::ImageChunk,
            other => MessageId::Unknown(other),
        }
    }

    /// The 7-bit wire value.
    pub const fn raw(self) -> u8 {
        match self {
            MessageId::Heartbeat(HeartbeatKind::Battery) => 0x00,
            MessageId::Heartbeat(HeartbeatKind::Sun) => 0x01,
            MessageId::Heartbeat(HeartbeatKind::Imu) => 0x02,
            MessageId::Heartbeat(HeartbeatKind::Gps) => 0x03,
            MessageId::Heartbeat(HeartbeatKind::Jetson) => 0x04,
            MessageId::GroundAck => 0x08,
            MessageId::SatAck => 0x09,
            MessageId::OtaRequest => 0x14,
            MessageId::OtaResponse => 0x15,
            MessageId::ImageInfo => 0x21,
            MessageId::ImageDelete => 0x22,
            MessageId::OtaStop => 0x30,
            MessageId::ImageChunk => 0x50,
            MessageId::Unknown(raw) => raw & MESSAGE_ID_MASK,
        }
    }
}

impl From<u8> for MessageId {
    fn from(raw: u8) -> Self {
        MessageId::from_raw(raw)
    }
}

impl From<MessageId> for u8 {
    fn from(id: MessageId) -> Self {
        id.raw()
    }
}

/// One ground-link message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct GroundMessage {
    /// Whether the sender waits for an answer before continuing.
    pub ack_requested: bool,
    /// Message id.
    pub message_id: MessageId,
    /// Sequence number (chunk index for image chunks and OTA requests).
    pub sequence_count: u16,
    /// Message payload; its length is the header `length` field.
    pub payload: Payload,
}

impl GroundMessage {
    /// Builds a message from a payload slice.
    ///
    /// # Errors
    /// [`FrameError::PayloadTooLong`] if `payload` is longer than 255 bytes.
    pub fn new(
        message_id: MessageId,
        ack_requested: bool,
        sequence_count: u16,
        payload: &[u8],
    ) -> Result<Self, FrameError> {
        let payload =
            Payload::from_slice(payload).map_err(|_| FrameError::PayloadTooLong(payload.len()))?;
        Ok(Self {
            ack_requested,
            message_id,
            sequence_count,
            payload,
        })
    }

    /// Value of the `length` header field.
    pub fn length(&self) -> u8 {
        self.payload.len() as u8
    }

    /// The 4-byte header.
    pub fn header(&self) -> [u8; GROUND_HEADER_LEN] {
        let flag = if self.ack_requested { REQ_ACK_FLAG } else { 0 };
        let [seq_hi, seq_lo] = self.sequence_count.to_be_bytes();
        [flag | self.message_id.raw(), seq_hi, seq_lo, self.length()]
    }

    /// Serializes header and payload.
    pub fn to_frame(&self) -> Frame {
        let mut frame = Frame::new();
        // Header + at most 255 payload bytes always fits.
        let _ = frame.extend_from_slice(&self.header());
        let _ = frame.extend_from_slice(&self.payload);
        frame
    }

    /// Parses a received frame.
    ///
    /// # Errors
    /// - [`FrameError::Truncated`] if fewer than 4 bytes were received
    /// - [`FrameError::LengthMismatch`] if the payload does not match the `length` field
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < GROUND_HEADER_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let declared = bytes[3];
        let body = &bytes[GROUND_HEADER_LEN..];
        if body.len() != declared as usize {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        Self::new(
            MessageId::from_raw(bytes[0]),
            bytes[0] & REQ_ACK_FLAG != 0,
            u16::from_be_bytes([bytes[1], bytes[2]]),
            body,
        )
    }
}

fn push(payload: &mut Payload, bytes: &[u8]) -> Result<(), FrameError> {
    payload
        .extend_from_slice(bytes)
        .map_err(|_| FrameError::PayloadTooLong(payload.len() + bytes.len()))
}

fn push_standard(payload: &mut Payload, values: &[f32]) -> Result<(), FrameError> {
    for &value in values {
        push(payload, &encode_standard_saturating(f64::from(value)))?;
    }
    Ok(())
}

/// Builds a heartbeat from the latest reading of the matching topic.
///
/// Missing readings (or readings of the wrong topic) are sent as zeros so the
/// ground still sees a well-formed heartbeat. Heartbeats always request an ack.
pub fn heartbeat(
    kind: HeartbeatKind,
    status: u16,
    reading: Option<Reading>,
) -> Result<GroundMessage, FrameError> {
    let mut payload = Payload::new();
    push(&mut payload, &status.to_be_bytes())?;

    match kind {
        HeartbeatKind::Battery => {
            let r = match reading {
                Some(Reading::Battery(r)) => r,
                _ => BatteryReading::default(),
            };
            push(&mut payload, &[r.soc])?;
            push(&mut payload, &r.current.to_be_bytes())?;
            push(&mut payload, &[r.reboot_count])?;
            push(&mut payload, &r.time.to_be_bytes())?;
        }
        HeartbeatKind::Sun => {
            let r = match reading {
                Some(Reading::Sun(r)) => r,
                _ => SunReading::default(),
            };
            for value in r.vector {
                push(&mut payload, &encode_compact_saturating(f64::from(value)))?;
            }
            push(&mut payload, &r.time.to_be_bytes())?;
        }
        HeartbeatKind::Imu => {
            let r = match reading {
                Some(Reading::Imu(r)) => r,
                _ => ImuReading::default(),
            };
            push_standard(&mut payload, &r.mag)?;
            push_standard(&mut payload, &r.gyro)?;
            push(&mut payload, &r.time.to_be_bytes())?;
        }
        HeartbeatKind::Gps => {
            let r = match reading {
                Some(Reading::Gps(r)) => r,
                _ => GpsReading::default(),
            };
            push_standard(&mut payload, &r.position)?;
            push_standard(&mut payload, &r.position_sd)?;
            push_standard(&mut payload, &r.velocity)?;
            push_standard(&mut payload, &r.velocity_sd)?;
            push(&mut payload, &r.time.to_be_bytes())?;
        }
        HeartbeatKind::Jetson => {
            let r = match reading {
                Some(Reading::Jetson(r)) => r,
                _ => JetsonReading::default(),
            };
            push(
                &mut payload,
                &[r.ram_percent, r.disk_percent, r.cpu_temp, r.gpu_temp],
            )?;
            push(&mut payload, &r.time.to_be_bytes())?;
        }
    }

    Ok(GroundMessage {
        ack_requested: true,
        message_id: MessageId::Heartbeat(kind),
        sequence_count: 0,
        payload,
    })
}

/// Describes the image currently staged for downlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct ImageDescriptor {
    /// Image UID; `0` when nothing is staged.
    pub uid: u8,
    /// Image size in bytes.
    pub size_bytes: u32,
    /// Number of [`IMAGE_CHUNK_SIZE`]-byte chunks.
    pub chunk_count: u16,
}

impl ImageDescriptor {
    /// Descriptor reported when no image is staged.
    pub const NONE: Self = Self {
        uid: 0,
        size_bytes: 0,
        chunk_count: 0,
    };

    /// Descriptor of a staged image of `size_bytes` bytes.
    ///
    /// The chunk count saturates at `u16::MAX`; chunks past it cannot be addressed.
    pub fn staged(size_bytes: u32) -> Self {
        let chunks = size_bytes.div_ceil(IMAGE_CHUNK_SIZE as u32);
        Self {
            uid: STAGED_IMAGE_UID,
            size_bytes,
            chunk_count: u16::try_from(chunks).unwrap_or(u16::MAX),
        }
    }

    /// Byte offset and length of chunk `index`, or `None` past the end.
    pub fn chunk_span(&self, index: u16) -> Option<(u32, usize)> {
        if index >= self.chunk_count {
            return None;
        }
        let offset = index as u32 * IMAGE_CHUNK_SIZE as u32;
        let len = (self.size_bytes - offset).min(IMAGE_CHUNK_SIZE as u32) as usize;
        Some((offset, len))
    }

    /// The 7-byte image-info payload: `uid | size (BE u32) | count (BE u16)`.
    pub fn encode(&self) -> [u8; 7] {
        let [s0, s1, s2, s3] = self.size_bytes.to_be_bytes();
        let [c0, c1] = self.chunk_count.to_be_bytes();
        [self.uid, s0, s1, s2, s3, c0, c1]
    }

    /// Parses an image-info payload.
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < 7 {
            return Err(FrameError::Truncated(payload.len()));
        }
        Ok(Self {
            uid: payload[0],
            size_bytes: u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]),
            chunk_count: u16::from_be_bytes([payload[5], payload[6]]),
        })
    }
}

/// Image-info message for `descriptor`.
pub fn image_info(descriptor: &ImageDescriptor, ack_requested: bool) -> GroundMessage {
    let mut payload = Payload::new();
    let _ = payload.extend_from_slice(&descriptor.encode());
    GroundMessage {
        ack_requested,
        message_id: MessageId::ImageInfo,
        sequence_count: 0,
        payload,
    }
}

/// Confirms deletion of the previously staged image.
pub fn image_deleted(ack_requested: bool) -> GroundMessage {
    let mut payload = Payload::new();
    let _ = payload.push(0x01);
    GroundMessage {
        ack_requested,
        message_id: MessageId::ImageDelete,
        sequence_count: 0,
        payload,
    }
}

/// One image chunk; the sequence field carries the chunk index.
pub fn image_chunk(
    index: u16,
    data: &[u8],
    ack_requested: bool,
) -> Result<GroundMessage, FrameError> {
    GroundMessage::new(MessageId::ImageChunk, ack_requested, index, data)
}

/// OTA status: `success (u8) | next expected sequence (BE u16)`.
pub fn ota_response(success: bool, next_seq: u16, ack_requested: bool) -> GroundMessage {
    let [n0, n1] = next_seq.to_be_bytes();
    let mut payload = Payload::new();
    let _ = payload.extend_from_slice(&[success as u8, n0, n1]);
    GroundMessage {
        ack_requested,
        message_id: MessageId::OtaResponse,
        sequence_count: 0,
        payload,
    }
}

/// Payload of ground and satellite acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct AckPayload {
    /// Raw id of the last message the sender received.
    pub rx_message_id: u8,
    /// Message the sender asks for next.
    pub requested: MessageId,
    /// Sequence the sender asks for (image chunk index).
    pub requested_seq: u16,
}

impl AckPayload {
    /// Parses `rx id | requested id | requested seq (BE u16)`.
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < 4 {
            return Err(FrameError::Truncated(payload.len()));
        }
        Ok(Self {
            rx_message_id: payload[0] & MESSAGE_ID_MASK,
            requested: MessageId::from_raw(payload[1]),
            requested_seq: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    /// Serializes the payload.
    pub fn encode(&self) -> [u8; 4] {
        let [s0, s1] = self.requested_seq.to_be_bytes();
        [self.rx_message_id, self.requested.raw(), s0, s1]
    }

    /// Wraps the payload into a message with id `message_id`.
    pub fn into_message(self, message_id: MessageId, ack_requested: bool) -> GroundMessage {
        let mut payload = Payload::new();
        let _ = payload.extend_from_slice(&self.encode());
        GroundMessage {
            ack_requested,
            message_id,
            sequence_count: 0,
            payload,
        }
    }
}

/// One OTA upload chunk received from the ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaChunk<'a> {
    /// Chunk sequence (header sequence field).
    pub sequence: u16,
    /// Chunks still to come after this one.
    pub packets_remaining: u16,
    /// Chunk data.
    pub data: &'a [u8],
}

impl<'a> OtaChunk<'a> {
    /// Extracts the chunk from an OTA request message.
    pub fn parse(message: &'a GroundMessage) -> Result<Self, FrameError> {
        let payload = message.payload.as_slice();
        if payload.len() < OTA_REQUEST_PREFIX_LEN {
            return Err(FrameError::Truncated(payload.len()));
        }
        Ok(Self {
            sequence: message.sequence_count,
            packets_remaining: u16::from_be_bytes([payload[0], payload[1]]),
            data: &payload[OTA_REQUEST_PREFIX_LEN..],
        })
    }

    /// Builds the OTA request carrying this chunk, as the ground station sends it.
    pub fn to_message(&self) -> Result<GroundMessage, FrameError> {
        let mut payload = Payload::new();
        push(&mut payload, &self.packets_remaining.to_be_bytes())?;
        push(&mut payload, self.data)?;
        Ok(GroundMessage {
            ack_requested: true,
            message_id: MessageId::OtaRequest,
            sequence_count: self.sequence,
            payload,
        })
    }
}
