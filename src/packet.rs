//! Payload-link packet codec.
//!
//! Every packet on the payload serial link has the same layout:
//!
//! ```text
//! +-----------------+-------------+--------------+-----------------------------+
//! | sequence (BE16) | kind (1)    | payload size | payload (padded to P bytes) |
//! +-----------------+-------------+--------------+-----------------------------+
//! ```
//!
//! Header and data packets are always padded to the link's fixed packet size
//! `P` so the receiver can wait for exactly `P` bytes. Ack, nack and reset
//! packets carry only the 4 metadata bytes.
//!
//! A header packet's payload is `message type (1) | packet count (BE16)`.
//!
//! ## Packet kinds
//!
//! | Kind   | Value | Sent by  | Meaning                                  |
//! |--------|-------|----------|------------------------------------------|
//! | Header | 0     | sender   | a message of `packet count` packets follows |
//! | Data   | 1     | sender   | one chunk, 1-based sequence              |
//! | Ack    | 2     | receiver | `sequence` arrived                       |
//! | Nack   | 3     | receiver | resend `sequence`                        |
//! | Reset  | 4     | receiver | restart from the header                  |

use heapless::Vec;
use thiserror::Error;

use crate::consts::{
    COMPACT_PACKET_SIZE, EXTENDED_PACKET_SIZE, HEADER_FIELDS_LEN, HEADER_PAYLOAD_SIZE,
    MAX_PACKET_SIZE, MAX_PACKETS, PKT_METADATA_SIZE,
};

/// Buffer holding one encoded packet.
pub type PacketBuf = Vec<u8, MAX_PACKET_SIZE>;

/// Errors raised by the packet codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum PacketError {
    /// Undersized metadata or header payload, or an unknown kind byte.
    #[error("malformed packet")]
    MalformedPacket,
    /// The message would need more than 65535 data packets.
    #[error("message needs {0} packets, the limit is 65535")]
    MessageTooLarge(usize),
    /// A data chunk is longer than the packet can carry.
    #[error("chunk of {len} bytes exceeds {max} bytes per packet")]
    ChunkTooLarge {
        /// Length of the offending chunk.
        len: usize,
        /// Payload capacity of one packet.
        max: usize,
    },
}

/// Packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketKind {
    /// Message header.
    Header = 0,
    /// Data chunk.
    Data = 1,
    /// Positive acknowledgement.
    Ack = 2,
    /// Negative acknowledgement.
    Nack = 3,
    /// Restart request.
    Reset = 4,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::Header),
            1 => Ok(PacketKind::Data),
            2 => Ok(PacketKind::Ack),
            3 => Ok(PacketKind::Nack),
            4 => Ok(PacketKind::Reset),
            _ => Err(PacketError::MalformedPacket),
        }
    }
}

/// Fixed packet size of a payload link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum PacketSize {
    /// 64-byte packets.
    #[default]
    Compact,
    /// 256-byte packets.
    Extended,
}

impl PacketSize {
    /// Total packet size `P`.
    pub const fn bytes(self) -> usize {
        match self {
            PacketSize::Compact => COMPACT_PACKET_SIZE,
            PacketSize::Extended => EXTENDED_PACKET_SIZE,
        }
    }

    /// Data bytes per packet, `P - 4`.
    pub const fn payload_per_packet(self) -> usize {
        self.bytes() - PKT_METADATA_SIZE
    }
}

/// Decoded packet metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct PacketMeta {
    /// Packet sequence (0 for header and reset).
    pub sequence: u16,
    /// Packet kind.
    pub kind: PacketKind,
    /// Number of meaningful payload bytes.
    pub payload_size: u8,
}

fn metadata(sequence: u16, kind: PacketKind, payload_size: u8) -> PacketBuf {
    let [s0, s1] = sequence.to_be_bytes();
    let mut packet = PacketBuf::new();
    let _ = packet.extend_from_slice(&[s0, s1, kind as u8, payload_size]);
    packet
}

/// Encodes packets for one link packet size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct PacketCodec {
    size: PacketSize,
}

impl PacketCodec {
    /// Creates a codec for `size` packets.
    pub const fn new(size: PacketSize) -> Self {
        Self { size }
    }

    /// Packet size this codec produces.
    pub const fn size(&self) -> PacketSize {
        self.size
    }

    /// Header packet announcing `packet_count` data packets of `message_type`.
    pub fn encode_header(&self, message_type: u8, packet_count: u16) -> PacketBuf {
        let mut packet = metadata(0, PacketKind::Header, HEADER_PAYLOAD_SIZE);
        let [c0, c1] = packet_count.to_be_bytes();
        let _ = packet.extend_from_slice(&[message_type, c0, c1]);
        let _ = packet.resize(self.size.bytes(), 0);
        packet
    }

    /// Data packet `sequence` carrying `chunk`, zero-padded to the packet size.
    ///
    /// # Errors
    /// [`PacketError::ChunkTooLarge`] if `chunk` exceeds the payload per packet.
    pub fn encode_data(&self, sequence: u16, chunk: &[u8]) -> Result<PacketBuf, PacketError> {
        let max = self.size.payload_per_packet();
        if chunk.len() > max {
            return Err(PacketError::ChunkTooLarge {
                len: chunk.len(),
                max,
            });
        }
        let mut packet = metadata(sequence, PacketKind::Data, chunk.len() as u8);
        let _ = packet.extend_from_slice(chunk);
        let _ = packet.resize(self.size.bytes(), 0);
        Ok(packet)
    }

    /// Acknowledges `sequence`.
    pub fn encode_ack(&self, sequence: u16) -> PacketBuf {
        metadata(sequence, PacketKind::Ack, 0)
    }

    /// Asks for `sequence` again.
    pub fn encode_nack(&self, sequence: u16) -> PacketBuf {
        metadata(sequence, PacketKind::Nack, 0)
    }

    /// Asks the sender to restart from the header.
    pub fn encode_reset(&self) -> PacketBuf {
        metadata(0, PacketKind::Reset, 0)
    }
}

/// Decodes the 4 metadata bytes at the start of `bytes`.
///
/// # Errors
/// [`PacketError::MalformedPacket`] if fewer than 4 bytes are given or the kind
/// byte is unknown.
pub fn decode_meta(bytes: &[u8]) -> Result<PacketMeta, PacketError> {
    if bytes.len() < PKT_METADATA_SIZE {
        return Err(PacketError::MalformedPacket);
    }
    Ok(PacketMeta {
        sequence: u16::from_be_bytes([bytes[0], bytes[1]]),
        kind: PacketKind::try_from(bytes[2])?,
        payload_size: bytes[3],
    })
}

/// Decodes a header payload into `(message_type, packet_count)`.
///
/// # Errors
/// [`PacketError::MalformedPacket`] if fewer than 3 bytes are given.
pub fn decode_header_payload(bytes: &[u8]) -> Result<(u8, u16), PacketError> {
    if bytes.len() < HEADER_FIELDS_LEN {
        return Err(PacketError::MalformedPacket);
    }
    Ok((bytes[0], u16::from_be_bytes([bytes[1], bytes[2]])))
}

/// A message to send over the payload link, split into packets.
///
/// Chunks borrow from `data`; only the last one may be shorter than the
/// payload per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadMessage<'a> {
    message_type: u8,
    data: &'a [u8],
    packet_count: u16,
    payload_per_packet: usize,
}

impl<'a> PayloadMessage<'a> {
    /// Splits `data` for a link with `size` packets.
    ///
    /// # Errors
    /// [`PacketError::MessageTooLarge`] if more than 65535 packets would be needed.
    pub fn new(message_type: u8, data: &'a [u8], size: PacketSize) -> Result<Self, PacketError> {
        let payload_per_packet = size.payload_per_packet();
        let packets = data.len().div_ceil(payload_per_packet);
        if packets > MAX_PACKETS {
            return Err(PacketError::MessageTooLarge(packets));
        }
        Ok(Self {
            message_type,
            data,
            packet_count: packets as u16,
            payload_per_packet,
        })
    }

    /// Message type announced in the header.
    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    /// Number of data packets.
    pub fn packet_count(&self) -> u16 {
        self.packet_count
    }

    /// Chunk carried by data packet `sequence` (1-based).
    pub fn chunk(&self, sequence: u16) -> Option<&'a [u8]> {
        if sequence == 0 || sequence > self.packet_count {
            return None;
        }
        let start = (sequence as usize - 1) * self.payload_per_packet;
        let end = (start + self.payload_per_packet).min(self.data.len());
        Some(&self.data[start..end])
    }

    /// All chunks in order.
    pub fn chunks(&self) -> core::slice::Chunks<'a, u8> {
        self.data.chunks(self.payload_per_packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let codec = PacketCodec::new(PacketSize::Compact);
        let header = codec.encode_header(0x60, 0x0102);
        assert_eq!(header.len(), 64);
        assert_eq!(&header[..7], &[0, 0, 0, 4, 0x60, 0x01, 0x02]);
        assert!(header[7..].iter().all(|&b| b == 0));

        let meta = decode_meta(&header).unwrap();
        assert_eq!(meta.kind, PacketKind::Header);
        assert_eq!(meta.payload_size, 4);
        assert_eq!(decode_header_payload(&header[4..]).unwrap(), (0x60, 0x0102));
    }

    #[test]
    fn test_data_packet_is_padded() {
        let codec = PacketCodec::new(PacketSize::Extended);
        let packet = codec.encode_data(3, b"hello").unwrap();
        assert_eq!(packet.len(), 256);
        assert_eq!(
            decode_meta(&packet).unwrap(),
            PacketMeta {
                sequence: 3,
                kind: PacketKind::Data,
                payload_size: 5
            }
        );
        assert_eq!(&packet[4..9], b"hello");

        assert_eq!(
            PacketCodec::new(PacketSize::Compact).encode_data(1, &[0; 61]),
            Err(PacketError::ChunkTooLarge { len: 61, max: 60 })
        );
    }

    #[test]
    fn test_control_packets_are_metadata_only() {
        let codec = PacketCodec::default();
        assert_eq!(codec.encode_ack(0x0203).as_slice(), &[0x02, 0x03, 2, 0]);
        assert_eq!(codec.encode_nack(7).as_slice(), &[0, 7, 3, 0]);
        assert_eq!(codec.encode_reset().as_slice(), &[0, 0, 4, 0]);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert_eq!(decode_meta(&[0, 1]), Err(PacketError::MalformedPacket));
        assert_eq!(decode_meta(&[0, 1, 9, 0]), Err(PacketError::MalformedPacket));
        assert_eq!(decode_header_payload(&[0x60]), Err(PacketError::MalformedPacket));
    }

    #[test]
    fn test_message_chunking() {
        let data = [7u8; 130];
        let message = PayloadMessage::new(0x60, &data, PacketSize::Compact).unwrap();
        assert_eq!(message.packet_count(), 3);
        assert_eq!(message.chunk(1).unwrap().len(), 60);
        assert_eq!(message.chunk(3).unwrap().len(), 10);
        assert_eq!(message.chunk(0), None);
        assert_eq!(message.chunk(4), None);
        assert_eq!(message.chunks().map(<[u8]>::len).sum::<usize>(), 130);

        let empty = PayloadMessage::new(0x61, &[], PacketSize::Compact).unwrap();
        assert_eq!(empty.packet_count(), 0);
    }

    #[test]
    fn test_message_too_large() {
        let data = std::vec![0u8; 60 * 65_536];
        assert_eq!(
            PayloadMessage::new(0x60, &data, PacketSize::Compact),
            Err(PacketError::MessageTooLarge(65_536))
        );
    }
}
