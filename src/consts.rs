//! Constants used across both links.
//!
//! This module defines the protocol-wide constants for the ground radio link
//! and the payload serial link: header layouts, chunk sizes, buffer
//! capacities and the default timing budgets.
//!
//! ## Key Concepts
//!
//! - **Ground header**: fixed 4-byte header, `ack(1) | id(7)`, sequence, length.
//! - **Image chunks**: images are downlinked in chunks of at most
//!   [`IMAGE_CHUNK_SIZE`] bytes, addressed by the header sequence field.
//! - **Payload packets**: every packet on the serial link has a fixed size and a
//!   4-byte metadata prefix; the remainder carries data.
//! - **Buffer sizing**: capacities for the `heapless` buffers that replace heap
//!   allocation in the session and transfer engines.
//!
//! Runtime-tunable values (timeouts, retry bounds, batch size) live in
//! [`GroundLinkConfig`](crate::session::GroundLinkConfig) and
//! [`PayloadLinkConfig`](crate::transfer::PayloadLinkConfig); the values here
//! are their defaults.

/// Length (in bytes) of the ground-link message header.
pub const GROUND_HEADER_LEN: usize = 4;

/// Maximum payload carried by one ground-link message.
///
/// Bounded by the 1-byte `length` header field.
pub const GROUND_MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Maximum size of a complete ground-link frame (header + payload).
pub const GROUND_MAX_FRAME_LEN: usize = GROUND_HEADER_LEN + GROUND_MAX_PAYLOAD_LEN;

/// Bit of the first header byte that asks the far end for an acknowledgement.
pub const REQ_ACK_FLAG: u8 = 0x80;

/// Mask selecting the message id from the first header byte.
pub const MESSAGE_ID_MASK: u8 = 0x7f;

/// Size (in bytes) of one downlinked image chunk.
pub const IMAGE_CHUNK_SIZE: usize = 196;

/// UID reported for the staged image. `0` means no image is staged.
pub const STAGED_IMAGE_UID: u8 = 0x01;

/// Number of image paths the session can keep staged for downlink.
pub const MAX_STAGED_IMAGES: usize = 4;

/// Maximum length of a staged image path.
pub const MAX_IMAGE_PATH_LEN: usize = 64;

/// Maximum number of heartbeat kinds in a heartbeat cycle.
pub const MAX_HEARTBEAT_CYCLE: usize = 5;

/// Size of the `packets_remaining` prefix of an OTA request payload.
pub const OTA_REQUEST_PREFIX_LEN: usize = 2;

/// Largest chunk an OTA request can carry.
pub const OTA_MAX_CHUNK_LEN: usize = GROUND_MAX_PAYLOAD_LEN - OTA_REQUEST_PREFIX_LEN;

/// Default number of OTA chunks the reassembly buffer holds; larger uploads need
/// a session built with a larger capacity.
pub const OTA_MAX_CHUNKS: usize = 64;

/// Default number of image chunks sent per ground acknowledgement round.
pub const DEFAULT_SEND_MOD: u16 = 10;

/// Default receive timeout for one ground exchange, in milliseconds.
pub const DEFAULT_GROUND_TIMEOUT_MS: u32 = 1_000;

/// Default polling interval while waiting on the radio, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u32 = 10;

/// Default pause between frames of one downlink burst, in milliseconds.
pub const DEFAULT_BURST_GAP_MS: u32 = 150;

/// Default number of consecutive OTA repairs tolerated before the upload is dropped.
pub const DEFAULT_MAX_OTA_REPAIRS: u16 = 16;

/// Length (in bytes) of the metadata prefix of every payload-link packet.
///
/// `sequence (2) | kind (1) | payload size (1)`
pub const PKT_METADATA_SIZE: usize = 4;

/// Payload size advertised by header packets.
pub const HEADER_PAYLOAD_SIZE: u8 = 4;

/// Number of meaningful bytes in a header packet payload (`message_type | packet_count`).
pub const HEADER_FIELDS_LEN: usize = 3;

/// Packet size of the compact payload-link variant.
pub const COMPACT_PACKET_SIZE: usize = 64;

/// Packet size of the extended payload-link variant.
pub const EXTENDED_PACKET_SIZE: usize = 256;

/// Size of the largest supported packet; packet buffers are sized for it.
pub const MAX_PACKET_SIZE: usize = EXTENDED_PACKET_SIZE;

/// Maximum number of data packets in one payload message (16-bit field).
pub const MAX_PACKETS: usize = u16::MAX as usize;

/// Default consecutive-mismatch bound on the payload receiver.
pub const DEFAULT_MAX_RECEIVE_RETRIES: u8 = 3;

/// Default bound on non-advancing send attempts on the payload sender.
pub const DEFAULT_MAX_SEND_ATTEMPTS: u16 = 16;

/// Default tick budget while waiting for a payload header packet.
pub const DEFAULT_HEADER_TIMEOUT_TICKS: u32 = 1_000;

/// Default tick budget while waiting for any other payload packet.
pub const DEFAULT_PACKET_TIMEOUT_TICKS: u32 = 1_000;

/// Default duration of one polling tick on the payload link, in microseconds.
pub const DEFAULT_TICK_US: u32 = 10_000;
