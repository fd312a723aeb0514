//! Ground-link session.
//!
//! [`GroundSessionState`] holds everything the satellite remembers about the
//! current ground pass and decides, one message at a time, what to transmit
//! next. [`GroundSession`] wraps it together with a [`Radio`] and a delay
//! provider and runs the transmit/receive cycle the comms task drives.
//!
//! ## Transmit priority
//!
//! Every call to [`GroundSessionState::transmit_step`] picks exactly one message:
//!
//! | Tier | Condition                                 | Message                       |
//! |------|-------------------------------------------|-------------------------------|
//! | 1    | no heartbeat sent yet, or a CRC error     | next heartbeat of the cycle   |
//! | 2    | ground asked for image info               | [`message::image_info`]       |
//! | 3    | ground asked to delete the image          | [`message::image_deleted`]    |
//! | 4    | ground asked for an image chunk           | [`message::image_chunk`]      |
//! | 5    | ground sent an OTA chunk                  | [`message::ota_response`]     |
//! | 6    | anything else                             | satellite acknowledgement     |
//!
//! Image chunks go out in bursts: only the last chunk of a burst asks the
//! ground for an acknowledgement, and [`GroundSessionState::burst_pending`]
//! tells the caller to keep transmitting until then.
//!
//! ## Example
//!
//! ```rust
//! use satcomms::session::{GroundLinkConfig, GroundSessionState};
//! use satcomms::message::{HeartbeatKind, MessageId};
//! use satcomms::store::{ImageStore, StoreError};
//! use satcomms::telemetry::{Reading, TelemetryStore, Topic};
//!
//! struct Empty;
//! impl TelemetryStore for Empty {
//!     fn latest_reading(&mut self, _topic: Topic) -> Option<Reading> { None }
//! }
//! impl ImageStore for Empty {
//!     fn image_size(&mut self, _path: &str) -> Result<u32, StoreError> { Err(StoreError::NotFound) }
//!     fn read_image(&mut self, _path: &str, _offset: u32, _buf: &mut [u8]) -> Result<usize, StoreError> {
//!         Err(StoreError::NotFound)
//!     }
//! }
//!
//! let mut state = GroundSessionState::new(GroundLinkConfig::default());
//! let first = state.transmit_step(&mut Empty).unwrap();
//! assert_eq!(first.message_id, MessageId::Heartbeat(HeartbeatKind::Battery));
//! assert!(first.ack_requested);
//! ```

use core::convert::Infallible;

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use thiserror::Error;

use crate::consts::{
    DEFAULT_BURST_GAP_MS, DEFAULT_GROUND_TIMEOUT_MS, DEFAULT_MAX_OTA_REPAIRS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_SEND_MOD, GROUND_MAX_FRAME_LEN, IMAGE_CHUNK_SIZE,
    MAX_HEARTBEAT_CYCLE, MAX_STAGED_IMAGES, OTA_MAX_CHUNK_LEN, OTA_MAX_CHUNKS,
};
use crate::message::{
    self, AckPayload, FrameError, GroundMessage, HeartbeatKind, ImageDescriptor, MessageId,
    OtaChunk,
};
use crate::radio::{Radio, RxFrame};
use crate::store::{ImagePath, ImageStore, StoreError, UploadStore};
use crate::telemetry::TelemetryStore;
use crate::timer::{TickBudget, poll_with_budget};

/// Runtime settings of the ground link.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct GroundLinkConfig {
    /// Maximum number of image chunks per burst.
    pub send_mod: u16,
    /// How long [`GroundSession::exchange`] listens for the ground.
    pub timeout_ms: u32,
    /// Radio polling interval while listening.
    pub poll_interval_ms: u32,
    /// Pause before every transmitted frame.
    pub burst_gap_ms: u32,
    /// Consecutive OTA repairs tolerated before the upload is dropped.
    pub max_ota_repairs: u16,
    /// Heartbeats sent round robin while the ground is silent.
    pub heartbeat_cycle: Vec<HeartbeatKind, MAX_HEARTBEAT_CYCLE>,
}

impl Default for GroundLinkConfig {
    fn default() -> Self {
        let mut heartbeat_cycle = Vec::new();
        let _ = heartbeat_cycle.extend_from_slice(&[
            HeartbeatKind::Battery,
            HeartbeatKind::Sun,
            HeartbeatKind::Imu,
        ]);
        Self {
            send_mod: DEFAULT_SEND_MOD,
            timeout_ms: DEFAULT_GROUND_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            burst_gap_ms: DEFAULT_BURST_GAP_MS,
            max_ota_repairs: DEFAULT_MAX_OTA_REPAIRS,
            heartbeat_cycle,
        }
    }
}

/// Errors returned by the ground session.
///
/// `E` is the radio error; it is [`Infallible`] for the steps that never touch
/// the radio.
#[derive(Debug, Error)]
pub enum SessionError<E = Infallible> {
    /// The radio failed.
    #[error("radio error: {0:?}")]
    Radio(E),
    /// The file store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A message could not be built.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl SessionError {
    fn widen<E>(self) -> SessionError<E> {
        match self {
            SessionError::Radio(never) => match never {},
            SessionError::Store(e) => SessionError::Store(e),
            SessionError::Frame(e) => SessionError::Frame(e),
        }
    }
}

type OtaData = Vec<u8, OTA_MAX_CHUNK_LEN>;

/// What happened to an OTA chunk fed to [`OtaBuffer::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum OtaProgress {
    /// Stored; more chunks follow.
    Accepted,
    /// Stored, and it was the last one.
    Complete,
    /// Not stored.
    Rejected,
}

/// Reassembly buffer for an OTA upload of up to `N` chunks.
///
/// The next expected sequence is always the number of buffered chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OtaBuffer<const N: usize = OTA_MAX_CHUNKS> {
    chunks: Vec<OtaData, N>,
    last_success: bool,
    repairs: u16,
}

impl<const N: usize> OtaBuffer<N> {
    /// An empty buffer.
    pub const fn new() -> Self {
        Self {
            chunks: Vec::new(),
            last_success: false,
            repairs: 0,
        }
    }

    /// Sequence the ground should send next.
    pub fn next_seq(&self) -> u16 {
        self.chunks.len() as u16
    }

    /// Whether the last chunk was accepted.
    pub fn last_success(&self) -> bool {
        self.last_success
    }

    /// Consecutive repairs since the last in-order chunk.
    pub fn repairs(&self) -> u16 {
        self.repairs
    }

    /// Buffered chunks in sequence order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(|chunk| chunk.as_slice())
    }

    /// Drops every buffered chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.repairs = 0;
    }

    /// Feeds one chunk.
    ///
    /// A chunk at the next sequence is appended. A chunk behind it replaces
    /// everything from its sequence on (the ground is resending after a lost
    /// response). A chunk ahead of it leaves a gap and is rejected. More than
    /// `max_repairs` consecutive repairs, or a chunk past the capacity `N`,
    /// drop the whole upload.
    pub fn ingest(&mut self, chunk: &OtaChunk<'_>, max_repairs: u16) -> OtaProgress {
        let next = self.next_seq();
        if chunk.sequence > next {
            warn!("OTA chunk {} ahead of expected {}", chunk.sequence, next);
            self.last_success = false;
            return OtaProgress::Rejected;
        }

        if chunk.sequence < next {
            self.repairs = self.repairs.saturating_add(1);
            if self.repairs > max_repairs {
                warn!("OTA upload dropped after {} repairs", self.repairs);
                self.clear();
                self.last_success = false;
                return OtaProgress::Rejected;
            }
            debug!("OTA repair: rewinding from {} to {}", next, chunk.sequence);
            self.chunks.truncate(chunk.sequence as usize);
        } else {
            self.repairs = 0;
        }

        let Ok(data) = OtaData::from_slice(chunk.data) else {
            warn!("OTA chunk {} too long", chunk.sequence);
            self.last_success = false;
            return OtaProgress::Rejected;
        };
        if self.chunks.push(data).is_err() {
            error!("OTA upload exceeds {} chunks, dropped", N);
            self.clear();
            self.last_success = false;
            return OtaProgress::Rejected;
        }

        self.last_success = true;
        if chunk.packets_remaining == 0 {
            OtaProgress::Complete
        } else {
            OtaProgress::Accepted
        }
    }

    /// Writes the buffered chunks to a new upload in `store`.
    pub fn flush_into<S: UploadStore>(&self, store: &mut S) -> Result<(), StoreError> {
        let mut handle = store.open_upload_sink()?;
        for chunk in &self.chunks {
            if let Err(e) = store.write_chunk(&mut handle, chunk) {
                store.discard(handle);
                return Err(e);
            }
        }
        store.finalize(handle)
    }
}

/// State of the ground link, owned by the comms task.
///
/// `OTA` is the largest OTA upload, in chunks, the session can reassemble.
#[derive(Debug, Clone)]
pub struct GroundSessionState<const OTA: usize = OTA_MAX_CHUNKS> {
    config: GroundLinkConfig,
    /// A heartbeat went out since the last loss of contact.
    pub heartbeat_sent: bool,
    /// The last ground message asked for an answer.
    pub last_ground_ack: bool,
    /// Id the ground reported as last received.
    pub last_ground_rx_message_id: u8,
    /// What the ground asked for in its last acknowledgement.
    pub last_ground_requested_message_id: Option<MessageId>,
    /// Sequence the ground asked for (first chunk of the next burst).
    pub last_ground_requested_seq: u16,
    /// Ack bit of the last transmitted message.
    pub pending_sat_ack_flag: bool,
    /// Position in the heartbeat cycle.
    pub heartbeat_cursor: usize,
    /// CRC errors (and malformed frames) since the last transmission.
    pub crc_error_count: u32,
    burst_offset: u16,
    burst_pending: bool,
    ota: OtaBuffer<OTA>,
    images: Vec<ImagePath, MAX_STAGED_IMAGES>,
    image_index: usize,
    descriptor: ImageDescriptor,
}

impl GroundSessionState {
    /// A fresh session with nothing staged and the default OTA capacity.
    pub fn new(config: GroundLinkConfig) -> Self {
        Self::with_ota_capacity(config)
    }
}

impl<const OTA: usize> GroundSessionState<OTA> {
    /// A fresh session with nothing staged, reassembling up to `OTA` chunks.
    pub fn with_ota_capacity(config: GroundLinkConfig) -> Self {
        Self {
            config,
            heartbeat_sent: false,
            last_ground_ack: false,
            last_ground_rx_message_id: 0,
            last_ground_requested_message_id: None,
            last_ground_requested_seq: 0,
            pending_sat_ack_flag: false,
            heartbeat_cursor: 0,
            crc_error_count: 0,
            burst_offset: 0,
            burst_pending: false,
            ota: OtaBuffer::new(),
            images: Vec::new(),
            image_index: 0,
            descriptor: ImageDescriptor::NONE,
        }
    }

    /// Session settings.
    pub fn config(&self) -> &GroundLinkConfig {
        &self.config
    }

    /// Descriptor of the active image.
    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    /// Path of the active image, if any.
    pub fn active_image(&self) -> Option<&str> {
        self.images.get(self.image_index).map(|path| path.as_str())
    }

    /// OTA reassembly buffer.
    pub fn ota(&self) -> &OtaBuffer<OTA> {
        &self.ota
    }

    /// Chunks already sent in the current burst.
    pub fn burst_offset(&self) -> u16 {
        self.burst_offset
    }

    /// `true` if the last message was a chunk in the middle of a burst.
    pub fn burst_pending(&self) -> bool {
        self.burst_pending
    }

    /// Replaces the staged images; the first one becomes active.
    ///
    /// # Errors
    /// - [`StoreError::Full`] for more than [`MAX_STAGED_IMAGES`] paths or an overlong path
    /// - whatever the store reports while sizing the first image
    pub fn stage_images<S: ImageStore>(
        &mut self,
        store: &mut S,
        paths: &[&str],
    ) -> Result<(), SessionError> {
        self.images.clear();
        for path in paths {
            let path = ImagePath::try_from(*path).map_err(|_| StoreError::Full)?;
            self.images.push(path).map_err(|_| StoreError::Full)?;
        }
        self.image_index = 0;
        self.refresh_descriptor(store)?;
        info!("{} images staged", self.images.len());
        Ok(())
    }

    fn refresh_descriptor<S: ImageStore>(&mut self, store: &mut S) -> Result<(), StoreError> {
        self.descriptor = ImageDescriptor::NONE;
        if let Some(path) = self.images.get(self.image_index) {
            self.descriptor = ImageDescriptor::staged(store.image_size(path)?);
        }
        Ok(())
    }

    fn advance_image<S: ImageStore>(&mut self, store: &mut S) -> Result<(), StoreError> {
        if self.image_index < self.images.len() {
            let done = self.images.remove(self.image_index);
            store.image_downlinked(&done);
            info!("image {} downlinked", done.as_str());
        }
        if self.image_index >= self.images.len() {
            self.image_index = 0;
        }
        self.refresh_descriptor(store)
    }

    fn reset_burst(&mut self) {
        self.burst_offset = 0;
        self.burst_pending = false;
    }

    /// Forgets the ground after a pass ended without an answer.
    pub fn end_contact(&mut self) {
        self.heartbeat_sent = false;
        self.last_ground_ack = false;
        self.last_ground_requested_message_id = None;
        self.reset_burst();
    }

    /// Returns to the initial protocol state. Staged images and settings are kept;
    /// a partial OTA upload is dropped.
    pub fn reset(&mut self) {
        self.end_contact();
        self.last_ground_rx_message_id = 0;
        self.last_ground_requested_seq = 0;
        self.pending_sat_ack_flag = false;
        self.crc_error_count = 0;
        self.ota = OtaBuffer::new();
    }

    /// Picks the next message to transmit.
    ///
    /// Clears the CRC error count. Check [`Self::burst_pending`] afterwards.
    pub fn transmit_step<S>(&mut self, store: &mut S) -> Result<GroundMessage, SessionError>
    where
        S: TelemetryStore + ImageStore,
    {
        self.burst_pending = false;
        let selected = self.select_message(store);
        self.crc_error_count = 0;
        if let Ok(message) = &selected {
            self.pending_sat_ack_flag = message.ack_requested;
            trace!(
                "tx {:?} seq {} ack {}",
                message.message_id, message.sequence_count, message.ack_requested
            );
        }
        selected
    }

    fn select_message<S>(&mut self, store: &mut S) -> Result<GroundMessage, SessionError>
    where
        S: TelemetryStore + ImageStore,
    {
        if !self.heartbeat_sent || self.crc_error_count > 0 {
            return self.next_heartbeat(store);
        }
        match self.last_ground_requested_message_id {
            Some(MessageId::ImageInfo) => Ok(message::image_info(&self.descriptor, true)),
            Some(MessageId::ImageDelete) => Ok(message::image_deleted(true)),
            Some(MessageId::ImageChunk) => match self.next_image_chunk(store)? {
                Some(chunk) => Ok(chunk),
                None => Ok(self.sat_ack()),
            },
            Some(MessageId::OtaResponse) => Ok(message::ota_response(
                self.ota.last_success(),
                self.ota.next_seq(),
                true,
            )),
            _ => Ok(self.sat_ack()),
        }
    }

    fn next_heartbeat<S: TelemetryStore>(
        &mut self,
        store: &mut S,
    ) -> Result<GroundMessage, SessionError> {
        let cycle = &self.config.heartbeat_cycle;
        let kind = match cycle.get(self.heartbeat_cursor % cycle.len().max(1)) {
            Some(kind) => *kind,
            None => HeartbeatKind::Battery,
        };
        self.heartbeat_cursor = (self.heartbeat_cursor + 1) % cycle.len().max(1);
        self.heartbeat_sent = true;

        let status = store.system_status();
        let reading = store.latest_reading(kind.topic());
        Ok(message::heartbeat(kind, status, reading)?)
    }

    fn next_image_chunk<S: ImageStore>(
        &mut self,
        store: &mut S,
    ) -> Result<Option<GroundMessage>, SessionError> {
        let index = self.last_ground_requested_seq.saturating_add(self.burst_offset);
        let span = self.descriptor.chunk_span(index);
        let (Some(path), Some((offset, len))) = (self.images.get(self.image_index), span) else {
            warn!(
                "chunk {} requested, image has {}",
                index, self.descriptor.chunk_count
            );
            self.reset_burst();
            return Ok(None);
        };

        let mut buf = [0u8; IMAGE_CHUNK_SIZE];
        let mut filled = 0;
        while filled < len {
            match store.read_image(path, offset + filled as u32, &mut buf[filled..len])? {
                0 => {
                    error!("image {} ended inside chunk {}", path.as_str(), index);
                    return Err(StoreError::Io.into());
                }
                n => filled += n,
            }
        }

        let last_of_burst = (self.burst_offset + 1) % self.config.send_mod.max(1) == 0
            || u32::from(index) + 1 >= u32::from(self.descriptor.chunk_count).saturating_sub(2);
        if last_of_burst {
            self.reset_burst();
        } else {
            self.burst_offset += 1;
            self.burst_pending = true;
        }

        Ok(Some(message::image_chunk(
            index,
            &buf[..len],
            last_of_burst,
        )?))
    }

    fn sat_ack(&self) -> GroundMessage {
        AckPayload {
            rx_message_id: self.last_ground_rx_message_id,
            requested: self
                .last_ground_requested_message_id
                .unwrap_or(MessageId::Unknown(0)),
            requested_seq: self.last_ground_requested_seq,
        }
        .into_message(MessageId::SatAck, true)
    }

    /// Listens for ground frames for up to `timeout_ms` each, until one asks for an answer.
    ///
    /// # Returns
    /// - `Ok(false)` if the ground stayed silent; the pass is over
    /// - `Ok(heartbeat_sent)` once a frame requesting an answer was handled
    pub fn receive_step<R, D, S>(
        &mut self,
        radio: &mut R,
        delay: &mut D,
        store: &mut S,
        timeout_ms: u32,
    ) -> Result<bool, SessionError<R::Error>>
    where
        R: Radio,
        D: DelayNs,
        S: ImageStore + UploadStore,
    {
        let budget = TickBudget::from_ms(timeout_ms, self.config.poll_interval_ms);
        let mut buf = [0u8; GROUND_MAX_FRAME_LEN];
        loop {
            let received = poll_with_budget(&mut *delay, budget, || radio.receive(&mut buf))
                .map_err(SessionError::Radio)?;
            let Some(RxFrame { len, crc_error }) = received else {
                debug!("ground silent for {} ms", timeout_ms);
                self.end_contact();
                return Ok(false);
            };
            self.handle_frame(&buf[..len.min(buf.len())], crc_error, store)
                .map_err(SessionError::widen)?;
            if self.last_ground_ack {
                return Ok(self.heartbeat_sent);
            }
        }
    }

    /// Handles one raw frame from the radio.
    ///
    /// Frames that fail to parse are counted like CRC errors and dropped, so the
    /// next transmission is a heartbeat.
    pub fn handle_frame<S>(
        &mut self,
        bytes: &[u8],
        crc_error: bool,
        store: &mut S,
    ) -> Result<(), SessionError>
    where
        S: ImageStore + UploadStore,
    {
        if crc_error {
            self.crc_error_count += 1;
        }
        let handled = GroundMessage::parse(bytes)
            .map_err(SessionError::from)
            .and_then(|message| self.handle_message(&message, store));
        match handled {
            Err(SessionError::Frame(e)) => {
                warn!("dropping malformed ground frame: {}", e);
                self.crc_error_count += 1;
                self.last_ground_ack = true;
                Ok(())
            }
            other => other,
        }
    }

    /// Applies one parsed ground message to the session.
    pub fn handle_message<S>(
        &mut self,
        message: &GroundMessage,
        store: &mut S,
    ) -> Result<(), SessionError>
    where
        S: ImageStore + UploadStore,
    {
        match message.message_id {
            MessageId::GroundAck => {
                let ack = AckPayload::parse(&message.payload)?;
                let repeated = self.last_ground_requested_message_id == Some(ack.requested);
                self.last_ground_rx_message_id = ack.rx_message_id;
                self.last_ground_requested_message_id = Some(ack.requested);
                self.last_ground_requested_seq = ack.requested_seq;
                self.reset_burst();
                match ack.requested {
                    // A resent delete refers to the image already removed.
                    MessageId::ImageDelete if repeated => {
                        debug!("image delete repeated, already advanced");
                    }
                    MessageId::ImageDelete => self.advance_image(store)?,
                    MessageId::OtaStop => {
                        info!("ground stopped the pass");
                        self.reset();
                    }
                    _ => {}
                }
            }
            MessageId::OtaRequest => self.ingest_ota(message, store)?,
            other => debug!("ignoring ground message {:?}", other),
        }
        self.last_ground_ack = message.ack_requested;
        Ok(())
    }

    fn ingest_ota<S: UploadStore>(
        &mut self,
        message: &GroundMessage,
        store: &mut S,
    ) -> Result<(), SessionError> {
        let chunk = OtaChunk::parse(message)?;
        self.last_ground_requested_message_id = Some(MessageId::OtaResponse);
        if self.ota.ingest(&chunk, self.config.max_ota_repairs) == OtaProgress::Complete {
            let flushed = self.ota.flush_into(store);
            self.ota.clear();
            match flushed {
                Ok(()) => info!("OTA upload complete"),
                Err(e) => {
                    error!("OTA upload could not be stored: {}", e);
                    self.ota.last_success = false;
                }
            }
        }
        Ok(())
    }
}

/// A ground-link session bound to its radio and delay provider.
#[derive(Debug)]
pub struct GroundSession<R, D, const OTA: usize = OTA_MAX_CHUNKS> {
    radio: R,
    delay: D,
    state: GroundSessionState<OTA>,
}

impl<R: Radio, D: DelayNs> GroundSession<R, D> {
    /// Creates a session in its initial state with the default OTA capacity.
    pub fn new(radio: R, delay: D, config: GroundLinkConfig) -> Self {
        Self::with_ota_capacity(radio, delay, config)
    }
}

impl<R: Radio, D: DelayNs, const OTA: usize> GroundSession<R, D, OTA> {
    /// Creates a session reassembling OTA uploads of up to `OTA` chunks.
    pub fn with_ota_capacity(radio: R, delay: D, config: GroundLinkConfig) -> Self {
        Self {
            radio,
            delay,
            state: GroundSessionState::with_ota_capacity(config),
        }
    }

    /// Session state.
    pub fn state(&self) -> &GroundSessionState<OTA> {
        &self.state
    }

    /// Mutable session state.
    pub fn state_mut(&mut self) -> &mut GroundSessionState<OTA> {
        &mut self.state
    }

    /// Gives back the radio and delay provider.
    pub fn release(self) -> (R, D) {
        (self.radio, self.delay)
    }

    /// See [`GroundSessionState::stage_images`].
    pub fn stage_images<S: ImageStore>(
        &mut self,
        store: &mut S,
        paths: &[&str],
    ) -> Result<(), SessionError<R::Error>> {
        self.state
            .stage_images(store, paths)
            .map_err(SessionError::widen)
    }

    /// Transmits one message, or a whole image burst.
    ///
    /// Returns the id of the last message sent.
    pub fn transmit<S>(&mut self, store: &mut S) -> Result<MessageId, SessionError<R::Error>>
    where
        S: TelemetryStore + ImageStore,
    {
        loop {
            self.delay.delay_ms(self.state.config.burst_gap_ms);
            let message = self
                .state
                .transmit_step(store)
                .map_err(SessionError::widen)?;
            self.radio
                .send(&message.to_frame())
                .map_err(SessionError::Radio)?;
            if !self.state.burst_pending() {
                return Ok(message.message_id);
            }
        }
    }

    /// One transmit burst followed by one receive step.
    ///
    /// Returns `false` once the ground has gone silent.
    pub fn exchange<S>(&mut self, store: &mut S) -> Result<bool, SessionError<R::Error>>
    where
        S: TelemetryStore + ImageStore + UploadStore,
    {
        self.transmit(store)?;
        let timeout_ms = self.state.config.timeout_ms;
        self.state
            .receive_step(&mut self.radio, &mut self.delay, store, timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::REQ_ACK_FLAG;
    use crate::telemetry::{BatteryReading, Reading, Topic};
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use std::collections::VecDeque;
    use std::string::{String, ToString};

    #[derive(Default)]
    struct FakeStore {
        images: std::vec::Vec<(&'static str, std::vec::Vec<u8>)>,
        downlinked: std::vec::Vec<String>,
        uploads: std::vec::Vec<std::vec::Vec<u8>>,
        battery: Option<Reading>,
        max_read: Option<usize>,
    }

    impl FakeStore {
        fn with_images(images: &[(&'static str, usize)]) -> Self {
            Self {
                images: images
                    .iter()
                    .map(|&(path, size)| (path, (0..size).map(|i| i as u8).collect()))
                    .collect(),
                ..Default::default()
            }
        }

        fn image(&self, path: &str) -> Result<&[u8], StoreError> {
            self.images
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, data)| data.as_slice())
                .ok_or(StoreError::NotFound)
        }
    }

    impl TelemetryStore for FakeStore {
        fn latest_reading(&mut self, topic: Topic) -> Option<Reading> {
            match topic {
                Topic::Monitor => self.battery,
                _ => None,
            }
        }

        fn system_status(&mut self) -> u16 {
            0x0102
        }
    }

    impl ImageStore for FakeStore {
        fn image_size(&mut self, path: &str) -> Result<u32, StoreError> {
            Ok(self.image(path)?.len() as u32)
        }

        fn read_image(&mut self, path: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StoreError> {
            let data = &self.image(path)?[offset as usize..];
            let n = data.len().min(buf.len()).min(self.max_read.unwrap_or(usize::MAX));
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        fn image_downlinked(&mut self, path: &str) {
            self.downlinked.push(path.to_string());
        }
    }

    impl UploadStore for FakeStore {
        type Handle = std::vec::Vec<u8>;

        fn open_upload_sink(&mut self) -> Result<Self::Handle, StoreError> {
            Ok(std::vec::Vec::new())
        }

        fn write_chunk(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> Result<(), StoreError> {
            handle.extend_from_slice(bytes);
            Ok(())
        }

        fn finalize(&mut self, handle: Self::Handle) -> Result<(), StoreError> {
            self.uploads.push(handle);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRadio {
        incoming: VecDeque<(std::vec::Vec<u8>, bool)>,
        sent: std::vec::Vec<std::vec::Vec<u8>>,
    }

    impl FakeRadio {
        fn queue(&mut self, message: &GroundMessage) {
            self.incoming.push_back((message.to_frame().to_vec(), false));
        }
    }

    impl Radio for FakeRadio {
        type Error = ();

        fn send(&mut self, frame: &[u8]) -> Result<(), ()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> nb::Result<RxFrame, ()> {
            let (frame, crc_error) = self.incoming.pop_front().ok_or(nb::Error::WouldBlock)?;
            buf[..frame.len()].copy_from_slice(&frame);
            Ok(RxFrame {
                len: frame.len(),
                crc_error,
            })
        }
    }

    fn ground_ack(requested: MessageId, requested_seq: u16) -> GroundMessage {
        AckPayload {
            rx_message_id: 0,
            requested,
            requested_seq,
        }
        .into_message(MessageId::GroundAck, true)
    }

    fn ota_request(sequence: u16, packets_remaining: u16, data: &[u8], ack: bool) -> GroundMessage {
        let mut message = OtaChunk {
            sequence,
            packets_remaining,
            data,
        }
        .to_message()
        .unwrap();
        message.ack_requested = ack;
        message
    }

    /// A session that has already greeted the ground.
    fn contacted(store: &mut FakeStore) -> GroundSessionState {
        let mut state = GroundSessionState::new(GroundLinkConfig::default());
        let first = state.transmit_step(store).unwrap();
        assert!(matches!(first.message_id, MessageId::Heartbeat(_)));
        state
    }

    #[test]
    fn test_heartbeats_cycle_while_ground_is_silent() {
        let mut store = FakeStore {
            battery: Some(Reading::Battery(BatteryReading {
                soc: 77,
                ..Default::default()
            })),
            ..Default::default()
        };
        let mut state = GroundSessionState::new(GroundLinkConfig::default());
        let mut sent = std::vec::Vec::new();
        for _ in 0..4 {
            let message = state.transmit_step(&mut store).unwrap();
            assert!(message.ack_requested);
            assert!(state.heartbeat_sent);
            sent.push(message);
            state.end_contact();
        }
        assert_eq!(&sent[0].payload[..3], &[0x01, 0x02, 77]);
        assert_eq!(
            sent.iter().map(|m| m.message_id).collect::<std::vec::Vec<_>>(),
            [
                MessageId::Heartbeat(HeartbeatKind::Battery),
                MessageId::Heartbeat(HeartbeatKind::Sun),
                MessageId::Heartbeat(HeartbeatKind::Imu),
                MessageId::Heartbeat(HeartbeatKind::Battery),
            ]
        );
    }

    #[test]
    fn test_sat_ack_once_heartbeat_is_out() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        let ack = state.transmit_step(&mut store).unwrap();
        assert_eq!(ack.message_id, MessageId::SatAck);
        assert!(state.pending_sat_ack_flag);
    }

    #[test]
    fn test_crc_error_preempts_request() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        state
            .handle_frame(&ground_ack(MessageId::ImageInfo, 0).to_frame(), true, &mut store)
            .unwrap();
        assert_eq!(state.crc_error_count, 1);

        let message = state.transmit_step(&mut store).unwrap();
        assert_eq!(message.message_id, MessageId::Heartbeat(HeartbeatKind::Sun));
        assert_eq!(state.crc_error_count, 0);
        let message = state.transmit_step(&mut store).unwrap();
        assert_eq!(message.message_id, MessageId::ImageInfo);
    }

    #[test]
    fn test_malformed_frame_is_counted_and_dropped() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        state.handle_frame(&[0x88, 0], false, &mut store).unwrap();
        state
            .handle_frame(&[0x88, 0, 0, 2, 1, 2], false, &mut store)
            .unwrap();
        assert_eq!(state.crc_error_count, 2);
        assert_eq!(state.last_ground_requested_message_id, None);
    }

    #[test]
    fn test_image_info_with_nothing_staged() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        state.handle_message(&ground_ack(MessageId::ImageInfo, 0), &mut store).unwrap();
        let info = state.transmit_step(&mut store).unwrap();
        assert_eq!(
            info.to_frame().as_slice(),
            &[REQ_ACK_FLAG | 0x21, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_three_chunk_image_needs_ack_per_chunk() {
        let mut store = FakeStore::with_images(&[("/sd/img0.jpg", 500)]);
        let mut state = contacted(&mut store);
        state.stage_images(&mut store, &["/sd/img0.jpg"]).unwrap();
        assert_eq!(state.descriptor(), &ImageDescriptor::staged(500));

        let mut received = std::vec::Vec::new();
        for seq in 0..3u16 {
            state.handle_message(&ground_ack(MessageId::ImageChunk, seq), &mut store).unwrap();
            let chunk = state.transmit_step(&mut store).unwrap();
            assert_eq!(chunk.message_id, MessageId::ImageChunk);
            assert_eq!(chunk.sequence_count, seq);
            assert!(chunk.ack_requested, "chunk {} must end its burst", seq);
            assert!(!state.burst_pending());
            received.extend_from_slice(&chunk.payload);
        }
        assert_eq!(received, store.image("/sd/img0.jpg").unwrap());
    }

    #[test]
    fn test_burst_boundaries_for_25_chunks() {
        let mut store = FakeStore::with_images(&[("/sd/big.jpg", 25 * IMAGE_CHUNK_SIZE)]);
        let mut state = contacted(&mut store);
        state.stage_images(&mut store, &["/sd/big.jpg"]).unwrap();

        let mut ends = std::vec::Vec::new();
        let mut next = 0u16;
        while next < 25 {
            state.handle_message(&ground_ack(MessageId::ImageChunk, next), &mut store).unwrap();
            let mut in_burst = 0;
            loop {
                let chunk = state.transmit_step(&mut store).unwrap();
                in_burst += 1;
                assert!(in_burst <= 10);
                assert_eq!(chunk.sequence_count, next + in_burst - 1);
                if chunk.ack_requested {
                    ends.push(chunk.sequence_count);
                    next = chunk.sequence_count + 1;
                    break;
                }
                assert!(state.burst_pending());
            }
        }
        assert_eq!(ends, [9u16, 19, 22, 23, 24]);
    }

    #[test]
    fn test_chunk_past_end_gets_sat_ack() {
        let mut store = FakeStore::with_images(&[("/sd/img0.jpg", 500)]);
        let mut state = contacted(&mut store);
        state.stage_images(&mut store, &["/sd/img0.jpg"]).unwrap();
        state.handle_message(&ground_ack(MessageId::ImageChunk, 3), &mut store).unwrap();
        let message = state.transmit_step(&mut store).unwrap();
        assert_eq!(message.message_id, MessageId::SatAck);
        assert_eq!(
            AckPayload::parse(&message.payload).unwrap().requested,
            MessageId::ImageChunk
        );
    }

    #[test]
    fn test_image_delete_moves_to_next_image() {
        let mut store = FakeStore::with_images(&[("/sd/a.jpg", 196), ("/sd/b.jpg", 400)]);
        let mut state = contacted(&mut store);
        state.stage_images(&mut store, &["/sd/a.jpg", "/sd/b.jpg"]).unwrap();

        state.handle_message(&ground_ack(MessageId::ImageDelete, 0), &mut store).unwrap();
        assert_eq!(store.downlinked, ["/sd/a.jpg"]);
        assert_eq!(state.active_image(), Some("/sd/b.jpg"));
        let deleted = state.transmit_step(&mut store).unwrap();
        assert_eq!(deleted.message_id, MessageId::ImageDelete);
        assert_eq!(deleted.payload.as_slice(), &[1]);

        state.handle_message(&ground_ack(MessageId::ImageInfo, 0), &mut store).unwrap();
        let info = state.transmit_step(&mut store).unwrap();
        assert_eq!(ImageDescriptor::parse(&info.payload).unwrap(), ImageDescriptor::staged(400));

        state.handle_message(&ground_ack(MessageId::ImageDelete, 0), &mut store).unwrap();
        assert_eq!(state.active_image(), None);
        assert_eq!(state.descriptor(), &ImageDescriptor::NONE);
    }

    #[test]
    fn test_repeated_delete_keeps_next_image() {
        let mut store = FakeStore::with_images(&[("/sd/a.jpg", 196), ("/sd/b.jpg", 400)]);
        let mut state = contacted(&mut store);
        state.stage_images(&mut store, &["/sd/a.jpg", "/sd/b.jpg"]).unwrap();

        // the ground missed our confirmation and asks again
        let delete = ground_ack(MessageId::ImageDelete, 0).to_frame();
        state.handle_frame(&delete, false, &mut store).unwrap();
        assert_eq!(state.transmit_step(&mut store).unwrap().message_id, MessageId::ImageDelete);
        state.handle_frame(&delete, false, &mut store).unwrap();

        assert_eq!(store.downlinked, ["/sd/a.jpg"]);
        assert_eq!(state.active_image(), Some("/sd/b.jpg"));
        assert_eq!(state.descriptor(), &ImageDescriptor::staged(400));
        let deleted = state.transmit_step(&mut store).unwrap();
        assert_eq!(deleted.payload.as_slice(), &[1]);
    }

    #[test]
    fn test_short_reads_fill_the_chunk() {
        let mut store = FakeStore::with_images(&[("/sd/img0.jpg", 500)]);
        store.max_read = Some(50);
        let mut state = contacted(&mut store);
        state.stage_images(&mut store, &["/sd/img0.jpg"]).unwrap();

        state.handle_message(&ground_ack(MessageId::ImageChunk, 1), &mut store).unwrap();
        let chunk = state.transmit_step(&mut store).unwrap();
        assert_eq!(chunk.payload.len(), IMAGE_CHUNK_SIZE);
        assert_eq!(
            chunk.payload.as_slice(),
            &store.image("/sd/img0.jpg").unwrap()[IMAGE_CHUNK_SIZE..2 * IMAGE_CHUNK_SIZE]
        );
    }

    #[test]
    fn test_image_shrunk_on_disk_fails_the_chunk() {
        let mut store = FakeStore::with_images(&[("/sd/img0.jpg", 500)]);
        let mut state = contacted(&mut store);
        state.stage_images(&mut store, &["/sd/img0.jpg"]).unwrap();
        store.images[0].1.truncate(100);

        state.handle_message(&ground_ack(MessageId::ImageChunk, 0), &mut store).unwrap();
        assert!(matches!(
            state.transmit_step(&mut store),
            Err(SessionError::Store(StoreError::Io))
        ));
    }

    #[test]
    fn test_ota_buffer_full_drops_upload() {
        let mut buffer: OtaBuffer<4> = OtaBuffer::new();
        for seq in 0..4u16 {
            let chunk = OtaChunk {
                sequence: seq,
                packets_remaining: 10,
                data: &[seq as u8],
            };
            assert_eq!(buffer.ingest(&chunk, 16), OtaProgress::Accepted);
        }
        let overflow = OtaChunk {
            sequence: 4,
            packets_remaining: 9,
            data: &[4],
        };
        assert_eq!(buffer.ingest(&overflow, 16), OtaProgress::Rejected);
        assert!(!buffer.last_success());
        assert_eq!(buffer.next_seq(), 0);
    }

    #[test]
    fn test_ota_capacity_sized_for_large_upload() {
        let mut store = FakeStore::default();
        let mut state = GroundSessionState::<100>::with_ota_capacity(GroundLinkConfig::default());
        for seq in 0..100u16 {
            state
                .handle_message(&ota_request(seq, 99 - seq, &[seq as u8], true), &mut store)
                .unwrap();
            assert!(state.ota().last_success(), "chunk {}", seq);
        }
        assert_eq!(store.uploads, [(0..100u8).collect::<std::vec::Vec<_>>()]);
        assert_eq!(state.ota().next_seq(), 0);
    }

    #[test]
    fn test_ota_repair_matches_in_order_delivery() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        for seq in 0..5u16 {
            state
                .handle_message(&ota_request(seq, 10, &[seq as u8; 3], true), &mut store)
                .unwrap();
        }
        assert_eq!(state.ota().next_seq(), 5);

        state.handle_message(&ota_request(3, 10, &[3; 3], true), &mut store).unwrap();
        assert_eq!(state.ota().next_seq(), 4);
        assert_eq!(state.ota().repairs(), 1);
        state.handle_message(&ota_request(4, 10, &[4; 3], true), &mut store).unwrap();
        assert_eq!(state.ota().next_seq(), 5);

        let mut in_order: OtaBuffer = OtaBuffer::new();
        for seq in 0..5u16 {
            let data = [seq as u8; 3];
            let chunk = OtaChunk {
                sequence: seq,
                packets_remaining: 10,
                data: &data,
            };
            assert_eq!(in_order.ingest(&chunk, 16), OtaProgress::Accepted);
        }
        assert!(state.ota().chunks().eq(in_order.chunks()));

        let response = state.transmit_step(&mut store).unwrap();
        assert_eq!(response.payload.as_slice(), &[1, 0, 5]);

        state.handle_message(&ota_request(5, 0, &[5; 2], true), &mut store).unwrap();
        assert_eq!(
            store.uploads,
            [[0u8, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4, 5, 5].to_vec()]
        );
        assert_eq!(state.ota().next_seq(), 0);
        let response = state.transmit_step(&mut store).unwrap();
        assert_eq!(response.payload.as_slice(), &[1, 0, 0]);
    }

    #[test]
    fn test_ota_gap_and_repair_limit() {
        let mut store = FakeStore::default();
        let config = GroundLinkConfig {
            max_ota_repairs: 2,
            ..Default::default()
        };
        let mut state = GroundSessionState::new(config);
        state.handle_message(&ota_request(2, 5, &[2], true), &mut store).unwrap();
        assert!(!state.ota().last_success());
        assert_eq!(state.ota().next_seq(), 0);

        state.handle_message(&ota_request(0, 5, &[0], true), &mut store).unwrap();
        state.handle_message(&ota_request(0, 5, &[0], true), &mut store).unwrap();
        state.handle_message(&ota_request(0, 5, &[0], true), &mut store).unwrap();
        assert!(state.ota().last_success());
        assert_eq!(state.ota().next_seq(), 1);

        state.handle_message(&ota_request(0, 5, &[0], true), &mut store).unwrap();
        assert!(!state.ota().last_success());
        assert_eq!(state.ota().next_seq(), 0);
        assert!(store.uploads.is_empty());
    }

    #[test]
    fn test_stop_resets_session() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        state.handle_message(&ota_request(0, 5, &[0], true), &mut store).unwrap();
        state.handle_message(&ground_ack(MessageId::OtaStop, 0), &mut store).unwrap();
        assert!(!state.heartbeat_sent);
        assert_eq!(state.last_ground_requested_message_id, None);
        assert_eq!(state.ota().next_seq(), 0);
        assert!(state.last_ground_ack);
        let message = state.transmit_step(&mut store).unwrap();
        assert!(matches!(message.message_id, MessageId::Heartbeat(_)));
    }

    #[test]
    fn test_unknown_message_is_ignored() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        let unknown = GroundMessage::new(MessageId::Unknown(0x7e), true, 0, &[1, 2]).unwrap();
        state.handle_message(&unknown, &mut store).unwrap();
        assert_eq!(state.last_ground_requested_message_id, None);
        assert_eq!(
            state.transmit_step(&mut store).unwrap().message_id,
            MessageId::SatAck
        );
    }

    #[test]
    fn test_receive_timeout_ends_contact() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        state.handle_message(&ground_ack(MessageId::ImageInfo, 0), &mut store).unwrap();
        let mut radio = FakeRadio::default();
        let contact = state
            .receive_step(&mut radio, &mut NoopDelay::new(), &mut store, 100)
            .unwrap();
        assert!(!contact);
        assert!(!state.heartbeat_sent);
        assert_eq!(state.last_ground_requested_message_id, None);
    }

    #[test]
    fn test_receive_listens_until_ack_requested() {
        let mut store = FakeStore::default();
        let mut state = contacted(&mut store);
        let mut radio = FakeRadio::default();
        radio.queue(&ota_request(0, 3, &[0xaa], false));
        radio.queue(&ota_request(1, 2, &[0xbb], true));
        let contact = state
            .receive_step(&mut radio, &mut NoopDelay::new(), &mut store, 100)
            .unwrap();
        assert!(contact);
        assert_eq!(state.ota().next_seq(), 2);
        assert!(radio.incoming.is_empty());
    }

    #[test]
    fn test_exchange_runs_a_pass() {
        let mut store = FakeStore::with_images(&[("/sd/img0.jpg", 12 * IMAGE_CHUNK_SIZE)]);
        let mut radio = FakeRadio::default();
        radio.queue(&ground_ack(MessageId::ImageChunk, 0));
        let mut session = GroundSession::new(radio, NoopDelay::new(), GroundLinkConfig::default());
        session.stage_images(&mut store, &["/sd/img0.jpg"]).unwrap();

        assert!(session.exchange(&mut store).unwrap());
        assert!(!session.exchange(&mut store).unwrap());
        assert!(!session.state().heartbeat_sent);

        let (radio, _) = session.release();
        // heartbeat, then a 10-chunk burst the ground never answered
        assert_eq!(radio.sent.len(), 11);
        assert_eq!(radio.sent[0][0], REQ_ACK_FLAG);
        assert_eq!(radio.sent[1][0], 0x50);
        assert_eq!(radio.sent[10][0], REQ_ACK_FLAG | 0x50);
        assert_eq!(&radio.sent[10][1..3], &[0, 9]);
    }
}
