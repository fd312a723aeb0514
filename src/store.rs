//! File-store collaborators.
//!
//! Images staged for downlink are read through [`ImageStore`]; files arriving
//! over either link (OTA uploads from the ground, images from the payload) are
//! written through [`UploadStore`]. During assembly the store is append-only;
//! [`UploadStore::finalize`] hands the finished file over, and
//! [`UploadStore::discard`] drops a partial one.

use heapless::{String, Vec};
use thiserror::Error;

use crate::consts::MAX_IMAGE_PATH_LEN;

/// Path of an image staged for downlink.
pub type ImagePath = String<MAX_IMAGE_PATH_LEN>;

/// Errors reported by store implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum StoreError {
    /// The file does not exist (or was removed meanwhile).
    #[error("file not found")]
    NotFound,
    /// The underlying storage failed.
    #[error("storage I/O error")]
    Io,
    /// No space left for the data.
    #[error("storage full")]
    Full,
}

/// Read access to images staged for downlink.
pub trait ImageStore {
    /// Size in bytes of the image at `path`.
    fn image_size(&mut self, path: &str) -> Result<u32, StoreError>;

    /// Reads up to `buf.len()` bytes at `offset`; returns the number of bytes read.
    fn read_image(&mut self, path: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Called once the ground confirms it has the image, before it is deleted.
    fn image_downlinked(&mut self, _path: &str) {}
}

/// Write access for files assembled from a link.
pub trait UploadStore {
    /// Handle identifying an open upload.
    type Handle;

    /// Opens a new, empty upload.
    fn open_upload_sink(&mut self) -> Result<Self::Handle, StoreError>;

    /// Appends `bytes` to the upload.
    fn write_chunk(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> Result<(), StoreError>;

    /// Completes the upload and transfers ownership of the file to the store.
    fn finalize(&mut self, handle: Self::Handle) -> Result<(), StoreError>;

    /// Drops a partial upload.
    fn discard(&mut self, _handle: Self::Handle) {}
}

/// In-memory [`UploadStore`] keeping the last completed upload.
///
/// Useful when the caller wants the received bytes themselves rather than a file,
/// e.g. for short payload-link command responses.
#[derive(Debug, Default)]
pub struct MessageBuffer<const N: usize> {
    pending: Vec<u8, N>,
    completed: Option<Vec<u8, N>>,
}

impl<const N: usize> MessageBuffer<N> {
    /// Creates an empty buffer.
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
            completed: None,
        }
    }

    /// Takes the last completed upload, if any.
    pub fn take(&mut self) -> Option<Vec<u8, N>> {
        self.completed.take()
    }
}

impl<const N: usize> UploadStore for MessageBuffer<N> {
    type Handle = ();

    fn open_upload_sink(&mut self) -> Result<(), StoreError> {
        self.pending.clear();
        Ok(())
    }

    fn write_chunk(&mut self, _handle: &mut (), bytes: &[u8]) -> Result<(), StoreError> {
        self.pending
            .extend_from_slice(bytes)
            .map_err(|_| StoreError::Full)
    }

    fn finalize(&mut self, _handle: ()) -> Result<(), StoreError> {
        self.completed = Some(core::mem::take(&mut self.pending));
        Ok(())
    }

    fn discard(&mut self, _handle: ()) {
        self.pending.clear();
    }
}
