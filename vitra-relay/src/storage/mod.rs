//! Media store consumed by the relay: uploaded images and drawing trails.
//!
//! Each media command runs as its own task; the store call itself goes to
//! the blocking pool. Failures are reported to the originating client only.
//!
//! ```text
//! ┌─────────────┐  spawn_blocking  ┌──────────────────┐
//! │ Relay       │ ───────────────► │ dyn MediaStore   │
//! │ (handlers)  │                  ├──────────────────┤
//! └─────────────┘                  │ MemoryMediaStore │
//!                                  │ RocksMediaStore  │
//!                                  └──────────────────┘
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemoryMediaStore;
pub use rocks::{RocksMediaStore, StoreConfig};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored image. `data` is kept exactly as uploaded (typically base64).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub name: String,
    pub mime_type: String,
    pub data: String,
    pub is_current: bool,
}

impl ImageRecord {
    pub fn new(data: impl Into<String>, name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
            is_current: false,
        }
    }
}

/// One sample of a drawing trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailSample {
    pub time_component: Vec<f64>,
    pub current_point: Vec<f64>,
}

/// Trails are keyed by file name with all whitespace removed.
pub fn normalize_trail_name(file_name: &str) -> String {
    file_name.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Invalid trail name: {0:?}")]
    InvalidTrailName(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Document store for images and trails.
///
/// Implementations are synchronous; the relay calls them from the
/// blocking thread pool.
pub trait MediaStore: Send + Sync + 'static {
    fn insert_image(&self, image: ImageRecord) -> Result<ImageRecord, StoreError>;

    fn images(&self) -> Result<Vec<ImageRecord>, StoreError>;

    /// Remove an image. `Ok(None)` if there was no such image.
    fn delete_image(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError>;

    /// Make `id` the only current image.
    ///
    /// `Ok(None)` if there is no such image; no image is current afterwards.
    fn set_current_image(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError>;

    fn current_image(&self) -> Result<Option<ImageRecord>, StoreError>;

    /// Upsert the trail for `file_name` and push `sample` onto it.
    /// Returns the trail length after the push.
    fn append_trail(&self, file_name: &str, sample: TrailSample) -> Result<usize, StoreError>;

    fn trail(&self, file_name: &str) -> Result<Vec<TrailSample>, StoreError>;
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

pub(crate) fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}
