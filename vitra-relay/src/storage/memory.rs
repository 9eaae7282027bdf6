//! In-process media store, used when no storage path is configured and in
//! tests.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{normalize_trail_name, ImageRecord, MediaStore, StoreError, TrailSample};

#[derive(Default)]
struct MemoryState {
    /// Insertion order is kept for listing.
    images: Vec<ImageRecord>,
    trails: HashMap<String, Vec<TrailSample>>,
}

#[derive(Default)]
pub struct MemoryMediaStore {
    state: Mutex<MemoryState>,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl MediaStore for MemoryMediaStore {
    fn insert_image(&self, mut image: ImageRecord) -> Result<ImageRecord, StoreError> {
        image.is_current = false;
        let mut state = self.lock()?;
        state.images.retain(|i| i.id != image.id);
        state.images.push(image.clone());
        Ok(image)
    }

    fn images(&self) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(self.lock()?.images.clone())
    }

    fn delete_image(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        let mut state = self.lock()?;
        let position = state.images.iter().position(|i| i.id == id);
        Ok(position.map(|p| state.images.remove(p)))
    }

    fn set_current_image(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        let mut state = self.lock()?;
        let mut current = None;
        for image in state.images.iter_mut() {
            image.is_current = image.id == id;
            if image.is_current {
                current = Some(image.clone());
            }
        }
        Ok(current)
    }

    fn current_image(&self) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.lock()?.images.iter().find(|i| i.is_current).cloned())
    }

    fn append_trail(&self, file_name: &str, sample: TrailSample) -> Result<usize, StoreError> {
        let key = normalize_trail_name(file_name);
        if key.is_empty() {
            return Err(StoreError::InvalidTrailName(file_name.to_string()));
        }
        let mut state = self.lock()?;
        let trail = state.trails.entry(key).or_default();
        trail.push(sample);
        Ok(trail.len())
    }

    fn trail(&self, file_name: &str) -> Result<Vec<TrailSample>, StoreError> {
        let key = normalize_trail_name(file_name);
        Ok(self.lock()?.trails.get(&key).cloned().unwrap_or_default())
    }
}
