//! Periodic saving of the open drawing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Drawing, Persistence, StorageResult};

/// Default auto-save interval in seconds.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Key for the "last opened" drawing.
pub const LAST_DRAWING_KEY: &str = "__last_drawing__";

/// Saves the open drawing when it is dirty and the interval has elapsed.
pub struct AutoSaveManager<P: Persistence> {
    storage: Arc<P>,
    interval: Duration,
    last_save: Option<Instant>,
    dirty: bool,
    /// Id of the drawing being edited. Assigned by the backend on first save.
    current_id: Option<String>,
}

impl<P: Persistence> AutoSaveManager<P> {
    pub fn new(storage: Arc<P>) -> Self {
        Self {
            storage,
            interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            last_save: None,
            dirty: false,
            current_id: None,
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_drawing_id(&mut self, id: Option<String>) {
        self.current_id = id;
    }

    pub fn drawing_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    pub fn should_save(&self) -> bool {
        self.should_save_at(Instant::now())
    }

    /// Dirty, and either never saved or saved at least one interval before `now`.
    pub fn should_save_at(&self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }
        match self.last_save {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    /// Save if [`should_save_at`](Self::should_save_at) says so. Returns whether it saved.
    pub async fn maybe_save(&mut self, drawing: &Drawing, now: Instant) -> StorageResult<bool> {
        if !self.should_save_at(now) {
            return Ok(false);
        }
        self.save_at(drawing, now).await?;
        Ok(true)
    }

    /// Save immediately.
    pub async fn save(&mut self, drawing: &Drawing) -> StorageResult<String> {
        self.save_at(drawing, Instant::now()).await
    }

    async fn save_at(&mut self, drawing: &Drawing, now: Instant) -> StorageResult<String> {
        let id = self
            .storage
            .save_drawing(self.current_id.as_deref(), drawing)
            .await?;
        // Also kept under a fixed key so the next launch can reopen it.
        self.storage
            .save_drawing(Some(LAST_DRAWING_KEY), drawing)
            .await?;

        log::debug!("Auto-saved drawing {}", id);
        self.current_id = Some(id.clone());
        self.last_save = Some(now);
        self.dirty = false;
        Ok(id)
    }

    pub async fn load(&mut self, id: &str) -> StorageResult<Drawing> {
        let drawing = self.storage.load_drawing(id).await?;
        self.current_id = Some(id.to_string());
        self.dirty = false;
        self.last_save = Some(Instant::now());
        Ok(drawing)
    }

    /// The drawing open at the end of the last run, if any.
    ///
    /// It is reopened as a new drawing; the next save assigns it an id.
    pub async fn load_last(&mut self) -> Option<Drawing> {
        match self.storage.load_drawing(LAST_DRAWING_KEY).await {
            Ok(drawing) => {
                self.current_id = None;
                self.dirty = false;
                self.last_save = Some(Instant::now());
                Some(drawing)
            }
            Err(e) => {
                log::debug!("No last drawing: {}", e);
                None
            }
        }
    }

    pub async fn delete(&self, id: &str) -> StorageResult<()> {
        self.storage.delete_drawing(id).await
    }

    /// Saved drawing ids, without the last-drawing slot.
    pub async fn list_drawings(&self) -> StorageResult<Vec<String>> {
        let mut ids = self.storage.list_drawings().await?;
        ids.retain(|id| id != LAST_DRAWING_KEY);
        Ok(ids)
    }

    pub fn storage(&self) -> &Arc<P> {
        &self.storage
    }
}
