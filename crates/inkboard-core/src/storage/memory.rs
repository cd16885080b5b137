//! In-memory persistence.

use super::{Drawing, Persistence, StorageError, StorageResult, resolve_id};
use crate::BoxFuture;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory drawings for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryPersistence {
    drawings: RwLock<HashMap<String, Drawing>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("Lock error: {}", e))
}

impl Persistence for MemoryPersistence {
    fn load_drawing(&self, id: &str) -> BoxFuture<'_, StorageResult<Drawing>> {
        let id = id.to_string();
        Box::pin(async move {
            let drawings = self.drawings.read().map_err(lock_error)?;
            drawings
                .get(&id)
                .cloned()
                .ok_or(StorageError::NotFound(id))
        })
    }

    fn save_drawing(&self, id: Option<&str>, drawing: &Drawing) -> BoxFuture<'_, StorageResult<String>> {
        let id = resolve_id(id);
        let drawing = drawing.clone();
        Box::pin(async move {
            let mut drawings = self.drawings.write().map_err(lock_error)?;
            drawings.insert(id.clone(), drawing);
            Ok(id)
        })
    }

    fn delete_drawing(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut drawings = self.drawings.write().map_err(lock_error)?;
            drawings.remove(&id);
            Ok(())
        })
    }

    fn list_drawings(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let drawings = self.drawings.read().map_err(lock_error)?;
            Ok(drawings.keys().cloned().collect())
        })
    }

    fn drawing_exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let drawings = self.drawings.read().map_err(lock_error)?;
            Ok(drawings.contains_key(&id))
        })
    }
}
