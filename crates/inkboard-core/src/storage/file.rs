//! JSON-file persistence.

use super::{Drawing, Persistence, StorageError, StorageResult, resolve_id};
use crate::BoxFuture;
use std::fs;
use std::path::{Path, PathBuf};

/// Stores each drawing as `{id}.json` in one directory.
pub struct FilePersistence {
    base_path: PathBuf,
}

impl FilePersistence {
    /// Use `base_path`, creating it if needed.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self { base_path })
    }

    /// `<data dir>/inkboard/drawings`, falling back to the home directory.
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;
        Self::new(base.join("inkboard").join("drawings"))
    }

    fn drawing_path(&self, id: &str) -> PathBuf {
        let safe_id: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.json", safe_id))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl Persistence for FilePersistence {
    fn load_drawing(&self, id: &str) -> BoxFuture<'_, StorageResult<Drawing>> {
        let path = self.drawing_path(id);
        let id = id.to_string();
        Box::pin(async move {
            if !path.exists() {
                return Err(StorageError::NotFound(id));
            }
            let json = fs::read_to_string(&path).map_err(|e| {
                StorageError::Io(format!("Failed to read {}: {}", path.display(), e))
            })?;
            Drawing::from_json(&json).map_err(|e| {
                StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            })
        })
    }

    fn save_drawing(&self, id: Option<&str>, drawing: &Drawing) -> BoxFuture<'_, StorageResult<String>> {
        let id = resolve_id(id);
        let path = self.drawing_path(&id);
        let json = drawing.to_json();
        Box::pin(async move {
            let json = json.map_err(|e| StorageError::Serialization(e.to_string()))?;
            fs::write(&path, json).map_err(|e| {
                StorageError::Io(format!("Failed to write {}: {}", path.display(), e))
            })?;
            log::debug!("Saved drawing {} to {}", id, path.display());
            Ok(id)
        })
    }

    fn delete_drawing(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.drawing_path(id);
        Box::pin(async move {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    StorageError::Io(format!("Failed to delete {}: {}", path.display(), e))
                })?;
            }
            Ok(())
        })
    }

    fn list_drawings(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let base = self.base_path.clone();
        Box::pin(async move {
            if !base.exists() {
                return Ok(vec![]);
            }
            let entries = fs::read_dir(&base)
                .map_err(|e| StorageError::Io(format!("Failed to read directory: {}", e)))?;
            Ok(entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
                .collect())
        })
    }

    fn drawing_exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let path = self.drawing_path(id);
        Box::pin(async move { Ok(path.exists()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strokes::{SerializableColor, Stroke, StrokeKind};
    use crate::test_util::block_on;
    use kurbo::Point;
    use tempfile::tempdir;

    fn drawing() -> Drawing {
        Drawing {
            title: "Floor plan".to_string(),
            strokes: vec![
                Stroke::new(StrokeKind::Rectangle { filled: false }, SerializableColor::black(), 2.0, 1.0)
                    .with_points(vec![Point::new(0.0, 0.0), Point::new(10.0, 5.0)]),
            ],
            ..Drawing::default()
        }
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let storage = FilePersistence::new(dir.path().to_path_buf()).unwrap();
        let original = drawing();
        block_on(storage.save_drawing(Some("plan"), &original)).unwrap();
        let loaded = block_on(storage.load_drawing("plan")).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_not_found() {
        let dir = tempdir().unwrap();
        let storage = FilePersistence::new(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            block_on(storage.load_drawing("nope")),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_file_is_a_serialization_error() {
        let dir = tempdir().unwrap();
        let storage = FilePersistence::new(dir.path().to_path_buf()).unwrap();
        fs::write(dir.path().join("bad.json"), "{ nope").unwrap();
        assert!(matches!(
            block_on(storage.load_drawing("bad")),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_list_and_delete() {
        let dir = tempdir().unwrap();
        let storage = FilePersistence::new(dir.path().to_path_buf()).unwrap();
        block_on(storage.save_drawing(Some("one"), &drawing())).unwrap();
        block_on(storage.save_drawing(Some("two"), &drawing())).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut list = block_on(storage.list_drawings()).unwrap();
        list.sort();
        assert_eq!(list, vec!["one".to_string(), "two".to_string()]);

        block_on(storage.delete_drawing("one")).unwrap();
        assert!(!block_on(storage.drawing_exists("one")).unwrap());
    }

    #[test]
    fn test_sanitizes_id() {
        let dir = tempdir().unwrap();
        let storage = FilePersistence::new(dir.path().to_path_buf()).unwrap();
        block_on(storage.save_drawing(Some("room/1:draft*"), &drawing())).unwrap();
        assert!(dir.path().join("room_1_draft_.json").exists());
        assert!(block_on(storage.load_drawing("room/1:draft*")).is_ok());
    }
}
