//! Canvas state: images, selection, clipboard, strokes and change notification.

use std::sync::Arc;

use kurbo::{Affine, Point, Rect};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandStack};
use crate::error::{CanvasError, ErrorReporter, LogErrorReporter};
use crate::image::{CanvasImage, ImageId};
use crate::strokes::{SerializableColor, Stroke, StrokeId};

/// Whether a change came from this client or was applied from a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    ImageAdded(ImageId),
    ImageRemoved(ImageId),
    TransformChanged(ImageId),
    SelectionChanged,
    StrokeAdded(StrokeId),
    StrokeRemoved(StrokeId),
    Cleared,
    SettingsChanged,
}

/// One entry in the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasChange {
    pub origin: ChangeOrigin,
    pub kind: ChangeKind,
}

/// Handle returned by [`CanvasState::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Per-subscriber queues of pending changes.
#[derive(Debug, Default)]
struct ChangeLog {
    next_id: u64,
    queues: Vec<(SubscriberId, Vec<CanvasChange>)>,
}

impl ChangeLog {
    fn subscribe(&mut self) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.queues.push((id, Vec::new()));
        id
    }

    fn unsubscribe(&mut self, id: SubscriberId) {
        self.queues.retain(|(sub, _)| *sub != id);
    }

    fn push(&mut self, change: CanvasChange) {
        for (_, queue) in &mut self.queues {
            queue.push(change.clone());
        }
    }

    fn drain(&mut self, id: SubscriberId) -> Vec<CanvasChange> {
        self.queues
            .iter_mut()
            .find(|(sub, _)| *sub == id)
            .map(|(_, queue)| std::mem::take(queue))
            .unwrap_or_default()
    }
}

/// Shared canvas options, broadcast as `canvas-settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasSettings {
    pub background: SerializableColor,
    #[serde(default)]
    pub grid: bool,
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self {
            background: SerializableColor::white(),
            grid: false,
        }
    }
}

/// Single source of truth for what is on the canvas.
///
/// Images are kept in insertion order, which is also z-order (back to front).
/// The selection never refers to an image that is not on the canvas.
#[derive(Debug)]
pub struct CanvasState {
    images: Vec<CanvasImage>,
    selected: Vec<ImageId>,
    clipboard: Vec<CanvasImage>,
    strokes: Vec<Stroke>,
    settings: CanvasSettings,
    origin: ChangeOrigin,
    changes: ChangeLog,
    /// Bumped by every clear, local or remote.
    clear_epoch: u64,
}

impl Default for CanvasState {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasState {
    pub fn new() -> Self {
        Self {
            images: Vec::new(),
            selected: Vec::new(),
            clipboard: Vec::new(),
            strokes: Vec::new(),
            settings: CanvasSettings::default(),
            origin: ChangeOrigin::Local,
            changes: ChangeLog::default(),
            clear_epoch: 0,
        }
    }

    // --- Change notification ---

    /// Register a new listener. It sees every change made from now on.
    pub fn subscribe(&mut self) -> SubscriberId {
        self.changes.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.changes.unsubscribe(id);
    }

    /// Take the changes queued for `id` since its last drain.
    pub fn drain_changes(&mut self, id: SubscriberId) -> Vec<CanvasChange> {
        self.changes.drain(id)
    }

    /// Run `f` with every change it makes tagged as remote.
    pub fn apply_remote<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = self.origin;
        self.origin = ChangeOrigin::Remote;
        let result = f(self);
        self.origin = previous;
        result
    }

    fn notify(&mut self, kind: ChangeKind) {
        self.changes.push(CanvasChange {
            origin: self.origin,
            kind,
        });
    }

    // --- Images ---

    /// Images back to front.
    pub fn images(&self) -> &[CanvasImage] {
        &self.images
    }

    pub fn image(&self, id: &str) -> Option<&CanvasImage> {
        self.images.iter().find(|img| img.id() == id)
    }

    pub fn contains_image(&self, id: &str) -> bool {
        self.index_of(id).is_some()
    }

    /// Z-index of an image.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.images.iter().position(|img| img.id() == id)
    }

    /// Insert at `index` (clamped), or on top when `None`.
    pub fn insert_image(
        &mut self,
        image: CanvasImage,
        index: Option<usize>,
    ) -> Result<(), CanvasError> {
        if self.contains_image(image.id()) {
            return Err(CanvasError::DuplicateImage(image.id().clone()));
        }
        let id = image.id().clone();
        let index = index.unwrap_or(self.images.len()).min(self.images.len());
        self.images.insert(index, image);
        self.notify(ChangeKind::ImageAdded(id));
        Ok(())
    }

    /// Remove an image, dropping it from the selection too.
    pub fn remove_image(&mut self, id: &str) -> Result<(usize, CanvasImage), CanvasError> {
        let index = self
            .index_of(id)
            .ok_or_else(|| CanvasError::UnknownImage(id.to_string()))?;
        let image = self.images.remove(index);
        self.notify(ChangeKind::ImageRemoved(id.to_string()));
        if let Some(pos) = self.selected.iter().position(|s| s == id) {
            self.selected.remove(pos);
            self.notify(ChangeKind::SelectionChanged);
        }
        Ok((index, image))
    }

    pub fn set_transform(&mut self, id: &str, transform: Affine) -> Result<(), CanvasError> {
        let image = self
            .images
            .iter_mut()
            .find(|img| img.id() == id)
            .ok_or_else(|| CanvasError::UnknownImage(id.to_string()))?;
        if image.transform() == transform {
            return Ok(());
        }
        image.set_transform(transform)?;
        self.notify(ChangeKind::TransformChanged(id.to_string()));
        Ok(())
    }

    /// Record where an image's bitmap was uploaded. Not a visible change, so no notification.
    pub fn set_image_url(&mut self, id: &str, url: impl Into<String>) -> Result<(), CanvasError> {
        let image = self
            .images
            .iter_mut()
            .find(|img| img.id() == id)
            .ok_or_else(|| CanvasError::UnknownImage(id.to_string()))?;
        image.url = Some(url.into());
        Ok(())
    }

    /// Topmost image under `point`.
    pub fn image_at(&self, point: Point, tolerance: f64) -> Option<&CanvasImage> {
        self.images
            .iter()
            .rev()
            .find(|img| img.contains(point, tolerance))
    }

    /// Images whose bounds intersect `rect`, back to front.
    pub fn images_in_rect(&self, rect: Rect) -> Vec<ImageId> {
        self.images
            .iter()
            .filter(|img| rect.intersect(img.bounds()).area() > 0.0)
            .map(|img| img.id().clone())
            .collect()
    }

    /// Union of the bounds of the given images.
    pub fn bounds_of(&self, ids: &[ImageId]) -> Option<Rect> {
        ids.iter()
            .filter_map(|id| self.image(id))
            .map(|img| img.bounds())
            .reduce(|a, b| a.union(b))
    }

    // --- Selection ---

    pub fn selected_ids(&self) -> &[ImageId] {
        &self.selected
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.iter().any(|s| s == id)
    }

    /// Selected images in z-order.
    pub fn selected_images(&self) -> Vec<&CanvasImage> {
        self.images
            .iter()
            .filter(|img| self.is_selected(img.id()))
            .collect()
    }

    /// The selected image when exactly one is selected.
    pub fn single_selection(&self) -> Option<&CanvasImage> {
        match self.selected.as_slice() {
            [only] => self.image(only),
            _ => None,
        }
    }

    /// Replace the selection. Unknown ids are ignored.
    pub fn set_selection(&mut self, ids: impl IntoIterator<Item = ImageId>) {
        let mut next: Vec<ImageId> = Vec::new();
        for id in ids {
            if self.contains_image(&id) && !next.contains(&id) {
                next.push(id);
            }
        }
        if next != self.selected {
            self.selected = next;
            self.notify(ChangeKind::SelectionChanged);
        }
    }

    pub fn select(&mut self, id: &str) {
        self.set_selection([id.to_string()]);
    }

    pub fn add_to_selection(&mut self, id: &str) {
        if self.contains_image(id) && !self.is_selected(id) {
            self.selected.push(id.to_string());
            self.notify(ChangeKind::SelectionChanged);
        }
    }

    pub fn toggle_selection(&mut self, id: &str) {
        if let Some(pos) = self.selected.iter().position(|s| s == id) {
            self.selected.remove(pos);
            self.notify(ChangeKind::SelectionChanged);
        } else {
            self.add_to_selection(id);
        }
    }

    pub fn clear_selection(&mut self) {
        if !self.selected.is_empty() {
            self.selected.clear();
            self.notify(ChangeKind::SelectionChanged);
        }
    }

    pub fn select_all(&mut self) {
        let ids: Vec<ImageId> = self.images.iter().map(|img| img.id().clone()).collect();
        self.set_selection(ids);
    }

    // --- Clipboard ---

    pub fn clipboard(&self) -> &[CanvasImage] {
        &self.clipboard
    }

    /// Snapshot the current selection into the clipboard. Returns how many were copied.
    pub fn copy_selection(&mut self) -> usize {
        self.clipboard = self.selected_images().into_iter().cloned().collect();
        self.clipboard.len()
    }

    pub fn set_clipboard(&mut self, images: Vec<CanvasImage>) {
        self.clipboard = images;
    }

    // --- Strokes ---

    /// Committed strokes in drawing order.
    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    pub fn contains_stroke(&self, id: &str) -> bool {
        self.strokes.iter().any(|s| s.id == id)
    }

    /// Commit a stroke. Returns `false` if a stroke with the same id is already present.
    pub fn add_stroke(&mut self, stroke: Stroke) -> bool {
        if self.contains_stroke(&stroke.id) {
            return false;
        }
        let id = stroke.id.clone();
        self.strokes.push(stroke);
        self.notify(ChangeKind::StrokeAdded(id));
        true
    }

    pub fn remove_stroke(&mut self, id: &str) -> Option<Stroke> {
        let pos = self.strokes.iter().position(|s| s.id == id)?;
        let stroke = self.strokes.remove(pos);
        self.notify(ChangeKind::StrokeRemoved(stroke.id.clone()));
        Some(stroke)
    }

    /// Remove the most recent stroke drawn by `author`.
    pub fn undo_last_stroke(&mut self, author: &str) -> Option<Stroke> {
        let id = self
            .strokes
            .iter()
            .rev()
            .find(|s| s.author.as_deref() == Some(author))?
            .id
            .clone();
        self.remove_stroke(&id)
    }

    // --- Settings ---

    pub fn settings(&self) -> &CanvasSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: CanvasSettings) {
        if settings != self.settings {
            self.settings = settings;
            self.notify(ChangeKind::SettingsChanged);
        }
    }

    /// Remove every stroke and image. Selection goes with them; clipboard stays.
    pub fn clear(&mut self) {
        self.strokes.clear();
        self.images.clear();
        self.selected.clear();
        self.clear_epoch += 1;
        self.notify(ChangeKind::Cleared);
    }

    /// How many times the canvas has been cleared.
    pub fn clear_epoch(&self) -> u64 {
        self.clear_epoch
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.strokes.is_empty()
    }
}

/// Canvas state plus its undo/redo history.
pub struct Canvas {
    state: CanvasState,
    history: CommandStack,
    /// Clear epoch the history was recorded in.
    history_epoch: u64,
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new()
    }
}

impl Canvas {
    /// Canvas that reports command failures through the log.
    pub fn new() -> Self {
        Self::with_reporter(Arc::new(LogErrorReporter), crate::config::MAX_UNDO_HISTORY)
    }

    pub fn with_reporter(reporter: Arc<dyn ErrorReporter>, max_history: usize) -> Self {
        Self {
            state: CanvasState::new(),
            history: CommandStack::new(max_history, reporter),
            history_epoch: 0,
        }
    }

    pub fn state(&self) -> &CanvasState {
        &self.state
    }

    /// Direct access for non-undoable mutations (selection, clipboard, strokes).
    pub fn state_mut(&mut self) -> &mut CanvasState {
        &mut self.state
    }

    pub fn history(&self) -> &CommandStack {
        &self.history
    }

    fn history_is_current(&self) -> bool {
        self.history_epoch == self.state.clear_epoch()
    }

    /// Drop history recorded before the last clear. A clear made through
    /// [`CanvasState::apply_remote`] is noticed here on the next history operation.
    fn discard_stale_history(&mut self) {
        if !self.history_is_current() {
            log::info!("Canvas was cleared, dropping {} history entries", self.history.len());
            self.history.clear();
            self.history_epoch = self.state.clear_epoch();
        }
    }

    /// Execute and record a command.
    pub fn execute(&mut self, command: Command) -> Result<(), CanvasError> {
        self.discard_stale_history();
        self.history.execute(command, &mut self.state)
    }

    pub fn undo(&mut self) -> bool {
        self.discard_stale_history();
        self.history.undo(&mut self.state)
    }

    pub fn redo(&mut self) -> bool {
        self.discard_stale_history();
        self.history.redo(&mut self.state)
    }

    pub fn can_undo(&self) -> bool {
        self.history_is_current() && self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history_is_current() && self.history.can_redo()
    }

    /// Clear strokes and images. History is dropped since it refers to removed images.
    pub fn clear(&mut self) {
        self.state.clear();
        self.discard_stale_history();
    }
}
