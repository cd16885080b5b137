//! Undo/redo over canvas images.
//!
//! Every undoable edit is a [`Command`] holding enough data to reverse itself
//! exactly. [`CommandStack`] keeps a bounded linear history with a cursor:
//! entries after the cursor can be redone until a new command is executed.

use std::collections::BTreeMap;
use std::sync::Arc;

use kurbo::Affine;

use crate::canvas::CanvasState;
use crate::error::{CanvasError, ErrorReporter};
use crate::image::{CanvasImage, ImageId};
use crate::viewport::is_invertible;

/// What kind of gesture produced a transform command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Move,
    Resize,
    Rotate,
    Nudge,
    Align,
    Distribute,
    Flip,
}

impl TransformKind {
    fn verb(self) -> &'static str {
        match self {
            TransformKind::Move => "Move",
            TransformKind::Resize => "Resize",
            TransformKind::Rotate => "Rotate",
            TransformKind::Nudge => "Nudge",
            TransformKind::Align => "Align",
            TransformKind::Distribute => "Distribute",
            TransformKind::Flip => "Flip",
        }
    }
}

/// A reversible edit.
#[derive(Debug, Clone)]
pub enum Command {
    /// Put images on top of the canvas.
    AddImages { images: Vec<CanvasImage> },
    /// Take images off the canvas, remembering their z-index.
    RemoveImages { removed: Vec<(usize, CanvasImage)> },
    /// Replace transforms of one or more images.
    Transform {
        kind: TransformKind,
        before: BTreeMap<ImageId, Affine>,
        after: BTreeMap<ImageId, Affine>,
    },
}

impl Command {
    pub fn add_images(images: Vec<CanvasImage>) -> Self {
        Command::AddImages { images }
    }

    /// Capture the listed images (with their z-index) for removal.
    pub fn remove_images(state: &CanvasState, ids: &[ImageId]) -> Result<Self, CanvasError> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            let index = state
                .index_of(id)
                .ok_or_else(|| CanvasError::UnknownImage(id.clone()))?;
            if let Some(image) = state.image(id) {
                removed.push((index, image.clone()));
            }
        }
        if removed.is_empty() {
            return Err(CanvasError::Empty("no images to remove"));
        }
        removed.sort_by_key(|(index, _)| *index);
        Ok(Command::RemoveImages { removed })
    }

    /// Transform command from explicit maps. Ids present in only one map are ignored.
    pub fn transform(
        kind: TransformKind,
        before: BTreeMap<ImageId, Affine>,
        after: BTreeMap<ImageId, Affine>,
    ) -> Self {
        let before: BTreeMap<_, _> = before
            .into_iter()
            .filter(|(id, _)| after.contains_key(id))
            .collect();
        let after = after
            .into_iter()
            .filter(|(id, _)| before.contains_key(id))
            .collect();
        Command::Transform {
            kind,
            before,
            after,
        }
    }

    /// Compose `delta` onto the current transform of each listed image (`delta * current`).
    pub fn apply_delta(
        state: &CanvasState,
        kind: TransformKind,
        deltas: impl IntoIterator<Item = (ImageId, Affine)>,
    ) -> Result<Self, CanvasError> {
        let mut before = BTreeMap::new();
        let mut after = BTreeMap::new();
        for (id, delta) in deltas {
            let image = state
                .image(&id)
                .ok_or_else(|| CanvasError::UnknownImage(id.clone()))?;
            before.insert(id.clone(), image.transform());
            after.insert(id, delta * image.transform());
        }
        Ok(Command::Transform {
            kind,
            before,
            after,
        })
    }

    /// Whether executing would change nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            Command::AddImages { images } => images.is_empty(),
            Command::RemoveImages { removed } => removed.is_empty(),
            Command::Transform { before, after, .. } => before == after,
        }
    }

    /// Ids the command touches.
    pub fn image_ids(&self) -> Vec<ImageId> {
        match self {
            Command::AddImages { images } => images.iter().map(|i| i.id().clone()).collect(),
            Command::RemoveImages { removed } => {
                removed.iter().map(|(_, i)| i.id().clone()).collect()
            }
            Command::Transform { after, .. } => after.keys().cloned().collect(),
        }
    }

    /// Apply the command. Validates everything first so a failure leaves `state` untouched.
    pub fn execute(&self, state: &mut CanvasState) -> Result<(), CanvasError> {
        match self {
            Command::AddImages { images } => {
                for image in images {
                    if state.contains_image(image.id()) {
                        return Err(CanvasError::DuplicateImage(image.id().clone()));
                    }
                }
                for image in images {
                    state.insert_image(image.clone(), None)?;
                }
            }
            Command::RemoveImages { removed } => {
                for (_, image) in removed {
                    if !state.contains_image(image.id()) {
                        return Err(CanvasError::UnknownImage(image.id().clone()));
                    }
                }
                for (_, image) in removed {
                    state.remove_image(image.id())?;
                }
            }
            Command::Transform { after, .. } => {
                for (id, transform) in after {
                    if !state.contains_image(id) {
                        return Err(CanvasError::UnknownImage(id.clone()));
                    }
                    if !is_invertible(*transform) {
                        return Err(CanvasError::SingularTransform(id.clone()));
                    }
                }
                for (id, transform) in after {
                    state.set_transform(id, *transform)?;
                }
            }
        }
        Ok(())
    }

    /// Reverse the command. Images that disappeared in the meantime (for example
    /// deleted by a collaborator) are skipped.
    pub fn undo(&self, state: &mut CanvasState) {
        match self {
            Command::AddImages { images } => {
                for image in images.iter().rev() {
                    let _ = state.remove_image(image.id());
                }
            }
            Command::RemoveImages { removed } => {
                for (index, image) in removed {
                    if let Err(e) = state.insert_image(image.clone(), Some(*index)) {
                        log::debug!("Skipping restore: {}", e);
                    }
                }
            }
            Command::Transform { before, .. } => {
                for (id, transform) in before {
                    if let Err(e) = state.set_transform(id, *transform) {
                        log::debug!("Skipping transform undo: {}", e);
                    }
                }
            }
        }
    }

    /// Re-apply after an undo, with the same tolerance for vanished images as `undo`.
    pub fn redo(&self, state: &mut CanvasState) {
        match self {
            Command::AddImages { images } => {
                for image in images {
                    if let Err(e) = state.insert_image(image.clone(), None) {
                        log::debug!("Skipping re-add: {}", e);
                    }
                }
            }
            Command::RemoveImages { removed } => {
                for (_, image) in removed {
                    let _ = state.remove_image(image.id());
                }
            }
            Command::Transform { after, .. } => {
                for (id, transform) in after {
                    if let Err(e) = state.set_transform(id, *transform) {
                        log::debug!("Skipping transform redo: {}", e);
                    }
                }
            }
        }
    }

    /// Human-readable description for menus and logs.
    pub fn describe(&self) -> String {
        fn plural(n: usize) -> &'static str {
            if n == 1 { "image" } else { "images" }
        }
        match self {
            Command::AddImages { images } => format!("Add {} {}", images.len(), plural(images.len())),
            Command::RemoveImages { removed } => {
                format!("Remove {} {}", removed.len(), plural(removed.len()))
            }
            Command::Transform { kind, after, .. } => {
                format!("{} {} {}", kind.verb(), after.len(), plural(after.len()))
            }
        }
    }
}

/// Bounded linear history.
pub struct CommandStack {
    history: Vec<Command>,
    /// Number of commands currently applied; `history[..applied]` is visible state.
    applied: usize,
    max_history: usize,
    reporter: Arc<dyn ErrorReporter>,
}

impl CommandStack {
    pub fn new(max_history: usize, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            history: Vec::new(),
            applied: 0,
            max_history: max_history.max(1),
            reporter,
        }
    }

    /// Execute `command` and record it.
    ///
    /// On failure the error is reported and returned, and the history is left as it was.
    pub fn execute(&mut self, command: Command, state: &mut CanvasState) -> Result<(), CanvasError> {
        if let Err(e) = command.execute(state) {
            log::warn!("Command '{}' failed: {}", command.describe(), e);
            self.reporter.report(&e.clone().into());
            return Err(e);
        }
        log::debug!("Executed: {}", command.describe());

        self.history.truncate(self.applied);
        self.history.push(command);
        if self.history.len() > self.max_history {
            let overflow = self.history.len() - self.max_history;
            self.history.drain(..overflow);
        }
        self.applied = self.history.len();
        Ok(())
    }

    /// Undo the most recent applied command. Returns `false` if there is none.
    pub fn undo(&mut self, state: &mut CanvasState) -> bool {
        if self.applied == 0 {
            return false;
        }
        self.applied -= 1;
        let command = &self.history[self.applied];
        log::debug!("Undo: {}", command.describe());
        command.undo(state);
        true
    }

    /// Redo the next undone command. Returns `false` if there is none.
    pub fn redo(&mut self, state: &mut CanvasState) -> bool {
        let Some(command) = self.history.get(self.applied) else {
            return false;
        };
        log::debug!("Redo: {}", command.describe());
        command.redo(state);
        self.applied += 1;
        true
    }

    pub fn can_undo(&self) -> bool {
        self.applied > 0
    }

    pub fn can_redo(&self) -> bool {
        self.applied < self.history.len()
    }

    /// Index of the last applied command, `-1` when nothing is applied.
    pub fn history_index(&self) -> isize {
        self.applied as isize - 1
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Description of what undo would do.
    pub fn undo_description(&self) -> Option<String> {
        self.applied
            .checked_sub(1)
            .and_then(|i| self.history.get(i))
            .map(Command::describe)
    }

    pub fn redo_description(&self) -> Option<String> {
        self.history.get(self.applied).map(Command::describe)
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.applied = 0;
    }
}
