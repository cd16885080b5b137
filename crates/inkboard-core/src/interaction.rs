//! Pointer and keyboard interaction over the canvas.
//!
//! [`InteractionController`] turns raw pointer events (device pixels) into
//! selection changes, live transform updates and, on pointer-up, a single
//! undoable [`Command`] per gesture. All hit-testing and geometry happens in
//! logical canvas space.
//!
//! ```text
//!            ┌──────── handle ────────┐
//!  Idle ──down──► Resizing / Rotating  │
//!    │  └─ image ─► Dragging           ├──up──► Idle (+ Transform command)
//!    │  └─ empty ─► Selecting ─────────┘
//!    └─ draw tool ─► Drawing ──up──► Idle (+ committed stroke)
//! ```

use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_4, PI};

use kurbo::{Affine, Point, Rect, Vec2};

use crate::align::{self, Alignment, Distribution};
use crate::canvas::Canvas;
use crate::command::{Command, TransformKind};
use crate::config::CanvasConfig;
use crate::error::CanvasError;
use crate::handles::{HandleKind, hit_test_handles, resize_transform};
use crate::image::ImageId;
use crate::input::{Key, Modifiers, PointerEvent};
use crate::shortcuts::{ShortcutAction, ShortcutRegistry};
use crate::strokes::{Stroke, StrokeBuilder, StrokeTool};
use crate::viewport::{LogicalViewport, rotate_about, translate};

/// The active tool.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Tool {
    #[default]
    Select,
    Draw(StrokeTool),
}

/// Gesture state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum InteractionState {
    #[default]
    Idle,
    /// Moving the selection. `last` is the previous pointer position.
    Dragging { last: Point },
    Resizing { handle: HandleKind },
    /// Rotating the single selected image around its current center.
    Rotating {
        /// Pointer angle at the previous move.
        last_angle: f64,
        /// Unwrapped rotation since the start, before snapping.
        total: f64,
        /// Rotation already applied to the image.
        applied: f64,
    },
    /// Marquee selection.
    Selecting { additive: bool, base: Vec<ImageId> },
    Drawing,
}

impl InteractionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, InteractionState::Idle)
    }

    fn transform_kind(&self) -> Option<TransformKind> {
        match self {
            InteractionState::Dragging { .. } => Some(TransformKind::Move),
            InteractionState::Resizing { .. } => Some(TransformKind::Resize),
            InteractionState::Rotating { .. } => Some(TransformKind::Rotate),
            _ => None,
        }
    }
}

/// Data captured at pointer-down, alive until the gesture ends.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InteractionContext {
    pub start_position: Point,
    pub target_image: Option<ImageId>,
    pub selected_images: Vec<ImageId>,
    pub handle: Option<HandleKind>,
    pub initial_transforms: BTreeMap<ImageId, Affine>,
    pub selection_rect: Option<Rect>,
}

/// Wrap an angle into `(-PI, PI]`.
fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a <= -PI {
        a += 2.0 * PI;
    }
    a
}

fn pointer_angle(center: Point, point: Point) -> f64 {
    (point.y - center.y).atan2(point.x - center.x)
}

/// Converts pointer and keyboard input into canvas edits.
pub struct InteractionController {
    config: CanvasConfig,
    viewport: LogicalViewport,
    tool: Tool,
    user_id: String,
    state: InteractionState,
    context: Option<InteractionContext>,
    stroke: StrokeBuilder,
    /// Last known pointer position in logical space; `None` once the pointer leaves.
    last_pointer: Option<Point>,
}

impl InteractionController {
    pub fn new(config: CanvasConfig, user_id: impl Into<String>) -> Self {
        let viewport = LogicalViewport::new(
            kurbo::Size::new(config.logical_width, config.logical_height),
            kurbo::Size::new(config.logical_width, config.logical_height),
        );
        Self {
            config,
            viewport,
            tool: Tool::Select,
            user_id: user_id.into(),
            state: InteractionState::Idle,
            context: None,
            stroke: StrokeBuilder::new(),
            last_pointer: None,
        }
    }

    pub fn with_viewport(mut self, viewport: LogicalViewport) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn viewport(&self) -> &LogicalViewport {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut LogicalViewport {
        &mut self.viewport
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    /// Switch tools. Any gesture in progress is aborted.
    pub fn set_tool(&mut self, canvas: &mut Canvas, tool: Tool) {
        if !self.state.is_idle() {
            self.abort_gesture(canvas);
        }
        self.tool = tool;
    }

    pub fn state(&self) -> &InteractionState {
        &self.state
    }

    pub fn context(&self) -> Option<&InteractionContext> {
        self.context.as_ref()
    }

    /// Marquee rectangle while selecting.
    pub fn selection_rect(&self) -> Option<Rect> {
        self.context.as_ref().and_then(|c| c.selection_rect)
    }

    /// The stroke being drawn, for live preview.
    pub fn current_stroke(&self) -> Option<&Stroke> {
        self.stroke.current()
    }

    pub fn pointer_position(&self) -> Option<Point> {
        self.last_pointer
    }

    /// Dispatch a device-space pointer event.
    pub fn handle_pointer(
        &mut self,
        canvas: &mut Canvas,
        event: PointerEvent,
    ) -> Result<(), CanvasError> {
        match event {
            PointerEvent::Down {
                position,
                modifiers,
            } => {
                self.pointer_down(canvas, position, modifiers);
                Ok(())
            }
            PointerEvent::Move {
                position,
                modifiers,
            } => {
                self.pointer_move(canvas, position, modifiers);
                Ok(())
            }
            PointerEvent::Up { position, .. } => self.pointer_up(canvas, position),
        }
    }

    pub fn pointer_down(&mut self, canvas: &mut Canvas, device: Point, modifiers: Modifiers) {
        if !self.state.is_idle() {
            // Missed pointer-up: finish the previous gesture where it was.
            let last = self.last_pointer.unwrap_or_default();
            if let Err(e) = self.finish_gesture(canvas, last) {
                log::warn!("Could not commit interrupted gesture: {}", e);
            }
        }
        let point = self.viewport.device_to_logical(device);
        self.last_pointer = Some(point);

        if let Tool::Draw(tool) = &self.tool {
            self.stroke.begin(tool, point, &self.user_id);
            self.context = Some(InteractionContext {
                start_position: point,
                ..InteractionContext::default()
            });
            self.state = InteractionState::Drawing;
            return;
        }

        if self.try_begin_handle(canvas, point) {
            return;
        }

        let state = canvas.state_mut();
        let hit = state.image_at(point, 0.0).map(|img| img.id().clone());
        match hit {
            Some(id) => {
                if modifiers.command() {
                    state.toggle_selection(&id);
                    if !state.is_selected(&id) {
                        return;
                    }
                } else if modifiers.shift {
                    state.add_to_selection(&id);
                } else if !state.is_selected(&id) {
                    state.select(&id);
                }
                let selected = state.selected_ids().to_vec();
                let initial_transforms = selected
                    .iter()
                    .filter_map(|sid| state.image(sid).map(|img| (sid.clone(), img.transform())))
                    .collect();
                log::debug!("Drag start on {} with {} selected", id, selected.len());
                self.context = Some(InteractionContext {
                    start_position: point,
                    target_image: Some(id),
                    selected_images: selected,
                    handle: None,
                    initial_transforms,
                    selection_rect: None,
                });
                self.state = InteractionState::Dragging { last: point };
            }
            None => {
                let additive = modifiers.shift || modifiers.command();
                let base = if additive {
                    state.selected_ids().to_vec()
                } else {
                    state.clear_selection();
                    Vec::new()
                };
                self.context = Some(InteractionContext {
                    start_position: point,
                    selected_images: base.clone(),
                    selection_rect: Some(Rect::from_points(point, point)),
                    ..InteractionContext::default()
                });
                self.state = InteractionState::Selecting { additive, base };
            }
        }
    }

    /// Handles are only live when exactly one image is selected.
    fn try_begin_handle(&mut self, canvas: &Canvas, point: Point) -> bool {
        let Some(image) = canvas.state().single_selection() else {
            return false;
        };
        let Some(handle) = hit_test_handles(
            image,
            point,
            self.config.handle_radius,
            self.config.rotate_handle_offset,
        ) else {
            return false;
        };

        let id = image.id().clone();
        let mut initial_transforms = BTreeMap::new();
        initial_transforms.insert(id.clone(), image.transform());
        self.state = match handle {
            HandleKind::Rotate => {
                let angle = pointer_angle(image.center(), point);
                InteractionState::Rotating {
                    last_angle: angle,
                    total: 0.0,
                    applied: 0.0,
                }
            }
            _ => InteractionState::Resizing { handle },
        };
        log::debug!("Handle {:?} grabbed on {}", handle, id);
        self.context = Some(InteractionContext {
            start_position: point,
            target_image: Some(id.clone()),
            selected_images: vec![id],
            handle: Some(handle),
            initial_transforms,
            selection_rect: None,
        });
        true
    }

    pub fn pointer_move(&mut self, canvas: &mut Canvas, device: Point, modifiers: Modifiers) {
        let point = self.viewport.device_to_logical(device);
        self.last_pointer = Some(point);
        let Some(context) = self.context.as_mut() else {
            return;
        };

        match &mut self.state {
            InteractionState::Idle => {}
            InteractionState::Drawing => self.stroke.extend(point),
            InteractionState::Dragging { last } => {
                let delta = point - *last;
                *last = point;
                if delta == Vec2::ZERO {
                    return;
                }
                let state = canvas.state_mut();
                for id in &context.selected_images {
                    if let Some(current) = state.image(id).map(|img| img.transform()) {
                        let _ = state.set_transform(id, translate(delta) * current);
                    }
                }
            }
            InteractionState::Resizing { handle } => {
                let Some(id) = context.target_image.as_ref() else {
                    return;
                };
                let Some(initial) = context.initial_transforms.get(id).copied() else {
                    return;
                };
                let state = canvas.state_mut();
                let Some(size) = state.image(id).map(|img| img.bitmap().size()) else {
                    return;
                };
                let next = resize_transform(
                    initial,
                    size,
                    *handle,
                    point - context.start_position,
                    modifiers.shift,
                    self.config.min_image_extent,
                );
                if let Err(e) = state.set_transform(id, next) {
                    log::debug!("Resize step rejected: {}", e);
                }
            }
            InteractionState::Rotating {
                last_angle,
                total,
                applied,
                ..
            } => {
                let Some(id) = context.target_image.as_ref() else {
                    return;
                };
                let state = canvas.state_mut();
                let Some((center, current)) =
                    state.image(id).map(|img| (img.center(), img.transform()))
                else {
                    return;
                };
                let angle = pointer_angle(center, point);
                *total += normalize_angle(angle - *last_angle);
                *last_angle = angle;
                let target = if modifiers.shift {
                    (*total / FRAC_PI_4).round() * FRAC_PI_4
                } else {
                    *total
                };
                let step = target - *applied;
                if step != 0.0 {
                    let _ = state.set_transform(id, rotate_about(step, center) * current);
                    *applied = target;
                }
            }
            InteractionState::Selecting { base, .. } => {
                let rect = Rect::from_points(context.start_position, point);
                context.selection_rect = Some(rect);
                let state = canvas.state_mut();
                let mut ids = base.clone();
                ids.extend(state.images_in_rect(rect));
                state.set_selection(ids);
            }
        }
    }

    /// End the gesture. Transform gestures are committed as one command.
    pub fn pointer_up(&mut self, canvas: &mut Canvas, device: Point) -> Result<(), CanvasError> {
        let point = self.viewport.device_to_logical(device);
        self.last_pointer = Some(point);
        self.finish_gesture(canvas, point)
    }

    fn finish_gesture(&mut self, canvas: &mut Canvas, point: Point) -> Result<(), CanvasError> {
        let state = std::mem::take(&mut self.state);
        let context = self.context.take();

        if state == InteractionState::Drawing {
            self.stroke.extend(point);
            if let Some(stroke) = self.stroke.finish() {
                log::debug!("Committed {} stroke {}", stroke.kind.name(), stroke.id);
                canvas.state_mut().add_stroke(stroke);
            }
            return Ok(());
        }

        let (Some(kind), Some(context)) = (state.transform_kind(), context) else {
            return Ok(());
        };
        let after: BTreeMap<ImageId, Affine> = context
            .initial_transforms
            .keys()
            .filter_map(|id| {
                canvas
                    .state()
                    .image(id)
                    .map(|img| (id.clone(), img.transform()))
            })
            .collect();
        let command = Command::transform(kind, context.initial_transforms, after);
        if command.is_noop() {
            return Ok(());
        }
        canvas.execute(command)
    }

    fn abort_gesture(&mut self, canvas: &mut Canvas) {
        let state = std::mem::take(&mut self.state);
        if let Some(context) = self.context.take() {
            if state.transform_kind().is_some() {
                let canvas_state = canvas.state_mut();
                for (id, transform) in context.initial_transforms {
                    let _ = canvas_state.set_transform(&id, transform);
                }
            }
            if let InteractionState::Selecting { base, .. } = state {
                canvas.state_mut().set_selection(base);
            }
        }
        self.stroke.cancel();
    }

    /// Escape: abort the gesture without recording anything, then deselect.
    pub fn cancel(&mut self, canvas: &mut Canvas) {
        self.abort_gesture(canvas);
        canvas.state_mut().clear_selection();
    }

    /// The pointer left the canvas; paste falls back to the fixed offset.
    pub fn pointer_leave(&mut self) {
        self.last_pointer = None;
    }

    /// Handle a key press. Returns whether the key did something.
    ///
    /// Keys only act while the canvas has focus, and only Escape is honored mid-gesture.
    pub fn key_down(
        &mut self,
        canvas: &mut Canvas,
        key: Key,
        modifiers: Modifiers,
        focused: bool,
    ) -> bool {
        if !focused {
            return false;
        }
        let Some(action) = ShortcutRegistry::resolve(key, modifiers) else {
            return false;
        };
        if !self.state.is_idle() && action != ShortcutAction::Deselect {
            return false;
        }

        match action {
            ShortcutAction::SelectAll => {
                canvas.state_mut().select_all();
                true
            }
            ShortcutAction::Copy => canvas.state_mut().copy_selection() > 0,
            ShortcutAction::Cut => {
                if canvas.state_mut().copy_selection() == 0 {
                    return false;
                }
                self.delete_selection(canvas)
            }
            ShortcutAction::Paste => self.paste(canvas),
            ShortcutAction::Deselect => {
                self.cancel(canvas);
                true
            }
            ShortcutAction::Undo => match self.tool {
                Tool::Draw(_) => canvas
                    .state_mut()
                    .undo_last_stroke(&self.user_id)
                    .is_some(),
                Tool::Select => canvas.undo(),
            },
            ShortcutAction::Redo => canvas.redo(),
            ShortcutAction::DeleteSelection => self.delete_selection(canvas),
            ShortcutAction::Nudge { direction, large } => {
                let step = if large {
                    self.config.nudge_large
                } else {
                    self.config.nudge_small
                };
                self.nudge_selection(canvas, direction * step)
            }
        }
    }

    fn commit(canvas: &mut Canvas, command: Result<Command, CanvasError>) -> bool {
        match command.and_then(|c| canvas.execute(c)) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Nothing committed: {}", e);
                false
            }
        }
    }

    pub fn delete_selection(&mut self, canvas: &mut Canvas) -> bool {
        let ids = canvas.state().selected_ids().to_vec();
        if ids.is_empty() {
            return false;
        }
        let command = Command::remove_images(canvas.state(), &ids);
        Self::commit(canvas, command)
    }

    /// Move the selection by `delta` as its own undoable command.
    pub fn nudge_selection(&mut self, canvas: &mut Canvas, delta: Vec2) -> bool {
        let ids = canvas.state().selected_ids().to_vec();
        if ids.is_empty() {
            return false;
        }
        let command = Command::apply_delta(
            canvas.state(),
            TransformKind::Nudge,
            ids.into_iter().map(|id| (id, translate(delta))),
        );
        Self::commit(canvas, command)
    }

    /// Paste the clipboard under fresh ids.
    ///
    /// The group lands with its top-left at the pointer, or shifted by the paste
    /// offset when the pointer is not over the canvas. The clipboard is replaced
    /// by the pasted copies so repeated pastes cascade.
    pub fn paste(&mut self, canvas: &mut Canvas) -> bool {
        let clipboard = canvas.state().clipboard().to_vec();
        let Some(bounds) = clipboard
            .iter()
            .map(|img| img.bounds())
            .reduce(|a, b| a.union(b))
        else {
            return false;
        };
        let delta = match self.last_pointer {
            Some(pointer) => pointer - bounds.origin(),
            None => Vec2::new(self.config.paste_offset, self.config.paste_offset),
        };
        let mut pasted = Vec::with_capacity(clipboard.len());
        for image in &clipboard {
            let copy = image.duplicate(uuid::Uuid::new_v4().to_string());
            match copy.with_transform(translate(delta) * image.transform()) {
                Ok(copy) => pasted.push(copy),
                Err(e) => log::debug!("Skipping paste of {}: {}", image.id(), e),
            }
        }
        let ids: Vec<ImageId> = pasted.iter().map(|img| img.id().clone()).collect();
        if !Self::commit(canvas, Ok(Command::add_images(pasted.clone()))) {
            return false;
        }
        let state = canvas.state_mut();
        state.set_clipboard(pasted);
        state.set_selection(ids);
        true
    }

    pub fn align_selection(&mut self, canvas: &mut Canvas, alignment: Alignment) -> bool {
        let ids = canvas.state().selected_ids().to_vec();
        let command = align::align(canvas.state(), &ids, alignment);
        Self::commit(canvas, command)
    }

    pub fn distribute_selection(&mut self, canvas: &mut Canvas, distribution: Distribution) -> bool {
        let ids = canvas.state().selected_ids().to_vec();
        let command = align::distribute(canvas.state(), &ids, distribution);
        Self::commit(canvas, command)
    }

    pub fn flip_selection(&mut self, canvas: &mut Canvas, horizontal: bool) -> bool {
        let ids = canvas.state().selected_ids().to_vec();
        let command = align::flip(canvas.state(), &ids, horizontal);
        Self::commit(canvas, command)
    }
}
