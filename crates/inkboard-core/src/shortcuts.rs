//! Keyboard shortcut registry.

use kurbo::Vec2;

use crate::input::{Key, Modifiers};

/// What a shortcut does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShortcutAction {
    SelectAll,
    Copy,
    Cut,
    Paste,
    Deselect,
    Undo,
    Redo,
    DeleteSelection,
    /// Unit direction; the caller picks the small or large step.
    Nudge { direction: Vec2, large: bool },
}

/// A keyboard shortcut definition.
#[derive(Debug, Clone)]
pub struct Shortcut {
    pub key: Key,
    pub command: bool,
    pub shift: bool,
    pub action: ShortcutAction,
    pub description: &'static str,
}

impl Shortcut {
    pub const fn new(
        key: Key,
        command: bool,
        shift: bool,
        action: ShortcutAction,
        description: &'static str,
    ) -> Self {
        Self {
            key,
            command,
            shift,
            action,
            description,
        }
    }

    /// Format the shortcut for display (e.g., "Ctrl+Shift+Z").
    pub fn format(&self) -> String {
        let mut parts = Vec::new();
        if self.command {
            parts.push("Ctrl".to_string());
        }
        if self.shift {
            parts.push("Shift".to_string());
        }
        parts.push(self.key.name());
        parts.join("+")
    }

    fn matches(&self, key: Key, modifiers: Modifiers) -> bool {
        let key_matches = match (self.key, key) {
            (Key::Char(a), Key::Char(b)) => a.eq_ignore_ascii_case(&b),
            (a, b) => a == b,
        };
        key_matches && self.command == modifiers.command() && self.shift == modifiers.shift
    }
}

/// Registry of all keyboard shortcuts.
pub struct ShortcutRegistry;

impl ShortcutRegistry {
    pub fn all() -> Vec<Shortcut> {
        use ShortcutAction::*;
        let up = Vec2::new(0.0, -1.0);
        let down = Vec2::new(0.0, 1.0);
        let left = Vec2::new(-1.0, 0.0);
        let right = Vec2::new(1.0, 0.0);
        vec![
            Shortcut::new(Key::Char('a'), true, false, SelectAll, "Select all images"),
            Shortcut::new(Key::Char('c'), true, false, Copy, "Copy selection"),
            Shortcut::new(Key::Char('x'), true, false, Cut, "Cut selection"),
            Shortcut::new(Key::Char('v'), true, false, Paste, "Paste"),
            Shortcut::new(Key::Char('z'), true, false, Undo, "Undo"),
            Shortcut::new(Key::Char('z'), true, true, Redo, "Redo"),
            Shortcut::new(Key::Char('y'), true, false, Redo, "Redo"),
            Shortcut::new(Key::Escape, false, false, Deselect, "Deselect and cancel"),
            Shortcut::new(Key::Delete, false, false, DeleteSelection, "Delete selection"),
            Shortcut::new(Key::Backspace, false, false, DeleteSelection, "Delete selection"),
            Shortcut::new(Key::ArrowUp, false, false, Nudge { direction: up, large: false }, "Nudge up"),
            Shortcut::new(Key::ArrowDown, false, false, Nudge { direction: down, large: false }, "Nudge down"),
            Shortcut::new(Key::ArrowLeft, false, false, Nudge { direction: left, large: false }, "Nudge left"),
            Shortcut::new(Key::ArrowRight, false, false, Nudge { direction: right, large: false }, "Nudge right"),
            Shortcut::new(Key::ArrowUp, false, true, Nudge { direction: up, large: true }, "Nudge up by 10"),
            Shortcut::new(Key::ArrowDown, false, true, Nudge { direction: down, large: true }, "Nudge down by 10"),
            Shortcut::new(Key::ArrowLeft, false, true, Nudge { direction: left, large: true }, "Nudge left by 10"),
            Shortcut::new(Key::ArrowRight, false, true, Nudge { direction: right, large: true }, "Nudge right by 10"),
        ]
    }

    /// Find the action bound to a key press.
    pub fn resolve(key: Key, modifiers: Modifiers) -> Option<ShortcutAction> {
        Self::all()
            .into_iter()
            .find(|s| s.matches(key, modifiers))
            .map(|s| s.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(
            ShortcutRegistry::resolve(Key::Char('Z'), Modifiers::CTRL),
            Some(ShortcutAction::Undo)
        );
        let ctrl_shift = Modifiers {
            shift: true,
            ..Modifiers::CTRL
        };
        assert_eq!(
            ShortcutRegistry::resolve(Key::Char('z'), ctrl_shift),
            Some(ShortcutAction::Redo)
        );
        let cmd = Modifiers {
            meta: true,
            ..Modifiers::NONE
        };
        assert_eq!(
            ShortcutRegistry::resolve(Key::Char('a'), cmd),
            Some(ShortcutAction::SelectAll)
        );
        assert_eq!(ShortcutRegistry::resolve(Key::Char('a'), Modifiers::NONE), None);
    }

    #[test]
    fn test_nudge_magnitude() {
        assert_eq!(
            ShortcutRegistry::resolve(Key::ArrowLeft, Modifiers::SHIFT),
            Some(ShortcutAction::Nudge {
                direction: Vec2::new(-1.0, 0.0),
                large: true
            })
        );
    }

    #[test]
    fn test_format() {
        let redo = ShortcutRegistry::all()
            .into_iter()
            .find(|s| s.action == ShortcutAction::Redo && s.shift)
            .unwrap();
        assert_eq!(redo.format(), "Ctrl+Shift+Z");
    }
}
