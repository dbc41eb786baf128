//! Input-side encoder for the keyboard-enhancement CSI family.
//!
//! When a hosted application has pushed a nonzero enhancement level, key
//! events with modifiers are written to it as `ESC [ cp ; mods u` instead
//! of the legacy control bytes, so the application can distinguish e.g.
//! ctrl+i from tab. The encoder is a pure function; the caller decides
//! what to do with the bytes.

/// Modifier keys held during a key event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub shift: bool,
    pub alt: bool,
    pub ctrl: bool,
    pub meta: bool,
}

impl Modifiers {
    /// No modifiers held.
    pub const NONE: Modifiers = Modifiers {
        shift: false,
        alt: false,
        ctrl: false,
        meta: false,
    };

    /// True if any modifier is held.
    pub fn any(&self) -> bool {
        self.shift || self.alt || self.ctrl || self.meta
    }

    /// Wire encoding: 1 plus the sum of per-modifier weights
    /// (shift=1, alt=2, ctrl=4, meta=8).
    pub fn encoded(&self) -> u32 {
        let mut code = 1;
        if self.shift {
            code += 1;
        }
        if self.alt {
            code += 2;
        }
        if self.ctrl {
            code += 4;
        }
        if self.meta {
            code += 8;
        }
        code
    }
}

/// A physical key, reduced to what the wire format needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// A printable character.
    Char(char),
    Return,
    Tab,
    Backspace,
    Escape,
}

impl Key {
    /// The code point written on the wire. Control keys use fixed values
    /// rather than their raw scan codes.
    pub fn code_point(&self) -> u32 {
        match self {
            Key::Char(c) => *c as u32,
            Key::Return => 13,
            Key::Tab => 9,
            Key::Backspace => 127,
            Key::Escape => 27,
        }
    }
}

/// A key press with its modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn new(key: Key, modifiers: Modifiers) -> Self {
        Self { key, modifiers }
    }
}

/// Encode a key event for the current enhancement level.
///
/// Returns `None` when the event should take the caller's default path:
/// enhancement inactive (level 0), no modifiers held, or a host shortcut
/// the hosted application must never see encoded (meta+C / meta+V
/// copy/paste, with or without shift).
pub fn encode_key(event: KeyEvent, level: u32) -> Option<Vec<u8>> {
    if level == 0 || !event.modifiers.any() {
        return None;
    }
    if is_host_shortcut(event) {
        return None;
    }

    Some(
        format!(
            "\x1b[{};{}u",
            event.key.code_point(),
            event.modifiers.encoded()
        )
        .into_bytes(),
    )
}

/// Copy/paste stays with the host terminal even under enhancement.
fn is_host_shortcut(event: KeyEvent) -> bool {
    let m = event.modifiers;
    if !m.meta || m.ctrl || m.alt {
        return false;
    }
    matches!(event.key, Key::Char(c) if matches!(c.to_ascii_lowercase(), 'c' | 'v'))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ctrl() -> Modifiers {
        Modifiers {
            ctrl: true,
            ..Modifiers::NONE
        }
    }

    fn meta() -> Modifiers {
        Modifiers {
            meta: true,
            ..Modifiers::NONE
        }
    }

    #[test]
    fn ctrl_a_encodes() {
        let event = KeyEvent::new(Key::Char('a'), ctrl());
        assert_eq!(encode_key(event, 1), Some(b"\x1b[97;5u".to_vec()));
    }

    #[test]
    fn no_modifiers_never_encodes() {
        let event = KeyEvent::new(Key::Char('a'), Modifiers::NONE);
        assert_eq!(encode_key(event, 0), None);
        assert_eq!(encode_key(event, 1), None);
        assert_eq!(encode_key(event, 15), None);
    }

    #[test]
    fn level_zero_never_encodes() {
        let event = KeyEvent::new(Key::Char('a'), ctrl());
        assert_eq!(encode_key(event, 0), None);
    }

    #[test]
    fn modifier_weights_sum() {
        let all = Modifiers {
            shift: true,
            alt: true,
            ctrl: true,
            meta: true,
        };
        assert_eq!(all.encoded(), 16);

        let event = KeyEvent::new(Key::Char('a'), all);
        assert_eq!(encode_key(event, 1), Some(b"\x1b[97;16u".to_vec()));
    }

    #[test]
    fn control_keys_use_fixed_code_points() {
        assert_eq!(Key::Return.code_point(), 13);
        assert_eq!(Key::Tab.code_point(), 9);
        assert_eq!(Key::Backspace.code_point(), 127);
        assert_eq!(Key::Escape.code_point(), 27);

        let event = KeyEvent::new(Key::Return, ctrl());
        assert_eq!(encode_key(event, 1), Some(b"\x1b[13;5u".to_vec()));

        let shift = Modifiers {
            shift: true,
            ..Modifiers::NONE
        };
        let event = KeyEvent::new(Key::Tab, shift);
        assert_eq!(encode_key(event, 1), Some(b"\x1b[9;2u".to_vec()));
    }

    #[test]
    fn copy_paste_stays_with_host() {
        assert_eq!(encode_key(KeyEvent::new(Key::Char('c'), meta()), 1), None);
        assert_eq!(encode_key(KeyEvent::new(Key::Char('v'), meta()), 1), None);

        // Shifted paste variants too
        let meta_shift = Modifiers {
            meta: true,
            shift: true,
            ..Modifiers::NONE
        };
        assert_eq!(
            encode_key(KeyEvent::new(Key::Char('V'), meta_shift), 1),
            None
        );

        // But meta with other keys, and ctrl+c, do encode
        assert_eq!(
            encode_key(KeyEvent::new(Key::Char('x'), meta()), 1),
            Some(b"\x1b[120;9u".to_vec())
        );
        assert_eq!(
            encode_key(KeyEvent::new(Key::Char('c'), ctrl()), 1),
            Some(b"\x1b[99;5u".to_vec())
        );
    }

    #[test]
    fn unicode_code_points() {
        let event = KeyEvent::new(Key::Char('é'), ctrl());
        assert_eq!(encode_key(event, 1), Some(b"\x1b[233;5u".to_vec()));
    }
}
