/// Decoded key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCode {
    Char(u8),
    Enter,
    Backspace,
    Unknown,
}

/// Set-1 scancode decoder with shift tracking.
pub struct KeyboardState {
    shift: bool,
}

const PLAIN: [u8; 58] = [
    0, 0, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0, b'\t', b'q',
    b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', 0, 0, b'a', b's', b'd', b'f',
    b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v', b'b', b'n',
    b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

const SHIFTED: [u8; 58] = [
    0, 0, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 0, b'\t', b'Q',
    b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', 0, 0, b'A', b'S', b'D', b'F',
    b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V', b'B', b'N',
    b'M', b'<', b'>', b'?', 0, b'*', 0, b' ',
];

const LSHIFT: u8 = 0x2A;
const RSHIFT: u8 = 0x36;
const ENTER: u8 = 0x1C;
const BACKSPACE: u8 = 0x0E;
const RELEASE_BIT: u8 = 0x80;

impl KeyboardState {
    pub fn new() -> Self {
        KeyboardState { shift: false }
    }

    pub fn process_scancode(&mut self, scancode: u8) -> KeyCode {
        let released = scancode & RELEASE_BIT != 0;
        let code = scancode & !RELEASE_BIT;

        if code == LSHIFT || code == RSHIFT {
            self.shift = !released;
            return KeyCode::Unknown;
        }
        if released {
            return KeyCode::Unknown;
        }
        match code {
            ENTER => KeyCode::Enter,
            BACKSPACE => KeyCode::Backspace,
            _ => {
                let table = if self.shift { &SHIFTED } else { &PLAIN };
                match table.get(code as usize) {
                    Some(&c) if c != 0 => KeyCode::Char(c),
                    _ => KeyCode::Unknown,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_letters_and_shift() {
        let mut state = KeyboardState::new();
        assert_eq!(state.process_scancode(0x1E), KeyCode::Char(b'a'));
        assert_eq!(state.process_scancode(LSHIFT), KeyCode::Unknown);
        assert_eq!(state.process_scancode(0x1E), KeyCode::Char(b'A'));
        assert_eq!(state.process_scancode(LSHIFT | RELEASE_BIT), KeyCode::Unknown);
        assert_eq!(state.process_scancode(0x1E), KeyCode::Char(b'a'));
        assert_eq!(state.process_scancode(ENTER), KeyCode::Enter);
        assert_eq!(state.process_scancode(0x1E | RELEASE_BIT), KeyCode::Unknown);
    }
}
