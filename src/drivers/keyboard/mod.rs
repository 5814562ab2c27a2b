pub mod scancodes;

use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use scancodes::{KeyCode, KeyboardState};
use spin::{Mutex, Once};
use x86_64::instructions::port::Port;

const BUFFER_SIZE: usize = 256;

/// Lock-free single-producer/single-consumer byte queue between the
/// keyboard ISR and whoever drains decoded input.
pub struct KeyboardBuffer {
    buffer: [u8; BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl KeyboardBuffer {
    pub const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, byte: u8) -> Result<(), ()> {
        let head = self.head.load(Ordering::Acquire);
        let next_head = (head + 1) % BUFFER_SIZE;
        if next_head == self.tail.load(Ordering::Acquire) {
            return Err(()); // buffer full, drop the keystroke
        }
        // The atomic head/tail indices keep producer and consumer on
        // disjoint slots, so this raw write cannot race the reader.
        unsafe {
            let slot = self.buffer.as_ptr().add(head) as *mut u8;
            *slot = byte;
        }
        self.head.store(next_head, Ordering::Release);
        Ok(())
    }

    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Acquire);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let byte = unsafe {
            let slot = self.buffer.as_ptr().add(tail) as *const u8;
            *slot
        };
        self.tail.store((tail + 1) % BUFFER_SIZE, Ordering::Release);
        Some(byte)
    }
}

lazy_static! {
    pub static ref KEYBOARD_BUFFER: KeyboardBuffer = KeyboardBuffer::new();
    pub static ref KEYBOARD_STATE: Mutex<KeyboardState> = Mutex::new(KeyboardState::new());
}

static KEY_HANDLER: Once<fn()> = Once::new();

/// Register the function invoked after every decoded keystroke.
pub fn register_key_callback(handler: fn()) {
    KEY_HANDLER.call_once(|| handler);
}

pub fn init() {
    // Drain the 8042 controller's stale byte, if any.
    let mut port: Port<u8> = Port::new(0x60);
    let _ = unsafe { port.read() };
    crate::log_info!("PS/2 keyboard driver initialized.");
}

/// Decode a raw scancode and queue the resulting byte.
pub fn push_scancode(scancode: u8) {
    let keycode = KEYBOARD_STATE.lock().process_scancode(scancode);
    let byte = match keycode {
        KeyCode::Char(c) => c,
        KeyCode::Enter => b'\n',
        KeyCode::Backspace => 0x08,
        KeyCode::Unknown => return,
    };
    let _ = KEYBOARD_BUFFER.push(byte);
}

/// Next decoded byte, if any.
pub fn pop_ascii() -> Option<u8> {
    KEYBOARD_BUFFER.pop()
}

/// Keyboard ISR body, entered through the context-switch protocol.
pub extern "C" fn keyboard_interrupt(_is_userspace: bool) {
    let mut port: Port<u8> = Port::new(0x60);
    let scancode = unsafe { port.read() };
    unsafe {
        crate::interrupts::idt::PICS
            .lock()
            .notify_end_of_interrupt(crate::interrupts::idt::InterruptIndex::Keyboard.as_u8());
    }

    push_scancode(scancode);
    if let Some(handler) = KEY_HANDLER.get() {
        handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let queue = KeyboardBuffer::new();
        queue.push(b'x').unwrap();
        queue.push(b'y').unwrap();
        assert_eq!(queue.pop(), Some(b'x'));
        assert_eq!(queue.pop(), Some(b'y'));
        assert_eq!(queue.pop(), None);
    }
}
