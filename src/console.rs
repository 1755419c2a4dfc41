//! Console I/O over the firmware's byte interface.
//!
//! Output is one byte at a time; `\n` is preceded by `\r` for dumb
//! terminal readers. Input is non-blocking at this layer; callers that
//! want to block yield between polls.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sbi;
use crate::spinlock::Spinlock;

pub struct Printer;

static PRINTER: Spinlock<Printer> = Spinlock::new("console", Printer);

/// Once panicked, printing bypasses the lock: the panic path must never
/// wedge on a lock the dying context already holds.
static PANICKED: AtomicBool = AtomicBool::new(false);

pub fn set_panicked() {
    PANICKED.store(true, Ordering::Release);
}

fn put_byte(byte: u8) {
    if byte == b'\n' {
        sbi::console_putchar(b'\r');
    }
    sbi::console_putchar(byte);
}

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            put_byte(byte);
        }
        Ok(())
    }
}

pub fn write_bytes(bytes: &[u8]) {
    if PANICKED.load(Ordering::Acquire) {
        for &b in bytes {
            put_byte(b);
        }
        return;
    }
    let _guard = PRINTER.lock();
    for &b in bytes {
        put_byte(b);
    }
}

/// One byte of pending console input, if any.
pub fn read_byte() -> Option<u8> {
    let c = sbi::console_getchar();
    if c < 0 {
        None
    } else {
        Some(c as u8)
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    if PANICKED.load(Ordering::Acquire) {
        let _ = Printer.write_fmt(args);
        return;
    }
    let _ = PRINTER.lock().write_fmt(args);
}

/// print! prints to the firmware console.
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

/// println! prints to the firmware console with a trailing newline.
macro_rules! println {
    () => (print!("\n"));
    ($($arg:tt)*) => (print!("{}\n", format_args!($($arg)*)));
}
