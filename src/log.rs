//! Ambient diagnostic logging.
//!
//! A kernel's `print!`/`println!` usually wraps a global, lock-protected
//! writer that sends bytes straight to a UART, installed once at boot.
//! Neither a UART nor any single target device make sense for a crate with
//! no platform to bind to, so the sink here is a plain `fn(&str)` callback,
//! installed once through [`crate::sync::OnceLock`] and consulted through a
//! `log!`/`logln!` macro pair.
//!
//! Until [`init`] is called, `log!`/`logln!` are silent no-ops — the two
//! subsystems in this crate only ever log diagnostics, never rely on a sink
//! being present for correctness.

use core::fmt::{self, Write};

use crate::spinlock::SpinLock;
use crate::sync::OnceLock;

static SINK: OnceLock<SpinLock<fn(&str)>> = OnceLock::new();

/// Installs the function called with each formatted line.
///
/// # Panics
/// Panics if called a second time.
pub fn init(writer: fn(&str)) {
    SINK.initialize(|| Ok::<_, core::convert::Infallible>(SpinLock::new(writer, "log")))
        .expect("log::init called twice");
}

struct Adapter(fn(&str));

impl fmt::Write for Adapter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _log(args: fmt::Arguments<'_>) {
    let Some(sink) = SINK.get() else { return };
    let mut adapter = Adapter(*sink.lock());
    let _ = adapter.write_fmt(args);
}

#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::log::_log(format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! logln {
    () => {
        $crate::log!("\n");
    };
    ($($arg:tt)*) => {{
        $crate::log::_log(format_args!($($arg)*));
        $crate::log::_log(format_args!("\n"));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static CAPTURED: Mutex<std::string::String> = Mutex::new(std::string::String::new());

    fn capture(s: &str) {
        CAPTURED.lock().unwrap().push_str(s);
    }

    #[test]
    fn logln_reaches_installed_sink() {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| init(capture));

        CAPTURED.lock().unwrap().clear();
        logln!("page {} free", 3);
        assert_eq!(*CAPTURED.lock().unwrap(), "page 3 free\n");
    }
}
