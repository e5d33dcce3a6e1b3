//! Logging for the network domain.
//!
//! Each line is checked against one global level and then handed, together
//! with its level, to a single registered sink. The domain owns no console:
//! until the hosting runtime installs a sink (usually one forwarding to its
//! log stream capability) every line is dropped.
//!
//! ```ignore
//! netsys_lib::klog_register_backend(forward_to_log_stream);
//! netsys_lib::klog_debug!("tcp: rst port={}", port);
//! ```
//!
//! The sink writes the text and the line break; format strings carry
//! neither.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KlogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl KlogLevel {
    /// Levels above `Trace` clamp to `Trace`.
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Error,
            1 => Self::Warn,
            2 => Self::Info,
            3 => Self::Debug,
            _ => Self::Trace,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for KlogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives one enabled line and its level.
pub type KlogBackend = fn(KlogLevel, fmt::Arguments<'_>);

static LEVEL: AtomicU8 = AtomicU8::new(KlogLevel::Info as u8);

/// The sink as a type-erased fn pointer; null drops everything.
static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn klog_register_backend(backend: KlogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

pub fn klog_clear_backend() {
    BACKEND.store(core::ptr::null_mut(), Ordering::Release);
}

/// Back to the default level, `Info`.
pub fn klog_init() {
    klog_set_level(KlogLevel::Info);
}

pub fn klog_set_level(level: KlogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn klog_get_level() -> KlogLevel {
    KlogLevel::from_raw(LEVEL.load(Ordering::Relaxed))
}

#[inline]
pub fn klog_is_enabled(level: KlogLevel) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn log_args(level: KlogLevel, args: fmt::Arguments<'_>) {
    if !klog_is_enabled(level) {
        return;
    }
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: only `klog_register_backend` stores into BACKEND, and it stores
    // a `KlogBackend`, which is pointer sized.
    let backend = unsafe { core::mem::transmute::<*mut (), KlogBackend>(ptr) };
    backend(level, args);
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::klog::log_args($level, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::KlogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::KlogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::KlogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::KlogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::KlogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;
    use std::string::{String, ToString};

    use super::*;
    use crate::SpinMutex;

    static LINES: SpinMutex<Vec<(KlogLevel, String)>> = SpinMutex::new(Vec::new());

    fn capture(level: KlogLevel, args: fmt::Arguments<'_>) {
        LINES.lock().push((level, args.to_string()));
    }

    // Level and sink are global, so one test walks through all of it.
    #[test]
    fn test_levels_filter_what_reaches_the_sink() {
        klog_info!("dropped: no sink");
        klog_register_backend(capture);

        klog_set_level(KlogLevel::Debug);
        assert_eq!(klog_get_level(), KlogLevel::Debug);
        klog_debug!("tcp: rst port={}", 80);
        klog_trace!("filtered");
        klog_error!("pbuf: pool empty");

        klog_init();
        assert_eq!(klog_get_level(), KlogLevel::Info);
        klog_debug!("filtered");
        klog_clear_backend();
        klog_error!("dropped: sink cleared");

        let lines = core::mem::take(&mut *LINES.lock());
        assert_eq!(
            lines,
            [
                (KlogLevel::Debug, "tcp: rst port=80".to_string()),
                (KlogLevel::Error, "pbuf: pool empty".to_string()),
            ]
        );
        assert_eq!(KlogLevel::from_raw(9), KlogLevel::Trace);
        assert_eq!(KlogLevel::Warn.to_string(), "warn");
    }
}
