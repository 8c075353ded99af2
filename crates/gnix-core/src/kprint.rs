//! Leveled, subsystem-tagged logging for the provider
//!
//! # Environment Variables
//!
//! - `GNIX_LOG_LEVEL=<level>` - off/error/warn/info/debug/trace or 0-5 (default: warn)
//! - `GNIX_FLUSH_EPRINT=1` - flush stderr after every line
//!
//! # Usage
//!
//! ```ignore
//! use gnix_core::kprint::Subsys;
//!
//! gnix_warn!(Subsys::Eq, "unsupported wait object {:?}", obj);
//! gnix_debug!(Subsys::Vc, "vc {} -> {}", id, state);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::env::{env_get_bool, env_get_str};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

/// Provider subsystem a log line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsys {
    Fabric,
    Eq,
    Ep,
    Vc,
    Nic,
    Freelist,
    Job,
}

impl Subsys {
    pub fn tag(&self) -> &'static str {
        match self {
            Subsys::Fabric => "fabric",
            Subsys::Eq => "eq",
            Subsys::Ep => "ep",
            Subsys::Vc => "vc",
            Subsys::Nic => "nic",
            Subsys::Freelist => "freelist",
            Subsys::Job => "job",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Read `GNIX_LOG_LEVEL` / `GNIX_FLUSH_EPRINT` once.
///
/// Runs lazily on the first log call; calling it explicitly makes the
/// point of initialization deterministic.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    FLUSH_ENABLED.store(env_get_bool("GNIX_FLUSH_EPRINT", false), Ordering::Relaxed);
    if let Some(level) = LogLevel::parse(&env_get_str("GNIX_LOG_LEVEL", "warn")) {
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Override the level; wins over the environment.
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, subsys: Subsys, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} [{}] ", level.prefix(), subsys.tag());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

// ============================================================================
// Public Macros
// ============================================================================

#[macro_export]
macro_rules! gnix_error {
    ($subsys:expr, $($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error, $subsys, format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! gnix_warn {
    ($subsys:expr, $($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn, $subsys, format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! gnix_info {
    ($subsys:expr, $($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info, $subsys, format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! gnix_debug {
    ($subsys:expr, $($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug, $subsys, format_args!($($arg)*)
        );
    }};
}

/// Most verbose; per-operation tracing on hot paths
#[macro_export]
macro_rules! gnix_trace {
    ($subsys:expr, $($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Trace, $subsys, format_args!($($arg)*)
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("5"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(42), LogLevel::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
        gnix_error!(Subsys::Eq, "error {}", 1);
        gnix_warn!(Subsys::Vc, "warn");
        gnix_info!(Subsys::Nic, "info");
        gnix_debug!(Subsys::Freelist, "debug {:?}", Some(3));
        gnix_trace!(Subsys::Job, "trace");
    }
}
