// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Logging for the httpcachefs workspace
//!
//! Every crate logs through the macros exported here, which forward to
//! `emit`. Nothing is printed until [`init`] (or [`init_with_debug`]) runs.
//!
//! Usage:
//! - Set HTTPCACHEFS_LOG=off (default) - no logs
//! - Set HTTPCACHEFS_LOG=info - fetches, cache hits/misses, fallbacks
//! - Set HTTPCACHEFS_LOG=debug - per-range and per-entry detail

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable consulted by [`init`]
pub const LOG_ENV: &str = "HTTPCACHEFS_LOG";

static INIT: Once = Once::new();

/// Minimum level accepted by the emitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Parse a level name; unknown names yield `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "off" | "" => Some(LogLevel::Off),
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" | "trace" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    fn as_emit(self) -> Option<emit::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(emit::Level::Error),
            LogLevel::Warn => Some(emit::Level::Warn),
            LogLevel::Info => Some(emit::Level::Info),
            LogLevel::Debug => Some(emit::Level::Debug),
        }
    }
}

/// Level requested through the environment, `off` when unset.
#[must_use]
pub fn level_from_env() -> LogLevel {
    match std::env::var(LOG_ENV) {
        Ok(value) => LogLevel::parse(&value).unwrap_or(LogLevel::Info),
        Err(_) => LogLevel::Off,
    }
}

/// Initialize logging from HTTPCACHEFS_LOG.
///
/// Safe to call multiple times; only the first call installs an emitter.
pub fn init_diagnostics() {
    init_with_level(level_from_env());
}

/// Initialize logging, forcing debug output when `debug` is set
/// (the reader's `debug` configuration toggle).
pub fn init_with_debug(debug: bool) {
    if debug {
        init_with_level(LogLevel::Debug);
    } else {
        init_diagnostics();
    }
}

/// Initialize logging at an explicit level.
pub fn init_with_level(level: LogLevel) {
    INIT.call_once(|| {
        let Some(min) = level.as_emit() else {
            return;
        };
        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(min))
            .init();

        // The emitter lives for the rest of the process.
        std::mem::forget(rt);
    });
}

/// Log detailed diagnostics (ranges fetched, cache keys, pruning decisions)
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log basic operations (probes, footer loads, query cache hits)
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log recoverable conditions (retries, range fallback, corrupt cache entries)
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures surfaced to the caller
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

/// Re-export the init function for convenience
pub use init_diagnostics as init;
