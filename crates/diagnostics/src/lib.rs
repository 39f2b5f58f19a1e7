//! Logging for the qbench workspace
//!
//! Thin layer over `emit` so every crate logs the same way.
//!
//! Usage:
//! - Set QBENCH_LOG=off (default) - no logs
//! - Set QBENCH_LOG=info - benchmark lifecycle, macros, retries
//! - Set QBENCH_LOG=debug - per-execution detail, rendered SQL

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable consulted by [`init_diagnostics`].
pub const LOG_ENV: &str = "QBENCH_LOG";

static INIT: Once = Once::new();

/// Parse a `QBENCH_LOG` value. `None` means logging is disabled.
///
/// Unknown values fall back to `Info` and are reported as `Err` so the
/// caller can say so once the pipeline is running.
pub fn parse_level(value: &str) -> Result<Option<emit::Level>, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "off" => Ok(None),
        "debug" => Ok(Some(emit::Level::Debug)),
        "info" => Ok(Some(emit::Level::Info)),
        "warn" => Ok(Some(emit::Level::Warn)),
        "error" => Ok(Some(emit::Level::Error)),
        other => Err(other.to_string()),
    }
}

/// Initialize diagnostics based on the QBENCH_LOG environment variable.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let setting = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());

        let (level, unknown) = match parse_level(&setting) {
            Ok(None) => return,
            Ok(Some(level)) => (level, None),
            Err(unknown) => (emit::Level::Info, Some(unknown)),
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        if let Some(value) = unknown {
            emit::warn!("Unknown {env} value {value}, using info", env: LOG_ENV, value);
        }

        // The runtime lives for the whole process.
        std::mem::forget(rt);
    });
}

/// Log detailed diagnostics (per-execution timings, rendered SQL, etc.)
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log lifecycle operations users want to see in normal runs.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log recoverable problems (retries, degraded measurements, skipped macros)
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures that change a benchmark outcome.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

pub use init_diagnostics as init;
